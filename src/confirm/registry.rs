//! Routing of reaction events to pending prompts
//!
//! Prompts are keyed by the id of the chat message that displays them.
//! Reactions on any other message are not ours and are ignored.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::{ConfirmationFlow, DecisionAck, SelectionFlow};
use crate::chat::Actor;

pub const APPROVE_EMOJI: &str = "✅";
pub const CANCEL_EMOJI: &str = "❌";

/// Keycap digits one through nine, in option order
pub const OPTION_EMOJIS: [&str; 9] = [
    "1\u{fe0f}\u{20e3}",
    "2\u{fe0f}\u{20e3}",
    "3\u{fe0f}\u{20e3}",
    "4\u{fe0f}\u{20e3}",
    "5\u{fe0f}\u{20e3}",
    "6\u{fe0f}\u{20e3}",
    "7\u{fe0f}\u{20e3}",
    "8\u{fe0f}\u{20e3}",
    "9\u{fe0f}\u{20e3}",
];

/// Reaction understood by prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Approve,
    Cancel,
    /// Zero-based option index
    Select(usize),
}

impl Reaction {
    pub fn parse(emoji: &str) -> Option<Self> {
        match emoji {
            APPROVE_EMOJI => Some(Reaction::Approve),
            CANCEL_EMOJI => Some(Reaction::Cancel),
            other => {
                // Some clients drop the variation selector
                let normalized = other.replace('\u{fe0f}', "");
                OPTION_EMOJIS
                    .iter()
                    .position(|e| e.replace('\u{fe0f}', "") == normalized)
                    .map(Reaction::Select)
            }
        }
    }

    /// Emoji for option `index`, if it can be offered
    pub fn option_emoji(index: usize) -> Option<&'static str> {
        OPTION_EMOJIS.get(index).copied()
    }
}

/// A prompt that accepts reactions
pub trait Respond: Send + Sync {
    fn respond(&self, actor: &Actor, reaction: Reaction) -> DecisionAck;
}

impl Respond for ConfirmationFlow {
    fn respond(&self, actor: &Actor, reaction: Reaction) -> DecisionAck {
        match reaction {
            Reaction::Approve => self.approve(actor),
            Reaction::Cancel => self.cancel(actor),
            Reaction::Select(_) => DecisionAck::Invalid,
        }
    }
}

impl<O> Respond for SelectionFlow<O>
where
    O: Clone + Send + Sync,
{
    fn respond(&self, actor: &Actor, reaction: Reaction) -> DecisionAck {
        match reaction {
            Reaction::Select(index) => self.select(actor, index),
            Reaction::Cancel => self.cancel(actor),
            Reaction::Approve => DecisionAck::Invalid,
        }
    }
}

/// Pending prompts by message id
#[derive(Default)]
pub struct PromptRegistry {
    prompts: DashMap<String, Arc<dyn Respond>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_id: impl Into<String>, prompt: Arc<dyn Respond>) {
        self.prompts.insert(message_id.into(), prompt);
    }

    pub fn remove(&self, message_id: &str) -> bool {
        self.prompts.remove(message_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Route a reaction; `None` when the message is not a pending prompt
    pub fn route(&self, message_id: &str, actor: &Actor, emoji: &str) -> Option<DecisionAck> {
        // Clone out of the map so the shard lock is not held while responding
        let prompt = self.prompts.get(message_id).map(|p| Arc::clone(p.value()))?;

        let ack = match Reaction::parse(emoji) {
            Some(reaction) => prompt.respond(actor, reaction),
            None => DecisionAck::Invalid,
        };
        debug!(message_id, actor = %actor.id, ?ack, "Reaction routed");
        Some(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{moderators_only, ProposedMutation};
    use std::time::Duration;

    fn moderator() -> Actor {
        Actor::new("mod-1", "Mod", true)
    }

    #[test]
    fn test_parse_reactions() {
        assert_eq!(Reaction::parse("✅"), Some(Reaction::Approve));
        assert_eq!(Reaction::parse("❌"), Some(Reaction::Cancel));
        assert_eq!(Reaction::parse("1️⃣"), Some(Reaction::Select(0)));
        assert_eq!(Reaction::parse("9\u{20e3}"), Some(Reaction::Select(8)));
        assert_eq!(Reaction::parse("👍"), None);
        assert_eq!(Reaction::option_emoji(9), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_reaches_registered_prompt() {
        let registry = PromptRegistry::new();
        let flow = Arc::new(ConfirmationFlow::new(
            "msg-1",
            ProposedMutation::new("Season reset", "-2 for everyone"),
            moderators_only(),
            Duration::from_secs(120),
        ));
        registry.register("msg-1", flow.clone());

        assert_eq!(registry.route("other", &moderator(), "✅"), None);
        assert_eq!(registry.route("msg-1", &moderator(), "1️⃣"), Some(DecisionAck::Invalid));
        assert_eq!(registry.route("msg-1", &moderator(), "✅"), Some(DecisionAck::Accepted));
        assert_eq!(
            registry.route("msg-1", &moderator(), "❌"),
            Some(DecisionAck::AlreadyResolved)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_selection() {
        let registry = PromptRegistry::new();
        let selection = Arc::new(SelectionFlow::new(
            "msg-2",
            vec![1.0_f64, 2.0],
            moderators_only(),
            Duration::from_secs(300),
        ));
        registry.register("msg-2", selection.clone());

        assert_eq!(registry.route("msg-2", &moderator(), "2️⃣"), Some(DecisionAck::Accepted));
        assert_eq!(selection.outcome().await, crate::confirm::Selection::Chosen(2.0));
    }
}
