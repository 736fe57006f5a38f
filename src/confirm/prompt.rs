//! Timed, first-decision-wins prompt
//!
//! A `Prompt` starts in `Awaiting` and moves exactly once to a terminal
//! state: resolved by an authorized actor, cancelled, or expired at its
//! deadline. All transitions go through `watch::Sender::send_if_modified`,
//! whose closure runs under the channel lock, so concurrent decisions and
//! the deadline race safely and only the first one is applied.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

use crate::chat::Actor;

/// Predicate deciding who may act on a prompt
pub type Authorizer = Arc<dyn Fn(&Actor) -> bool + Send + Sync>;

/// Authorizer admitting only moderators
pub fn moderators_only() -> Authorizer {
    Arc::new(|actor: &Actor| actor.is_moderator)
}

/// Authorizer admitting a single actor
pub fn only(actor_id: impl Into<String>) -> Authorizer {
    let actor_id = actor_id.into();
    Arc::new(move |actor: &Actor| actor.id == actor_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptState<T> {
    Awaiting,
    Resolved(T),
    Cancelled,
    Expired,
}

impl<T> PromptState<T> {
    pub fn is_awaiting(&self) -> bool {
        matches!(self, PromptState::Awaiting)
    }
}

/// Decision offered to a prompt
#[derive(Debug, Clone)]
pub enum Decision<T> {
    Resolve(T),
    Cancel,
}

/// How a prompt treated a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAck {
    Accepted,
    Unauthorized,
    AlreadyResolved,
    /// Decision does not apply to this prompt (e.g. unknown option)
    Invalid,
}

pub struct Prompt<T> {
    id: String,
    state: watch::Sender<PromptState<T>>,
    deadline: Instant,
    authorizer: Authorizer,
}

impl<T> Prompt<T>
where
    T: Clone + Send + Sync,
{
    pub fn new(id: impl Into<String>, authorizer: Authorizer, timeout: Duration) -> Self {
        let (state, _) = watch::channel(PromptState::Awaiting);
        Self {
            id: id.into(),
            state,
            deadline: Instant::now() + timeout,
            authorizer,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> PromptState<T> {
        self.state.borrow().clone()
    }

    /// Offer a decision; only the first valid one changes the state
    pub fn decide(&self, actor: &Actor, decision: Decision<T>) -> DecisionAck {
        if Instant::now() >= self.deadline {
            self.expire();
            return DecisionAck::AlreadyResolved;
        }
        if !self.state.borrow().is_awaiting() {
            return DecisionAck::AlreadyResolved;
        }
        if !(self.authorizer)(actor) {
            return DecisionAck::Unauthorized;
        }

        let next = match decision {
            Decision::Resolve(value) => PromptState::Resolved(value),
            Decision::Cancel => PromptState::Cancelled,
        };
        if self.transition(next) {
            DecisionAck::Accepted
        } else {
            DecisionAck::AlreadyResolved
        }
    }

    /// Wait for a terminal state, expiring the prompt at its deadline
    pub async fn outcome(&self) -> PromptState<T> {
        let mut updates = self.state.subscribe();
        tokio::select! {
            decided = updates.wait_for(|s| !s.is_awaiting()) => {
                // The sender lives in self, so the channel cannot close here
                match decided {
                    Ok(state) => state.clone(),
                    Err(_) => PromptState::Expired,
                }
            }
            _ = sleep_until(self.deadline) => {
                self.expire();
                self.state()
            }
        }
    }

    fn expire(&self) -> bool {
        self.transition(PromptState::Expired)
    }

    fn transition(&self, next: PromptState<T>) -> bool {
        let mut next = Some(next);
        self.state.send_if_modified(|state| {
            if !state.is_awaiting() {
                return false;
            }
            match next.take() {
                Some(value) => {
                    *state = value;
                    true
                }
                None => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq};

    fn moderator(id: &str) -> Actor {
        Actor::new(id, id, true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_decision_wins() {
        let prompt: Prompt<u8> = Prompt::new("p1", moderators_only(), Duration::from_secs(60));

        assert_eq!(prompt.decide(&moderator("a"), Decision::Resolve(1)), DecisionAck::Accepted);
        assert_eq!(
            prompt.decide(&moderator("b"), Decision::Resolve(2)),
            DecisionAck::AlreadyResolved
        );
        assert_eq!(prompt.decide(&moderator("b"), Decision::Cancel), DecisionAck::AlreadyResolved);
        assert_eq!(prompt.outcome().await, PromptState::Resolved(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_actor_is_ignored() {
        let prompt: Prompt<u8> = Prompt::new("p1", moderators_only(), Duration::from_secs(60));
        let member = Actor::new("m", "member", false);

        assert_eq!(prompt.decide(&member, Decision::Resolve(1)), DecisionAck::Unauthorized);
        assert!(prompt.state().is_awaiting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_waits_for_decision() {
        let prompt: Prompt<u8> = Prompt::new("p1", moderators_only(), Duration::from_secs(60));
        let mut waiting = tokio_test::task::spawn(prompt.outcome());
        assert_pending!(waiting.poll());

        prompt.decide(&moderator("a"), Decision::Cancel);
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), PromptState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires_prompt() {
        let prompt: Prompt<u8> = Prompt::new("p1", moderators_only(), Duration::from_secs(120));
        assert_eq!(prompt.outcome().await, PromptState::Expired);

        // Late decisions lose to the expiry
        assert_eq!(
            prompt.decide(&moderator("a"), Decision::Resolve(1)),
            DecisionAck::AlreadyResolved
        );
        assert_eq!(prompt.state(), PromptState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_after_deadline_without_waiter() {
        let prompt: Prompt<u8> = Prompt::new("p1", only("a"), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(
            prompt.decide(&moderator("a"), Decision::Resolve(1)),
            DecisionAck::AlreadyResolved
        );
        assert_eq!(prompt.outcome().await, PromptState::Expired);
    }
}
