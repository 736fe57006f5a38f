//! Chat platform surface
//!
//! Bailiff never talks to the chat platform directly. Inbound events arrive
//! as JSON on the webhook; outbound messages and role label changes go
//! through a bot bridge behind the [`Messenger`] and [`RoleGateway`] traits.

pub mod http;

pub use http::HttpChatGateway;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::roles::RoleGateway;
use crate::types::{BailiffError, Result};

/// Member acting in an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    /// Holds the moderator permission in the community
    #[serde(default)]
    pub is_moderator: bool,
}

impl Actor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, is_moderator: bool) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_moderator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub event_id: String,
    pub community_id: String,
    pub channel_id: String,
    pub author: Actor,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionEvent {
    pub event_id: String,
    pub community_id: String,
    pub channel_id: String,
    /// Message the reaction was added to
    pub message_id: String,
    pub actor: Actor,
    pub emoji: String,
}

/// Inbound event delivered by the bot bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Message(MessageEvent),
    Reaction(ReactionEvent),
}

impl ChatEvent {
    pub fn event_id(&self) -> &str {
        match self {
            ChatEvent::Message(m) => &m.event_id,
            ChatEvent::Reaction(r) => &r.event_id,
        }
    }

    pub fn community_id(&self) -> &str {
        match self {
            ChatEvent::Message(m) => &m.community_id,
            ChatEvent::Reaction(r) => &r.community_id,
        }
    }
}

/// Outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    /// Reactions the bridge pre-adds so members can click them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<String>,
}

impl Reply {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            title: None,
            body: body.into(),
            reactions: Vec::new(),
        }
    }

    pub fn prompt(title: impl Into<String>, body: impl Into<String>, reactions: Vec<String>) -> Self {
        Self {
            title: Some(title.into()),
            body: body.into(),
            reactions,
        }
    }
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Post a message and return its id
    async fn send(&self, channel_id: &str, reply: &Reply) -> Result<String>;
}

/// Message recorded by [`MemoryChatGateway`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
    pub channel_id: String,
    pub reply: Reply,
}

/// Process-local chat gateway for dev mode and tests
#[derive(Default)]
pub struct MemoryChatGateway {
    labels: DashMap<(String, String), Vec<String>>,
    created: DashSet<(String, String)>,
    failing: DashSet<String>,
    sent: DashMap<u64, SentMessage>,
    next_id: AtomicU64,
}

impl MemoryChatGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels of a member, sorted
    pub fn labels_of(&self, community_id: &str, actor_id: &str) -> Vec<String> {
        let mut labels = self
            .labels
            .get(&(community_id.to_string(), actor_id.to_string()))
            .map(|l| l.clone())
            .unwrap_or_default();
        labels.sort();
        labels
    }

    pub fn set_labels(&self, community_id: &str, actor_id: &str, labels: &[&str]) {
        self.labels.insert(
            (community_id.to_string(), actor_id.to_string()),
            labels.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// Make every change of this label fail
    pub fn fail_label(&self, label: &str) {
        self.failing.insert(label.to_string());
    }

    /// Whether a label was lazily created in a community
    pub fn label_exists(&self, community_id: &str, label: &str) -> bool {
        self.created.contains(&(community_id.to_string(), label.to_string()))
    }

    /// All sent messages, oldest first
    pub fn sent(&self) -> Vec<SentMessage> {
        let mut sent: Vec<(u64, SentMessage)> =
            self.sent.iter().map(|e| (*e.key(), e.value().clone())).collect();
        sent.sort_by_key(|(id, _)| *id);
        sent.into_iter().map(|(_, m)| m).collect()
    }

    pub fn last_sent(&self) -> Option<SentMessage> {
        self.sent().pop()
    }

    fn check(&self, label: &str) -> Result<()> {
        if self.failing.contains(label) {
            return Err(BailiffError::Chat(format!("label '{}' is unavailable", label)));
        }
        Ok(())
    }
}

#[async_trait]
impl Messenger for MemoryChatGateway {
    async fn send(&self, channel_id: &str, reply: &Reply) -> Result<String> {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("msg-{}", seq);
        self.sent.insert(
            seq,
            SentMessage {
                id: id.clone(),
                channel_id: channel_id.to_string(),
                reply: reply.clone(),
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl RoleGateway for MemoryChatGateway {
    async fn member_labels(&self, community_id: &str, actor_id: &str) -> Result<Vec<String>> {
        Ok(self.labels_of(community_id, actor_id))
    }

    async fn ensure_label(&self, community_id: &str, label: &str) -> Result<()> {
        self.check(label)?;
        self.created.insert((community_id.to_string(), label.to_string()));
        Ok(())
    }

    async fn add_label(&self, community_id: &str, actor_id: &str, label: &str) -> Result<()> {
        self.check(label)?;
        let mut labels = self
            .labels
            .entry((community_id.to_string(), actor_id.to_string()))
            .or_default();
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
        Ok(())
    }

    async fn remove_label(&self, community_id: &str, actor_id: &str, label: &str) -> Result<()> {
        self.check(label)?;
        if let Some(mut labels) = self
            .labels
            .get_mut(&(community_id.to_string(), actor_id.to_string()))
        {
            labels.retain(|l| l != label);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_event() {
        let event: ChatEvent = serde_json::from_value(serde_json::json!({
            "type": "message",
            "eventId": "e1",
            "communityId": "g1",
            "channelId": "c1",
            "author": { "id": "u1", "displayName": "Mod", "isModerator": true },
            "content": "!strike <@u2> 1 spam"
        }))
        .unwrap();

        assert_eq!(event.event_id(), "e1");
        match event {
            ChatEvent::Message(m) => assert!(m.author.is_moderator),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_reaction_event_defaults() {
        let event: ChatEvent = serde_json::from_value(serde_json::json!({
            "type": "reaction",
            "eventId": "e2",
            "communityId": "g1",
            "channelId": "c1",
            "messageId": "m1",
            "actor": { "id": "u1" },
            "emoji": "✅"
        }))
        .unwrap();

        match event {
            ChatEvent::Reaction(r) => assert!(!r.actor.is_moderator),
            other => panic!("expected reaction, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memory_gateway_labels() {
        let gateway = MemoryChatGateway::new();
        gateway.ensure_label("g1", "Strike Ban").await.unwrap();
        gateway.add_label("g1", "u1", "Strike Ban").await.unwrap();
        gateway.add_label("g1", "u1", "Strike Ban").await.unwrap();

        assert!(gateway.label_exists("g1", "Strike Ban"));
        assert_eq!(gateway.labels_of("g1", "u1"), vec!["Strike Ban".to_string()]);

        gateway.remove_label("g1", "u1", "Strike Ban").await.unwrap();
        assert!(gateway.labels_of("g1", "u1").is_empty());
    }
}
