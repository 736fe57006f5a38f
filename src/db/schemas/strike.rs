//! Strike record schema
//!
//! One document per (actor, community). The `strikes` aggregate and the
//! `history` log are only ever changed together, in a single atomic update.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for strike records
pub const STRIKE_COLLECTION: &str = "strikes";

/// Moderator identity recorded for automated mutations (decay, recovery)
pub const SYSTEM_MODERATOR: &str = "system";

/// Immutable ledger event
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StrikeEvent {
    pub reason: String,

    /// Delta actually applied (after the zero clamp)
    pub delta: f64,

    /// Delta the caller asked for
    pub requested_delta: f64,

    pub moderator_id: String,

    pub timestamp: DateTime,

    /// Structured context from the source system (e.g. attack counts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Batch operation that produced this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

/// Formal warning, tracked separately from strikes
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Warning {
    pub reason: String,
    pub moderator_id: String,
    pub issued_at: DateTime,
}

/// Strike record stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StrikeDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    pub actor_id: String,

    pub community_id: String,

    /// Current aggregate, never negative
    #[serde(default)]
    pub strikes: f64,

    /// Aggregate before the most recent mutation
    #[serde(default)]
    pub previous_strikes: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_violation_at: Option<DateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decay_at: Option<DateTime>,

    /// Append-only event log
    #[serde(default)]
    pub history: Vec<StrikeEvent>,

    #[serde(default)]
    pub warnings: Vec<Warning>,

    /// Batch operations already applied to this record
    #[serde(default)]
    pub applied_operations: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,
}

impl StrikeDoc {
    /// Create an empty record for a key
    pub fn new(actor_id: impl Into<String>, community_id: impl Into<String>) -> Self {
        let now = DateTime::now();
        Self {
            actor_id: actor_id.into(),
            community_id: community_id.into(),
            created_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        }
    }

    /// Whether a batch operation has already touched this record
    pub fn has_operation(&self, operation_id: &str) -> bool {
        self.applied_operations.iter().any(|op| op == operation_id)
    }

    /// Sum of every applied delta in the history
    pub fn history_total(&self) -> f64 {
        self.history.iter().map(|e| e.delta).sum()
    }
}

impl IntoIndexes for StrikeDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // One record per actor per community
            (
                doc! { "community_id": 1, "actor_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("community_actor_unique".to_string())
                        .build(),
                ),
            ),
            // Batch scans over members with strikes
            (
                doc! { "community_id": 1, "strikes": 1 },
                Some(
                    IndexOptions::builder()
                        .name("community_strikes_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
