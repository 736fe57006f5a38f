//! Batch operation recovery schema
//!
//! One document per community. `active` holds at most one in-progress
//! record per operation type; `completed` keeps a short, time-ordered tail
//! of finished runs per type.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::db::mongo::IntoIndexes;

/// Collection name for recovery documents
pub const OPERATION_COLLECTION: &str = "operations";

/// Batch operation types that support recovery
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Season-wide strike reduction
    MassReduction,
    /// Time-based strike decay
    ScheduledDecay,
    /// Re-derive and re-apply tier labels
    RoleResync,
    /// Add/remove strikes across a list of members
    BulkLedger,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::MassReduction,
        OperationKind::ScheduledDecay,
        OperationKind::RoleResync,
        OperationKind::BulkLedger,
    ];

    /// Storage key for this operation type
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::MassReduction => "mass_reduction",
            OperationKind::ScheduledDecay => "scheduled_decay",
            OperationKind::RoleResync => "role_resync",
            OperationKind::BulkLedger => "bulk_ledger",
        }
    }

    /// Parse a storage key; `None` for types this build does not know
    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == key)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who started an operation and with which parameters
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OperationMetadata {
    pub initiated_by: String,

    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl OperationMetadata {
    pub fn new(initiated_by: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            initiated_by: initiated_by.into(),
            parameters,
        }
    }
}

/// In-progress batch operation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OperationRecord {
    /// Opaque token identifying this run
    pub recovery_id: String,

    /// Storage key of the operation type, kept raw so unknown types survive a round trip
    pub operation_type: String,

    pub start_time: DateTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime>,

    /// Progress payload, interpreted only by the operation's resume strategy
    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default)]
    pub metadata: OperationMetadata,

    /// Number of times a recovery pass has claimed this run
    #[serde(default)]
    pub recovery_attempts: u32,
}

impl OperationRecord {
    pub fn kind(&self) -> Option<OperationKind> {
        OperationKind::parse(&self.operation_type)
    }

    /// Last sign of life: heartbeat, or start time before the first heartbeat
    pub fn last_seen(&self) -> DateTime {
        self.last_heartbeat.unwrap_or(self.start_time)
    }
}

/// Finished batch operation kept in the bounded history
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompletedOperation {
    pub recovery_id: String,
    pub operation_type: String,
    pub start_time: DateTime,
    pub completed_at: DateTime,

    /// Whether completion came from a recovery pass
    #[serde(default)]
    pub recovered: bool,

    #[serde(default)]
    pub result: serde_json::Value,

    #[serde(default)]
    pub metadata: OperationMetadata,
}

/// Recovery document stored in MongoDB, one per community
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RecoveryDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    pub community_id: String,

    #[serde(default)]
    pub active: HashMap<String, OperationRecord>,

    #[serde(default)]
    pub completed: HashMap<String, Vec<CompletedOperation>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,
}

impl IntoIndexes for RecoveryDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "community_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("community_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}
