//! Storage seam for the strike ledger and recovery points
//!
//! Everything above this module talks to `LedgerStore` / `OperationStore`
//! trait objects. `MongoStore` is the production backend; `MemoryStore`
//! serves dev mode and tests.
//!
//! The contract every backend must honour: `LedgerStore::apply` is a single
//! atomic step per key. Clamping, tagging and history append happen inside
//! that step, never as a separate read followed by a write.

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use async_trait::async_trait;
use bson::DateTime;
use std::fmt;

use crate::db::schemas::{CompletedOperation, OperationRecord, StrikeDoc, Warning};
use crate::types::Result;

/// Ledger key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrikeKey {
    pub actor_id: String,
    pub community_id: String,
}

impl StrikeKey {
    pub fn new(actor_id: impl Into<String>, community_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            community_id: community_id.into(),
        }
    }
}

impl fmt::Display for StrikeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.actor_id, self.community_id)
    }
}

/// Precondition evaluated inside the atomic apply step
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyCondition {
    /// Always apply, creating the record if absent
    Always,
    /// Apply only if the record is not tagged with this operation id; tags it
    Untagged(String),
    /// Apply only to an existing record with strikes whose last violation and
    /// last decay are both absent or older than `cutoff`; stamps the decay time
    DecayDue { cutoff: DateTime },
}

/// One ledger mutation
#[derive(Debug, Clone)]
pub struct LedgerMutation {
    /// Signed delta; negative values are removals clamped at zero
    pub delta: f64,
    pub reason: String,
    pub moderator_id: String,
    pub metadata: Option<serde_json::Value>,
    pub condition: ApplyCondition,
    /// Timestamp recorded on the event and record
    pub at: DateTime,
}

impl LedgerMutation {
    pub fn new(delta: f64, reason: impl Into<String>, moderator_id: impl Into<String>) -> Self {
        Self {
            delta,
            reason: reason.into(),
            moderator_id: moderator_id.into(),
            metadata: None,
            condition: ApplyCondition::Always,
            at: DateTime::now(),
        }
    }

    pub fn with_condition(mut self, condition: ApplyCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn at(mut self, at: DateTime) -> Self {
        self.at = at;
        self
    }

    /// Operation id carried by an `Untagged` condition
    pub fn operation_id(&self) -> Option<&str> {
        match &self.condition {
            ApplyCondition::Untagged(id) => Some(id),
            _ => None,
        }
    }
}

/// Slack for comparing strike totals against thresholds
pub const STRIKE_TOLERANCE: f64 = 1e-9;

/// Most recent run ids kept in a record's `applied_operations`
pub const APPLIED_OPERATIONS_LIMIT: usize = 50;

/// Decimal places kept on stored totals
pub const STRIKE_DECIMALS: i32 = 6;

/// Round a total to the stored precision so decimal increments sum exactly
pub fn round_strikes(total: f64) -> f64 {
    let scale = 10f64.powi(STRIKE_DECIMALS);
    (total * scale).round() / scale
}

/// Result of an applied mutation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedDelta {
    pub previous: f64,
    pub total: f64,
    pub requested: f64,
}

impl AppliedDelta {
    /// Delta actually applied after the zero clamp
    pub fn applied(&self) -> f64 {
        self.total - self.previous
    }

    /// Whether the clamp reduced the requested magnitude
    pub fn was_clamped(&self) -> bool {
        (self.applied() - self.requested).abs() > STRIKE_TOLERANCE
    }
}

/// Filter for community scans
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Only records with a positive aggregate
    pub with_strikes: bool,
    /// Only records not yet tagged with this operation id
    pub untagged: Option<String>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_strikes() -> Self {
        Self {
            with_strikes: true,
            untagged: None,
        }
    }

    pub fn untagged(mut self, operation_id: impl Into<String>) -> Self {
        self.untagged = Some(operation_id.into());
        self
    }

    pub fn matches(&self, record: &StrikeDoc) -> bool {
        if self.with_strikes && record.strikes <= 0.0 {
            return false;
        }
        match &self.untagged {
            Some(op) => !record.has_operation(op),
            None => true,
        }
    }
}

/// Strike ledger storage
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Atomically apply a mutation. `None` means the condition did not match.
    async fn apply(&self, key: &StrikeKey, mutation: LedgerMutation) -> Result<Option<AppliedDelta>>;

    async fn record(&self, key: &StrikeKey) -> Result<Option<StrikeDoc>>;

    async fn records(&self, community_id: &str, filter: RecordFilter) -> Result<Vec<StrikeDoc>>;

    /// Every community with at least one record
    async fn communities(&self) -> Result<Vec<String>>;

    async fn push_warning(&self, key: &StrikeKey, warning: Warning) -> Result<()>;
}

/// Recovery point storage
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert an active record; `OperationActive` if one exists for the type
    async fn insert_active(&self, community_id: &str, record: OperationRecord) -> Result<()>;

    /// Update heartbeat (and progress) of the run identified by `recovery_id`.
    /// Returns false if that run is no longer active.
    async fn heartbeat(
        &self,
        community_id: &str,
        operation_type: &str,
        recovery_id: &str,
        at: DateTime,
        data: Option<serde_json::Value>,
    ) -> Result<bool>;

    /// Compare-and-set claim of a stale run: succeeds only if its heartbeat is
    /// still `observed`. Bumps the heartbeat and the recovery attempt counter.
    async fn claim(
        &self,
        community_id: &str,
        operation_type: &str,
        recovery_id: &str,
        observed: Option<DateTime>,
        at: DateTime,
    ) -> Result<bool>;

    /// Move the run to the completed history (bounded to `keep` entries).
    /// Returns false if the run was already completed.
    async fn complete(
        &self,
        community_id: &str,
        entry: CompletedOperation,
        keep: usize,
    ) -> Result<bool>;

    async fn active(&self, community_id: &str, operation_type: &str) -> Result<Option<OperationRecord>>;

    /// Completed history for a type, oldest first
    async fn completed(&self, community_id: &str, operation_type: &str) -> Result<Vec<CompletedOperation>>;

    /// Every active record across all communities
    async fn all_active(&self) -> Result<Vec<(String, OperationRecord)>>;
}
