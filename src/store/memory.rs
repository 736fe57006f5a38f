//! In-memory store
//!
//! Used in dev mode when MongoDB is unreachable and as the injected store in
//! tests. Each operation runs entirely under one write guard with no await
//! point inside, which gives the same per-key atomicity as the Mongo
//! pipeline updates.

use async_trait::async_trait;
use bson::DateTime;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{
    AppliedDelta, ApplyCondition, LedgerMutation, LedgerStore, OperationStore, RecordFilter,
    round_strikes, StrikeKey, APPLIED_OPERATIONS_LIMIT,
};
use crate::db::schemas::{
    CompletedOperation, OperationRecord, RecoveryDoc, StrikeDoc, StrikeEvent, Warning,
};
use crate::types::{BailiffError, Result};

#[derive(Default)]
struct MemoryState {
    records: HashMap<StrikeKey, StrikeDoc>,
    operations: HashMap<String, RecoveryDoc>,
}

/// Process-local implementation of both store traits
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    /// When set, ledger calls fail as if storage were unreachable
    ledger_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a ledger outage
    pub fn set_ledger_unavailable(&self, unavailable: bool) {
        self.ledger_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Shift an active run's heartbeat (or start time) into the past
    pub async fn backdate_operation(
        &self,
        community_id: &str,
        operation_type: &str,
        by: chrono::Duration,
    ) -> bool {
        let mut state = self.state.write().await;
        let Some(record) = state
            .operations
            .get_mut(community_id)
            .and_then(|doc| doc.active.get_mut(operation_type))
        else {
            return false;
        };

        let shift = |t: DateTime| DateTime::from_millis(t.timestamp_millis() - by.num_milliseconds());
        record.start_time = shift(record.start_time);
        record.last_heartbeat = record.last_heartbeat.map(shift);
        true
    }

    fn check_ledger(&self) -> Result<()> {
        if self.ledger_unavailable.load(Ordering::SeqCst) {
            return Err(BailiffError::Database("ledger storage unavailable".to_string()));
        }
        Ok(())
    }
}

fn decay_due(record: &StrikeDoc, cutoff: DateTime) -> bool {
    record.strikes > 0.0
        && record.last_violation_at.map_or(true, |t| t < cutoff)
        && record.last_decay_at.map_or(true, |t| t < cutoff)
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn apply(&self, key: &StrikeKey, mutation: LedgerMutation) -> Result<Option<AppliedDelta>> {
        self.check_ledger()?;
        let mut state = self.state.write().await;

        let existing = state.records.get(key);
        let admitted = match &mutation.condition {
            ApplyCondition::Always => true,
            ApplyCondition::Untagged(op) => !existing.is_some_and(|r| r.has_operation(op)),
            ApplyCondition::DecayDue { cutoff } => existing.is_some_and(|r| decay_due(r, *cutoff)),
        };
        if !admitted {
            return Ok(None);
        }

        let at = mutation.at;
        let record = state.records.entry(key.clone()).or_insert_with(|| StrikeDoc {
            created_at: Some(at),
            ..StrikeDoc::new(&key.actor_id, &key.community_id)
        });

        let previous = record.strikes;
        let total = round_strikes((previous + mutation.delta).max(0.0));

        record.previous_strikes = previous;
        record.strikes = total;
        record.updated_at = Some(at);
        if mutation.delta > 0.0 {
            record.last_violation_at = Some(at);
        }
        if matches!(mutation.condition, ApplyCondition::DecayDue { .. }) {
            record.last_decay_at = Some(at);
        }
        let operation_id = mutation.operation_id().map(str::to_string);
        if let Some(op) = &operation_id {
            record.applied_operations.push(op.clone());
            let excess = record
                .applied_operations
                .len()
                .saturating_sub(APPLIED_OPERATIONS_LIMIT);
            record.applied_operations.drain(..excess);
        }
        record.history.push(StrikeEvent {
            reason: mutation.reason,
            delta: total - previous,
            requested_delta: mutation.delta,
            moderator_id: mutation.moderator_id,
            timestamp: at,
            metadata: mutation.metadata,
            operation_id,
        });

        Ok(Some(AppliedDelta {
            previous,
            total,
            requested: mutation.delta,
        }))
    }

    async fn record(&self, key: &StrikeKey) -> Result<Option<StrikeDoc>> {
        self.check_ledger()?;
        Ok(self.state.read().await.records.get(key).cloned())
    }

    async fn records(&self, community_id: &str, filter: RecordFilter) -> Result<Vec<StrikeDoc>> {
        self.check_ledger()?;
        let state = self.state.read().await;
        let mut records: Vec<StrikeDoc> = state
            .records
            .values()
            .filter(|r| r.community_id == community_id && filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));
        Ok(records)
    }

    async fn communities(&self) -> Result<Vec<String>> {
        self.check_ledger()?;
        let state = self.state.read().await;
        let mut communities: Vec<String> =
            state.records.keys().map(|k| k.community_id.clone()).collect();
        communities.sort();
        communities.dedup();
        Ok(communities)
    }

    async fn push_warning(&self, key: &StrikeKey, warning: Warning) -> Result<()> {
        self.check_ledger()?;
        let mut state = self.state.write().await;
        let at = warning.issued_at;
        let record = state
            .records
            .entry(key.clone())
            .or_insert_with(|| StrikeDoc::new(&key.actor_id, &key.community_id));
        record.warnings.push(warning);
        record.updated_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn insert_active(&self, community_id: &str, record: OperationRecord) -> Result<()> {
        let mut state = self.state.write().await;
        let doc = state
            .operations
            .entry(community_id.to_string())
            .or_insert_with(|| RecoveryDoc {
                community_id: community_id.to_string(),
                ..Default::default()
            });

        if doc.active.contains_key(&record.operation_type) {
            return Err(BailiffError::OperationActive {
                community_id: community_id.to_string(),
                operation: record.operation_type,
            });
        }
        doc.updated_at = Some(DateTime::now());
        doc.active.insert(record.operation_type.clone(), record);
        Ok(())
    }

    async fn heartbeat(
        &self,
        community_id: &str,
        operation_type: &str,
        recovery_id: &str,
        at: DateTime,
        data: Option<serde_json::Value>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(record) = state
            .operations
            .get_mut(community_id)
            .and_then(|doc| doc.active.get_mut(operation_type))
            .filter(|r| r.recovery_id == recovery_id)
        else {
            return Ok(false);
        };

        record.last_heartbeat = Some(at);
        if let Some(data) = data {
            record.data = data;
        }
        Ok(true)
    }

    async fn claim(
        &self,
        community_id: &str,
        operation_type: &str,
        recovery_id: &str,
        observed: Option<DateTime>,
        at: DateTime,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(record) = state
            .operations
            .get_mut(community_id)
            .and_then(|doc| doc.active.get_mut(operation_type))
            .filter(|r| r.recovery_id == recovery_id && r.last_heartbeat == observed)
        else {
            return Ok(false);
        };

        record.last_heartbeat = Some(at);
        record.recovery_attempts += 1;
        Ok(true)
    }

    async fn complete(
        &self,
        community_id: &str,
        entry: CompletedOperation,
        keep: usize,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(doc) = state.operations.get_mut(community_id) else {
            return Ok(false);
        };

        let owns_active = doc
            .active
            .get(&entry.operation_type)
            .is_some_and(|r| r.recovery_id == entry.recovery_id);
        if !owns_active {
            return Ok(false);
        }

        doc.active.remove(&entry.operation_type);
        let history = doc.completed.entry(entry.operation_type.clone()).or_default();
        history.push(entry);
        let keep = keep.max(1);
        if history.len() > keep {
            let excess = history.len() - keep;
            history.drain(..excess);
        }
        doc.updated_at = Some(DateTime::now());
        Ok(true)
    }

    async fn active(&self, community_id: &str, operation_type: &str) -> Result<Option<OperationRecord>> {
        let state = self.state.read().await;
        Ok(state
            .operations
            .get(community_id)
            .and_then(|doc| doc.active.get(operation_type))
            .cloned())
    }

    async fn completed(&self, community_id: &str, operation_type: &str) -> Result<Vec<CompletedOperation>> {
        let state = self.state.read().await;
        Ok(state
            .operations
            .get(community_id)
            .and_then(|doc| doc.completed.get(operation_type))
            .cloned()
            .unwrap_or_default())
    }

    async fn all_active(&self) -> Result<Vec<(String, OperationRecord)>> {
        let state = self.state.read().await;
        Ok(state
            .operations
            .values()
            .flat_map(|doc| {
                doc.active
                    .values()
                    .map(|record| (doc.community_id.clone(), record.clone()))
            })
            .collect())
    }
}
