//! Persistence and recovery of long-running batch operations
//!
//! ## Lifecycle
//!
//! ```text
//! create_recovery_point -> update_heartbeat (every N records) -> mark_operation_complete
//!
//! process dies mid-run -> heartbeat goes stale
//!                      -> recovery pass claims the record
//!                      -> resume strategy finishes the work
//!                      -> record moves to completed (recovered: true/false)
//! ```
//!
//! At most one operation of each type is active per community. A pass runs
//! at startup and then periodically; passes never overlap within a process,
//! and the claim step keeps two processes from resuming the same record.

pub mod strategy;

pub use strategy::ResumeStrategies;

use bson::DateTime;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::schemas::{CompletedOperation, OperationKind, OperationMetadata, OperationRecord};
use crate::store::OperationStore;
use crate::types::Result;

/// Recovery manager configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Heartbeat age after which an active record is considered abandoned
    pub stale_after: chrono::Duration,

    /// Interval between recovery passes
    pub scan_interval: Duration,

    /// Completed entries kept per operation type
    pub history_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::minutes(10),
            scan_interval: Duration::from_secs(300),
            history_limit: 10,
        }
    }
}

/// Ownership of one run of a batch operation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationHandle {
    pub community_id: String,
    pub operation_type: String,
    pub recovery_id: String,
    pub start_time: DateTime,
    pub metadata: OperationMetadata,
}

impl OperationHandle {
    pub fn from_record(community_id: &str, record: &OperationRecord) -> Self {
        Self {
            community_id: community_id.to_string(),
            operation_type: record.operation_type.clone(),
            recovery_id: record.recovery_id.clone(),
            start_time: record.start_time,
            metadata: record.metadata.clone(),
        }
    }

    pub fn kind(&self) -> Option<OperationKind> {
        OperationKind::parse(&self.operation_type)
    }
}

/// Current state of an operation type in a community
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatusView {
    Active(OperationRecord),
    /// Most recent completed run
    Completed(CompletedOperation),
    Unknown,
}

/// Counters for one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// A pass was already running, nothing was done
    pub skipped: bool,
    pub scanned: usize,
    pub stale: usize,
    pub resumed: usize,
    pub failed: usize,
    pub unrecognized: usize,
    /// Stale records another recoverer claimed first
    pub contended: usize,
}

/// Resets the single-flight flag when a pass ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Recovery manager
pub struct RecoveryManager {
    store: Arc<dyn OperationStore>,
    config: RecoveryConfig,
    recovering: AtomicBool,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn OperationStore>, config: RecoveryConfig) -> Self {
        Self {
            store,
            config,
            recovering: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Persist the start of a batch operation.
    ///
    /// Fails with `OperationActive` if one of this type is already running
    /// for the community.
    pub async fn create_recovery_point(
        &self,
        community_id: &str,
        kind: OperationKind,
        initial_data: serde_json::Value,
        metadata: OperationMetadata,
    ) -> Result<OperationHandle> {
        let now = DateTime::now();
        let record = OperationRecord {
            recovery_id: Uuid::new_v4().to_string(),
            operation_type: kind.as_str().to_string(),
            start_time: now,
            last_heartbeat: Some(now),
            data: initial_data,
            metadata,
            recovery_attempts: 0,
        };

        let handle = OperationHandle::from_record(community_id, &record);
        self.store.insert_active(community_id, record).await?;

        info!(
            community_id,
            operation = %kind,
            recovery_id = %handle.recovery_id,
            initiated_by = %handle.metadata.initiated_by,
            "Recovery point created"
        );
        Ok(handle)
    }

    /// Record liveness and optionally replace the progress payload.
    ///
    /// Returns false if the run is no longer the active one.
    pub async fn update_heartbeat(
        &self,
        handle: &OperationHandle,
        progress: Option<serde_json::Value>,
    ) -> Result<bool> {
        let updated = self
            .store
            .heartbeat(
                &handle.community_id,
                &handle.operation_type,
                &handle.recovery_id,
                DateTime::now(),
                progress,
            )
            .await?;

        if !updated {
            warn!(
                community_id = %handle.community_id,
                operation = %handle.operation_type,
                recovery_id = %handle.recovery_id,
                "Heartbeat for operation that is no longer active"
            );
        }
        Ok(updated)
    }

    /// Move a run to its completed history. Returns false if already completed.
    pub async fn mark_operation_complete(
        &self,
        handle: &OperationHandle,
        result: serde_json::Value,
    ) -> Result<bool> {
        self.complete(handle, result, false).await
    }

    /// Complete a run with a failure annotation
    pub async fn mark_operation_failed(&self, handle: &OperationHandle, error: &str) -> Result<bool> {
        self.complete(handle, json!({ "error": error }), false).await
    }

    async fn complete(
        &self,
        handle: &OperationHandle,
        result: serde_json::Value,
        recovered: bool,
    ) -> Result<bool> {
        let entry = CompletedOperation {
            recovery_id: handle.recovery_id.clone(),
            operation_type: handle.operation_type.clone(),
            start_time: handle.start_time,
            completed_at: DateTime::now(),
            recovered,
            result,
            metadata: handle.metadata.clone(),
        };

        let completed = self
            .store
            .complete(&handle.community_id, entry, self.config.history_limit)
            .await?;

        if completed {
            info!(
                community_id = %handle.community_id,
                operation = %handle.operation_type,
                recovery_id = %handle.recovery_id,
                recovered,
                "Operation completed"
            );
        } else {
            debug!(recovery_id = %handle.recovery_id, "Operation already completed");
        }
        Ok(completed)
    }

    pub async fn get_operation_status(
        &self,
        community_id: &str,
        kind: OperationKind,
    ) -> Result<OperationStatusView> {
        if let Some(record) = self.store.active(community_id, kind.as_str()).await? {
            return Ok(OperationStatusView::Active(record));
        }

        let mut history = self.store.completed(community_id, kind.as_str()).await?;
        Ok(match history.pop() {
            Some(latest) => OperationStatusView::Completed(latest),
            None => OperationStatusView::Unknown,
        })
    }

    /// Completed history for a type, oldest first
    pub async fn completed_operations(
        &self,
        community_id: &str,
        kind: OperationKind,
    ) -> Result<Vec<CompletedOperation>> {
        self.store.completed(community_id, kind.as_str()).await
    }

    fn is_stale(&self, record: &OperationRecord, now: DateTime) -> bool {
        let age_ms = now.timestamp_millis() - record.last_seen().timestamp_millis();
        age_ms > self.config.stale_after.num_milliseconds()
    }

    /// Find abandoned operations and finish them.
    ///
    /// Returns immediately with `skipped` set if a pass is already running.
    pub async fn run_recovery_pass(&self, strategies: &dyn ResumeStrategies) -> Result<RecoveryReport> {
        if self.recovering.swap(true, Ordering::SeqCst) {
            debug!("Recovery pass already running");
            return Ok(RecoveryReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _pass = PassGuard(&self.recovering);

        let mut report = RecoveryReport::default();
        let now = DateTime::now();

        for (community_id, record) in self.store.all_active().await? {
            report.scanned += 1;
            if !self.is_stale(&record, now) {
                continue;
            }
            report.stale += 1;

            let claimed = match self
                .store
                .claim(
                    &community_id,
                    &record.operation_type,
                    &record.recovery_id,
                    record.last_heartbeat,
                    DateTime::now(),
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(community_id = %community_id, recovery_id = %record.recovery_id, error = %e, "Failed to claim stale operation");
                    continue;
                }
            };
            if !claimed {
                report.contended += 1;
                continue;
            }

            let handle = OperationHandle::from_record(&community_id, &record);
            if let Err(e) = self.resume(strategies, &handle, &record, &mut report).await {
                error!(
                    community_id = %community_id,
                    recovery_id = %record.recovery_id,
                    error = %e,
                    "Failed to record recovery result"
                );
            }
        }

        if report.stale > 0 {
            info!(
                scanned = report.scanned,
                stale = report.stale,
                resumed = report.resumed,
                failed = report.failed,
                unrecognized = report.unrecognized,
                "Recovery pass finished"
            );
        }
        Ok(report)
    }

    async fn resume(
        &self,
        strategies: &dyn ResumeStrategies,
        handle: &OperationHandle,
        record: &OperationRecord,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let Some(kind) = record.kind() else {
            warn!(
                community_id = %handle.community_id,
                operation = %record.operation_type,
                "Completing operation of unrecognized type"
            );
            report.unrecognized += 1;
            let note = json!({ "error": "unrecognized operation type", "recoveryAttempted": true });
            self.complete(handle, note, false).await?;
            return Ok(());
        };

        info!(
            community_id = %handle.community_id,
            operation = %kind,
            recovery_id = %handle.recovery_id,
            attempt = record.recovery_attempts + 1,
            "Resuming abandoned operation"
        );

        let outcome = match kind {
            OperationKind::MassReduction => strategies.resume_mass_reduction(handle, record).await,
            OperationKind::ScheduledDecay => strategies.resume_scheduled_decay(handle, record).await,
            OperationKind::RoleResync => strategies.resume_role_resync(handle, record).await,
            OperationKind::BulkLedger => strategies.resume_bulk_ledger(handle, record).await,
        };

        match outcome {
            Ok(result) => {
                report.resumed += 1;
                self.complete(handle, result, true).await?;
            }
            Err(e) => {
                error!(
                    community_id = %handle.community_id,
                    operation = %kind,
                    error = %e,
                    "Resume strategy failed"
                );
                report.failed += 1;
                let note = json!({ "error": e.to_string(), "recoveryAttempted": true });
                self.complete(handle, note, false).await?;
            }
        }
        Ok(())
    }
}

/// Spawn the periodic recovery task. The first pass runs immediately.
pub fn spawn_recovery_task(
    manager: Arc<RecoveryManager>,
    strategies: Arc<dyn ResumeStrategies>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(manager.config().scan_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = manager.run_recovery_pass(strategies.as_ref()).await {
                error!(error = %e, "Recovery pass failed");
            }
        }
    })
}
