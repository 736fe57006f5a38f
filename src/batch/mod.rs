//! Long-running batch operations
//!
//! Every batch run follows the same shape: create a recovery point,
//! process records while heartbeating every `heartbeat_every` records, then
//! mark the operation complete. A run that fails part way leaves its
//! recovery point in progress, so the recovery pass picks it up once the
//! heartbeat goes stale.
//!
//! Ledger mutations issued by mass reduction and bulk runs are tagged with
//! the run's recovery id, which makes a resumed run skip members the
//! interrupted run already reached.

pub mod bulk;
pub mod decay;
pub mod mass_reduction;
pub mod penalties;
pub mod resume;
pub mod resync;

pub use bulk::{BulkEntry, BulkProgress};
pub use decay::{spawn_decay_scheduler, DecayProgress};
pub use mass_reduction::MassReductionProgress;

use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::db::schemas::OperationKind;
use crate::gamestats::GameStatsClient;
use crate::ledger::StrikeLedger;
use crate::recovery::{OperationHandle, RecoveryManager};
use crate::roles::RoleSynchronizer;
use crate::types::{BailiffError, Result};

/// Batch processing configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Heartbeat after this many processed records
    pub heartbeat_every: usize,

    /// Window without violations (and without decay) before a decay step
    pub decay_window: chrono::Duration,

    /// Strikes removed per decay step
    pub decay_amount: f64,

    /// Strikes per missed war attack
    pub missed_attack_penalty: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            heartbeat_every: 10,
            decay_window: chrono::Duration::days(30),
            decay_amount: 1.0,
            missed_attack_penalty: 0.5,
        }
    }
}

/// Result summary stored with a completed batch operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub operation: OperationKind,
    pub recovery_id: String,
    /// Records whose ledger entry or tier was changed by this run
    pub processed: usize,
    /// Records the run looked at but left unchanged
    pub skipped: usize,
    pub role_failures: usize,
}

impl BatchSummary {
    fn new(handle: &OperationHandle, operation: OperationKind) -> Self {
        Self {
            operation,
            recovery_id: handle.recovery_id.clone(),
            processed: 0,
            skipped: 0,
            role_failures: 0,
        }
    }
}

/// Runs batch operations against the ledger and role labels
#[derive(Clone)]
pub struct BatchRunner {
    ledger: StrikeLedger,
    roles: RoleSynchronizer,
    recovery: Arc<RecoveryManager>,
    config: BatchConfig,
    game: Option<Arc<dyn GameStatsClient>>,
}

impl BatchRunner {
    pub fn new(
        ledger: StrikeLedger,
        roles: RoleSynchronizer,
        recovery: Arc<RecoveryManager>,
        config: BatchConfig,
    ) -> Self {
        Self {
            ledger,
            roles,
            recovery,
            config,
            game: None,
        }
    }

    pub fn with_game_stats(mut self, client: Arc<dyn GameStatsClient>) -> Self {
        self.game = Some(client);
        self
    }

    pub fn ledger(&self) -> &StrikeLedger {
        &self.ledger
    }

    pub fn roles(&self) -> &RoleSynchronizer {
        &self.roles
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Re-apply a member's tier; failures are counted, never raised
    async fn sync_roles(&self, community_id: &str, actor_id: &str, total: f64, summary: &mut BatchSummary) {
        match self.roles.sync(community_id, actor_id, total).await {
            Ok(sync) => summary.role_failures += sync.failures.len(),
            Err(e) => {
                warn!(community_id, actor_id, error = %e, "Role sync failed during batch");
                summary.role_failures += 1;
            }
        }
    }

    /// Heartbeat with progress after every `heartbeat_every` records
    async fn checkpoint<P: Serialize>(&self, handle: &OperationHandle, seen: usize, progress: &P) -> Result<()> {
        if seen == 0 || seen % self.config.heartbeat_every.max(1) != 0 {
            return Ok(());
        }

        let progress = serde_json::to_value(progress)?;
        if !self.recovery.update_heartbeat(handle, Some(progress)).await? {
            return Err(BailiffError::Internal(format!(
                "Operation {} is no longer active",
                handle.recovery_id
            )));
        }
        Ok(())
    }

    async fn finish(&self, handle: &OperationHandle, summary: BatchSummary) -> Result<BatchSummary> {
        self.recovery
            .mark_operation_complete(handle, serde_json::to_value(&summary)?)
            .await?;
        Ok(summary)
    }
}
