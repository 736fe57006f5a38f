//! Scheduled strike decay
//!
//! A member whose last violation and last decay are both older than the
//! decay window loses `decay_amount` strikes. The eligibility check and the
//! decay stamp happen in the same atomic ledger step, so running decay twice
//! inside one window changes nothing the second time.

use bson::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{BatchRunner, BatchSummary};
use crate::db::schemas::{OperationKind, OperationMetadata, SYSTEM_MODERATOR};
use crate::recovery::{OperationHandle, OperationStatusView};
use crate::store::{ApplyCondition, LedgerMutation, RecordFilter, StrikeKey};
use crate::types::{BailiffError, Result};

const DECAY_REASON: &str = "Scheduled decay";

/// Progress payload persisted with the recovery point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayProgress {
    /// Eligibility cutoff in epoch milliseconds, fixed for the whole run
    pub cutoff_ms: i64,
    pub amount: f64,
    #[serde(default)]
    pub processed: usize,
}

impl BatchRunner {
    pub async fn scheduled_decay(&self, community_id: &str, initiated_by: &str) -> Result<BatchSummary> {
        let now = DateTime::now();
        let progress = DecayProgress {
            cutoff_ms: now.timestamp_millis() - self.config.decay_window.num_milliseconds(),
            amount: self.config.decay_amount,
            processed: 0,
        };

        let handle = self
            .recovery
            .create_recovery_point(
                community_id,
                OperationKind::ScheduledDecay,
                serde_json::to_value(&progress)?,
                OperationMetadata::new(
                    initiated_by,
                    json!({
                        "windowDays": self.config.decay_window.num_days(),
                        "amount": self.config.decay_amount,
                    }),
                ),
            )
            .await?;

        let summary = self.run_decay(&handle, progress).await?;
        self.finish(&handle, summary).await
    }

    pub(crate) async fn run_decay(
        &self,
        handle: &OperationHandle,
        mut progress: DecayProgress,
    ) -> Result<BatchSummary> {
        let community_id = handle.community_id.as_str();
        let cutoff = DateTime::from_millis(progress.cutoff_ms);
        let mut summary = BatchSummary::new(handle, OperationKind::ScheduledDecay);

        let candidates = self
            .ledger
            .store()
            .records(community_id, RecordFilter::with_strikes())
            .await?;
        debug!(community_id, candidates = candidates.len(), "Running scheduled decay");

        for (seen, record) in candidates.into_iter().enumerate() {
            let key = StrikeKey::new(&record.actor_id, community_id);
            let mutation = LedgerMutation::new(-progress.amount, DECAY_REASON, SYSTEM_MODERATOR)
                .with_condition(ApplyCondition::DecayDue { cutoff });

            match self.ledger.apply(&key, mutation).await? {
                Some(applied) => {
                    summary.processed += 1;
                    progress.processed += 1;
                    self.sync_roles(community_id, &record.actor_id, applied.total, &mut summary)
                        .await;
                }
                None => summary.skipped += 1,
            }
            self.checkpoint(handle, seen + 1, &progress).await?;
        }

        if summary.processed > 0 {
            info!(community_id, decayed = summary.processed, "Scheduled decay applied");
        }
        Ok(summary)
    }

    /// Run decay for every community that is not already decaying
    pub async fn decay_all(&self) -> Result<usize> {
        let mut started = 0;
        for community_id in self.ledger.store().communities().await? {
            let status = self
                .recovery
                .get_operation_status(&community_id, OperationKind::ScheduledDecay)
                .await?;
            if matches!(status, OperationStatusView::Active(_)) {
                debug!(community_id = %community_id, "Decay already running, skipping");
                continue;
            }

            match self.scheduled_decay(&community_id, SYSTEM_MODERATOR).await {
                Ok(_) => started += 1,
                Err(BailiffError::OperationActive { .. }) => {
                    debug!(community_id = %community_id, "Decay started elsewhere, skipping");
                }
                Err(e) => error!(community_id = %community_id, error = %e, "Scheduled decay failed"),
            }
        }
        Ok(started)
    }
}

/// Spawn the decay scheduler. The first run happens one interval after startup.
pub fn spawn_decay_scheduler(runner: Arc<BatchRunner>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            match runner.decay_all().await {
                Ok(started) => debug!(started, "Decay scheduler tick"),
                Err(e) => error!(error = %e, "Decay scheduler failed"),
            }
        }
    })
}
