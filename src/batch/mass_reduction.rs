//! Season-wide strike reduction

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{BatchRunner, BatchSummary};
use crate::db::schemas::{OperationKind, OperationMetadata};
use crate::recovery::OperationHandle;
use crate::store::{ApplyCondition, LedgerMutation, RecordFilter, StrikeKey};
use crate::types::{BailiffError, Result};

/// Progress payload persisted with the recovery point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MassReductionProgress {
    pub amount: f64,
    pub reason: String,
    pub moderator_id: String,
    #[serde(default)]
    pub processed_users: Vec<String>,
}

impl BatchRunner {
    /// Subtract `amount` from every member with strikes in the community
    pub async fn mass_reduction(
        &self,
        community_id: &str,
        amount: f64,
        reason: &str,
        moderator_id: &str,
    ) -> Result<BatchSummary> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(BailiffError::InvalidInput(format!(
                "Reduction amount must be positive, got {}",
                amount
            )));
        }

        let progress = MassReductionProgress {
            amount,
            reason: reason.to_string(),
            moderator_id: moderator_id.to_string(),
            processed_users: Vec::new(),
        };
        let handle = self
            .recovery
            .create_recovery_point(
                community_id,
                OperationKind::MassReduction,
                serde_json::to_value(&progress)?,
                OperationMetadata::new(moderator_id, json!({ "amount": amount, "reason": reason })),
            )
            .await?;

        let summary = self.run_mass_reduction(&handle, progress).await?;
        self.finish(&handle, summary).await
    }

    /// Process every member not yet reached by this run
    pub(crate) async fn run_mass_reduction(
        &self,
        handle: &OperationHandle,
        mut progress: MassReductionProgress,
    ) -> Result<BatchSummary> {
        let community_id = handle.community_id.as_str();
        let mut summary = BatchSummary::new(handle, OperationKind::MassReduction);

        let pending = self
            .ledger
            .store()
            .records(community_id, RecordFilter::with_strikes().untagged(&handle.recovery_id))
            .await?;
        info!(
            community_id,
            recovery_id = %handle.recovery_id,
            pending = pending.len(),
            amount = progress.amount,
            "Running mass reduction"
        );

        for record in pending {
            let key = StrikeKey::new(&record.actor_id, community_id);
            let mutation = LedgerMutation::new(-progress.amount, &progress.reason, &progress.moderator_id)
                .with_condition(ApplyCondition::Untagged(handle.recovery_id.clone()))
                .with_metadata(json!({ "operation": OperationKind::MassReduction.as_str() }));

            match self.ledger.apply(&key, mutation).await? {
                Some(applied) => {
                    summary.processed += 1;
                    self.sync_roles(community_id, &record.actor_id, applied.total, &mut summary)
                        .await;
                }
                None => summary.skipped += 1,
            }

            progress.processed_users.push(record.actor_id);
            self.checkpoint(handle, progress.processed_users.len(), &progress)
                .await?;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::fixture;
    use crate::store::{LedgerStore, OperationStore};

    #[tokio::test]
    async fn test_reduces_every_member_with_strikes() {
        let fx = fixture();
        let ledger = fx.runner.ledger();
        ledger.apply_delta(&StrikeKey::new("a", "g1"), 3.0, "x", "mod").await.unwrap();
        ledger.apply_delta(&StrikeKey::new("b", "g1"), 0.5, "x", "mod").await.unwrap();
        ledger.apply_delta(&StrikeKey::new("c", "g2"), 3.0, "x", "mod").await.unwrap();

        let summary = fx.runner.mass_reduction("g1", 1.0, "Season reset", "mod").await.unwrap();
        assert_eq!(summary.processed, 2);

        assert_eq!(ledger.read_total(&StrikeKey::new("a", "g1")).await.unwrap(), 2.0);
        assert_eq!(ledger.read_total(&StrikeKey::new("b", "g1")).await.unwrap(), 0.0);
        assert_eq!(ledger.read_total(&StrikeKey::new("c", "g2")).await.unwrap(), 3.0);

        // Tier label follows the reduced total
        assert_eq!(fx.chat.labels_of("g1", "a"), vec!["Strike Warning".to_string()]);

        let history = fx
            .runner
            .recovery()
            .completed_operations("g1", OperationKind::MassReduction)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result["processed"], 2);
    }

    #[tokio::test]
    async fn test_failed_run_stays_recoverable() {
        let fx = fixture();
        fx.runner
            .ledger()
            .apply_delta(&StrikeKey::new("a", "g1"), 3.0, "x", "mod")
            .await
            .unwrap();

        fx.store.set_ledger_unavailable(true);
        assert!(fx.runner.mass_reduction("g1", 1.0, "reset", "mod").await.is_err());
        fx.store.set_ledger_unavailable(false);

        let active = fx.store.all_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1.operation_type, "mass_reduction");
        assert_eq!(fx.store.record(&StrikeKey::new("a", "g1")).await.unwrap().unwrap().strikes, 3.0);
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount() {
        let fx = fixture();
        assert!(fx.runner.mass_reduction("g1", 0.0, "reset", "mod").await.is_err());
        assert!(fx.store.all_active().await.unwrap().is_empty());
    }
}
