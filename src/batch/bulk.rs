//! Bulk ledger operations
//!
//! Applies a list of per-member deltas as one recoverable operation. The
//! progress payload carries the full entry list, so a resumed run needs
//! nothing but the stored record.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use tracing::info;

use super::{BatchRunner, BatchSummary};
use crate::db::schemas::{OperationKind, OperationMetadata};
use crate::recovery::OperationHandle;
use crate::store::{ApplyCondition, LedgerMutation, StrikeKey};
use crate::types::{BailiffError, Result};

/// One member's delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEntry {
    pub actor_id: String,
    pub delta: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl BulkEntry {
    pub fn new(actor_id: impl Into<String>, delta: f64) -> Self {
        Self {
            actor_id: actor_id.into(),
            delta,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Progress payload persisted with the recovery point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkProgress {
    pub reason: String,
    pub moderator_id: String,
    pub entries: Vec<BulkEntry>,
    #[serde(default)]
    pub processed_users: Vec<String>,
}

impl BatchRunner {
    pub async fn bulk_ledger(
        &self,
        community_id: &str,
        entries: Vec<BulkEntry>,
        reason: &str,
        moderator_id: &str,
    ) -> Result<BatchSummary> {
        if let Some(bad) = entries.iter().find(|e| !e.delta.is_finite() || e.actor_id.is_empty()) {
            return Err(BailiffError::InvalidInput(format!(
                "Invalid bulk entry for '{}' ({})",
                bad.actor_id, bad.delta
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = entries.iter().find(|e| !seen.insert(e.actor_id.as_str())) {
            return Err(BailiffError::InvalidInput(format!(
                "Member '{}' appears more than once in the bulk entries",
                dup.actor_id
            )));
        }

        let progress = BulkProgress {
            reason: reason.to_string(),
            moderator_id: moderator_id.to_string(),
            entries,
            processed_users: Vec::new(),
        };
        let handle = self
            .recovery
            .create_recovery_point(
                community_id,
                OperationKind::BulkLedger,
                serde_json::to_value(&progress)?,
                OperationMetadata::new(
                    moderator_id,
                    json!({ "reason": reason, "entries": progress.entries.len() }),
                ),
            )
            .await?;

        let summary = self.run_bulk_ledger(&handle, progress).await?;
        self.finish(&handle, summary).await
    }

    /// Apply every entry whose member is not yet in `processed_users`
    pub(crate) async fn run_bulk_ledger(
        &self,
        handle: &OperationHandle,
        mut progress: BulkProgress,
    ) -> Result<BatchSummary> {
        let community_id = handle.community_id.as_str();
        let mut summary = BatchSummary::new(handle, OperationKind::BulkLedger);
        let done: HashSet<String> = progress.processed_users.iter().cloned().collect();

        let pending: Vec<BulkEntry> = progress
            .entries
            .iter()
            .filter(|e| !done.contains(&e.actor_id))
            .cloned()
            .collect();
        summary.skipped += progress.entries.len() - pending.len();

        for entry in pending {
            if entry.delta == 0.0 {
                summary.skipped += 1;
            } else {
                let key = StrikeKey::new(&entry.actor_id, community_id);
                let mut mutation = LedgerMutation::new(entry.delta, &progress.reason, &progress.moderator_id)
                    .with_condition(ApplyCondition::Untagged(handle.recovery_id.clone()));
                if let Some(metadata) = entry.metadata {
                    mutation = mutation.with_metadata(metadata);
                }

                match self.ledger.apply(&key, mutation).await? {
                    Some(applied) => {
                        summary.processed += 1;
                        self.sync_roles(community_id, &entry.actor_id, applied.total, &mut summary)
                            .await;
                    }
                    // Already applied by the interrupted run
                    None => summary.skipped += 1,
                }
            }

            progress.processed_users.push(entry.actor_id);
            self.checkpoint(handle, progress.processed_users.len(), &progress)
                .await?;
        }

        info!(
            community_id,
            recovery_id = %handle.recovery_id,
            processed = summary.processed,
            skipped = summary.skipped,
            "Bulk ledger operation finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::fixture;
    use crate::store::LedgerStore;

    #[tokio::test]
    async fn test_bulk_applies_each_entry() {
        let fx = fixture();
        let entries = vec![
            BulkEntry::new("a", 1.0).with_metadata(json!({ "attacksUsed": 0 })),
            BulkEntry::new("b", 2.5),
            BulkEntry::new("c", 0.0),
        ];

        let summary = fx.runner.bulk_ledger("g1", entries, "War penalty", "mod").await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 1);

        let a = fx.store.record(&StrikeKey::new("a", "g1")).await.unwrap().unwrap();
        assert_eq!(a.history[0].metadata, Some(json!({ "attacksUsed": 0 })));
        assert_eq!(a.history[0].operation_id.as_deref(), Some(summary.recovery_id.as_str()));
        assert_eq!(fx.chat.labels_of("g1", "b"), vec!["Strike Warning".to_string()]);
    }

    #[tokio::test]
    async fn test_bulk_rejects_non_finite_delta() {
        let fx = fixture();
        let result = fx
            .runner
            .bulk_ledger("g1", vec![BulkEntry::new("a", f64::NAN)], "x", "mod")
            .await;
        assert!(matches!(result, Err(BailiffError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_bulk_rejects_repeated_member_before_starting() {
        let fx = fixture();
        let entries = vec![
            BulkEntry::new("a", 1.0),
            BulkEntry::new("b", 1.0),
            BulkEntry::new("a", 0.5),
        ];

        let result = fx.runner.bulk_ledger("g1", entries, "x", "mod").await;
        assert!(matches!(result, Err(BailiffError::InvalidInput(ref m)) if m.contains("'a'")));

        let status = fx
            .runner
            .recovery()
            .get_operation_status("g1", OperationKind::BulkLedger)
            .await
            .unwrap();
        assert!(matches!(status, crate::recovery::OperationStatusView::Unknown));
        assert!(fx.store.record(&StrikeKey::new("b", "g1")).await.unwrap().is_none());
    }
}
