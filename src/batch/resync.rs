//! Role resynchronization across a community

use serde_json::json;
use tracing::info;

use super::{BatchRunner, BatchSummary};
use crate::db::schemas::{OperationKind, OperationMetadata};
use crate::recovery::OperationHandle;
use crate::store::RecordFilter;
use crate::types::Result;

impl BatchRunner {
    /// Re-derive and re-apply the tier of every member with a record
    pub async fn role_resync(&self, community_id: &str, initiated_by: &str) -> Result<BatchSummary> {
        let handle = self
            .recovery
            .create_recovery_point(
                community_id,
                OperationKind::RoleResync,
                json!({ "synced": 0 }),
                OperationMetadata::new(initiated_by, json!({})),
            )
            .await?;

        let summary = self.run_role_resync(&handle).await?;
        self.finish(&handle, summary).await
    }

    /// Tier application is idempotent, so a resumed run simply starts over
    pub(crate) async fn run_role_resync(&self, handle: &OperationHandle) -> Result<BatchSummary> {
        let community_id = handle.community_id.as_str();
        let mut summary = BatchSummary::new(handle, OperationKind::RoleResync);

        let records = self
            .ledger
            .store()
            .records(community_id, RecordFilter::all())
            .await?;

        for (seen, record) in records.iter().enumerate() {
            let failures_before = summary.role_failures;
            self.sync_roles(community_id, &record.actor_id, record.strikes, &mut summary)
                .await;
            if summary.role_failures == failures_before {
                summary.processed += 1;
            } else {
                summary.skipped += 1;
            }
            self.checkpoint(handle, seen + 1, &json!({ "synced": seen + 1 }))
                .await?;
        }

        info!(
            community_id,
            synced = summary.processed,
            role_failures = summary.role_failures,
            "Role resync finished"
        );
        Ok(summary)
    }
}
