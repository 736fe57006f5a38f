//! Resume strategies backed by the batch runner

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{BatchRunner, BatchSummary, BulkProgress, DecayProgress, MassReductionProgress};
use crate::db::schemas::OperationRecord;
use crate::recovery::{OperationHandle, ResumeStrategies};
use crate::types::{BailiffError, Result};

fn progress<P: DeserializeOwned>(record: &OperationRecord) -> Result<P> {
    serde_json::from_value(record.data.clone()).map_err(|e| {
        BailiffError::InvalidInput(format!(
            "Unreadable progress for {} ({}): {}",
            record.operation_type, record.recovery_id, e
        ))
    })
}

fn summary_value(summary: BatchSummary) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(summary)?)
}

#[async_trait]
impl ResumeStrategies for BatchRunner {
    /// Continue with members not yet tagged by this run
    async fn resume_mass_reduction(
        &self,
        handle: &OperationHandle,
        record: &OperationRecord,
    ) -> Result<serde_json::Value> {
        let progress: MassReductionProgress = progress(record)?;
        summary_value(self.run_mass_reduction(handle, progress).await?)
    }

    /// Re-run the scan with the original cutoff; decayed members are skipped
    async fn resume_scheduled_decay(
        &self,
        handle: &OperationHandle,
        record: &OperationRecord,
    ) -> Result<serde_json::Value> {
        let progress: DecayProgress = progress(record)?;
        summary_value(self.run_decay(handle, progress).await?)
    }

    async fn resume_role_resync(
        &self,
        handle: &OperationHandle,
        _record: &OperationRecord,
    ) -> Result<serde_json::Value> {
        summary_value(self.run_role_resync(handle).await?)
    }

    /// Skip members already listed in `processed_users`
    async fn resume_bulk_ledger(
        &self,
        handle: &OperationHandle,
        record: &OperationRecord,
    ) -> Result<serde_json::Value> {
        let progress: BulkProgress = progress(record)?;
        summary_value(self.run_bulk_ledger(handle, progress).await?)
    }
}
