//! Resume strategies for abandoned batch operations

use async_trait::async_trait;

use super::OperationHandle;
use crate::db::schemas::OperationRecord;
use crate::types::Result;

/// Per-type logic for finishing an abandoned operation.
///
/// Each method continues the operation described by `record` under the
/// claimed `handle` and returns a result summary. Strategies never mark the
/// operation complete themselves; the recovery pass does that with the
/// returned summary, or with a failure annotation if the strategy errors.
#[async_trait]
pub trait ResumeStrategies: Send + Sync {
    async fn resume_mass_reduction(
        &self,
        handle: &OperationHandle,
        record: &OperationRecord,
    ) -> Result<serde_json::Value>;

    async fn resume_scheduled_decay(
        &self,
        handle: &OperationHandle,
        record: &OperationRecord,
    ) -> Result<serde_json::Value>;

    async fn resume_role_resync(
        &self,
        handle: &OperationHandle,
        record: &OperationRecord,
    ) -> Result<serde_json::Value>;

    async fn resume_bulk_ledger(
        &self,
        handle: &OperationHandle,
        record: &OperationRecord,
    ) -> Result<serde_json::Value>;
}
