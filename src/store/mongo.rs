//! MongoDB store
//!
//! Ledger mutations are a single `findOneAndUpdate` with an aggregation
//! pipeline: the clamp, the history append and the operation tag are all
//! computed server-side from the document's current values in one atomic
//! step. Caller-supplied strings are wrapped in `$literal` so a reason that
//! starts with `$` is never evaluated as a field path.

use async_trait::async_trait;
use bson::{doc, Bson, DateTime, Document};
use mongodb::options::ReturnDocument;
use tracing::debug;

use super::{
    AppliedDelta, ApplyCondition, LedgerMutation, LedgerStore, OperationStore, RecordFilter,
    StrikeKey, APPLIED_OPERATIONS_LIMIT, STRIKE_DECIMALS,
};
use crate::db::schemas::{
    CompletedOperation, OperationRecord, RecoveryDoc, StrikeDoc, Warning, OPERATION_COLLECTION,
    STRIKE_COLLECTION,
};
use crate::db::{is_duplicate_key, MongoClient, MongoCollection};
use crate::types::{BailiffError, Result};

/// MongoDB-backed implementation of both store traits
#[derive(Clone)]
pub struct MongoStore {
    strikes: MongoCollection<StrikeDoc>,
    operations: MongoCollection<RecoveryDoc>,
}

impl MongoStore {
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Ok(Self {
            strikes: mongo.collection::<StrikeDoc>(STRIKE_COLLECTION).await?,
            operations: mongo.collection::<RecoveryDoc>(OPERATION_COLLECTION).await?,
        })
    }
}

fn to_bson<T: serde::Serialize>(value: &T) -> Result<Bson> {
    bson::to_bson(value).map_err(|e| BailiffError::Internal(format!("BSON encoding failed: {}", e)))
}

fn key_filter(key: &StrikeKey) -> Document {
    doc! {
        "community_id": &key.community_id,
        "actor_id": &key.actor_id,
    }
}

/// Filter for the atomic apply step, including its precondition
fn apply_filter(key: &StrikeKey, condition: &ApplyCondition) -> Document {
    let mut filter = key_filter(key);
    match condition {
        ApplyCondition::Always => {}
        ApplyCondition::Untagged(op) => {
            filter.insert("applied_operations", doc! { "$ne": op });
        }
        ApplyCondition::DecayDue { cutoff } => {
            filter.insert("strikes", doc! { "$gt": 0.0 });
            filter.insert(
                "$and",
                vec![
                    doc! { "$or": [ { "last_violation_at": Bson::Null }, { "last_violation_at": { "$lt": *cutoff } } ] },
                    doc! { "$or": [ { "last_decay_at": Bson::Null }, { "last_decay_at": { "$lt": *cutoff } } ] },
                ],
            );
        }
    }
    filter
}

/// Pipeline computing the clamped total, stamps, tag and history entry
fn apply_pipeline(mutation: &LedgerMutation) -> Result<Vec<Document>> {
    let at = mutation.at;
    let delta = mutation.delta;

    let mut totals = doc! {
        "previous_strikes": { "$ifNull": ["$strikes", 0.0] },
        "strikes": { "$round": [
            { "$max": [0.0, { "$add": [{ "$ifNull": ["$strikes", 0.0] }, delta] }] },
            STRIKE_DECIMALS,
        ] },
        "created_at": { "$ifNull": ["$created_at", at] },
        "updated_at": at,
    };
    if delta > 0.0 {
        totals.insert("last_violation_at", at);
    }
    if matches!(mutation.condition, ApplyCondition::DecayDue { .. }) {
        totals.insert("last_decay_at", at);
    }
    if let Some(op) = mutation.operation_id() {
        totals.insert(
            "applied_operations",
            doc! { "$slice": [
                { "$concatArrays": [{ "$ifNull": ["$applied_operations", []] }, [{ "$literal": op }]] },
                -(APPLIED_OPERATIONS_LIMIT as i32),
            ] },
        );
    }

    let mut event = doc! {
        "reason": { "$literal": &mutation.reason },
        "delta": { "$subtract": ["$strikes", "$previous_strikes"] },
        "requested_delta": delta,
        "moderator_id": { "$literal": &mutation.moderator_id },
        "timestamp": at,
    };
    if let Some(metadata) = &mutation.metadata {
        event.insert("metadata", doc! { "$literal": to_bson(metadata)? });
    }
    if let Some(op) = mutation.operation_id() {
        event.insert("operation_id", doc! { "$literal": op });
    }

    Ok(vec![
        doc! { "$set": totals },
        doc! { "$set": {
            "history": { "$concatArrays": [{ "$ifNull": ["$history", []] }, [event]] },
        } },
    ])
}

#[async_trait]
impl LedgerStore for MongoStore {
    async fn apply(&self, key: &StrikeKey, mutation: LedgerMutation) -> Result<Option<AppliedDelta>> {
        let upsert = !matches!(mutation.condition, ApplyCondition::DecayDue { .. });
        let filter = apply_filter(key, &mutation.condition);
        let pipeline = apply_pipeline(&mutation)?;

        let updated = self
            .strikes
            .inner()
            .find_one_and_update(filter, pipeline)
            .upsert(upsert)
            .return_document(ReturnDocument::After)
            .projection(doc! { "history": 0, "warnings": 0 })
            .await;

        match updated {
            Ok(Some(doc)) => Ok(Some(AppliedDelta {
                previous: doc.previous_strikes,
                total: doc.strikes,
                requested: mutation.delta,
            })),
            Ok(None) => Ok(None),
            // The record exists but already carries the tag, so the upsert
            // collided with the unique key instead of matching
            Err(e) if mutation.operation_id().is_some() && is_duplicate_key(&e) => {
                debug!(key = %key, "Mutation already applied for operation");
                Ok(None)
            }
            Err(e) => Err(BailiffError::Database(format!("Strike update failed: {}", e))),
        }
    }

    async fn record(&self, key: &StrikeKey) -> Result<Option<StrikeDoc>> {
        self.strikes.find_one(key_filter(key)).await
    }

    async fn records(&self, community_id: &str, filter: RecordFilter) -> Result<Vec<StrikeDoc>> {
        let mut query = doc! { "community_id": community_id };
        if filter.with_strikes {
            query.insert("strikes", doc! { "$gt": 0.0 });
        }
        if let Some(op) = &filter.untagged {
            query.insert("applied_operations", doc! { "$ne": op });
        }
        self.strikes.find_many(query).await
    }

    async fn communities(&self) -> Result<Vec<String>> {
        self.strikes.distinct_strings("community_id", doc! {}).await
    }

    async fn push_warning(&self, key: &StrikeKey, warning: Warning) -> Result<()> {
        let now = warning.issued_at;
        self.strikes
            .inner()
            .update_one(
                key_filter(key),
                doc! {
                    "$push": { "warnings": to_bson(&warning)? },
                    "$set": { "updated_at": now },
                    "$setOnInsert": { "strikes": 0.0, "created_at": now },
                },
            )
            .upsert(true)
            .await
            .map_err(|e| BailiffError::Database(format!("Warning update failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl OperationStore for MongoStore {
    async fn insert_active(&self, community_id: &str, record: OperationRecord) -> Result<()> {
        let path = format!("active.{}", record.operation_type);
        let result = self
            .operations
            .inner()
            .update_one(
                doc! { "community_id": community_id, &path: { "$exists": false } },
                doc! { "$set": { &path: to_bson(&record)?, "updated_at": DateTime::now() } },
            )
            .upsert(true)
            .await;

        match result {
            Ok(_) => Ok(()),
            // The community document exists and already holds an active run
            Err(e) if is_duplicate_key(&e) => Err(BailiffError::OperationActive {
                community_id: community_id.to_string(),
                operation: record.operation_type,
            }),
            Err(e) => Err(BailiffError::Database(format!("Recovery point insert failed: {}", e))),
        }
    }

    async fn heartbeat(
        &self,
        community_id: &str,
        operation_type: &str,
        recovery_id: &str,
        at: DateTime,
        data: Option<serde_json::Value>,
    ) -> Result<bool> {
        let path = format!("active.{}", operation_type);
        let mut set = doc! { format!("{}.last_heartbeat", path): at };
        if let Some(data) = data {
            set.insert(format!("{}.data", path), to_bson(&data)?);
        }

        let result = self
            .operations
            .update_one(
                doc! { "community_id": community_id, format!("{}.recovery_id", path): recovery_id },
                doc! { "$set": set },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn claim(
        &self,
        community_id: &str,
        operation_type: &str,
        recovery_id: &str,
        observed: Option<DateTime>,
        at: DateTime,
    ) -> Result<bool> {
        let path = format!("active.{}", operation_type);
        let observed = observed.map(Bson::DateTime).unwrap_or(Bson::Null);

        let result = self
            .operations
            .update_one(
                doc! {
                    "community_id": community_id,
                    format!("{}.recovery_id", path): recovery_id,
                    format!("{}.last_heartbeat", path): observed,
                },
                doc! {
                    "$set": { format!("{}.last_heartbeat", path): at },
                    "$inc": { format!("{}.recovery_attempts", path): 1 },
                },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn complete(
        &self,
        community_id: &str,
        entry: CompletedOperation,
        keep: usize,
    ) -> Result<bool> {
        let active_path = format!("active.{}", entry.operation_type);
        let history_path = format!("completed.{}", entry.operation_type);
        let keep = -(keep.max(1) as i64);

        let result = self
            .operations
            .update_one(
                doc! {
                    "community_id": community_id,
                    format!("{}.recovery_id", active_path): &entry.recovery_id,
                },
                doc! {
                    "$unset": { &active_path: "" },
                    "$push": { &history_path: { "$each": [to_bson(&entry)?], "$slice": keep } },
                    "$set": { "updated_at": DateTime::now() },
                },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn active(&self, community_id: &str, operation_type: &str) -> Result<Option<OperationRecord>> {
        Ok(self
            .operations
            .find_one(doc! { "community_id": community_id })
            .await?
            .and_then(|mut doc| doc.active.remove(operation_type)))
    }

    async fn completed(&self, community_id: &str, operation_type: &str) -> Result<Vec<CompletedOperation>> {
        Ok(self
            .operations
            .find_one(doc! { "community_id": community_id })
            .await?
            .and_then(|mut doc| doc.completed.remove(operation_type))
            .unwrap_or_default())
    }

    async fn all_active(&self) -> Result<Vec<(String, OperationRecord)>> {
        let docs = self.operations.find_many(doc! {}).await?;
        Ok(docs
            .into_iter()
            .flat_map(|doc| {
                let community_id = doc.community_id;
                doc.active
                    .into_values()
                    .map(move |record| (community_id.clone(), record))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_filter_excludes_tagged_records() {
        let key = StrikeKey::new("u1", "g1");
        let filter = apply_filter(&key, &ApplyCondition::Untagged("op-9".to_string()));
        assert_eq!(filter.get_str("actor_id").unwrap(), "u1");
        assert_eq!(
            filter.get_document("applied_operations").unwrap(),
            &doc! { "$ne": "op-9" }
        );
    }

    #[test]
    fn test_pipeline_wraps_reason_in_literal() {
        let mutation = LedgerMutation::new(-1.0, "$strikes", "$mod");
        let pipeline = apply_pipeline(&mutation).unwrap();
        assert_eq!(pipeline.len(), 2);

        let history = pipeline[1]
            .get_document("$set")
            .unwrap()
            .get_document("history")
            .unwrap();
        let parts = history.get_array("$concatArrays").unwrap();
        let entry = parts[1].as_array().unwrap()[0].as_document().unwrap();
        assert_eq!(entry.get_document("reason").unwrap(), &doc! { "$literal": "$strikes" });
        assert!(entry.get("operation_id").is_none());
    }

    #[test]
    fn test_pipeline_rounds_clamped_total() {
        let pipeline = apply_pipeline(&LedgerMutation::new(0.7, "r", "m")).unwrap();
        let strikes = pipeline[0]
            .get_document("$set")
            .unwrap()
            .get_document("strikes")
            .unwrap();
        let args = strikes.get_array("$round").unwrap();
        assert!(args[0].as_document().unwrap().contains_key("$max"));
        assert_eq!(args[1], Bson::Int32(STRIKE_DECIMALS));
    }

    #[test]
    fn test_pipeline_caps_applied_operations() {
        let mutation = LedgerMutation::new(-0.5, "r", "m")
            .with_condition(ApplyCondition::Untagged("op-1".to_string()));
        let pipeline = apply_pipeline(&mutation).unwrap();
        let tags = pipeline[0]
            .get_document("$set")
            .unwrap()
            .get_document("applied_operations")
            .unwrap();
        let args = tags.get_array("$slice").unwrap();
        assert_eq!(args[1], Bson::Int32(-(APPLIED_OPERATIONS_LIMIT as i32)));
    }

    #[test]
    fn test_pipeline_stamps_violation_only_for_additions() {
        let add = apply_pipeline(&LedgerMutation::new(1.0, "r", "m")).unwrap();
        assert!(add[0].get_document("$set").unwrap().contains_key("last_violation_at"));

        let remove = apply_pipeline(&LedgerMutation::new(-1.0, "r", "m")).unwrap();
        assert!(!remove[0].get_document("$set").unwrap().contains_key("last_violation_at"));
    }
}
