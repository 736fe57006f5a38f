//! Strike ledger service
//!
//! Thin service over a [`LedgerStore`]. Every mutation is a single call to
//! the store's atomic apply step, so concurrent mutations of the same key
//! never lose updates and a removal can never drive the total below zero.

use bson::DateTime;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::schemas::{StrikeDoc, Warning};
use crate::store::{AppliedDelta, LedgerMutation, LedgerStore, StrikeKey};
use crate::types::{BailiffError, Result};

/// Strike ledger
#[derive(Clone)]
pub struct StrikeLedger {
    store: Arc<dyn LedgerStore>,
}

impl StrikeLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Apply a signed delta and return the new total
    pub async fn apply_delta(
        &self,
        key: &StrikeKey,
        delta: f64,
        reason: &str,
        moderator_id: &str,
    ) -> Result<AppliedDelta> {
        let applied = self
            .apply(key, LedgerMutation::new(delta, reason, moderator_id))
            .await?;

        // An unconditional mutation always matches
        applied.ok_or_else(|| {
            BailiffError::Internal(format!("Unconditional strike update for {} did not apply", key))
        })
    }

    /// Apply a mutation with its condition; `None` when the condition did not match
    pub async fn apply(&self, key: &StrikeKey, mutation: LedgerMutation) -> Result<Option<AppliedDelta>> {
        if !mutation.delta.is_finite() {
            return Err(BailiffError::InvalidInput(format!(
                "Strike delta must be finite, got {}",
                mutation.delta
            )));
        }
        if key.actor_id.is_empty() || key.community_id.is_empty() {
            return Err(BailiffError::InvalidInput(
                "Actor and community ids are required".to_string(),
            ));
        }

        let delta = mutation.delta;
        let applied = self.store.apply(key, mutation).await?;
        match &applied {
            Some(result) => info!(
                key = %key,
                requested = delta,
                applied = result.applied(),
                total = result.total,
                "Strike ledger updated"
            ),
            None => debug!(key = %key, requested = delta, "Conditional strike update skipped"),
        }
        Ok(applied)
    }

    pub async fn add_strikes(
        &self,
        key: &StrikeKey,
        amount: f64,
        reason: &str,
        moderator_id: &str,
    ) -> Result<AppliedDelta> {
        check_amount(amount)?;
        self.apply_delta(key, amount, reason, moderator_id).await
    }

    /// Remove strikes; the store clamps the total at zero
    pub async fn remove_strikes(
        &self,
        key: &StrikeKey,
        amount: f64,
        reason: &str,
        moderator_id: &str,
    ) -> Result<AppliedDelta> {
        check_amount(amount)?;
        self.apply_delta(key, -amount, reason, moderator_id).await
    }

    /// Current total, zero for an unknown key
    pub async fn read_total(&self, key: &StrikeKey) -> Result<f64> {
        Ok(self.store.record(key).await?.map_or(0.0, |r| r.strikes))
    }

    pub async fn record(&self, key: &StrikeKey) -> Result<Option<StrikeDoc>> {
        self.store.record(key).await
    }

    /// Record a formal warning without changing the strike total
    pub async fn warn(&self, key: &StrikeKey, reason: &str, moderator_id: &str) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(BailiffError::InvalidInput("A warning needs a reason".to_string()));
        }

        self.store
            .push_warning(
                key,
                Warning {
                    reason: reason.to_string(),
                    moderator_id: moderator_id.to_string(),
                    issued_at: DateTime::now(),
                },
            )
            .await?;
        info!(key = %key, moderator = moderator_id, "Warning issued");
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }
}

fn check_amount(amount: f64) -> Result<()> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(BailiffError::InvalidInput(format!(
            "Strike amount must be a positive number, got {}",
            amount
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ApplyCondition, MemoryStore};
    use futures_util::future::join_all;

    fn ledger() -> (Arc<MemoryStore>, StrikeLedger) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), StrikeLedger::new(store))
    }

    #[tokio::test]
    async fn test_read_total_defaults_to_zero() {
        let (_, ledger) = ledger();
        let key = StrikeKey::new("u1", "g1");
        assert_eq!(ledger.read_total(&key).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_removal_clamps_at_zero() {
        let (_, ledger) = ledger();
        let key = StrikeKey::new("u1", "g1");

        ledger.add_strikes(&key, 1.0, "missed attack", "mod").await.unwrap();
        let removed = ledger.remove_strikes(&key, 3.0, "appeal", "mod").await.unwrap();

        assert_eq!(removed.total, 0.0);
        assert_eq!(removed.applied(), -1.0);
        assert!(removed.was_clamped());

        let record = ledger.record(&key).await.unwrap().unwrap();
        assert_eq!(record.history.last().unwrap().delta, -1.0);
    }

    #[tokio::test]
    async fn test_rejects_invalid_amounts() {
        let (_, ledger) = ledger();
        let key = StrikeKey::new("u1", "g1");

        for amount in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = ledger.add_strikes(&key, amount, "x", "mod").await;
            assert!(matches!(result, Err(BailiffError::InvalidInput(_))));
        }
        assert!(ledger.record(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_additions_are_not_lost() {
        let (_, ledger) = ledger();
        let key = StrikeKey::new("u1", "g1");

        let calls = (0..50).map(|_| {
            let ledger = ledger.clone();
            let key = key.clone();
            async move { ledger.add_strikes(&key, 0.5, "spam", "mod").await }
        });
        for result in join_all(calls).await {
            result.unwrap();
        }

        assert_eq!(ledger.read_total(&key).await.unwrap(), 25.0);
        let record = ledger.record(&key).await.unwrap().unwrap();
        assert_eq!(record.history.len(), 50);
        assert_eq!(record.history_total(), 25.0);
    }

    #[tokio::test]
    async fn test_failed_store_applies_nothing() {
        let (store, ledger) = ledger();
        let key = StrikeKey::new("u1", "g1");
        ledger.add_strikes(&key, 2.0, "spam", "mod").await.unwrap();

        store.set_ledger_unavailable(true);
        assert!(ledger.add_strikes(&key, 1.0, "spam", "mod").await.is_err());
        store.set_ledger_unavailable(false);

        let record = ledger.record(&key).await.unwrap().unwrap();
        assert_eq!(record.strikes, 2.0);
        assert_eq!(record.history.len(), 1);
    }

    #[tokio::test]
    async fn test_warning_leaves_total_unchanged() {
        let (_, ledger) = ledger();
        let key = StrikeKey::new("u1", "g1");
        ledger.add_strikes(&key, 1.0, "spam", "mod").await.unwrap();
        ledger.warn(&key, "language", "mod").await.unwrap();

        let record = ledger.record(&key).await.unwrap().unwrap();
        assert_eq!(record.strikes, 1.0);
        assert_eq!(record.warnings.len(), 1);
        assert!(ledger.warn(&key, "  ", "mod").await.is_err());
    }

    #[tokio::test]
    async fn test_conditional_skip_is_not_an_error() {
        let (_, ledger) = ledger();
        let key = StrikeKey::new("u1", "g1");
        let tagged = LedgerMutation::new(1.0, "bulk", "mod")
            .with_condition(ApplyCondition::Untagged("op".to_string()));

        assert!(ledger.apply(&key, tagged.clone()).await.unwrap().is_some());
        assert!(ledger.apply(&key, tagged).await.unwrap().is_none());
    }
}
