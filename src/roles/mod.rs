//! Tier derivation and role label synchronization
//!
//! `tier_for` is a pure function of the strike total. `RoleSynchronizer`
//! makes a member's tier labels match that tier; it is idempotent and a
//! missing or failing label never aborts the rest of the sync.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::STRIKE_TOLERANCE;
use crate::types::{BailiffError, Result};

/// Enforcement tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    None,
    Warn,
    Block,
    Ban,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::None => "none",
            Tier::Warn => "warn",
            Tier::Block => "block",
            Tier::Ban => "ban",
        };
        f.write_str(name)
    }
}

/// Inclusive lower bounds for each tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierThresholds {
    pub warn: f64,
    pub block: f64,
    pub ban: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            warn: 2.0,
            block: 3.0,
            ban: 4.0,
        }
    }
}

impl TierThresholds {
    pub fn tier_for(&self, strikes: f64) -> Tier {
        let reaches = |threshold: f64| strikes + STRIKE_TOLERANCE >= threshold;
        if reaches(self.ban) {
            Tier::Ban
        } else if reaches(self.block) {
            Tier::Block
        } else if reaches(self.warn) {
            Tier::Warn
        } else {
            Tier::None
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ordered = self.warn > 0.0 && self.warn <= self.block && self.block <= self.ban;
        if !ordered || !self.ban.is_finite() {
            return Err(BailiffError::Config(format!(
                "Tier thresholds must satisfy 0 < warn <= block <= ban (got {}, {}, {})",
                self.warn, self.block, self.ban
            )));
        }
        Ok(())
    }
}

/// Tier for a strike total under the default thresholds
pub fn tier_for(strikes: f64) -> Tier {
    TierThresholds::default().tier_for(strikes)
}

/// Label names for each tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierLabels {
    pub warn: String,
    pub block: String,
    pub ban: String,
}

impl Default for TierLabels {
    fn default() -> Self {
        Self {
            warn: "Strike Warning".to_string(),
            block: "Strike Block".to_string(),
            ban: "Strike Ban".to_string(),
        }
    }
}

impl TierLabels {
    pub fn label(&self, tier: Tier) -> Option<&str> {
        match tier {
            Tier::None => None,
            Tier::Warn => Some(&self.warn),
            Tier::Block => Some(&self.block),
            Tier::Ban => Some(&self.ban),
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.warn, &self.block, &self.ban]
    }
}

/// Chat platform operations needed to manage tier labels
#[async_trait]
pub trait RoleGateway: Send + Sync {
    /// Label names currently assigned to a member
    async fn member_labels(&self, community_id: &str, actor_id: &str) -> Result<Vec<String>>;

    /// Make sure a label exists in the community, creating it if needed
    async fn ensure_label(&self, community_id: &str, label: &str) -> Result<()>;

    async fn add_label(&self, community_id: &str, actor_id: &str, label: &str) -> Result<()>;

    async fn remove_label(&self, community_id: &str, actor_id: &str, label: &str) -> Result<()>;
}

/// Result of one tier application
#[derive(Debug, Clone, PartialEq)]
pub struct TierSync {
    pub tier: Tier,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Labels that could not be changed, with the reason
    pub failures: Vec<(String, String)>,
}

impl TierSync {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Keeps tier labels in line with strike totals
#[derive(Clone)]
pub struct RoleSynchronizer {
    gateway: Arc<dyn RoleGateway>,
    thresholds: TierThresholds,
    labels: TierLabels,
}

impl RoleSynchronizer {
    pub fn new(gateway: Arc<dyn RoleGateway>, thresholds: TierThresholds, labels: TierLabels) -> Self {
        Self {
            gateway,
            thresholds,
            labels,
        }
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    pub fn tier_for(&self, strikes: f64) -> Tier {
        self.thresholds.tier_for(strikes)
    }

    /// Derive the tier from a total and apply it
    pub async fn sync(&self, community_id: &str, actor_id: &str, strikes: f64) -> Result<TierSync> {
        self.apply_tier(community_id, actor_id, self.tier_for(strikes)).await
    }

    /// Remove stale tier labels and assign the target one
    pub async fn apply_tier(&self, community_id: &str, actor_id: &str, tier: Tier) -> Result<TierSync> {
        let current = self.gateway.member_labels(community_id, actor_id).await?;
        let target = self.labels.label(tier);

        let mut result = TierSync {
            tier,
            added: Vec::new(),
            removed: Vec::new(),
            failures: Vec::new(),
        };

        for label in self.labels.all() {
            if Some(label) == target || !current.iter().any(|c| c == label) {
                continue;
            }
            match self.gateway.remove_label(community_id, actor_id, label).await {
                Ok(()) => result.removed.push(label.to_string()),
                Err(e) => {
                    warn!(community_id, actor_id, label, error = %e, "Failed to remove tier label");
                    result.failures.push((label.to_string(), e.to_string()));
                }
            }
        }

        if let Some(label) = target {
            if !current.iter().any(|c| c == label) {
                let assigned = match self.gateway.ensure_label(community_id, label).await {
                    Ok(()) => self.gateway.add_label(community_id, actor_id, label).await,
                    Err(e) => Err(e),
                };
                match assigned {
                    Ok(()) => result.added.push(label.to_string()),
                    Err(e) => {
                        warn!(community_id, actor_id, label, error = %e, "Failed to assign tier label");
                        result.failures.push((label.to_string(), e.to_string()));
                    }
                }
            }
        }

        debug!(
            community_id,
            actor_id,
            tier = %tier,
            added = result.added.len(),
            removed = result.removed.len(),
            "Tier applied"
        );
        Ok(result)
    }
}
