//! Configuration for Bailiff
//!
//! CLI arguments and environment variable handling using clap.
//! Every flag can be supplied through the environment (and a `.env` file,
//! loaded by `main` via dotenvy).

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::commands::{DispatchConfig, ViolationCategory};
use crate::guard::GuardConfig;
use crate::recovery::RecoveryConfig;
use crate::roles::{TierLabels, TierThresholds};
use crate::types::{BailiffError, Result};

/// Bailiff - strike ledger and escalating enforcement for community moderation
#[derive(Parser, Debug, Clone)]
#[command(name = "bailiff")]
#[command(about = "Tracks moderation strikes and enforces escalating consequences")]
pub struct Args {
    /// Address the chat event webhook listens on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Enable development mode (in-memory fallbacks for storage and chat)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "bailiff")]
    pub mongodb_db: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: "text" or "json"
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Shared secret expected in the x-bailiff-token header of webhook calls
    #[arg(long, env = "WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    /// Base URL of the chat platform bridge (messages, reactions, roles)
    #[arg(long, env = "CHAT_API_URL")]
    pub chat_api_url: Option<String>,

    /// Bearer token for the chat platform bridge
    #[arg(long, env = "CHAT_API_TOKEN")]
    pub chat_api_token: Option<String>,

    /// Base URL of the game statistics API
    #[arg(long, env = "GAME_API_URL")]
    pub game_api_url: Option<String>,

    /// Bearer token for the game statistics API
    #[arg(long, env = "GAME_API_TOKEN")]
    pub game_api_token: Option<String>,

    /// Minimum interval between any two game API calls (global)
    #[arg(long, env = "GAME_API_MIN_INTERVAL_MS", default_value = "1000")]
    pub game_api_min_interval_ms: u64,

    /// HTTP request timeout for outbound calls in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// Command prefix recognised in chat messages
    #[arg(long, env = "COMMAND_PREFIX", default_value = "!")]
    pub command_prefix: String,

    /// Cooldown between two accepted invocations of one command by one actor
    #[arg(long, env = "COMMAND_COOLDOWN_MS", default_value = "2500")]
    pub command_cooldown_ms: u64,

    /// Safety timeout after which an in-flight marker is force-released
    #[arg(long, env = "INFLIGHT_TIMEOUT_SECS", default_value = "15")]
    pub inflight_timeout_secs: u64,

    /// How long processed event ids are remembered for deduplication
    #[arg(long, env = "EVENT_TTL_SECS", default_value = "60")]
    pub event_ttl_secs: u64,

    /// Maximum entries per dispatch guard map
    #[arg(long, env = "GUARD_MAX_ENTRIES", default_value = "10000")]
    pub guard_max_entries: usize,

    /// Interval between dispatch guard sweeps
    #[arg(long, env = "GUARD_SWEEP_SECS", default_value = "60")]
    pub guard_sweep_secs: u64,

    /// Time a moderator has to approve a proposed mutation
    #[arg(long, env = "CONFIRM_TIMEOUT_SECS", default_value = "120")]
    pub confirm_timeout_secs: u64,

    /// Time allowed for the category selection step
    #[arg(long, env = "SELECTION_TIMEOUT_SECS", default_value = "300")]
    pub selection_timeout_secs: u64,

    /// Interval between recovery passes
    #[arg(long, env = "RECOVERY_INTERVAL_SECS", default_value = "300")]
    pub recovery_interval_secs: u64,

    /// Heartbeat age after which a batch operation is presumed abandoned
    #[arg(long, env = "RECOVERY_STALE_SECS", default_value = "600")]
    pub recovery_stale_secs: u64,

    /// Completed operations retained per operation type
    #[arg(long, env = "RECOVERY_HISTORY_LIMIT", default_value = "10")]
    pub recovery_history_limit: usize,

    /// Batch operations heartbeat after this many processed records
    #[arg(long, env = "HEARTBEAT_EVERY", default_value = "10")]
    pub heartbeat_every: usize,

    /// Strike decay window in days
    #[arg(long, env = "DECAY_WINDOW_DAYS", default_value = "30")]
    pub decay_window_days: i64,

    /// Strikes removed per decay step
    #[arg(long, env = "DECAY_AMOUNT", default_value = "1.0")]
    pub decay_amount: f64,

    /// Interval between scheduled decay runs (0 disables the scheduler)
    #[arg(long, env = "DECAY_INTERVAL_SECS", default_value = "86400")]
    pub decay_interval_secs: u64,

    /// Strike total at which the warn tier applies
    #[arg(long, env = "TIER_WARN", default_value = "2.0")]
    pub tier_warn: f64,

    /// Strike total at which the block tier applies
    #[arg(long, env = "TIER_BLOCK", default_value = "3.0")]
    pub tier_block: f64,

    /// Strike total at which the ban tier applies
    #[arg(long, env = "TIER_BAN", default_value = "4.0")]
    pub tier_ban: f64,

    /// Label name assigned for the warn tier
    #[arg(long, env = "TIER_LABEL_WARN", default_value = "Strike Warning")]
    pub tier_label_warn: String,

    /// Label name assigned for the block tier
    #[arg(long, env = "TIER_LABEL_BLOCK", default_value = "Strike Block")]
    pub tier_label_block: String,

    /// Label name assigned for the ban tier
    #[arg(long, env = "TIER_LABEL_BAN", default_value = "Strike Ban")]
    pub tier_label_ban: String,

    /// Violation categories offered when no amount is given, as "name=amount,..."
    #[arg(
        long,
        env = "VIOLATION_CATEGORIES",
        default_value = "Missed war attack=1,Missed both attacks=2,Broke war plan=1.5,Abusive behaviour=3"
    )]
    pub violation_categories: String,

    /// Strikes per missed war attack applied by the auto-penalty
    #[arg(long, env = "MISSED_ATTACK_PENALTY", default_value = "0.5")]
    pub missed_attack_penalty: f64,
}

impl Args {
    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            event_ttl: Duration::from_secs(self.event_ttl_secs),
            cooldown: Duration::from_millis(self.command_cooldown_ms),
            inflight_timeout: Duration::from_secs(self.inflight_timeout_secs),
            max_entries: self.guard_max_entries,
            sweep_interval: Duration::from_secs(self.guard_sweep_secs),
        }
    }

    pub fn recovery_config(&self) -> Result<RecoveryConfig> {
        let stale_after = i64::try_from(self.recovery_stale_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                BailiffError::Config(format!(
                    "RECOVERY_STALE_SECS is out of range: {}",
                    self.recovery_stale_secs
                ))
            })?;
        Ok(RecoveryConfig {
            stale_after,
            scan_interval: Duration::from_secs(self.recovery_interval_secs),
            history_limit: self.recovery_history_limit,
        })
    }

    pub fn batch_config(&self) -> Result<BatchConfig> {
        let decay_window = chrono::Duration::try_days(self.decay_window_days).ok_or_else(|| {
            BailiffError::Config(format!(
                "DECAY_WINDOW_DAYS is out of range: {}",
                self.decay_window_days
            ))
        })?;
        Ok(BatchConfig {
            heartbeat_every: self.heartbeat_every,
            decay_window,
            decay_amount: self.decay_amount,
            missed_attack_penalty: self.missed_attack_penalty,
        })
    }

    pub fn thresholds(&self) -> TierThresholds {
        TierThresholds {
            warn: self.tier_warn,
            block: self.tier_block,
            ban: self.tier_ban,
        }
    }

    pub fn tier_labels(&self) -> TierLabels {
        TierLabels {
            warn: self.tier_label_warn.clone(),
            block: self.tier_label_block.clone(),
            ban: self.tier_label_ban.clone(),
        }
    }

    /// Parse VIOLATION_CATEGORIES ("name=amount,...")
    pub fn categories(&self) -> Result<Vec<ViolationCategory>> {
        self.violation_categories
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| {
                let (name, amount) = entry.rsplit_once('=').ok_or_else(|| {
                    BailiffError::Config(format!("Invalid violation category '{}'", entry))
                })?;
                let amount: f64 = amount.trim().parse().map_err(|_| {
                    BailiffError::Config(format!("Invalid strike amount in category '{}'", entry))
                })?;
                if !(amount.is_finite() && amount > 0.0) {
                    return Err(BailiffError::Config(format!(
                        "Strike amount must be positive in category '{}'",
                        entry
                    )));
                }
                Ok(ViolationCategory {
                    name: name.trim().to_string(),
                    amount,
                })
            })
            .collect()
    }

    pub fn dispatch_config(&self) -> Result<DispatchConfig> {
        Ok(DispatchConfig {
            prefix: self.command_prefix.clone(),
            confirm_timeout: Duration::from_secs(self.confirm_timeout_secs),
            selection_timeout: Duration::from_secs(self.selection_timeout_secs),
            categories: self.categories()?,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.thresholds().validate()?;
        self.recovery_config()?;
        self.batch_config()?;
        let categories = self.categories()?;
        if categories.len() > 9 {
            return Err(BailiffError::Config(
                "At most 9 violation categories can be offered".to_string(),
            ));
        }

        if self.command_prefix.trim().is_empty() {
            return Err(BailiffError::Config("COMMAND_PREFIX must not be empty".to_string()));
        }
        if self.inflight_timeout_secs == 0 || self.event_ttl_secs == 0 {
            return Err(BailiffError::Config(
                "INFLIGHT_TIMEOUT_SECS and EVENT_TTL_SECS must be positive".to_string(),
            ));
        }
        if self.recovery_interval_secs == 0 || self.guard_sweep_secs == 0 {
            return Err(BailiffError::Config(
                "RECOVERY_INTERVAL_SECS and GUARD_SWEEP_SECS must be positive".to_string(),
            ));
        }
        if self.heartbeat_every == 0 {
            return Err(BailiffError::Config("HEARTBEAT_EVERY must be positive".to_string()));
        }
        if self.recovery_stale_secs <= self.inflight_timeout_secs {
            return Err(BailiffError::Config(
                "RECOVERY_STALE_SECS must exceed INFLIGHT_TIMEOUT_SECS".to_string(),
            ));
        }
        if !(self.decay_amount.is_finite() && self.decay_amount > 0.0) || self.decay_window_days <= 0 {
            return Err(BailiffError::Config(
                "DECAY_AMOUNT and DECAY_WINDOW_DAYS must be positive".to_string(),
            ));
        }
        if !(self.missed_attack_penalty.is_finite() && self.missed_attack_penalty >= 0.0) {
            return Err(BailiffError::Config(
                "MISSED_ATTACK_PENALTY must not be negative".to_string(),
            ));
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(BailiffError::Config("LOG_FORMAT must be 'text' or 'json'".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Args {
        Args::try_parse_from(["bailiff"]).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let args = defaults();
        assert!(args.validate().is_ok());
        assert_eq!(args.guard_config().cooldown, Duration::from_millis(2500));
        assert_eq!(args.guard_config().inflight_timeout, Duration::from_secs(15));
        let recovery = args.recovery_config().unwrap();
        assert_eq!(recovery.stale_after, chrono::Duration::minutes(10));
        assert_eq!(recovery.scan_interval, Duration::from_secs(300));
        assert_eq!(args.batch_config().unwrap().decay_window, chrono::Duration::days(30));
    }

    #[test]
    fn test_parse_categories() {
        let args = defaults();
        let categories = args.categories().unwrap();
        assert_eq!(categories.len(), 4);
        assert_eq!(categories[0].name, "Missed war attack");
        assert_eq!(categories[2].amount, 1.5);
    }

    #[test]
    fn test_rejects_bad_category() {
        let args = Args::try_parse_from(["bailiff", "--violation-categories", "Spam"]).unwrap();
        assert!(args.categories().is_err());

        let args = Args::try_parse_from(["bailiff", "--violation-categories", "Spam=-1"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let args = Args::try_parse_from(["bailiff", "--tier-block", "5", "--tier-ban", "4"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_rejects_stale_threshold_below_lock_timeout() {
        let args = Args::try_parse_from(["bailiff", "--recovery-stale-secs", "10"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_out_of_range_durations_are_config_errors() {
        let huge = i64::MAX.to_string();
        let args = Args::try_parse_from(["bailiff", "--decay-window-days", &huge]).unwrap();
        assert!(matches!(args.batch_config(), Err(BailiffError::Config(_))));
        assert!(args.validate().is_err());

        let huge = u64::MAX.to_string();
        let args = Args::try_parse_from(["bailiff", "--recovery-stale-secs", &huge]).unwrap();
        assert!(matches!(args.recovery_config(), Err(BailiffError::Config(_))));
        assert!(args.validate().is_err());
    }
}
