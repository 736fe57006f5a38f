//! Command dispatch guard
//!
//! Three process-local maps protect command handlers from duplicate and
//! overlapping execution:
//!
//! - processed event ids, so a gateway redelivery runs nothing twice
//! - in-flight markers per (actor, command), released when the handler ends
//!   or force-released after a safety timeout
//! - cooldowns per (actor, command), recorded only for accepted invocations

use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::ttl::{Claim, Token, TtlConfig, TtlMap};
use crate::types::Result;

/// Configuration for the dispatch guard
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// How long processed event ids are remembered
    pub event_ttl: Duration,

    /// Minimum spacing between accepted invocations of one command by one actor
    pub cooldown: Duration,

    /// Age after which an in-flight marker is presumed leaked
    pub inflight_timeout: Duration,

    /// Bound for each of the three maps
    pub max_entries: usize,

    /// How often the sweep task runs
    pub sweep_interval: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            event_ttl: Duration::from_secs(60),
            cooldown: Duration::from_millis(2500),
            inflight_timeout: Duration::from_secs(15),
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Identity of a command invocation for in-flight and cooldown tracking
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandKey {
    pub actor_id: String,
    pub command: String,
}

impl CommandKey {
    pub fn new(actor_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            command: command.into(),
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor_id, self.command)
    }
}

/// Why an invocation was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    DuplicateEvent,
    CoolingDown { retry_after: Duration },
    InFlight,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::DuplicateEvent => f.write_str("event already processed"),
            Rejection::CoolingDown { retry_after } => {
                write!(f, "cooling down, retry in {:.1}s", retry_after.as_secs_f64())
            }
            Rejection::InFlight => f.write_str("command already running"),
        }
    }
}

/// Result of a guarded invocation; the guard never surfaces an error
#[derive(Debug, PartialEq)]
pub enum DispatchOutcome<T> {
    Completed(T),
    Failed(String),
    Rejected(Rejection),
}

impl<T> DispatchOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DispatchOutcome<U> {
        match self {
            DispatchOutcome::Completed(value) => DispatchOutcome::Completed(f(value)),
            DispatchOutcome::Failed(message) => DispatchOutcome::Failed(message),
            DispatchOutcome::Rejected(rejection) => DispatchOutcome::Rejected(rejection),
        }
    }
}

/// Module-owned guard state, shared by every dispatcher task
pub struct DispatchGuard {
    events: TtlMap<String>,
    in_flight: TtlMap<CommandKey>,
    cooldowns: TtlMap<CommandKey>,
}

/// Exclusive right to run one command invocation.
///
/// Dropping the permit clears the in-flight marker, unless the marker was
/// already force-released and claimed by a newer invocation.
pub struct DispatchPermit {
    guard: Arc<DispatchGuard>,
    key: CommandKey,
    token: Token,
}

impl DispatchPermit {
    pub fn key(&self) -> &CommandKey {
        &self.key
    }
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        if !self.guard.in_flight.release(&self.key, self.token) {
            debug!(key = %self.key, "In-flight marker already taken over");
        }
    }
}

impl DispatchGuard {
    pub fn new(config: &GuardConfig) -> Arc<Self> {
        let cfg = |ttl| TtlConfig {
            ttl,
            max_entries: config.max_entries,
        };
        Arc::new(Self {
            events: TtlMap::new(cfg(config.event_ttl)),
            in_flight: TtlMap::new(cfg(config.inflight_timeout)),
            cooldowns: TtlMap::new(cfg(config.cooldown)),
        })
    }

    /// Deduplicate an event id without command tracking
    pub fn admit_event(&self, event_id: &str) -> std::result::Result<(), Rejection> {
        match self.events.claim(event_id.to_string()) {
            Claim::Held { .. } => Err(Rejection::DuplicateEvent),
            _ => Ok(()),
        }
    }

    /// Admit a command invocation
    pub fn admit(
        self: &Arc<Self>,
        event_id: &str,
        key: CommandKey,
    ) -> std::result::Result<DispatchPermit, Rejection> {
        self.admit_event(event_id)?;

        if let Some(age) = self.cooldowns.age(&key) {
            let retry_after = self.cooldowns.ttl().saturating_sub(age);
            return Err(Rejection::CoolingDown { retry_after });
        }

        let token = match self.in_flight.claim(key.clone()) {
            Claim::Fresh(token) => token,
            Claim::Reclaimed { token, held_for } => {
                warn!(
                    key = %key,
                    held_for_ms = held_for.as_millis() as u64,
                    "Force-released stale in-flight marker"
                );
                token
            }
            Claim::Held { .. } => return Err(Rejection::InFlight),
        };

        self.cooldowns.touch(key.clone());
        Ok(DispatchPermit {
            guard: Arc::clone(self),
            key,
            token,
        })
    }

    /// Admit, run the handler under its permit and convert every failure
    /// (error or panic) into an outcome
    pub async fn run<T, F>(self: &Arc<Self>, event_id: &str, key: CommandKey, handler: F) -> DispatchOutcome<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = match self.admit(event_id, key) {
            Ok(permit) => permit,
            Err(rejection) => {
                debug!(event_id, reason = %rejection, "Command rejected");
                return DispatchOutcome::Rejected(rejection);
            }
        };

        let outcome = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(Ok(value)) => DispatchOutcome::Completed(value),
            Ok(Err(e)) => {
                warn!(key = %permit.key(), error = %e, "Command failed");
                DispatchOutcome::Failed(e.to_string())
            }
            Err(_) => {
                error!(key = %permit.key(), "Command handler panicked");
                DispatchOutcome::Failed("command handler panicked".to_string())
            }
        };
        drop(permit);
        outcome
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Evict expired entries from all three maps
    pub fn sweep(&self) -> usize {
        let removed = self.events.cleanup() + self.in_flight.cleanup() + self.cooldowns.cleanup();
        if removed > 0 {
            debug!(removed, "Dispatch guard sweep");
        }
        removed
    }
}

/// Spawn a background task that periodically sweeps the guard
pub fn spawn_sweep_task(guard: Arc<DispatchGuard>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            guard.sweep();
        }
    })
}
