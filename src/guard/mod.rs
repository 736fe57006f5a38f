//! Process-local protection against duplicate and overlapping command execution

pub mod dispatch;
pub mod ttl;

pub use dispatch::{
    spawn_sweep_task, CommandKey, DispatchGuard, DispatchOutcome, DispatchPermit, GuardConfig,
    Rejection,
};
pub use ttl::{Claim, TtlConfig, TtlMap};
