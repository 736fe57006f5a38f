//! HTTP surface
//!
//! The chat bridge posts events to `/events`; operators poll `/health`,
//! `/version`, and `/operations/{community}/{type}`.

pub mod http;

pub use http::run;

use std::sync::Arc;

use crate::commands::Dispatcher;
use crate::config::Args;
use crate::guard::DispatchGuard;
use crate::recovery::RecoveryManager;

/// Which storage backend the process runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Mongo,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Mongo => "mongodb",
            StorageBackend::Memory => "memory",
        }
    }
}

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub storage: StorageBackend,
    pub dispatcher: Dispatcher,
    pub guard: Arc<DispatchGuard>,
    pub recovery: Arc<RecoveryManager>,
}

impl AppState {
    pub fn new(
        args: Args,
        storage: StorageBackend,
        dispatcher: Dispatcher,
        guard: Arc<DispatchGuard>,
        recovery: Arc<RecoveryManager>,
    ) -> Self {
        Self {
            args,
            storage,
            dispatcher,
            guard,
            recovery,
        }
    }
}
