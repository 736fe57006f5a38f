//! Shared wiring for integration tests: everything in memory

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bailiff::batch::{BatchConfig, BatchRunner};
use bailiff::chat::MemoryChatGateway;
use bailiff::commands::{DispatchConfig, Dispatcher};
use bailiff::guard::{DispatchGuard, GuardConfig};
use bailiff::ledger::StrikeLedger;
use bailiff::recovery::{RecoveryConfig, RecoveryManager};
use bailiff::roles::{RoleSynchronizer, TierLabels, TierThresholds};
use bailiff::store::MemoryStore;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub chat: Arc<MemoryChatGateway>,
    pub runner: Arc<BatchRunner>,
    pub recovery: Arc<RecoveryManager>,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let chat = Arc::new(MemoryChatGateway::new());
    let roles = RoleSynchronizer::new(chat.clone(), TierThresholds::default(), TierLabels::default());
    let recovery = Arc::new(RecoveryManager::new(store.clone(), RecoveryConfig::default()));
    let runner = Arc::new(BatchRunner::new(
        StrikeLedger::new(store.clone()),
        roles,
        recovery.clone(),
        BatchConfig::default(),
    ));
    Harness {
        store,
        chat,
        runner,
        recovery,
    }
}

impl Harness {
    pub fn ledger(&self) -> &StrikeLedger {
        self.runner.ledger()
    }

    pub fn dispatcher(&self, guard: GuardConfig) -> Dispatcher {
        let config = DispatchConfig {
            confirm_timeout: Duration::from_secs(30),
            selection_timeout: Duration::from_secs(30),
            ..DispatchConfig::default()
        };
        Dispatcher::new(DispatchGuard::new(&guard), self.runner.clone(), self.chat.clone(), config)
    }
}
