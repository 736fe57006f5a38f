//! Bailiff - strike ledger and escalating enforcement for community moderation

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bailiff::{
    batch::{spawn_decay_scheduler, BatchRunner},
    chat::{HttpChatGateway, MemoryChatGateway, Messenger},
    commands::Dispatcher,
    config::Args,
    db::MongoClient,
    gamestats::HttpGameStatsClient,
    guard::{spawn_sweep_task, DispatchGuard},
    ledger::StrikeLedger,
    recovery::{spawn_recovery_task, RecoveryManager},
    roles::{RoleGateway, RoleSynchronizer},
    server::{self, AppState, StorageBackend},
    store::{LedgerStore, MemoryStore, MongoStore, OperationStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("bailiff={},info", log_level).into());
    if args.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Bailiff - moderation strike ledger");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("MongoDB: {}", args.mongodb_uri);
    info!(
        "Tiers: warn {} / block {} / ban {}",
        args.tier_warn, args.tier_block, args.tier_ban
    );
    info!("Chat bridge: {}", args.chat_api_url.as_deref().unwrap_or("in-memory"));
    info!("Game API: {}", args.game_api_url.as_deref().unwrap_or("disabled"));
    info!("======================================");

    // Storage: MongoDB, or process memory in dev mode
    let (ledger_store, operation_store, storage): (Arc<dyn LedgerStore>, Arc<dyn OperationStore>, _) =
        match connect_mongo(&args).await {
            Ok(store) => {
                info!("MongoDB connected successfully");
                let store = Arc::new(store);
                (store.clone() as Arc<dyn LedgerStore>, store as Arc<dyn OperationStore>, StorageBackend::Mongo)
            }
            Err(e) => {
                if args.dev_mode {
                    warn!("MongoDB connection failed (dev mode, using in-memory storage): {}", e);
                    let store = Arc::new(MemoryStore::new());
                    (store.clone() as Arc<dyn LedgerStore>, store as Arc<dyn OperationStore>, StorageBackend::Memory)
                } else {
                    error!("MongoDB connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        };

    let timeout = Duration::from_millis(args.request_timeout_ms);
    let (messenger, role_gateway): (Arc<dyn Messenger>, Arc<dyn RoleGateway>) = match &args.chat_api_url {
        Some(url) => {
            let gateway = Arc::new(HttpChatGateway::new(url, args.chat_api_token.clone(), timeout));
            (gateway.clone() as Arc<dyn Messenger>, gateway as Arc<dyn RoleGateway>)
        }
        None => {
            if !args.dev_mode {
                error!("CHAT_API_URL is required outside dev mode");
                std::process::exit(1);
            }
            warn!("No chat bridge configured (dev mode, replies are kept in memory)");
            let gateway = Arc::new(MemoryChatGateway::new());
            (gateway.clone() as Arc<dyn Messenger>, gateway as Arc<dyn RoleGateway>)
        }
    };

    let ledger = StrikeLedger::new(ledger_store);
    let roles = RoleSynchronizer::new(role_gateway, args.thresholds(), args.tier_labels());
    let recovery = Arc::new(RecoveryManager::new(operation_store, args.recovery_config()?));

    let mut runner = BatchRunner::new(ledger, roles, recovery.clone(), args.batch_config()?);
    if let Some(url) = &args.game_api_url {
        let client = HttpGameStatsClient::new(
            url,
            args.game_api_token.clone(),
            Duration::from_millis(args.game_api_min_interval_ms),
            timeout,
        );
        runner = runner.with_game_stats(Arc::new(client));
    }
    let runner = Arc::new(runner);

    let guard_config = args.guard_config();
    let guard = DispatchGuard::new(&guard_config);
    let dispatcher = Dispatcher::new(guard.clone(), runner.clone(), messenger, args.dispatch_config()?);

    spawn_sweep_task(guard.clone(), guard_config.sweep_interval);
    spawn_recovery_task(recovery.clone(), runner.clone());
    if args.decay_interval_secs > 0 {
        spawn_decay_scheduler(runner, Duration::from_secs(args.decay_interval_secs));
        info!("Strike decay scheduled every {}s", args.decay_interval_secs);
    } else {
        info!("Scheduled strike decay disabled");
    }

    let state = Arc::new(AppState::new(args, storage, dispatcher, guard, recovery));
    server::run(state).await?;

    Ok(())
}

async fn connect_mongo(args: &Args) -> bailiff::Result<MongoStore> {
    let client = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
    MongoStore::new(&client).await
}
