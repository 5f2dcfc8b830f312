//! channeld entry point.
//!
//! Wiring:
//!
//! ```text
//! ┌─────────┐   ┌─────────────┐   ┌─────────────┐   ┌───────────┐
//! │ Gateway │──▶│  Binding    │──▶│  Storage    │   │ Workflow  │
//! │ (axum)  │   │  Service    │   │ (Postgres/  │   │ service   │
//! └─────────┘   └──────┬──────┘   │  in-memory) │   └─────▲─────┘
//!                      │          └─────────────┘         │
//!               ┌──────▼──────┐   ┌─────────────┐   ┌─────┴─────┐
//!               │ Coordinator │──▶│ Slot peers  │   │   Abort   │
//!               │ (worker     │   │ (start_     │   │ escalator │
//!               │  pool)      │   │  transfer)  │   └───────────┘
//!               └─────────────┘   └─────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use channeld::abort::AbortEscalator;
use channeld::binding::BindingService;
use channeld::config::AppConfig;
use channeld::coordinator::TransferCoordinator;
use channeld::db::Database;
use channeld::gateway::{self, state::AppState};
use channeld::logging::init_logging;
use channeld::slots::HttpSlotsClient;
use channeld::storage::ChannelStorage;
use channeld::storage::memory::MemStorage;
use channeld::storage::postgres::PgStorage;
use channeld::workflow::HttpWorkflowClient;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn run<S: ChannelStorage>(config: AppConfig, storage: Arc<S>) -> anyhow::Result<()> {
    let workflow = Arc::new(HttpWorkflowClient::new(&config.workflow)?);
    let slots = Arc::new(HttpSlotsClient::new(Duration::from_millis(
        config.slots.request_timeout_ms,
    ))?);

    let escalator = Arc::new(AbortEscalator::new(storage.clone(), workflow.clone()));
    let coordinator = Arc::new(TransferCoordinator::start(
        &config.coordinator,
        storage.clone(),
        slots,
        escalator.clone(),
    ));

    // Replay instructions that were pending when the last process died
    coordinator.restore_actions().await?;

    let binding = Arc::new(BindingService::new(storage, workflow, coordinator, escalator));

    gateway::run_server(
        &config.gateway.host,
        config.gateway.port,
        AppState::new(binding),
    )
    .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(&get_env());
    let _guard = init_logging(&config);

    tracing::info!(
        host = %config.gateway.host,
        port = config.gateway.port,
        "Starting channeld"
    );

    match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            db.init_schema().await?;
            run(config.clone(), Arc::new(PgStorage::new(db.pool().clone()))).await
        }
        None => {
            tracing::warn!("No postgres_url configured, using in-memory storage");
            run(config.clone(), Arc::new(MemStorage::new())).await
        }
    }
}
