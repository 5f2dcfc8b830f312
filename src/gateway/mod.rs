//! HTTP gateway.

pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::info;

use crate::storage::ChannelStorage;
use crate::workflow::WorkflowApi;
use state::AppState;

pub fn router<S: ChannelStorage, W: WorkflowApi>(state: AppState<S, W>) -> Router {
    Router::new()
        .route("/v1/channels/get_or_create", post(handlers::get_or_create))
        .route("/v1/channels/destroy", post(handlers::destroy))
        .route("/v1/channels/destroy_all", post(handlers::destroy_all))
        .route("/v1/channels/status", get(handlers::channels_status))
        .route("/v1/slots/bind", post(handlers::bind))
        .route("/v1/slots/unbind", post(handlers::unbind))
        .route(
            "/v1/slots/transfer_completed",
            post(handlers::transfer_completed),
        )
        .route("/v1/slots/transfer_failed", post(handlers::transfer_failed))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Serve the gateway until the process dies.
pub async fn run_server<S: ChannelStorage, W: WorkflowApi>(
    host: &str,
    port: u16,
    state: AppState<S, W>,
) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "Gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
