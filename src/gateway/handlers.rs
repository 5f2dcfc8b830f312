//! HTTP handlers. Thin adapters: extract the subject, call the binding
//! service, wrap the result.

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use chrono::Utc;

use crate::error::ChannelError;
use crate::gateway::state::AppState;
use crate::gateway::types::*;
use crate::model::Role;
use crate::storage::ChannelStorage;
use crate::workflow::WorkflowApi;

type ApiError = (StatusCode, Json<ApiResponse<()>>);
type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn subject(headers: &HeaderMap) -> String {
    headers
        .get("x-subject-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn reject(e: ChannelError) -> ApiError {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiResponse::<()>::error(e.code(), e.to_string())))
}

/// POST /v1/channels/get_or_create
pub async fn get_or_create<S: ChannelStorage, W: WorkflowApi>(
    State(state): State<AppState<S, W>>,
    headers: HeaderMap,
    Json(body): Json<GetOrCreateBody>,
) -> ApiResult<ChannelIdData> {
    let channel_id = state
        .binding
        .get_or_create(
            &subject(&headers),
            crate::binding::GetOrCreateRequest {
                execution_id: body.execution_id,
                workflow_name: body.workflow_name,
                data_scheme: body.data_scheme,
                storage_producer_uri: body.storage_producer_uri,
                storage_consumer_uri: body.storage_consumer_uri,
            },
        )
        .await
        .map_err(reject)?;
    Ok(Json(ApiResponse::success(ChannelIdData { channel_id })))
}

/// POST /v1/slots/bind
pub async fn bind<S: ChannelStorage, W: WorkflowApi>(
    State(state): State<AppState<S, W>>,
    headers: HeaderMap,
    Json(body): Json<BindBody>,
) -> ApiResult<PeerData> {
    let role = Role::from_str_opt(&body.role).ok_or_else(|| {
        reject(ChannelError::InvalidArgument(format!(
            "unknown role: {}",
            body.role
        )))
    })?;
    let peer = state
        .binding
        .bind(
            &subject(&headers),
            &body.channel_id,
            &body.peer_id,
            role,
            &body.peer_url,
        )
        .await
        .map_err(reject)?;
    Ok(Json(ApiResponse::success(PeerData { peer })))
}

/// POST /v1/slots/unbind
pub async fn unbind<S: ChannelStorage, W: WorkflowApi>(
    State(state): State<AppState<S, W>>,
    headers: HeaderMap,
    Json(body): Json<UnbindBody>,
) -> ApiResult<()> {
    state
        .binding
        .unbind(&subject(&headers), &body.channel_id, &body.peer_id)
        .await
        .map_err(reject)?;
    Ok(Json(ApiResponse::success(())))
}

/// POST /v1/slots/transfer_completed
pub async fn transfer_completed<S: ChannelStorage, W: WorkflowApi>(
    State(state): State<AppState<S, W>>,
    headers: HeaderMap,
    Json(body): Json<TransferReportBody>,
) -> ApiResult<()> {
    state
        .binding
        .transfer_completed(
            &subject(&headers),
            &body.channel_id,
            &body.producer_peer_id,
            &body.consumer_peer_id,
        )
        .await
        .map_err(reject)?;
    Ok(Json(ApiResponse::success(())))
}

/// POST /v1/slots/transfer_failed
pub async fn transfer_failed<S: ChannelStorage, W: WorkflowApi>(
    State(state): State<AppState<S, W>>,
    headers: HeaderMap,
    Json(body): Json<TransferReportBody>,
) -> ApiResult<PeerData> {
    let peer = state
        .binding
        .transfer_failed(
            &subject(&headers),
            &body.channel_id,
            &body.producer_peer_id,
            &body.consumer_peer_id,
            &body.reason,
        )
        .await
        .map_err(reject)?;
    Ok(Json(ApiResponse::success(PeerData { peer })))
}

/// POST /v1/channels/destroy
pub async fn destroy<S: ChannelStorage, W: WorkflowApi>(
    State(state): State<AppState<S, W>>,
    headers: HeaderMap,
    Json(body): Json<DestroyBody>,
) -> ApiResult<()> {
    state
        .binding
        .destroy(&subject(&headers), &body.channel_id, &body.reason)
        .await
        .map_err(reject)?;
    Ok(Json(ApiResponse::success(())))
}

/// POST /v1/channels/destroy_all
pub async fn destroy_all<S: ChannelStorage, W: WorkflowApi>(
    State(state): State<AppState<S, W>>,
    headers: HeaderMap,
    Json(body): Json<DestroyAllBody>,
) -> ApiResult<()> {
    state
        .binding
        .destroy_all(&subject(&headers), &body.execution_id, &body.reason)
        .await
        .map_err(reject)?;
    Ok(Json(ApiResponse::success(())))
}

/// GET /v1/channels/status
pub async fn channels_status<S: ChannelStorage, W: WorkflowApi>(
    State(state): State<AppState<S, W>>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> ApiResult<StatusData> {
    let channels = state
        .binding
        .channels_status(&subject(&headers), &query.execution_id, &query.ids())
        .await
        .map_err(reject)?;
    Ok(Json(ApiResponse::success(StatusData {
        channels: channels.into_iter().map(Into::into).collect(),
    })))
}

/// GET /health
pub async fn health() -> Json<ApiResponse<HealthData>> {
    Json(ApiResponse::success(HealthData {
        timestamp_ms: Utc::now().timestamp_millis(),
    }))
}
