//! API request/response types.
//!
//! All responses use the same envelope: `code` is `"OK"` on success or a
//! stable error code string, `data` is present only on success.

use serde::{Deserialize, Serialize};

use crate::model::{ChannelStatus, DataScheme, PeerDescription};

/// Unified API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: &'static str,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: "OK",
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: &'static str, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

// --- Requests ---

#[derive(Debug, Deserialize)]
pub struct GetOrCreateBody {
    pub execution_id: String,
    pub workflow_name: String,
    #[serde(default)]
    pub data_scheme: Option<DataScheme>,
    #[serde(default)]
    pub storage_producer_uri: Option<String>,
    #[serde(default)]
    pub storage_consumer_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BindBody {
    pub channel_id: String,
    pub peer_id: String,
    /// "PRODUCER" or "CONSUMER"
    pub role: String,
    pub peer_url: String,
}

#[derive(Debug, Deserialize)]
pub struct UnbindBody {
    pub channel_id: String,
    pub peer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferReportBody {
    pub channel_id: String,
    pub producer_peer_id: String,
    pub consumer_peer_id: String,
    /// Only meaningful for failure reports
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct DestroyBody {
    pub channel_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct DestroyAllBody {
    pub execution_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub execution_id: String,
    /// Comma-separated channel ids; empty means all
    #[serde(default)]
    pub channel_ids: String,
}

impl StatusQuery {
    pub fn ids(&self) -> Vec<String> {
        self.channel_ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

// --- Responses ---

#[derive(Debug, Serialize)]
pub struct ChannelIdData {
    pub channel_id: String,
}

#[derive(Debug, Serialize)]
pub struct PeerData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerDescription>,
}

#[derive(Debug, Serialize)]
pub struct ChannelStatusData {
    pub channel_id: String,
    pub execution_id: String,
    pub workflow_name: String,
    pub producers: Vec<PeerDescription>,
    pub consumers: Vec<PeerDescription>,
}

impl From<ChannelStatus> for ChannelStatusData {
    fn from(status: ChannelStatus) -> Self {
        Self {
            channel_id: status.channel.id,
            execution_id: status.channel.execution_id,
            workflow_name: status.channel.workflow_name,
            producers: status.producers,
            consumers: status.consumers,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub channels: Vec<ChannelStatusData>,
}

#[derive(Debug, Serialize)]
pub struct HealthData {
    pub timestamp_ms: i64,
}
