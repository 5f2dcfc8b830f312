//! Error types for the channel service.

use thiserror::Error;

/// Service-level error taxonomy.
///
/// Error codes are stable strings used in API responses; HTTP mapping
/// lives next to them so the gateway never invents its own.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    // === Validation errors ===
    #[error("Missing or invalid request field: {0}")]
    InvalidArgument(String),

    #[error("Request is not authenticated")]
    Unauthorized,

    #[error("Operation not permitted: {0}")]
    PermissionDenied(String),

    // === State errors ===
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Peer has active transfers: {0}")]
    PeerBusy(String),

    #[error("Channel was aborted: {0}")]
    Aborted(String),

    // === System errors ===
    #[error("Database error: {message}")]
    Database { message: String, transient: bool },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChannelError {
    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ChannelError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ChannelError::Unauthorized => "UNAUTHORIZED",
            ChannelError::PermissionDenied(_) => "PERMISSION_DENIED",
            ChannelError::ChannelNotFound(_) => "CHANNEL_NOT_FOUND",
            ChannelError::PeerNotFound(_) => "PEER_NOT_FOUND",
            ChannelError::PeerBusy(_) => "PEER_BUSY",
            ChannelError::Aborted(_) => "ABORTED",
            ChannelError::Database { .. } => "DATABASE_ERROR",
            ChannelError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status mapping used by the gateway.
    pub fn http_status(&self) -> u16 {
        match self {
            ChannelError::InvalidArgument(_) => 400,
            ChannelError::Unauthorized => 401,
            ChannelError::PermissionDenied(_) => 403,
            ChannelError::ChannelNotFound(_) | ChannelError::PeerNotFound(_) => 404,
            ChannelError::PeerBusy(_) => 409,
            ChannelError::Aborted(_) => 410,
            ChannelError::Database { .. } | ChannelError::Internal(_) => 500,
        }
    }

    /// Transient infrastructure failure, safe to retry as a whole unit.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Database { transient: true, .. })
    }
}

impl From<sqlx::Error> for ChannelError {
    fn from(e: sqlx::Error) -> Self {
        let transient = matches!(
            e,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
        );
        ChannelError::Database {
            message: e.to_string(),
            transient,
        }
    }
}

impl From<anyhow::Error> for ChannelError {
    fn from(e: anyhow::Error) -> Self {
        ChannelError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Internal(format!("peer description encoding: {e}"))
    }
}
