//! Persistence seam for channels, peers and pending transfers.
//!
//! The service layer only talks to [`ChannelStorage`]; production wires
//! in [`postgres::PgStorage`], tests use [`memory::MemStorage`].

pub mod memory;
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::model::{Channel, ChannelStatus, Peer, PendingTransfer, Priority};

/// Storage abstraction over the channel database.
///
/// Multi-statement operations run inside an explicit transaction handle:
/// `begin` hands one out, `commit` finalizes it, and dropping an
/// uncommitted handle rolls the unit back.
#[async_trait]
pub trait ChannelStorage: Send + Sync + 'static {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, ChannelError>;
    async fn commit(&self, tx: Self::Tx) -> Result<(), ChannelError>;

    // === Channels ===

    /// Insert a channel. Returns false without inserting when a channel
    /// with the same logical key already exists, which happens when two
    /// creates race past each other's `find_channel`.
    async fn create_channel(
        &self,
        tx: &mut Self::Tx,
        channel: &Channel,
    ) -> Result<bool, ChannelError>;

    /// Lookup by logical key. NULL storage URIs match NULL, not "anything".
    async fn find_channel(
        &self,
        tx: &mut Self::Tx,
        owner_id: &str,
        execution_id: &str,
        storage_producer_uri: Option<&str>,
        storage_consumer_uri: Option<&str>,
    ) -> Result<Option<Channel>, ChannelError>;

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, ChannelError>;

    /// Drop a channel with all its peers and pending transfers.
    /// Returns false when the channel was already gone.
    async fn drop_channel(&self, tx: &mut Self::Tx, channel_id: &str)
    -> Result<bool, ChannelError>;

    /// Drop every channel of an execution. Returns the number dropped.
    async fn drop_all(&self, tx: &mut Self::Tx, execution_id: &str) -> Result<u64, ChannelError>;

    /// Channels of an execution with materialized peer descriptions.
    /// An empty `ids_filter` means no filtering.
    async fn list_channels(
        &self,
        execution_id: &str,
        ids_filter: &[String],
    ) -> Result<Vec<ChannelStatus>, ChannelError>;

    // === Peers ===
    async fn create_peer(&self, tx: &mut Self::Tx, peer: &Peer) -> Result<(), ChannelError>;

    async fn get_peer(
        &self,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<Option<Peer>, ChannelError>;

    /// Best usable producer of the channel: highest priority, uniform
    /// random among ties. None when every producer is excluded.
    async fn find_prior_producer(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
    ) -> Result<Option<Peer>, ChannelError>;

    /// Atomically claim every not-yet-connected consumer of the channel
    /// and return the claimed rows.
    async fn mark_consumers_connected(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
    ) -> Result<Vec<Peer>, ChannelError>;

    /// Move a peer one priority level down and return the new level.
    async fn decrement_priority(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<Priority, ChannelError>;

    /// Returns false when the peer was already gone.
    async fn drop_peer(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<bool, ChannelError>;

    // === Pending transfers ===
    async fn create_pending_transfer(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        producer_id: &str,
        consumer_id: &str,
    ) -> Result<(), ChannelError>;

    /// Returns true when a row was actually deleted.
    async fn delete_pending_transfer(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        producer_id: &str,
        consumer_id: &str,
    ) -> Result<bool, ChannelError>;

    /// Whether the peer participates in any pending transfer, on either side.
    async fn has_pending_transfers(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<bool, ChannelError>;

    /// Every outstanding transfer with both peers joined, for startup replay.
    async fn list_pending_transfers(&self) -> Result<Vec<PendingTransfer>, ChannelError>;
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Run a complete storage unit, retrying transient infrastructure
/// failures. Each unit must be one whole (idempotent) transaction so a
/// retry re-runs it from scratch.
pub async fn with_retries<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, ChannelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(
                    op = op_name,
                    attempt,
                    error = %e,
                    "Transient storage failure, retrying"
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient(msg: &str) -> ChannelError {
        ChannelError::Database {
            message: msg.into(),
            transient: true,
        }
    }

    #[tokio::test]
    async fn test_with_retries_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = with_retries("unit", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(transient("connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("unit", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient("still down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_with_retries_does_not_retry_domain_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("unit", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChannelError::ChannelNotFound("ch".into())) }
        })
        .await;
        assert!(matches!(result, Err(ChannelError::ChannelNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
