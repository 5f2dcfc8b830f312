//! In-memory channel storage for tests and local development.
//!
//! A single tokio mutex guards the whole state. `begin` takes the lock
//! and snapshots the state; dropping the handle without `commit` restores
//! the snapshot, which mirrors transaction rollback closely enough for
//! the service layer. Plain read methods (`get_channel`, `get_peer`,
//! `list_*`) take the same mutex, so callers must not invoke them while
//! holding an open transaction.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::ChannelError;
use crate::model::{Channel, ChannelStatus, Peer, PendingTransfer, Priority, Role};
use crate::storage::ChannelStorage;

#[derive(Debug, Clone, Default)]
struct MemState {
    channels: Vec<Channel>,
    peers: Vec<Peer>,
    // (producer_id, consumer_id, channel_id), insertion-ordered
    pending: Vec<(String, String, String)>,
}

impl MemState {
    fn drop_channel(&mut self, channel_id: &str) -> bool {
        let before = self.channels.len();
        self.channels.retain(|c| c.id != channel_id);
        self.peers.retain(|p| p.channel_id != channel_id);
        self.pending.retain(|(_, _, ch)| ch != channel_id);
        self.channels.len() < before
    }
}

pub struct MemTx {
    guard: OwnedMutexGuard<MemState>,
    snapshot: MemState,
    committed: bool,
}

impl Drop for MemTx {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = std::mem::take(&mut self.snapshot);
        }
    }
}

#[derive(Default)]
pub struct MemStorage {
    state: Arc<Mutex<MemState>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStorage for MemStorage {
    type Tx = MemTx;

    async fn begin(&self) -> Result<Self::Tx, ChannelError> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(MemTx {
            guard,
            snapshot,
            committed: false,
        })
    }

    async fn commit(&self, mut tx: Self::Tx) -> Result<(), ChannelError> {
        tx.committed = true;
        Ok(())
    }

    async fn create_channel(
        &self,
        tx: &mut Self::Tx,
        channel: &Channel,
    ) -> Result<bool, ChannelError> {
        let duplicate = tx.guard.channels.iter().any(|c| {
            c.owner_id == channel.owner_id
                && c.execution_id == channel.execution_id
                && c.storage_producer_uri == channel.storage_producer_uri
                && c.storage_consumer_uri == channel.storage_consumer_uri
        });
        if duplicate {
            return Ok(false);
        }
        tx.guard.channels.push(channel.clone());
        Ok(true)
    }

    async fn find_channel(
        &self,
        tx: &mut Self::Tx,
        owner_id: &str,
        execution_id: &str,
        storage_producer_uri: Option<&str>,
        storage_consumer_uri: Option<&str>,
    ) -> Result<Option<Channel>, ChannelError> {
        Ok(tx
            .guard
            .channels
            .iter()
            .find(|c| {
                c.owner_id == owner_id
                    && c.execution_id == execution_id
                    && c.storage_producer_uri.as_deref() == storage_producer_uri
                    && c.storage_consumer_uri.as_deref() == storage_consumer_uri
            })
            .cloned())
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, ChannelError> {
        let state = self.state.lock().await;
        Ok(state.channels.iter().find(|c| c.id == channel_id).cloned())
    }

    async fn drop_channel(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
    ) -> Result<bool, ChannelError> {
        Ok(tx.guard.drop_channel(channel_id))
    }

    async fn drop_all(&self, tx: &mut Self::Tx, execution_id: &str) -> Result<u64, ChannelError> {
        let ids: Vec<String> = tx
            .guard
            .channels
            .iter()
            .filter(|c| c.execution_id == execution_id)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            tx.guard.drop_channel(id);
        }
        Ok(ids.len() as u64)
    }

    async fn list_channels(
        &self,
        execution_id: &str,
        ids_filter: &[String],
    ) -> Result<Vec<ChannelStatus>, ChannelError> {
        let state = self.state.lock().await;
        let statuses = state
            .channels
            .iter()
            .filter(|c| {
                c.execution_id == execution_id
                    && (ids_filter.is_empty() || ids_filter.contains(&c.id))
            })
            .map(|channel| {
                let mut producers = Vec::new();
                let mut consumers = Vec::new();
                for peer in state.peers.iter().filter(|p| p.channel_id == channel.id) {
                    match peer.role {
                        Role::Producer => producers.push(peer.description.clone()),
                        Role::Consumer => consumers.push(peer.description.clone()),
                    }
                }
                ChannelStatus {
                    channel: channel.clone(),
                    producers,
                    consumers,
                }
            })
            .collect();
        Ok(statuses)
    }

    async fn create_peer(&self, tx: &mut Self::Tx, peer: &Peer) -> Result<(), ChannelError> {
        tx.guard.peers.push(peer.clone());
        Ok(())
    }

    async fn get_peer(
        &self,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<Option<Peer>, ChannelError> {
        let state = self.state.lock().await;
        Ok(state
            .peers
            .iter()
            .find(|p| p.channel_id == channel_id && p.id == peer_id)
            .cloned())
    }

    async fn find_prior_producer(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
    ) -> Result<Option<Peer>, ChannelError> {
        let best = tx
            .guard
            .peers
            .iter()
            .filter(|p| {
                p.channel_id == channel_id && p.role == Role::Producer && p.priority.is_usable()
            })
            .map(|p| p.priority.value())
            .max();
        let Some(best) = best else {
            return Ok(None);
        };
        let candidates: Vec<&Peer> = tx
            .guard
            .peers
            .iter()
            .filter(|p| {
                p.channel_id == channel_id
                    && p.role == Role::Producer
                    && p.priority.value() == best
            })
            .collect();
        Ok(candidates.choose(&mut rand::thread_rng()).map(|p| (*p).clone()))
    }

    async fn mark_consumers_connected(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
    ) -> Result<Vec<Peer>, ChannelError> {
        let mut claimed = Vec::new();
        for peer in tx.guard.peers.iter_mut() {
            if peer.channel_id == channel_id && peer.role == Role::Consumer && !peer.connected {
                peer.connected = true;
                claimed.push(peer.clone());
            }
        }
        Ok(claimed)
    }

    async fn decrement_priority(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<Priority, ChannelError> {
        let peer = tx
            .guard
            .peers
            .iter_mut()
            .find(|p| p.channel_id == channel_id && p.id == peer_id)
            .ok_or_else(|| ChannelError::PeerNotFound(peer_id.to_string()))?;
        peer.priority = peer.priority.decremented();
        Ok(peer.priority)
    }

    async fn drop_peer(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<bool, ChannelError> {
        let before = tx.guard.peers.len();
        tx.guard
            .peers
            .retain(|p| !(p.channel_id == channel_id && p.id == peer_id));
        tx.guard.pending.retain(|(prod, cons, ch)| {
            !(ch == channel_id && (prod == peer_id || cons == peer_id))
        });
        Ok(tx.guard.peers.len() < before)
    }

    async fn create_pending_transfer(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        producer_id: &str,
        consumer_id: &str,
    ) -> Result<(), ChannelError> {
        let row = (
            producer_id.to_string(),
            consumer_id.to_string(),
            channel_id.to_string(),
        );
        if !tx.guard.pending.contains(&row) {
            tx.guard.pending.push(row);
        }
        Ok(())
    }

    async fn delete_pending_transfer(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        producer_id: &str,
        consumer_id: &str,
    ) -> Result<bool, ChannelError> {
        let before = tx.guard.pending.len();
        tx.guard.pending.retain(|(prod, cons, ch)| {
            !(prod == producer_id && cons == consumer_id && ch == channel_id)
        });
        Ok(tx.guard.pending.len() < before)
    }

    async fn has_pending_transfers(
        &self,
        tx: &mut Self::Tx,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<bool, ChannelError> {
        Ok(tx
            .guard
            .pending
            .iter()
            .any(|(prod, cons, ch)| ch == channel_id && (prod == peer_id || cons == peer_id)))
    }

    async fn list_pending_transfers(&self) -> Result<Vec<PendingTransfer>, ChannelError> {
        let state = self.state.lock().await;
        let mut transfers = Vec::with_capacity(state.pending.len());
        for (producer_id, consumer_id, channel_id) in &state.pending {
            let find = |peer_id: &str| {
                state
                    .peers
                    .iter()
                    .find(|p| p.channel_id == *channel_id && p.id == peer_id)
                    .cloned()
            };
            // Skip rows whose peers vanished mid-flight; postgres FKs
            // make this impossible there
            if let (Some(producer), Some(consumer)) = (find(producer_id), find(consumer_id)) {
                transfers.push(PendingTransfer {
                    channel_id: channel_id.clone(),
                    producer,
                    consumer,
                });
            }
        }
        Ok(transfers)
    }
}
