//! Transfer coordinator.
//!
//! Binding handlers must not block on outbound slot calls, so transfer
//! instructions are queued and a small pool of worker tasks delivers them.
//! Delivery is at-least-once: pending rows survive restarts and are
//! replayed by [`TransferCoordinator::restore_actions`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::abort::AbortEscalator;
use crate::config::CoordinatorConfig;
use crate::error::ChannelError;
use crate::model::PeerDescription;
use crate::slots::SlotsApi;
use crate::storage::{ChannelStorage, with_retries};
use crate::workflow::WorkflowApi;

/// One "tell this consumer to pull from this producer" instruction.
#[derive(Debug, Clone)]
pub struct TransferAction {
    pub channel_id: String,
    pub producer: PeerDescription,
    pub consumer_id: String,
    pub consumer_url: String,
}

pub struct TransferCoordinator<S: ChannelStorage> {
    queue: mpsc::Sender<TransferAction>,
    storage: Arc<S>,
}

struct Worker<S: ChannelStorage, A: SlotsApi, W: WorkflowApi> {
    storage: Arc<S>,
    slots: Arc<A>,
    escalator: Arc<AbortEscalator<S, W>>,
    delivery_attempts: u32,
    retry_backoff: Duration,
}

impl<S: ChannelStorage> TransferCoordinator<S> {
    /// Create the coordinator and spawn its worker pool.
    pub fn start<A: SlotsApi, W: WorkflowApi>(
        config: &CoordinatorConfig,
        storage: Arc<S>,
        slots: Arc<A>,
        escalator: Arc<AbortEscalator<S, W>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<TransferAction>(config.queue_size);
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..config.workers.max(1) {
            let worker = Worker {
                storage: storage.clone(),
                slots: slots.clone(),
                escalator: escalator.clone(),
                delivery_attempts: config.delivery_attempts.max(1),
                retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            };
            let rx = rx.clone();
            tokio::spawn(async move {
                debug!(worker_id, "Transfer worker started");
                loop {
                    let action = { rx.lock().await.recv().await };
                    match action {
                        Some(action) => worker.deliver(action).await,
                        None => break,
                    }
                }
                debug!(worker_id, "Transfer worker stopped");
            });
        }

        info!(
            workers = config.workers.max(1),
            queue_size = config.queue_size,
            "Transfer coordinator started"
        );
        Self { queue: tx, storage }
    }

    /// Enqueue an instruction for delivery.
    pub async fn schedule(&self, action: TransferAction) {
        debug!(
            channel_id = %action.channel_id,
            producer = %action.producer.peer_id,
            consumer = %action.consumer_id,
            "Scheduling transfer instruction"
        );
        if self.queue.send(action).await.is_err() {
            error!("Transfer queue closed, instruction dropped");
        }
    }

    /// Replay every outstanding pending transfer. Called once at startup;
    /// slot-side idempotency makes duplicate delivery harmless.
    pub async fn restore_actions(&self) -> Result<usize, ChannelError> {
        let pending = self.storage.list_pending_transfers().await?;
        let mut restored = 0;
        for transfer in pending {
            // Storage-backed consumers have no endpoint to instruct; their
            // rows resolve through transfer_completed/transfer_failed
            let Some(consumer_url) = transfer.consumer.description.slot_url() else {
                continue;
            };
            self.schedule(TransferAction {
                channel_id: transfer.channel_id.clone(),
                producer: transfer.producer.description.clone(),
                consumer_id: transfer.consumer.id.clone(),
                consumer_url: consumer_url.to_string(),
            })
            .await;
            restored += 1;
        }
        if restored > 0 {
            info!(count = restored, "Restored pending transfer instructions");
        }
        Ok(restored)
    }
}

impl<S: ChannelStorage, A: SlotsApi, W: WorkflowApi> Worker<S, A, W> {
    async fn deliver(&self, action: TransferAction) {
        let mut attempt = 1;
        loop {
            match self
                .slots
                .start_transfer(&action.consumer_url, &action.producer)
                .await
            {
                Ok(()) => {
                    debug!(
                        channel_id = %action.channel_id,
                        consumer = %action.consumer_id,
                        "Transfer instruction delivered"
                    );
                    self.resolve_pending(&action).await;
                    return;
                }
                Err(e) if attempt < self.delivery_attempts => {
                    warn!(
                        channel_id = %action.channel_id,
                        consumer = %action.consumer_id,
                        attempt,
                        error = %e,
                        "Transfer instruction delivery failed, will retry"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        channel_id = %action.channel_id,
                        consumer = %action.consumer_id,
                        error = %e,
                        "Transfer instruction undeliverable, escalating"
                    );
                    self.escalator
                        .abort(&action.channel_id, "cannot deliver transfer instruction")
                        .await;
                    return;
                }
            }
        }
    }

    /// Delete the pending row behind a delivered instruction. A racing
    /// transfer_completed/transfer_failed report makes this a no-op.
    async fn resolve_pending(&self, action: &TransferAction) {
        let result = with_retries("resolve_pending", || async move {
            let mut tx = self.storage.begin().await?;
            let deleted = self
                .storage
                .delete_pending_transfer(
                    &mut tx,
                    &action.channel_id,
                    &action.producer.peer_id,
                    &action.consumer_id,
                )
                .await?;
            self.storage.commit(tx).await?;
            Ok(deleted)
        })
        .await;

        match result {
            Ok(true) => {}
            Ok(false) => debug!(
                channel_id = %action.channel_id,
                consumer = %action.consumer_id,
                "Pending transfer already resolved"
            ),
            Err(e) => error!(
                channel_id = %action.channel_id,
                error = %e,
                "Failed to resolve pending transfer"
            ),
        }
    }
}
