//! Binding service: the public operations of the channel service.
//!
//! Every operation is access-checked against the workflow control plane,
//! then runs as one retried storage transaction. Outbound slot calls
//! never happen inside a handler; they go through the coordinator queue.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::abort::AbortEscalator;
use crate::coordinator::{TransferAction, TransferCoordinator};
use crate::error::ChannelError;
use crate::model::{
    Channel, ChannelStatus, DataScheme, Peer, PeerDescription, Priority, Role, generate_id,
};
use crate::storage::{ChannelStorage, with_retries};
use crate::workflow::{Permission, WorkflowApi};

#[derive(Debug, Clone)]
pub struct GetOrCreateRequest {
    pub execution_id: String,
    pub workflow_name: String,
    pub data_scheme: Option<DataScheme>,
    /// Storage location data is produced from (channel input).
    pub storage_producer_uri: Option<String>,
    /// Storage location data is consumed into (channel output).
    pub storage_consumer_uri: Option<String>,
}

pub struct BindingService<S: ChannelStorage, W: WorkflowApi> {
    storage: Arc<S>,
    workflow: Arc<W>,
    coordinator: Arc<TransferCoordinator<S>>,
    escalator: Arc<AbortEscalator<S, W>>,
}

impl<S: ChannelStorage, W: WorkflowApi> BindingService<S, W> {
    pub fn new(
        storage: Arc<S>,
        workflow: Arc<W>,
        coordinator: Arc<TransferCoordinator<S>>,
        escalator: Arc<AbortEscalator<S, W>>,
    ) -> Self {
        Self {
            storage,
            workflow,
            coordinator,
            escalator,
        }
    }

    /// Find or create the channel for a logical key. Idempotent: repeated
    /// calls with the same key return the same channel id.
    pub async fn get_or_create(
        &self,
        subject_id: &str,
        req: GetOrCreateRequest,
    ) -> Result<String, ChannelError> {
        let storage_side = match (&req.storage_producer_uri, &req.storage_consumer_uri) {
            (Some(uri), None) => (Role::Producer, uri.clone()),
            (None, Some(uri)) => (Role::Consumer, uri.clone()),
            _ => {
                return Err(ChannelError::InvalidArgument(
                    "exactly one of storage_producer_uri / storage_consumer_uri required".into(),
                ));
            }
        };
        self.check_access(subject_id, subject_id, &req.workflow_name, Permission::WorkflowManage)
            .await?;

        let owner_id = subject_id.to_string();
        let channel_id = with_retries("get_or_create", || {
            let req = req.clone();
            let owner_id = owner_id.clone();
            let storage_side = storage_side.clone();
            async move {
                let mut tx = self.storage.begin().await?;
                if let Some(existing) = self
                    .storage
                    .find_channel(
                        &mut tx,
                        &owner_id,
                        &req.execution_id,
                        req.storage_producer_uri.as_deref(),
                        req.storage_consumer_uri.as_deref(),
                    )
                    .await?
                {
                    self.storage.commit(tx).await?;
                    return Ok(existing.id);
                }

                let channel = Channel {
                    id: generate_id("channel"),
                    owner_id,
                    execution_id: req.execution_id.clone(),
                    workflow_name: req.workflow_name.clone(),
                    data_scheme: req.data_scheme.clone(),
                    storage_producer_uri: req.storage_producer_uri.clone(),
                    storage_consumer_uri: req.storage_consumer_uri.clone(),
                    created_at: Utc::now(),
                };
                if !self.storage.create_channel(&mut tx, &channel).await? {
                    // Lost a create race: another call with this key
                    // committed between our lookup and insert
                    let winner = self
                        .storage
                        .find_channel(
                            &mut tx,
                            &channel.owner_id,
                            &req.execution_id,
                            req.storage_producer_uri.as_deref(),
                            req.storage_consumer_uri.as_deref(),
                        )
                        .await?
                        .ok_or_else(|| {
                            ChannelError::Internal("channel insert conflicted with no winner".into())
                        })?;
                    self.storage.commit(tx).await?;
                    return Ok(winner.id);
                }

                // The storage side joins immediately as a peer; Backup so a
                // live producer slot always wins selection over re-reading
                // from storage
                let (role, uri) = storage_side;
                let peer_id = generate_id("peer");
                let storage_peer = Peer {
                    id: peer_id.clone(),
                    channel_id: channel.id.clone(),
                    role,
                    description: PeerDescription::storage(peer_id, uri),
                    priority: Priority::Backup,
                    connected: false,
                    created_at: Utc::now(),
                };
                self.storage.create_peer(&mut tx, &storage_peer).await?;
                self.storage.commit(tx).await?;

                info!(
                    channel_id = %channel.id,
                    execution_id = %channel.execution_id,
                    "Channel created"
                );
                Ok(channel.id)
            }
        })
        .await?;
        Ok(channel_id)
    }

    /// Register a slot peer. For consumers, returns the producer to pull
    /// from (None when no producer exists yet). For producers, returns the
    /// storage-backed consumer the producer must itself push to, if one
    /// was claimed.
    pub async fn bind(
        &self,
        subject_id: &str,
        channel_id: &str,
        peer_id: &str,
        role: Role,
        peer_url: &str,
    ) -> Result<Option<PeerDescription>, ChannelError> {
        if peer_id.is_empty() || peer_url.is_empty() {
            return Err(ChannelError::InvalidArgument(
                "peer_id and peer_url required".into(),
            ));
        }
        self.load_checked(subject_id, channel_id, Permission::WorkflowRun)
            .await?;

        match role {
            Role::Consumer => self.bind_consumer(channel_id, peer_id, peer_url).await,
            Role::Producer => self.bind_producer(channel_id, peer_id, peer_url).await,
        }
    }

    async fn bind_consumer(
        &self,
        channel_id: &str,
        peer_id: &str,
        peer_url: &str,
    ) -> Result<Option<PeerDescription>, ChannelError> {
        let producer = with_retries("bind_consumer", || async move {
            let mut tx = self.storage.begin().await?;
            let producer = self.storage.find_prior_producer(&mut tx, channel_id).await?;
            let consumer = Peer {
                id: peer_id.to_string(),
                channel_id: channel_id.to_string(),
                role: Role::Consumer,
                description: PeerDescription::slot(peer_id, peer_url),
                priority: Priority::Primary,
                // No producer yet: stays unconnected so the first producer
                // bind claims it
                connected: producer.is_some(),
                created_at: Utc::now(),
            };
            self.storage.create_peer(&mut tx, &consumer).await?;
            self.storage.commit(tx).await?;
            Ok(producer)
        })
        .await?;

        info!(
            channel_id,
            peer_id,
            has_producer = producer.is_some(),
            "Consumer bound"
        );
        Ok(producer.map(|p| p.description))
    }

    async fn bind_producer(
        &self,
        channel_id: &str,
        peer_id: &str,
        peer_url: &str,
    ) -> Result<Option<PeerDescription>, ChannelError> {
        let claimed = with_retries("bind_producer", || async move {
            let mut tx = self.storage.begin().await?;
            let producer = Peer {
                id: peer_id.to_string(),
                channel_id: channel_id.to_string(),
                role: Role::Producer,
                description: PeerDescription::slot(peer_id, peer_url),
                priority: Priority::Primary,
                connected: false,
                created_at: Utc::now(),
            };
            self.storage.create_peer(&mut tx, &producer).await?;
            let claimed = self.storage.mark_consumers_connected(&mut tx, channel_id).await?;
            for consumer in &claimed {
                self.storage
                    .create_pending_transfer(&mut tx, channel_id, peer_id, &consumer.id)
                    .await?;
            }
            self.storage.commit(tx).await?;
            Ok(claimed)
        })
        .await?;

        info!(channel_id, peer_id, claimed = claimed.len(), "Producer bound");

        // Slot consumers get the instruction pushed; a storage consumer has
        // no endpoint, the producer pushes to it directly
        let mut storage_consumer = None;
        for consumer in claimed {
            match consumer.description.slot_url().map(String::from) {
                Some(url) => {
                    self.coordinator
                        .schedule(TransferAction {
                            channel_id: channel_id.to_string(),
                            producer: PeerDescription::slot(peer_id, peer_url),
                            consumer_id: consumer.id.clone(),
                            consumer_url: url,
                        })
                        .await;
                }
                None => storage_consumer = Some(consumer.description),
            }
        }
        Ok(storage_consumer)
    }

    /// Remove a peer. Refused while the peer still has pending transfers.
    pub async fn unbind(
        &self,
        subject_id: &str,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<(), ChannelError> {
        self.load_checked(subject_id, channel_id, Permission::WorkflowRun)
            .await?;

        with_retries("unbind", || async move {
            let mut tx = self.storage.begin().await?;
            if self
                .storage
                .has_pending_transfers(&mut tx, channel_id, peer_id)
                .await?
            {
                return Err(ChannelError::PeerBusy(peer_id.to_string()));
            }
            // Unknown peer: already unbound, idempotent
            self.storage.drop_peer(&mut tx, channel_id, peer_id).await?;
            self.storage.commit(tx).await?;
            Ok(())
        })
        .await?;

        info!(channel_id, peer_id, "Peer unbound");
        Ok(())
    }

    /// A consumer finished pulling from a producer.
    pub async fn transfer_completed(
        &self,
        subject_id: &str,
        channel_id: &str,
        producer_peer_id: &str,
        consumer_peer_id: &str,
    ) -> Result<(), ChannelError> {
        self.load_checked(subject_id, channel_id, Permission::WorkflowRun)
            .await?;
        let (_, consumer) = self
            .load_pair(channel_id, producer_peer_id, consumer_peer_id)
            .await?;

        with_retries("transfer_completed", || {
            let consumer = consumer.clone();
            async move {
                let mut tx = self.storage.begin().await?;
                self.storage
                    .delete_pending_transfer(&mut tx, channel_id, producer_peer_id, consumer_peer_id)
                    .await?;

                if consumer.description.is_storage() {
                    // Durable data: the storage location becomes a future
                    // source for late consumers
                    self.storage
                        .drop_peer(&mut tx, channel_id, &consumer.id)
                        .await?;
                    let promoted = Peer {
                        role: Role::Producer,
                        priority: Priority::Backup,
                        connected: false,
                        created_at: Utc::now(),
                        ..consumer
                    };
                    self.storage.create_peer(&mut tx, &promoted).await?;
                }
                self.storage.commit(tx).await?;
                Ok(())
            }
        })
        .await?;

        info!(
            channel_id,
            producer = producer_peer_id,
            consumer = consumer_peer_id,
            "Transfer completed"
        );
        Ok(())
    }

    /// A consumer failed pulling from a producer. For live consumers the
    /// reply carries the replacement producer to re-pull from; a missing
    /// replacement or a failed storage write kills the whole execution.
    pub async fn transfer_failed(
        &self,
        subject_id: &str,
        channel_id: &str,
        producer_peer_id: &str,
        consumer_peer_id: &str,
        reason: &str,
    ) -> Result<Option<PeerDescription>, ChannelError> {
        self.load_checked(subject_id, channel_id, Permission::WorkflowRun)
            .await?;
        let (_, consumer) = self
            .load_pair(channel_id, producer_peer_id, consumer_peer_id)
            .await?;

        if consumer.description.is_storage() {
            with_retries("transfer_failed_storage", || async move {
                let mut tx = self.storage.begin().await?;
                self.storage
                    .delete_pending_transfer(&mut tx, channel_id, producer_peer_id, consumer_peer_id)
                    .await?;
                self.storage.commit(tx).await?;
                Ok(())
            })
            .await?;
            let abort_reason = format!("storage upload failed: {reason}");
            self.escalator.abort(channel_id, &abort_reason).await;
            return Err(ChannelError::Aborted(abort_reason));
        }

        let replacement = with_retries("transfer_failed", || async move {
            let mut tx = self.storage.begin().await?;
            self.storage
                .delete_pending_transfer(&mut tx, channel_id, producer_peer_id, consumer_peer_id)
                .await?;
            let new_priority = self
                .storage
                .decrement_priority(&mut tx, channel_id, producer_peer_id)
                .await?;
            if !new_priority.is_usable() {
                warn!(
                    channel_id,
                    peer_id = producer_peer_id,
                    "Producer permanently excluded from selection"
                );
            }
            let replacement = self.storage.find_prior_producer(&mut tx, channel_id).await?;
            self.storage.commit(tx).await?;
            Ok(replacement)
        })
        .await?;

        match replacement {
            Some(producer) => {
                info!(
                    channel_id,
                    failed = producer_peer_id,
                    replacement = %producer.id,
                    reason,
                    "Transfer failed, replacement producer selected"
                );
                Ok(Some(producer.description))
            }
            None => {
                let abort_reason = format!("no more producers in channel: {reason}");
                self.escalator.abort(channel_id, &abort_reason).await;
                Err(ChannelError::Aborted(abort_reason))
            }
        }
    }

    /// Drop one channel with everything in it. Idempotent, no workflow
    /// abort: callers destroy channels they are done with on purpose.
    pub async fn destroy(
        &self,
        subject_id: &str,
        channel_id: &str,
        reason: &str,
    ) -> Result<(), ChannelError> {
        let Some(channel) = self.storage.get_channel(channel_id).await? else {
            return Ok(());
        };
        self.check_access(
            subject_id,
            &channel.owner_id,
            &channel.workflow_name,
            Permission::WorkflowManage,
        )
        .await?;

        with_retries("destroy", || async move {
            let mut tx = self.storage.begin().await?;
            self.storage.drop_channel(&mut tx, channel_id).await?;
            self.storage.commit(tx).await?;
            Ok(())
        })
        .await?;

        info!(channel_id, reason, "Channel destroyed");
        Ok(())
    }

    /// Drop every channel of an execution.
    pub async fn destroy_all(
        &self,
        subject_id: &str,
        execution_id: &str,
        reason: &str,
    ) -> Result<(), ChannelError> {
        let channels = self.storage.list_channels(execution_id, &[]).await?;
        let Some(first) = channels.first() else {
            return Ok(());
        };
        self.check_access(
            subject_id,
            &first.channel.owner_id,
            &first.channel.workflow_name,
            Permission::WorkflowManage,
        )
        .await?;

        let dropped = with_retries("destroy_all", || async move {
            let mut tx = self.storage.begin().await?;
            let dropped = self.storage.drop_all(&mut tx, execution_id).await?;
            self.storage.commit(tx).await?;
            Ok(dropped)
        })
        .await?;

        info!(execution_id, dropped, reason, "Execution channels destroyed");
        Ok(())
    }

    /// Channels of an execution with their current peer sets.
    pub async fn channels_status(
        &self,
        subject_id: &str,
        execution_id: &str,
        channel_ids: &[String],
    ) -> Result<Vec<ChannelStatus>, ChannelError> {
        let channels = self.storage.list_channels(execution_id, channel_ids).await?;
        let Some(first) = channels.first() else {
            return Ok(Vec::new());
        };
        self.check_access(
            subject_id,
            &first.channel.owner_id,
            &first.channel.workflow_name,
            Permission::WorkflowRun,
        )
        .await?;
        Ok(channels)
    }

    async fn load_checked(
        &self,
        subject_id: &str,
        channel_id: &str,
        permission: Permission,
    ) -> Result<Channel, ChannelError> {
        let channel = self
            .storage
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_string()))?;
        self.check_access(subject_id, &channel.owner_id, &channel.workflow_name, permission)
            .await?;
        Ok(channel)
    }

    async fn check_access(
        &self,
        subject_id: &str,
        owner_id: &str,
        workflow_name: &str,
        permission: Permission,
    ) -> Result<(), ChannelError> {
        if subject_id.is_empty() {
            return Err(ChannelError::Unauthorized);
        }
        let allowed = self
            .workflow
            .check_access(subject_id, owner_id, workflow_name, permission)
            .await?;
        if !allowed {
            return Err(ChannelError::PermissionDenied(format!(
                "{subject_id} lacks {} on workflow {workflow_name}",
                permission.as_str()
            )));
        }
        Ok(())
    }

    async fn load_pair(
        &self,
        channel_id: &str,
        producer_peer_id: &str,
        consumer_peer_id: &str,
    ) -> Result<(Peer, Peer), ChannelError> {
        let producer = self
            .storage
            .get_peer(channel_id, producer_peer_id)
            .await?
            .ok_or_else(|| ChannelError::PeerNotFound(producer_peer_id.to_string()))?;
        let consumer = self
            .storage
            .get_peer(channel_id, consumer_peer_id)
            .await?
            .ok_or_else(|| ChannelError::PeerNotFound(consumer_peer_id.to_string()))?;
        Ok((producer, consumer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::slots::mock::MockSlotsApi;
    use crate::storage::memory::MemStorage;
    use crate::workflow::mock::MockWorkflowApi;
    use std::time::Duration;

    const SUBJECT: &str = "user-1";

    struct Fixture {
        storage: Arc<MemStorage>,
        slots: Arc<MockSlotsApi>,
        workflow: Arc<MockWorkflowApi>,
        service: BindingService<MemStorage, MockWorkflowApi>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemStorage::new());
        let slots = Arc::new(MockSlotsApi::new());
        let workflow = Arc::new(MockWorkflowApi::new());
        let escalator = Arc::new(AbortEscalator::new(storage.clone(), workflow.clone()));
        let coordinator = Arc::new(TransferCoordinator::start(
            &CoordinatorConfig {
                workers: 2,
                queue_size: 16,
                delivery_attempts: 2,
                retry_backoff_ms: 1,
            },
            storage.clone(),
            slots.clone(),
            escalator.clone(),
        ));
        let service = BindingService::new(
            storage.clone(),
            workflow.clone(),
            coordinator,
            escalator,
        );
        Fixture {
            storage,
            slots,
            workflow,
            service,
        }
    }

    fn input_request() -> GetOrCreateRequest {
        GetOrCreateRequest {
            execution_id: "exec-1".into(),
            workflow_name: "wf".into(),
            data_scheme: None,
            storage_producer_uri: Some("s3://bucket/in".into()),
            storage_consumer_uri: None,
        }
    }

    fn output_request() -> GetOrCreateRequest {
        GetOrCreateRequest {
            execution_id: "exec-1".into(),
            workflow_name: "wf".into(),
            data_scheme: None,
            storage_producer_uri: None,
            storage_consumer_uri: Some("s3://bucket/out".into()),
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let f = fixture();
        let id1 = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();
        let id2 = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();
        assert_eq!(id1, id2);

        // Different logical key gives a different channel
        let id3 = f.service.get_or_create(SUBJECT, output_request()).await.unwrap();
        assert_ne!(id1, id3);
    }

    #[tokio::test]
    async fn test_get_or_create_seeds_storage_peer_at_backup() {
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();

        let statuses = f.storage.list_channels("exec-1", &[]).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].channel.id, channel_id);
        assert_eq!(statuses[0].producers.len(), 1);
        assert!(statuses[0].producers[0].is_storage());

        let peer_id = &statuses[0].producers[0].peer_id;
        let peer = f.storage.get_peer(&channel_id, peer_id).await.unwrap().unwrap();
        assert_eq!(peer.priority, Priority::Backup);
    }

    #[tokio::test]
    async fn test_get_or_create_requires_exactly_one_uri() {
        let f = fixture();
        let mut both = input_request();
        both.storage_consumer_uri = Some("s3://bucket/out".into());
        let err = f.service.get_or_create(SUBJECT, both).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidArgument(_)));

        let mut neither = input_request();
        neither.storage_producer_uri = None;
        let err = f.service.get_or_create(SUBJECT, neither).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_access_denied() {
        let f = fixture();
        f.workflow.deny("intruder");
        let channel_id = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();

        let err = f
            .service
            .bind("intruder", &channel_id, "peer-x", Role::Consumer, "http://x:1")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::PermissionDenied(_)));

        let err = f
            .service
            .bind("", &channel_id, "peer-x", Role::Consumer, "http://x:1")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Unauthorized));
    }

    #[tokio::test]
    async fn test_bind_unknown_channel_is_not_found() {
        let f = fixture();
        let err = f
            .service
            .bind(SUBJECT, "channel-missing", "p", Role::Producer, "http://x:1")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn test_consumer_bind_gets_existing_producer() {
        // Channel seeded from an input storage uri: the storage peer is
        // the producer a consumer can pull from right away
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();

        let producer = f
            .service
            .bind(SUBJECT, &channel_id, "cons-1", Role::Consumer, "http://c:1")
            .await
            .unwrap();
        let producer = producer.expect("storage producer expected");
        assert!(producer.is_storage());

        let consumer = f.storage.get_peer(&channel_id, "cons-1").await.unwrap().unwrap();
        assert!(consumer.connected);
        assert_eq!(consumer.priority, Priority::Primary);
    }

    #[tokio::test]
    async fn test_early_consumer_claimed_by_producer_bind() {
        // Output channel: no producer yet, consumer waits unconnected
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, output_request()).await.unwrap();

        // The seed peer on an output channel is a storage *consumer*
        let none = f
            .service
            .bind(SUBJECT, &channel_id, "cons-1", Role::Consumer, "http://c:1")
            .await
            .unwrap();
        assert!(none.is_none());
        let consumer = f.storage.get_peer(&channel_id, "cons-1").await.unwrap().unwrap();
        assert!(!consumer.connected);

        // Producer bind claims both waiting consumers: the slot consumer
        // gets a pushed instruction, the storage consumer is surfaced
        let storage_consumer = f
            .service
            .bind(SUBJECT, &channel_id, "prod-1", Role::Producer, "http://p:1")
            .await
            .unwrap();
        assert!(storage_consumer.expect("storage consumer expected").is_storage());

        wait_for(|| f.slots.delivered_count() == 1).await;
        let (url, producer_id) = f.slots.delivered.lock().unwrap()[0].clone();
        assert_eq!(url, "http://c:1");
        assert_eq!(producer_id, "prod-1");

        let consumer = f.storage.get_peer(&channel_id, "cons-1").await.unwrap().unwrap();
        assert!(consumer.connected);

        // A second producer bind claims nothing more
        let none = f
            .service
            .bind(SUBJECT, &channel_id, "prod-2", Role::Producer, "http://p:2")
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_two_consumers_one_producer_two_pending_rows() {
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();

        // Input channel seed is a producer; bind consumers unconnected by
        // removing it first to model a bare channel
        let statuses = f.storage.list_channels("exec-1", &[]).await.unwrap();
        let seed_id = statuses[0].producers[0].peer_id.clone();
        let mut tx = f.storage.begin().await.unwrap();
        f.storage.drop_peer(&mut tx, &channel_id, &seed_id).await.unwrap();
        f.storage.commit(tx).await.unwrap();

        for (peer_id, url) in [("cons-1", "http://c:1"), ("cons-2", "http://c:2")] {
            let none = f
                .service
                .bind(SUBJECT, &channel_id, peer_id, Role::Consumer, url)
                .await
                .unwrap();
            assert!(none.is_none());
        }

        f.service
            .bind(SUBJECT, &channel_id, "prod-1", Role::Producer, "http://p:1")
            .await
            .unwrap();

        wait_for(|| f.slots.delivered_count() == 2).await;
        let delivered = f.slots.delivered.lock().unwrap().clone();
        let mut urls: Vec<_> = delivered.iter().map(|(u, _)| u.clone()).collect();
        urls.sort();
        assert_eq!(urls, vec!["http://c:1", "http://c:2"]);
    }

    #[tokio::test]
    async fn test_unbind_busy_until_transfer_resolves() {
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, output_request()).await.unwrap();
        f.service
            .bind(SUBJECT, &channel_id, "cons-1", Role::Consumer, "http://c:1")
            .await
            .unwrap();
        // Producer claims the slot consumer and the storage seed consumer
        f.service
            .bind(SUBJECT, &channel_id, "prod-1", Role::Producer, "http://p:1")
            .await
            .unwrap();

        // The worker resolves the slot consumer's row on delivery; the
        // storage seed's row stays until the producer reports completion
        wait_for(|| f.slots.delivered_count() == 1).await;

        let err = f.service.unbind(SUBJECT, &channel_id, "prod-1").await.unwrap_err();
        assert!(matches!(err, ChannelError::PeerBusy(_)));

        let statuses = f.storage.list_channels("exec-1", &[]).await.unwrap();
        let storage_seed = statuses[0]
            .consumers
            .iter()
            .find(|c| c.is_storage())
            .unwrap()
            .peer_id
            .clone();
        f.service
            .transfer_completed(SUBJECT, &channel_id, "prod-1", &storage_seed)
            .await
            .unwrap();

        // The worker deletes the delivered row shortly after pushing it
        for _ in 0..200 {
            if f.storage.list_pending_transfers().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.service.unbind(SUBJECT, &channel_id, "prod-1").await.unwrap();
        assert!(f.storage.get_peer(&channel_id, "prod-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completed_storage_consumer_becomes_backup_producer() {
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, output_request()).await.unwrap();
        f.service
            .bind(SUBJECT, &channel_id, "prod-1", Role::Producer, "http://p:1")
            .await
            .unwrap();

        let statuses = f.storage.list_channels("exec-1", &[]).await.unwrap();
        let seed_id = statuses[0].consumers[0].peer_id.clone();
        f.service
            .transfer_completed(SUBJECT, &channel_id, "prod-1", &seed_id)
            .await
            .unwrap();

        let promoted = f.storage.get_peer(&channel_id, &seed_id).await.unwrap().unwrap();
        assert_eq!(promoted.role, Role::Producer);
        assert_eq!(promoted.priority, Priority::Backup);
        assert!(promoted.description.is_storage());
    }

    #[tokio::test]
    async fn test_failed_transfer_returns_replacement_and_demotes() {
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();
        // Two live producers plus the storage seed
        f.service
            .bind(SUBJECT, &channel_id, "prod-1", Role::Producer, "http://p:1")
            .await
            .unwrap();
        f.service
            .bind(SUBJECT, &channel_id, "prod-2", Role::Producer, "http://p:2")
            .await
            .unwrap();
        f.service
            .bind(SUBJECT, &channel_id, "cons-1", Role::Consumer, "http://c:1")
            .await
            .unwrap();

        let replacement = f
            .service
            .transfer_failed(SUBJECT, &channel_id, "prod-1", "cons-1", "connection reset")
            .await
            .unwrap()
            .expect("replacement expected");
        // prod-1 dropped to Backup; the other Primary producer must win
        assert_eq!(replacement.peer_id, "prod-2");

        let demoted = f.storage.get_peer(&channel_id, "prod-1").await.unwrap().unwrap();
        assert_eq!(demoted.priority, Priority::Backup);
        assert_eq!(f.workflow.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_producer_exhaustion_aborts_workflow() {
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, output_request()).await.unwrap();
        f.service
            .bind(SUBJECT, &channel_id, "cons-1", Role::Consumer, "http://c:1")
            .await
            .unwrap();
        f.service
            .bind(SUBJECT, &channel_id, "prod-1", Role::Producer, "http://p:1")
            .await
            .unwrap();

        // Fail twice: Primary -> Backup -> Excluded, nobody left
        f.service
            .transfer_failed(SUBJECT, &channel_id, "prod-1", "cons-1", "reset")
            .await
            .unwrap();
        let err = f
            .service
            .transfer_failed(SUBJECT, &channel_id, "prod-1", "cons-1", "reset again")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Aborted(_)));

        assert_eq!(f.workflow.abort_count(), 1);
        assert!(f.storage.get_channel(&channel_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_write_failure_aborts_with_storage_reason() {
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, output_request()).await.unwrap();
        f.service
            .bind(SUBJECT, &channel_id, "prod-1", Role::Producer, "http://p:1")
            .await
            .unwrap();
        let statuses = f.storage.list_channels("exec-1", &[]).await.unwrap();
        let seed_id = statuses[0].consumers[0].peer_id.clone();

        let err = f
            .service
            .transfer_failed(SUBJECT, &channel_id, "prod-1", &seed_id, "bucket gone")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Aborted(_)));

        let aborts = f.workflow.aborts.lock().unwrap();
        assert_eq!(aborts.len(), 1);
        assert!(aborts[0].2.contains("storage upload failed"));
    }

    #[tokio::test]
    async fn test_transfer_report_unknown_peer_is_not_found() {
        let f = fixture();
        let channel_id = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();
        let err = f
            .service
            .transfer_completed(SUBJECT, &channel_id, "nope", "also-nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn test_destroy_and_destroy_all() {
        let f = fixture();
        let id1 = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();
        let id2 = f.service.get_or_create(SUBJECT, output_request()).await.unwrap();

        f.service.destroy(SUBJECT, &id1, "done").await.unwrap();
        assert!(f.storage.get_channel(&id1).await.unwrap().is_none());
        // Idempotent
        f.service.destroy(SUBJECT, &id1, "done").await.unwrap();
        // No workflow abort on explicit destroy
        assert_eq!(f.workflow.abort_count(), 0);

        f.service.destroy_all(SUBJECT, "exec-1", "teardown").await.unwrap();
        assert!(f.storage.get_channel(&id2).await.unwrap().is_none());
        f.service.destroy_all(SUBJECT, "exec-1", "teardown").await.unwrap();
    }

    #[tokio::test]
    async fn test_channels_status() {
        let f = fixture();
        let id1 = f.service.get_or_create(SUBJECT, input_request()).await.unwrap();
        let _id2 = f.service.get_or_create(SUBJECT, output_request()).await.unwrap();

        let all = f.service.channels_status(SUBJECT, "exec-1", &[]).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = f
            .service
            .channels_status(SUBJECT, "exec-1", &[id1.clone()])
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].channel.id, id1);

        // Empty result needs no access check
        let empty = f
            .service
            .channels_status("intruder", "exec-unknown", &[])
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
