//! Abort escalation.
//!
//! When the data path of a channel is unrecoverable the whole workflow
//! execution has to die: downstream graph nodes would otherwise wait
//! forever on data that can never arrive.

use std::sync::Arc;

use crate::error::ChannelError;
use crate::storage::{ChannelStorage, with_retries};
use crate::workflow::WorkflowApi;

pub struct AbortEscalator<S: ChannelStorage, W: WorkflowApi> {
    storage: Arc<S>,
    workflow: Arc<W>,
}

impl<S: ChannelStorage, W: WorkflowApi> AbortEscalator<S, W> {
    pub fn new(storage: Arc<S>, workflow: Arc<W>) -> Self {
        Self { storage, workflow }
    }

    /// Drop the channel and abort its owning workflow execution.
    ///
    /// Idempotent: a channel that is already gone (aborted concurrently,
    /// or destroyed) is a no-op. Failures of the workflow-service call are
    /// logged and swallowed; the channel drop has already committed and
    /// retrying the abort is the workflow service's problem.
    pub async fn abort(&self, channel_id: &str, reason: &str) {
        let channel = match self.storage.get_channel(channel_id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                tracing::debug!(channel_id, "Abort requested for missing channel, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(channel_id, error = %e, "Abort: failed to load channel");
                return;
            }
        };

        let dropped = match self.drop_channel(channel_id).await {
            Ok(dropped) => dropped,
            Err(e) => {
                tracing::error!(channel_id, error = %e, "Abort: failed to drop channel");
                return;
            }
        };
        if !dropped {
            tracing::debug!(channel_id, "Channel already dropped, abort is a no-op");
            return;
        }

        let correlation_id = uuid::Uuid::new_v4();
        tracing::error!(
            channel_id,
            execution_id = %channel.execution_id,
            %correlation_id,
            reason,
            "Channel unrecoverable, aborting workflow execution"
        );

        let full_reason = format!("{reason} (abort id: {correlation_id})");
        if let Err(e) = self
            .workflow
            .abort_workflow(&channel.execution_id, &channel.workflow_name, &full_reason)
            .await
        {
            tracing::error!(
                channel_id,
                execution_id = %channel.execution_id,
                %correlation_id,
                error = %e,
                "Failed to abort workflow execution"
            );
        }
    }

    async fn drop_channel(&self, channel_id: &str) -> Result<bool, ChannelError> {
        with_retries("abort_drop_channel", || async move {
            let mut tx = self.storage.begin().await?;
            let dropped = self.storage.drop_channel(&mut tx, channel_id).await?;
            self.storage.commit(tx).await?;
            Ok(dropped)
        })
        .await
    }
}
