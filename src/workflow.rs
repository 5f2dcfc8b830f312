//! Workflow control-plane adapter.
//!
//! The channel service does not own identity or workflow lifecycle; it
//! asks the workflow service whether a subject may act on a workflow, and
//! tells it to abort an execution when the data path is unrecoverable.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::config::WorkflowConfig;
use crate::error::ChannelError;

/// Permission required for an operation on a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Data-plane operations of a running execution (bind, unbind,
    /// transfer reports, status).
    WorkflowRun,
    /// Lifecycle operations (create, destroy).
    WorkflowManage,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::WorkflowRun => "workflow.run",
            Permission::WorkflowManage => "workflow.manage",
        }
    }
}

/// Workflow service operations the channel service depends on.
#[async_trait]
pub trait WorkflowApi: Send + Sync + 'static {
    /// Whether `subject_id` holds `permission` on the named workflow of
    /// `owner_id`.
    async fn check_access(
        &self,
        subject_id: &str,
        owner_id: &str,
        workflow_name: &str,
        permission: Permission,
    ) -> Result<bool, ChannelError>;

    /// Abort a whole workflow execution. Must be idempotent on the
    /// workflow side.
    async fn abort_workflow(
        &self,
        execution_id: &str,
        workflow_name: &str,
        reason: &str,
    ) -> Result<(), ChannelError>;
}

/// HTTP client for the workflow service.
pub struct HttpWorkflowClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct CheckAccessRequest<'a> {
    subject_id: &'a str,
    owner_id: &'a str,
    workflow_name: &'a str,
    permission: &'a str,
}

#[derive(Serialize)]
struct AbortWorkflowRequest<'a> {
    execution_id: &'a str,
    workflow_name: &'a str,
    reason: &'a str,
}

impl HttpWorkflowClient {
    pub fn new(config: &WorkflowConfig) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ChannelError::Internal(format!("workflow client init: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl WorkflowApi for HttpWorkflowClient {
    async fn check_access(
        &self,
        subject_id: &str,
        owner_id: &str,
        workflow_name: &str,
        permission: Permission,
    ) -> Result<bool, ChannelError> {
        let url = format!("{}/v1/auth/check_access", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&CheckAccessRequest {
                subject_id,
                owner_id,
                workflow_name,
                permission: permission.as_str(),
            })
            .send()
            .await
            .map_err(|e| ChannelError::Internal(format!("workflow access check: {e}")))?;

        match response.status().as_u16() {
            200 => Ok(true),
            403 => Ok(false),
            code => Err(ChannelError::Internal(format!(
                "workflow access check returned {code}"
            ))),
        }
    }

    async fn abort_workflow(
        &self,
        execution_id: &str,
        workflow_name: &str,
        reason: &str,
    ) -> Result<(), ChannelError> {
        let url = format!("{}/v1/workflows/abort", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&AbortWorkflowRequest {
                execution_id,
                workflow_name,
                reason,
            })
            .send()
            .await
            .map_err(|e| ChannelError::Internal(format!("workflow abort: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::Internal(format!(
                "workflow abort returned {}",
                response.status()
            )))
        }
    }
}
