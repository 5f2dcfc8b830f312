//! Slot endpoint adapter.
//!
//! Live consumer slots expose a small HTTP surface; the only call the
//! channel service makes is "start pulling from this producer".

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::ChannelError;
use crate::model::PeerDescription;

#[async_trait]
pub trait SlotsApi: Send + Sync + 'static {
    /// Instruct the consumer slot at `consumer_url` to start a transfer
    /// from `producer`. Idempotent on the slot side.
    async fn start_transfer(
        &self,
        consumer_url: &str,
        producer: &PeerDescription,
    ) -> Result<(), ChannelError>;
}

pub struct HttpSlotsClient {
    client: reqwest::Client,
}

#[derive(Serialize)]
struct StartTransferRequest<'a> {
    producer: &'a PeerDescription,
}

impl HttpSlotsClient {
    pub fn new(request_timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ChannelError::Internal(format!("slots client init: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SlotsApi for HttpSlotsClient {
    async fn start_transfer(
        &self,
        consumer_url: &str,
        producer: &PeerDescription,
    ) -> Result<(), ChannelError> {
        let url = format!("{}/v1/start_transfer", consumer_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&StartTransferRequest { producer })
            .send()
            .await
            .map_err(|e| ChannelError::Internal(format!("start_transfer to {consumer_url}: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::Internal(format!(
                "start_transfer to {consumer_url} returned {}",
                response.status()
            )))
        }
    }
}
