use super::{Command, CoordinatorClient, HeartbeatEnvelope, HeartbeatRequest, HeartbeatResponse};
use crate::error::{BlockError, Result};
use async_trait::async_trait;
use reqwest::{Client, Url, header};
use std::time::Duration;

/// JSON-over-HTTP coordinator transport: `POST {base}/v1/heartbeat`.
#[derive(Clone)]
pub struct HttpCoordinatorClient {
    client: Client,
    heartbeat_url: Url,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|error| BlockError::Config(format!("invalid coordinator url: {}", error)))?;
        let heartbeat_url = base
            .join("v1/heartbeat")
            .map_err(|error| BlockError::Config(format!("invalid coordinator url: {}", error)))?;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| BlockError::Http(error.to_string()))?;

        Ok(Self {
            client,
            heartbeat_url,
        })
    }

    pub fn heartbeat_url(&self) -> &Url {
        &self.heartbeat_url
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn heartbeat(
        &self,
        node_address: &str,
        envelopes: &[HeartbeatEnvelope],
    ) -> Result<Vec<Command>> {
        let payload = HeartbeatRequest {
            node_address: node_address.to_string(),
            envelopes: envelopes.to_vec(),
        };

        let response = self
            .client
            .post(self.heartbeat_url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BlockError::CoordinatorUnavailable(format!(
                "heartbeat returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(BlockError::Http(format!("heartbeat returned {}", status)));
        }

        let body: HeartbeatResponse = response.json().await?;
        Ok(body.commands)
    }
}
