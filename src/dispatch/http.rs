use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::core::errors::{EngineError, Result};
use crate::core::model::{NodeId, TaskOutcome, TaskState};
use crate::dispatch::transport::NodeTransport;
use crate::node::protocol::{
    CancelResponse, ExecuteRequest, ExecuteResponse, HealthResponse, TaskStatusResponse,
};

const DEFAULT_STATUS_POLL: Duration = Duration::from_millis(200);

/// Talks to a remote node's HTTP surface
pub struct HttpTransport {
    node_id: NodeId,
    base_url: String,
    client: Client,
    status_poll: Duration,
}

impl HttpTransport {
    pub fn new(node_id: impl Into<NodeId>, base_url: impl Into<String>) -> Self {
        Self::with_client(node_id, base_url, Client::new())
    }

    pub fn with_client(node_id: impl Into<NodeId>, base_url: impl Into<String>, client: Client) -> Self {
        Self {
            node_id: node_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            status_poll: DEFAULT_STATUS_POLL,
        }
    }

    pub fn with_status_poll(mut self, interval: Duration) -> Self {
        self.status_poll = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    fn transport_error(&self, err: reqwest::Error) -> EngineError {
        EngineError::transport(&self.node_id, err.to_string())
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = response
            .error_for_status()
            .map_err(|e| self.transport_error(e))?;
        response.json::<T>().await.map_err(|e| self.transport_error(e))
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    /// Submit the task, then poll its status until it reaches a terminal state.
    ///
    /// The dispatcher's deadline bounds the polling.
    async fn execute(&self, request: ExecuteRequest) -> Result<TaskOutcome> {
        let task_id = request.task_id.clone();
        let response = self
            .client
            .post(self.url("task/execute"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let accepted: ExecuteResponse = self.decode(response).await?;
        if !accepted.accepted {
            return Err(EngineError::transport(
                &self.node_id,
                format!(
                    "node rejected task {}: {}",
                    task_id,
                    accepted.reason.unwrap_or_else(|| "no reason given".to_string())
                ),
            ));
        }
        debug!(node_id = %self.node_id, task_id = %task_id, "Task accepted by remote node");

        let status_url = self.url(&format!("task/{}/status", task_id));
        loop {
            tokio::time::sleep(self.status_poll).await;
            let response = self
                .client
                .get(&status_url)
                .send()
                .await
                .map_err(|e| self.transport_error(e))?;
            let status: TaskStatusResponse = self.decode(response).await?;
            match status.state {
                TaskState::Succeeded => {
                    return Ok(TaskOutcome::Success(status.result.unwrap_or(Value::Null)))
                }
                TaskState::Failed => {
                    return Ok(TaskOutcome::Failure(
                        status.error.unwrap_or_else(|| "remote task failed".to_string()),
                    ))
                }
                TaskState::Cancelled => return Err(EngineError::Cancelled { task_id }),
                _ => {}
            }
        }
    }

    async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .client
            .get(self.url("health"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.decode(response).await
    }

    async fn cancel(&self, task_id: &str) -> Result<bool> {
        let response = self
            .client
            .post(self.url(&format!("task/{}/cancel", task_id)))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let body: CancelResponse = self.decode(response).await?;
        Ok(body.cancelled)
    }
}
