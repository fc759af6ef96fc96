//! Cluster-manager provider over its REST API.
//!
//! The cluster manager schedules workers onto its own nodes; this provider
//! is a thin, typed client for it. Unlike the container runtime, the
//! cluster manager exposes a live worker-event feed (newline-delimited
//! JSON), so this provider advertises the event-stream capability.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::job::{PoolId, WorkerId};

use super::{
    validation, CreateWorkerOutcome, DeleteWorkerOutcome, Provider, ProviderCapabilities,
    ProviderError, ProviderInfo, ProviderKind, ResourceAvailability, Worker, WorkerEvent,
    WorkerStatus, WorkerTemplate,
};

/// Cluster backends tolerate more mounts than the local runtime.
const MAX_VOLUMES: usize = 16;

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the cluster provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Base URL of the cluster-manager API (e.g. `https://fleet.internal:7443`).
    pub base_url: String,
    /// Opaque bearer token.
    pub token: String,
}

#[derive(Debug, Serialize)]
struct CreateWorkerRequest<'a> {
    worker_id: WorkerId,
    pool_id: PoolId,
    template: &'a WorkerTemplate,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct DeleteConflictBody {
    active_jobs: u32,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: WorkerStatus,
}

#[derive(Debug, Deserialize)]
struct VersionBody {
    version: String,
}

/// Provider that drives a remote cluster manager.
pub struct ClusterProvider {
    name: String,
    config: ClusterConfig,
    client: reqwest::Client,
    server_version: Option<String>,
}

impl ClusterProvider {
    /// Connects to the cluster manager and captures its version.
    pub async fn connect(
        name: impl Into<String>,
        config: ClusterConfig,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Backend(format!("Failed to build HTTP client: {e}")))?;

        let mut provider = Self {
            name: name.into(),
            config,
            client,
            server_version: None,
        };
        let version: VersionBody = provider.get_json("/v1/version").await?;
        provider.server_version = Some(version.version);
        Ok(provider)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(map_request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::Backend(format!("Malformed response body: {e}")))
    }
}

#[async_trait]
impl Provider for ClusterProvider {
    async fn create_worker(
        &self,
        template: &WorkerTemplate,
        pool_id: PoolId,
    ) -> Result<CreateWorkerOutcome, ProviderError> {
        let issues = self.validate_template(template);
        if !issues.is_empty() {
            return Ok(CreateWorkerOutcome::InvalidTemplate { issues });
        }
        let requests = template
            .resources
            .parse()
            .expect("validated template parses");

        let availability = self.resource_availability().await?;
        if availability.available_cpu_millis < requests.cpu_millis
            || availability.available_memory_bytes < requests.memory_bytes
        {
            return Ok(CreateWorkerOutcome::InsufficientResources {
                required: requests,
                available: availability,
            });
        }

        let worker_id = WorkerId::generate();
        let response = self
            .client
            .post(self.url("/v1/workers"))
            .bearer_auth(&self.config.token)
            .json(&CreateWorkerRequest {
                worker_id,
                pool_id,
                template,
            })
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }

        let worker: Worker = response
            .json()
            .await
            .map_err(|e| ProviderError::Backend(format!("Malformed worker descriptor: {e}")))?;
        tracing::info!(worker_id = %worker.id, pool_id = %pool_id, "Cluster scheduled worker");
        Ok(CreateWorkerOutcome::Created(worker))
    }

    async fn delete_worker(
        &self,
        id: WorkerId,
        force: bool,
    ) -> Result<DeleteWorkerOutcome, ProviderError> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/workers/{id}?force={force}")))
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(map_request_error)?;

        match response.status() {
            // Already gone counts as deleted.
            status if status.is_success() || status == StatusCode::NOT_FOUND => {
                Ok(DeleteWorkerOutcome::Deleted)
            }
            StatusCode::CONFLICT => {
                let body: DeleteConflictBody = response.json().await.map_err(|e| {
                    ProviderError::Backend(format!("Malformed conflict body: {e}"))
                })?;
                Ok(DeleteWorkerOutcome::HasActiveJobs {
                    active_jobs: body.active_jobs,
                })
            }
            status => Err(error_from_response(status, response).await),
        }
    }

    async fn worker_status(&self, id: WorkerId) -> Result<WorkerStatus, ProviderError> {
        let body: StatusBody = self.get_json(&format!("/v1/workers/{id}/status")).await?;
        Ok(body.status)
    }

    async fn list_workers(&self, pool_id: Option<PoolId>) -> Result<Vec<Worker>, ProviderError> {
        let path = match pool_id {
            Some(pool) => format!("/v1/workers?pool={pool}"),
            None => "/v1/workers".to_string(),
        };
        self.get_json(&path).await
    }

    async fn resource_availability(&self) -> Result<ResourceAvailability, ProviderError> {
        self.get_json("/v1/capacity").await
    }

    fn watch_worker_events(&self) -> Option<BoxStream<'static, WorkerEvent>> {
        let client = self.client.clone();
        let url = self.url("/v1/events/workers");
        let token = self.config.token.clone();

        let stream = async_stream::stream! {
            let response = match client
                .get(&url)
                .bearer_auth(&token)
                // The feed is long-lived; the per-request timeout must not apply.
                .timeout(Duration::from_secs(u64::MAX / 2))
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(error = %err, "Worker event feed unavailable");
                    return;
                }
            };

            let mut decoder = LineDecoder::default();
            let mut bytes = response.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::warn!(error = %err, "Worker event feed interrupted");
                        return;
                    }
                };
                for event in decoder.feed(&chunk) {
                    yield event;
                }
            }
        };
        Some(stream.boxed())
    }

    fn validate_template(&self, template: &WorkerTemplate) -> Vec<validation::ValidationIssue> {
        let mut issues = validation::validate_template_with(template, MAX_VOLUMES);
        // The cluster scheduler needs at least one satisfiable node selector
        // value; empty values never match a node.
        for (key, value) in &template.node_selector {
            if value.trim().is_empty() {
                issues.push(validation::ValidationIssue {
                    field: "node_selector".to_string(),
                    message: format!("selector '{key}' has an empty value"),
                });
            }
        }
        issues
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            kind: ProviderKind::Cluster,
            version: self.server_version.clone(),
            capabilities: ProviderCapabilities {
                worker_event_stream: true,
                max_concurrent_creations: 16,
            },
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(self.url("/v1/healthz"))
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(map_request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }
        Ok(())
    }
}

/// Classifies transport-level request failures.
fn map_request_error(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(error.to_string())
    } else {
        ProviderError::Backend(error.to_string())
    }
}

/// Classifies an error response by status code.
async fn error_from_response(status: StatusCode, response: reqwest::Response) -> ProviderError {
    let message = match response.json::<ApiErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    };
    classify_status(status, message)
}

fn classify_status(status: StatusCode, message: String) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::PermissionDenied(message)
        }
        StatusCode::CONFLICT => ProviderError::Conflict(message),
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
            ProviderError::Timeout(message)
        }
        _ => ProviderError::Backend(format!("({status}) {message}")),
    }
}

/// Incremental decoder for a newline-delimited JSON event feed.
#[derive(Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<WorkerEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<WorkerEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(error = %err, "Dropping malformed worker event line");
                }
            }
        }
        events
    }
}
