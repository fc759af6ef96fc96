//! Compute provider abstraction.
//!
//! A provider knows how to materialize workers from a [`WorkerTemplate`] on
//! some backend: the local container runtime ([`docker`]), a remote cluster
//! manager ([`cluster`]), or an in-memory fake ([`mock`]). The pool manager
//! drives providers exclusively through the [`Provider`] trait.
//!
//! Template validation and resource-quantity parsing are shared across
//! providers so a template means exactly the same thing everywhere.

pub mod cluster;
pub mod docker;
pub mod mock;
pub mod resources;
pub mod validation;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{PoolId, WorkerId};

use resources::{ParsedResources, ResourceRequests};
use validation::ValidationIssue;

/// Label key that binds a worker to its pool across every backend.
pub const POOL_LABEL: &str = "taskfleet-pool";

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// The backend is bringing the worker up.
    Provisioning,
    /// Registered and idle. A ready worker has zero active jobs.
    Ready,
    /// Executing at least one job.
    Busy,
    /// Shutdown in progress.
    Terminating,
    /// The worker failed and will be removed.
    Failed,
    /// Heartbeats stopped; the worker is presumed gone.
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Provisioning => write!(f, "provisioning"),
            WorkerStatus::Ready => write!(f, "ready"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Terminating => write!(f, "terminating"),
            WorkerStatus::Failed => write!(f, "failed"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A worker instance as seen by the orchestration plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier.
    pub id: WorkerId,
    /// DNS-safe instance name (`{pool-name}-{short-id}`).
    pub name: String,
    /// Current lifecycle status.
    pub status: WorkerStatus,
    /// Capability set matched against job requirements.
    pub capabilities: BTreeMap<String, String>,
    /// Backend labels, including the pool binding.
    pub labels: BTreeMap<String, String>,
    /// Number of jobs currently executing.
    pub active_jobs: u32,
    /// The pool this worker belongs to.
    pub pool_id: PoolId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Worker {
    /// Returns whether the worker can accept a job right now.
    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Ready && self.active_jobs == 0
    }
}

/// Builds the DNS-safe instance name for a new worker.
pub fn worker_name(pool_name: &str, id: WorkerId) -> String {
    format!("{}-{}", pool_name, id.short())
}

/// A host path mounted into a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Path on the host.
    pub host_path: String,
    /// Path inside the worker.
    pub container_path: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// L4 protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

/// A port exposed by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the worker. Must fall in 1024–65535.
    pub container_port: u16,
    /// L4 protocol.
    #[serde(default)]
    pub protocol: PortProtocol,
}

/// Security settings requested for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SecurityContext {
    /// Run the worker privileged. Always rejected by validation.
    #[serde(default)]
    pub privileged: bool,
    /// Allow gaining privileges at runtime. Always rejected by validation.
    #[serde(default)]
    pub allow_privilege_escalation: bool,
    /// Linux capabilities to add. The dangerous set is rejected.
    #[serde(default)]
    pub added_capabilities: Vec<String>,
}

/// The recipe for manufacturing a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTemplate {
    /// Base name for workers stamped from this template (DNS-1123).
    pub name: String,
    /// Image reference to run.
    pub image: String,
    /// Resource requests.
    #[serde(default)]
    pub resources: ResourceRequests,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Backend labels applied to each worker.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Capability hints advertised for scheduling before registration.
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
    /// Node-selector constraints for cluster backends.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Host paths mounted into the worker.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Ports exposed by the worker.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Security settings.
    #[serde(default)]
    pub security: SecurityContext,
}

impl WorkerTemplate {
    /// Creates a minimal template with default resources.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            resources: ResourceRequests::default(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            capabilities: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            volumes: Vec::new(),
            ports: Vec::new(),
            security: SecurityContext::default(),
        }
    }

    /// Sets the resource requests.
    pub fn with_resources(mut self, resources: ResourceRequests) -> Self {
        self.resources = resources;
        self
    }

    /// Adds a capability hint.
    pub fn with_capability(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Cluster-level capacity snapshot reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceAvailability {
    /// Total schedulable CPU in millicores.
    pub total_cpu_millis: u64,
    /// CPU still available, in millicores.
    pub available_cpu_millis: u64,
    /// Total schedulable memory in bytes.
    pub total_memory_bytes: u64,
    /// Memory still available, in bytes.
    pub available_memory_bytes: u64,
    /// Number of schedulable nodes.
    pub node_count: u32,
}

impl ResourceAvailability {
    /// Returns how many workers with the given requests fit in the
    /// available capacity, and the factor that limits it.
    pub fn accommodates(&self, requests: &ParsedResources) -> (u64, &'static str) {
        let by_cpu = self.available_cpu_millis / requests.cpu_millis.max(1);
        let by_memory = self.available_memory_bytes / requests.memory_bytes.max(1);
        if by_cpu <= by_memory {
            (by_cpu, "CPU limit")
        } else {
            (by_memory, "memory limit")
        }
    }
}

/// What kind of backend a provider drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    ContainerRuntime,
    Cluster,
    Mock,
}

/// Optional abilities a provider may or may not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Whether `watch_worker_events` yields a live stream.
    pub worker_event_stream: bool,
    /// Cap on concurrent worker creations the backend tolerates.
    pub max_concurrent_creations: usize,
}

/// Static description of a provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider name (unique within the orchestrator).
    pub name: String,
    /// Backend kind.
    pub kind: ProviderKind,
    /// Backend version string, when the backend reports one.
    pub version: Option<String>,
    /// Optional abilities.
    pub capabilities: ProviderCapabilities,
}

/// Backend failures, classified for retry policy.
///
/// `NotFound` is benign on deletion paths. `PermissionDenied` is fatal and
/// surfaced. `Conflict` is surfaced (create-exists). `Backend` failures are
/// retried once and then surfaced.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The referenced object does not exist on the backend.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend rejected the credentials or the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The object already exists or is in a conflicting state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backend call timed out.
    #[error("Backend timed out: {0}")]
    Timeout(String),

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl ProviderError {
    /// Whether the class-specific policy allows one retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Backend(_) | ProviderError::Timeout(_))
    }
}

/// Outcome of a worker creation attempt.
#[derive(Debug)]
pub enum CreateWorkerOutcome {
    /// The worker was created and is provisioning.
    Created(Worker),
    /// The template failed provider validation.
    InvalidTemplate { issues: Vec<ValidationIssue> },
    /// The backend lacks capacity for the requested resources.
    InsufficientResources {
        required: ParsedResources,
        available: ResourceAvailability,
    },
}

/// Outcome of a worker deletion attempt.
///
/// Deleting a worker the backend no longer knows about is a success, which
/// makes deletion idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteWorkerOutcome {
    /// The worker is gone (or was already gone).
    Deleted,
    /// The worker still runs jobs and `force` was not set.
    HasActiveJobs { active_jobs: u32 },
}

/// A lifecycle event observed on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEvent {
    /// The worker the event concerns.
    pub worker_id: WorkerId,
    /// What happened.
    pub kind: WorkerEventKind,
    /// When the backend observed it.
    pub timestamp: DateTime<Utc>,
}

/// Kinds of backend worker events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEventKind {
    Created,
    Started,
    Stopped,
    Failed { reason: String },
}

/// Uniform interface over compute backends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a worker from a template, bound to a pool.
    async fn create_worker(
        &self,
        template: &WorkerTemplate,
        pool_id: PoolId,
    ) -> Result<CreateWorkerOutcome, ProviderError>;

    /// Destroys a worker. `force` destroys it even with active jobs.
    async fn delete_worker(
        &self,
        id: WorkerId,
        force: bool,
    ) -> Result<DeleteWorkerOutcome, ProviderError>;

    /// Reports the backend's view of a worker's status.
    async fn worker_status(&self, id: WorkerId) -> Result<WorkerStatus, ProviderError>;

    /// Lists workers, optionally restricted to one pool.
    async fn list_workers(&self, pool_id: Option<PoolId>) -> Result<Vec<Worker>, ProviderError>;

    /// Reports cluster-level capacity.
    async fn resource_availability(&self) -> Result<ResourceAvailability, ProviderError>;

    /// Returns a live stream of backend worker events, when the provider
    /// supports it (see [`ProviderCapabilities::worker_event_stream`]).
    fn watch_worker_events(&self) -> Option<BoxStream<'static, WorkerEvent>> {
        None
    }

    /// Validates a template against provider rules. Empty means valid.
    fn validate_template(&self, template: &WorkerTemplate) -> Vec<ValidationIssue> {
        validation::validate_template(template)
    }

    /// Describes this provider instance.
    fn info(&self) -> ProviderInfo;

    /// Verifies the backend is reachable.
    async fn health_check(&self) -> Result<(), ProviderError>;
}

/// Runs a provider call, retrying once on retryable failures.
pub async fn with_retry_once<T, F, Fut>(op: F) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    match op().await {
        Err(err) if err.is_retryable() => {
            tracing::warn!(error = %err, "Provider call failed, retrying once");
            op().await
        }
        other => other,
    }
}
