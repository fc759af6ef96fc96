//! In-memory provider.
//!
//! Deterministic stand-in for a real backend: workers are records in a map,
//! capacity is a configurable budget, and every operation is instantaneous.
//! Supports the full capability set, including the worker event stream.
//! Used by tests and by local runs without a container runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::job::{PoolId, WorkerId};

use super::{
    validation, worker_name, CreateWorkerOutcome, DeleteWorkerOutcome, Provider,
    ProviderCapabilities, ProviderError, ProviderInfo, ProviderKind, ResourceAvailability, Worker,
    WorkerEvent, WorkerEventKind, WorkerStatus, WorkerTemplate, POOL_LABEL,
};

struct MockState {
    workers: HashMap<WorkerId, Worker>,
    capacity: ResourceAvailability,
    injected_failures: VecDeque<ProviderError>,
}

/// A provider backed by nothing but memory.
pub struct MockProvider {
    name: String,
    state: Mutex<MockState>,
    events: broadcast::Sender<WorkerEvent>,
}

impl MockProvider {
    /// Creates a mock with the given capacity budget.
    pub fn new(name: impl Into<String>, capacity: ResourceAvailability) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            name: name.into(),
            state: Mutex::new(MockState {
                workers: HashMap::new(),
                capacity,
                injected_failures: VecDeque::new(),
            }),
            events,
        }
    }

    /// Creates a mock with a roomy default capacity (16 cores, 64 GiB).
    pub fn with_default_capacity(name: impl Into<String>) -> Self {
        Self::new(
            name,
            ResourceAvailability {
                total_cpu_millis: 16_000,
                available_cpu_millis: 16_000,
                total_memory_bytes: 64 << 30,
                available_memory_bytes: 64 << 30,
                node_count: 4,
            },
        )
    }

    /// Queues an error to be returned by the next `create_worker` call.
    pub fn inject_failure(&self, error: ProviderError) {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        state.injected_failures.push_back(error);
    }

    /// Overrides a worker's backend status (e.g. to simulate readiness).
    pub fn set_worker_status(&self, id: WorkerId, status: WorkerStatus) {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        if let Some(worker) = state.workers.get_mut(&id) {
            worker.status = status;
        }
    }

    /// Sets a worker's active job count.
    pub fn set_active_jobs(&self, id: WorkerId, active_jobs: u32) {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        if let Some(worker) = state.workers.get_mut(&id) {
            worker.active_jobs = active_jobs;
            worker.status = if active_jobs > 0 {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Ready
            };
        }
    }

    fn emit(&self, worker_id: WorkerId, kind: WorkerEventKind) {
        // Nobody listening is fine.
        let _ = self.events.send(WorkerEvent {
            worker_id,
            kind,
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl Provider for MockProvider {
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

        let worker = {
            let mut state = self.state.lock().expect("mock state lock poisoned");
            if let Some(error) = state.injected_failures.pop_front() {
                return Err(error);
            }

            if state.capacity.available_cpu_millis < requests.cpu_millis
                || state.capacity.available_memory_bytes < requests.memory_bytes
            {
                return Ok(CreateWorkerOutcome::InsufficientResources {
                    required: requests,
                    available: state.capacity,
                });
            }
            state.capacity.available_cpu_millis -= requests.cpu_millis;
            state.capacity.available_memory_bytes -= requests.memory_bytes;

            let id = WorkerId::generate();
            let mut labels = template.labels.clone();
            labels.insert(POOL_LABEL.to_string(), pool_id.to_string());

            let mut capabilities = template.capabilities.clone();
            capabilities
                .entry("os".to_string())
                .or_insert_with(|| "linux".to_string());
            capabilities
                .entry("arch".to_string())
                .or_insert_with(|| "amd64".to_string());

            let worker = Worker {
                id,
                name: worker_name(&template.name, id),
                status: WorkerStatus::Provisioning,
                capabilities,
                labels,
                active_jobs: 0,
                pool_id,
                created_at: Utc::now(),
            };
            state.workers.insert(id, worker.clone());
            worker
        };

        self.emit(worker.id, WorkerEventKind::Created);
        Ok(CreateWorkerOutcome::Created(worker))
    }

    async fn delete_worker(
        &self,
        id: WorkerId,
        force: bool,
    ) -> Result<DeleteWorkerOutcome, ProviderError> {
        let removed = {
            let mut state = self.state.lock().expect("mock state lock poisoned");
            match state.workers.get(&id) {
                // Already gone: deletion is idempotent.
                None => return Ok(DeleteWorkerOutcome::Deleted),
                Some(worker) if worker.active_jobs > 0 && !force => {
                    return Ok(DeleteWorkerOutcome::HasActiveJobs {
                        active_jobs: worker.active_jobs,
                    });
                }
                Some(_) => {}
            }
            state.workers.remove(&id)
        };

        if removed.is_some() {
            self.emit(id, WorkerEventKind::Stopped);
        }
        Ok(DeleteWorkerOutcome::Deleted)
    }

    async fn worker_status(&self, id: WorkerId) -> Result<WorkerStatus, ProviderError> {
        let state = self.state.lock().expect("mock state lock poisoned");
        state
            .workers
            .get(&id)
            .map(|w| w.status)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn list_workers(&self, pool_id: Option<PoolId>) -> Result<Vec<Worker>, ProviderError> {
        let state = self.state.lock().expect("mock state lock poisoned");
        Ok(state
            .workers
            .values()
            .filter(|w| pool_id.is_none_or(|p| w.pool_id == p))
            .cloned()
            .collect())
    }

    async fn resource_availability(&self) -> Result<ResourceAvailability, ProviderError> {
        let state = self.state.lock().expect("mock state lock poisoned");
        Ok(state.capacity)
    }

    fn watch_worker_events(&self) -> Option<BoxStream<'static, WorkerEvent>> {
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move { item.ok() });
        Some(stream.boxed())
    }

    fn validate_template(&self, template: &WorkerTemplate) -> Vec<validation::ValidationIssue> {
        validation::validate_template(template)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            kind: ProviderKind::Mock,
            version: None,
            capabilities: ProviderCapabilities {
                worker_event_stream: true,
                max_concurrent_creations: 8,
            },
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
