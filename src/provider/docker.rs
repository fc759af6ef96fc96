//! Container-runtime provider over the Docker API.
//!
//! Workers are containers carrying taskfleet labels; the pool binding and
//! the worker id both travel as labels so every lookup is a label filter.
//! The runtime offers no usable lifecycle event stream for our purposes, so
//! this provider reports `worker_event_stream: false` and worker discovery
//! is poll-based.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::Utc;

use crate::job::{PoolId, WorkerId};

use super::{
    validation, worker_name, CreateWorkerOutcome, DeleteWorkerOutcome, Provider,
    ProviderCapabilities, ProviderError, ProviderInfo, ProviderKind, ResourceAvailability, Worker,
    WorkerStatus, WorkerTemplate, POOL_LABEL,
};

/// Label carrying the worker id on its container.
pub const WORKER_ID_LABEL: &str = "taskfleet-worker-id";

/// Docker tolerates fewer mounts per container than cluster backends.
const MAX_VOLUMES: usize = 8;

/// Provider that materializes workers as local containers.
pub struct DockerProvider {
    docker: Docker,
    name: String,
    server_version: Option<String>,
}

impl DockerProvider {
    /// Connects to the local Docker daemon.
    pub async fn connect(name: impl Into<String>) -> Result<Self, ProviderError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ProviderError::Backend(format!("Failed to connect to daemon: {e}")))?;
        let server_version = docker.version().await.ok().and_then(|v| v.version);

        Ok(Self {
            docker,
            name: name.into(),
            server_version,
        })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(name: impl Into<String>, docker: Docker) -> Self {
        Self {
            docker,
            name: name.into(),
            server_version: None,
        }
    }

    async fn find_container(&self, id: WorkerId) -> Result<Option<String>, ProviderError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{WORKER_ID_LABEL}={id}")],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_docker_error)?;

        Ok(containers.into_iter().next().and_then(|c| c.id))
    }
}

#[async_trait]
impl Provider for DockerProvider {
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

        let id = WorkerId::generate();
        let name = worker_name(&template.name, id);
        let labels = container_labels(template, pool_id, id);

        let host_config = HostConfig {
            memory: Some(requests.memory_bytes as i64),
            nano_cpus: Some(requests.cpu_millis as i64 * 1_000_000),
            binds: binds(template),
            ..Default::default()
        };

        let config = Config {
            image: Some(template.image.clone()),
            env: Some(container_env(template)),
            labels: Some(labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_docker_error)?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_docker_error)?;

        tracing::info!(worker_id = %id, container = %response.id, "Created worker container");

        let mut capabilities = template.capabilities.clone();
        capabilities
            .entry("os".to_string())
            .or_insert_with(|| "linux".to_string());
        capabilities
            .entry("arch".to_string())
            .or_insert_with(|| std::env::consts::ARCH.to_string());

        Ok(CreateWorkerOutcome::Created(Worker {
            id,
            name,
            status: WorkerStatus::Provisioning,
            capabilities,
            labels,
            active_jobs: 0,
            pool_id,
            created_at: Utc::now(),
        }))
    }

    async fn delete_worker(
        &self,
        id: WorkerId,
        force: bool,
    ) -> Result<DeleteWorkerOutcome, ProviderError> {
        let container = match self.find_container(id).await? {
            Some(container) => container,
            // Already gone: deletion is idempotent.
            None => return Ok(DeleteWorkerOutcome::Deleted),
        };

        if !force {
            // SIGTERM with a 10 s window before SIGKILL.
            match self
                .docker
                .stop_container(&container, Some(StopContainerOptions { t: 10 }))
                .await
                .map_err(map_docker_error)
            {
                Ok(()) | Err(ProviderError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        match self
            .docker
            .remove_container(
                &container,
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_docker_error)
        {
            Ok(()) | Err(ProviderError::NotFound(_)) => Ok(DeleteWorkerOutcome::Deleted),
            Err(err) => Err(err),
        }
    }

    async fn worker_status(&self, id: WorkerId) -> Result<WorkerStatus, ProviderError> {
        let container = self
            .find_container(id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;

        let info = self
            .docker
            .inspect_container(&container, None::<InspectContainerOptions>)
            .await
            .map_err(map_docker_error)?;

        let state = info
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default();
        Ok(map_container_state(&state))
    }

    async fn list_workers(&self, pool_id: Option<PoolId>) -> Result<Vec<Worker>, ProviderError> {
        let mut filters = HashMap::new();
        let label_filter = match pool_id {
            Some(pool) => format!("{POOL_LABEL}={pool}"),
            None => WORKER_ID_LABEL.to_string(),
        };
        filters.insert("label".to_string(), vec![label_filter]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_docker_error)?;

        let mut workers = Vec::with_capacity(containers.len());
        for container in containers {
            let labels: HashMap<String, String> = container.labels.unwrap_or_default();
            let Some(worker_id) = labels.get(WORKER_ID_LABEL).and_then(|v| v.parse().ok()) else {
                continue;
            };
            let Some(worker_pool) = labels.get(POOL_LABEL).and_then(|v| v.parse().ok()) else {
                continue;
            };

            workers.push(Worker {
                id: worker_id,
                name: container
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                status: map_container_state(container.state.as_deref().unwrap_or_default()),
                capabilities: Default::default(),
                labels: labels.into_iter().collect(),
                active_jobs: 0,
                pool_id: worker_pool,
                created_at: container
                    .created
                    .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(workers)
    }

    async fn resource_availability(&self) -> Result<ResourceAvailability, ProviderError> {
        let info = self.docker.info().await.map_err(map_docker_error)?;
        let total_cpu_millis = info.ncpu.unwrap_or(0).max(0) as u64 * 1000;
        let total_memory_bytes = info.mem_total.unwrap_or(0).max(0) as u64;

        // Subtract the reservations of our own labeled containers.
        let mut reserved_cpu = 0u64;
        let mut reserved_memory = 0u64;
        for worker in self.list_workers(None).await? {
            if worker.status == WorkerStatus::Offline || worker.status == WorkerStatus::Failed {
                continue;
            }
            if let Some(container) = self.find_container(worker.id).await? {
                if let Ok(inspected) = self
                    .docker
                    .inspect_container(&container, None::<InspectContainerOptions>)
                    .await
                {
                    if let Some(host_config) = inspected.host_config {
                        reserved_cpu +=
                            (host_config.nano_cpus.unwrap_or(0).max(0) as u64) / 1_000_000;
                        reserved_memory += host_config.memory.unwrap_or(0).max(0) as u64;
                    }
                }
            }
        }

        Ok(ResourceAvailability {
            total_cpu_millis,
            available_cpu_millis: total_cpu_millis.saturating_sub(reserved_cpu),
            total_memory_bytes,
            available_memory_bytes: total_memory_bytes.saturating_sub(reserved_memory),
            node_count: 1,
        })
    }

    fn validate_template(&self, template: &WorkerTemplate) -> Vec<validation::ValidationIssue> {
        validation::validate_template_with(template, MAX_VOLUMES)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            kind: ProviderKind::ContainerRuntime,
            version: self.server_version.clone(),
            capabilities: ProviderCapabilities {
                worker_event_stream: false,
                max_concurrent_creations: 4,
            },
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        self.docker.ping().await.map_err(map_docker_error)?;
        Ok(())
    }
}

/// Maps a Docker container state string to a worker status.
fn map_container_state(state: &str) -> WorkerStatus {
    match state {
        "created" | "restarting" => WorkerStatus::Provisioning,
        "running" => WorkerStatus::Ready,
        "paused" => WorkerStatus::Busy,
        "removing" => WorkerStatus::Terminating,
        "exited" => WorkerStatus::Offline,
        "dead" => WorkerStatus::Failed,
        _ => WorkerStatus::Offline,
    }
}

/// Classifies bollard errors into the provider error taxonomy.
fn map_docker_error(error: bollard::errors::Error) -> ProviderError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => ProviderError::NotFound(message),
            401 | 403 => ProviderError::PermissionDenied(message),
            409 => ProviderError::Conflict(message),
            _ => ProviderError::Backend(format!("({status_code}) {message}")),
        },
        bollard::errors::Error::RequestTimeoutError => {
            ProviderError::Timeout("Docker API request timed out".to_string())
        }
        other => ProviderError::Backend(other.to_string()),
    }
}

fn container_labels(
    template: &WorkerTemplate,
    pool_id: PoolId,
    worker_id: WorkerId,
) -> std::collections::BTreeMap<String, String> {
    let mut labels = template.labels.clone();
    labels.insert(POOL_LABEL.to_string(), pool_id.to_string());
    labels.insert(WORKER_ID_LABEL.to_string(), worker_id.to_string());
    labels
}

fn container_env(template: &WorkerTemplate) -> Vec<String> {
    template
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect()
}

fn binds(template: &WorkerTemplate) -> Option<Vec<String>> {
    if template.volumes.is_empty() {
        return None;
    }
    Some(
        template
            .volumes
            .iter()
            .map(|v| {
                if v.read_only {
                    format!("{}:{}:ro", v.host_path, v.container_path)
                } else {
                    format!("{}:{}", v.host_path, v.container_path)
                }
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::VolumeMount;

    #[test]
    fn test_container_state_mapping() {
        assert_eq!(map_container_state("created"), WorkerStatus::Provisioning);
        assert_eq!(map_container_state("running"), WorkerStatus::Ready);
        assert_eq!(map_container_state("removing"), WorkerStatus::Terminating);
        assert_eq!(map_container_state("exited"), WorkerStatus::Offline);
        assert_eq!(map_container_state("dead"), WorkerStatus::Failed);
        assert_eq!(map_container_state("garbage"), WorkerStatus::Offline);
    }

    #[test]
    fn test_error_classification() {
        let err = map_docker_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        });
        assert!(matches!(err, ProviderError::NotFound(_)));

        let err = map_docker_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 403,
            message: "denied".to_string(),
        });
        assert!(matches!(err, ProviderError::PermissionDenied(_)));

        let err = map_docker_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        });
        assert!(matches!(err, ProviderError::Conflict(_)));

        let err = map_docker_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        });
        assert!(matches!(err, ProviderError::Backend(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_env_and_binds_rendering() {
        let mut template = WorkerTemplate::new("w", "fleet/agent:1")
            .with_env("FLEET_TOKEN", "abc")
            .with_env("RUST_LOG", "info");
        template.volumes = vec![
            VolumeMount {
                host_path: "/data/cache".to_string(),
                container_path: "/cache".to_string(),
                read_only: true,
            },
            VolumeMount {
                host_path: "/data/scratch".to_string(),
                container_path: "/scratch".to_string(),
                read_only: false,
            },
        ];

        let env = container_env(&template);
        assert!(env.contains(&"FLEET_TOKEN=abc".to_string()));
        assert!(env.contains(&"RUST_LOG=info".to_string()));

        let binds = binds(&template).unwrap();
        assert_eq!(binds[0], "/data/cache:/cache:ro");
        assert_eq!(binds[1], "/data/scratch:/scratch");
    }

    #[test]
    fn test_labels_carry_pool_and_worker_id() {
        let pool = PoolId::generate();
        let worker = WorkerId::generate();
        let labels = container_labels(&WorkerTemplate::new("w", "img"), pool, worker);

        assert_eq!(labels.get(POOL_LABEL), Some(&pool.to_string()));
        assert_eq!(labels.get(WORKER_ID_LABEL), Some(&worker.to_string()));
    }
}
