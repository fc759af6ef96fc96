//! Pool manager.
//!
//! Owns every pool and the worker registry, executes scale actions against
//! the providers, and publishes pool events. Workers are stored by id;
//! pools and workers reference each other through identifiers only.
//!
//! Locking: the pool registry and the worker registry each have their own
//! lock; mutation of a single pool goes through that pool's entry under the
//! registry write lock, held only for the mutation itself and never across
//! a provider call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::job::{PoolId, WorkerId};
use crate::provider::{
    with_retry_once, CreateWorkerOutcome, DeleteWorkerOutcome, Provider, ProviderError, Worker,
    WorkerStatus,
};
use crate::queue::CandidateWorker;

use super::{
    OverallMetrics, Pool, PoolEvent, PoolEventKind, PoolMetrics, PoolSpec, PoolStatus,
    ScalingPolicy,
};

/// Capacity of the pool event channel. Slow subscribers miss events past
/// this backlog rather than blocking emitters.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors raised by pool manager operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No pool with the given id.
    #[error("Pool {0} not found")]
    PoolNotFound(PoolId),

    /// No provider registered under the given name.
    #[error("Provider '{0}' not registered")]
    ProviderNotFound(String),

    /// The pool is terminated and accepts no further operations.
    #[error("Pool {0} is terminated")]
    Terminated(PoolId),

    /// A provider call failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Outcome of pool creation.
#[derive(Debug)]
pub enum CreatePoolOutcome {
    /// The pool exists and initial scale-up ran.
    Created(Pool),
    /// The spec failed validation.
    InvalidConfiguration { issues: Vec<String> },
    /// The backend cannot host even the pool's minimum size.
    ResourceConstraints { factors: Vec<String> },
}

/// Outcome of a scale action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleOutcome {
    /// The pool reached the target.
    Scaled {
        from: u32,
        to: u32,
        affected: Vec<WorkerId>,
    },
    /// The pool moved toward the target but stopped short.
    Partial {
        from: u32,
        actual: u32,
        target: u32,
        reason: String,
    },
    /// Nothing could be done at all.
    ResourceConstraints { factors: Vec<String> },
    /// The pool is already at the requested size.
    NoActionNeeded,
}

/// Owner of all pools and their workers.
pub struct PoolManager {
    providers: HashMap<String, Arc<dyn Provider>>,
    pools: RwLock<HashMap<PoolId, Pool>>,
    workers: RwLock<HashMap<WorkerId, Worker>>,
    events: broadcast::Sender<PoolEvent>,
    clock: Arc<dyn Clock>,
}

impl PoolManager {
    /// Creates a manager over the given named providers.
    pub fn new(providers: HashMap<String, Arc<dyn Provider>>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            providers,
            pools: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            events,
            clock,
        }
    }

    /// Subscribes to the raw pool event channel.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Returns pool events as a lazy stream.
    ///
    /// The stream silently skips past events dropped while the consumer
    /// lagged; subscribers that must not miss events should drain promptly.
    pub fn stream_pool_events(&self) -> impl Stream<Item = PoolEvent> + Send + 'static {
        let mut rx = self.subscribe_events();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Pool event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    fn emit(&self, kind: PoolEventKind) {
        let _ = self.events.send(PoolEvent {
            timestamp: self.clock.now(),
            kind,
        });
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn Provider>, PoolError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::ProviderNotFound(name.to_string()))
    }

    /// Creates a pool: validate, resource-check, persist, scale to `min`.
    pub async fn create_pool(&self, spec: PoolSpec) -> Result<CreatePoolOutcome, PoolError> {
        let mut issues: Vec<String> = Vec::new();
        if spec.name.trim().is_empty() {
            issues.push("pool name must not be empty".to_string());
        }
        issues.extend(spec.policy.issues());

        let provider = match self.provider(&spec.provider) {
            Ok(provider) => Some(provider),
            Err(_) => {
                issues.push(format!("provider '{}' is not registered", spec.provider));
                None
            }
        };
        if let Some(ref provider) = provider {
            issues.extend(
                provider
                    .validate_template(&spec.template)
                    .into_iter()
                    .map(|issue| issue.to_string()),
            );
        }
        if !issues.is_empty() {
            return Ok(CreatePoolOutcome::InvalidConfiguration { issues });
        }
        let provider = provider.expect("validated above");

        // Room for the minimum size must exist up front.
        let requests = spec.template.resources.parse().expect("validated template");
        let availability = provider.resource_availability().await?;
        let (can_accommodate, factor) = availability.accommodates(&requests);
        if can_accommodate < spec.policy.min as u64 {
            return Ok(CreatePoolOutcome::ResourceConstraints {
                factors: vec![factor.to_string()],
            });
        }

        let now = self.clock.now();
        let pool = Pool {
            id: PoolId::generate(),
            name: spec.name.clone(),
            provider: spec.provider.clone(),
            template: spec.template,
            policy: spec.policy,
            status: PoolStatus::Active,
            current_size: 0,
            desired_size: spec.policy.min,
            created_at: now,
            last_scaled_at: None,
        };
        let pool_id = pool.id;

        {
            let mut pools = self.pools.write().await;
            pools.insert(pool_id, pool.clone());
        }
        self.emit(PoolEventKind::PoolCreated {
            pool_id,
            name: spec.name,
        });
        info!(pool_id = %pool_id, min = spec.policy.min, "Pool created");

        if spec.policy.min > 0 {
            self.scale_pool(pool_id, spec.policy.min, "initial scale to minimum", false)
                .await?;
        }

        let pool = self.get_pool(pool_id).await.ok_or(PoolError::PoolNotFound(pool_id))?;
        Ok(CreatePoolOutcome::Created(pool))
    }

    /// Deletes a pool, destroying every member.
    pub async fn delete_pool(&self, pool_id: PoolId) -> Result<(), PoolError> {
        let pool = {
            let mut pools = self.pools.write().await;
            let pool = pools
                .get_mut(&pool_id)
                .ok_or(PoolError::PoolNotFound(pool_id))?;
            pool.status = PoolStatus::ScalingDown;
            pool.clone()
        };

        let provider = self.provider(&pool.provider)?;
        let members: Vec<WorkerId> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .filter(|w| w.pool_id == pool_id)
                .map(|w| w.id)
                .collect()
        };

        for worker_id in members {
            match with_retry_once(|| provider.delete_worker(worker_id, true)).await {
                Ok(_) => {
                    self.forget_worker(worker_id, "pool deleted").await;
                }
                Err(err) => {
                    // Left to the backend's own cleanup; reconcile finds it later.
                    error!(worker_id = %worker_id, error = %err, "Failed to destroy pool member");
                }
            }
        }

        {
            let mut pools = self.pools.write().await;
            pools.remove(&pool_id);
        }
        self.emit(PoolEventKind::PoolDeleted { pool_id });
        info!(pool_id = %pool_id, "Pool deleted");
        Ok(())
    }

    /// Scales a pool toward `target`.
    ///
    /// The target is clamped into the policy bounds. A resource shortfall
    /// scales as far as capacity allows and reports `Partial`; individual
    /// worker create/destroy failures never abort the action.
    pub async fn scale_pool(
        &self,
        pool_id: PoolId,
        target: u32,
        reason: &str,
        force: bool,
    ) -> Result<ScaleOutcome, PoolError> {
        let pool = self
            .get_pool(pool_id)
            .await
            .ok_or(PoolError::PoolNotFound(pool_id))?;
        if pool.status == PoolStatus::Terminated {
            return Err(PoolError::Terminated(pool_id));
        }

        let target = pool.policy.clamp(target);
        let from = pool.current_size;
        if target == from {
            return Ok(ScaleOutcome::NoActionNeeded);
        }

        let outcome = if target > from {
            self.scale_up(&pool, target, force).await?
        } else {
            self.scale_down(&pool, target, force).await?
        };

        let (to, desired) = match &outcome {
            ScaleOutcome::Scaled { to, .. } => (*to, target),
            ScaleOutcome::Partial { actual, .. } => (*actual, *actual),
            _ => (from, pool.desired_size),
        };

        {
            let mut pools = self.pools.write().await;
            if let Some(pool) = pools.get_mut(&pool_id) {
                pool.status = PoolStatus::Active;
                pool.desired_size = desired.max(pool.policy.min);
                pool.last_scaled_at = Some(self.clock.now());
            }
        }

        if to != from {
            self.emit(PoolEventKind::PoolScaled {
                pool_id,
                from,
                to,
                reason: reason.to_string(),
            });
            info!(pool_id = %pool_id, from, to, reason, "Pool scaled");
        }
        Ok(outcome)
    }

    async fn scale_up(
        &self,
        pool: &Pool,
        target: u32,
        _force: bool,
    ) -> Result<ScaleOutcome, PoolError> {
        let provider = self.provider(&pool.provider)?;
        self.set_status(pool.id, PoolStatus::ScalingUp).await;

        let wanted = (target - pool.current_size) as u64;
        let requests = pool.template.resources.parse().expect("validated template");
        let availability = provider.resource_availability().await?;
        let (can_accommodate, factor) = availability.accommodates(&requests);

        if can_accommodate == 0 {
            self.set_status(pool.id, PoolStatus::Active).await;
            return Ok(ScaleOutcome::ResourceConstraints {
                factors: vec![factor.to_string()],
            });
        }

        let allowed = wanted.min(can_accommodate) as u32;
        let cap = provider.info().capabilities.max_concurrent_creations.max(1);
        let semaphore = Arc::new(Semaphore::new(cap));

        let mut creations: FuturesUnordered<_> = (0..allowed)
            .map(|_| {
                let provider = Arc::clone(&provider);
                let semaphore = Arc::clone(&semaphore);
                let template = pool.template.clone();
                let pool_id = pool.id;
                async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                    with_retry_once(|| provider.create_worker(&template, pool_id)).await
                }
            })
            .collect();

        let mut added: Vec<WorkerId> = Vec::new();
        let mut failures = 0u32;
        let mut constrained = false;
        while let Some(result) = creations.next().await {
            match result {
                Ok(CreateWorkerOutcome::Created(worker)) => {
                    let worker_id = worker.id;
                    {
                        let mut workers = self.workers.write().await;
                        workers.insert(worker_id, worker);
                    }
                    {
                        let mut pools = self.pools.write().await;
                        if let Some(p) = pools.get_mut(&pool.id) {
                            p.current_size += 1;
                        }
                    }
                    added.push(worker_id);
                    self.emit(PoolEventKind::WorkerAdded {
                        pool_id: pool.id,
                        worker_id,
                    });
                }
                Ok(CreateWorkerOutcome::InsufficientResources { .. }) => {
                    constrained = true;
                }
                Ok(CreateWorkerOutcome::InvalidTemplate { issues }) => {
                    failures += 1;
                    error!(pool_id = %pool.id, ?issues, "Template rejected during scale-up");
                }
                Err(err) => {
                    failures += 1;
                    error!(pool_id = %pool.id, error = %err, "Worker creation failed");
                }
            }
        }

        let actual = pool.current_size + added.len() as u32;
        if actual == target {
            Ok(ScaleOutcome::Scaled {
                from: pool.current_size,
                to: target,
                affected: added,
            })
        } else {
            let reason = if allowed < wanted as u32 || constrained {
                factor.to_string()
            } else {
                format!("{failures} worker creations failed")
            };
            Ok(ScaleOutcome::Partial {
                from: pool.current_size,
                actual,
                target,
                reason,
            })
        }
    }

    async fn scale_down(
        &self,
        pool: &Pool,
        target: u32,
        force: bool,
    ) -> Result<ScaleOutcome, PoolError> {
        let provider = self.provider(&pool.provider)?;
        self.set_status(pool.id, PoolStatus::ScalingDown).await;

        let excess = (pool.current_size - target) as usize;

        // Idle workers go first, newest first; busy workers only under force.
        let mut members: Vec<Worker> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .filter(|w| w.pool_id == pool.id)
                .cloned()
                .collect()
        };
        members.sort_by(|a, b| {
            let busy_order = (a.active_jobs > 0).cmp(&(b.active_jobs > 0));
            busy_order.then(b.created_at.cmp(&a.created_at))
        });

        let victims: Vec<Worker> = members
            .into_iter()
            .filter(|w| force || w.active_jobs == 0)
            .take(excess)
            .collect();
        let kept_busy = victims.len() < excess;

        let mut removed: Vec<WorkerId> = Vec::new();
        for victim in victims {
            match with_retry_once(|| provider.delete_worker(victim.id, force)).await {
                Ok(DeleteWorkerOutcome::Deleted) => {
                    self.forget_worker(victim.id, "scaled down").await;
                    removed.push(victim.id);
                }
                Ok(DeleteWorkerOutcome::HasActiveJobs { active_jobs }) => {
                    warn!(worker_id = %victim.id, active_jobs, "Kept busy worker during scale-down");
                }
                Err(err) => {
                    error!(worker_id = %victim.id, error = %err, "Worker destruction failed");
                }
            }
        }

        let actual = pool.current_size - removed.len() as u32;
        if actual == target {
            Ok(ScaleOutcome::Scaled {
                from: pool.current_size,
                to: target,
                affected: removed,
            })
        } else {
            let reason = if kept_busy {
                "busy workers kept (force not set)".to_string()
            } else {
                "worker destruction failed".to_string()
            };
            Ok(ScaleOutcome::Partial {
                from: pool.current_size,
                actual,
                target,
                reason,
            })
        }
    }

    /// Scores pools for a job and returns the best match.
    ///
    /// Pools with available matching workers score `100 + 10 * available`,
    /// pools that could grow score 50, saturated pools score 0. A pool whose
    /// template capabilities cannot satisfy the requirements is skipped.
    /// Ties break by pool name.
    pub async fn find_best_pool_for_job(
        &self,
        requirements: &BTreeMap<String, String>,
    ) -> Option<PoolId> {
        let pools = self.pools.read().await;
        let workers = self.workers.read().await;

        let mut best: Option<(u64, String, PoolId)> = None;
        for pool in pools.values() {
            if pool.status == PoolStatus::Terminated || pool.status == PoolStatus::Draining {
                continue;
            }

            let available = workers
                .values()
                .filter(|w| {
                    w.pool_id == pool.id
                        && w.is_available()
                        && crate::job::requirements_satisfied(requirements, &w.capabilities)
                })
                .count() as u64;

            let score = if available > 0 {
                100 + available * 10
            } else if pool.can_grow()
                && crate::job::requirements_satisfied(requirements, &pool.template.capabilities)
            {
                50
            } else if crate::job::requirements_satisfied(requirements, &pool.template.capabilities)
            {
                0
            } else {
                continue;
            };

            let candidate = (score, pool.name.clone(), pool.id);
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    // Higher score wins; equal scores fall back to name order.
                    if candidate.0 > current.0
                        || (candidate.0 == current.0 && candidate.1 < current.1)
                    {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best.map(|(_, _, id)| id)
    }

    /// Returns a pool by id.
    pub async fn get_pool(&self, pool_id: PoolId) -> Option<Pool> {
        let pools = self.pools.read().await;
        pools.get(&pool_id).cloned()
    }

    /// Returns all pools.
    pub async fn list_pools(&self) -> Vec<Pool> {
        let pools = self.pools.read().await;
        pools.values().cloned().collect()
    }

    /// Returns a worker by id.
    pub async fn get_worker(&self, worker_id: WorkerId) -> Option<Worker> {
        let workers = self.workers.read().await;
        workers.get(&worker_id).cloned()
    }

    /// Returns every worker that could take a job right now.
    pub async fn available_candidates(&self) -> Vec<CandidateWorker> {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| w.is_available())
            .map(|w| CandidateWorker {
                id: w.id,
                capabilities: w.capabilities.clone(),
            })
            .collect()
    }

    /// Records a worker's registration: merges its declared capabilities
    /// and marks it ready.
    pub async fn record_registration(
        &self,
        worker_id: WorkerId,
        capabilities: BTreeMap<String, String>,
    ) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(&worker_id) {
            worker.capabilities.extend(capabilities);
            worker.status = WorkerStatus::Ready;
            worker.active_jobs = 0;
        }
    }

    /// Marks a worker ready with no active jobs.
    pub async fn mark_worker_ready(&self, worker_id: WorkerId) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(&worker_id) {
            worker.status = WorkerStatus::Ready;
            worker.active_jobs = 0;
        }
    }

    /// Marks a worker busy with the given active job count.
    pub async fn mark_worker_busy(&self, worker_id: WorkerId, active_jobs: u32) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(&worker_id) {
            worker.status = WorkerStatus::Busy;
            worker.active_jobs = active_jobs.max(1);
        }
    }

    /// Marks a worker failed or offline.
    pub async fn mark_worker_lost(&self, worker_id: WorkerId, status: WorkerStatus) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(&worker_id) {
            worker.status = status;
        }
    }

    /// Destroys a worker on its backend and drops it from the registry.
    pub async fn remove_worker(&self, worker_id: WorkerId, reason: &str) -> Result<(), PoolError> {
        let provider_name = {
            let workers = self.workers.read().await;
            let pools = self.pools.read().await;
            workers
                .get(&worker_id)
                .and_then(|w| pools.get(&w.pool_id))
                .map(|p| p.provider.clone())
        };

        if let Some(provider_name) = provider_name {
            let provider = self.provider(&provider_name)?;
            if let Err(err) = with_retry_once(|| provider.delete_worker(worker_id, true)).await {
                error!(worker_id = %worker_id, error = %err, "Backend worker destruction failed");
            }
        }
        self.forget_worker(worker_id, reason).await;
        Ok(())
    }

    /// Drops a worker from the registry and emits `WorkerRemoved`.
    async fn forget_worker(&self, worker_id: WorkerId, reason: &str) {
        let removed = {
            let mut workers = self.workers.write().await;
            workers.remove(&worker_id)
        };
        let Some(worker) = removed else { return };

        let new_size = {
            let mut pools = self.pools.write().await;
            match pools.get_mut(&worker.pool_id) {
                Some(pool) => {
                    pool.current_size = pool.current_size.saturating_sub(1);
                    pool.current_size
                }
                None => 0,
            }
        };
        self.emit(PoolEventKind::WorkerRemoved {
            pool_id: worker.pool_id,
            worker_id,
            reason: reason.to_string(),
            new_size,
        });
    }

    /// Re-syncs a pool's membership with what the provider reports.
    ///
    /// Workers the backend no longer knows are dropped; workers the backend
    /// reports but the registry lacks are adopted in `Provisioning` status.
    pub async fn reconcile_pool(&self, pool_id: PoolId) -> Result<(), PoolError> {
        let pool = self
            .get_pool(pool_id)
            .await
            .ok_or(PoolError::PoolNotFound(pool_id))?;
        let provider = self.provider(&pool.provider)?;
        let live = provider.list_workers(Some(pool_id)).await?;
        let live_ids: std::collections::HashSet<WorkerId> = live.iter().map(|w| w.id).collect();

        let stale: Vec<WorkerId> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .filter(|w| w.pool_id == pool_id && !live_ids.contains(&w.id))
                .map(|w| w.id)
                .collect()
        };
        for worker_id in stale {
            self.forget_worker(worker_id, "missing on provider").await;
        }

        let mut adopted = 0u32;
        {
            let mut workers = self.workers.write().await;
            for worker in live {
                workers.entry(worker.id).or_insert_with(|| {
                    adopted += 1;
                    worker
                });
            }
        }
        if adopted > 0 {
            let mut pools = self.pools.write().await;
            if let Some(pool) = pools.get_mut(&pool_id) {
                pool.current_size += adopted;
            }
        }
        Ok(())
    }

    /// Computes metrics for one pool.
    pub async fn pool_metrics(&self, pool_id: PoolId) -> Option<PoolMetrics> {
        let pool = self.get_pool(pool_id).await?;
        let workers = self.workers.read().await;

        let mut ready = 0u32;
        let mut busy = 0u32;
        for worker in workers.values().filter(|w| w.pool_id == pool_id) {
            match worker.status {
                WorkerStatus::Ready => ready += 1,
                WorkerStatus::Busy => busy += 1,
                _ => {}
            }
        }
        let denominator = ready + busy;
        Some(PoolMetrics {
            pool_id,
            name: pool.name,
            current_size: pool.current_size,
            desired_size: pool.desired_size,
            ready,
            busy,
            utilization: if denominator == 0 {
                0.0
            } else {
                busy as f64 / denominator as f64
            },
        })
    }

    /// Computes aggregate metrics across every pool.
    pub async fn overall_metrics(&self) -> OverallMetrics {
        let pools = self.pools.read().await;
        let workers = self.workers.read().await;

        let mut metrics = OverallMetrics {
            pools: pools.len(),
            ..Default::default()
        };
        for worker in workers.values() {
            metrics.total_workers += 1;
            match worker.status {
                WorkerStatus::Ready => metrics.ready_workers += 1,
                WorkerStatus::Busy => metrics.busy_workers += 1,
                _ => {}
            }
        }
        metrics
    }

    async fn set_status(&self, pool_id: PoolId, status: PoolStatus) {
        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get_mut(&pool_id) {
            pool.status = status;
        }
    }
}
