//! Orchestration coordinator.
//!
//! The single supervising context: owns the event bus and the long-running
//! tasks (queue processor, auto-scaling evaluator, metrics collector, hub
//! listener, resource monitor). Loop bodies that fail are retried with a
//! bounded, jittered backoff; a failing iteration never takes the
//! coordinator down.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::events::{EventBus, OrchestrationEventKind};
use crate::hub::WorkerChannelHub;
use crate::job::{Job, JobId, JobSpec, JobStatus};
use crate::monitor::ResourceMonitor;
use crate::pool::autoscaler::{AutoScaler, ScalingAction};
use crate::pool::manager::PoolManager;
use crate::pool::{OverallMetrics, PoolEventKind};
use crate::queue::{EnqueueOutcome, JobQueue, QueueStats};
use crate::storage::{JobRepository, PoolRepository};

/// Upper bound for loop-error backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Coordinator loop cadences.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Queue processor cadence.
    pub queue_poll_interval: Duration,
    /// Auto-scaling evaluation cadence.
    pub autoscale_interval: Duration,
    /// Metrics collection cadence.
    pub metrics_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_poll_interval: Duration::from_secs(1),
            autoscale_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// Errors raised by job submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The spec failed validation.
    #[error("Invalid job: {0}")]
    Invalid(String),

    /// The queue is at capacity.
    #[error("Queue is full")]
    QueueFull,

    /// A job with this id is already queued.
    #[error("Job already queued")]
    AlreadyQueued,
}

/// Point-in-time view of the whole system.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemMetrics {
    /// Queue snapshot.
    pub queue: QueueStats,
    /// Pool aggregate.
    pub pools: OverallMetrics,
    /// Live hub sessions.
    pub connected_workers: usize,
    /// When the snapshot was taken.
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

/// The top-level supervising process.
pub struct OrchestrationCoordinator {
    config: CoordinatorConfig,
    queue: Arc<JobQueue>,
    pools: Arc<PoolManager>,
    hub: Arc<WorkerChannelHub>,
    monitor: Arc<ResourceMonitor>,
    scaler: Arc<AutoScaler>,
    events: EventBus,
    jobs_repo: Arc<dyn JobRepository>,
    pools_repo: Arc<dyn PoolRepository>,
    clock: Arc<dyn Clock>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OrchestrationCoordinator {
    /// Wires the coordinator to its subsystems.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoordinatorConfig,
        queue: Arc<JobQueue>,
        pools: Arc<PoolManager>,
        hub: Arc<WorkerChannelHub>,
        monitor: Arc<ResourceMonitor>,
        events: EventBus,
        jobs_repo: Arc<dyn JobRepository>,
        pools_repo: Arc<dyn PoolRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            queue,
            pools,
            hub,
            monitor,
            scaler: Arc::new(AutoScaler::new()),
            events,
            jobs_repo,
            pools_repo,
            clock,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The event bus this coordinator publishes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Submits a job for execution.
    pub async fn submit_job(&self, spec: JobSpec) -> Result<JobId, SubmitError> {
        let job = Job::new(spec, self.clock.now());
        let job_id = job.id;

        match self.queue.enqueue(job.clone()) {
            EnqueueOutcome::Accepted { queue_size } => {
                if let Err(err) = self.jobs_repo.save(&job).await {
                    error!(job_id = %job_id, error = %err, "Failed to persist submitted job");
                }
                crate::metrics::set_queue_depth(queue_size);
                self.events
                    .publish(OrchestrationEventKind::JobQueued { job_id });
                info!(job_id = %job_id, queue_size, "Job queued");
                Ok(job_id)
            }
            EnqueueOutcome::QueueFull => Err(SubmitError::QueueFull),
            EnqueueOutcome::AlreadyQueued => Err(SubmitError::AlreadyQueued),
            EnqueueOutcome::Invalid { reason } => Err(SubmitError::Invalid(reason)),
        }
    }

    /// Cancels a job wherever it is.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), crate::hub::HubError> {
        self.hub.cancel_job(job_id).await
    }

    /// Computes a system metrics snapshot.
    pub async fn system_metrics(&self) -> SystemMetrics {
        SystemMetrics {
            queue: self.queue.stats(),
            pools: self.pools.overall_metrics().await,
            connected_workers: self.hub.connected_workers().await,
            taken_at: self.clock.now(),
        }
    }

    /// Starts every supervised task. The listener feeds the hub.
    pub async fn start(self: &Arc<Self>, listener: TcpListener) {
        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(
            Arc::clone(&self.hub).run(listener, self.shutdown.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.monitor).run(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).run_queue_processor(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).run_autoscaler(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).run_metrics_collector(self.shutdown.subscribe()),
        ));
        // Subscribe before returning so pools created right after start
        // cannot slip past the forwarder.
        let pool_events = self.pools.subscribe_events();
        tasks.push(tokio::spawn(
            Arc::clone(self).run_pool_event_forwarder(pool_events, self.shutdown.subscribe()),
        ));

        self.events.publish(OrchestrationEventKind::SystemStarted);
        info!("Orchestration coordinator started");
    }

    /// Stops every task: loops observe the signal, finish their current
    /// iteration, and exit; the hub cancels in-flight jobs within its
    /// grace period.
    pub async fn stop(&self) {
        info!("Orchestration coordinator stopping");
        let _ = self.shutdown.send(());

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = tokio::time::timeout(Duration::from_secs(60), task).await {
                warn!(error = %err, "Supervised task did not stop in time");
            }
        }
        self.events.publish(OrchestrationEventKind::SystemStopped);
        info!("Orchestration coordinator stopped");
    }

    /// Queue processor: offer queued work to available workers.
    async fn run_queue_processor(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.queue_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.process_queue_once().await;
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn process_queue_once(&self) {
        // Expired jobs first (policy-dependent sweep).
        for mut expired in self.queue.sweep_expired() {
            let now = self.clock.now();
            warn!(job_id = %expired.job.id, "Failing job expired past its deadline");
            if expired.job.transition(JobStatus::Failed, now).is_ok() {
                if let Err(err) = self.jobs_repo.save(&expired.job).await {
                    error!(job_id = %expired.job.id, error = %err, "Failed to persist expired job");
                }
            }
            crate::metrics::record_job_terminal("failed");
            self.events.publish(OrchestrationEventKind::JobCompleted {
                job_id: expired.job.id,
                success: false,
            });
        }

        if self.queue.is_empty() {
            return;
        }
        let hub = &self.hub;
        for candidate in self.pools.available_candidates().await {
            if self.queue.is_empty() {
                break;
            }
            if self.queue.peek_next_for(std::slice::from_ref(&candidate)).is_some() {
                hub.dispatch_to(candidate.id).await;
            }
        }
        crate::metrics::set_queue_depth(self.queue.len());
    }

    /// Auto-scaling evaluator: run evaluations, execute proposals.
    async fn run_autoscaler(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.autoscale_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.autoscale_once().await {
                        error!(error = %err, "Auto-scaling pass failed");
                        sleep_with_jitter(&mut backoff).await;
                    } else {
                        backoff = Duration::from_secs(1);
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn autoscale_once(&self) -> Result<(), crate::pool::manager::PoolError> {
        let snapshot = self.monitor.latest();
        let evaluations = self
            .scaler
            .evaluate_all(&self.pools, &self.queue, snapshot)
            .await;

        for evaluation in evaluations {
            crate::metrics::record_scaler_decision(match evaluation.action {
                ScalingAction::ScaleUp => "scale_up",
                ScalingAction::ScaleDown => "scale_down",
                ScalingAction::Maintain => "maintain",
                ScalingAction::InsufficientData => "insufficient_data",
            });
            if !matches!(
                evaluation.action,
                ScalingAction::ScaleUp | ScalingAction::ScaleDown
            ) {
                continue;
            }

            info!(
                pool_id = %evaluation.pool_id,
                action = ?evaluation.action,
                from = evaluation.current_size,
                to = evaluation.recommended,
                confidence = evaluation.confidence,
                reason = %evaluation.reason,
                "Executing auto-scaling proposal"
            );
            self.events
                .publish(OrchestrationEventKind::AutoScalingTriggered {
                    pool_id: evaluation.pool_id,
                    from: evaluation.current_size,
                    to: evaluation.recommended,
                });
            self.pools
                .scale_pool(
                    evaluation.pool_id,
                    evaluation.recommended,
                    &evaluation.reason,
                    false,
                )
                .await?;
        }
        Ok(())
    }

    /// Re-announces pool lifecycle on the orchestration bus.
    async fn run_pool_event_forwarder(
        self: Arc<Self>,
        mut pool_events: broadcast::Receiver<crate::pool::PoolEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = pool_events.recv() => match event {
                    Ok(event) => {
                        if let PoolEventKind::PoolCreated { pool_id, .. } = event.kind {
                            self.events
                                .publish(OrchestrationEventKind::PoolCreated { pool_id });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Pool event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Metrics collector: snapshot gauges and persist pool records.
    async fn run_metrics_collector(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.metrics_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect_metrics_once().await;
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn collect_metrics_once(&self) {
        crate::metrics::set_queue_depth(self.queue.len());
        crate::metrics::set_connected_workers(self.hub.connected_workers().await);
        for pool in self.pools.list_pools().await {
            crate::metrics::set_pool_size(&pool.name, pool.current_size);
            if let Err(err) = self.pools_repo.save(&pool).await {
                error!(pool_id = %pool.id, error = %err, "Failed to persist pool record");
            }
        }
        self.events.publish(OrchestrationEventKind::MetricsCollected);
    }
}

/// Sleeps for the current backoff (with up to 20% jitter), then doubles it
/// up to the cap.
async fn sleep_with_jitter(backoff: &mut Duration) {
    let jitter = 1.0 + 0.2 * rand::random::<f64>();
    let wait = backoff.mul_f64(jitter).min(MAX_BACKOFF);
    tokio::time::sleep(wait).await;
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
}
