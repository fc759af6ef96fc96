//! Worker channel hub.
//!
//! The hub owns one bidirectional framed stream per registered worker and
//! multiplexes everything that flows over it: registration, heartbeats,
//! job dispatch, artifact staging, output, status updates, and control
//! signals.
//!
//! Concurrency model: each connection gets a reader task (messages are
//! processed strictly in arrival order) and a writer task (all sends are
//! serialized through one mpsc channel). Staging runs as a separate task
//! per dispatch so a waiting cache response never blocks the read loop;
//! the pending tables route responses back to the staging task.

pub mod protocol;
pub mod session;
pub mod staging;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactStore;
use crate::clock::Clock;
use crate::events::{EventBus, OrchestrationEventKind};
use crate::job::{Execution, ExecutionResult, JobId, JobStatus, QueuedJob, WorkerId};
use crate::pool::manager::PoolManager;
use crate::provider::{WorkerStatus, POOL_LABEL};
use crate::queue::{JobQueue, RequeueOutcome};
use crate::storage::JobRepository;

use protocol::{
    JobAssignment, JobRuntimeConfig, OrchestratorMessage, OutputStream, ProtocolError, Signal,
    WorkerMessage,
};
use session::{Session, SessionState};
use staging::{AckReceipt, PendingTables, StagingConfig, StagingError};

/// Reason recorded on jobs whose worker session died underneath them.
pub const CHANNEL_LOST_REASON: &str = "worker channel lost";

/// Hub timing configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Expected worker heartbeat cadence. Liveness window is three times
    /// this value.
    pub heartbeat_interval: Duration,
    /// How long a fresh connection gets to register.
    pub registration_timeout: Duration,
    /// Window for queueing the dispatch message to the writer.
    pub dispatch_send_timeout: Duration,
    /// How long a worker gets to acknowledge a cancel signal.
    pub cancel_ack_timeout: Duration,
    /// Grace period for in-flight jobs during shutdown.
    pub shutdown_grace: Duration,
    /// Staging knobs.
    pub staging: StagingConfig,
    /// Per-session writer backlog.
    pub session_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(10),
            dispatch_send_timeout: Duration::from_secs(10),
            cancel_ack_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            staging: StagingConfig::default(),
            session_buffer: 64,
        }
    }
}

impl HubConfig {
    /// The window after which a silent worker is declared offline.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// Errors raised by hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// The listener failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No live session for the worker.
    #[error("Worker {0} is not connected")]
    WorkerNotConnected(WorkerId),

    /// The job is not known to the hub or the queue.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// A cancel signal went unacknowledged.
    #[error("Worker {0} did not acknowledge cancellation")]
    CancelUnacknowledged(WorkerId),
}

/// Output forwarded from workers, for whatever sink subscribes.
#[derive(Debug, Clone)]
pub struct JobOutput {
    /// The producing job.
    pub job_id: JobId,
    /// stdout or stderr.
    pub stream: OutputStream,
    /// Raw bytes.
    pub data: Vec<u8>,
}

struct InflightJob {
    queued: QueuedJob,
    worker_id: WorkerId,
    execution: Option<Execution>,
}

/// The hub: session registry, dispatch engine, and protocol endpoint.
pub struct WorkerChannelHub {
    config: HubConfig,
    queue: Arc<JobQueue>,
    pools: Arc<PoolManager>,
    store: Arc<ArtifactStore>,
    jobs_repo: Arc<dyn JobRepository>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<WorkerId, Arc<Session>>>,
    pending: PendingTables,
    inflight: Mutex<HashMap<JobId, InflightJob>>,
    pending_cancels: Mutex<HashMap<JobId, oneshot::Sender<()>>>,
    output: broadcast::Sender<JobOutput>,
}

impl WorkerChannelHub {
    /// Creates a hub wired to its collaborators.
    pub fn new(
        config: HubConfig,
        queue: Arc<JobQueue>,
        pools: Arc<PoolManager>,
        store: Arc<ArtifactStore>,
        jobs_repo: Arc<dyn JobRepository>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (output, _) = broadcast::channel(1024);
        Self {
            config,
            queue,
            pools,
            store,
            jobs_repo,
            events,
            clock,
            sessions: RwLock::new(HashMap::new()),
            pending: PendingTables::default(),
            inflight: Mutex::new(HashMap::new()),
            pending_cancels: Mutex::new(HashMap::new()),
            output,
        }
    }

    /// Subscribes to forwarded job output.
    pub fn subscribe_output(&self) -> broadcast::Receiver<JobOutput> {
        self.output.subscribe()
    }

    /// Number of live sessions.
    pub async fn connected_workers(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Returns whether a worker has a live session.
    pub async fn is_connected(&self, worker_id: WorkerId) -> bool {
        self.sessions.read().await.contains_key(&worker_id)
    }

    /// Accepts worker connections until shutdown fires.
    ///
    /// Also runs the heartbeat liveness sweep as a sibling task.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: broadcast::Sender<()>,
    ) {
        let sweep = tokio::spawn(Arc::clone(&self).run_liveness(shutdown.subscribe()));
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Worker connection accepted");
                            tokio::spawn(Arc::clone(&self).handle_connection(stream));
                        }
                        Err(err) => {
                            warn!(error = %err, "Accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Hub stopping; cancelling in-flight jobs");
                    self.shutdown_sessions().await;
                    break;
                }
            }
        }
        sweep.abort();
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = transport::FramedReader::new(read_half);
        let mut writer = transport::FramedWriter::new(write_half);

        // The first frame must be a registration.
        let registration = tokio::time::timeout(
            self.config.registration_timeout,
            reader.read_frame::<WorkerMessage>(),
        )
        .await;
        let (worker_id, name, capabilities, labels) = match registration {
            Ok(Ok(Some(WorkerMessage::Register {
                worker_id,
                name,
                capabilities,
                labels,
            }))) => (worker_id, name, capabilities, labels),
            Ok(Ok(Some(_))) => {
                warn!(?peer, "First message was not a registration, closing");
                return;
            }
            Ok(Ok(None)) | Ok(Err(_)) => {
                debug!(?peer, "Connection closed before registration");
                return;
            }
            Err(_) => {
                warn!(?peer, "Registration window elapsed, closing");
                return;
            }
        };

        let pool_id = labels.get(POOL_LABEL).and_then(|v| v.parse().ok());
        let (outbound_tx, mut outbound_rx) = mpsc::channel(self.config.session_buffer);

        // Writer task: the single serialization point for this session.
        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(err) = writer.write_frame(&message).await {
                    warn!(error = %err, "Session write failed");
                    break;
                }
            }
        });

        let session = Arc::new(Session::new(
            worker_id,
            name,
            pool_id,
            capabilities.clone(),
            outbound_tx,
            self.clock.now(),
        ));
        if session.transition(SessionState::Ready).is_err() {
            return;
        }

        // A reconnect replaces any stale session for the same worker.
        let previous = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(worker_id, Arc::clone(&session))
        };
        if let Some(previous) = previous {
            warn!(worker_id = %worker_id, "Replacing stale session for reconnecting worker");
            previous.terminate();
        }
        crate::metrics::set_connected_workers(self.connected_workers().await);

        self.pools.record_registration(worker_id, capabilities).await;
        info!(worker_id = %worker_id, ?pool_id, "Worker registered");

        // Read loop: strict arrival order within the session. The closed
        // handle unblocks the loop when a termination is decided elsewhere
        // (liveness sweep, unacknowledged cancel, shutdown).
        let mut closed = session.closed_handle();
        let close_reason: (&str, WorkerStatus) = loop {
            tokio::select! {
                frame = reader.read_frame::<WorkerMessage>() => match frame {
                    Ok(Some(message)) => {
                        if let Err(violation) = self.handle_message(&session, message).await {
                            error!(
                                worker_id = %worker_id,
                                error = %violation,
                                "Protocol violation, terminating session"
                            );
                            break ("protocol violation", WorkerStatus::Failed);
                        }
                    }
                    Ok(None) => break ("connection closed", WorkerStatus::Offline),
                    Err(err) => {
                        warn!(worker_id = %worker_id, error = %err, "Session read failed");
                        match err {
                            ProtocolError::Io(_) => break ("transport error", WorkerStatus::Offline),
                            _ => break ("protocol violation", WorkerStatus::Failed),
                        }
                    }
                },
                _ = closed.changed() => {
                    break ("session closed", WorkerStatus::Offline);
                }
            }
        };

        self.finish_session(&session, close_reason.0, close_reason.1)
            .await;
        writer_task.abort();
    }

    async fn handle_message(
        self: &Arc<Self>,
        session: &Arc<Session>,
        message: WorkerMessage,
    ) -> Result<(), ProtocolError> {
        match message {
            WorkerMessage::Register { .. } => Err(ProtocolError::UnexpectedRegistration),
            WorkerMessage::Heartbeat {
                worker_id,
                status,
                active_jobs,
            } => {
                session.record_heartbeat(self.clock.now());
                match status {
                    WorkerStatus::Busy => {
                        self.pools.mark_worker_busy(worker_id, active_jobs).await;
                    }
                    WorkerStatus::Ready => {
                        self.pools.mark_worker_ready(worker_id).await;
                        if active_jobs == 0 && session.state() == SessionState::Ready {
                            self.try_dispatch(session).await;
                        }
                    }
                    other => {
                        self.pools.mark_worker_lost(worker_id, other).await;
                    }
                }
                Ok(())
            }
            WorkerMessage::StatusUpdate {
                job_id,
                status,
                exit_code,
                message,
            } => {
                self.handle_status_update(session, job_id, status, exit_code, message)
                    .await;
                Ok(())
            }
            WorkerMessage::OutputChunk {
                job_id,
                stream,
                sequence,
                data,
            } => {
                session.accept_output(job_id, sequence)?;
                // No subscribers is fine; output is best-effort observable.
                let _ = self.output.send(JobOutput {
                    job_id,
                    stream,
                    data,
                });
                Ok(())
            }
            WorkerMessage::ArtifactAck {
                artifact_id,
                success,
                cache_hit,
                calculated_checksum,
                cache_status,
                message,
            } => {
                let delivered = self.pending.resolve_ack(
                    session.worker_id,
                    artifact_id,
                    AckReceipt {
                        success,
                        cache_hit,
                        calculated_checksum,
                        cache_status,
                        message,
                    },
                );
                if !delivered {
                    debug!(
                        worker_id = %session.worker_id,
                        artifact_id = %artifact_id,
                        "Dropping ack with no waiter"
                    );
                }
                Ok(())
            }
            WorkerMessage::CacheResponse { job_id, artifacts } => {
                if !self.pending.resolve_cache(job_id, artifacts) {
                    // Likely a late answer after the TTL purge.
                    debug!(job_id = %job_id, "Dropping cache response with no waiter");
                }
                Ok(())
            }
        }
    }

    /// Offers work to an idle connected worker (queue processor path).
    pub async fn dispatch_to(self: &Arc<Self>, worker_id: WorkerId) {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(&worker_id).cloned()
        };
        if let Some(session) = session {
            self.try_dispatch(&session).await;
        }
    }

    /// Claims the next matching job for a ready session and starts staging.
    async fn try_dispatch(self: &Arc<Self>, session: &Arc<Session>) {
        if session.state() != SessionState::Ready {
            return;
        }
        let Some(queued) = self.queue.claim_next_for(&session.capabilities) else {
            return;
        };
        let job_id = queued.job.id;

        if session
            .transition(SessionState::Staging { job_id })
            .is_err()
        {
            // Lost a race against a concurrent state change; the claim goes
            // back untouched, without charging a retry.
            self.queue.restore(queued);
            return;
        }

        {
            let mut inflight = self.inflight.lock().await;
            inflight.insert(
                job_id,
                InflightJob {
                    queued,
                    worker_id: session.worker_id,
                    execution: None,
                },
            );
        }
        self.events.publish(OrchestrationEventKind::JobAssigned {
            job_id,
            worker_id: session.worker_id,
        });
        crate::metrics::set_queue_depth(self.queue.len());

        tokio::spawn(Arc::clone(self).run_staging(Arc::clone(session), job_id));
    }

    async fn run_staging(self: Arc<Self>, session: Arc<Session>, job_id: JobId) {
        let queued = {
            let inflight = self.inflight.lock().await;
            inflight.get(&job_id).map(|entry| entry.queued.clone())
        };
        let Some(queued) = queued else {
            // Cancelled before staging even started.
            let _ = session.transition(SessionState::Ready);
            session.clear_job(job_id);
            return;
        };

        let started = std::time::Instant::now();
        let result = staging::stage_job(
            &session,
            &self.pending,
            &self.store,
            &self.config.staging,
            &queued,
            self.clock.now(),
        )
        .await;

        match result {
            Ok(report) => {
                crate::metrics::observe_staging_duration(started.elapsed().as_secs_f64());
                debug!(
                    job_id = %job_id,
                    cache_hits = report.cache_hits,
                    transferred = report.transferred,
                    bytes = report.bytes_sent,
                    "Staging complete"
                );
                self.dispatch_job(&session, job_id).await;
            }
            Err(StagingError::Cancelled) => {
                let _ = session.transition(SessionState::Ready);
                session.clear_job(job_id);
                // cancel_job already finalized the job unless the flag beat it.
                self.finalize_cancel(job_id).await;
                self.pools.mark_worker_ready(session.worker_id).await;
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "Staging failed");
                let _ = session.transition(SessionState::Ready);
                session.clear_job(job_id);
                self.requeue_or_fail(job_id, &err.to_string()).await;
                self.pools.mark_worker_ready(session.worker_id).await;
            }
        }
    }

    /// Sends the job request: the single dispatch point for this job.
    async fn dispatch_job(self: &Arc<Self>, session: &Arc<Session>, job_id: JobId) {
        let (assignment, artifacts) = {
            let mut inflight = self.inflight.lock().await;
            let Some(entry) = inflight.get_mut(&job_id) else {
                // Cancelled between staging and dispatch.
                let _ = session.transition(SessionState::Ready);
                return;
            };
            let execution = Execution::start(job_id, session.worker_id, self.clock.now());
            let assignment = JobAssignment {
                job_id,
                execution_id: execution.id,
                name: entry.queued.job.spec.name.clone(),
                payload: entry.queued.job.spec.payload.clone(),
                timeout_seconds: entry.queued.job.spec.timeout_seconds,
            };
            entry.execution = Some(execution);
            let artifacts = entry
                .queued
                .job
                .spec
                .required_artifacts
                .iter()
                .filter_map(|id| self.store.metadata(*id))
                .collect();
            (assignment, artifacts)
        };
        let execution_id = assignment.execution_id;

        let request = OrchestratorMessage::JobRequest {
            job: assignment,
            config: JobRuntimeConfig {
                heartbeat_interval_seconds: self.config.heartbeat_interval.as_secs(),
                output_chunk_bytes: crate::artifact::CHUNK_SIZE as u64,
            },
            required_artifacts: artifacts,
        };

        let sent = tokio::time::timeout(self.config.dispatch_send_timeout, session.send(request))
            .await;
        match sent {
            Ok(Ok(())) => {
                let _ = session.transition(SessionState::Dispatched {
                    job_id,
                    execution_id,
                });
                session
                    .metrics
                    .jobs_dispatched
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                crate::metrics::record_dispatch();
                info!(job_id = %job_id, worker_id = %session.worker_id, "Job dispatched");
            }
            _ => {
                warn!(job_id = %job_id, "Dispatch send failed, requeueing");
                let _ = session.transition(SessionState::Ready);
                self.requeue_or_fail(job_id, "dispatch send failed").await;
            }
        }
    }

    async fn handle_status_update(
        self: &Arc<Self>,
        session: &Arc<Session>,
        job_id: JobId,
        status: protocol::JobStatus,
        exit_code: Option<i32>,
        message: Option<String>,
    ) {
        match status {
            protocol::JobStatus::Queued => {
                debug!(job_id = %job_id, "Worker echoed queued status");
            }
            protocol::JobStatus::Running => {
                let execution_id = {
                    let mut inflight = self.inflight.lock().await;
                    let Some(entry) = inflight.get_mut(&job_id) else {
                        debug!(job_id = %job_id, "Running update for unknown job");
                        return;
                    };
                    if let Err(err) = entry
                        .queued
                        .job
                        .transition(JobStatus::Running, self.clock.now())
                    {
                        warn!(job_id = %job_id, error = %err, "Ignoring illegal running update");
                        return;
                    }
                    self.persist(&entry.queued.job).await;
                    entry.execution.as_ref().map(|e| e.id)
                };
                let Some(execution_id) = execution_id else {
                    return;
                };
                let _ = session.transition(SessionState::Busy {
                    job_id,
                    execution_id,
                });
                self.pools.mark_worker_busy(session.worker_id, 1).await;
                self.events.publish(OrchestrationEventKind::JobStarted {
                    job_id,
                    worker_id: session.worker_id,
                });
            }
            protocol::JobStatus::Success
            | protocol::JobStatus::Failed
            | protocol::JobStatus::Cancelled => {
                self.handle_terminal_status(session, job_id, status, exit_code, message)
                    .await;
            }
        }
    }

    async fn handle_terminal_status(
        self: &Arc<Self>,
        session: &Arc<Session>,
        job_id: JobId,
        status: protocol::JobStatus,
        exit_code: Option<i32>,
        message: Option<String>,
    ) {
        // A cancel waiter is satisfied by any terminal report.
        if let Some(waiter) = self.pending_cancels.lock().await.remove(&job_id) {
            let _ = waiter.send(());
        }

        let entry = {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&job_id)
        };
        let Some(mut entry) = entry else {
            // Terminal statuses are immutable; late duplicates land here.
            debug!(job_id = %job_id, "Ignoring status update for finished job");
            return;
        };

        let now = self.clock.now();
        let result = match status {
            protocol::JobStatus::Success => ExecutionResult::success(exit_code.unwrap_or(0)),
            protocol::JobStatus::Cancelled => {
                ExecutionResult::failure(message.unwrap_or_else(|| "cancelled".to_string()))
            }
            _ => ExecutionResult::failure(
                message.unwrap_or_else(|| "worker reported failure".to_string()),
            ),
        };
        if let Some(execution) = entry.execution.as_mut() {
            execution.finish(result, now);
        }

        match status {
            protocol::JobStatus::Success => {
                // A worker may report success without ever reporting the
                // run; bridge the lifecycle through Running.
                if entry.queued.job.status == JobStatus::Queued {
                    let _ = entry.queued.job.transition(JobStatus::Running, now);
                }
                if entry.queued.job.transition(JobStatus::Completed, now).is_ok() {
                    self.persist(&entry.queued.job).await;
                }
                crate::metrics::record_job_terminal("completed");
                self.events.publish(OrchestrationEventKind::JobCompleted {
                    job_id,
                    success: true,
                });
            }
            protocol::JobStatus::Cancelled => {
                if entry.queued.job.transition(JobStatus::Cancelled, now).is_ok() {
                    self.persist(&entry.queued.job).await;
                }
                crate::metrics::record_job_terminal("cancelled");
                self.events.publish(OrchestrationEventKind::JobCompleted {
                    job_id,
                    success: false,
                });
            }
            _ => {
                let reason = entry
                    .execution
                    .as_ref()
                    .and_then(|e| e.result.as_ref())
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "worker reported failure".to_string());
                self.retry_or_fail_entry(entry, &reason).await;
            }
        }

        session.clear_job(job_id);
        let _ = session.transition(SessionState::Ready);
        self.pools.mark_worker_ready(session.worker_id).await;

        // A freed worker pulls the next matching job immediately.
        self.try_dispatch(session).await;
    }

    /// Requeues a failed in-flight job, or fails it past the retry ceiling.
    async fn requeue_or_fail(self: &Arc<Self>, job_id: JobId, reason: &str) {
        let entry = {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&job_id)
        };
        let Some(mut entry) = entry else { return };
        entry.execution = None;
        self.retry_or_fail_entry(entry, reason).await;
    }

    async fn retry_or_fail_entry(self: &Arc<Self>, entry: InflightJob, reason: &str) {
        let job_id = entry.queued.job.id;
        let mut fallback = entry.queued.clone();

        if entry.queued.can_retry() {
            if let RequeueOutcome::Requeued { retry_count } = self.queue.requeue(entry.queued) {
                self.events
                    .publish(OrchestrationEventKind::JobRetried {
                        job_id,
                        retry_count,
                    });
                crate::metrics::set_queue_depth(self.queue.len());
                info!(job_id = %job_id, retry_count, reason, "Job requeued for retry");
                return;
            }
        }

        let now = self.clock.now();
        if fallback.job.transition(JobStatus::Failed, now).is_ok() {
            self.persist(&fallback.job).await;
        }
        crate::metrics::record_job_terminal("failed");
        self.events.publish(OrchestrationEventKind::JobCompleted {
            job_id,
            success: false,
        });
        warn!(job_id = %job_id, reason, "Job failed permanently");
    }

    /// Cancels a job wherever it currently is.
    ///
    /// Queued jobs are removed outright. Staging jobs stop streaming and
    /// never dispatch. Dispatched or running jobs get a cancel signal; a
    /// worker that does not acknowledge within the window is marked failed
    /// and its session is terminated.
    pub async fn cancel_job(self: &Arc<Self>, job_id: JobId) -> Result<(), HubError> {
        // Still queued: remove and finish.
        if let Some(mut queued) = self.queue.remove(job_id) {
            let now = self.clock.now();
            if queued.job.transition(JobStatus::Cancelled, now).is_ok() {
                self.persist(&queued.job).await;
            }
            crate::metrics::record_job_terminal("cancelled");
            crate::metrics::set_queue_depth(self.queue.len());
            self.events.publish(OrchestrationEventKind::JobCompleted {
                job_id,
                success: false,
            });
            return Ok(());
        }

        let worker_id = {
            let inflight = self.inflight.lock().await;
            match inflight.get(&job_id) {
                Some(entry) => entry.worker_id,
                None => return Err(HubError::JobNotFound(job_id)),
            }
        };
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(&worker_id).cloned()
        };
        let Some(session) = session else {
            return Err(HubError::WorkerNotConnected(worker_id));
        };

        match session.state() {
            SessionState::Staging { job_id: staging } if staging == job_id => {
                session.mark_cancelled(job_id);
                self.pending.purge_job(worker_id, job_id);
                self.finalize_cancel(job_id).await;
                Ok(())
            }
            SessionState::Dispatched { job_id: active, .. }
            | SessionState::Busy { job_id: active, .. }
                if active == job_id =>
            {
                let (ack_tx, ack_rx) = oneshot::channel();
                self.pending_cancels.lock().await.insert(job_id, ack_tx);

                if session
                    .send(OrchestratorMessage::ControlSignal {
                        job_id,
                        signal: Signal::Cancel,
                    })
                    .await
                    .is_err()
                {
                    self.pending_cancels.lock().await.remove(&job_id);
                    return Err(HubError::WorkerNotConnected(worker_id));
                }

                match tokio::time::timeout(self.config.cancel_ack_timeout, ack_rx).await {
                    Ok(Ok(())) => Ok(()),
                    _ => {
                        self.pending_cancels.lock().await.remove(&job_id);
                        warn!(
                            worker_id = %worker_id,
                            job_id = %job_id,
                            "Cancel unacknowledged; terminating session"
                        );
                        self.finalize_cancel(job_id).await;
                        self.finish_session(&session, "cancel unacknowledged", WorkerStatus::Failed)
                            .await;
                        Err(HubError::CancelUnacknowledged(worker_id))
                    }
                }
            }
            _ => Err(HubError::JobNotFound(job_id)),
        }
    }

    /// Sends a pause or resume signal for a dispatched job.
    pub async fn signal_job(&self, job_id: JobId, signal: Signal) -> Result<(), HubError> {
        let worker_id = {
            let inflight = self.inflight.lock().await;
            match inflight.get(&job_id) {
                Some(entry) => entry.worker_id,
                None => return Err(HubError::JobNotFound(job_id)),
            }
        };
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(&worker_id).cloned()
        };
        match session {
            Some(session) => session
                .send(OrchestratorMessage::ControlSignal { job_id, signal })
                .await
                .map_err(|_| HubError::WorkerNotConnected(worker_id)),
            None => Err(HubError::WorkerNotConnected(worker_id)),
        }
    }

    /// Finishes cancellation bookkeeping for a job that never dispatched.
    async fn finalize_cancel(self: &Arc<Self>, job_id: JobId) {
        let entry = {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&job_id)
        };
        let Some(mut entry) = entry else { return };

        let now = self.clock.now();
        if entry.queued.job.transition(JobStatus::Cancelled, now).is_ok() {
            self.persist(&entry.queued.job).await;
        }
        crate::metrics::record_job_terminal("cancelled");
        self.events.publish(OrchestrationEventKind::JobCompleted {
            job_id,
            success: false,
        });
    }

    /// Tears down a session: registry, pending tables, in-flight job, pool
    /// bookkeeping.
    async fn finish_session(
        self: &Arc<Self>,
        session: &Arc<Session>,
        reason: &str,
        worker_status: WorkerStatus,
    ) {
        let worker_id = session.worker_id;
        {
            let mut sessions = self.sessions.write().await;
            // Only remove the registry entry if it is still this session;
            // a reconnect may have replaced it already.
            if sessions
                .get(&worker_id)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(&worker_id);
            }
        }
        crate::metrics::set_connected_workers(self.connected_workers().await);

        let previous = session.terminate();
        self.pending.purge_worker(worker_id);

        if let Some(job_id) = previous.job_id() {
            warn!(
                worker_id = %worker_id,
                job_id = %job_id,
                reason,
                "Session lost with job in flight"
            );
            // Transport losses read as "worker channel lost"; sessions cut
            // for misbehavior keep their specific reason.
            let job_reason = if worker_status == WorkerStatus::Failed {
                reason
            } else {
                CHANNEL_LOST_REASON
            };
            self.requeue_or_fail(job_id, job_reason).await;
        }

        self.pools.mark_worker_lost(worker_id, worker_status).await;
        if let Err(err) = self.pools.remove_worker(worker_id, reason).await {
            debug!(worker_id = %worker_id, error = %err, "Worker removal after session loss");
        }
        info!(worker_id = %worker_id, reason, "Session terminated");
    }

    /// Declares silent workers offline and purges expired cache waits.
    async fn run_liveness(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let window = chrono::Duration::from_std(self.config.liveness_window())
            .unwrap_or_else(|_| chrono::Duration::seconds(90));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.clock.now();

                    let silent: Vec<Arc<Session>> = {
                        let sessions = self.sessions.read().await;
                        sessions
                            .values()
                            .filter(|s| now - s.last_heartbeat() > window)
                            .cloned()
                            .collect()
                    };
                    for session in silent {
                        warn!(worker_id = %session.worker_id, "Heartbeat silence, declaring worker offline");
                        self.finish_session(&session, "heartbeat timeout", WorkerStatus::Offline)
                            .await;
                    }

                    // Cache verifications whose staging task died are failed
                    // back into the retry path.
                    let ttl = self.config.staging.cache_response_timeout * 2;
                    for job_id in self.pending.purge_expired(ttl, now) {
                        warn!(job_id = %job_id, "Purging expired cache verification");
                        self.requeue_or_fail(job_id, "cache verification expired").await;
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Cancels in-flight jobs and closes every session, within the grace
    /// period.
    async fn shutdown_sessions(self: &Arc<Self>) {
        let active: Vec<JobId> = {
            let inflight = self.inflight.lock().await;
            inflight.keys().copied().collect()
        };
        for job_id in &active {
            let worker_id = {
                let inflight = self.inflight.lock().await;
                inflight.get(job_id).map(|e| e.worker_id)
            };
            let Some(worker_id) = worker_id else { continue };
            let session = {
                let sessions = self.sessions.read().await;
                sessions.get(&worker_id).cloned()
            };
            if let Some(session) = session {
                let _ = session
                    .send(OrchestratorMessage::ControlSignal {
                        job_id: *job_id,
                        signal: Signal::Cancel,
                    })
                    .await;
            }
        }

        // Give workers the grace period to acknowledge.
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            if self.inflight.lock().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Shutdown grace elapsed with jobs still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let sessions: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        for session in sessions {
            self.finish_session(&session, "orchestrator shutdown", WorkerStatus::Terminating)
                .await;
        }
    }

    async fn persist(&self, job: &crate::job::Job) {
        if let Err(err) = self.jobs_repo.save(job).await {
            error!(job_id = %job.id, error = %err, "Failed to persist job record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Compression;
    use crate::clock::SystemClock;
    use crate::events::OrchestrationEvent;
    use crate::hub::protocol::{CacheEntry, CacheStatus};
    use crate::job::{JobPayload, JobSpec, PoolId};
    use crate::pool::manager::CreatePoolOutcome;
    use crate::pool::{PoolSpec, ScalingPolicy};
    use crate::provider::mock::MockProvider;
    use crate::provider::{Provider, WorkerTemplate};
    use crate::queue::QueueConfig;
    use crate::storage::InMemoryJobRepository;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use transport::{FramedReader, FramedWriter};

    struct Harness {
        hub: Arc<WorkerChannelHub>,
        queue: Arc<JobQueue>,
        pools: Arc<PoolManager>,
        repo: Arc<InMemoryJobRepository>,
        store: Arc<ArtifactStore>,
        events: EventBus,
        addr: SocketAddr,
        shutdown: broadcast::Sender<()>,
        pool_id: PoolId,
        worker_id: WorkerId,
        _dir: tempfile::TempDir,
    }

    async fn harness_with(config: HubConfig) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider = Arc::new(MockProvider::with_default_capacity("mock"));

        let mut providers: HashMap<String, Arc<dyn crate::provider::Provider>> = HashMap::new();
        providers.insert("mock".to_string(), Arc::clone(&provider) as _);
        let pools = Arc::new(PoolManager::new(providers, Arc::clone(&clock)));

        let spec = PoolSpec {
            name: "builders".to_string(),
            provider: "mock".to_string(),
            template: WorkerTemplate::new("builders", "fleet/agent:1")
                .with_capability("build", "true"),
            policy: ScalingPolicy {
                min: 1,
                max: 5,
                ..Default::default()
            },
        };
        let pool = match pools.create_pool(spec).await.unwrap() {
            CreatePoolOutcome::Created(pool) => pool,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let worker_id = provider
            .list_workers(Some(pool.id))
            .await
            .unwrap()
            .first()
            .unwrap()
            .id;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let queue = Arc::new(JobQueue::new(QueueConfig::default(), Arc::clone(&clock)));
        let repo = Arc::new(InMemoryJobRepository::new());
        let events = EventBus::new();

        let hub = Arc::new(WorkerChannelHub::new(
            config,
            Arc::clone(&queue),
            Arc::clone(&pools),
            Arc::clone(&store),
            Arc::clone(&repo) as Arc<dyn JobRepository>,
            events.clone(),
            clock,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(Arc::clone(&hub).run(listener, shutdown.clone()));

        Harness {
            hub,
            queue,
            pools,
            repo,
            store,
            events,
            addr,
            shutdown,
            pool_id: pool.id,
            worker_id,
            _dir: dir,
        }
    }

    async fn harness() -> Harness {
        // Roomy timings so nothing unrelated trips liveness windows.
        harness_with(HubConfig {
            heartbeat_interval: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(2),
            dispatch_send_timeout: Duration::from_secs(2),
            cancel_ack_timeout: Duration::from_millis(400),
            shutdown_grace: Duration::from_millis(400),
            staging: StagingConfig {
                cache_response_timeout: Duration::from_millis(800),
                artifact_ack_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            session_buffer: 64,
        })
        .await
    }

    struct WorkerStub {
        reader: FramedReader<OwnedReadHalf>,
        writer: FramedWriter<OwnedWriteHalf>,
        worker_id: WorkerId,
    }

    impl WorkerStub {
        async fn connect(harness: &Harness, capabilities: &[(&str, &str)]) -> Self {
            let stream = TcpStream::connect(harness.addr).await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut stub = Self {
                reader: FramedReader::new(read_half),
                writer: FramedWriter::new(write_half),
                worker_id: harness.worker_id,
            };

            let mut labels = BTreeMap::new();
            labels.insert(POOL_LABEL.to_string(), harness.pool_id.to_string());
            let capabilities: BTreeMap<String, String> = capabilities
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            stub.send(WorkerMessage::Register {
                worker_id: stub.worker_id,
                name: "stub-worker".to_string(),
                capabilities,
                labels,
            })
            .await;

            // Registration is processed asynchronously by the read loop.
            for _ in 0..50 {
                if harness.hub.is_connected(stub.worker_id).await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            stub
        }

        async fn send(&mut self, message: WorkerMessage) {
            self.writer.write_frame(&message).await.unwrap();
        }

        async fn recv(&mut self) -> OrchestratorMessage {
            tokio::time::timeout(Duration::from_secs(3), self.reader.read_frame())
                .await
                .expect("timed out waiting for orchestrator message")
                .expect("transport error")
                .expect("connection closed")
        }

        async fn recv_nothing(&mut self, window: Duration) {
            let result =
                tokio::time::timeout(window, self.reader.read_frame::<OrchestratorMessage>())
                    .await;
            assert!(result.is_err(), "expected silence, got {result:?}");
        }

        async fn heartbeat_ready(&mut self) {
            self.send(WorkerMessage::Heartbeat {
                worker_id: self.worker_id,
                status: WorkerStatus::Ready,
                active_jobs: 0,
            })
            .await;
        }

        async fn ack(&mut self, artifact_id: crate::job::ArtifactId, cache_hit: bool) {
            self.send(WorkerMessage::ArtifactAck {
                artifact_id,
                success: true,
                cache_hit,
                calculated_checksum: None,
                cache_status: CacheStatus {
                    count: 1,
                    size_bytes: 0,
                },
                message: None,
            })
            .await;
        }

        /// Receives one artifact's chunk stream, asserting order, and
        /// returns the chunk count.
        async fn drain_artifact(&mut self, expected_id: crate::job::ArtifactId) -> u32 {
            let mut count = 0u32;
            loop {
                match self.recv().await {
                    OrchestratorMessage::ArtifactChunk {
                        artifact_id,
                        sequence,
                        is_last,
                        ..
                    } => {
                        assert_eq!(artifact_id, expected_id);
                        assert_eq!(sequence, count);
                        count += 1;
                        if is_last {
                            return count;
                        }
                    }
                    other => panic!("expected chunk, got {other:?}"),
                }
            }
        }
    }

    fn job_spec(artifacts: Vec<crate::job::ArtifactId>) -> JobSpec {
        JobSpec::new(
            "build-job",
            JobPayload::Command {
                argv: vec!["make".to_string()],
            },
        )
        .with_requirement("build", "true")
        .with_artifacts(artifacts)
    }

    async fn wait_for_event(
        rx: &mut broadcast::Receiver<OrchestrationEvent>,
        predicate: impl Fn(&OrchestrationEventKind) -> bool,
    ) -> OrchestrationEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event bus closed");
            if predicate(&event.kind) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_happy_path_cache_miss_then_hit() {
        let harness = harness().await;
        let mut events = harness.events.subscribe();

        // Two artifacts stored uncompressed so chunk counts are exact.
        let a = harness
            .store
            .put("artifact-a", &vec![0xAAu8; 1024 * 1024], Compression::None)
            .await
            .unwrap();
        let b = harness
            .store
            .put("artifact-b", &vec![0xBBu8; 500 * 1024], Compression::None)
            .await
            .unwrap();

        let now = Utc::now();
        let first = crate::job::Job::new(job_spec(vec![a.id, b.id]), now);
        let first_id = first.id;
        harness.queue.enqueue(first);

        let mut stub = WorkerStub::connect(&harness, &[("build", "true")]).await;
        stub.heartbeat_ready().await;

        // Cache miss round: query, full transfer of both, then dispatch.
        match stub.recv().await {
            OrchestratorMessage::CacheQuery {
                job_id,
                artifact_ids,
            } => {
                assert_eq!(job_id, first_id);
                assert_eq!(artifact_ids, vec![a.id, b.id]);
                stub.send(WorkerMessage::CacheResponse {
                    job_id,
                    artifacts: artifact_ids
                        .iter()
                        .map(|id| CacheEntry {
                            artifact_id: *id,
                            cached: false,
                            cached_checksum: None,
                            needs_transfer: true,
                        })
                        .collect(),
                })
                .await;
            }
            other => panic!("expected cache query, got {other:?}"),
        }

        assert_eq!(stub.drain_artifact(a.id).await, 16);
        stub.ack(a.id, false).await;
        assert_eq!(stub.drain_artifact(b.id).await, 8);
        stub.ack(b.id, false).await;

        match stub.recv().await {
            OrchestratorMessage::JobRequest {
                job,
                required_artifacts,
                ..
            } => {
                assert_eq!(job.job_id, first_id);
                assert_eq!(required_artifacts.len(), 2);
            }
            other => panic!("expected job request, got {other:?}"),
        }

        stub.send(WorkerMessage::StatusUpdate {
            job_id: first_id,
            status: protocol::JobStatus::Running,
            exit_code: None,
            message: None,
        })
        .await;
        stub.send(WorkerMessage::StatusUpdate {
            job_id: first_id,
            status: protocol::JobStatus::Success,
            exit_code: Some(0),
            message: None,
        })
        .await;

        wait_for_event(&mut events, |kind| {
            matches!(kind, OrchestrationEventKind::JobCompleted { job_id, success: true } if *job_id == first_id)
        })
        .await;
        let persisted = harness.repo.find(first_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Completed);

        // Cache hit round: same artifacts, no chunks, straight to dispatch.
        let second = crate::job::Job::new(job_spec(vec![a.id, b.id]), Utc::now());
        let second_id = second.id;
        harness.queue.enqueue(second);
        stub.heartbeat_ready().await;

        match stub.recv().await {
            OrchestratorMessage::CacheQuery {
                job_id,
                artifact_ids,
            } => {
                stub.send(WorkerMessage::CacheResponse {
                    job_id,
                    artifacts: artifact_ids
                        .iter()
                        .map(|id| CacheEntry {
                            artifact_id: *id,
                            cached: true,
                            cached_checksum: None,
                            needs_transfer: false,
                        })
                        .collect(),
                })
                .await;
            }
            other => panic!("expected cache query, got {other:?}"),
        }
        stub.ack(a.id, true).await;
        stub.ack(b.id, true).await;

        match stub.recv().await {
            OrchestratorMessage::JobRequest { job, .. } => assert_eq!(job.job_id, second_id),
            other => panic!("expected direct job request, got {other:?}"),
        }

        harness.shutdown.send(()).ok();
    }

    #[tokio::test]
    async fn test_worker_crash_mid_job_requeues() {
        let harness = harness().await;
        let mut events = harness.events.subscribe();

        let job = crate::job::Job::new(job_spec(Vec::new()), Utc::now());
        let job_id = job.id;
        harness.queue.enqueue(job);

        let mut stub = WorkerStub::connect(&harness, &[("build", "true")]).await;
        stub.heartbeat_ready().await;

        match stub.recv().await {
            OrchestratorMessage::JobRequest { job, .. } => assert_eq!(job.job_id, job_id),
            other => panic!("expected job request, got {other:?}"),
        }
        stub.send(WorkerMessage::StatusUpdate {
            job_id,
            status: protocol::JobStatus::Running,
            exit_code: None,
            message: None,
        })
        .await;
        wait_for_event(&mut events, |kind| {
            matches!(kind, OrchestrationEventKind::JobStarted { .. })
        })
        .await;

        // Transport close without a terminal status.
        drop(stub);

        wait_for_event(&mut events, |kind| {
            matches!(kind, OrchestrationEventKind::JobRetried { job_id: id, retry_count: 1 } if *id == job_id)
        })
        .await;
        assert!(harness.queue.contains(job_id));
        assert!(harness.pools.get_worker(harness.worker_id).await.is_none());

        harness.shutdown.send(()).ok();
    }

    #[tokio::test]
    async fn test_out_of_order_output_terminates_session() {
        let harness = harness().await;
        let mut events = harness.events.subscribe();

        let job = crate::job::Job::new(job_spec(Vec::new()), Utc::now());
        let job_id = job.id;
        harness.queue.enqueue(job);

        let mut stub = WorkerStub::connect(&harness, &[("build", "true")]).await;
        stub.heartbeat_ready().await;
        let _ = stub.recv().await; // job request
        stub.send(WorkerMessage::StatusUpdate {
            job_id,
            status: protocol::JobStatus::Running,
            exit_code: None,
            message: None,
        })
        .await;

        stub.send(WorkerMessage::OutputChunk {
            job_id,
            stream: OutputStream::Stdout,
            sequence: 0,
            data: b"line one\n".to_vec(),
        })
        .await;
        // The gap (0, then 2) is the violation.
        stub.send(WorkerMessage::OutputChunk {
            job_id,
            stream: OutputStream::Stdout,
            sequence: 2,
            data: b"line three\n".to_vec(),
        })
        .await;

        wait_for_event(&mut events, |kind| {
            matches!(kind, OrchestrationEventKind::JobRetried { job_id: id, .. } if *id == job_id)
        })
        .await;
        for _ in 0..50 {
            if !harness.hub.is_connected(harness.worker_id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!harness.hub.is_connected(harness.worker_id).await);

        harness.shutdown.send(()).ok();
    }

    #[tokio::test]
    async fn test_cancel_during_staging_suppresses_dispatch() {
        let mut config = HubConfig {
            heartbeat_interval: Duration::from_secs(5),
            ..HubConfig::default()
        };
        // Slow the stream down so the cancel lands mid-staging.
        config.staging.inter_chunk_delay = Some(Duration::from_millis(40));
        config.staging.cache_response_timeout = Duration::from_millis(800);
        let harness = harness_with(config).await;
        let mut events = harness.events.subscribe();

        let artifact = harness
            .store
            .put("big", &vec![0xCCu8; 1024 * 1024], Compression::None)
            .await
            .unwrap();
        let job = crate::job::Job::new(job_spec(vec![artifact.id]), Utc::now());
        let job_id = job.id;
        harness.queue.enqueue(job);

        let mut stub = WorkerStub::connect(&harness, &[("build", "true")]).await;
        stub.heartbeat_ready().await;

        match stub.recv().await {
            OrchestratorMessage::CacheQuery {
                job_id,
                artifact_ids,
            } => {
                stub.send(WorkerMessage::CacheResponse {
                    job_id,
                    artifacts: artifact_ids
                        .iter()
                        .map(|id| CacheEntry {
                            artifact_id: *id,
                            cached: false,
                            cached_checksum: None,
                            needs_transfer: true,
                        })
                        .collect(),
                })
                .await;
            }
            other => panic!("expected cache query, got {other:?}"),
        }

        // Let a few chunks flow, then cancel.
        for _ in 0..3 {
            let _ = stub.recv().await;
        }
        harness.hub.cancel_job(job_id).await.unwrap();

        wait_for_event(&mut events, |kind| {
            matches!(kind, OrchestrationEventKind::JobCompleted { job_id: id, success: false } if *id == job_id)
        })
        .await;
        let persisted = harness.repo.find(job_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Cancelled);

        // A few in-flight chunks may still drain, but no dispatch follows.
        let mut saw_job_request = false;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(
                Duration::from_millis(100),
                stub.reader.read_frame::<OrchestratorMessage>(),
            )
            .await
            {
                Ok(Ok(Some(OrchestratorMessage::JobRequest { .. }))) => {
                    saw_job_request = true;
                    break;
                }
                Ok(Ok(Some(_))) => continue,
                _ => break,
            }
        }
        assert!(!saw_job_request);
        assert!(harness.hub.is_connected(harness.worker_id).await);

        harness.shutdown.send(()).ok();
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let harness = harness().await;

        let job = crate::job::Job::new(job_spec(Vec::new()), Utc::now());
        let job_id = job.id;
        harness.queue.enqueue(job);

        harness.hub.cancel_job(job_id).await.unwrap();
        assert!(!harness.queue.contains(job_id));
        assert_eq!(
            harness.repo.find(job_id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );

        harness.shutdown.send(()).ok();
    }

    #[tokio::test]
    async fn test_cancel_running_job_with_ack() {
        let harness = harness().await;

        let job = crate::job::Job::new(job_spec(Vec::new()), Utc::now());
        let job_id = job.id;
        harness.queue.enqueue(job);

        let mut stub = WorkerStub::connect(&harness, &[("build", "true")]).await;
        stub.heartbeat_ready().await;
        let _ = stub.recv().await; // job request
        stub.send(WorkerMessage::StatusUpdate {
            job_id,
            status: protocol::JobStatus::Running,
            exit_code: None,
            message: None,
        })
        .await;

        // The worker acknowledges the cancel with a terminal status.
        let hub = Arc::clone(&harness.hub);
        let cancel = tokio::spawn(async move { hub.cancel_job(job_id).await });

        match stub.recv().await {
            OrchestratorMessage::ControlSignal {
                job_id: signalled,
                signal: Signal::Cancel,
            } => assert_eq!(signalled, job_id),
            other => panic!("expected cancel signal, got {other:?}"),
        }
        stub.send(WorkerMessage::StatusUpdate {
            job_id,
            status: protocol::JobStatus::Cancelled,
            exit_code: None,
            message: None,
        })
        .await;

        cancel.await.unwrap().unwrap();
        assert_eq!(
            harness.repo.find(job_id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
        assert!(harness.hub.is_connected(harness.worker_id).await);

        harness.shutdown.send(()).ok();
    }

    #[tokio::test]
    async fn test_unacknowledged_cancel_fails_worker() {
        let harness = harness().await;

        let job = crate::job::Job::new(job_spec(Vec::new()), Utc::now());
        let job_id = job.id;
        harness.queue.enqueue(job);

        let mut stub = WorkerStub::connect(&harness, &[("build", "true")]).await;
        stub.heartbeat_ready().await;
        let _ = stub.recv().await; // job request

        // The stub never acknowledges the cancel signal.
        let err = harness.hub.cancel_job(job_id).await.unwrap_err();
        assert!(matches!(err, HubError::CancelUnacknowledged(_)));

        for _ in 0..50 {
            if !harness.hub.is_connected(harness.worker_id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!harness.hub.is_connected(harness.worker_id).await);

        harness.shutdown.send(()).ok();
    }

    #[tokio::test]
    async fn test_heartbeat_silence_declares_worker_offline() {
        let harness = harness_with(HubConfig {
            heartbeat_interval: Duration::from_millis(100),
            ..HubConfig::default()
        })
        .await;

        let mut stub = WorkerStub::connect(&harness, &[("build", "true")]).await;
        stub.heartbeat_ready().await;
        assert!(harness.hub.is_connected(harness.worker_id).await);

        // Silence beyond three intervals.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!harness.hub.is_connected(harness.worker_id).await);
        assert!(harness.pools.get_worker(harness.worker_id).await.is_none());

        harness.shutdown.send(()).ok();
    }

    #[tokio::test]
    async fn test_output_is_forwarded_in_order() {
        let harness = harness().await;
        let mut output = harness.hub.subscribe_output();

        let job = crate::job::Job::new(job_spec(Vec::new()), Utc::now());
        let job_id = job.id;
        harness.queue.enqueue(job);

        let mut stub = WorkerStub::connect(&harness, &[("build", "true")]).await;
        stub.heartbeat_ready().await;
        let _ = stub.recv().await; // job request
        stub.send(WorkerMessage::StatusUpdate {
            job_id,
            status: protocol::JobStatus::Running,
            exit_code: None,
            message: None,
        })
        .await;

        for (sequence, line) in [b"one\n".as_slice(), b"two\n".as_slice()].iter().enumerate() {
            stub.send(WorkerMessage::OutputChunk {
                job_id,
                stream: OutputStream::Stdout,
                sequence: sequence as u64,
                data: line.to_vec(),
            })
            .await;
        }

        let first = output.recv().await.unwrap();
        assert_eq!(first.data, b"one\n");
        let second = output.recv().await.unwrap();
        assert_eq!(second.data, b"two\n");

        harness.shutdown.send(()).ok();
    }
}
