//! Per-worker session state.
//!
//! A session is the live channel to one registered worker. Within a
//! session messages are processed strictly in arrival order; the state
//! machine below makes each step explicit:
//!
//! ```text
//! INIT -> READY -> STAGING -> DISPATCHED -> BUSY -> READY -> ...
//!   any state ----------------------------------> TERMINATED
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::job::{ExecutionId, JobId, PoolId, WorkerId};

use super::protocol::{OrchestratorMessage, ProtocolError};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, registration not yet processed.
    Init,
    /// Registered and idle.
    Ready,
    /// Artifact staging for a claimed job is underway.
    Staging { job_id: JobId },
    /// The job request went out; waiting for the worker to start.
    Dispatched {
        job_id: JobId,
        execution_id: ExecutionId,
    },
    /// The worker reported the job running.
    Busy {
        job_id: JobId,
        execution_id: ExecutionId,
    },
    /// The session is gone; no further transitions.
    Terminated,
}

impl SessionState {
    /// Returns the job this state is carrying, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            SessionState::Staging { job_id }
            | SessionState::Dispatched { job_id, .. }
            | SessionState::Busy { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Returns whether moving to `next` is legal.
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        if matches!(next, Terminated) {
            return !matches!(self, Terminated);
        }
        match (self, next) {
            (Init, Ready) => true,
            (Ready, Staging { .. }) => true,
            (Staging { .. }, Dispatched { .. }) => true,
            // Staging aborts (cancel, failed ack, timeout) fall back to ready.
            (Staging { .. }, Ready) => true,
            (Dispatched { .. }, Busy { .. }) => true,
            // A worker may report a terminal status without ever reporting
            // the job running.
            (Dispatched { .. }, Ready) => true,
            (Busy { .. }, Ready) => true,
            _ => false,
        }
    }
}

/// Errors raised by session handling.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An illegal state transition was attempted.
    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// The worker's channel is gone; nothing can be sent.
    #[error("Session channel to worker {0} closed")]
    ChannelClosed(WorkerId),
}

/// Per-session transfer counters.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    /// Artifact cache hits observed on this session.
    pub cache_hits: AtomicU64,
    /// Artifacts that required a transfer.
    pub cache_misses: AtomicU64,
    /// Compressed bytes streamed to the worker.
    pub bytes_transferred: AtomicU64,
    /// Jobs dispatched over this session.
    pub jobs_dispatched: AtomicU64,
}

impl SessionMetrics {
    /// Cache hit rate across the session, in `[0, 1]`.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// The live session for one registered worker.
pub struct Session {
    /// The registered worker.
    pub worker_id: WorkerId,
    /// Its self-reported name.
    pub name: String,
    /// Pool binding inferred from the registration labels.
    pub pool_id: Option<PoolId>,
    /// Declared capability set.
    pub capabilities: BTreeMap<String, String>,
    /// Transfer counters.
    pub metrics: SessionMetrics,
    outbound: mpsc::Sender<OrchestratorMessage>,
    state: Mutex<SessionState>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    cancelled: Mutex<HashSet<JobId>>,
    output_sequences: Mutex<HashMap<JobId, u64>>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Creates a session in `Init` state.
    pub fn new(
        worker_id: WorkerId,
        name: String,
        pool_id: Option<PoolId>,
        capabilities: BTreeMap<String, String>,
        outbound: mpsc::Sender<OrchestratorMessage>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id,
            name,
            pool_id,
            capabilities,
            metrics: SessionMetrics::default(),
            outbound,
            state: Mutex::new(SessionState::Init),
            last_heartbeat: Mutex::new(now),
            cancelled: Mutex::new(HashSet::new()),
            output_sequences: Mutex::new(HashMap::new()),
            closed: watch::channel(false).0,
        }
    }

    /// Returns a handle that resolves once the session is terminated.
    ///
    /// The hub's read loop selects on this so a termination decided
    /// elsewhere (liveness sweep, unacknowledged cancel) unblocks it.
    pub fn closed_handle(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Queues a message for the writer task.
    pub async fn send(&self, message: OrchestratorMessage) -> Result<(), SessionError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::ChannelClosed(self.worker_id))
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    /// Applies a state transition, enforcing the lifecycle table.
    pub fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let mut state = self.state.lock().expect("session state lock poisoned");
        if !state.can_transition_to(&next) {
            return Err(SessionError::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        *state = next;
        Ok(())
    }

    /// Forces the terminal state (always legal except from Terminated).
    pub fn terminate(&self) -> SessionState {
        let mut state = self.state.lock().expect("session state lock poisoned");
        let previous = *state;
        *state = SessionState::Terminated;
        let _ = self.closed.send(true);
        previous
    }

    /// Records a heartbeat arrival.
    pub fn record_heartbeat(&self, now: DateTime<Utc>) {
        let mut last = self
            .last_heartbeat
            .lock()
            .expect("heartbeat lock poisoned");
        *last = now;
    }

    /// Returns the last heartbeat time.
    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self
            .last_heartbeat
            .lock()
            .expect("heartbeat lock poisoned")
    }

    /// Flags a job as cancelled so in-flight staging stops streaming.
    pub fn mark_cancelled(&self, job_id: JobId) {
        let mut cancelled = self.cancelled.lock().expect("cancel set lock poisoned");
        cancelled.insert(job_id);
    }

    /// Returns whether staging for a job was cancelled.
    pub fn is_cancelled(&self, job_id: JobId) -> bool {
        let cancelled = self.cancelled.lock().expect("cancel set lock poisoned");
        cancelled.contains(&job_id)
    }

    /// Drops cancellation bookkeeping for a finished job.
    pub fn clear_job(&self, job_id: JobId) {
        let mut cancelled = self.cancelled.lock().expect("cancel set lock poisoned");
        cancelled.remove(&job_id);
        let mut sequences = self
            .output_sequences
            .lock()
            .expect("output sequence lock poisoned");
        sequences.remove(&job_id);
    }

    /// Validates the sequence of an output chunk for a job. Output chunks
    /// carry a single 0-based counter per job and must arrive without gaps.
    pub fn accept_output(&self, job_id: JobId, sequence: u64) -> Result<(), ProtocolError> {
        let mut sequences = self
            .output_sequences
            .lock()
            .expect("output sequence lock poisoned");
        let expected = sequences.entry(job_id).or_insert(0);
        if sequence != *expected {
            return Err(ProtocolError::OutOfOrderOutput {
                job_id,
                expected: *expected,
                got: sequence,
            });
        }
        *expected += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Session, mpsc::Receiver<OrchestratorMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Session::new(
                WorkerId::generate(),
                "w-1".to_string(),
                Some(PoolId::generate()),
                BTreeMap::new(),
                tx,
                Utc::now(),
            ),
            rx,
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let (session, _rx) = session();
        let job_id = JobId::generate();
        let execution_id = ExecutionId::generate();

        session.transition(SessionState::Ready).unwrap();
        session
            .transition(SessionState::Staging { job_id })
            .unwrap();
        session
            .transition(SessionState::Dispatched {
                job_id,
                execution_id,
            })
            .unwrap();
        session
            .transition(SessionState::Busy {
                job_id,
                execution_id,
            })
            .unwrap();
        session.transition(SessionState::Ready).unwrap();

        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let (session, _rx) = session();
        let err = session
            .transition(SessionState::Busy {
                job_id: JobId::generate(),
                execution_id: ExecutionId::generate(),
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }

    #[test]
    fn test_staging_can_abort_to_ready() {
        let (session, _rx) = session();
        session.transition(SessionState::Ready).unwrap();
        session
            .transition(SessionState::Staging {
                job_id: JobId::generate(),
            })
            .unwrap();
        session.transition(SessionState::Ready).unwrap();
    }

    #[test]
    fn test_terminate_is_always_reachable_once() {
        let (session, _rx) = session();
        assert_eq!(session.terminate(), SessionState::Init);
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.transition(SessionState::Ready).is_err());
    }

    #[test]
    fn test_state_exposes_current_job() {
        let job_id = JobId::generate();
        let state = SessionState::Staging { job_id };
        assert_eq!(state.job_id(), Some(job_id));
        assert_eq!(SessionState::Ready.job_id(), None);
    }

    #[test]
    fn test_cancellation_bookkeeping() {
        let (session, _rx) = session();
        let job_id = JobId::generate();

        assert!(!session.is_cancelled(job_id));
        session.mark_cancelled(job_id);
        assert!(session.is_cancelled(job_id));
        session.clear_job(job_id);
        assert!(!session.is_cancelled(job_id));
    }

    #[test]
    fn test_output_sequence_validation() {
        let (session, _rx) = session();
        let job_id = JobId::generate();

        session.accept_output(job_id, 0).unwrap();
        session.accept_output(job_id, 1).unwrap();
        assert!(session.accept_output(job_id, 3).is_err());
    }

    #[test]
    fn test_metrics_hit_rate() {
        let metrics = SessionMetrics::default();
        assert_eq!(metrics.cache_hit_rate(), 0.0);

        metrics.cache_hits.store(3, Ordering::Relaxed);
        metrics.cache_misses.store(1, Ordering::Relaxed);
        assert!((metrics.cache_hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
