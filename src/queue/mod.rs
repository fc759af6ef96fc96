//! In-memory priority job queue.
//!
//! The queue stores submitted jobs in (priority descending, enqueue time
//! ascending) order with deduplication by job id. Selection is a linear scan
//! in that order: the first job whose capability requirements are satisfied
//! by a candidate worker wins, so FIFO holds within a priority.
//!
//! Concurrent enqueues are serialized through the queue's internal mutex;
//! `claim_next_for` removes the selected entry under the same lock, which is
//! what makes dispatch at-most-once.
//!
//! Jobs whose deadline has passed are never selected. Depending on the
//! configured [`ExpiryPolicy`] they either stay queued (surfaced through
//! [`QueueStats::expired`]) or are swept out and failed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::job::{Job, JobId, JobStatus, Priority, QueuedJob, WorkerId};

/// Default queue capacity.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;

/// What to do with jobs whose deadline has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryPolicy {
    /// Keep expired jobs in the queue but never dispatch them.
    #[default]
    Skip,
    /// Remove expired jobs and mark them failed during the expiry sweep.
    Fail,
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued jobs.
    pub max_size: usize,
    /// Expired-job handling policy.
    pub on_expiry: ExpiryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_QUEUE_SIZE,
            on_expiry: ExpiryPolicy::Skip,
        }
    }
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was accepted; carries the queue size after insertion.
    Accepted { queue_size: usize },
    /// The queue is at capacity; the queue is unchanged.
    QueueFull,
    /// A job with the same id is already queued.
    AlreadyQueued,
    /// The job failed validation.
    Invalid { reason: String },
}

/// Outcome of a requeue attempt after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// The job went back into the queue for another attempt.
    Requeued { retry_count: u32 },
    /// The retry ceiling was reached; the job was not requeued.
    RetriesExhausted,
    /// The queue is at capacity; the job was not requeued.
    QueueFull,
}

/// A dispatch candidate: a worker id plus its declared capabilities.
#[derive(Debug, Clone)]
pub struct CandidateWorker {
    /// The worker's identifier.
    pub id: WorkerId,
    /// Exact-match capability set.
    pub capabilities: BTreeMap<String, String>,
}

/// Snapshot of queue state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Total queued jobs.
    pub total: usize,
    /// Queued jobs per priority.
    pub per_priority: BTreeMap<Priority, usize>,
    /// Age of the oldest queued job, in seconds.
    pub oldest_wait_seconds: Option<i64>,
    /// Mean wait across all queued jobs, in seconds.
    pub average_wait_seconds: f64,
    /// Queued jobs whose deadline has passed.
    pub expired: usize,
}

/// Ordering key: higher priority first, then enqueue time, then submission
/// sequence to break same-instant ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority_rank: u8,
    enqueued_at: DateTime<Utc>,
    seq: u64,
}

impl QueueKey {
    fn new(priority: Priority, enqueued_at: DateTime<Utc>, seq: u64) -> Self {
        // Critical maps to rank 0 so the BTreeMap iterates it first.
        let priority_rank = match priority {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        };
        Self {
            priority_rank,
            enqueued_at,
            seq,
        }
    }
}

struct QueueInner {
    entries: BTreeMap<QueueKey, QueuedJob>,
    by_id: HashMap<JobId, QueueKey>,
    seq: u64,
}

impl QueueInner {
    fn insert(&mut self, queued: QueuedJob) {
        let key = QueueKey::new(queued.job.spec.priority, queued.enqueued_at, self.seq);
        self.seq += 1;
        self.by_id.insert(queued.job.id, key);
        self.entries.insert(key, queued);
    }

    fn remove(&mut self, job_id: JobId) -> Option<QueuedJob> {
        let key = self.by_id.remove(&job_id)?;
        self.entries.remove(&key)
    }
}

/// Priority-ordered in-memory job queue with deduplication.
pub struct JobQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    /// Creates an empty queue.
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(QueueInner {
                entries: BTreeMap::new(),
                by_id: HashMap::new(),
                seq: 0,
            }),
        }
    }

    /// Enqueues a submitted job.
    ///
    /// Rejects duplicates by job id, enforces the capacity limit, and
    /// validates that every capability requirement key is non-empty.
    pub fn enqueue(&self, job: Job) -> EnqueueOutcome {
        if job.status != JobStatus::Queued {
            return EnqueueOutcome::Invalid {
                reason: format!("job status is '{}', expected 'queued'", job.status),
            };
        }
        if job.spec.name.trim().is_empty() {
            return EnqueueOutcome::Invalid {
                reason: "job name must not be empty".to_string(),
            };
        }
        if job.spec.requirements.keys().any(|k| k.trim().is_empty()) {
            return EnqueueOutcome::Invalid {
                reason: "capability requirement keys must not be empty".to_string(),
            };
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        if inner.by_id.contains_key(&job.id) {
            return EnqueueOutcome::AlreadyQueued;
        }
        if inner.entries.len() >= self.config.max_size {
            return EnqueueOutcome::QueueFull;
        }

        inner.insert(QueuedJob::new(job, now));
        EnqueueOutcome::Accepted {
            queue_size: inner.entries.len(),
        }
    }

    /// Puts a failed job back for another attempt.
    ///
    /// Increments the retry count, resets the enqueue time, and applies the
    /// `Queued -> Queued` transition. Past the retry ceiling the job is not
    /// requeued and the caller is expected to fail it.
    pub fn requeue(&self, mut queued: QueuedJob) -> RequeueOutcome {
        if !queued.can_retry() {
            return RequeueOutcome::RetriesExhausted;
        }

        let now = self.clock.now();
        queued.retry_count += 1;
        queued.enqueued_at = now;
        queued.job.status = JobStatus::Queued;
        queued.job.updated_at = now;
        let retry_count = queued.retry_count;

        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.entries.len() >= self.config.max_size {
            return RequeueOutcome::QueueFull;
        }
        inner.insert(queued);
        RequeueOutcome::Requeued { retry_count }
    }

    /// Reinserts a claimed job unchanged, without charging a retry.
    ///
    /// Used when a claim is abandoned before any dispatch attempt was made.
    pub fn restore(&self, queued: QueuedJob) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.by_id.contains_key(&queued.job.id) {
            return;
        }
        inner.insert(queued);
    }

    /// Removes a job from the queue. Idempotent.
    pub fn remove(&self, job_id: JobId) -> Option<QueuedJob> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.remove(job_id)
    }

    /// Returns (without removing) the next job dispatchable to any of the
    /// given candidate workers.
    pub fn peek_next_for(&self, candidates: &[CandidateWorker]) -> Option<QueuedJob> {
        let now = self.clock.now();
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .entries
            .values()
            .find(|queued| Self::dispatchable(queued, candidates, now))
            .cloned()
    }

    /// Atomically selects and removes the next job whose requirements are
    /// satisfied by `capabilities`.
    ///
    /// This is the at-most-once handoff point: the entry leaves the queue
    /// under the lock, so two sessions can never claim the same job.
    pub fn claim_next_for(&self, capabilities: &BTreeMap<String, String>) -> Option<QueuedJob> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let key = inner
            .entries
            .iter()
            .find(|(_, queued)| {
                !queued.is_expired(now)
                    && crate::job::requirements_satisfied(
                        &queued.job.spec.requirements,
                        capabilities,
                    )
            })
            .map(|(key, _)| *key)?;

        let queued = inner.entries.remove(&key)?;
        inner.by_id.remove(&queued.job.id);
        Some(queued)
    }

    /// Removes and returns jobs that outlived their deadline.
    ///
    /// With [`ExpiryPolicy::Skip`] this is a no-op; with
    /// [`ExpiryPolicy::Fail`] the caller receives the expired jobs and is
    /// responsible for failing them.
    pub fn sweep_expired(&self) -> Vec<QueuedJob> {
        if self.config.on_expiry == ExpiryPolicy::Skip {
            return Vec::new();
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let expired_keys: Vec<QueueKey> = inner
            .entries
            .iter()
            .filter(|(_, queued)| queued.is_expired(now))
            .map(|(key, _)| *key)
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|key| {
                let queued = inner.entries.remove(&key)?;
                inner.by_id.remove(&queued.job.id);
                Some(queued)
            })
            .collect()
    }

    /// Counts queued, unexpired jobs whose requirements the given capability
    /// set satisfies. The auto-scaler uses this as per-pool queue pressure.
    pub fn pending_matching(&self, capabilities: &BTreeMap<String, String>) -> usize {
        let now = self.clock.now();
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .entries
            .values()
            .filter(|queued| {
                !queued.is_expired(now)
                    && crate::job::requirements_satisfied(
                        &queued.job.spec.requirements,
                        capabilities,
                    )
            })
            .count()
    }

    /// Returns whether a job is currently queued.
    pub fn contains(&self, job_id: JobId) -> bool {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.by_id.contains_key(&job_id)
    }

    /// Returns the number of queued jobs.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.entries.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Computes a stats snapshot.
    pub fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        let inner = self.inner.lock().expect("queue lock poisoned");

        let mut per_priority: BTreeMap<Priority, usize> = BTreeMap::new();
        let mut expired = 0usize;
        let mut total_wait = 0i64;
        let mut oldest: Option<i64> = None;

        for queued in inner.entries.values() {
            *per_priority.entry(queued.job.spec.priority).or_insert(0) += 1;
            if queued.is_expired(now) {
                expired += 1;
            }
            let wait = queued.wait_time(now).num_seconds();
            total_wait += wait;
            oldest = Some(oldest.map_or(wait, |o: i64| o.max(wait)));
        }

        let total = inner.entries.len();
        QueueStats {
            total,
            per_priority,
            oldest_wait_seconds: oldest,
            average_wait_seconds: if total == 0 {
                0.0
            } else {
                total_wait as f64 / total as f64
            },
            expired,
        }
    }

    fn dispatchable(
        queued: &QueuedJob,
        candidates: &[CandidateWorker],
        now: DateTime<Utc>,
    ) -> bool {
        if queued.is_expired(now) {
            return false;
        }
        candidates.iter().any(|candidate| {
            crate::job::requirements_satisfied(
                &queued.job.spec.requirements,
                &candidate.capabilities,
            )
        })
    }
}
