//! Core job model.
//!
//! This module defines the identifiers and entities that flow through the
//! orchestrator:
//!
//! - `JobSpec`: a caller-supplied description of work to run
//! - `Job`: a submitted job with a monotonic status lifecycle
//! - `QueuedJob`: a job while it sits in the queue, with retry accounting
//! - `Execution`: the link between a running job and the worker running it

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default retry ceiling for a job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wall-clock timeout for a single job execution.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 1800;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Returns a short prefix suitable for human-readable names.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(
    /// Identifier of a submitted job.
    JobId
);
define_id!(
    /// Identifier of a worker instance.
    WorkerId
);
define_id!(
    /// Identifier of a worker pool.
    PoolId
);
define_id!(
    /// Identifier of a single job execution on a worker.
    ExecutionId
);
define_id!(
    /// Identifier of a content-addressed artifact.
    ArtifactId
);

/// Job priority, ordered from least to most urgent.
///
/// The queue orders strictly by this enum; within a priority, jobs are
/// dispatched in enqueue order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl Priority {
    /// All priorities, most urgent first (queue scan order).
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

/// What a worker should run for this job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// An argv-style command list.
    Command { argv: Vec<String> },
    /// An inline shell script.
    Script { source: String },
}

/// Lifecycle status of a job.
///
/// Transitions are monotonic: once a job reaches a terminal status
/// (`Completed`, `Failed`, `Cancelled`) it never changes again. The single
/// exception is `Queued -> Queued`, which models a retry re-enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(
                next,
                JobStatus::Queued | JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Running => matches!(
                next,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            ),
            // Terminal states are immutable.
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors raised by job state handling.
#[derive(Debug, Error)]
pub enum JobError {
    /// A status transition violated the lifecycle rules.
    #[error("Invalid job transition from '{from}' to '{to}'")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

/// Caller-supplied description of a job to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable job name.
    pub name: String,
    /// What to execute on the worker.
    pub payload: JobPayload,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Capability requirements matched exactly against worker capabilities.
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
    /// Artifacts that must be present on the worker before dispatch.
    #[serde(default)]
    pub required_artifacts: Vec<ArtifactId>,
    /// Deadline after which the job is considered expired in the queue.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Retry ceiling for this job.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wall-clock execution timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}

impl JobSpec {
    /// Creates a spec with default priority, retries, and timeout.
    pub fn new(name: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: Priority::Normal,
            requirements: BTreeMap::new(),
            required_artifacts: Vec::new(),
            deadline: None,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_JOB_TIMEOUT_SECS,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a capability requirement.
    pub fn with_requirement(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    /// Sets the required artifacts.
    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactId>) -> Self {
        self.required_artifacts = artifacts;
        self
    }

    /// Sets the deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the execution timeout.
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// A submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,
    /// The submitted specification.
    pub spec: JobSpec,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time of the most recent status change.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new job in `Queued` status.
    pub fn new(spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            spec,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a status transition, enforcing the lifecycle rules.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// A job while it sits in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    /// The queued job.
    pub job: Job,
    /// How many times this job has been re-enqueued after a failure.
    pub retry_count: u32,
    /// When the job entered the queue (reset on retry).
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Wraps a freshly submitted job.
    pub fn new(job: Job, now: DateTime<Utc>) -> Self {
        Self {
            job,
            retry_count: 0,
            enqueued_at: now,
        }
    }

    /// Returns whether the job's deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.job.spec.deadline.is_some_and(|d| now > d)
    }

    /// Returns whether another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.job.spec.max_retries
    }

    /// Returns how long the job has been waiting.
    pub fn wait_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.enqueued_at
    }
}

/// Outcome of a finished execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the job succeeded.
    pub success: bool,
    /// Process exit code, when the payload produced one.
    pub exit_code: Option<i32>,
    /// Error description for failed executions.
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A successful result with the given exit code.
    pub fn success(exit_code: i32) -> Self {
        Self {
            success: true,
            exit_code: Some(exit_code),
            error: None,
        }
    }

    /// A failed result with an error description.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            error: Some(error.into()),
        }
    }
}

/// The link between a `Running` job and the worker running it.
///
/// An execution exists only while its job is running; it is closed and
/// dropped when the job reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier.
    pub id: ExecutionId,
    /// The job being executed.
    pub job_id: JobId,
    /// The worker executing it.
    pub worker_id: WorkerId,
    /// When dispatch completed.
    pub started_at: DateTime<Utc>,
    /// When the terminal status arrived.
    pub finished_at: Option<DateTime<Utc>>,
    /// The outcome, present once finished.
    pub result: Option<ExecutionResult>,
}

impl Execution {
    /// Opens an execution for a dispatched job.
    pub fn start(job_id: JobId, worker_id: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::generate(),
            job_id,
            worker_id,
            started_at: now,
            finished_at: None,
            result: None,
        }
    }

    /// Closes the execution with a result.
    pub fn finish(&mut self, result: ExecutionResult, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        self.result = Some(result);
    }
}

/// Returns whether `capabilities` satisfies every entry of `requirements`.
///
/// Matching is exact key/value equality; an empty requirement map matches
/// any worker.
pub fn requirements_satisfied(
    requirements: &BTreeMap<String, String>,
    capabilities: &BTreeMap<String, String>,
) -> bool {
    requirements
        .iter()
        .all(|(key, value)| capabilities.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec::new(
            "build",
            JobPayload::Command {
                argv: vec!["make".to_string(), "all".to_string()],
            },
        )
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_job_lifecycle_happy_path() {
        let now = Utc::now();
        let mut job = Job::new(spec(), now);

        assert_eq!(job.status, JobStatus::Queued);
        job.transition(JobStatus::Running, now).unwrap();
        job.transition(JobStatus::Completed, now).unwrap();
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_terminal_status_is_immutable() {
        let now = Utc::now();
        let mut job = Job::new(spec(), now);
        job.transition(JobStatus::Running, now).unwrap();
        job.transition(JobStatus::Failed, now).unwrap();

        let err = job.transition(JobStatus::Completed, now).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_queued_to_queued_models_retry() {
        let now = Utc::now();
        let mut job = Job::new(spec(), now);
        job.transition(JobStatus::Queued, now).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_running_cannot_go_back_to_queued() {
        let now = Utc::now();
        let mut job = Job::new(spec(), now);
        job.transition(JobStatus::Running, now).unwrap();
        assert!(job.transition(JobStatus::Queued, now).is_err());
    }

    #[test]
    fn test_queued_job_expiry() {
        let now = Utc::now();
        let job = Job::new(
            spec().with_deadline(now + chrono::Duration::seconds(60)),
            now,
        );
        let queued = QueuedJob::new(job, now);

        assert!(!queued.is_expired(now));
        assert!(queued.is_expired(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_retry_ceiling() {
        let now = Utc::now();
        let job = Job::new(spec().with_max_retries(2), now);
        let mut queued = QueuedJob::new(job, now);

        assert!(queued.can_retry());
        queued.retry_count = 2;
        assert!(!queued.can_retry());
    }

    #[test]
    fn test_requirements_satisfied_exact_match() {
        let mut requirements = BTreeMap::new();
        requirements.insert("os".to_string(), "linux".to_string());
        requirements.insert("build".to_string(), "true".to_string());

        let mut capabilities = requirements.clone();
        capabilities.insert("arch".to_string(), "amd64".to_string());

        assert!(requirements_satisfied(&requirements, &capabilities));

        capabilities.insert("build".to_string(), "false".to_string());
        assert!(!requirements_satisfied(&requirements, &capabilities));
    }

    #[test]
    fn test_empty_requirements_match_anything() {
        assert!(requirements_satisfied(&BTreeMap::new(), &BTreeMap::new()));
    }

    #[test]
    fn test_id_roundtrip() {
        let id = JobId::generate();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_spec_serialization_defaults() {
        let json = r#"{"name":"j","payload":{"type":"script","source":"echo hi"}}"#;
        let spec: JobSpec = serde_json::from_str(json).unwrap();

        assert_eq!(spec.priority, Priority::Normal);
        assert_eq!(spec.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(spec.timeout_seconds, DEFAULT_JOB_TIMEOUT_SECS);
        assert!(spec.requirements.is_empty());
    }
}
