//! Wire protocol between the orchestrator and its workers.
//!
//! Every message is a tagged variant on a common envelope, serialized as
//! JSON inside a length-prefixed frame. Binary chunk payloads travel
//! base64-encoded. Unknown variants, oversized frames, and out-of-order
//! chunk sequences are protocol violations that terminate the session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::{Artifact, Compression};
use crate::job::{ArtifactId, ExecutionId, JobId, JobPayload, WorkerId};
use crate::provider::WorkerStatus;

/// Frames beyond this size are rejected (chunks are 64 KiB; this leaves
/// generous headroom for envelope overhead and base64 expansion).
pub const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

/// Serde adapter carrying `Vec<u8>` as base64 text.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Job status as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns whether this status ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Which output stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Worker-side cache occupancy, reported with every artifact ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheStatus {
    /// Artifacts the worker holds.
    pub count: u64,
    /// Bytes the worker's cache occupies.
    pub size_bytes: u64,
}

/// One artifact's entry in a cache response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The artifact queried.
    pub artifact_id: ArtifactId,
    /// Whether the worker holds it.
    pub cached: bool,
    /// Checksum of the cached copy, when held.
    pub cached_checksum: Option<String>,
    /// Whether the orchestrator must stream it.
    pub needs_transfer: bool,
}

/// Control actions the orchestrator can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Cancel,
    Pause,
    Resume,
}

/// The job assignment carried by a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAssignment {
    /// The job being dispatched.
    pub job_id: JobId,
    /// The execution this dispatch opens.
    pub execution_id: ExecutionId,
    /// Job name.
    pub name: String,
    /// What to run.
    pub payload: JobPayload,
    /// Wall-clock timeout in seconds.
    pub timeout_seconds: u64,
}

/// Runtime configuration shipped with a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRuntimeConfig {
    /// How often the worker must heartbeat, in seconds.
    pub heartbeat_interval_seconds: u64,
    /// Chunk size the worker should use for output streaming.
    pub output_chunk_bytes: u64,
}

/// Messages a worker sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First message on a fresh connection.
    Register {
        worker_id: WorkerId,
        name: String,
        capabilities: BTreeMap<String, String>,
        labels: BTreeMap<String, String>,
    },
    /// Periodic self-report.
    Heartbeat {
        worker_id: WorkerId,
        status: WorkerStatus,
        active_jobs: u32,
    },
    /// A job status transition.
    StatusUpdate {
        job_id: JobId,
        status: JobStatus,
        exit_code: Option<i32>,
        message: Option<String>,
    },
    /// Streaming stdout/stderr from a running job.
    OutputChunk {
        job_id: JobId,
        stream: OutputStream,
        sequence: u64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Receipt for one artifact transfer (or cache hit).
    ArtifactAck {
        artifact_id: ArtifactId,
        success: bool,
        cache_hit: bool,
        calculated_checksum: Option<String>,
        cache_status: CacheStatus,
        message: Option<String>,
    },
    /// Answer to a cache query.
    CacheResponse {
        job_id: JobId,
        artifacts: Vec<CacheEntry>,
    },
}

/// Messages the orchestrator sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    /// The single dispatch point for a job, sent after staging completes.
    JobRequest {
        job: JobAssignment,
        config: JobRuntimeConfig,
        required_artifacts: Vec<Artifact>,
    },
    /// Asks which artifacts the worker already holds.
    CacheQuery {
        job_id: JobId,
        artifact_ids: Vec<ArtifactId>,
    },
    /// One piece of an artifact stream.
    ArtifactChunk {
        artifact_id: ArtifactId,
        sequence: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        is_last: bool,
        compression: Compression,
        original_size: u64,
    },
    /// A control action for a dispatched job.
    ControlSignal { job_id: JobId, signal: Signal },
}

/// Protocol violations and transport faults.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The transport failed.
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame declared a size beyond the limit.
    #[error("Frame of {size} bytes exceeds the {MAX_FRAME_BYTES}-byte limit")]
    FrameTooLarge { size: u32 },

    /// The payload was not a known message.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A chunk arrived out of sequence.
    #[error("Out-of-order chunk for artifact {artifact_id}: expected {expected}, got {got}")]
    OutOfOrderChunk {
        artifact_id: ArtifactId,
        expected: u64,
        got: u64,
    },

    /// A chunk arrived after the stream's `is_last` frame.
    #[error("Chunk for artifact {artifact_id} arrived after the final chunk")]
    ChunkAfterLast { artifact_id: ArtifactId },

    /// An output chunk arrived out of sequence.
    #[error("Out-of-order output for job {job_id}: expected {expected}, got {got}")]
    OutOfOrderOutput {
        job_id: JobId,
        expected: u64,
        got: u64,
    },

    /// A chunk stream ended without its terminal `is_last` chunk.
    #[error("Chunk stream for artifact {artifact_id} ended without a final chunk")]
    MissingFinalChunk { artifact_id: ArtifactId },

    /// The first message on a connection was not a registration.
    #[error("Expected registration, got another message")]
    RegistrationExpected,

    /// A registration arrived on an already-registered session.
    #[error("Unexpected registration on an established session")]
    UnexpectedRegistration,
}

/// Validates strictly increasing chunk sequences for one artifact stream.
///
/// Sequences are 0-based and must arrive without gaps, terminated by
/// exactly one `is_last` chunk.
#[derive(Debug)]
pub struct SequenceTracker {
    artifact_id: ArtifactId,
    next: u64,
    finished: bool,
}

impl SequenceTracker {
    /// Starts a tracker for one artifact stream.
    pub fn new(artifact_id: ArtifactId) -> Self {
        Self {
            artifact_id,
            next: 0,
            finished: false,
        }
    }

    /// Accepts the next chunk, failing on gaps, reordering, or chunks past
    /// the final one.
    pub fn accept(&mut self, sequence: u64, is_last: bool) -> Result<(), ProtocolError> {
        if self.finished {
            return Err(ProtocolError::ChunkAfterLast {
                artifact_id: self.artifact_id,
            });
        }
        if sequence != self.next {
            return Err(ProtocolError::OutOfOrderChunk {
                artifact_id: self.artifact_id,
                expected: self.next,
                got: sequence,
            });
        }
        self.next += 1;
        if is_last {
            self.finished = true;
        }
        Ok(())
    }

    /// Returns whether the stream saw its final chunk.
    pub fn is_complete(&self) -> bool {
        self.finished
    }
}
