//! Artifact staging: the cache-aware transfer phase that precedes dispatch.
//!
//! For a claimed job the hub asks the worker which required artifacts it
//! already holds (`CacheQuery`/`CacheResponse`), streams only the missing
//! ones as ordered 64 KiB chunks, and collects one `ArtifactAck` per
//! artifact. Only when every artifact is acked (or cache-hit) does the
//! dispatch message go out.
//!
//! The pending tables correlate responses with waiting staging tasks: the
//! session read loop resolves entries as messages arrive, and entries that
//! outlive their TTL are purged by the hub's liveness sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::artifact::{self, Artifact, ArtifactStore, CodecError, Compression, StoreError};
use crate::job::{ArtifactId, JobId, QueuedJob, WorkerId};

use super::protocol::{
    CacheEntry, CacheStatus, OrchestratorMessage, ProtocolError, SequenceTracker,
};
use super::session::Session;

/// Worker capability key advertising zstd decompression support.
pub const ZSTD_CAPABILITY: &str = "zstd";

/// Timing and sizing knobs for staging.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    /// How long a worker gets to answer a cache query.
    pub cache_response_timeout: Duration,
    /// How long a worker gets to ack one artifact.
    pub artifact_ack_timeout: Duration,
    /// Transfer chunk size.
    pub chunk_size: usize,
    /// Optional pause between chunks; a scheduling hint, not protocol.
    pub inter_chunk_delay: Option<Duration>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            cache_response_timeout: Duration::from_secs(5),
            artifact_ack_timeout: Duration::from_secs(30),
            chunk_size: artifact::CHUNK_SIZE,
            inter_chunk_delay: None,
        }
    }
}

/// Why staging stopped short of dispatch.
#[derive(Debug, Error)]
pub enum StagingError {
    /// A required artifact is not in the store.
    #[error("Required artifact {0} is not registered in the store")]
    ArtifactMissing(ArtifactId),

    /// Reading artifact bytes failed.
    #[error("Artifact store error: {0}")]
    Store(#[from] StoreError),

    /// Compressing the payload failed.
    #[error("Artifact codec error: {0}")]
    Codec(#[from] CodecError),

    /// The worker rejected an artifact (checksum mismatch or local failure).
    #[error("Worker rejected artifact {artifact_id}: {reason}")]
    AckRejected {
        artifact_id: ArtifactId,
        reason: String,
    },

    /// No ack arrived inside the per-artifact window.
    #[error("Timed out waiting for ack of artifact {0}")]
    AckTimeout(ArtifactId),

    /// The worker claimed an artifact was cached but did not ack a hit.
    #[error("Worker broke the cache contract for artifact {0}")]
    CacheContractViolation(ArtifactId),

    /// The session's send channel closed mid-staging.
    #[error("Worker channel lost during staging")]
    ChannelLost,

    /// The outgoing chunk stream broke the sequencing contract. A contract
    /// breach in the sender, not a worker fault; the dispatch is aborted.
    #[error("Chunk stream contract breach: {0}")]
    Protocol(#[from] ProtocolError),

    /// The job was cancelled while staging.
    #[error("Job cancelled during staging")]
    Cancelled,
}

/// What one artifact ack reported.
#[derive(Debug, Clone)]
pub struct AckReceipt {
    /// Whether the worker accepted the artifact.
    pub success: bool,
    /// Whether the worker served it from cache.
    pub cache_hit: bool,
    /// Checksum the worker computed.
    pub calculated_checksum: Option<String>,
    /// Worker cache occupancy after the ack.
    pub cache_status: CacheStatus,
    /// Optional detail, mostly on failure.
    pub message: Option<String>,
}

struct PendingCache {
    worker_id: WorkerId,
    requested_at: DateTime<Utc>,
    sender: oneshot::Sender<Vec<CacheEntry>>,
}

/// Correlation tables between staging tasks and session read loops.
#[derive(Default)]
pub struct PendingTables {
    cache: Mutex<HashMap<JobId, PendingCache>>,
    acks: Mutex<HashMap<(WorkerId, ArtifactId), oneshot::Sender<AckReceipt>>>,
}

impl PendingTables {
    /// Registers a cache-query waiter for a job.
    fn await_cache(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> oneshot::Receiver<Vec<CacheEntry>> {
        let (sender, receiver) = oneshot::channel();
        let mut cache = self.cache.lock().expect("pending cache lock poisoned");
        cache.insert(
            job_id,
            PendingCache {
                worker_id,
                requested_at: now,
                sender,
            },
        );
        receiver
    }

    /// Delivers a cache response to its waiter. Returns false for unknown
    /// or expired queries (a late answer after the TTL purge is benign).
    pub fn resolve_cache(&self, job_id: JobId, entries: Vec<CacheEntry>) -> bool {
        let pending = {
            let mut cache = self.cache.lock().expect("pending cache lock poisoned");
            cache.remove(&job_id)
        };
        match pending {
            Some(pending) => pending.sender.send(entries).is_ok(),
            None => false,
        }
    }

    /// Registers an ack waiter for one artifact on one worker.
    fn await_ack(
        &self,
        worker_id: WorkerId,
        artifact_id: ArtifactId,
    ) -> oneshot::Receiver<AckReceipt> {
        let (sender, receiver) = oneshot::channel();
        let mut acks = self.acks.lock().expect("pending ack lock poisoned");
        acks.insert((worker_id, artifact_id), sender);
        receiver
    }

    /// Delivers an artifact ack to its waiter.
    pub fn resolve_ack(
        &self,
        worker_id: WorkerId,
        artifact_id: ArtifactId,
        receipt: AckReceipt,
    ) -> bool {
        let pending = {
            let mut acks = self.acks.lock().expect("pending ack lock poisoned");
            acks.remove(&(worker_id, artifact_id))
        };
        match pending {
            Some(sender) => sender.send(receipt).is_ok(),
            None => false,
        }
    }

    /// Drops every entry belonging to a job on a worker.
    pub fn purge_job(&self, worker_id: WorkerId, job_id: JobId) {
        {
            let mut cache = self.cache.lock().expect("pending cache lock poisoned");
            cache.remove(&job_id);
        }
        let mut acks = self.acks.lock().expect("pending ack lock poisoned");
        acks.retain(|(owner, _), _| *owner != worker_id);
    }

    /// Drops every entry belonging to a worker (session teardown).
    pub fn purge_worker(&self, worker_id: WorkerId) {
        {
            let mut cache = self.cache.lock().expect("pending cache lock poisoned");
            cache.retain(|_, pending| pending.worker_id != worker_id);
        }
        let mut acks = self.acks.lock().expect("pending ack lock poisoned");
        acks.retain(|(owner, _), _| *owner != worker_id);
    }

    /// Purges cache entries older than `ttl`, returning the affected jobs.
    pub fn purge_expired(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<JobId> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(5));
        let mut cache = self.cache.lock().expect("pending cache lock poisoned");
        let expired: Vec<JobId> = cache
            .iter()
            .filter(|(_, pending)| now - pending.requested_at > ttl)
            .map(|(job_id, _)| *job_id)
            .collect();
        for job_id in &expired {
            cache.remove(job_id);
        }
        expired
    }

    /// Number of outstanding cache verifications.
    pub fn pending_cache_count(&self) -> usize {
        self.cache.lock().expect("pending cache lock poisoned").len()
    }
}

/// Transfer accounting for one staged job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingReport {
    /// Artifacts served from the worker cache.
    pub cache_hits: u32,
    /// Artifacts streamed over the channel.
    pub transferred: u32,
    /// Compressed bytes sent.
    pub bytes_sent: u64,
}

/// Picks the transfer compression for an artifact on a given worker.
///
/// Zstd requires the worker capability; without it the sender falls back
/// to gzip and records a warning metric.
pub fn effective_compression(
    hint: Compression,
    capabilities: &std::collections::BTreeMap<String, String>,
) -> Compression {
    match hint {
        Compression::Zstd if capabilities.get(ZSTD_CAPABILITY).map(String::as_str) != Some("true") =>
        {
            warn!("Worker lacks zstd support, falling back to gzip");
            crate::metrics::record_zstd_fallback();
            Compression::Gzip
        }
        other => other,
    }
}

/// Runs the full staging exchange for one job on one session.
///
/// On success every required artifact is verified present on the worker
/// and the caller may dispatch. On error the caller decides between
/// requeue and failure; pending-table entries for the job are already
/// cleaned up.
pub async fn stage_job(
    session: &Session,
    tables: &PendingTables,
    store: &ArtifactStore,
    config: &StagingConfig,
    job: &QueuedJob,
    now: DateTime<Utc>,
) -> Result<StagingReport, StagingError> {
    let job_id = job.job.id;
    let required = &job.job.spec.required_artifacts;
    if required.is_empty() {
        return Ok(StagingReport::default());
    }

    // Resolve metadata up front so a missing artifact fails before any I/O.
    let mut artifacts: Vec<Artifact> = Vec::with_capacity(required.len());
    for artifact_id in required {
        artifacts.push(
            store
                .metadata(*artifact_id)
                .ok_or(StagingError::ArtifactMissing(*artifact_id))?,
        );
    }

    let result = run_exchange(session, tables, store, config, job_id, &artifacts, now).await;
    if result.is_err() {
        tables.purge_job(session.worker_id, job_id);
    }
    result
}

async fn run_exchange(
    session: &Session,
    tables: &PendingTables,
    store: &ArtifactStore,
    config: &StagingConfig,
    job_id: JobId,
    artifacts: &[Artifact],
    now: DateTime<Utc>,
) -> Result<StagingReport, StagingError> {
    let worker_id = session.worker_id;

    // 1. Cache query. A timeout means transfer everything.
    let cache_rx = tables.await_cache(job_id, worker_id, now);
    session
        .send(OrchestratorMessage::CacheQuery {
            job_id,
            artifact_ids: artifacts.iter().map(|a| a.id).collect(),
        })
        .await
        .map_err(|_| StagingError::ChannelLost)?;

    let entries: Vec<CacheEntry> =
        match tokio::time::timeout(config.cache_response_timeout, cache_rx).await {
            Ok(Ok(entries)) => entries,
            _ => {
                tables.purge_job(worker_id, job_id);
                debug!(job_id = %job_id, "Cache response window elapsed, transferring all artifacts");
                Vec::new()
            }
        };
    let cached: HashMap<ArtifactId, &CacheEntry> =
        entries.iter().map(|e| (e.artifact_id, e)).collect();

    let mut report = StagingReport::default();

    // 2. Per artifact: stream if needed, then collect the ack.
    for artifact in artifacts {
        if session.is_cancelled(job_id) {
            return Err(StagingError::Cancelled);
        }

        let entry = cached.get(&artifact.id);
        let needs_transfer = entry.map_or(true, |e| e.needs_transfer);
        let claimed_cached = entry.is_some_and(|e| e.cached && !e.needs_transfer);

        // The waiter must exist before the worker can possibly answer.
        let ack_rx = tables.await_ack(worker_id, artifact.id);

        if needs_transfer {
            let bytes = store.read(artifact.id).await?;
            let compression = effective_compression(artifact.compression_hint, &session.capabilities);
            let compressed = artifact::compress(&bytes, compression)?;
            let original_size = bytes.len() as u64;

            let total_chunks = artifact::chunk_count(compressed.len(), config.chunk_size);
            // Every emitted chunk passes the same ordering contract the
            // receiver holds us to: strictly increasing sequences and
            // exactly one terminal chunk.
            let mut tracker = SequenceTracker::new(artifact.id);
            for (index, chunk) in chunk_iter(&compressed, config.chunk_size).enumerate() {
                if session.is_cancelled(job_id) {
                    return Err(StagingError::Cancelled);
                }
                let sequence = index as u64;
                let is_last = index + 1 == total_chunks;
                tracker.accept(sequence, is_last)?;
                session
                    .send(OrchestratorMessage::ArtifactChunk {
                        artifact_id: artifact.id,
                        sequence: sequence as u32,
                        data: chunk.to_vec(),
                        is_last,
                        compression,
                        original_size,
                    })
                    .await
                    .map_err(|_| StagingError::ChannelLost)?;
                if let Some(delay) = config.inter_chunk_delay {
                    tokio::time::sleep(delay).await;
                }
            }
            if !tracker.is_complete() {
                return Err(StagingError::Protocol(ProtocolError::MissingFinalChunk {
                    artifact_id: artifact.id,
                }));
            }
            report.bytes_sent += compressed.len() as u64;
            crate::metrics::record_artifact_bytes(compressed.len() as u64);
        }

        let receipt = match tokio::time::timeout(config.artifact_ack_timeout, ack_rx).await {
            Ok(Ok(receipt)) => receipt,
            _ => return Err(StagingError::AckTimeout(artifact.id)),
        };

        if !receipt.success {
            return Err(StagingError::AckRejected {
                artifact_id: artifact.id,
                reason: receipt
                    .message
                    .unwrap_or_else(|| "checksum mismatch".to_string()),
            });
        }
        if claimed_cached && !receipt.cache_hit {
            return Err(StagingError::CacheContractViolation(artifact.id));
        }

        if receipt.cache_hit {
            report.cache_hits += 1;
            session
                .metrics
                .cache_hits
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            crate::metrics::record_cache_hit();
        } else {
            report.transferred += 1;
            session
                .metrics
                .cache_misses
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            crate::metrics::record_cache_miss();
        }
    }

    session
        .metrics
        .bytes_transferred
        .fetch_add(report.bytes_sent, std::sync::atomic::Ordering::Relaxed);
    Ok(report)
}

/// Splits a payload into transfer chunks; an empty payload still yields
/// one empty terminating chunk.
fn chunk_iter<'a>(data: &'a [u8], chunk_size: usize) -> Box<dyn Iterator<Item = &'a [u8]> + Send + 'a> {
    if data.is_empty() {
        Box::new(std::iter::once(&data[0..0]))
    } else {
        Box::new(data.chunks(chunk_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::compute_checksum;
    use crate::job::{Job, JobPayload, JobSpec};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn fast_config() -> StagingConfig {
        StagingConfig {
            cache_response_timeout: Duration::from_millis(200),
            artifact_ack_timeout: Duration::from_millis(500),
            chunk_size: 1024,
            inter_chunk_delay: None,
        }
    }

    fn session_pair() -> (Arc<Session>, mpsc::Receiver<OrchestratorMessage>) {
        let (tx, rx) = mpsc::channel(256);
        let session = Session::new(
            WorkerId::generate(),
            "w".to_string(),
            None,
            BTreeMap::new(),
            tx,
            Utc::now(),
        );
        (Arc::new(session), rx)
    }

    fn queued_job(artifacts: Vec<ArtifactId>) -> QueuedJob {
        let now = Utc::now();
        let job = Job::new(
            JobSpec::new(
                "stage-test",
                JobPayload::Command {
                    argv: vec!["true".to_string()],
                },
            )
            .with_artifacts(artifacts),
            now,
        );
        QueuedJob::new(job, now)
    }

    /// A worker stub that answers the staging exchange over the tables.
    fn spawn_worker_stub(
        mut rx: mpsc::Receiver<OrchestratorMessage>,
        tables: Arc<PendingTables>,
        worker_id: WorkerId,
        cached: Vec<ArtifactId>,
        reject: Vec<ArtifactId>,
    ) -> tokio::task::JoinHandle<Vec<OrchestratorMessage>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut reassembly: HashMap<ArtifactId, Vec<u8>> = HashMap::new();
            while let Some(message) = rx.recv().await {
                seen.push(message.clone());
                match message {
                    OrchestratorMessage::CacheQuery {
                        job_id,
                        artifact_ids,
                    } => {
                        let entries = artifact_ids
                            .iter()
                            .map(|id| CacheEntry {
                                artifact_id: *id,
                                cached: cached.contains(id),
                                cached_checksum: None,
                                needs_transfer: !cached.contains(id),
                            })
                            .collect();
                        tables.resolve_cache(job_id, entries);
                        // Cached artifacts ack immediately as hits.
                        for id in &artifact_ids {
                            if cached.contains(id) {
                                tables.resolve_ack(
                                    worker_id,
                                    *id,
                                    AckReceipt {
                                        success: true,
                                        cache_hit: true,
                                        calculated_checksum: None,
                                        cache_status: CacheStatus::default(),
                                        message: None,
                                    },
                                );
                            }
                        }
                    }
                    OrchestratorMessage::ArtifactChunk {
                        artifact_id,
                        data,
                        is_last,
                        compression,
                        original_size,
                        ..
                    } => {
                        let buffer = reassembly.entry(artifact_id).or_default();
                        buffer.extend_from_slice(&data);
                        if is_last {
                            let payload = std::mem::take(buffer);
                            let receipt = if reject.contains(&artifact_id) {
                                AckReceipt {
                                    success: false,
                                    cache_hit: false,
                                    calculated_checksum: None,
                                    cache_status: CacheStatus::default(),
                                    message: Some("checksum mismatch".to_string()),
                                }
                            } else {
                                let restored = crate::artifact::decompress(
                                    &payload,
                                    compression,
                                    original_size,
                                )
                                .expect("decompression succeeds");
                                AckReceipt {
                                    success: true,
                                    cache_hit: false,
                                    calculated_checksum: Some(compute_checksum(&restored)),
                                    cache_status: CacheStatus {
                                        count: 1,
                                        size_bytes: restored.len() as u64,
                                    },
                                    message: None,
                                }
                            };
                            tables.resolve_ack(worker_id, artifact_id, receipt);
                        }
                    }
                    _ => {}
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_full_transfer_chunk_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        // Incompressible payload (no compression) so chunk math is exact:
        // 5000 bytes at 1024 per chunk is 5 chunks.
        let artifact = store
            .put("blob", &vec![0xA5u8; 5000], Compression::None)
            .await
            .unwrap();

        let (session, rx) = session_pair();
        session.transition(crate::hub::session::SessionState::Ready).unwrap();
        let tables = Arc::new(PendingTables::default());
        let stub = spawn_worker_stub(
            rx,
            Arc::clone(&tables),
            session.worker_id,
            Vec::new(),
            Vec::new(),
        );

        let job = queued_job(vec![artifact.id]);
        let report = stage_job(&session, &tables, &store, &fast_config(), &job, Utc::now())
            .await
            .unwrap();

        assert_eq!(report.transferred, 1);
        assert_eq!(report.cache_hits, 0);
        assert_eq!(report.bytes_sent, 5000);

        drop(session);
        let seen = stub.await.unwrap();
        let chunks: Vec<_> = seen
            .iter()
            .filter(|m| matches!(m, OrchestratorMessage::ArtifactChunk { .. }))
            .collect();
        assert_eq!(chunks.len(), 5);
        match chunks.last().unwrap() {
            OrchestratorMessage::ArtifactChunk { is_last, sequence, .. } => {
                assert!(*is_last);
                assert_eq!(*sequence, 4);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_cache_hits_skip_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let a = store.put("a", b"payload a", Compression::Gzip).await.unwrap();
        let b = store.put("b", b"payload b", Compression::Gzip).await.unwrap();

        let (session, rx) = session_pair();
        let tables = Arc::new(PendingTables::default());
        let stub = spawn_worker_stub(
            rx,
            Arc::clone(&tables),
            session.worker_id,
            vec![a.id, b.id],
            Vec::new(),
        );

        let job = queued_job(vec![a.id, b.id]);
        let report = stage_job(&session, &tables, &store, &fast_config(), &job, Utc::now())
            .await
            .unwrap();

        assert_eq!(report.cache_hits, 2);
        assert_eq!(report.transferred, 0);
        assert_eq!(report.bytes_sent, 0);

        drop(session);
        let seen = stub.await.unwrap();
        assert!(seen
            .iter()
            .all(|m| !matches!(m, OrchestratorMessage::ArtifactChunk { .. })));
    }

    #[tokio::test]
    async fn test_cache_timeout_falls_back_to_full_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifact = store.put("a", b"bytes", Compression::None).await.unwrap();

        let (session, mut rx) = session_pair();
        let tables = Arc::new(PendingTables::default());
        let worker_id = session.worker_id;

        // The stub ignores the cache query entirely but still acks chunks.
        let tables_clone = Arc::clone(&tables);
        let stub = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let OrchestratorMessage::ArtifactChunk {
                    artifact_id,
                    is_last: true,
                    ..
                } = message
                {
                    tables_clone.resolve_ack(
                        worker_id,
                        artifact_id,
                        AckReceipt {
                            success: true,
                            cache_hit: false,
                            calculated_checksum: None,
                            cache_status: CacheStatus::default(),
                            message: None,
                        },
                    );
                }
            }
        });

        let job = queued_job(vec![artifact.id]);
        let report = stage_job(&session, &tables, &store, &fast_config(), &job, Utc::now())
            .await
            .unwrap();
        assert_eq!(report.transferred, 1);

        drop(session);
        stub.abort();
    }

    #[tokio::test]
    async fn test_rejected_ack_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifact = store.put("a", b"bytes", Compression::None).await.unwrap();

        let (session, rx) = session_pair();
        let tables = Arc::new(PendingTables::default());
        let _stub = spawn_worker_stub(
            rx,
            Arc::clone(&tables),
            session.worker_id,
            Vec::new(),
            vec![artifact.id],
        );

        let job = queued_job(vec![artifact.id]);
        let err = stage_job(&session, &tables, &store, &fast_config(), &job, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::AckRejected { .. }));
        // The failed exchange left no dangling entries.
        assert_eq!(tables.pending_cache_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (session, _rx) = session_pair();
        let tables = Arc::new(PendingTables::default());

        let job = queued_job(vec![ArtifactId::generate()]);
        let err = stage_job(&session, &tables, &store, &fast_config(), &job, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::ArtifactMissing(_)));
    }

    #[tokio::test]
    async fn test_cancellation_suppresses_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifact = store
            .put("big", &vec![1u8; 64 * 1024], Compression::None)
            .await
            .unwrap();

        let (session, _rx) = session_pair();
        let tables = Arc::new(PendingTables::default());

        let job = queued_job(vec![artifact.id]);
        session.mark_cancelled(job.job.id);

        let err = stage_job(&session, &tables, &store, &fast_config(), &job, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::Cancelled));
        assert_eq!(tables.pending_cache_count(), 0);
    }

    #[tokio::test]
    async fn test_no_artifacts_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (session, _rx) = session_pair();
        let tables = Arc::new(PendingTables::default());

        let job = queued_job(Vec::new());
        let report = stage_job(&session, &tables, &store, &fast_config(), &job, Utc::now())
            .await
            .unwrap();
        assert_eq!(report, StagingReport::default());
    }

    #[test]
    fn test_zstd_falls_back_without_capability() {
        let mut capabilities = BTreeMap::new();
        assert_eq!(
            effective_compression(Compression::Zstd, &capabilities),
            Compression::Gzip
        );

        capabilities.insert(ZSTD_CAPABILITY.to_string(), "true".to_string());
        assert_eq!(
            effective_compression(Compression::Zstd, &capabilities),
            Compression::Zstd
        );
        assert_eq!(
            effective_compression(Compression::Gzip, &capabilities),
            Compression::Gzip
        );
    }

    #[test]
    fn test_pending_table_ttl_purge() {
        let tables = PendingTables::default();
        let now = Utc::now();
        let job_id = JobId::generate();
        let _rx = tables.await_cache(job_id, WorkerId::generate(), now);

        assert!(tables
            .purge_expired(Duration::from_secs(5), now + chrono::Duration::seconds(2))
            .is_empty());
        let purged =
            tables.purge_expired(Duration::from_secs(5), now + chrono::Duration::seconds(6));
        assert_eq!(purged, vec![job_id]);

        // A late response after the purge is ignored.
        assert!(!tables.resolve_cache(job_id, Vec::new()));
    }

    #[test]
    fn test_purge_worker_clears_both_tables() {
        let tables = PendingTables::default();
        let worker = WorkerId::generate();
        let _cache_rx = tables.await_cache(JobId::generate(), worker, Utc::now());
        let _ack_rx = tables.await_ack(worker, ArtifactId::generate());

        tables.purge_worker(worker);
        assert_eq!(tables.pending_cache_count(), 0);
        assert!(!tables.resolve_ack(
            worker,
            ArtifactId::generate(),
            AckReceipt {
                success: true,
                cache_hit: false,
                calculated_checksum: None,
                cache_status: CacheStatus::default(),
                message: None,
            }
        ));
    }
}
