//! Pluggable repositories.
//!
//! Durable storage is outside the orchestration core; the coordinator
//! consumes these trait objects and does not care what backs them. The
//! in-memory implementations keep single-process deployments and tests
//! dependency-free.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, JobId, JobStatus, PoolId};
use crate::pool::Pool;

/// Errors raised by repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The backing store rejected or lost the operation.
    #[error("Repository backend error: {0}")]
    Backend(String),
}

/// Durable records of submitted jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Inserts or replaces a job record.
    async fn save(&self, job: &Job) -> Result<(), RepositoryError>;

    /// Fetches a job by id.
    async fn find(&self, id: JobId) -> Result<Option<Job>, RepositoryError>;

    /// Lists jobs in a given status.
    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, RepositoryError>;

    /// Deletes a job record.
    async fn delete(&self, id: JobId) -> Result<(), RepositoryError>;
}

/// Durable records of pools.
#[async_trait]
pub trait PoolRepository: Send + Sync {
    /// Inserts or replaces a pool record.
    async fn save(&self, pool: &Pool) -> Result<(), RepositoryError>;

    /// Fetches a pool by id.
    async fn find(&self, id: PoolId) -> Result<Option<Pool>, RepositoryError>;

    /// Lists all pool records.
    async fn list(&self) -> Result<Vec<Pool>, RepositoryError>;

    /// Deletes a pool record.
    async fn delete(&self, id: PoolId) -> Result<(), RepositoryError>;
}

/// Job repository backed by a process-local map.
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn save(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.lock().expect("job repo lock poisoned");
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find(&self, id: JobId) -> Result<Option<Job>, RepositoryError> {
        let jobs = self.jobs.lock().expect("job repo lock poisoned");
        Ok(jobs.get(&id).cloned())
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, RepositoryError> {
        let jobs = self.jobs.lock().expect("job repo lock poisoned");
        Ok(jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: JobId) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.lock().expect("job repo lock poisoned");
        jobs.remove(&id);
        Ok(())
    }
}

/// Pool repository backed by a process-local map.
#[derive(Default)]
pub struct InMemoryPoolRepository {
    pools: Mutex<HashMap<PoolId, Pool>>,
}

impl InMemoryPoolRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolRepository for InMemoryPoolRepository {
    async fn save(&self, pool: &Pool) -> Result<(), RepositoryError> {
        let mut pools = self.pools.lock().expect("pool repo lock poisoned");
        pools.insert(pool.id, pool.clone());
        Ok(())
    }

    async fn find(&self, id: PoolId) -> Result<Option<Pool>, RepositoryError> {
        let pools = self.pools.lock().expect("pool repo lock poisoned");
        Ok(pools.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Pool>, RepositoryError> {
        let pools = self.pools.lock().expect("pool repo lock poisoned");
        Ok(pools.values().cloned().collect())
    }

    async fn delete(&self, id: PoolId) -> Result<(), RepositoryError> {
        let mut pools = self.pools.lock().expect("pool repo lock poisoned");
        pools.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPayload, JobSpec};
    use chrono::Utc;

    fn job() -> Job {
        Job::new(
            JobSpec::new(
                "persisted",
                JobPayload::Script {
                    source: "echo hi".to_string(),
                },
            ),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_job_repository_roundtrip() {
        let repo = InMemoryJobRepository::new();
        let mut job = job();
        repo.save(&job).await.unwrap();

        assert_eq!(repo.find(job.id).await.unwrap().unwrap().id, job.id);
        assert_eq!(
            repo.find_by_status(JobStatus::Queued).await.unwrap().len(),
            1
        );

        job.transition(JobStatus::Running, Utc::now()).unwrap();
        repo.save(&job).await.unwrap();
        assert!(repo
            .find_by_status(JobStatus::Queued)
            .await
            .unwrap()
            .is_empty());

        repo.delete(job.id).await.unwrap();
        assert!(repo.find(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_job_is_none() {
        let repo = InMemoryJobRepository::new();
        assert!(repo.find(JobId::generate()).await.unwrap().is_none());
    }
}
