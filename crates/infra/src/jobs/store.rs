//! Job storage contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use storyforge_core::{Aggregate, ExpectedVersion, JobId};
use storyforge_generation::{GenerationJob, JobCommand, JobStatus};

/// Durable table of generation jobs.
///
/// Every write bumps `revision`; `update` is a compare-and-swap against it.
/// The single-field sweep operations are atomic on their own.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: GenerationJob) -> Result<GenerationJob, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<GenerationJob>, JobStoreError>;

    /// Replace the record if its revision matches `expected`.
    ///
    /// Returns the stored record with its new revision.
    async fn update(
        &self,
        job: &GenerationJob,
        expected: ExpectedVersion,
    ) -> Result<GenerationJob, JobStoreError>;

    /// Jobs matching `query`, least recently updated first.
    async fn list_stale(&self, query: &StaleQuery) -> Result<Vec<GenerationJob>, JobStoreError>;

    /// Bump `auto_resume_attempts`. Does not count as activity.
    async fn increment_auto_resume(&self, id: JobId) -> Result<GenerationJob, JobStoreError>;

    /// Fail the job unless it is already terminal. Returns whether it was failed.
    async fn fail_if_active(
        &self,
        id: JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("revision conflict on job {id} (expected: {expected:?}, actual: {actual})")]
    Conflict {
        id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Filter on `auto_resume_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFilter {
    Any,
    Below(u32),
    AtLeast(u32),
}

impl AttemptFilter {
    pub fn matches(&self, attempts: u32) -> bool {
        match *self {
            AttemptFilter::Any => true,
            AttemptFilter::Below(ceiling) => attempts < ceiling,
            AttemptFilter::AtLeast(ceiling) => attempts >= ceiling,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleQuery {
    pub statuses: Vec<JobStatus>,
    /// Only jobs whose `updated_at` is strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    pub attempts: AttemptFilter,
    pub limit: usize,
}

impl StaleQuery {
    /// Active jobs inactive since `cutoff` that the watchdog may still resume.
    pub fn resumable(cutoff: DateTime<Utc>, ceiling: u32, limit: usize) -> Self {
        Self {
            statuses: active_statuses(),
            updated_before: Some(cutoff),
            attempts: AttemptFilter::Below(ceiling),
            limit,
        }
    }

    /// Active jobs that used up their auto-resumes, regardless of activity.
    pub fn exhausted(ceiling: u32, limit: usize) -> Self {
        Self {
            statuses: active_statuses(),
            updated_before: None,
            attempts: AttemptFilter::AtLeast(ceiling),
            limit,
        }
    }

    /// Active jobs inactive since `cutoff`, for the cleanup sweep.
    pub fn abandoned(cutoff: DateTime<Utc>, limit: usize) -> Self {
        Self {
            statuses: active_statuses(),
            updated_before: Some(cutoff),
            attempts: AttemptFilter::Any,
            limit,
        }
    }

    pub fn matches(&self, job: &GenerationJob) -> bool {
        self.statuses.contains(&job.status)
            && self.updated_before.is_none_or(|cutoff| job.updated_at < cutoff)
            && self.attempts.matches(job.auto_resume_attempts)
    }
}

fn active_statuses() -> Vec<JobStatus> {
    vec![JobStatus::Running, JobStatus::Queued]
}

/// Mark `job` failed through the aggregate and release any lease.
///
/// Shared by the store implementations so the failure looks the same
/// whichever path produced it.
pub(crate) fn fail_in_place(job: &mut GenerationJob, message: &str, now: DateTime<Utc>) -> bool {
    let command = JobCommand::Fail {
        reason: message.to_string(),
        occurred_at: now,
    };
    if job.execute(&command).is_err() {
        return false;
    }
    job.lease_expires_at = None;
    true
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, GenerationJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> JobStoreError {
        JobStoreError::Storage("job table lock poisoned".into())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: GenerationJob) -> Result<GenerationJob, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let mut stored = job;
        stored.revision = 1;
        jobs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.get(&id).cloned())
    }

    async fn update(
        &self,
        job: &GenerationJob,
        expected: ExpectedVersion,
    ) -> Result<GenerationJob, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let current = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if !expected.matches(current.revision) {
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected,
                actual: current.revision,
            });
        }
        let mut stored = job.clone();
        stored.revision = current.revision + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn list_stale(&self, query: &StaleQuery) -> Result<Vec<GenerationJob>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = jobs.values().filter(|j| query.matches(j)).cloned().collect();
        result.sort_by_key(|j| (j.updated_at, j.id));
        result.truncate(query.limit);
        Ok(result)
    }

    async fn increment_auto_resume(&self, id: JobId) -> Result<GenerationJob, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.auto_resume_attempts += 1;
        job.revision += 1;
        Ok(job.clone())
    }

    async fn fail_if_active(
        &self,
        id: JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status.is_terminal() || !fail_in_place(job, message, now) {
            return Ok(false);
        }
        job.revision += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use storyforge_generation::BookRequest;

    fn job_at(updated_at: DateTime<Utc>) -> GenerationJob {
        let mut job = GenerationJob::new(
            JobId::new(),
            BookRequest::new("Title", "Premise", "literary"),
            updated_at,
        );
        job.status = JobStatus::Running;
        job
    }

    #[tokio::test]
    async fn insert_then_get() {
        let store = InMemoryJobStore::new();
        let job = store.insert(job_at(Utc::now())).await.unwrap();

        assert_eq!(job.revision, 1);
        assert_eq!(store.get(job.id).await.unwrap(), Some(job.clone()));
        assert!(matches!(
            store.insert(job.clone()).await,
            Err(JobStoreError::AlreadyExists(id)) if id == job.id
        ));
    }

    #[tokio::test]
    async fn update_is_compare_and_swap() {
        let store = InMemoryJobStore::new();
        let job = store.insert(job_at(Utc::now())).await.unwrap();

        let mut edited = job.clone();
        edited.progress = 5;
        let stored = store
            .update(&edited, ExpectedVersion::Exact(job.revision))
            .await
            .unwrap();
        assert_eq!(stored.revision, 2);

        // A second writer still holding revision 1 loses.
        let err = store
            .update(&job, ExpectedVersion::Exact(job.revision))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict { actual: 2, .. }));
    }

    #[tokio::test]
    async fn stale_queries_split_on_the_ceiling() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let fresh = store.insert(job_at(now)).await.unwrap();
        let stale = store.insert(job_at(now - Duration::hours(9))).await.unwrap();
        let mut spent = job_at(now - Duration::hours(10));
        spent.auto_resume_attempts = 20;
        let spent = store.insert(spent).await.unwrap();
        let mut done = job_at(now - Duration::hours(11));
        done.status = JobStatus::Complete;
        store.insert(done).await.unwrap();

        let cutoff = now - Duration::minutes(5);
        let resumable = store
            .list_stale(&StaleQuery::resumable(cutoff, 20, 10))
            .await
            .unwrap();
        assert_eq!(resumable.iter().map(|j| j.id).collect::<Vec<_>>(), vec![stale.id]);

        let exhausted = store.list_stale(&StaleQuery::exhausted(20, 10)).await.unwrap();
        assert_eq!(exhausted.iter().map(|j| j.id).collect::<Vec<_>>(), vec![spent.id]);

        let abandoned = store
            .list_stale(&StaleQuery::abandoned(cutoff, 10))
            .await
            .unwrap();
        assert_eq!(abandoned.len(), 2);
        assert_eq!(abandoned[0].id, spent.id, "oldest first");
        assert!(!abandoned.iter().any(|j| j.id == fresh.id));
    }

    #[tokio::test]
    async fn increment_does_not_count_as_activity() {
        let store = InMemoryJobStore::new();
        let then = Utc::now() - Duration::hours(1);
        let job = store.insert(job_at(then)).await.unwrap();

        let bumped = store.increment_auto_resume(job.id).await.unwrap();
        assert_eq!(bumped.auto_resume_attempts, 1);
        assert_eq!(bumped.updated_at, then);
        assert_eq!(bumped.revision, job.revision + 1);
    }

    #[tokio::test]
    async fn fail_if_active_leaves_terminal_jobs_alone() {
        let store = InMemoryJobStore::new();
        let job = store.insert(job_at(Utc::now())).await.unwrap();

        assert!(store.fail_if_active(job.id, "exceeded auto-resume attempts", Utc::now()).await.unwrap());
        let failed = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("exceeded auto-resume attempts"));

        assert!(!store.fail_if_active(job.id, "again", Utc::now()).await.unwrap());
        let unchanged = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(unchanged.error.as_deref(), Some("exceeded auto-resume attempts"));
        assert_eq!(unchanged.revision, failed.revision);
    }
}
