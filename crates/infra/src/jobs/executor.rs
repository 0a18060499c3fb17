//! Step executor: advances a job by exactly one unit of work per tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{Span, debug, error, info, instrument, warn};

use storyforge_ai::{AiError, BookWriter, LlmClient};
use storyforge_core::{Aggregate, DomainError, ExpectedVersion, JobId};
use storyforge_generation::{
    BookRequest, CoverStatus, GenerationJob, JobCommand, JobStatus, SectionContext, Step, StepEffect,
};

use crate::assets::AssetError;
use crate::config::EngineConfig;
use crate::cover::CoverError;

use super::finalize::FinalizationGate;
use super::store::{JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Cover(#[from] CoverError),
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error("job not found: {0}")]
    NotFound(JobId),
}

impl EngineError {
    /// Another actor wrote the job since this tick read it.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Store(JobStoreError::Conflict { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// The step moved forward (or a rewrite was recorded).
    Advanced,
    /// Finalize is waiting on a cover owned by someone else.
    Waiting,
    /// A cover generation failed; the next tick regenerates.
    Regenerating,
    Completed,
    Failed,
    /// Another tick holds the lease.
    Busy,
    /// Another actor wrote the job mid-tick; nothing more was written.
    Superseded,
    /// The job was already complete or failed.
    Terminal,
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Advanced => "advanced",
            TickOutcome::Waiting => "waiting",
            TickOutcome::Regenerating => "regenerating",
            TickOutcome::Completed => "completed",
            TickOutcome::Failed => "failed",
            TickOutcome::Busy => "busy",
            TickOutcome::Superseded => "superseded",
            TickOutcome::Terminal => "terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub step: Step,
    pub progress: u8,
    pub message: String,
    pub outcome: TickOutcome,
}

impl TickReport {
    pub fn of(job: &GenerationJob, outcome: TickOutcome, message: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            step: job.step,
            progress: job.progress,
            message: message.into(),
            outcome,
        }
    }
}

/// Read-only summary of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub title: String,
    pub status: JobStatus,
    pub step: Step,
    pub progress: u8,
    pub error: Option<String>,
    pub sections_canonical: usize,
    pub sections_total: usize,
    pub cover_status: Option<CoverStatus>,
    pub cover_uri: Option<String>,
    pub auto_resume_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<&GenerationJob> for JobView {
    fn from(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id,
            title: job.request.title.clone(),
            status: job.status,
            step: job.step,
            progress: job.progress,
            error: job.error.clone(),
            sections_canonical: job.canonical_sections(),
            sections_total: job.total_sections(),
            cover_status: job.cover_status(),
            cover_uri: job.cover.as_ref().and_then(|c| c.asset_uri.clone()),
            auto_resume_attempts: job.auto_resume_attempts,
            updated_at: job.updated_at,
        }
    }
}

/// Run `command` through the aggregate.
pub(crate) fn apply(job: &mut GenerationJob, command: &JobCommand) -> Result<(), EngineError> {
    let events = job.execute(command)?;
    for event in &events {
        debug!(job_id = %job.id, event = event.event_type(), "event applied");
    }
    Ok(())
}

/// Compare-and-swap write of `job` against the revision it was read at.
///
/// `release` clears the tick lease; only the last write of a tick sets it.
pub(crate) async fn save(
    store: &dyn JobStore,
    job: &GenerationJob,
    release: bool,
) -> Result<GenerationJob, EngineError> {
    let mut next = job.clone();
    if release {
        next.lease_expires_at = None;
    }
    Ok(store.update(&next, ExpectedVersion::Exact(job.revision)).await?)
}

/// Fetch the record again and make sure nobody wrote it since `written`.
pub(crate) async fn reread(
    store: &dyn JobStore,
    written: &GenerationJob,
) -> Result<GenerationJob, EngineError> {
    let fresh = store
        .get(written.id)
        .await?
        .ok_or(EngineError::NotFound(written.id))?;
    if fresh.revision != written.revision {
        return Err(JobStoreError::Conflict {
            id: written.id,
            expected: ExpectedVersion::Exact(written.revision),
            actual: fresh.revision,
        }
        .into());
    }
    Ok(fresh)
}

pub struct StepExecutor {
    store: Arc<dyn JobStore>,
    writer: BookWriter,
    gate: FinalizationGate,
    lease: chrono::Duration,
    max_section_rewrites: u32,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        llm: Arc<dyn LlmClient>,
        gate: FinalizationGate,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            writer: BookWriter::new(llm),
            gate,
            lease: config.tick_lease_chrono(),
            max_section_rewrites: config.max_section_rewrites,
        }
    }

    pub async fn create_job(&self, request: BookRequest) -> Result<GenerationJob, EngineError> {
        request.validate()?;
        let job = GenerationJob::new(JobId::new(), request, Utc::now());
        let stored = self.store.insert(job).await?;
        info!(job_id = %stored.id, title = %stored.request.title, "job created");
        Ok(stored)
    }

    pub async fn job_view(&self, job_id: JobId) -> Result<JobView, EngineError> {
        Ok(JobView::from(&self.load(job_id).await?))
    }

    /// Advance `job_id` by one unit of work.
    ///
    /// Failures inside the step fail the job and come back as a report; only
    /// a missing job or a store failure outside the step is an `Err`.
    #[instrument(skip(self), fields(job_id = %job_id, step = tracing::field::Empty))]
    pub async fn tick(&self, job_id: JobId) -> Result<TickReport, EngineError> {
        let now = Utc::now();
        let job = self.load(job_id).await?;
        Span::current().record("step", tracing::field::display(job.step));

        if job.status.is_terminal() {
            return Ok(TickReport::of(
                &job,
                TickOutcome::Terminal,
                format!("job is already {}", job.status),
            ));
        }
        if job.is_leased(now) {
            debug!("job is leased by another tick");
            return Ok(TickReport::of(&job, TickOutcome::Busy, "job is busy"));
        }

        let claimed = match self.claim(&job, now).await {
            Ok(claimed) => claimed,
            Err(e) if e.is_conflict() => {
                return Ok(TickReport::of(&job, TickOutcome::Superseded, "job was claimed concurrently"));
            }
            Err(e) => return Err(e),
        };

        match self.advance(claimed).await {
            Ok(report) => {
                debug!(outcome = report.outcome.as_str(), progress = report.progress, "tick finished");
                Ok(report)
            }
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "tick superseded");
                let latest = self.load(job_id).await?;
                Ok(TickReport::of(&latest, TickOutcome::Superseded, e.to_string()))
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "tick failed");
                self.store.fail_if_active(job_id, &message, Utc::now()).await?;
                let latest = self.load(job_id).await?;
                Ok(TickReport::of(&latest, TickOutcome::Failed, message))
            }
        }
    }

    /// Tick until the job stops making progress on its own, at most `max_ticks` times.
    pub async fn drive(&self, job_id: JobId, max_ticks: usize) -> Result<TickReport, EngineError> {
        let mut report = self.tick(job_id).await?;
        for _ in 1..max_ticks {
            if !matches!(report.outcome, TickOutcome::Advanced | TickOutcome::Regenerating) {
                break;
            }
            report = self.tick(job_id).await?;
        }
        Ok(report)
    }

    async fn load(&self, job_id: JobId) -> Result<GenerationJob, EngineError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(EngineError::NotFound(job_id))
    }

    /// Take the lease. Does not count as activity.
    async fn claim(&self, job: &GenerationJob, now: DateTime<Utc>) -> Result<GenerationJob, EngineError> {
        let mut claimed = job.clone();
        claimed.lease_expires_at = Some(now + self.lease);
        Ok(self
            .store
            .update(&claimed, ExpectedVersion::Exact(job.revision))
            .await?)
    }

    async fn advance(&self, mut job: GenerationJob) -> Result<TickReport, EngineError> {
        let store = self.store.as_ref();
        let now = Utc::now();

        match job.next_effect() {
            StepEffect::Done => {
                let saved = save(store, &job, true).await?;
                Ok(TickReport::of(&saved, TickOutcome::Terminal, "nothing to do"))
            }
            StepEffect::Start => {
                apply(&mut job, &JobCommand::Start { occurred_at: now })?;
                let saved = save(store, &job, true).await?;
                info!("job started");
                Ok(TickReport::of(&saved, TickOutcome::Advanced, "job started"))
            }
            StepEffect::DraftConstitution => {
                let constitution = self.writer.constitution(&job.request).await?;
                apply(
                    &mut job,
                    &JobCommand::RecordConstitution {
                        constitution,
                        occurred_at: Utc::now(),
                    },
                )?;
                let saved = save(store, &job, true).await?;
                info!("constitution finalized");
                Ok(TickReport::of(&saved, TickOutcome::Advanced, "constitution finalized"))
            }
            StepEffect::ReuseConstitution => {
                apply(&mut job, &JobCommand::ConfirmConstitution { occurred_at: now })?;
                let saved = save(store, &job, true).await?;
                Ok(TickReport::of(
                    &saved,
                    TickOutcome::Advanced,
                    "constitution already finalized",
                ))
            }
            StepEffect::DraftOutline => {
                let constitution = job
                    .constitution
                    .clone()
                    .ok_or_else(|| DomainError::invariant("plan step reached without a constitution"))?;
                let outline = self.writer.outline(&job.request, &constitution).await?;
                apply(
                    &mut job,
                    &JobCommand::RecordOutline {
                        outline,
                        occurred_at: Utc::now(),
                    },
                )?;
                let saved = save(store, &job, true).await?;
                let message = format!(
                    "outline materialized: {} chapters, {} sections",
                    saved.chapters.len(),
                    saved.total_sections()
                );
                info!(chapters = saved.chapters.len(), sections = saved.total_sections(), "outline materialized");
                Ok(TickReport::of(&saved, TickOutcome::Advanced, message))
            }
            StepEffect::WriteSection {
                chapter,
                section,
                context,
            } => self.write_section(job, chapter, section, context).await,
            StepEffect::Finalize => self.gate.finalize(job).await,
        }
    }

    async fn write_section(
        &self,
        mut job: GenerationJob,
        chapter: u32,
        section: u32,
        context: SectionContext,
    ) -> Result<TickReport, EngineError> {
        let store = self.store.as_ref();
        let constitution = job
            .constitution
            .clone()
            .ok_or_else(|| DomainError::invariant("writing step reached without a constitution"))?;

        let mut draft = self
            .writer
            .write_section(&job.request, &constitution, &context)
            .await?;
        let verdict = self
            .writer
            .check_consistency(&constitution, &context, &draft)
            .await?;

        if !verdict.consistent {
            if job.attempt < self.max_section_rewrites {
                // Record the attempt before paying for it.
                apply(
                    &mut job,
                    &JobCommand::BeginRewrite {
                        chapter,
                        section,
                        occurred_at: Utc::now(),
                    },
                )?;
                job = save(store, &job, false).await?;
                info!(chapter, section, attempt = job.attempt, issues = verdict.issues.len(), "rewriting section");
                draft = self
                    .writer
                    .rewrite_section(&constitution, &context, &draft, &verdict.issues)
                    .await?;
            } else {
                warn!(chapter, section, attempt = job.attempt, "rewrite budget exhausted, accepting draft");
            }
        }

        apply(
            &mut job,
            &JobCommand::RecordSection {
                chapter,
                section,
                body: draft.content,
                synopsis: draft.synopsis,
                occurred_at: Utc::now(),
            },
        )?;
        let saved = save(store, &job, true).await?;
        info!(chapter, section, next = %saved.step, progress = saved.progress, "section canonical");
        Ok(TickReport::of(
            &saved,
            TickOutcome::Advanced,
            format!("section ch{chapter}/s{section} canonical"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, PromptKind};
    use storyforge_ai::ConsistencyVerdict;
    use storyforge_generation::UnitStatus;

    #[tokio::test]
    async fn created_tick_starts_without_calling_the_model() {
        let h = Harness::new();
        let job = h.create(1, 1).await;

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Advanced);
        assert_eq!(report.status, JobStatus::Running);
        assert_eq!(report.step, Step::Constitution);
        assert!(h.llm.calls().is_empty());
        assert!(h.job(job.id).await.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn constitution_and_plan_advance_with_progress() {
        let h = Harness::new();
        let job = h.create(2, 2).await;

        h.executor.tick(job.id).await.unwrap();
        let constitution = h.executor.tick(job.id).await.unwrap();
        assert_eq!(constitution.step, Step::Plan);
        assert_eq!(constitution.progress, 5);

        let plan = h.executor.tick(job.id).await.unwrap();
        assert_eq!(plan.step, Step::write(0, 0));
        assert_eq!(plan.progress, 10);

        let stored = h.job(job.id).await;
        assert!(stored.constitution_finalized);
        assert_eq!(stored.total_sections(), 4);
        assert!(stored.chapters.iter().flat_map(|c| &c.sections).all(|s| s.status == UnitStatus::Draft));
    }

    #[tokio::test]
    async fn finalized_constitution_is_not_redrafted() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        h.executor.tick(job.id).await.unwrap();
        h.executor.tick(job.id).await.unwrap();

        // Simulate a crash after the constitution was persisted but before the step moved.
        let mut stored = h.job(job.id).await;
        stored.step = Step::Constitution;
        h.store.update(&stored, ExpectedVersion::Any).await.unwrap();
        let before = h.llm.count(PromptKind::Constitution);

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.step, Step::Plan);
        assert_eq!(h.llm.count(PromptKind::Constitution), before);
    }

    #[tokio::test]
    async fn inconsistent_draft_is_rewritten_once_and_accepted() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        h.llm.push_verdict(ConsistencyVerdict {
            consistent: false,
            issues: vec!["narrator changed".into()],
        });
        for _ in 0..3 {
            h.executor.tick(job.id).await.unwrap();
        }

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.step, Step::Finalize);
        assert_eq!(h.llm.count(PromptKind::Rewrite), 1);
        assert_eq!(h.llm.count(PromptKind::Consistency), 1);
        let stored = h.job(job.id).await;
        assert!(stored.section(0, 0).unwrap().body.as_deref().unwrap().starts_with("Revised"));
        assert_eq!(stored.attempt, 0);
    }

    #[tokio::test]
    async fn rewrite_budget_is_respected_after_resume() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        for _ in 0..3 {
            h.executor.tick(job.id).await.unwrap();
        }
        let mut stored = h.job(job.id).await;
        stored.attempt = 3;
        h.store.update(&stored, ExpectedVersion::Any).await.unwrap();
        h.llm.push_verdict(ConsistencyVerdict {
            consistent: false,
            issues: vec!["tone drift".into()],
        });

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Advanced);
        assert_eq!(h.llm.count(PromptKind::Rewrite), 0);
        assert!(h.job(job.id).await.section(0, 0).unwrap().is_canonical());
    }

    #[tokio::test]
    async fn model_failure_fails_the_job_with_its_message() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        h.llm.fail_on(PromptKind::Constitution, AiError::Api("rate limited".into()));
        h.executor.tick(job.id).await.unwrap();

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Failed);
        assert_eq!(report.status, JobStatus::Failed);
        let stored = h.job(job.id).await;
        assert!(stored.error.as_deref().unwrap().contains("rate limited"));
        assert!(stored.lease_expires_at.is_none());

        let again = h.executor.tick(job.id).await.unwrap();
        assert_eq!(again.outcome, TickOutcome::Terminal);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let h = Harness::new();
        let err = h.executor.tick(JobId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let h = Harness::new();
        let err = h
            .executor
            .create_job(BookRequest::new("  ", "premise", "fantasy"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::Validation(_))));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn job_view_reports_section_counts() {
        let h = Harness::new();
        let job = h.create(2, 1).await;
        for _ in 0..4 {
            h.executor.tick(job.id).await.unwrap();
        }

        let view = h.executor.job_view(job.id).await.unwrap();

        assert_eq!(view.sections_total, 2);
        assert_eq!(view.sections_canonical, 1);
        assert_eq!(view.step, Step::write(1, 0));
        assert!(view.cover_status.is_none());
    }
}
