//! The `finalize` step: a job only completes on top of a ready cover.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use storyforge_ai::CoverBrief;
use storyforge_generation::{
    CoverCompletionAction, CoverStatus, GenerationJob, JobCommand, cover_completion_action,
};

use crate::assets::AssetStore;
use crate::config::EngineConfig;
use crate::cover::CoverPipeline;

use super::executor::{EngineError, TickOutcome, TickReport, apply, reread, save};
use super::store::JobStore;

/// Time past the cover timeout for storing the asset and the final write.
const COVER_LEASE_HEADROOM: Duration = Duration::from_secs(60);

pub struct FinalizationGate {
    store: Arc<dyn JobStore>,
    pipeline: CoverPipeline,
    assets: Arc<dyn AssetStore>,
    cover_timeout: Duration,
    max_generations: u32,
}

impl FinalizationGate {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: CoverPipeline,
        assets: Arc<dyn AssetStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            assets,
            cover_timeout: config.cover_timeout,
            max_generations: config.cover_max_generations,
        }
    }

    /// Decide and act on the cover for a claimed job at `finalize`.
    ///
    /// Every decision is taken on a record re-read after the last write.
    pub async fn finalize(&self, mut job: GenerationJob) -> Result<TickReport, EngineError> {
        let store = self.store.as_ref();
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.cover_timeout).unwrap_or(chrono::Duration::MAX);

        if job.cover.as_ref().is_some_and(|c| c.is_timed_out(now, timeout)) {
            warn!(job_id = %job.id, "cover generation timed out, marking failed");
            apply(&mut job, &JobCommand::ExpireCover { occurred_at: now })?;
            let saved = save(store, &job, false).await?;
            job = reread(store, &saved).await?;
        }

        match cover_completion_action(job.cover_status()) {
            CoverCompletionAction::Complete => self.complete(job).await,
            CoverCompletionAction::Wait => {
                apply(&mut job, &JobCommand::ReportWaiting)?;
                let saved = save(store, &job, true).await?;
                let status = saved.cover_status().map_or("absent", |s| s.as_str());
                Ok(TickReport::of(
                    &saved,
                    TickOutcome::Waiting,
                    format!("waiting for cover ({status})"),
                ))
            }
            CoverCompletionAction::Regenerate => self.regenerate(job).await,
        }
    }

    async fn regenerate(&self, mut job: GenerationJob) -> Result<TickReport, EngineError> {
        let store = self.store.as_ref();
        if let Some(message) = self.exhausted(&job) {
            return self.fail(job, message).await;
        }

        let started_at = Utc::now();
        apply(&mut job, &JobCommand::StartCover { occurred_at: started_at })?;
        // A cover run can outlast the tick lease; hold the job for all of it.
        let hold = chrono::Duration::from_std(self.cover_timeout + COVER_LEASE_HEADROOM)
            .unwrap_or(chrono::Duration::MAX);
        job.lease_expires_at = Some(started_at + hold);
        job = save(store, &job, false).await?;
        let generation = job.cover.as_ref().map_or(0, |c| c.generations);
        info!(job_id = %job.id, generation, "cover generation started");

        let brief = cover_brief(&job);
        let run = tokio::time::timeout(
            self.cover_timeout,
            self.pipeline
                .generate_cover(&brief, &job.request.title, job.request.author.as_deref()),
        )
        .await;

        let occurred_at = Utc::now();
        let command = match run {
            Ok(Ok(outcome)) if outcome.success => match outcome.image {
                Some(png) => JobCommand::RecordCoverReady {
                    asset_uri: self.assets.put_cover(job.id, png).await?,
                    attempts: outcome.attempts,
                    occurred_at,
                },
                None => JobCommand::RecordCoverFailure {
                    reason: "cover pipeline returned no image".into(),
                    attempts: outcome.attempts,
                    occurred_at,
                },
            },
            Ok(Ok(outcome)) => JobCommand::RecordCoverFailure {
                reason: outcome
                    .error
                    .unwrap_or_else(|| "rejected by quality gate".into()),
                attempts: outcome.attempts,
                occurred_at,
            },
            Ok(Err(e)) => {
                warn!(job_id = %job.id, generation, error = %e, "cover pipeline failed");
                JobCommand::RecordCoverFailure {
                    reason: e.to_string(),
                    attempts: 0,
                    occurred_at,
                }
            }
            Err(_) => JobCommand::RecordCoverFailure {
                reason: format!(
                    "cover generation timed out after {}s",
                    self.cover_timeout.as_secs()
                ),
                attempts: 0,
                occurred_at,
            },
        };
        apply(&mut job, &command)?;
        let saved = save(store, &job, false).await?;
        job = reread(store, &saved).await?;

        match cover_completion_action(job.cover_status()) {
            CoverCompletionAction::Complete => self.complete(job).await,
            _ => {
                if let Some(message) = self.exhausted(&job) {
                    return self.fail(job, message).await;
                }
                let reason = job
                    .cover
                    .as_ref()
                    .and_then(|c| c.error.clone())
                    .unwrap_or_default();
                warn!(job_id = %job.id, generation, reason = %reason, "cover generation failed, will regenerate");
                let saved = save(store, &job, true).await?;
                Ok(TickReport::of(
                    &saved,
                    TickOutcome::Regenerating,
                    format!("cover generation {generation} failed: {reason}"),
                ))
            }
        }
    }

    /// Failure message once the last allowed generation has failed.
    fn exhausted(&self, job: &GenerationJob) -> Option<String> {
        let cover = job.cover.as_ref()?;
        if cover.status != CoverStatus::Failed || cover.generations < self.max_generations {
            return None;
        }
        Some(format!(
            "cover generation failed after {} attempts: {}",
            cover.generations,
            cover.error.as_deref().unwrap_or("unknown error")
        ))
    }

    async fn complete(&self, mut job: GenerationJob) -> Result<TickReport, EngineError> {
        apply(&mut job, &JobCommand::Complete { occurred_at: Utc::now() })?;
        let saved = save(self.store.as_ref(), &job, true).await?;
        info!(job_id = %saved.id, "job complete");
        Ok(TickReport::of(&saved, TickOutcome::Completed, "book complete"))
    }

    async fn fail(&self, mut job: GenerationJob, message: String) -> Result<TickReport, EngineError> {
        apply(
            &mut job,
            &JobCommand::Fail {
                reason: message.clone(),
                occurred_at: Utc::now(),
            },
        )?;
        let saved = save(self.store.as_ref(), &job, true).await?;
        warn!(job_id = %saved.id, error = %message, "job failed at finalize");
        Ok(TickReport::of(&saved, TickOutcome::Failed, message))
    }
}

/// What the art director gets to see: genre, premise and the constitution's
/// tone and themes. Never the title.
pub fn cover_brief(job: &GenerationJob) -> CoverBrief {
    let constitution = job.constitution.as_ref();
    CoverBrief {
        genre: job.request.genre.clone(),
        premise: constitution.map_or_else(|| job.request.premise.clone(), |c| c.premise.clone()),
        tone: constitution
            .map(|c| c.tone.clone())
            .filter(|t| !t.trim().is_empty()),
        themes: constitution.map(|c| c.themes.clone()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeImageGenerator, Harness, noisy_png, solid_png};
    use chrono::Duration as ChronoDuration;
    use storyforge_core::ExpectedVersion;
    use storyforge_generation::{CoverJob, JobStatus, Step};

    #[tokio::test]
    async fn ready_cover_completes_the_job() {
        let h = Harness::new();
        let job = h.at_finalize(1, 1).await;

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!((report.status, report.step, report.progress), (JobStatus::Complete, Step::Complete, 100));
        let stored = h.job(job.id).await;
        let cover = stored.cover.unwrap();
        assert_eq!(cover.status, CoverStatus::Ready);
        assert_eq!(cover.generations, 1);
        assert!(h.assets.get(cover.asset_uri.as_deref().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn live_generation_is_waited_on() {
        let h = Harness::new();
        let job = h.at_finalize(1, 1).await;
        let mut stored = h.job(job.id).await;
        let mut cover = CoverJob::pending(Utc::now());
        cover.start(1, Utc::now());
        stored.cover = Some(cover);
        h.store.update(&stored, ExpectedVersion::Any).await.unwrap();

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Waiting);
        assert_eq!(report.progress, 98);
        assert_eq!(report.status, JobStatus::Running);
        assert_eq!(h.images.calls(), 0);
    }

    #[tokio::test]
    async fn stuck_generation_is_expired_and_regenerated_in_the_same_tick() {
        let h = Harness::new();
        let job = h.at_finalize(1, 1).await;
        let mut stored = h.job(job.id).await;
        let started = Utc::now() - ChronoDuration::minutes(10);
        let mut cover = CoverJob::pending(started);
        cover.start(1, started);
        stored.cover = Some(cover);
        h.store.update(&stored, ExpectedVersion::Any).await.unwrap();

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Completed);
        let cover = h.job(job.id).await.cover.unwrap();
        assert_eq!(cover.generations, 2);
        assert_eq!(cover.status, CoverStatus::Ready);
    }

    #[tokio::test]
    async fn rejected_covers_regenerate_up_to_the_ceiling() {
        let h = Harness::with_images(FakeImageGenerator::always(solid_png(512, 768, 128)));
        let job = h.at_finalize(1, 1).await;

        let first = h.executor.tick(job.id).await.unwrap();
        assert_eq!(first.outcome, TickOutcome::Regenerating);
        assert_eq!(first.progress, 97);
        let second = h.executor.tick(job.id).await.unwrap();
        assert_eq!(second.outcome, TickOutcome::Regenerating);

        let third = h.executor.tick(job.id).await.unwrap();
        assert_eq!(third.outcome, TickOutcome::Failed);
        assert_eq!(third.status, JobStatus::Failed);
        assert!(third.message.starts_with("cover generation failed after 3 attempts:"));
        assert!(third.message.contains("uniform"));
        // Three generations of three quality attempts each.
        assert_eq!(h.images.calls(), 9);
    }

    #[tokio::test]
    async fn slow_pipeline_counts_as_a_failed_generation() {
        let mut config = crate::config::EngineConfig::default();
        config.cover_timeout = std::time::Duration::from_millis(50);
        let images = FakeImageGenerator::always(noisy_png(512, 768))
            .with_delay(std::time::Duration::from_millis(500));
        let h = Harness::with(config, images);
        let job = h.at_finalize(1, 1).await;

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Regenerating);
        let cover = h.job(job.id).await.cover.unwrap();
        assert_eq!(cover.status, CoverStatus::Failed);
        assert!(cover.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn a_cover_run_outlasting_the_tick_lease_keeps_the_job() {
        let mut config = crate::config::EngineConfig::default();
        config.tick_lease = std::time::Duration::from_millis(100);
        config.cover_timeout = std::time::Duration::from_secs(5);
        let images = FakeImageGenerator::always(noisy_png(512, 768))
            .with_delay(std::time::Duration::from_millis(400));
        let h = Harness::with(config, images);
        let job = h.at_finalize(1, 1).await;

        let executor = h.executor.clone();
        let first = tokio::spawn(async move { executor.tick(job.id).await });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let second = h.executor.tick(job.id).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(second.outcome, TickOutcome::Busy);
        assert_eq!(first.outcome, TickOutcome::Completed);
        let stored = h.job(job.id).await;
        assert_eq!(stored.status, JobStatus::Complete);
        assert_eq!(stored.cover.unwrap().generations, 1);
        assert!(stored.lease_expires_at.is_none());
        assert_eq!(h.images.calls(), 1);
    }

    #[test]
    fn brief_carries_constitution_but_not_title() {
        let h = Harness::new();
        let mut job = h.new_job(1, 1);
        job.constitution = Some(storyforge_generation::Constitution {
            premise: "a drowned kingdom".into(),
            tone: "hopeful".into(),
            point_of_view: "close third".into(),
            themes: vec!["loyalty".into()],
            rules: vec![],
        });

        let brief = cover_brief(&job);

        assert_eq!(brief.premise, "a drowned kingdom");
        assert_eq!(brief.tone.as_deref(), Some("hopeful"));
        assert_eq!(brief.themes, vec!["loyalty".to_string()]);
        assert!(!serde_json::to_string(&brief).unwrap().contains(&job.request.title));
    }
}
