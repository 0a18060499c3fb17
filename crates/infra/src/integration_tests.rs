//! Integration tests for the whole engine on in-memory collaborators.
//!
//! Tests: create → tick … tick → finalize → complete, with the watchdog
//! resuming jobs in between.
//!
//! Verifies:
//! - A book is written in outline order and only ships with a ready cover
//! - Interrupted jobs resume from their persisted step
//! - Concurrent ticks never corrupt a job

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    use storyforge_ai::AiError;
    use storyforge_core::ExpectedVersion;
    use storyforge_generation::{CoverStatus, JobStatus, Step, UnitStatus};

    use crate::jobs::{JobStore, StaleQuery, TickOutcome};
    use crate::testing::{FakeImageGenerator, Harness, PromptKind, solid_png};

    #[tokio::test]
    async fn two_chapter_book_runs_to_completion() {
        let h = Harness::new();
        let job = h.create(2, 1).await;

        let mut progress = Vec::new();
        let mut last = None;
        for _ in 0..10 {
            let report = h.executor.tick(job.id).await.unwrap();
            progress.push(report.progress);
            let done = report.status.is_terminal();
            last = Some(report);
            if done {
                break;
            }
        }

        let last = last.unwrap();
        assert_eq!((last.status, last.step, last.progress), (JobStatus::Complete, Step::Complete, 100));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");

        let stored = h.job(job.id).await;
        assert_eq!(stored.canonical_sections(), 2);
        assert!(stored.chapters.iter().all(|c| c.status == UnitStatus::Locked));
        assert_eq!(stored.cover_status(), Some(CoverStatus::Ready));
        assert!(stored.error.is_none());
        assert!(stored.lease_expires_at.is_none());

        let canonical_at: Vec<_> = stored
            .chapters
            .iter()
            .flat_map(|c| &c.sections)
            .map(|s| s.canonical_at.unwrap())
            .collect();
        assert!(canonical_at.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn a_tick_after_completion_changes_nothing() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        h.executor.drive(job.id, 20).await.unwrap();
        let before = h.job(job.id).await;

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Terminal);
        assert_eq!(h.job(job.id).await, before);
    }

    #[tokio::test]
    async fn nine_hour_old_job_is_picked_up_by_the_watchdog() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        h.age(job.id, Duration::hours(9)).await;

        let cutoff = Utc::now() - Duration::minutes(5);
        let candidates = h.store.list_stale(&StaleQuery::resumable(cutoff, 20, 10)).await.unwrap();
        assert_eq!(candidates.iter().map(|j| j.id).collect::<Vec<_>>(), vec![job.id]);

        let report = h.watchdog.run_watchdog_sweep().await.unwrap();
        assert_eq!(report.resumed, 1);
    }

    #[tokio::test]
    async fn ceiling_moves_a_job_from_resumable_to_exhausted() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        let mut stored = h.job(job.id).await;
        stored.auto_resume_attempts = 20;
        h.store.update(&stored, ExpectedVersion::Any).await.unwrap();
        h.age(job.id, Duration::hours(1)).await;

        let cutoff = Utc::now() - Duration::minutes(5);
        assert!(h.store.list_stale(&StaleQuery::resumable(cutoff, 20, 10)).await.unwrap().is_empty());
        assert_eq!(h.store.list_stale(&StaleQuery::exhausted(20, 10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn crashed_job_is_resumed_by_the_watchdog_and_finishes() {
        let h = Harness::new();
        let job = h.create(2, 1).await;
        h.executor.tick(job.id).await.unwrap();
        h.executor.tick(job.id).await.unwrap();

        // A worker dies mid-tick: the lease is left behind and nothing else is written.
        let mut stored = h.job(job.id).await;
        stored.lease_expires_at = Some(Utc::now() - Duration::seconds(1));
        stored.updated_at = Utc::now() - Duration::minutes(30);
        h.store.update(&stored, ExpectedVersion::Any).await.unwrap();

        let report = h.watchdog.run_watchdog_sweep().await.unwrap();
        assert_eq!(report.ticks[0].step, Step::write(0, 0));

        let done = h.executor.drive(job.id, 20).await.unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(h.llm.count(PromptKind::Constitution), 1);
        assert_eq!(h.job(job.id).await.auto_resume_attempts, 1);
    }

    #[tokio::test]
    async fn failed_jobs_are_never_resumed() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        h.llm.fail_on(PromptKind::Constitution, AiError::Parse("not json".into()));
        h.executor.tick(job.id).await.unwrap();
        let failed = h.executor.tick(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        h.age(job.id, Duration::hours(9)).await;

        let watchdog = h.watchdog.run_watchdog_sweep().await.unwrap();
        let cleanup = h.watchdog.run_cleanup_sweep().await.unwrap();

        assert_eq!(watchdog.scanned, 0);
        assert!(cleanup.failed.is_empty());
        let stored = h.job(job.id).await;
        assert_eq!(stored.auto_resume_attempts, 0);
        assert!(stored.error.unwrap().contains("not json"));
    }

    #[tokio::test]
    async fn a_job_never_ships_without_a_ready_cover() {
        let h = Harness::with_images(FakeImageGenerator::always(solid_png(512, 768, 128)));
        let job = h.create(1, 1).await;

        let mut reports = Vec::new();
        for _ in 0..10 {
            let report = h.executor.tick(job.id).await.unwrap();
            let terminal = report.status.is_terminal();
            reports.push(report);
            if terminal {
                break;
            }
        }

        assert!(reports.iter().all(|r| r.status != JobStatus::Complete));
        let stored = h.job(job.id).await;
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.cover_status(), Some(CoverStatus::Failed));
        assert!(
            reports
                .iter()
                .filter(|r| r.step == Step::Finalize)
                .all(|r| (97..=100).contains(&r.progress))
        );
    }

    #[tokio::test]
    async fn live_lease_makes_a_second_tick_busy() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        let mut stored = h.job(job.id).await;
        stored.lease_expires_at = Some(Utc::now() + Duration::minutes(2));
        h.store.update(&stored, ExpectedVersion::Any).await.unwrap();

        let report = h.executor.tick(job.id).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Busy);
        assert_eq!(h.job(job.id).await.step, Step::Created);
    }

    #[tokio::test]
    async fn a_write_during_the_tick_supersedes_it() {
        let h = Harness::new();
        let job = h.create(1, 1).await;
        h.executor.tick(job.id).await.unwrap();
        let (reached, release) = h.llm.pause_on(PromptKind::Constitution);

        let executor = h.executor.clone();
        let tick = tokio::spawn(async move { executor.tick(job.id).await });
        reached.notified().await;
        // Someone else (an operator, another worker past the lease) writes the job.
        let stored = h.job(job.id).await;
        h.store.update(&stored, ExpectedVersion::Any).await.unwrap();
        release.notify_one();

        let report = tick.await.unwrap().unwrap();

        assert_eq!(report.outcome, TickOutcome::Superseded);
        let stored = h.job(job.id).await;
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.step, Step::Constitution);
        assert!(!stored.constitution_finalized);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn any_small_book_completes_with_every_section_canonical(chapters in 1u32..4, sections in 1u32..3) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (report, stored) = runtime.block_on(async {
                let h = Harness::new();
                let job = h.create(chapters, sections).await;
                let report = h.executor.drive(job.id, 50).await.unwrap();
                (report, h.job(job.id).await)
            });

            prop_assert_eq!(report.status, JobStatus::Complete);
            prop_assert_eq!(stored.canonical_sections(), (chapters * sections) as usize);
            prop_assert!(stored.chapters.iter().all(|c| c.is_locked()));
        }
    }
}
