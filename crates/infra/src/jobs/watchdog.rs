//! Stuck-job watchdog and the coarser cleanup sweep.
//!
//! Staleness is wall-clock inactivity (`updated_at`) only. A job that is
//! slow but still writing is never touched.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use storyforge_core::JobId;

use crate::config::EngineConfig;

use super::executor::{EngineError, StepExecutor, TickReport};
use super::store::{JobStore, StaleQuery};

pub const EXHAUSTED_MESSAGE: &str = "exceeded auto-resume attempts";
pub const ABANDONED_MESSAGE: &str = "abandoned: no activity within the cleanup window";

/// Upper bound on jobs failed per sweep.
const FAIL_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchdogReport {
    /// Stale jobs selected for resumption.
    pub scanned: usize,
    pub resumed: usize,
    pub ticks: Vec<TickReport>,
    /// Jobs failed for exhausting their auto-resumes.
    pub failed: Vec<JobId>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub failed: Vec<JobId>,
    pub errors: Vec<String>,
}

pub struct Watchdog {
    store: Arc<dyn JobStore>,
    executor: Arc<StepExecutor>,
    stale_after: chrono::Duration,
    cleanup_after: chrono::Duration,
    max_auto_resume: u32,
    batch: usize,
}

impl Watchdog {
    pub fn new(store: Arc<dyn JobStore>, executor: Arc<StepExecutor>, config: &EngineConfig) -> Self {
        Self {
            store,
            executor,
            stale_after: config.stale_after_chrono(),
            cleanup_after: config.cleanup_after_chrono(),
            max_auto_resume: config.max_auto_resume,
            batch: config.watchdog_batch,
        }
    }

    /// Resume stale jobs once each, then fail the ones out of resumes.
    ///
    /// Per-job failures are collected in the report; only a failed query is an `Err`.
    pub async fn run_watchdog_sweep(&self) -> Result<WatchdogReport, EngineError> {
        let cutoff = Utc::now() - self.stale_after;
        let mut report = WatchdogReport::default();

        let stale = self
            .store
            .list_stale(&StaleQuery::resumable(cutoff, self.max_auto_resume, self.batch))
            .await?;
        report.scanned = stale.len();

        for job in stale {
            // Count the attempt before spending it.
            let job = match self.store.increment_auto_resume(job.id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "could not record auto-resume");
                    report.errors.push(format!("{}: {e}", job.id));
                    continue;
                }
            };
            report.resumed += 1;
            info!(job_id = %job.id, step = %job.step, attempt = job.auto_resume_attempts, "resuming stale job");

            match self.executor.tick(job.id).await {
                Ok(tick) => report.ticks.push(tick),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "resume tick failed");
                    report.errors.push(format!("{}: {e}", job.id));
                }
            }
        }

        let exhausted = self
            .store
            .list_stale(&StaleQuery::exhausted(self.max_auto_resume, FAIL_LIMIT))
            .await?;
        for job in exhausted {
            match self
                .store
                .fail_if_active(job.id, EXHAUSTED_MESSAGE, Utc::now())
                .await
            {
                Ok(true) => {
                    warn!(job_id = %job.id, attempts = job.auto_resume_attempts, "job exceeded auto-resume attempts");
                    report.failed.push(job.id);
                }
                Ok(false) => {}
                Err(e) => report.errors.push(format!("{}: {e}", job.id)),
            }
        }

        info!(
            scanned = report.scanned,
            resumed = report.resumed,
            failed = report.failed.len(),
            errors = report.errors.len(),
            "watchdog sweep finished"
        );
        Ok(report)
    }

    /// Fail active jobs that have been silent for the whole cleanup window.
    pub async fn run_cleanup_sweep(&self) -> Result<CleanupReport, EngineError> {
        let cutoff = Utc::now() - self.cleanup_after;
        let abandoned = self
            .store
            .list_stale(&StaleQuery::abandoned(cutoff, FAIL_LIMIT))
            .await?;

        let mut report = CleanupReport {
            scanned: abandoned.len(),
            ..CleanupReport::default()
        };
        for job in abandoned {
            match self
                .store
                .fail_if_active(job.id, ABANDONED_MESSAGE, Utc::now())
                .await
            {
                Ok(true) => report.failed.push(job.id),
                Ok(false) => {}
                Err(e) => report.errors.push(format!("{}: {e}", job.id)),
            }
        }

        if !report.failed.is_empty() {
            info!(failed = report.failed.len(), "cleanup sweep failed abandoned jobs");
        }
        Ok(report)
    }
}
