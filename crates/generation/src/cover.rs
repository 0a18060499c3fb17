//! Cover asset sub-state machine and the finalization decision table.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use storyforge_core::DomainError;

use crate::progress::{COMPLETE, FINALIZE_FLOOR, FINALIZE_WAITING};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverStatus {
    Pending,
    Generating,
    Ready,
    Failed,
}

impl CoverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverStatus::Pending => "pending",
            CoverStatus::Generating => "generating",
            CoverStatus::Ready => "ready",
            CoverStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CoverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoverStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CoverStatus::Pending),
            "generating" => Ok(CoverStatus::Generating),
            "ready" => Ok(CoverStatus::Ready),
            "failed" => Ok(CoverStatus::Failed),
            other => Err(DomainError::validation(format!("unknown cover status: {other}"))),
        }
    }
}

/// Cover generation owned by a job's `finalize` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverJob {
    pub status: CoverStatus,
    /// How many times generation has been started for this job.
    pub generations: u32,
    /// Quality-gate attempts used by the most recent run.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub asset_uri: Option<String>,
    pub error: Option<String>,
}

impl CoverJob {
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: CoverStatus::Pending,
            generations: 0,
            attempts: 0,
            started_at: None,
            updated_at: now,
            asset_uri: None,
            error: None,
        }
    }

    pub fn start(&mut self, generation: u32, now: DateTime<Utc>) {
        self.status = CoverStatus::Generating;
        self.generations = generation;
        self.attempts = 0;
        self.started_at = Some(now);
        self.updated_at = now;
        self.asset_uri = None;
        self.error = None;
    }

    pub fn succeed(&mut self, asset_uri: String, attempts: u32, now: DateTime<Utc>) {
        self.status = CoverStatus::Ready;
        self.attempts = attempts;
        self.asset_uri = Some(asset_uri);
        self.error = None;
        self.updated_at = now;
    }

    pub fn fail(&mut self, reason: String, attempts: u32, now: DateTime<Utc>) {
        self.status = CoverStatus::Failed;
        self.attempts = attempts;
        self.error = Some(reason);
        self.updated_at = now;
    }

    /// `generating` for longer than `timeout`.
    pub fn is_timed_out(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.status != CoverStatus::Generating {
            return false;
        }
        let since = self.started_at.unwrap_or(self.updated_at);
        now - since > timeout
    }
}

/// What the `finalize` step does with a given cover status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverCompletionAction {
    Complete,
    Wait,
    Regenerate,
}

impl CoverCompletionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverCompletionAction::Complete => "complete",
            CoverCompletionAction::Wait => "wait",
            CoverCompletionAction::Regenerate => "regenerate",
        }
    }
}

/// Decision table for `finalize`. `None` means no cover job exists yet.
pub fn cover_completion_action(status: Option<CoverStatus>) -> CoverCompletionAction {
    match status {
        Some(CoverStatus::Ready) => CoverCompletionAction::Complete,
        Some(CoverStatus::Generating) | Some(CoverStatus::Pending) => CoverCompletionAction::Wait,
        Some(CoverStatus::Failed) | None => CoverCompletionAction::Regenerate,
    }
}

pub fn can_complete(status: Option<CoverStatus>) -> bool {
    matches!(status, Some(CoverStatus::Ready))
}

pub fn finalize_progress(action: CoverCompletionAction) -> u8 {
    match action {
        CoverCompletionAction::Complete => COMPLETE,
        CoverCompletionAction::Wait => FINALIZE_WAITING,
        CoverCompletionAction::Regenerate => FINALIZE_FLOOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Option<CoverStatus>; 5] = [
        None,
        Some(CoverStatus::Pending),
        Some(CoverStatus::Generating),
        Some(CoverStatus::Ready),
        Some(CoverStatus::Failed),
    ];

    #[test]
    fn decision_table() {
        assert_eq!(cover_completion_action(Some(CoverStatus::Ready)), CoverCompletionAction::Complete);
        assert_eq!(cover_completion_action(Some(CoverStatus::Pending)), CoverCompletionAction::Wait);
        assert_eq!(cover_completion_action(Some(CoverStatus::Generating)), CoverCompletionAction::Wait);
        assert_eq!(cover_completion_action(Some(CoverStatus::Failed)), CoverCompletionAction::Regenerate);
        assert_eq!(cover_completion_action(None), CoverCompletionAction::Regenerate);
    }

    #[test]
    fn only_ready_can_complete() {
        for status in ALL {
            assert_eq!(can_complete(status), status == Some(CoverStatus::Ready));
        }
    }

    #[test]
    fn finalize_progress_stays_in_band() {
        for status in ALL {
            let p = finalize_progress(cover_completion_action(status));
            assert!((97..=100).contains(&p), "{status:?} -> {p}");
        }
    }

    #[test]
    fn generating_cover_times_out() {
        let t0 = Utc::now();
        let mut cover = CoverJob::pending(t0);
        cover.start(1, t0);

        assert!(!cover.is_timed_out(t0 + Duration::minutes(4), Duration::minutes(5)));
        assert!(cover.is_timed_out(t0 + Duration::minutes(6), Duration::minutes(5)));

        cover.fail("rejected".into(), 3, t0 + Duration::minutes(6));
        assert!(!cover.is_timed_out(t0 + Duration::hours(1), Duration::minutes(5)));
    }

    #[test]
    fn restart_clears_previous_outcome() {
        let t0 = Utc::now();
        let mut cover = CoverJob::pending(t0);
        cover.start(1, t0);
        cover.fail("blank image".into(), 3, t0);
        cover.start(2, t0);

        assert_eq!(cover.status, CoverStatus::Generating);
        assert_eq!(cover.generations, 2);
        assert!(cover.error.is_none());
    }
}
