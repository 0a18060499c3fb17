use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storyforge_core::{Aggregate, AggregateRoot, DomainError, DomainResult, JobId};

use crate::content::{CanonicalExcerpt, Chapter, Constitution, Outline, Section, SectionContext, UnitStatus};
use crate::cover::{CoverJob, CoverStatus, can_complete};
use crate::progress::{
    COMPLETE, CONSTITUTION_DONE, FINALIZE_FLOOR, FINALIZE_WAITING, PLAN_DONE, writing_progress,
};
use crate::step::Step;

/// Number of canonical sections handed to the writer as local context.
pub const CONTEXT_WINDOW: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    /// Statuses the watchdog and cleanup sweeps look at.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRequest {
    pub title: String,
    pub premise: String,
    pub genre: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    /// Planner hints; the outline that comes back is authoritative.
    pub chapters: u32,
    pub sections_per_chapter: u32,
}

impl BookRequest {
    pub fn new(title: impl Into<String>, premise: impl Into<String>, genre: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            premise: premise.into(),
            genre: genre.into(),
            author: None,
            audience: None,
            chapters: 8,
            sections_per_chapter: 3,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_shape(mut self, chapters: u32, sections_per_chapter: u32) -> Self {
        self.chapters = chapters;
        self.sections_per_chapter = sections_per_chapter;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.title.trim().is_empty() {
            return Err(DomainError::validation("title cannot be empty"));
        }
        if self.premise.trim().is_empty() {
            return Err(DomainError::validation("premise cannot be empty"));
        }
        if self.chapters == 0 || self.sections_per_chapter == 0 {
            return Err(DomainError::validation("book shape must have at least one section"));
        }
        Ok(())
    }
}

/// Durable record of one book generation.
///
/// `revision` and `lease_expires_at` belong to the store's concurrency
/// control; everything else changes only through [`Aggregate::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub request: BookRequest,
    pub status: JobStatus,
    pub step: Step,
    pub progress: u8,
    /// In-step rewrite counter; reset whenever the step advances.
    pub attempt: u32,
    /// Incremented only by the watchdog.
    pub auto_resume_attempts: u32,
    pub error: Option<String>,
    pub constitution: Option<Constitution>,
    pub constitution_finalized: bool,
    pub chapters: Vec<Chapter>,
    pub synopsis: String,
    pub cover: Option<CoverJob>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// External work needed to advance a job by one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEffect {
    /// No external call; flip to running and move on.
    Start,
    DraftConstitution,
    /// A constitution is already stored; only the step needs to move.
    ReuseConstitution,
    DraftOutline,
    WriteSection {
        chapter: u32,
        section: u32,
        context: SectionContext,
    },
    Finalize,
    /// Terminal: nothing left to do.
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    Start {
        occurred_at: DateTime<Utc>,
    },
    RecordConstitution {
        constitution: Constitution,
        occurred_at: DateTime<Utc>,
    },
    ConfirmConstitution {
        occurred_at: DateTime<Utc>,
    },
    RecordOutline {
        outline: Outline,
        occurred_at: DateTime<Utc>,
    },
    BeginRewrite {
        chapter: u32,
        section: u32,
        occurred_at: DateTime<Utc>,
    },
    RecordSection {
        chapter: u32,
        section: u32,
        body: String,
        synopsis: String,
        occurred_at: DateTime<Utc>,
    },
    StartCover {
        occurred_at: DateTime<Utc>,
    },
    RecordCoverReady {
        asset_uri: String,
        attempts: u32,
        occurred_at: DateTime<Utc>,
    },
    RecordCoverFailure {
        reason: String,
        attempts: u32,
        occurred_at: DateTime<Utc>,
    },
    /// Cover stuck in `generating` past its timeout.
    ExpireCover {
        occurred_at: DateTime<Utc>,
    },
    ReportWaiting,
    Complete {
        occurred_at: DateTime<Utc>,
    },
    Fail {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        occurred_at: DateTime<Utc>,
    },
    ConstitutionFinalized {
        constitution: Constitution,
        occurred_at: DateTime<Utc>,
    },
    OutlineMaterialized {
        chapters: Vec<Chapter>,
        occurred_at: DateTime<Utc>,
    },
    RewriteAttempted {
        chapter: u32,
        section: u32,
        attempt: u32,
    },
    SectionCanonicalized {
        chapter: u32,
        section: u32,
        body: String,
        occurred_at: DateTime<Utc>,
    },
    SynopsisUpdated {
        synopsis: String,
    },
    ChapterLocked {
        chapter: u32,
    },
    StepAdvanced {
        from: Step,
        to: Step,
        occurred_at: DateTime<Utc>,
    },
    ProgressReported {
        progress: u8,
    },
    CoverGenerationStarted {
        generation: u32,
        occurred_at: DateTime<Utc>,
    },
    CoverReady {
        asset_uri: String,
        attempts: u32,
        occurred_at: DateTime<Utc>,
    },
    CoverFailed {
        reason: String,
        attempts: u32,
        occurred_at: DateTime<Utc>,
    },
    Completed {
        occurred_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Started { .. } => "job.started",
            JobEvent::ConstitutionFinalized { .. } => "job.constitution_finalized",
            JobEvent::OutlineMaterialized { .. } => "job.outline_materialized",
            JobEvent::RewriteAttempted { .. } => "job.rewrite_attempted",
            JobEvent::SectionCanonicalized { .. } => "job.section_canonicalized",
            JobEvent::SynopsisUpdated { .. } => "job.synopsis_updated",
            JobEvent::ChapterLocked { .. } => "job.chapter_locked",
            JobEvent::StepAdvanced { .. } => "job.step_advanced",
            JobEvent::ProgressReported { .. } => "job.progress_reported",
            JobEvent::CoverGenerationStarted { .. } => "job.cover.started",
            JobEvent::CoverReady { .. } => "job.cover.ready",
            JobEvent::CoverFailed { .. } => "job.cover.failed",
            JobEvent::Completed { .. } => "job.completed",
            JobEvent::Failed { .. } => "job.failed",
        }
    }
}

impl GenerationJob {
    /// A fresh job in `queued/created`.
    pub fn new(id: JobId, request: BookRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            request,
            status: JobStatus::Queued,
            step: Step::Created,
            progress: 0,
            attempt: 0,
            auto_resume_attempts: 0,
            error: None,
            constitution: None,
            constitution_finalized: false,
            chapters: Vec::new(),
            synopsis: String::new(),
            cover: None,
            created_at: now,
            updated_at: now,
            revision: 0,
            lease_expires_at: None,
        }
    }

    pub fn chapter(&self, chapter: u32) -> Option<&Chapter> {
        self.chapters.get(chapter as usize)
    }

    pub fn section(&self, chapter: u32, section: u32) -> Option<&Section> {
        self.chapter(chapter)?.sections.get(section as usize)
    }

    fn section_mut(&mut self, chapter: u32, section: u32) -> Option<&mut Section> {
        self.chapters
            .get_mut(chapter as usize)?
            .sections
            .get_mut(section as usize)
    }

    pub fn total_sections(&self) -> usize {
        self.chapters.iter().map(|c| c.sections.len()).sum()
    }

    pub fn canonical_sections(&self) -> usize {
        self.chapters
            .iter()
            .flat_map(|c| &c.sections)
            .filter(|s| s.is_canonical())
            .count()
    }

    pub fn cover_status(&self) -> Option<CoverStatus> {
        self.cover.as_ref().map(|c| c.status)
    }

    /// Whether another tick currently holds the job.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|until| until > now)
    }

    /// The external work the current step needs.
    pub fn next_effect(&self) -> StepEffect {
        if self.status.is_terminal() {
            return StepEffect::Done;
        }
        match self.step {
            Step::Created => StepEffect::Start,
            Step::Constitution if self.constitution_finalized => StepEffect::ReuseConstitution,
            Step::Constitution => StepEffect::DraftConstitution,
            Step::Plan => StepEffect::DraftOutline,
            Step::Write { chapter, section } => StepEffect::WriteSection {
                chapter,
                section,
                context: self.section_context(chapter, section, CONTEXT_WINDOW),
            },
            Step::Finalize => StepEffect::Finalize,
            Step::Complete => StepEffect::Done,
        }
    }

    /// The last `window` canonical sections before `(chapter, section)`,
    /// oldest first, plus the rolling synopsis.
    pub fn section_context(&self, chapter: u32, section: u32, window: usize) -> SectionContext {
        let mut previous: Vec<CanonicalExcerpt> = self
            .chapters
            .iter()
            .flat_map(|c| c.sections.iter().map(move |s| (c.index, s)))
            .filter(|(ci, s)| (*ci, s.index) < (chapter, section) && s.is_canonical())
            .map(|(ci, s)| CanonicalExcerpt {
                chapter: ci,
                section: s.index,
                title: s.title.clone(),
                body: s.body.clone().unwrap_or_default(),
            })
            .collect();
        let skip = previous.len().saturating_sub(window);
        previous.drain(..skip);

        let (chapter_title, chapter_goal) = self
            .chapter(chapter)
            .map(|c| (c.title.clone(), c.goal.clone()))
            .unwrap_or_default();
        let (section_title, section_goal) = self
            .section(chapter, section)
            .map(|s| (s.title.clone(), s.goal.clone()))
            .unwrap_or_default();

        SectionContext {
            chapter_title,
            chapter_goal,
            section_title,
            section_goal,
            previous,
            synopsis: self.synopsis.clone(),
        }
    }

    fn expect_step(&self, expected: Step) -> DomainResult<()> {
        if self.step != expected {
            return Err(DomainError::conflict(format!(
                "job {} is at step {}, not {}",
                self.id, self.step, expected
            )));
        }
        Ok(())
    }

    /// Step after `(chapter, section)` and whether that closes the chapter.
    fn step_after(&self, chapter: u32, section: u32) -> DomainResult<(Step, bool)> {
        let current = self.chapter(chapter).ok_or_else(DomainError::not_found)?;
        if (section as usize + 1) < current.sections.len() {
            Ok((Step::write(chapter, section + 1), false))
        } else if (chapter as usize + 1) < self.chapters.len() {
            Ok((Step::write(chapter + 1, 0), true))
        } else {
            Ok((Step::Finalize, true))
        }
    }

    fn generating_cover(&self) -> DomainResult<&CoverJob> {
        match &self.cover {
            Some(cover) if cover.status == CoverStatus::Generating => Ok(cover),
            Some(cover) => Err(DomainError::conflict(format!(
                "cover is {}, not generating",
                cover.status
            ))),
            None => Err(DomainError::conflict("no cover generation in progress")),
        }
    }

    fn handle_section(
        &self,
        chapter: u32,
        section: u32,
        body: &str,
        synopsis: &str,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Vec<JobEvent>> {
        self.expect_step(Step::write(chapter, section))?;
        let unit = self
            .section(chapter, section)
            .ok_or_else(DomainError::not_found)?;
        if unit.is_canonical() {
            return Err(DomainError::invariant(format!(
                "section ch{chapter}/s{section} is already canonical"
            )));
        }
        if body.trim().is_empty() {
            return Err(DomainError::validation("section body cannot be empty"));
        }

        let (next, locks_chapter) = self.step_after(chapter, section)?;
        let mut events = vec![JobEvent::SectionCanonicalized {
            chapter,
            section,
            body: body.to_string(),
            occurred_at,
        }];
        if !synopsis.trim().is_empty() {
            events.push(JobEvent::SynopsisUpdated {
                synopsis: synopsis.to_string(),
            });
        }
        if locks_chapter {
            events.push(JobEvent::ChapterLocked { chapter });
        }
        events.push(JobEvent::StepAdvanced {
            from: self.step,
            to: next,
            occurred_at,
        });
        let progress = if next == Step::Finalize {
            FINALIZE_FLOOR
        } else {
            writing_progress(self.canonical_sections() + 1, self.total_sections())
        };
        events.push(JobEvent::ProgressReported { progress });
        Ok(events)
    }
}

impl AggregateRoot for GenerationJob {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.revision
    }
}

impl Aggregate for GenerationJob {
    type Command = JobCommand;
    type Event = JobEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            JobEvent::Started { occurred_at } => {
                self.status = JobStatus::Running;
                self.updated_at = *occurred_at;
            }
            JobEvent::ConstitutionFinalized {
                constitution,
                occurred_at,
            } => {
                self.constitution = Some(constitution.clone());
                self.constitution_finalized = true;
                self.updated_at = *occurred_at;
            }
            JobEvent::OutlineMaterialized {
                chapters,
                occurred_at,
            } => {
                self.chapters = chapters.clone();
                self.updated_at = *occurred_at;
            }
            JobEvent::RewriteAttempted { attempt, .. } => {
                self.attempt = *attempt;
            }
            JobEvent::SectionCanonicalized {
                chapter,
                section,
                body,
                occurred_at,
            } => {
                if let Some(unit) = self.section_mut(*chapter, *section) {
                    unit.body = Some(body.clone());
                    unit.status = UnitStatus::Canonical;
                    unit.canonical_at = Some(*occurred_at);
                }
                self.updated_at = *occurred_at;
            }
            JobEvent::SynopsisUpdated { synopsis } => {
                self.synopsis = synopsis.clone();
            }
            JobEvent::ChapterLocked { chapter } => {
                if let Some(c) = self.chapters.get_mut(*chapter as usize) {
                    c.status = UnitStatus::Locked;
                }
            }
            JobEvent::StepAdvanced {
                to, occurred_at, ..
            } => {
                self.step = *to;
                self.attempt = 0;
                if self.status == JobStatus::Queued {
                    self.status = JobStatus::Running;
                }
                self.updated_at = *occurred_at;
            }
            JobEvent::ProgressReported { progress } => {
                self.progress = self.progress.max((*progress).min(COMPLETE));
            }
            JobEvent::CoverGenerationStarted {
                generation,
                occurred_at,
            } => {
                self.cover
                    .get_or_insert_with(|| CoverJob::pending(*occurred_at))
                    .start(*generation, *occurred_at);
            }
            JobEvent::CoverReady {
                asset_uri,
                attempts,
                occurred_at,
            } => {
                if let Some(cover) = self.cover.as_mut() {
                    cover.succeed(asset_uri.clone(), *attempts, *occurred_at);
                }
                self.updated_at = *occurred_at;
            }
            JobEvent::CoverFailed {
                reason,
                attempts,
                occurred_at,
            } => {
                if let Some(cover) = self.cover.as_mut() {
                    cover.fail(reason.clone(), *attempts, *occurred_at);
                }
                self.updated_at = *occurred_at;
            }
            JobEvent::Completed { occurred_at } => {
                self.status = JobStatus::Complete;
                self.error = None;
                self.updated_at = *occurred_at;
            }
            JobEvent::Failed {
                reason,
                occurred_at,
            } => {
                self.status = JobStatus::Failed;
                self.error = Some(reason.clone());
                self.updated_at = *occurred_at;
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if self.status.is_terminal() {
            return Err(DomainError::conflict(format!(
                "job {} is already {}",
                self.id, self.status
            )));
        }

        match command {
            JobCommand::Start { occurred_at } => {
                self.expect_step(Step::Created)?;
                Ok(vec![
                    JobEvent::Started {
                        occurred_at: *occurred_at,
                    },
                    JobEvent::StepAdvanced {
                        from: Step::Created,
                        to: Step::Constitution,
                        occurred_at: *occurred_at,
                    },
                ])
            }
            JobCommand::RecordConstitution {
                constitution,
                occurred_at,
            } => {
                self.expect_step(Step::Constitution)?;
                if self.constitution_finalized {
                    return Err(DomainError::invariant("constitution is already finalized"));
                }
                constitution.validate()?;
                Ok(vec![
                    JobEvent::ConstitutionFinalized {
                        constitution: constitution.clone(),
                        occurred_at: *occurred_at,
                    },
                    JobEvent::StepAdvanced {
                        from: Step::Constitution,
                        to: Step::Plan,
                        occurred_at: *occurred_at,
                    },
                    JobEvent::ProgressReported {
                        progress: CONSTITUTION_DONE,
                    },
                ])
            }
            JobCommand::ConfirmConstitution { occurred_at } => {
                self.expect_step(Step::Constitution)?;
                if !self.constitution_finalized {
                    return Err(DomainError::invariant("no finalized constitution to reuse"));
                }
                Ok(vec![
                    JobEvent::StepAdvanced {
                        from: Step::Constitution,
                        to: Step::Plan,
                        occurred_at: *occurred_at,
                    },
                    JobEvent::ProgressReported {
                        progress: CONSTITUTION_DONE,
                    },
                ])
            }
            JobCommand::RecordOutline {
                outline,
                occurred_at,
            } => {
                self.expect_step(Step::Plan)?;
                if !self.chapters.is_empty() {
                    return Err(DomainError::invariant("outline is already materialized"));
                }
                outline.validate()?;
                Ok(vec![
                    JobEvent::OutlineMaterialized {
                        chapters: outline.materialize(*occurred_at),
                        occurred_at: *occurred_at,
                    },
                    JobEvent::StepAdvanced {
                        from: Step::Plan,
                        to: Step::first_section(),
                        occurred_at: *occurred_at,
                    },
                    JobEvent::ProgressReported {
                        progress: PLAN_DONE,
                    },
                ])
            }
            JobCommand::BeginRewrite {
                chapter, section, ..
            } => {
                self.expect_step(Step::write(*chapter, *section))?;
                let unit = self
                    .section(*chapter, *section)
                    .ok_or_else(DomainError::not_found)?;
                if unit.is_canonical() {
                    return Err(DomainError::invariant(format!(
                        "section ch{chapter}/s{section} is already canonical"
                    )));
                }
                Ok(vec![JobEvent::RewriteAttempted {
                    chapter: *chapter,
                    section: *section,
                    attempt: self.attempt + 1,
                }])
            }
            JobCommand::RecordSection {
                chapter,
                section,
                body,
                synopsis,
                occurred_at,
            } => self.handle_section(*chapter, *section, body, synopsis, *occurred_at),
            JobCommand::StartCover { occurred_at } => {
                self.expect_step(Step::Finalize)?;
                match self.cover_status() {
                    Some(CoverStatus::Generating) => {
                        Err(DomainError::conflict("cover generation already in progress"))
                    }
                    Some(CoverStatus::Ready) => Err(DomainError::invariant("cover is already ready")),
                    _ => {
                        let generation = self.cover.as_ref().map_or(0, |c| c.generations) + 1;
                        Ok(vec![
                            JobEvent::CoverGenerationStarted {
                                generation,
                                occurred_at: *occurred_at,
                            },
                            JobEvent::ProgressReported {
                                progress: FINALIZE_FLOOR,
                            },
                        ])
                    }
                }
            }
            JobCommand::RecordCoverReady {
                asset_uri,
                attempts,
                occurred_at,
            } => {
                self.expect_step(Step::Finalize)?;
                self.generating_cover()?;
                if asset_uri.trim().is_empty() {
                    return Err(DomainError::validation("cover asset uri cannot be empty"));
                }
                Ok(vec![JobEvent::CoverReady {
                    asset_uri: asset_uri.clone(),
                    attempts: *attempts,
                    occurred_at: *occurred_at,
                }])
            }
            JobCommand::RecordCoverFailure {
                reason,
                attempts,
                occurred_at,
            } => {
                self.expect_step(Step::Finalize)?;
                self.generating_cover()?;
                Ok(vec![JobEvent::CoverFailed {
                    reason: reason.clone(),
                    attempts: *attempts,
                    occurred_at: *occurred_at,
                }])
            }
            JobCommand::ExpireCover { occurred_at } => {
                self.expect_step(Step::Finalize)?;
                let cover = self.generating_cover()?;
                Ok(vec![JobEvent::CoverFailed {
                    reason: "cover generation timed out".to_string(),
                    attempts: cover.attempts,
                    occurred_at: *occurred_at,
                }])
            }
            JobCommand::ReportWaiting => {
                self.expect_step(Step::Finalize)?;
                Ok(vec![JobEvent::ProgressReported {
                    progress: FINALIZE_WAITING,
                }])
            }
            JobCommand::Complete { occurred_at } => {
                self.expect_step(Step::Finalize)?;
                let status = self.cover_status();
                if !can_complete(status) {
                    return Err(DomainError::invariant(format!(
                        "cannot complete without a ready cover (cover: {})",
                        status.map_or("absent", |s| s.as_str())
                    )));
                }
                Ok(vec![
                    JobEvent::StepAdvanced {
                        from: Step::Finalize,
                        to: Step::Complete,
                        occurred_at: *occurred_at,
                    },
                    JobEvent::ProgressReported { progress: COMPLETE },
                    JobEvent::Completed {
                        occurred_at: *occurred_at,
                    },
                ])
            }
            JobCommand::Fail {
                reason,
                occurred_at,
            } => Ok(vec![JobEvent::Failed {
                reason: reason.clone(),
                occurred_at: *occurred_at,
            }]),
        }
    }
}
