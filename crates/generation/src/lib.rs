//! `storyforge-generation`
//!
//! **Responsibility:** the pure state machine behind a book generation job.
//!
//! - [`Step`] is the persisted program counter (`created` … `complete`).
//! - [`GenerationJob`] is an aggregate: external work is described by
//!   [`GenerationJob::next_effect`], its result comes back as a [`JobCommand`],
//!   `handle` turns it into [`JobEvent`]s and `apply` evolves the record.
//! - [`cover`] holds the nested cover sub-state machine and the finalization
//!   decision table.
//!
//! Nothing in here performs IO.

pub mod content;
pub mod cover;
pub mod job;
pub mod progress;
pub mod step;

pub use content::{
    CanonicalExcerpt, Chapter, Constitution, Outline, OutlineChapter, OutlineSection, Section,
    SectionContext, UnitStatus,
};
pub use cover::{
    CoverCompletionAction, CoverJob, CoverStatus, can_complete, cover_completion_action,
    finalize_progress,
};
pub use job::{BookRequest, GenerationJob, JobCommand, JobEvent, JobStatus, StepEffect};
pub use step::Step;
