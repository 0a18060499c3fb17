//! Quality-gated cover generation.
//!
//! concept → image → quality gate (bounded retry) → typography. Only the
//! quality gate retries; every other stage fails the run immediately.

pub mod analysis;
pub mod pipeline;
pub mod quality;
pub mod typography;

use thiserror::Error;

use storyforge_ai::AiError;

pub use analysis::LumaAnalyzer;
pub use pipeline::{CoverOutcome, CoverPipeline};
pub use quality::{HeuristicQualityGate, QualityGate, QualityVerdict};
pub use typography::{
    COVER_HEIGHT, COVER_WIDTH, CoverLayout, GlyphTypesetter, SafeZone, TextColor, Typesetter,
    compose_cover, cover_window, font_family_for_genre,
};

#[derive(Debug, Clone, Error)]
pub enum CoverError {
    #[error("concept distillation failed: {0}")]
    Concept(AiError),
    #[error("image generation failed: {0}")]
    Generation(AiError),
    #[error("image processing failed: {0}")]
    Processing(String),
    #[error("font error: {0}")]
    Font(String),
}
