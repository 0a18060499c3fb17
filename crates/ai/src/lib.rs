//! `storyforge-ai`
//!
//! **Responsibility:** the boundary to external AI services.
//!
//! - Collaborator traits ([`LlmClient`], [`ImageGenerator`], [`ImageAnalyzer`]).
//! - Prompt builders and structured response parsing for the book text
//!   ([`BookWriter`]) and the cover concept ([`CoverArtDirector`]).
//! - An OpenAI-compatible HTTP adapter.
//!
//! This crate never mutates job state: it returns values, the engine decides
//! what to persist.

pub mod client;
pub mod cover;
pub mod error;
pub mod json;
pub mod openai;
pub mod writer;

pub use client::{ImageAnalysis, ImageAnalyzer, ImageGenerator, LlmClient};
pub use cover::{CONCEPT_SYSTEM, CoverArtDirector, CoverBrief, CoverConcept, image_prompt};
pub use error::{AiError, AiResult};
pub use json::{extract_json, parse_json};
pub use openai::OpenAiClient;
pub use writer::{
    BookWriter, CONSISTENCY_SYSTEM, CONSTITUTION_SYSTEM, ConsistencyVerdict, OUTLINE_SYSTEM,
    REWRITE_SYSTEM, SECTION_SYSTEM, SectionDraft,
};
