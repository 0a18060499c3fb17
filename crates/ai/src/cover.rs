//! Cover art direction: turn book metadata into an image prompt.
//!
//! The book title never reaches the image model. Generators render any text
//! they are given as garbled glyphs, so the title is composited later by the
//! typography stage instead.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::LlmClient;
use crate::error::{AiError, AiResult};
use crate::json::parse_json;

pub const CONCEPT_SYSTEM: &str = "You are an art director for book covers. Distill the book into a \
single visual concept for a painted cover illustration. Never include any words, titles or \
lettering. Answer with JSON only: {\"theme\": string, \"visual_metaphor\": string, \
\"emotional_target\": string, \"avoid\": [string]}.";

/// What the art director may know about the book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverBrief {
    pub genre: String,
    pub premise: String,
    pub tone: Option<String>,
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverConcept {
    pub theme: String,
    pub visual_metaphor: String,
    pub emotional_target: String,
    #[serde(default)]
    pub avoid: Vec<String>,
}

#[derive(Clone)]
pub struct CoverArtDirector {
    llm: Arc<dyn LlmClient>,
}

impl CoverArtDirector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// One text-only call. `title` is used only to scrub the answer.
    pub async fn distill(&self, brief: &CoverBrief, title: &str) -> AiResult<CoverConcept> {
        let mut user = String::new();
        let _ = writeln!(user, "Genre: {}", brief.genre);
        let _ = writeln!(user, "Premise: {}", scrub(&brief.premise, title));
        if let Some(tone) = &brief.tone {
            let _ = writeln!(user, "Tone: {tone}");
        }
        if !brief.themes.is_empty() {
            let _ = writeln!(user, "Themes: {}", brief.themes.join(", "));
        }

        let raw = self.llm.complete(CONCEPT_SYSTEM, &user).await?;
        let concept: CoverConcept = parse_json(&raw, "cover concept")?;
        if concept.visual_metaphor.trim().is_empty() {
            return Err(AiError::Parse("cover concept has no visual metaphor".into()));
        }

        Ok(CoverConcept {
            theme: scrub(&concept.theme, title),
            visual_metaphor: scrub(&concept.visual_metaphor, title),
            emotional_target: scrub(&concept.emotional_target, title),
            avoid: concept.avoid.iter().map(|a| scrub(a, title)).collect(),
        })
    }
}

/// Image prompt built from the concept alone.
pub fn image_prompt(concept: &CoverConcept) -> String {
    let mut prompt = String::from(
        "Painted book cover illustration, portrait orientation, no text, no letters, no typography. ",
    );
    let _ = write!(
        prompt,
        "Subject: {}. Theme: {}. Mood: {}. Leave calm negative space in the upper third.",
        concept.visual_metaphor, concept.theme, concept.emotional_target
    );
    let mut avoid = vec!["text", "watermarks", "borders"];
    avoid.extend(concept.avoid.iter().map(String::as_str).filter(|a| !a.is_empty()));
    let _ = write!(prompt, " Avoid: {}.", avoid.join(", "));
    prompt
}

/// Remove every ASCII-case-insensitive occurrence of `title` from `text`.
fn scrub(text: &str, title: &str) -> String {
    let needle = title.trim().to_ascii_lowercase();
    if needle.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.to_ascii_lowercase().find(&needle) {
        out.push_str(&rest[..idx]);
        rest = &rest[idx + needle.len()..];
    }
    out.push_str(rest);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
