//! Prompting and response parsing for the text steps of a book.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use storyforge_generation::{BookRequest, Constitution, Outline, SectionContext};

use crate::client::LlmClient;
use crate::error::{AiError, AiResult};
use crate::json::parse_json;

pub const CONSTITUTION_SYSTEM: &str = "You are a senior fiction editor. Establish the guiding \
constitution for a book before a single page is written. Answer with JSON only: \
{\"premise\": string, \"tone\": string, \"point_of_view\": string, \
\"themes\": [string], \"rules\": [string]}.";

pub const OUTLINE_SYSTEM: &str = "You are a story architect. Produce an ordered outline. Every \
chapter and every section has a one-sentence goal. Answer with JSON only: \
{\"chapters\": [{\"title\": string, \"goal\": string, \
\"sections\": [{\"title\": string, \"goal\": string}]}]}.";

pub const SECTION_SYSTEM: &str = "You are the author of this book. Write the requested section in \
full prose, continuing seamlessly from the previous sections and honouring the constitution. \
Then update the running synopsis of the whole book so far. Answer with JSON only: \
{\"content\": string, \"synopsis\": string}.";

pub const CONSISTENCY_SYSTEM: &str = "You are a continuity editor. Compare the draft against the \
constitution and the canonical sections that precede it. Flag contradictions of fact, \
character, tone or point of view. Answer with JSON only: \
{\"consistent\": bool, \"issues\": [string]}.";

pub const REWRITE_SYSTEM: &str = "You are the author of this book. Revise the draft so that every \
listed continuity issue is resolved while keeping its purpose and length. Answer with JSON \
only: {\"content\": string, \"synopsis\": string}.";

/// Prose for one section plus the synopsis that now covers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDraft {
    pub content: String,
    #[serde(default)]
    pub synopsis: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyVerdict {
    pub consistent: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// The text-generation half of the pipeline.
#[derive(Clone)]
pub struct BookWriter {
    llm: Arc<dyn LlmClient>,
}

impl BookWriter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn constitution(&self, request: &BookRequest) -> AiResult<Constitution> {
        let mut user = request_brief(request);
        let _ = writeln!(
            user,
            "\nDefine the constitution every chapter must respect."
        );

        let raw = self.llm.complete(CONSTITUTION_SYSTEM, &user).await?;
        let constitution: Constitution = parse_json(&raw, "constitution")?;
        constitution
            .validate()
            .map_err(|e| AiError::Parse(e.to_string()))?;
        Ok(constitution)
    }

    pub async fn outline(
        &self,
        request: &BookRequest,
        constitution: &Constitution,
    ) -> AiResult<Outline> {
        let mut user = request_brief(request);
        user.push_str(&constitution_brief(constitution));
        let _ = writeln!(
            user,
            "\nPlan {} chapters of {} sections each.",
            request.chapters, request.sections_per_chapter
        );

        let raw = self.llm.complete(OUTLINE_SYSTEM, &user).await?;
        let outline: Outline = parse_json(&raw, "outline")?;
        outline.validate().map_err(|e| AiError::Parse(e.to_string()))?;
        debug!(
            chapters = outline.chapters.len(),
            sections = outline.total_sections(),
            "outline parsed"
        );
        Ok(outline)
    }

    pub async fn write_section(
        &self,
        request: &BookRequest,
        constitution: &Constitution,
        context: &SectionContext,
    ) -> AiResult<SectionDraft> {
        let mut user = request_brief(request);
        user.push_str(&constitution_brief(constitution));
        user.push_str(&context_brief(context));

        let raw = self.llm.complete(SECTION_SYSTEM, &user).await?;
        parse_draft(&raw)
    }

    pub async fn check_consistency(
        &self,
        constitution: &Constitution,
        context: &SectionContext,
        draft: &SectionDraft,
    ) -> AiResult<ConsistencyVerdict> {
        let mut user = constitution_brief(constitution);
        user.push_str(&context_brief(context));
        let _ = write!(user, "\n# Draft\n{}\n", draft.content);

        let raw = self.llm.complete(CONSISTENCY_SYSTEM, &user).await?;
        parse_json(&raw, "consistency")
    }

    pub async fn rewrite_section(
        &self,
        constitution: &Constitution,
        context: &SectionContext,
        draft: &SectionDraft,
        issues: &[String],
    ) -> AiResult<SectionDraft> {
        let mut user = constitution_brief(constitution);
        user.push_str(&context_brief(context));
        let _ = write!(user, "\n# Draft\n{}\n\n# Issues\n", draft.content);
        for issue in issues {
            let _ = writeln!(user, "- {issue}");
        }

        let raw = self.llm.complete(REWRITE_SYSTEM, &user).await?;
        parse_draft(&raw)
    }
}

fn parse_draft(raw: &str) -> AiResult<SectionDraft> {
    let draft: SectionDraft = parse_json(raw, "section")?;
    if draft.content.trim().is_empty() {
        return Err(AiError::Parse("section response has empty content".into()));
    }
    Ok(draft)
}

fn request_brief(request: &BookRequest) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Book\nTitle: {}", request.title);
    let _ = writeln!(out, "Genre: {}", request.genre);
    let _ = writeln!(out, "Premise: {}", request.premise);
    if let Some(audience) = &request.audience {
        let _ = writeln!(out, "Audience: {audience}");
    }
    out
}

fn constitution_brief(c: &Constitution) -> String {
    let mut out = String::from("\n# Constitution\n");
    let _ = writeln!(out, "Premise: {}", c.premise);
    let _ = writeln!(out, "Tone: {}", c.tone);
    let _ = writeln!(out, "Point of view: {}", c.point_of_view);
    if !c.themes.is_empty() {
        let _ = writeln!(out, "Themes: {}", c.themes.join(", "));
    }
    for rule in &c.rules {
        let _ = writeln!(out, "Rule: {rule}");
    }
    out
}

fn context_brief(ctx: &SectionContext) -> String {
    let mut out = String::new();
    if !ctx.synopsis.is_empty() {
        let _ = write!(out, "\n# Synopsis so far\n{}\n", ctx.synopsis);
    }
    for prev in &ctx.previous {
        let _ = write!(
            out,
            "\n# Previous section (chapter {}, section {}): {}\n{}\n",
            prev.chapter + 1,
            prev.section + 1,
            prev.title,
            prev.body
        );
    }
    let _ = write!(
        out,
        "\n# Current chapter: {}\nGoal: {}\n\n# Section to write: {}\nGoal: {}\n",
        ctx.chapter_title, ctx.chapter_goal, ctx.section_title, ctx.section_goal
    );
    out
}
