//! Content units (chapters/sections) and the planning artifacts they come from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storyforge_core::{DomainError, DomainResult};

/// Lifecycle of a content unit.
///
/// Sections go `draft → canonical`, chapters go `draft → locked`. Both
/// transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Draft,
    Locked,
    Canonical,
}

/// Guiding fields every later step is written against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constitution {
    pub premise: String,
    pub tone: String,
    pub point_of_view: String,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub rules: Vec<String>,
}

impl Constitution {
    pub fn validate(&self) -> DomainResult<()> {
        if self.premise.trim().is_empty() {
            return Err(DomainError::validation("constitution premise cannot be empty"));
        }
        if self.tone.trim().is_empty() {
            return Err(DomainError::validation("constitution tone cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineSection {
    pub title: String,
    pub goal: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineChapter {
    pub title: String,
    #[serde(default)]
    pub goal: String,
    pub sections: Vec<OutlineSection>,
}

/// Ordered plan produced by the planner: N chapters of M sections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    pub chapters: Vec<OutlineChapter>,
}

impl Outline {
    pub fn validate(&self) -> DomainResult<()> {
        if self.chapters.is_empty() {
            return Err(DomainError::validation("outline has no chapters"));
        }
        for (idx, chapter) in self.chapters.iter().enumerate() {
            if chapter.sections.is_empty() {
                return Err(DomainError::validation(format!(
                    "outline chapter {idx} has no sections"
                )));
            }
        }
        Ok(())
    }

    pub fn total_sections(&self) -> usize {
        self.chapters.iter().map(|c| c.sections.len()).sum()
    }

    /// Materialize draft content units; indices follow outline position.
    pub fn materialize(&self, created_at: DateTime<Utc>) -> Vec<Chapter> {
        self.chapters
            .iter()
            .enumerate()
            .map(|(ci, chapter)| Chapter {
                index: ci as u32,
                title: chapter.title.clone(),
                goal: chapter.goal.clone(),
                status: UnitStatus::Draft,
                sections: chapter
                    .sections
                    .iter()
                    .enumerate()
                    .map(|(si, section)| Section {
                        index: si as u32,
                        title: section.title.clone(),
                        goal: section.goal.clone(),
                        body: None,
                        status: UnitStatus::Draft,
                        created_at,
                        canonical_at: None,
                    })
                    .collect(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub index: u32,
    pub title: String,
    pub goal: String,
    pub status: UnitStatus,
    pub sections: Vec<Section>,
}

impl Chapter {
    pub fn is_locked(&self) -> bool {
        self.status == UnitStatus::Locked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub index: u32,
    pub title: String,
    pub goal: String,
    pub body: Option<String>,
    pub status: UnitStatus,
    pub created_at: DateTime<Utc>,
    pub canonical_at: Option<DateTime<Utc>>,
}

impl Section {
    pub fn is_canonical(&self) -> bool {
        self.status == UnitStatus::Canonical
    }
}

/// A finished section handed to the writer as local context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalExcerpt {
    pub chapter: u32,
    pub section: u32,
    pub title: String,
    pub body: String,
}

/// Everything the writer needs for one section besides the constitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionContext {
    pub chapter_title: String,
    pub chapter_goal: String,
    pub section_title: String,
    pub section_goal: String,
    /// Most recent canonical sections, oldest first.
    pub previous: Vec<CanonicalExcerpt>,
    pub synopsis: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outline(shape: &[usize]) -> Outline {
        Outline {
            chapters: shape
                .iter()
                .enumerate()
                .map(|(ci, n)| OutlineChapter {
                    title: format!("Chapter {ci}"),
                    goal: String::new(),
                    sections: (0..*n)
                        .map(|si| OutlineSection {
                            title: format!("Section {si}"),
                            goal: format!("goal {ci}.{si}"),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn empty_outline_is_rejected() {
        assert!(outline(&[]).validate().is_err());
        assert!(outline(&[2, 0]).validate().is_err());
        assert!(outline(&[2, 1]).validate().is_ok());
    }

    #[test]
    fn materialize_assigns_positional_indices_in_draft() {
        let now = Utc::now();
        let chapters = outline(&[2, 3]).materialize(now);

        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].index, 1);
        assert_eq!(chapters[1].sections[2].index, 2);
        assert_eq!(chapters[1].sections[2].goal, "goal 1.2");
        assert!(chapters.iter().all(|c| c.status == UnitStatus::Draft));
        assert!(
            chapters
                .iter()
                .flat_map(|c| &c.sections)
                .all(|s| s.status == UnitStatus::Draft && s.body.is_none())
        );
    }

    #[test]
    fn constitution_requires_premise_and_tone() {
        let mut c = Constitution {
            premise: "A lighthouse keeper finds a map".into(),
            tone: "wistful".into(),
            point_of_view: "third person".into(),
            themes: vec![],
            rules: vec![],
        };
        assert!(c.validate().is_ok());
        c.tone = "  ".into();
        assert!(c.validate().is_err());
    }
}
