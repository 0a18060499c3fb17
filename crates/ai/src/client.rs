//! Collaborator contracts.
//!
//! The engine only ever talks to these traits; the OpenAI adapter and the
//! scripted test doubles are interchangeable behind them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AiResult;

/// Text completion: one system prompt, one user prompt, one answer.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> AiResult<String>;
}

/// Image synthesis from a text prompt. Returns encoded image bytes.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(&self, prompt: &str) -> AiResult<Vec<u8>>;
}

/// Image analysis used to pick the title colour.
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    async fn analyze(&self, image: &[u8]) -> AiResult<ImageAnalysis>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    /// sRGB.
    pub dominant_color: [u8; 3],
}

impl ImageAnalysis {
    /// Relative luminance of the dominant colour in `[0, 1]` (Rec. 709 weights).
    pub fn luminance(&self) -> f32 {
        let [r, g, b] = self.dominant_color;
        (0.2126 * r as f32 + 0.7152 * g as f32 + 0.0722 * b as f32) / 255.0
    }
}
