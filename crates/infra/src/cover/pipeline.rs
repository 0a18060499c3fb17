use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use storyforge_ai::{CoverArtDirector, CoverBrief, ImageAnalyzer, ImageGenerator, image_prompt};

use super::CoverError;
use super::quality::QualityGate;
use super::typography::{Typesetter, compose_cover};

/// Result of one cover generation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverOutcome {
    pub success: bool,
    /// Composed PNG, present only on success.
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
    /// Images generated (and checked) in this run.
    pub attempts: u32,
    /// Last rejection reason when every attempt failed the quality gate.
    pub error: Option<String>,
}

/// concept → image → quality gate → typography.
#[derive(Clone)]
pub struct CoverPipeline {
    director: CoverArtDirector,
    images: Arc<dyn ImageGenerator>,
    gate: Arc<dyn QualityGate>,
    analyzer: Arc<dyn ImageAnalyzer>,
    typesetter: Arc<dyn Typesetter>,
    max_attempts: u32,
}

impl CoverPipeline {
    pub fn new(
        director: CoverArtDirector,
        images: Arc<dyn ImageGenerator>,
        gate: Arc<dyn QualityGate>,
        analyzer: Arc<dyn ImageAnalyzer>,
        typesetter: Arc<dyn Typesetter>,
        max_attempts: u32,
    ) -> Self {
        Self {
            director,
            images,
            gate,
            analyzer,
            typesetter,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run the pipeline once.
    ///
    /// Quality rejections are retried up to `max_attempts` and end in
    /// `success: false`. Any other failure is returned as an error.
    pub async fn generate_cover(
        &self,
        brief: &CoverBrief,
        title: &str,
        author: Option<&str>,
    ) -> Result<CoverOutcome, CoverError> {
        let concept = self
            .director
            .distill(brief, title)
            .await
            .map_err(CoverError::Concept)?;
        let prompt = image_prompt(&concept);
        debug!(theme = %concept.theme, "cover concept distilled");

        let mut last_reason = None;
        for attempt in 1..=self.max_attempts {
            let candidate = self
                .images
                .generate_image(&prompt)
                .await
                .map_err(CoverError::Generation)?;

            let gate = self.gate.clone();
            let (verdict, candidate) = offload(move || {
                let verdict = gate.check(&candidate);
                Ok((verdict, candidate))
            })
            .await?;
            if !verdict.passed {
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "rejected by quality gate".to_string());
                warn!(attempt, max_attempts = self.max_attempts, reason = %reason, "cover image rejected");
                last_reason = Some(reason);
                continue;
            }

            let analysis = self
                .analyzer
                .analyze(&candidate)
                .await
                .map_err(|e| CoverError::Processing(e.to_string()))?;
            let typesetter = self.typesetter.clone();
            let (title, author, genre) = (title.to_string(), author.map(str::to_string), brief.genre.clone());
            let composed = offload(move || {
                compose_cover(
                    &candidate,
                    &title,
                    author.as_deref(),
                    &genre,
                    &analysis,
                    typesetter.as_ref(),
                )
            })
            .await?;
            info!(attempt, bytes = composed.len(), "cover composed");

            return Ok(CoverOutcome {
                success: true,
                image: Some(composed),
                attempts: attempt,
                error: None,
            });
        }

        Ok(CoverOutcome {
            success: false,
            image: None,
            attempts: self.max_attempts,
            error: last_reason,
        })
    }
}

/// Run CPU-bound image work on the blocking pool so the runtime (and any
/// timeout wrapped around the pipeline) keeps being polled.
async fn offload<T, F>(work: F) -> Result<T, CoverError>
where
    F: FnOnce() -> Result<T, CoverError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CoverError::Processing(format!("image task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::{HeuristicQualityGate, LumaAnalyzer};
    use crate::testing::{BoxTypesetter, FakeImageGenerator, FakeLlm, PromptKind, noisy_png, solid_png};
    use storyforge_ai::AiError;

    fn brief() -> CoverBrief {
        CoverBrief {
            genre: "fantasy".into(),
            premise: "Two siblings cross a drowned kingdom".into(),
            tone: Some("hopeful".into()),
            themes: vec!["loyalty".into()],
        }
    }

    fn pipeline(llm: Arc<FakeLlm>, images: Arc<FakeImageGenerator>) -> (CoverPipeline, Arc<BoxTypesetter>) {
        let typesetter = Arc::new(BoxTypesetter::default());
        let pipeline = CoverPipeline::new(
            CoverArtDirector::new(llm),
            images,
            Arc::new(HeuristicQualityGate::default()),
            Arc::new(LumaAnalyzer::default()),
            typesetter.clone(),
            3,
        );
        (pipeline, typesetter)
    }

    #[tokio::test]
    async fn first_good_image_is_composed() {
        let images = FakeImageGenerator::always(noisy_png(512, 768));
        let (pipeline, typesetter) = pipeline(FakeLlm::new(), images.clone());

        let outcome = pipeline
            .generate_cover(&brief(), "The Salt Road", Some("Ada Brook"))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.image.is_some());
        assert_eq!(images.calls(), 1);
        assert_eq!(typesetter.calls().len(), 2);
    }

    #[tokio::test]
    async fn rejected_images_are_retried_then_discarded() {
        let images = FakeImageGenerator::scripted(vec![solid_png(512, 768, 128), noisy_png(512, 768)]);
        let (pipeline, _) = pipeline(FakeLlm::new(), images.clone());

        let outcome = pipeline.generate_cover(&brief(), "The Salt Road", None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(images.calls(), 2);
    }

    #[tokio::test]
    async fn exhausting_attempts_reports_the_last_reason() {
        let images = FakeImageGenerator::always(solid_png(512, 768, 128));
        let (pipeline, typesetter) = pipeline(FakeLlm::new(), images.clone());

        let outcome = pipeline.generate_cover(&brief(), "The Salt Road", None).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.image.is_none());
        assert!(outcome.error.unwrap().contains("uniform"));
        assert_eq!(images.calls(), 3);
        assert!(typesetter.calls().is_empty());
    }

    #[tokio::test]
    async fn concept_failure_propagates_without_generating() {
        let llm = FakeLlm::new();
        llm.fail_on(PromptKind::Concept, AiError::Api("boom".into()));
        let images = FakeImageGenerator::always(noisy_png(512, 768));
        let (pipeline, _) = pipeline(llm, images.clone());

        let err = pipeline.generate_cover(&brief(), "The Salt Road", None).await.unwrap_err();

        assert!(matches!(err, CoverError::Concept(_)));
        assert_eq!(images.calls(), 0);
    }

    #[tokio::test]
    async fn generator_failure_is_not_retried() {
        let images = FakeImageGenerator::failing(AiError::Request("timeout".into()));
        let (pipeline, _) = pipeline(FakeLlm::new(), images.clone());

        let err = pipeline.generate_cover(&brief(), "The Salt Road", None).await.unwrap_err();

        assert!(matches!(err, CoverError::Generation(_)));
        assert_eq!(images.calls(), 1);
    }

    #[tokio::test]
    async fn the_title_stays_out_of_image_prompts() {
        let images = FakeImageGenerator::always(noisy_png(512, 768));
        let (pipeline, _) = pipeline(FakeLlm::new(), images.clone());

        pipeline.generate_cover(&brief(), "The Salt Road", None).await.unwrap();

        for prompt in images.prompts() {
            assert!(!prompt.to_lowercase().contains("the salt road"));
        }
    }

    /// Typesetter that holds its thread, like glyph rasterising on a large canvas.
    struct StallingTypesetter(std::time::Duration);

    impl Typesetter for StallingTypesetter {
        fn draw_text(
            &self,
            _canvas: &mut image::RgbaImage,
            _lines: &[String],
            _family: &str,
            _zone: crate::cover::SafeZone,
            _color: image::Rgba<u8>,
        ) -> Result<(), CoverError> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_timeout_fires_while_composition_is_still_running() {
        let pipeline = CoverPipeline::new(
            CoverArtDirector::new(FakeLlm::new()),
            FakeImageGenerator::always(noisy_png(512, 768)),
            Arc::new(HeuristicQualityGate::default()),
            Arc::new(LumaAnalyzer::default()),
            Arc::new(StallingTypesetter(std::time::Duration::from_millis(600))),
            1,
        );

        let started = std::time::Instant::now();
        let run = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            pipeline.generate_cover(&brief(), "The Salt Road", None),
        )
        .await;

        assert!(run.is_err());
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }
}
