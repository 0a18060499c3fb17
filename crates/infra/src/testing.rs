//! Scripted collaborators and a wired engine for tests and local runs.
//!
//! Nothing in here touches the network.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use tokio::sync::Notify;

use storyforge_ai::{
    AiError, AiResult, CONCEPT_SYSTEM, CONSISTENCY_SYSTEM, CONSTITUTION_SYSTEM, ConsistencyVerdict,
    CoverArtDirector, ImageGenerator, LlmClient, OUTLINE_SYSTEM, REWRITE_SYSTEM, SECTION_SYSTEM,
};
use storyforge_core::{ExpectedVersion, JobId};
use storyforge_generation::{BookRequest, GenerationJob, Step};

use crate::assets::InMemoryAssetStore;
use crate::config::EngineConfig;
use crate::cover::{CoverError, CoverPipeline, HeuristicQualityGate, LumaAnalyzer, SafeZone, Typesetter};
use crate::jobs::{FinalizationGate, InMemoryJobStore, JobStore, StepExecutor, Watchdog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Constitution,
    Outline,
    Section,
    Consistency,
    Rewrite,
    Concept,
    Other,
}

impl PromptKind {
    pub fn of(system: &str) -> Self {
        match system {
            CONSTITUTION_SYSTEM => PromptKind::Constitution,
            OUTLINE_SYSTEM => PromptKind::Outline,
            SECTION_SYSTEM => PromptKind::Section,
            CONSISTENCY_SYSTEM => PromptKind::Consistency,
            REWRITE_SYSTEM => PromptKind::Rewrite,
            CONCEPT_SYSTEM => PromptKind::Concept,
            _ => PromptKind::Other,
        }
    }
}

#[derive(Default)]
struct LlmState {
    shape: (usize, usize),
    verdicts: VecDeque<ConsistencyVerdict>,
    failures: HashMap<PromptKind, AiError>,
    pauses: HashMap<PromptKind, (Arc<Notify>, Arc<Notify>)>,
    calls: Vec<(PromptKind, String)>,
    sections_written: usize,
}

/// Answers every prompt with well-formed JSON.
///
/// Outlines follow the configured shape, consistency checks pass unless a
/// verdict was queued, and any prompt kind can be made to fail or pause.
pub struct FakeLlm {
    state: Mutex<LlmState>,
}

impl FakeLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LlmState {
                shape: (2, 1),
                ..LlmState::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LlmState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_shape(&self, chapters: usize, sections: usize) {
        self.state().shape = (chapters, sections);
    }

    pub fn push_verdict(&self, verdict: ConsistencyVerdict) {
        self.state().verdicts.push_back(verdict);
    }

    /// Every later call of `kind` fails with `error`.
    pub fn fail_on(&self, kind: PromptKind, error: AiError) {
        self.state().failures.insert(kind, error);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// The next call of `kind` notifies the first returned handle, then waits
    /// on the second before answering.
    pub fn pause_on(&self, kind: PromptKind) -> (Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.state().pauses.insert(kind, (reached.clone(), release.clone()));
        (reached, release)
    }

    pub fn calls(&self) -> Vec<(PromptKind, String)> {
        self.state().calls.clone()
    }

    pub fn count(&self, kind: PromptKind) -> usize {
        self.state().calls.iter().filter(|(k, _)| *k == kind).count()
    }

    fn answer(&self, kind: PromptKind) -> String {
        let mut state = self.state();
        match kind {
            PromptKind::Constitution => serde_json::json!({
                "premise": "A keeper guards the last lighthouse on a drowned coast",
                "tone": "wistful",
                "point_of_view": "close third",
                "themes": ["solitude", "inheritance"],
                "rules": ["the sea never gives anything back for free"],
            })
            .to_string(),
            PromptKind::Outline => {
                let (chapters, sections) = state.shape;
                let chapters: Vec<_> = (0..chapters)
                    .map(|c| {
                        serde_json::json!({
                            "title": format!("Chapter {}", c + 1),
                            "goal": format!("move the story through act {}", c + 1),
                            "sections": (0..sections)
                                .map(|s| serde_json::json!({
                                    "title": format!("Scene {}.{}", c + 1, s + 1),
                                    "goal": format!("beat {}", s + 1),
                                }))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                serde_json::json!({ "chapters": chapters }).to_string()
            }
            PromptKind::Section => {
                state.sections_written += 1;
                let n = state.sections_written;
                serde_json::json!({
                    "content": format!("Prose for section {n}."),
                    "synopsis": format!("Synopsis after {n} sections."),
                })
                .to_string()
            }
            PromptKind::Consistency => {
                let verdict = state.verdicts.pop_front().unwrap_or(ConsistencyVerdict {
                    consistent: true,
                    issues: Vec::new(),
                });
                serde_json::to_string(&verdict).unwrap_or_default()
            }
            PromptKind::Rewrite => {
                let n = state.sections_written;
                serde_json::json!({
                    "content": format!("Revised prose for section {n}."),
                    "synopsis": format!("Revised synopsis after {n} sections."),
                })
                .to_string()
            }
            PromptKind::Concept => serde_json::json!({
                "theme": "inheritance",
                "visual_metaphor": "a lantern burning above black water",
                "emotional_target": "quiet wonder",
                "avoid": ["faces"],
            })
            .to_string(),
            PromptKind::Other => "{}".to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn complete(&self, system: &str, user: &str) -> AiResult<String> {
        let kind = PromptKind::of(system);
        let (failure, pause) = {
            let mut state = self.state();
            state.calls.push((kind, user.to_string()));
            (state.failures.get(&kind).cloned(), state.pauses.remove(&kind))
        };
        if let Some((reached, release)) = pause {
            reached.notify_one();
            release.notified().await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(self.answer(kind)),
        }
    }
}

/// Hands out scripted images; the last entry repeats once the script runs out.
pub struct FakeImageGenerator {
    script: Mutex<VecDeque<AiResult<Vec<u8>>>>,
    last: Mutex<Option<AiResult<Vec<u8>>>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl FakeImageGenerator {
    pub fn scripted(images: Vec<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self::from_results(images.into_iter().map(Ok).collect(), None))
    }

    pub fn always(image: Vec<u8>) -> Arc<Self> {
        Self::scripted(vec![image])
    }

    pub fn failing(error: AiError) -> Arc<Self> {
        Arc::new(Self::from_results(vec![Err(error)], None))
    }

    fn from_results(results: Vec<AiResult<Vec<u8>>>, delay: Option<Duration>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            delay,
        }
    }

    /// Same script, but every call sleeps first.
    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        let script = self
            .script
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        Arc::new(Self::from_results(script, Some(delay)))
    }

    pub fn calls(&self) -> usize {
        self.prompts().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ImageGenerator for FakeImageGenerator {
    async fn generate_image(&self, prompt: &str) -> AiResult<Vec<u8>> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let mut last = self.last.lock().map_err(|_| AiError::Request("script lock poisoned".into()))?;
        if let Some(result) = next {
            *last = Some(result);
        }
        last.clone()
            .unwrap_or_else(|| Err(AiError::Request("no scripted image".into())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypesetCall {
    pub lines: Vec<String>,
    pub family: String,
    pub zone: SafeZone,
    pub color: Rgba<u8>,
}

/// Paints each text zone as a solid block and records the call.
#[derive(Debug, Default)]
pub struct BoxTypesetter {
    calls: Mutex<Vec<TypesetCall>>,
}

impl BoxTypesetter {
    pub fn calls(&self) -> Vec<TypesetCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Typesetter for BoxTypesetter {
    fn draw_text(
        &self,
        canvas: &mut RgbaImage,
        lines: &[String],
        family: &str,
        zone: SafeZone,
        color: Rgba<u8>,
    ) -> Result<(), CoverError> {
        for y in zone.y..(zone.y + zone.height).min(canvas.height()) {
            for x in zone.x..(zone.x + zone.width).min(canvas.width()) {
                canvas.put_pixel(x, y, color);
            }
        }
        self.calls
            .lock()
            .map_err(|_| CoverError::Font("typesetter lock poisoned".into()))?
            .push(TypesetCall {
                lines: lines.to_vec(),
                family: family.to_string(),
                zone,
                color,
            });
        Ok(())
    }
}

pub fn encode_png(image: &RgbImage) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = DynamicImage::ImageRgb8(image.clone()).write_to(&mut Cursor::new(&mut out), ImageFormat::Png);
    out
}

/// Deterministic mid-grey noise: passes every default quality check.
pub fn noisy_png(width: u32, height: u32) -> Vec<u8> {
    let mut seed = 0x2545_f491_u32;
    let image = RgbImage::from_fn(width, height, |_, _| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let v = 40 + (seed % 176) as u8;
        Rgb([v, v.wrapping_add(7), v.saturating_sub(9)])
    });
    encode_png(&image)
}

pub fn solid_png(width: u32, height: u32, level: u8) -> Vec<u8> {
    encode_png(&RgbImage::from_pixel(width, height, Rgb([level, level, level])))
}

/// In-memory engine wired to the fakes above.
pub struct Harness {
    pub config: EngineConfig,
    pub store: Arc<InMemoryJobStore>,
    pub assets: Arc<InMemoryAssetStore>,
    pub llm: Arc<FakeLlm>,
    pub images: Arc<FakeImageGenerator>,
    pub typesetter: Arc<BoxTypesetter>,
    pub executor: Arc<StepExecutor>,
    pub watchdog: Arc<Watchdog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_images(FakeImageGenerator::always(noisy_png(512, 768)))
    }

    pub fn with_images(images: Arc<FakeImageGenerator>) -> Self {
        Self::with(EngineConfig::default(), images)
    }

    pub fn with(config: EngineConfig, images: Arc<FakeImageGenerator>) -> Self {
        let store = InMemoryJobStore::arc();
        let assets = Arc::new(InMemoryAssetStore::new());
        let llm = FakeLlm::new();
        let typesetter = Arc::new(BoxTypesetter::default());

        let pipeline = CoverPipeline::new(
            CoverArtDirector::new(llm.clone()),
            images.clone(),
            Arc::new(HeuristicQualityGate::default()),
            Arc::new(LumaAnalyzer::default()),
            typesetter.clone(),
            config.cover_max_attempts,
        );
        let gate = FinalizationGate::new(store.clone(), pipeline, assets.clone(), &config);
        let executor = Arc::new(StepExecutor::new(store.clone(), llm.clone(), gate, &config));
        let watchdog = Arc::new(Watchdog::new(store.clone(), executor.clone(), &config));

        Self {
            config,
            store,
            assets,
            llm,
            images,
            typesetter,
            executor,
            watchdog,
        }
    }

    pub fn request(chapters: u32, sections: u32) -> BookRequest {
        BookRequest::new(
            "The Salt Road",
            "A lighthouse keeper finds a map to a drowned city",
            "fantasy",
        )
        .with_author("Ada Brook")
        .with_shape(chapters, sections)
    }

    /// An unsaved job in `queued/created`.
    pub fn new_job(&self, chapters: u32, sections: u32) -> GenerationJob {
        GenerationJob::new(JobId::new(), Self::request(chapters, sections), Utc::now())
    }

    pub async fn create(&self, chapters: u32, sections: u32) -> GenerationJob {
        self.llm.set_shape(chapters as usize, sections as usize);
        self.executor
            .create_job(Self::request(chapters, sections))
            .await
            .expect("create job")
    }

    /// A job ticked up to (not through) its `finalize` step.
    pub async fn at_finalize(&self, chapters: u32, sections: u32) -> GenerationJob {
        let job = self.create(chapters, sections).await;
        for _ in 0..(3 + chapters * sections) {
            self.executor.tick(job.id).await.expect("tick");
        }
        let job = self.job(job.id).await;
        assert_eq!(job.step, Step::Finalize);
        job
    }

    pub async fn job(&self, id: JobId) -> GenerationJob {
        self.store.get(id).await.expect("get job").expect("job exists")
    }

    /// Pretend the job has been silent for `by`.
    pub async fn age(&self, id: JobId, by: chrono::Duration) {
        let mut job = self.job(id).await;
        job.updated_at = Utc::now() - by;
        self.store
            .update(&job, ExpectedVersion::Any)
            .await
            .expect("age job");
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
