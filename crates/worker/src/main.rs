//! StoryForge worker: runs the sweeps in the background, or drives a single
//! job by hand.
//!
//! Output of the one-shot commands is JSON on stdout; logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;

use storyforge_ai::{CoverArtDirector, OpenAiClient};
use storyforge_core::JobId;
use storyforge_generation::BookRequest;
use storyforge_infra::cover::{CoverPipeline, GlyphTypesetter, HeuristicQualityGate, LumaAnalyzer};
use storyforge_infra::jobs::{FinalizationGate, JobStore, PostgresJobStore, StepExecutor, Watchdog};
use storyforge_infra::{AssetStore, EngineConfig, FsAssetStore, SweepRunner};

#[derive(Parser)]
#[command(name = "storyforge-worker")]
#[command(about = "Book generation worker")]
struct Cli {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "STORYFORGE_DB_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    #[arg(long, env = "STORYFORGE_TEXT_MODEL")]
    text_model: Option<String>,

    #[arg(long, env = "STORYFORGE_IMAGE_MODEL")]
    image_model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run watchdog and cleanup sweeps until interrupted
    Run,

    /// Queue a new book
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        premise: String,
        #[arg(long)]
        genre: String,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        audience: Option<String>,
        #[arg(long, default_value_t = 8)]
        chapters: u32,
        #[arg(long, default_value_t = 3)]
        sections: u32,
    },

    /// Advance a job by one step
    Tick {
        job_id: JobId,
        /// Keep ticking until the job is terminal or stops making progress
        #[arg(long)]
        until_done: bool,
        #[arg(long, default_value_t = 500)]
        max_ticks: usize,
    },

    /// Show a job's progress
    Status { job_id: JobId },

    /// Run one watchdog sweep
    Watchdog,

    /// Run one cleanup sweep
    Cleanup,
}

struct Engine {
    executor: Arc<StepExecutor>,
    watchdog: Arc<Watchdog>,
    config: EngineConfig,
}

async fn build_engine(cli: &Cli) -> Result<Engine> {
    let config = EngineConfig::from_env().context("invalid engine configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect(&cli.database_url)
        .await
        .context("failed to connect to postgres")?;
    let postgres = PostgresJobStore::new(pool);
    postgres.ensure_schema().await.context("failed to prepare jobs table")?;
    let store: Arc<dyn JobStore> = Arc::new(postgres);

    let mut openai = OpenAiClient::from_env()?;
    if let Some(model) = &cli.text_model {
        openai = openai.with_text_model(model);
    }
    if let Some(model) = &cli.image_model {
        openai = openai.with_image_model(model);
    }
    let openai = Arc::new(openai);

    let pipeline = CoverPipeline::new(
        CoverArtDirector::new(openai.clone()),
        openai.clone(),
        Arc::new(HeuristicQualityGate::default()),
        Arc::new(LumaAnalyzer::default()),
        Arc::new(GlyphTypesetter::new(config.font_dir.clone())),
        config.cover_max_attempts,
    );
    let assets: Arc<dyn AssetStore> = Arc::new(FsAssetStore::new(config.asset_dir.clone()));
    let gate = FinalizationGate::new(store.clone(), pipeline, assets, &config);
    let executor = Arc::new(StepExecutor::new(store.clone(), openai, gate, &config));
    let watchdog = Arc::new(Watchdog::new(store, executor.clone(), &config));

    Ok(Engine {
        executor,
        watchdog,
        config,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    storyforge_observability::init();

    let cli = Cli::parse();
    let engine = build_engine(&cli).await?;

    match cli.command {
        Commands::Run => {
            let handle = SweepRunner::new(&engine.config).spawn("sweeps", engine.watchdog.clone());
            tracing::info!(
                interval_secs = engine.config.sweep_interval.as_secs(),
                "worker running; ctrl-c to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
            handle.shutdown().await;
        }
        Commands::Create {
            title,
            premise,
            genre,
            author,
            audience,
            chapters,
            sections,
        } => {
            let mut request = BookRequest::new(title, premise, genre).with_shape(chapters, sections);
            if let Some(author) = author {
                request = request.with_author(author);
            }
            if let Some(audience) = audience {
                request = request.with_audience(audience);
            }
            let job = engine.executor.create_job(request).await?;
            print_json(&engine.executor.job_view(job.id).await?)?;
        }
        Commands::Tick {
            job_id,
            until_done,
            max_ticks,
        } => {
            let report = if until_done {
                engine.executor.drive(job_id, max_ticks).await?
            } else {
                engine.executor.tick(job_id).await?
            };
            print_json(&report)?;
        }
        Commands::Status { job_id } => {
            print_json(&engine.executor.job_view(job_id).await?)?;
        }
        Commands::Watchdog => {
            print_json(&engine.watchdog.run_watchdog_sweep().await?)?;
        }
        Commands::Cleanup => {
            print_json(&engine.watchdog.run_cleanup_sweep().await?)?;
        }
    }

    Ok(())
}
