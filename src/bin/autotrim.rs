//! autotrim - cut repeated takes out of recorded videos
//!
//! Thin driver over the engine: every subcommand prints the JSON response
//! envelope and exits non-zero when it reports an error.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use autotrim_engine::commands::{self, RemovalInput, Response};
use autotrim_engine::ffmpeg::Ffmpeg;
use autotrim_engine::{JobManager, Pipeline, Settings, Stage};

#[derive(Parser)]
#[command(name = "autotrim", version, about = "Remove repeated takes from recorded videos")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a video file as a new job
    Upload { path: PathBuf },
    /// Upload a video and run the whole pipeline
    Process { path: PathBuf },
    /// Run one stage of a job, or resume it to completion when no stage is given
    Run {
        job_id: String,
        /// upload, transcribe, sentence_analysis, word_analysis, merge or trim
        #[arg(long)]
        stage: Option<Stage>,
    },
    /// Show a job's status
    Status { job_id: String },
    /// List all jobs
    List,
    /// Print a job's word-level transcript
    Transcript { job_id: String },
    /// Print a job's merged removal list
    Removals { job_id: String },
    /// Replace a job's removal list with intervals from a JSON file
    Override { job_id: String, file: PathBuf },
    /// Roll back jobs left mid-stage by a crashed process
    Recover,
    /// Check that ffmpeg and ffprobe are installed
    Doctor,
    /// Write a default config file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load_settings(&cli)?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.general.log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let response = match cli.command {
        Command::Process { path } => {
            let pipeline = Pipeline::start(&settings)?;
            let uploaded = commands::upload(pipeline.jobs(), &path);
            match uploaded.job_id.clone().filter(|_| uploaded.is_success()) {
                Some(job_id) => commands::process_all(&pipeline, &job_id).await,
                None => uploaded,
            }
        }
        Command::Run { job_id, stage } => {
            let pipeline = Pipeline::start(&settings)?;
            match stage {
                Some(stage) => commands::run_stage(&pipeline, &job_id, stage).await,
                None => commands::process_all(&pipeline, &job_id).await,
            }
        }
        Command::Doctor => {
            let ffmpeg = Ffmpeg::from_settings(&settings.trim);
            if commands::check_ffmpeg(&ffmpeg) {
                println!("ffmpeg and ffprobe found");
                return Ok(());
            }
            anyhow::bail!("ffmpeg or ffprobe is missing; install ffmpeg and make sure it is on PATH");
        }
        Command::Upload { path } => commands::upload(&open_jobs(&settings)?, &path),
        Command::Status { job_id } => commands::get_status(&open_jobs(&settings)?, &job_id),
        Command::Transcript { job_id } => commands::get_transcript(&open_jobs(&settings)?, &job_id),
        Command::Removals { job_id } => commands::get_removals(&open_jobs(&settings)?, &job_id),
        Command::Override { job_id, file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let intervals: Vec<RemovalInput> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            commands::override_removals(&open_jobs(&settings)?, &job_id, intervals)
        }
        Command::List => {
            for record in open_jobs(&settings)?.list()? {
                println!(
                    "{}  {:<26} {}",
                    record.job_id,
                    record.status.as_str(),
                    record.input_path.display()
                );
            }
            return Ok(());
        }
        Command::Recover => {
            let recovered = open_jobs(&settings)?.recover_interrupted()?;
            println!("Recovered {} interrupted job(s)", recovered.len());
            return Ok(());
        }
        Command::InitConfig => {
            let path = match cli.config {
                Some(path) => path,
                None => Settings::config_path()?,
            };
            Settings::write_default(&path)?;
            println!("Wrote default config to {}", path.display());
            return Ok(());
        }
    };

    print_response(&response)
}

/// A missing or broken config must not stop init-config from writing one.
fn load_settings(cli: &Cli) -> Result<Settings> {
    match (&cli.command, &cli.config) {
        (Command::InitConfig, _) => Ok(Settings::default()),
        (_, Some(path)) => Settings::load_from(path),
        (_, None) => Settings::load(),
    }
}

fn open_jobs(settings: &Settings) -> Result<JobManager> {
    Ok(JobManager::open(&settings.general.data_dir)?)
}

fn print_response(response: &Response) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
