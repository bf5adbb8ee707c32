use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pipeline::{
    config::PipelineConfig,
    inbox::{self, InboxWatcher, ScanResult},
    store::load_snapshots,
    FfmpegInvoker, JobState, Pipeline,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};

/// HLS transcoding pipeline host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the inbox directory and transcode files dropped into it (default)
    Watch,
    /// Transcode one file and print its final status. The file is consumed.
    Submit {
        file: PathBuf,
        /// Name to derive the job id from (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Print the persisted snapshot of a job
    Status { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(cfg).await,
        Command::Submit { file, name } => {
            let failed = submit(cfg, &file, name).await?;
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Status { id } => status(&cfg, &id),
    }
}

/// Build the pipeline after making sure the transcoder can be started
async fn start_pipeline(cfg: PipelineConfig) -> Result<Pipeline> {
    let version = FfmpegInvoker::probe_version(&cfg.ffmpeg_bin)
        .await
        .with_context(|| format!("ffmpeg is not usable at {}", cfg.ffmpeg_bin.display()))?;
    info!("Using ffmpeg {} at {}", version, cfg.ffmpeg_bin.display());

    let invoker = Arc::new(FfmpegInvoker::new(cfg.diagnostics_tail_lines));
    Pipeline::new(cfg, invoker).context("Failed to initialise pipeline")
}

async fn watch(cfg: PipelineConfig) -> Result<()> {
    info!("HLS pipeline starting");
    info!("Configuration loaded:");
    info!("  Inbox: {}", cfg.inbox_dir.display());
    info!("  Uploads: {}", cfg.uploads_dir.display());
    info!("  Videos: {} (served as {})", cfg.videos_dir.display(), cfg.videos_url_prefix);
    info!("  Thumbnails: {} (served as {})", cfg.thumbnails_dir.display(), cfg.thumbnails_url_prefix);
    match &cfg.job_state_dir {
        Some(dir) => info!("  Job state dir: {}", dir.display()),
        None => warn!("  Job state dir: none, jobs are not persisted"),
    }
    info!("  Max concurrent jobs: {}", cfg.max_concurrent_jobs);
    info!("  Job timeout: {}s", cfg.job_timeout_secs);
    info!("  Scan interval: {}s", cfg.scan_interval_secs);

    std::fs::create_dir_all(&cfg.inbox_dir)
        .with_context(|| format!("Failed to create inbox directory: {}", cfg.inbox_dir.display()))?;

    let scan_interval = Duration::from_secs(cfg.scan_interval_secs.max(1));
    let pipeline = start_pipeline(cfg).await?;

    // Recovery on startup: fail jobs a previous run left in flight
    info!("🔄 Starting recovery checks...");
    let recovered = pipeline.recover().context("Failed to recover jobs on startup")?;
    if recovered > 0 {
        info!("✅ Startup recovery complete: {} interrupted job(s) marked failed", recovered);
    } else {
        info!("✅ Startup recovery complete: no interrupted jobs found");
    }

    let mut watcher = InboxWatcher::new(pipeline.config().inbox_dir.clone());
    let mut ticker = tokio::time::interval(scan_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                let running = pipeline
                    .store()
                    .list()
                    .iter()
                    .filter(|job| !job.state.is_terminal())
                    .count();
                if running > 0 {
                    warn!("Shutting down with {} job(s) in flight; they will be failed on next start", running);
                }
                info!("Shutting down");
                return Ok(());
            }
        }

        let results = match watcher.scan() {
            Ok(results) => results,
            Err(e) => {
                error!("Inbox scan failed: {:#}", e);
                continue;
            }
        };

        let mut submitted = 0;
        for result in results {
            match result {
                ScanResult::Candidate(path, size) => {
                    if submit_from_inbox(&pipeline, &path) {
                        submitted += 1;
                        debug!("Submitted {} ({} bytes)", path.display(), size);
                    }
                    watcher.forget(&path);
                }
                ScanResult::Skipped(path, reason) => {
                    debug!("Skipped {}: {}", path.display(), reason);
                }
            }
        }

        if submitted > 0 {
            info!("Scan summary: {} new job(s) submitted", submitted);
        }
    }
}

/// Move one inbox file into the uploads directory and hand it to the pipeline
fn submit_from_inbox(pipeline: &Pipeline, path: &Path) -> bool {
    let (upload, original) = match inbox::claim(path, pipeline.namespace().uploads_dir()) {
        Ok(claimed) => claimed,
        Err(e) => {
            error!("Failed to claim {}: {:#}", path.display(), e);
            return false;
        }
    };

    match pipeline.submit(&upload, &original) {
        Ok(id) => {
            info!("🎯 Job {}: submitted from {}", id, path.display());
            true
        }
        Err(e) => {
            // Rejected before a job existed; nobody else will clean this up
            error!("❌ Rejected {:?}: {}", original, e);
            if let Err(rm) = std::fs::remove_file(&upload) {
                warn!("Failed to remove rejected upload {}: {}", upload.display(), rm);
            }
            false
        }
    }
}

/// Run one file through the pipeline; returns whether the job failed
async fn submit(cfg: PipelineConfig, file: &Path, name: Option<String>) -> Result<bool> {
    if !file.is_file() {
        bail!("Not a file: {}", file.display());
    }

    let pipeline = start_pipeline(cfg).await?;
    let (upload, original) = inbox::claim(file, pipeline.namespace().uploads_dir())
        .with_context(|| format!("Failed to stage {}", file.display()))?;
    let name = name.unwrap_or(original);

    let job = match pipeline.process(&upload, &name).await {
        Ok(job) => job,
        Err(e) => {
            if let Err(rm) = std::fs::remove_file(&upload) {
                warn!("Failed to remove staged upload {}: {}", upload.display(), rm);
            }
            return Err(e).with_context(|| format!("Failed to submit {:?}", name));
        }
    };

    println!("{}", serde_json::to_string_pretty(&job.status())?);
    Ok(job.state == JobState::Failed)
}

fn status(cfg: &PipelineConfig, id: &str) -> Result<()> {
    let Some(dir) = &cfg.job_state_dir else {
        bail!("job_state_dir is not configured; no snapshots to read");
    };

    let jobs = load_snapshots(dir)
        .with_context(|| format!("Failed to load jobs from {}", dir.display()))?;
    let job = jobs
        .into_iter()
        .find(|job| job.id == id)
        .with_context(|| format!("No job with id {:?} in {}", id, dir.display()))?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}
