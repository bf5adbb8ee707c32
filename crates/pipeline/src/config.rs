use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// What to do when an uploaded filename sanitizes down to nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameFallback {
    /// Substitute a generated identifier (`upload-<hex>`)
    Generate,
    /// Refuse the upload with `InvalidName`
    Reject,
}

/// Configuration for the HLS transcode pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory holding one output directory per job
    pub videos_dir: PathBuf,
    /// Directory holding one thumbnail image per job
    pub thumbnails_dir: PathBuf,
    /// Directory where received uploads are staged before submission
    pub uploads_dir: PathBuf,
    /// Drop directory watched by `hlsd watch`
    pub inbox_dir: PathBuf,
    /// Directory where job snapshots are persisted (None = in-memory only)
    pub job_state_dir: Option<PathBuf>,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// URL prefix the static layer serves `videos_dir` under
    pub videos_url_prefix: String,
    /// URL prefix the static layer serves `thumbnails_dir` under
    pub thumbnails_url_prefix: String,
    /// Encoder arguments inserted between input and HLS muxer options
    pub encode_args: Vec<String>,
    /// Target HLS segment duration in seconds
    pub hls_segment_secs: u32,
    /// Seek position for the thumbnail frame (ffmpeg time syntax)
    pub thumbnail_offset: String,
    /// Thumbnail width in pixels (height keeps aspect ratio)
    pub thumbnail_width: u32,
    /// Maximum processing time for one job, in seconds
    pub job_timeout_secs: u64,
    /// Maximum number of jobs transcoding at the same time
    pub max_concurrent_jobs: usize,
    /// Largest accepted source file in bytes
    pub max_upload_bytes: u64,
    /// Policy for filenames that sanitize to an empty stem
    pub name_fallback: NameFallback,
    /// Keep the output directory of a failed encode for diagnostics
    pub keep_failed_output: bool,
    /// Number of transcoder stderr lines kept for failure reports
    pub diagnostics_tail_lines: usize,
    /// Interval in seconds between inbox scans
    pub scan_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            videos_dir: PathBuf::from("videos"),
            thumbnails_dir: PathBuf::from("thumbnails"),
            uploads_dir: PathBuf::from("uploads"),
            inbox_dir: PathBuf::from("inbox"),
            job_state_dir: Some(PathBuf::from("jobs")),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            videos_url_prefix: "/videos".to_string(),
            thumbnails_url_prefix: "/thumbnails".to_string(),
            encode_args: vec![
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                "veryfast".to_string(),
                "-c:a".to_string(),
                "aac".to_string(),
            ],
            hls_segment_secs: 4,
            thumbnail_offset: "00:00:01".to_string(),
            thumbnail_width: 320,
            job_timeout_secs: 30 * 60,
            max_concurrent_jobs: 2,
            max_upload_bytes: 500 * 1024 * 1024, // 500MB
            name_fallback: NameFallback::Generate,
            keep_failed_output: false,
            diagnostics_tail_lines: 20,
            scan_interval_secs: 5,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.job_timeout_secs == 0 {
            bail!("job_timeout_secs must be greater than zero");
        }
        if self.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be greater than zero");
        }
        if self.hls_segment_secs == 0 {
            bail!("hls_segment_secs must be greater than zero");
        }
        if self.max_upload_bytes == 0 {
            bail!("max_upload_bytes must be greater than zero");
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}
