use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use crate::command::CommandSpec;

/// How long to wait for the stderr reader after the child is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a transcoder run that exited with status 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResult {
    pub code: i32,
    /// Last lines the tool wrote to stderr
    pub diagnostics_tail: String,
}

/// Why a transcoder run did not succeed
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The executable could not be started at all
    #[error("{program} could not be started: {message}")]
    ToolUnavailable { program: String, message: String },

    /// The tool ran and exited non-zero (or was killed by a signal)
    #[error("process exited with {}: {diagnostics_tail}", describe_exit(.code))]
    ProcessingFailed {
        code: Option<i32>,
        diagnostics_tail: String,
    },

    /// The deadline passed; the child was killed
    #[error("process timed out after {after:?}")]
    TimedOut {
        after: Duration,
        diagnostics_tail: String,
    },

    /// Waiting on the child failed
    #[error("I/O error waiting for process: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs an external transcoding command to completion.
///
/// Implementations must never report success for a non-zero exit and must
/// not leave the child running once `timeout` has elapsed.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<ExitResult, InvokeError>;
}

/// Invoker backed by real child processes
#[derive(Debug, Clone)]
pub struct FfmpegInvoker {
    tail_lines: usize,
}

impl FfmpegInvoker {
    pub fn new(tail_lines: usize) -> Self {
        Self { tail_lines: tail_lines.max(1) }
    }

    /// Run `<ffmpeg> -version` and parse the reported version.
    ///
    /// Lets the process host fail fast when the transcoder is missing instead
    /// of failing every job with `ToolUnavailable`.
    pub async fn probe_version(ffmpeg_bin: &Path) -> Result<ToolVersion, InvokeError> {
        let output = Command::new(ffmpeg_bin)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| InvokeError::ToolUnavailable {
                program: ffmpeg_bin.display().to_string(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(InvokeError::ProcessingFailed {
                code: output.status.code(),
                diagnostics_tail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let first_line = stdout.lines().next().unwrap_or("");
        ToolVersion::parse(first_line).ok_or_else(|| InvokeError::ToolUnavailable {
            program: ffmpeg_bin.display().to_string(),
            message: format!("unrecognised version output: {:?}", first_line),
        })
    }
}

impl Default for FfmpegInvoker {
    fn default() -> Self {
        Self::new(20)
    }
}

#[async_trait]
impl Invoker for FfmpegInvoker {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<ExitResult, InvokeError> {
        debug!("Executing [{}]: {}", spec.label, spec);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| InvokeError::ToolUnavailable {
            program: program_name(&spec.program),
            message: e.to_string(),
        })?;

        // Stream diagnostics to the log while keeping the tail for failure reports
        let label = spec.label;
        let tail_lines = self.tail_lines;
        let reader = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail: VecDeque<String> = VecDeque::with_capacity(tail_lines);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", label, line);
                    if tail.len() >= tail_lines {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("[{}] exceeded {:?}, killing {}", label, timeout, program_name(&spec.program));
                if let Err(e) = child.kill().await {
                    warn!("[{}] failed to kill child: {}", label, e);
                }
                return Err(InvokeError::TimedOut {
                    after: timeout,
                    diagnostics_tail: collect_tail(reader).await,
                });
            }
        };

        let diagnostics_tail = collect_tail(reader).await;
        debug!("[{}] exited with {}", label, status);

        match status.code() {
            Some(0) => Ok(ExitResult { code: 0, diagnostics_tail }),
            code => Err(InvokeError::ProcessingFailed { code, diagnostics_tail }),
        }
    }
}

async fn collect_tail(reader: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(tail)) => tail,
        _ => String::new(),
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "a signal".to_string(),
    }
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string_lossy().to_string())
}

/// Transcoder version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ToolVersion {
    /// Parse version from a `-version` banner line
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> ToolVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Option<Self> {
        // First whitespace-separated token starting with a digit
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))?;

        let mut numbers = version_part
            .split(|c: char| c == '.' || c == '-' || c == '+')
            .map(|p| p.parse::<u32>().ok());

        let major = numbers.next().flatten()?;
        let minor = numbers.next().flatten().unwrap_or(0);
        let patch = numbers.next().flatten().unwrap_or(0);

        Some(ToolVersion { major, minor, patch })
    }
}

impl std::fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
