use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use log::{debug, info};
use crate::config::{NameFallback, PipelineConfig};
use crate::error::{PipelineError, Result};

/// Longest stem kept from an uploaded filename
const MAX_STEM_LEN: usize = 64;

/// Upper bound on `-N` suffixes tried before giving up on a stem
const MAX_SUFFIX: u32 = 10_000;

/// Thumbnail image extension
pub const THUMBNAIL_EXT: &str = "jpg";

/// Job identifier and the output directory reserved for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub job_id: String,
    pub output_dir: PathBuf,
}

/// Owns the on-disk output tree: one directory per job under `videos_dir`
/// and one thumbnail per job under `thumbnails_dir`.
#[derive(Debug, Clone)]
pub struct Namespace {
    videos_dir: PathBuf,
    thumbnails_dir: PathBuf,
    uploads_dir: PathBuf,
    fallback: NameFallback,
}

impl Namespace {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            videos_dir: cfg.videos_dir.clone(),
            thumbnails_dir: cfg.thumbnails_dir.clone(),
            uploads_dir: cfg.uploads_dir.clone(),
            fallback: cfg.name_fallback,
        }
    }

    /// Create the output roots; run once when the process starts
    pub fn init(&self) -> Result<()> {
        for dir in [&self.videos_dir, &self.thumbnails_dir, &self.uploads_dir] {
            if !dir.is_dir() {
                fs::create_dir_all(dir).map_err(|e| {
                    PipelineError::ResourceUnavailable(format!("cannot create {}: {}", dir.display(), e))
                })?;
                info!("Created folder: {}", dir.display());
            }
        }
        Ok(())
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn thumbnail_path(&self, job_id: &str) -> PathBuf {
        self.thumbnails_dir.join(format!("{}.{}", job_id, THUMBNAIL_EXT))
    }

    /// Derive a job id from `original_filename` and reserve its output directory.
    ///
    /// `is_reserved` lets the caller veto ids still held by known jobs whose
    /// directories are already gone. Collisions are resolved with `-2`, `-3`, ...
    pub fn allocate(&self, original_filename: &str, is_reserved: impl Fn(&str) -> bool) -> Result<Allocation> {
        let stem = match sanitize_stem(original_filename) {
            Some(stem) => stem,
            None => match self.fallback {
                NameFallback::Generate => generated_stem(),
                NameFallback::Reject => {
                    return Err(PipelineError::InvalidName(original_filename.to_string()));
                }
            },
        };

        for n in 1..=MAX_SUFFIX {
            let candidate = if n == 1 { stem.clone() } else { format!("{}-{}", stem, n) };
            if is_reserved(&candidate) {
                continue;
            }

            let output_dir = self.videos_dir.join(&candidate);
            // Non-recursive create is the atomic reservation
            match fs::create_dir(&output_dir) {
                Ok(()) => {
                    debug!("Allocated {} for upload {:?}", output_dir.display(), original_filename);
                    return Ok(Allocation { job_id: candidate, output_dir });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(PipelineError::ResourceUnavailable(format!(
                        "cannot create {}: {}",
                        output_dir.display(),
                        e
                    )));
                }
            }
        }

        Err(PipelineError::ResourceUnavailable(format!(
            "no free output directory for stem {:?}",
            stem
        )))
    }
}

/// Reduce an uploaded filename to a filesystem-safe stem.
///
/// Keeps only the last path component, drops the extension, turns whitespace
/// runs into `_` and removes everything outside `[A-Za-z0-9_-]`.
pub fn sanitize_stem(original_filename: &str) -> Option<String> {
    let base = original_filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("");

    // "clip.tar.mov" -> "clip.tar", ".mov" stays a (hidden) stem
    let stem = match base.rfind('.') {
        Some(0) | None => base,
        Some(pos) => &base[..pos],
    };

    let mut out = String::with_capacity(stem.len());
    let mut in_space = false;
    for c in stem.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        }
    }

    let trimmed: String = out
        .trim_matches(|c| c == '_' || c == '-')
        .chars()
        .take(MAX_STEM_LEN)
        .collect();
    let trimmed = trimmed.trim_end_matches(|c| c == '_' || c == '-');

    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn generated_stem() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("upload-{}", &id[..8])
}
