use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Media file extensions accepted from the inbox
pub const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "webm"];

/// Result of looking at one inbox file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// File is complete and can be submitted (path, size in bytes)
    Candidate(PathBuf, u64),
    /// File is not ready or not wanted (path, reason)
    Skipped(PathBuf, String),
}

/// Polls a drop directory for finished uploads.
///
/// A file becomes a candidate once its size is unchanged between two
/// consecutive scans, so files still being copied are left alone.
#[derive(Debug)]
pub struct InboxWatcher {
    inbox_dir: PathBuf,
    last_sizes: HashMap<PathBuf, u64>,
}

impl InboxWatcher {
    pub fn new(inbox_dir: PathBuf) -> Self {
        Self {
            inbox_dir,
            last_sizes: HashMap::new(),
        }
    }

    pub fn inbox_dir(&self) -> &Path {
        &self.inbox_dir
    }

    /// Walk the inbox once and classify every media file in it
    pub fn scan(&mut self) -> Result<Vec<ScanResult>> {
        let mut results = Vec::new();
        let mut seen = HashMap::new();

        if !self.inbox_dir.exists() {
            warn!("Inbox does not exist: {}", self.inbox_dir.display());
            return Ok(results);
        }

        for entry in WalkDir::new(&self.inbox_dir).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading inbox entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file() || !is_media_file(path) {
                continue;
            }

            // Dotfiles are in-progress copies by convention
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            };
            seen.insert(path.to_path_buf(), size);

            match self.last_sizes.get(path) {
                Some(&previous) if previous == size => {
                    info!("Found candidate: {} ({} bytes)", path.display(), size);
                    results.push(ScanResult::Candidate(path.to_path_buf(), size));
                }
                Some(_) => {
                    results.push(ScanResult::Skipped(path.to_path_buf(), "file still copying".to_string()));
                }
                None => {
                    debug!("New inbox file: {} ({} bytes)", path.display(), size);
                    results.push(ScanResult::Skipped(path.to_path_buf(), "waiting for stable size".to_string()));
                }
            }
        }

        // Forget files that vanished or were claimed
        self.last_sizes = seen;
        Ok(results)
    }

    /// Stop tracking a path after it has been moved out of the inbox
    pub fn forget(&mut self, path: &Path) {
        self.last_sizes.remove(path);
    }
}

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| MEDIA_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Move an inbox file into `uploads_dir` under an opaque `<uuid>.<ext>` name.
///
/// Returns the new path and the original file name to submit under.
pub fn claim(path: &Path, uploads_dir: &Path) -> Result<(PathBuf, String)> {
    let original = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("Inbox path has no file name: {}", path.display()))?;

    let mut target = uploads_dir.join(Uuid::new_v4().to_string());
    if let Some(ext) = path.extension() {
        target.set_extension(ext);
    }

    match fs::rename(path, &target) {
        Ok(()) => {}
        Err(e) if crosses_devices(&e) => {
            fs::copy(path, &target)
                .with_context(|| format!("Failed to copy {} to {}", path.display(), target.display()))?;
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove {} after copy", path.display()))?;
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to move {} to {}", path.display(), target.display()));
        }
    }

    debug!("Claimed {} as {}", path.display(), target.display());
    Ok((target, original))
}

/// Inbox and uploads live on different filesystems, so rename cannot work
fn crosses_devices(err: &io::Error) -> bool {
    err.kind() == ErrorKind::CrossesDevices
}
