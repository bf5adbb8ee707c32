use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::command::PLAYLIST_FILE;
use crate::config::PipelineConfig;
use crate::namespace::THUMBNAIL_EXT;

/// Externally addressable URLs of a finished job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedUrls {
    pub playlist_url: String,
    pub thumbnail_url: Option<String>,
}

/// Composes result URLs from a job id and the static layer's path convention.
///
/// Pure string composition, no I/O.
#[derive(Debug, Clone)]
pub struct Publisher {
    videos_prefix: String,
    thumbnails_prefix: String,
}

impl Publisher {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            videos_prefix: normalize_prefix(&cfg.videos_url_prefix),
            thumbnails_prefix: normalize_prefix(&cfg.thumbnails_url_prefix),
        }
    }

    pub fn publish(&self, job_id: &str, has_thumbnail: bool) -> PublishedUrls {
        PublishedUrls {
            playlist_url: format!("{}/{}/{}", self.videos_prefix, job_id, PLAYLIST_FILE),
            thumbnail_url: has_thumbnail
                .then(|| format!("{}/{}.{}", self.thumbnails_prefix, job_id, THUMBNAIL_EXT)),
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Registered media type for a file the pipeline produces, for the static layer
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "m3u8" => Some("application/vnd.apple.mpegurl"),
        "ts" => Some("video/mp2t"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        _ => None,
    }
}
