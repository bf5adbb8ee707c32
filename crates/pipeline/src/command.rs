use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use crate::config::PipelineConfig;

/// Playlist written into every job's output directory
pub const PLAYLIST_FILE: &str = "index.m3u8";

/// Segment filename pattern handed to the HLS muxer
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";

/// Extension of the media segments produced by [`SEGMENT_PATTERN`]
pub const SEGMENT_EXT: &str = "ts";

/// A fully-qualified external command: program plus explicit argument list.
///
/// Never a shell string, so user-controlled filenames cannot inject anything.
/// Arguments are OS strings so non-UTF-8 paths reach the tool unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Short step name used in logs ("encode", "thumbnail")
    pub label: &'static str,
}

impl CommandSpec {
    /// The last argument, which is the output path for every command we build
    pub fn output_path(&self) -> Option<&Path> {
        self.args.last().map(Path::new)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Command builder for generating ffmpeg command lines
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    ffmpeg_bin: PathBuf,
    encode_args: Vec<String>,
    hls_segment_secs: u32,
    thumbnail_offset: String,
    thumbnail_width: u32,
}

impl CommandBuilder {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            encode_args: cfg.encode_args.clone(),
            hls_segment_secs: cfg.hls_segment_secs,
            thumbnail_offset: cfg.thumbnail_offset.clone(),
            thumbnail_width: cfg.thumbnail_width,
        }
    }

    /// Build the segment-encode command writing `index.m3u8` and
    /// `segment_NNN.ts` files into `output_dir`
    pub fn segment_encode(&self, source: &Path, output_dir: &Path) -> CommandSpec {
        let mut args: Vec<OsString> = Vec::new();

        // Overwrite, never prompt
        args.push("-y".into());
        args.push("-nostdin".into());

        // Input file
        args.push("-i".into());
        args.push(source.into());

        // Encoder choice is configuration, not ours
        args.extend(self.encode_args.iter().map(OsString::from));

        // HLS muxer: every segment listed, VOD playlist
        args.push("-f".into());
        args.push("hls".into());
        args.push("-hls_time".into());
        args.push(self.hls_segment_secs.to_string().into());
        args.push("-hls_list_size".into());
        args.push("0".into());
        args.push("-hls_playlist_type".into());
        args.push("vod".into());
        args.push("-hls_segment_filename".into());
        args.push(output_dir.join(SEGMENT_PATTERN).into());

        // Output playlist
        args.push(output_dir.join(PLAYLIST_FILE).into());

        CommandSpec {
            program: self.ffmpeg_bin.clone(),
            args,
            label: "encode",
        }
    }

    /// Build the single-frame extraction command.
    ///
    /// Reads the produced playlist rather than the raw upload so the preview
    /// matches what is streamed.
    pub fn thumbnail(&self, playlist: &Path, thumbnail: &Path) -> CommandSpec {
        let mut args: Vec<OsString> = Vec::new();

        args.push("-y".into());
        args.push("-nostdin".into());

        args.push("-i".into());
        args.push(playlist.into());

        // Seek after input so short clips still decode a frame
        args.push("-ss".into());
        args.push(self.thumbnail_offset.as_str().into());
        args.push("-frames:v".into());
        args.push("1".into());
        args.push("-vf".into());
        args.push(format!("scale={}:-2", self.thumbnail_width).into());

        args.push(thumbnail.into());

        CommandSpec {
            program: self.ffmpeg_bin.clone(),
            args,
            label: "thumbnail",
        }
    }
}
