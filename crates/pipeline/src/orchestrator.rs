use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use walkdir::WalkDir;
use crate::command::{CommandBuilder, PLAYLIST_FILE, SEGMENT_EXT};
use crate::config::PipelineConfig;
use crate::error::{FailureKind, FailureReason, PipelineError, Result};
use crate::invoker::{InvokeError, Invoker};
use crate::job::{next_state, Job, JobState, JobStatus, JobUpdate, StepOutcome};
use crate::namespace::Namespace;
use crate::owner::JobOwner;
use crate::publisher::Publisher;
use crate::store::{load_snapshots, JobStore};

/// Deletes a job's source file. Injected so tests can count deletions.
pub trait SourceRemover: Send + Sync {
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Removes sources from the local filesystem; a missing file counts as removed
#[derive(Debug, Default, Clone, Copy)]
pub struct FsRemover;

impl SourceRemover for FsRemover {
    fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Data gathered by the steps of one run
#[derive(Debug, Default)]
struct Progress {
    source_bytes: u64,
    has_thumbnail: bool,
    thumbnail_error: Option<String>,
}

/// How a run ended, before it is committed to the store
#[derive(Debug)]
enum Terminal {
    Ready(Progress),
    Failed(FailureReason),
}

struct Inner {
    config: PipelineConfig,
    namespace: Namespace,
    commands: CommandBuilder,
    publisher: Publisher,
    store: JobStore,
    invoker: Arc<dyn Invoker>,
    remover: Arc<dyn SourceRemover>,
    permits: Semaphore,
    /// Stamped on every job this pipeline creates
    owner: Option<JobOwner>,
}

/// Drives uploaded files through validate → encode → thumbnail → publish,
/// with exactly-once source cleanup on every terminal path.
///
/// Cheap to clone; clones share the same store and concurrency limit.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Build a pipeline and create its output roots
    pub fn new(config: PipelineConfig, invoker: Arc<dyn Invoker>) -> Result<Self> {
        Self::with_remover(config, invoker, Arc::new(FsRemover))
    }

    pub fn with_remover(
        config: PipelineConfig,
        invoker: Arc<dyn Invoker>,
        remover: Arc<dyn SourceRemover>,
    ) -> Result<Self> {
        let namespace = Namespace::new(&config);
        namespace.init()?;

        let store = match &config.job_state_dir {
            Some(dir) => JobStore::with_snapshots(dir.clone())?,
            None => JobStore::new(),
        };

        let owner = JobOwner::current();
        if owner.is_none() {
            warn!("Cannot identify this process; its jobs may be failed by a concurrent recovery");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                commands: CommandBuilder::new(&config),
                publisher: Publisher::new(&config),
                permits: Semaphore::new(config.max_concurrent_jobs.max(1)),
                namespace,
                store,
                invoker,
                remover,
                owner,
                config,
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Hand off an uploaded file; returns the job id immediately.
    ///
    /// The run is spawned on the current tokio runtime and is not tied to the
    /// caller, so a disconnecting uploader never cancels it. Naming errors
    /// are returned here and leave `source_path` with the caller.
    pub fn submit(&self, source_path: &Path, original_filename: &str) -> Result<String> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            PipelineError::ResourceUnavailable(format!("no async runtime to run the job on: {}", e))
        })?;

        let job = self.register(source_path, original_filename)?;
        let id = job.id.clone();
        let pipeline = self.clone();
        handle.spawn(async move {
            pipeline.drive(job).await;
        });
        Ok(id)
    }

    /// Register and run a job inline, returning it in its terminal state
    pub async fn process(&self, source_path: &Path, original_filename: &str) -> Result<Job> {
        let job = self.register(source_path, original_filename)?;
        Ok(self.drive(job).await)
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatus> {
        self.inner.store.get(job_id).map(|job| job.status())
    }

    pub fn job(&self, job_id: &str) -> Result<Job> {
        self.inner.store.get(job_id)
    }

    /// Poll until the job is terminal
    pub async fn wait_for(&self, job_id: &str, poll_interval: Duration) -> Result<Job> {
        loop {
            let job = self.inner.store.get(job_id)?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Drop a finished job from the store (retention hook)
    pub fn forget(&self, job_id: &str) -> Result<Job> {
        self.inner.store.remove_terminal(job_id)
    }

    /// Load persisted jobs and fail the ones a previous process left unfinished.
    ///
    /// Unfinished jobs whose owning process is still alive are skipped, so
    /// a daemon starting next to a running `submit` leaves its job alone.
    ///
    /// Returns the number of interrupted jobs that were cleaned up.
    pub fn recover(&self) -> Result<usize> {
        let Some(dir) = self.inner.store.snapshot_dir() else {
            return Ok(0);
        };

        let jobs = load_snapshots(dir)
            .map_err(|e| PipelineError::ResourceUnavailable(format!("{:#}", e)))?;

        // Jobs still driven by a live process (another submit, or this one) are not ours to fail
        let (running, settled): (Vec<Job>, Vec<Job>) = jobs.into_iter().partition(|job| {
            !job.state.is_terminal() && job.owner.map(|owner| owner.is_alive()).unwrap_or(false)
        });
        for job in &running {
            if let Some(owner) = job.owner {
                info!("Job {}: still {:?} in pid {}, leaving it alone", job.id, job.state, owner.pid);
            }
        }

        let restored = self.inner.store.restore(settled.clone());
        debug!("Restored {} job(s) from {}", restored, dir.display());

        let mut recovered = 0;
        for job in settled.into_iter().filter(|j| !j.state.is_terminal()) {
            warn!("Job {}: left in {:?} by a previous run, marking failed", job.id, job.state);
            let reason = FailureReason::new(
                FailureKind::Interrupted,
                format!("process stopped while job was {:?}", job.state),
            );
            self.conclude(&job, Terminal::Failed(reason));
            recovered += 1;
        }

        Ok(recovered)
    }

    fn register(&self, source_path: &Path, original_filename: &str) -> Result<Job> {
        let inner = &self.inner;
        let allocation = inner
            .namespace
            .allocate(original_filename, |id| inner.store.is_reserved(id))?;

        let output_dir = allocation.output_dir.clone();
        let mut job = Job::new(
            allocation.job_id,
            original_filename.to_string(),
            source_path.to_path_buf(),
            allocation.output_dir,
        );
        job.owner = inner.owner;

        match inner.store.create(job) {
            Ok(job) => {
                info!("Job {}: created for upload {:?}", job.id, original_filename);
                Ok(job)
            }
            Err(e) => {
                // Release the directory we just reserved
                if let Err(rm) = fs::remove_dir(&output_dir) {
                    warn!("Failed to release {}: {}", output_dir.display(), rm);
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, job: Job) -> Job {
        let _permit = match self.inner.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                let reason = FailureReason::new(FailureKind::ResourceUnavailable, e.to_string());
                return self.conclude(&job, Terminal::Failed(reason));
            }
        };

        // The time budget starts once the job actually gets to run
        let deadline = Instant::now() + self.inner.config.job_timeout();
        let terminal = self.execute(&job, deadline).await;
        self.conclude(&job, terminal)
    }

    /// Step through the state machine until a terminal state is reached
    async fn execute(&self, job: &Job, deadline: Instant) -> Terminal {
        let mut progress = Progress::default();
        let mut state = JobState::Pending;

        loop {
            let outcome = match state {
                JobState::Pending => self.validate(job, &mut progress).await,
                JobState::Encoding => self.encode(job, deadline).await,
                JobState::Thumbnailing => self.thumbnail(job, deadline, &mut progress).await,
                JobState::Ready | JobState::Failed => {
                    return Terminal::Failed(FailureReason::new(
                        FailureKind::ResourceUnavailable,
                        format!("job already {:?}", state),
                    ));
                }
            };

            let update = match (next_state(state, &outcome), outcome) {
                (Some(JobState::Encoding), _) => JobUpdate::Encoding { source_bytes: progress.source_bytes },
                (Some(JobState::Thumbnailing), _) => JobUpdate::Thumbnailing,
                (Some(JobState::Ready), _) => return Terminal::Ready(progress),
                (Some(JobState::Failed), StepOutcome::Failed(reason) | StepOutcome::Degraded(reason)) => {
                    return Terminal::Failed(reason);
                }
                (next, _) => {
                    return Terminal::Failed(FailureReason::new(
                        FailureKind::ResourceUnavailable,
                        format!("no transition from {:?} (got {:?})", state, next),
                    ));
                }
            };

            state = update.target_state();
            if let Err(e) = self.inner.store.transition(&job.id, update) {
                error!("Job {}: {}", job.id, e);
                return Terminal::Failed(FailureReason::new(FailureKind::ResourceUnavailable, e.to_string()));
            }
        }
    }

    async fn validate(&self, job: &Job, progress: &mut Progress) -> StepOutcome {
        let source = &job.source_path;
        let invalid = |detail: String| StepOutcome::Failed(FailureReason::new(FailureKind::InvalidInput, detail));

        let meta = match tokio::fs::metadata(source).await {
            Ok(meta) => meta,
            Err(e) => return invalid(format!("cannot stat source {}: {}", source.display(), e)),
        };
        if !meta.is_file() {
            return invalid(format!("source {} is not a regular file", source.display()));
        }
        if meta.len() == 0 {
            return invalid("source file is empty".to_string());
        }
        if meta.len() > self.inner.config.max_upload_bytes {
            return invalid(format!(
                "source is {} bytes, limit is {}",
                meta.len(),
                self.inner.config.max_upload_bytes
            ));
        }
        if let Err(e) = tokio::fs::File::open(source).await {
            return invalid(format!("source is not readable: {}", e));
        }

        progress.source_bytes = meta.len();
        StepOutcome::Succeeded
    }

    async fn encode(&self, job: &Job, deadline: Instant) -> StepOutcome {
        let Some(budget) = remaining(deadline) else {
            return timed_out(self.inner.config.job_timeout());
        };

        let spec = self.inner.commands.segment_encode(&job.source_path, &job.output_dir);
        info!("Job {}: encoding into {}", job.id, job.output_dir.display());

        match self.inner.invoker.run(&spec, budget).await {
            // Exit code alone is not enough: the tool may exit 0 having written nothing
            Ok(_) => match verify_output(&job.output_dir) {
                Ok(segments) => {
                    info!("Job {}: encode produced {} segment(s)", job.id, segments);
                    StepOutcome::Succeeded
                }
                Err(detail) => StepOutcome::Failed(FailureReason::new(FailureKind::EncodeFailed, detail)),
            },
            Err(e) => StepOutcome::Failed(failure_from_invoke(e, FailureKind::EncodeFailed)),
        }
    }

    async fn thumbnail(&self, job: &Job, deadline: Instant, progress: &mut Progress) -> StepOutcome {
        let thumbnail = self.inner.namespace.thumbnail_path(&job.id);
        let playlist = job.output_dir.join(PLAYLIST_FILE);

        let result = match remaining(deadline) {
            Some(budget) => {
                let spec = self.inner.commands.thumbnail(&playlist, &thumbnail);
                self.inner
                    .invoker
                    .run(&spec, budget)
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|_| match fs::metadata(&thumbnail) {
                        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
                        _ => Err("transcoder exited 0 but wrote no thumbnail".to_string()),
                    })
            }
            None => Err(format!("no time left of {:?} budget", self.inner.config.job_timeout())),
        };

        match result {
            Ok(()) => {
                progress.has_thumbnail = true;
                StepOutcome::Succeeded
            }
            Err(detail) => {
                // The stream already exists; a missing preview must not cost the job
                warn!("Job {}: thumbnail failed, publishing without it: {}", job.id, detail);
                if let Err(e) = fs::remove_file(&thumbnail) {
                    if e.kind() != ErrorKind::NotFound {
                        warn!("Job {}: failed to remove partial thumbnail: {}", job.id, e);
                    }
                }
                progress.thumbnail_error = Some(detail.clone());
                StepOutcome::Degraded(FailureReason::new(FailureKind::ThumbnailFailed, detail))
            }
        }
    }

    /// The one exit path: release the source, then commit the terminal state
    fn conclude(&self, job: &Job, terminal: Terminal) -> Job {
        self.release_source(job);

        let update = match terminal {
            Terminal::Ready(progress) => {
                let urls = self.inner.publisher.publish(&job.id, progress.has_thumbnail);
                JobUpdate::Ready {
                    playlist_url: urls.playlist_url,
                    thumbnail_url: urls.thumbnail_url,
                    thumbnail_error: progress.thumbnail_error,
                }
            }
            Terminal::Failed(reason) => {
                self.discard_output(job);
                JobUpdate::Failed(reason)
            }
        };

        match self.inner.store.transition(&job.id, update) {
            Ok(done) => {
                match &done.failure {
                    None => info!("✅ Job {}: ready at {}", done.id, done.playlist_url.as_deref().unwrap_or("-")),
                    Some(reason) if reason.kind == FailureKind::ToolUnavailable => {
                        error!("❌ Job {}: {} (check ffmpeg_bin in the configuration)", done.id, reason);
                    }
                    Some(reason) => error!("❌ Job {}: {}", done.id, reason),
                }
                done
            }
            Err(e) => {
                error!("Job {}: failed to record terminal state: {}", job.id, e);
                self.inner.store.get(&job.id).unwrap_or_else(|_| job.clone())
            }
        }
    }

    fn release_source(&self, job: &Job) {
        match self.inner.store.claim_source_release(&job.id) {
            Ok(true) => match self.inner.remover.remove(&job.source_path) {
                Ok(()) => debug!("Job {}: removed source {}", job.id, job.source_path.display()),
                Err(e) => warn!("Job {}: failed to remove source {}: {}", job.id, job.source_path.display(), e),
            },
            Ok(false) => debug!("Job {}: source already released", job.id),
            Err(e) => warn!("Job {}: cannot release source: {}", job.id, e),
        }
    }

    fn discard_output(&self, job: &Job) {
        let thumbnail = self.inner.namespace.thumbnail_path(&job.id);
        if thumbnail.exists() {
            if let Err(e) = fs::remove_file(&thumbnail) {
                warn!("Job {}: failed to remove thumbnail {}: {}", job.id, thumbnail.display(), e);
            }
        }

        if self.inner.config.keep_failed_output {
            debug!("Job {}: keeping {} for diagnostics", job.id, job.output_dir.display());
            return;
        }
        match fs::remove_dir_all(&job.output_dir) {
            Ok(()) => debug!("Job {}: removed {}", job.id, job.output_dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Job {}: failed to remove {}: {}", job.id, job.output_dir.display(), e),
        }
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

fn timed_out(limit: Duration) -> StepOutcome {
    StepOutcome::Failed(FailureReason::new(
        FailureKind::Timeout,
        format!("exceeded maximum processing time of {:?}", limit),
    ))
}

/// Map an invoker error onto the failure taxonomy; `step_kind` is used for
/// a tool that ran and failed.
fn failure_from_invoke(err: InvokeError, step_kind: FailureKind) -> FailureReason {
    match err {
        InvokeError::ToolUnavailable { .. } => FailureReason::new(FailureKind::ToolUnavailable, err.to_string()),
        InvokeError::ProcessingFailed { .. } => FailureReason::new(step_kind, err.to_string()),
        InvokeError::TimedOut { .. } => FailureReason::new(FailureKind::Timeout, err.to_string()),
        InvokeError::Io(_) => FailureReason::new(FailureKind::ResourceUnavailable, err.to_string()),
    }
}

/// Check that the encode left a playlist and at least one segment behind
fn verify_output(output_dir: &Path) -> std::result::Result<usize, String> {
    let playlist = output_dir.join(PLAYLIST_FILE);
    match fs::metadata(&playlist) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {}
        _ => return Err(format!("transcoder exited 0 but {} is missing or empty", playlist.display())),
    }

    let segments = WalkDir::new(output_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXT))
        .filter(|entry| entry.metadata().map(|m| m.len() > 0).unwrap_or(false))
        .count();

    if segments == 0 {
        return Err(format!("transcoder exited 0 but wrote no .{} segments", SEGMENT_EXT));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use crate::command::CommandSpec;
    use crate::invoker::{ExitResult, FfmpegInvoker};

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        /// Write the expected output files and exit 0
        Produce,
        /// Exit 0 without writing anything
        ExitZeroEmpty,
        Exit(i32),
        Missing,
        Hang,
    }

    struct FakeInvoker {
        encode: Behavior,
        thumbnail: Behavior,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl FakeInvoker {
        fn new(encode: Behavior, thumbnail: Behavior) -> Self {
            Self {
                encode,
                thumbnail,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Invoker for FakeInvoker {
        async fn run(&self, spec: &CommandSpec, timeout: Duration) -> std::result::Result<ExitResult, InvokeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);

            let behavior = if spec.label == "encode" { self.encode } else { self.thumbnail };
            let output = spec.output_path().unwrap().to_path_buf();

            let result = match behavior {
                Behavior::Produce => {
                    if spec.label == "encode" {
                        let dir = output.parent().unwrap();
                        fs::write(dir.join("segment_000.ts"), b"segment zero").unwrap();
                        fs::write(dir.join("segment_001.ts"), b"segment one").unwrap();
                        fs::write(
                            &output,
                            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:1.0,\nsegment_000.ts\n#EXTINF:1.0,\nsegment_001.ts\n#EXT-X-ENDLIST\n",
                        )
                        .unwrap();
                    } else {
                        fs::write(&output, b"\xff\xd8\xff\xe0 jpeg").unwrap();
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(ExitResult { code: 0, diagnostics_tail: String::new() })
                }
                Behavior::ExitZeroEmpty => Ok(ExitResult { code: 0, diagnostics_tail: String::new() }),
                Behavior::Exit(code) => Err(InvokeError::ProcessingFailed {
                    code: Some(code),
                    diagnostics_tail: "Invalid data found when processing input".to_string(),
                }),
                Behavior::Missing => Err(InvokeError::ToolUnavailable {
                    program: "ffmpeg".to_string(),
                    message: "No such file or directory (os error 2)".to_string(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(timeout).await;
                    Err(InvokeError::TimedOut { after: timeout, diagnostics_tail: String::new() })
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    /// Deletes for real and records every call
    #[derive(Default)]
    struct CountingRemover {
        removed: Mutex<Vec<PathBuf>>,
    }

    impl CountingRemover {
        fn count_for(&self, path: &Path) -> usize {
            self.removed.lock().unwrap().iter().filter(|p| p.as_path() == path).count()
        }
    }

    impl SourceRemover for CountingRemover {
        fn remove(&self, path: &Path) -> io::Result<()> {
            self.removed.lock().unwrap().push(path.to_path_buf());
            FsRemover.remove(path)
        }
    }

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        pipeline: Pipeline,
        invoker: Arc<FakeInvoker>,
        remover: Arc<CountingRemover>,
    }

    impl Harness {
        fn new(encode: Behavior, thumbnail: Behavior) -> Self {
            Self::with_config(encode, thumbnail, |_| {})
        }

        fn with_config(encode: Behavior, thumbnail: Behavior, tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let mut cfg = test_config(&root);
            tweak(&mut cfg);

            let invoker = Arc::new(FakeInvoker::new(encode, thumbnail));
            let remover = Arc::new(CountingRemover::default());
            let pipeline = Pipeline::with_remover(cfg, invoker.clone(), remover.clone()).unwrap();
            Self { _dir: dir, root, pipeline, invoker, remover }
        }

        fn upload(&self, bytes: &[u8]) -> PathBuf {
            let path = self.root.join("uploads").join(uuid::Uuid::new_v4().to_string());
            fs::write(&path, bytes).unwrap();
            path
        }
    }

    fn test_config(root: &Path) -> PipelineConfig {
        PipelineConfig {
            videos_dir: root.join("videos"),
            thumbnails_dir: root.join("thumbnails"),
            uploads_dir: root.join("uploads"),
            job_state_dir: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_my_clip_reaches_ready() {
        let h = Harness::new(Behavior::Produce, Behavior::Produce);
        let source = h.upload(b"two seconds of video");

        let job = h.pipeline.process(&source, "My Clip.mov").await.unwrap();

        assert_eq!(job.id, "My_Clip");
        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.playlist_url.as_deref(), Some("/videos/My_Clip/index.m3u8"));
        assert_eq!(job.thumbnail_url.as_deref(), Some("/thumbnails/My_Clip.jpg"));
        assert_eq!(job.source_bytes, Some(20));
        assert!(job.failure.is_none());

        // Output is on disk before the URL is visible
        assert!(job.output_dir.join("index.m3u8").is_file());
        assert!(job.output_dir.join("segment_000.ts").is_file());
        assert!(h.root.join("thumbnails/My_Clip.jpg").is_file());

        // Source deleted exactly once
        assert!(!source.exists());
        assert_eq!(h.remover.count_for(&source), 1);
        assert_eq!(h.invoker.calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_byte_upload_fails_without_spawning() {
        let h = Harness::new(Behavior::Produce, Behavior::Produce);
        let source = h.upload(b"");

        let job = h.pipeline.process(&source, "empty.mp4").await.unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_kind(), Some(FailureKind::InvalidInput));
        assert_eq!(h.invoker.calls(), 0);
        assert!(!source.exists());
        assert_eq!(h.remover.count_for(&source), 1);
        assert!(!job.output_dir.exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_invalid_input() {
        let h = Harness::new(Behavior::Produce, Behavior::Produce);
        let source = h.root.join("uploads").join("never-written");

        let job = h.pipeline.process(&source, "ghost.mp4").await.unwrap();
        assert_eq!(job.failure_kind(), Some(FailureKind::InvalidInput));
        assert_eq!(h.invoker.calls(), 0);
    }

    #[tokio::test]
    async fn test_oversized_upload_is_invalid_input() {
        let h = Harness::with_config(Behavior::Produce, Behavior::Produce, |cfg| cfg.max_upload_bytes = 4);
        let source = h.upload(b"way more than four bytes");

        let job = h.pipeline.process(&source, "big.mp4").await.unwrap();
        assert_eq!(job.failure_kind(), Some(FailureKind::InvalidInput));
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_encode_nonzero_exit_fails_job() {
        let h = Harness::new(Behavior::Exit(1), Behavior::Produce);
        let source = h.upload(b"corrupt");

        let job = h.pipeline.process(&source, "broken.avi").await.unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_kind(), Some(FailureKind::EncodeFailed));
        assert!(job.failure.as_ref().unwrap().detail.contains("Invalid data found"));
        assert!(job.playlist_url.is_none());
        assert!(job.thumbnail_url.is_none());
        // Thumbnail never attempted, failed output removed by default
        assert_eq!(h.invoker.calls(), 1);
        assert!(!job.output_dir.exists());
        assert_eq!(h.remover.count_for(&source), 1);
    }

    #[tokio::test]
    async fn test_encode_exit_zero_without_output_fails_job() {
        let h = Harness::new(Behavior::ExitZeroEmpty, Behavior::Produce);
        let source = h.upload(b"data");

        let job = h.pipeline.process(&source, "silent.mp4").await.unwrap();

        assert_eq!(job.failure_kind(), Some(FailureKind::EncodeFailed));
        assert!(job.failure.as_ref().unwrap().detail.contains("index.m3u8"));
        assert!(job.playlist_url.is_none());
    }

    #[tokio::test]
    async fn test_keep_failed_output_retains_directory() {
        let h = Harness::with_config(Behavior::Exit(1), Behavior::Produce, |cfg| cfg.keep_failed_output = true);
        let source = h.upload(b"data");

        let job = h.pipeline.process(&source, "keep.mp4").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.output_dir.is_dir());
    }

    #[tokio::test]
    async fn test_thumbnail_failure_still_ready() {
        let h = Harness::new(Behavior::Produce, Behavior::Exit(1));
        let source = h.upload(b"data");

        let job = h.pipeline.process(&source, "clip.mp4").await.unwrap();

        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.playlist_url.as_deref(), Some("/videos/clip/index.m3u8"));
        assert!(job.thumbnail_url.is_none());
        assert!(job.thumbnail_error.is_some());
        assert!(job.failure.is_none());
        assert_eq!(h.remover.count_for(&source), 1);
    }

    #[tokio::test]
    async fn test_thumbnail_exit_zero_without_image_degrades() {
        let h = Harness::new(Behavior::Produce, Behavior::ExitZeroEmpty);
        let source = h.upload(b"data");

        let job = h.pipeline.process(&source, "clip.mp4").await.unwrap();
        assert_eq!(job.state, JobState::Ready);
        assert!(job.thumbnail_url.is_none());
    }

    #[tokio::test]
    async fn test_thumbnail_tool_missing_degrades() {
        let h = Harness::new(Behavior::Produce, Behavior::Missing);
        let source = h.upload(b"data");

        let job = h.pipeline.process(&source, "clip.mp4").await.unwrap();

        assert_eq!(job.state, JobState::Ready);
        assert!(job.thumbnail_url.is_none());
        assert!(job.thumbnail_error.as_deref().unwrap().contains("ffmpeg"));
        assert!(job.failure.is_none());
        assert!(!h.root.join("thumbnails/clip.jpg").exists());
        assert_eq!(h.remover.count_for(&source), 1);
    }

    #[tokio::test]
    async fn test_thumbnail_timeout_degrades() {
        let h = Harness::with_config(Behavior::Produce, Behavior::Hang, |cfg| cfg.job_timeout_secs = 1);
        let source = h.upload(b"data");

        let job = h.pipeline.process(&source, "clip.mp4").await.unwrap();

        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.playlist_url.as_deref(), Some("/videos/clip/index.m3u8"));
        assert!(job.thumbnail_url.is_none());
        assert!(job.thumbnail_error.is_some());
        assert!(job.failure.is_none());
        assert!(job.output_dir.join(PLAYLIST_FILE).is_file());
        assert!(!h.root.join("thumbnails/clip.jpg").exists());
    }

    #[tokio::test]
    async fn test_tool_unavailable_from_fake() {
        let h = Harness::new(Behavior::Missing, Behavior::Produce);
        let source = h.upload(b"data");

        let job = h.pipeline.process(&source, "clip.mp4").await.unwrap();
        assert_eq!(job.failure_kind(), Some(FailureKind::ToolUnavailable));
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_missing_transcoder_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.ffmpeg_bin = PathBuf::from("/nonexistent/ffmpeg_xyz_12345");
        let pipeline = Pipeline::new(cfg, Arc::new(FfmpegInvoker::default())).unwrap();

        let source = dir.path().join("uploads/upload.bin");
        fs::write(&source, b"data").unwrap();

        let job = pipeline.process(&source, "clip.mp4").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_kind(), Some(FailureKind::ToolUnavailable));
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let h = Harness::with_config(Behavior::Hang, Behavior::Produce, |cfg| cfg.job_timeout_secs = 1);
        let source = h.upload(b"data");

        let job = h.pipeline.process(&source, "slow.mp4").await.unwrap();
        assert_eq!(job.failure_kind(), Some(FailureKind::Timeout));
        assert!(!source.exists());
        assert!(!job.output_dir.exists());
    }

    #[tokio::test]
    async fn test_same_stem_is_disambiguated() {
        let h = Harness::new(Behavior::Produce, Behavior::Produce);
        let first = h.upload(b"one");
        let second = h.upload(b"two");

        let a = h.pipeline.process(&first, "My Clip.mov").await.unwrap();
        let b = h.pipeline.process(&second, "My Clip.mp4").await.unwrap();

        assert_eq!(a.id, "My_Clip");
        assert_eq!(b.id, "My_Clip-2");
        assert_eq!(b.playlist_url.as_deref(), Some("/videos/My_Clip-2/index.m3u8"));
        assert!(a.output_dir.join("index.m3u8").is_file());
        assert!(b.output_dir.join("index.m3u8").is_file());
    }

    #[tokio::test]
    async fn test_submit_runs_in_background_with_bounded_concurrency() {
        let h = Harness::with_config(Behavior::Produce, Behavior::Produce, |cfg| cfg.max_concurrent_jobs = 2);

        let mut ids = Vec::new();
        for i in 0..5 {
            let source = h.upload(b"data");
            ids.push(h.pipeline.submit(&source, &format!("clip {}.mp4", i)).unwrap());
        }

        for id in &ids {
            let job = tokio::time::timeout(
                Duration::from_secs(10),
                h.pipeline.wait_for(id, Duration::from_millis(10)),
            )
            .await
            .unwrap()
            .unwrap();
            assert_eq!(job.state, JobState::Ready);
        }

        assert!(h.invoker.max_active.load(Ordering::SeqCst) <= 2);
        let status = h.pipeline.status(&ids[0]).unwrap();
        assert_eq!(status.playlist_url.as_deref(), Some("/videos/clip_0/index.m3u8"));
    }

    #[tokio::test]
    async fn test_status_of_unknown_job() {
        let h = Harness::new(Behavior::Produce, Behavior::Produce);
        assert!(matches!(h.pipeline.status("nope"), Err(PipelineError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn test_forget_terminal_job() {
        let h = Harness::new(Behavior::Produce, Behavior::Produce);
        let source = h.upload(b"data");
        let job = h.pipeline.process(&source, "clip.mp4").await.unwrap();

        h.pipeline.forget(&job.id).unwrap();
        assert!(matches!(h.pipeline.status(&job.id), Err(PipelineError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn test_recover_fails_interrupted_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.job_state_dir = Some(dir.path().join("jobs"));

        // A previous process got as far as Encoding
        let first = Pipeline::new(cfg.clone(), Arc::new(FakeInvoker::new(Behavior::Produce, Behavior::Produce))).unwrap();
        let source = dir.path().join("uploads/abandoned");
        fs::write(&source, b"data").unwrap();
        let output_dir = dir.path().join("videos/abandoned");
        fs::create_dir_all(&output_dir).unwrap();
        fs::write(output_dir.join("segment_000.ts"), b"partial").unwrap();
        first
            .store()
            .create(Job::new("abandoned".into(), "abandoned.mp4".into(), source.clone(), output_dir.clone()))
            .unwrap();
        first.store().transition("abandoned", JobUpdate::Encoding { source_bytes: 4 }).unwrap();
        drop(first);

        let second = Pipeline::new(cfg, Arc::new(FakeInvoker::new(Behavior::Produce, Behavior::Produce))).unwrap();
        assert_eq!(second.recover().unwrap(), 1);

        let job = second.job("abandoned").unwrap();
        assert_eq!(job.failure_kind(), Some(FailureKind::Interrupted));
        assert!(!source.exists());
        assert!(!output_dir.exists());

        // A new upload with the same stem does not collide with the recovered id
        let fresh = dir.path().join("uploads/fresh");
        fs::write(&fresh, b"data").unwrap();
        let job = second.process(&fresh, "abandoned.mp4").await.unwrap();
        assert_eq!(job.id, "abandoned-2");
    }

    #[tokio::test]
    async fn test_recover_leaves_jobs_of_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.job_state_dir = Some(dir.path().join("jobs"));

        // Another submit in this very process is mid-encode
        let first = Pipeline::new(cfg.clone(), Arc::new(FakeInvoker::new(Behavior::Produce, Behavior::Produce))).unwrap();
        let source = dir.path().join("uploads/busy");
        fs::write(&source, b"data").unwrap();
        let output_dir = dir.path().join("videos/busy");
        fs::create_dir_all(&output_dir).unwrap();
        let mut job = Job::new("busy".into(), "busy.mp4".into(), source.clone(), output_dir.clone());
        job.owner = JobOwner::current();
        assert!(job.owner.is_some());
        first.store().create(job).unwrap();
        first.store().transition("busy", JobUpdate::Encoding { source_bytes: 4 }).unwrap();

        let second = Pipeline::new(cfg.clone(), Arc::new(FakeInvoker::new(Behavior::Produce, Behavior::Produce))).unwrap();
        assert_eq!(second.recover().unwrap(), 0);

        assert!(source.exists());
        assert!(output_dir.exists());
        assert_eq!(first.job("busy").unwrap().state, JobState::Encoding);
        let on_disk = load_snapshots(cfg.job_state_dir.as_deref().unwrap()).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].state, JobState::Encoding);
        assert!(on_disk[0].failure.is_none());
    }

    #[tokio::test]
    async fn test_recover_fails_jobs_of_recycled_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.job_state_dir = Some(dir.path().join("jobs"));

        let first = Pipeline::new(cfg.clone(), Arc::new(FakeInvoker::new(Behavior::Produce, Behavior::Produce))).unwrap();
        let source = dir.path().join("uploads/orphan");
        fs::write(&source, b"data").unwrap();
        let output_dir = dir.path().join("videos/orphan");
        fs::create_dir_all(&output_dir).unwrap();
        let mut job = Job::new("orphan".into(), "orphan.mp4".into(), source.clone(), output_dir.clone());
        // Same pid, but the process that owned it started at another time
        job.owner = Some(JobOwner { pid: std::process::id(), started_at: 1 });
        first.store().create(job).unwrap();
        drop(first);

        let second = Pipeline::new(cfg, Arc::new(FakeInvoker::new(Behavior::Produce, Behavior::Produce))).unwrap();
        assert_eq!(second.recover().unwrap(), 1);
        assert_eq!(second.job("orphan").unwrap().failure_kind(), Some(FailureKind::Interrupted));
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_failed_id_not_reused_by_sibling_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.job_state_dir = Some(dir.path().join("jobs"));

        // Two processes sharing one state dir; the first one's encode fails
        let failing = Pipeline::new(cfg.clone(), Arc::new(FakeInvoker::new(Behavior::Exit(1), Behavior::Produce))).unwrap();
        let healthy = Pipeline::new(cfg.clone(), Arc::new(FakeInvoker::new(Behavior::Produce, Behavior::Produce))).unwrap();

        let first_source = dir.path().join("uploads/first");
        fs::write(&first_source, b"data").unwrap();
        let failed = failing.process(&first_source, "clip.mp4").await.unwrap();
        assert_eq!(failed.id, "clip");
        assert_eq!(failed.state, JobState::Failed);

        let second_source = dir.path().join("uploads/second");
        fs::write(&second_source, b"data").unwrap();
        let ready = healthy.process(&second_source, "clip.mov").await.unwrap();
        assert_eq!(ready.id, "clip-2");
        assert_eq!(ready.state, JobState::Ready);

        let mut on_disk = load_snapshots(cfg.job_state_dir.as_deref().unwrap()).unwrap();
        on_disk.sort_by(|a, b| a.id.cmp(&b.id));
        let summary: Vec<_> = on_disk
            .iter()
            .map(|job| (job.id.as_str(), job.original_filename.as_str(), job.state))
            .collect();
        assert_eq!(
            summary,
            vec![("clip", "clip.mp4", JobState::Failed), ("clip-2", "clip.mov", JobState::Ready)]
        );
    }

    #[test]
    fn test_verify_output_requires_segments() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verify_output(dir.path()).is_err());

        fs::write(dir.path().join(PLAYLIST_FILE), "#EXTM3U\n").unwrap();
        assert!(verify_output(dir.path()).unwrap_err().contains("segments"));

        fs::write(dir.path().join("segment_000.ts"), b"x").unwrap();
        assert_eq!(verify_output(dir.path()).unwrap(), 1);
    }
}
