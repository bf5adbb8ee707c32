use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use anyhow::Context;
use log::{debug, warn};
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobUpdate};

/// In-memory job table with per-job locking and optional JSON snapshots.
///
/// The outer map lock is held only to look a job up or insert it; every
/// read or transition of a job then locks that job alone, so polling one job
/// never waits on another job's transition.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
    snapshot_dir: Option<PathBuf>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that mirrors every mutation to `<dir>/<id>.json`
    pub fn with_snapshots(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| {
            PipelineError::ResourceUnavailable(format!("cannot create job state dir {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            jobs: RwLock::default(),
            snapshot_dir: Some(dir),
        })
    }

    pub fn snapshot_dir(&self) -> Option<&Path> {
        self.snapshot_dir.as_deref()
    }

    /// Register a new job; fails with `DuplicateJob` if the id is taken here
    /// or by a snapshot in the shared state dir
    pub fn create(&self, job: Job) -> Result<Job> {
        if self.has_snapshot(&job.id) {
            return Err(PipelineError::DuplicateJob(job.id));
        }

        let entry = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            if jobs.contains_key(&job.id) {
                return Err(PipelineError::DuplicateJob(job.id));
            }
            let id = job.id.clone();
            let entry = Arc::new(Mutex::new(job));
            jobs.insert(id, Arc::clone(&entry));
            entry
        };

        // Written under the job's own lock, not the map lock
        let job = lock(&entry);
        self.persist(&job);
        Ok(job.clone())
    }

    pub fn get(&self, id: &str) -> Result<Job> {
        let entry = self.entry(id)?;
        let job = lock(&entry);
        Ok(job.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Whether `id` may not be handed to a new job.
    ///
    /// Other processes sharing the state dir only leave their snapshots
    /// behind, so a snapshot on disk reserves the id as well.
    pub fn is_reserved(&self, id: &str) -> bool {
        self.contains(id) || self.has_snapshot(id)
    }

    /// Move a job to the update's target state and record its fields.
    ///
    /// Fails with `UnknownJob` if absent and `InvalidTransition` if the target
    /// is not reachable from the current state.
    pub fn transition(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let entry = self.entry(id)?;
        let mut job = lock(&entry);

        let target = update.target_state();
        if !job.state.can_transition_to(target) {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: job.state,
                to: target,
            });
        }

        debug!("Job {}: {:?} -> {:?}", id, job.state, target);
        job.apply(update);
        self.persist(&job);
        Ok(job.clone())
    }

    /// Returns true exactly once per job: the caller that gets `true` owns
    /// deleting the source file.
    pub fn claim_source_release(&self, id: &str) -> Result<bool> {
        let entry = self.entry(id)?;
        let mut job = lock(&entry);

        if job.source_released {
            return Ok(false);
        }
        job.source_released = true;
        self.persist(&job);
        Ok(true)
    }

    /// All jobs, newest first
    pub fn list(&self) -> Vec<Job> {
        let entries: Vec<_> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut jobs: Vec<Job> = entries.iter().map(|e| lock(e).clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Drop a terminal job (retention hook). Running jobs are never evicted.
    pub fn remove_terminal(&self, id: &str) -> Result<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let entry = jobs
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownJob(id.to_string()))?;

        let job = lock(&entry).clone();
        if !job.state.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: job.state,
                to: job.state,
            });
        }

        jobs.remove(id);
        if let Some(dir) = &self.snapshot_dir {
            let path = snapshot_path(dir, id);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to delete job snapshot {}: {}", path.display(), e);
            }
        }
        Ok(job)
    }

    /// Insert previously persisted jobs; ids already present are skipped
    pub fn restore(&self, restored: Vec<Job>) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for job in restored {
            if jobs.contains_key(&job.id) {
                continue;
            }
            jobs.insert(job.id.clone(), Arc::new(Mutex::new(job)));
            count += 1;
        }
        count
    }

    fn entry(&self, id: &str) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownJob(id.to_string()))
    }

    fn has_snapshot(&self, id: &str) -> bool {
        self.snapshot_dir
            .as_deref()
            .map(|dir| snapshot_path(dir, id).exists())
            .unwrap_or(false)
    }

    fn persist(&self, job: &Job) {
        if let Some(dir) = &self.snapshot_dir {
            if let Err(e) = save_snapshot(job, dir) {
                warn!("Job {}: failed to write snapshot: {:#}", job.id, e);
            }
        }
    }
}

fn lock(entry: &Mutex<Job>) -> MutexGuard<'_, Job> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn snapshot_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", id))
}

/// Write a job snapshot atomically (temp file + rename)
pub fn save_snapshot(job: &Job, dir: &Path) -> anyhow::Result<()> {
    let path = snapshot_path(dir, &job.id);
    let tmp = dir.join(format!(".{}.json.tmp", job.id));

    let json = serde_json::to_string_pretty(job)
        .with_context(|| format!("Failed to serialize job {}", job.id))?;
    fs::write(&tmp, json)
        .with_context(|| format!("Failed to write job snapshot: {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to move job snapshot into place: {}", path.display()))?;
    Ok(())
}

/// Load every job snapshot in `dir`; unreadable files are skipped with a warning
pub fn load_snapshots(dir: &Path) -> anyhow::Result<Vec<Job>> {
    let mut jobs = Vec::new();
    if !dir.exists() {
        return Ok(jobs);
    }

    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read job state dir: {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let parsed = fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str::<Job>(&content).map_err(anyhow::Error::from));

        match parsed {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping unreadable job snapshot {}: {}", path.display(), e),
        }
    }

    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(jobs)
}
