use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Arc, Mutex, MutexGuard, RwLock},
  time::Duration,
};

use chrono::Utc;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  job::{Job, JobError, JobId, JobRequest, JobResult},
  Error, Result,
};

/// Output directory owned by a single job. Removed from disk once the last
/// handle is dropped, which happens after the job is evicted and no file
/// response is still streaming from it.
#[derive(Debug)]
pub struct JobDir {
  path: PathBuf,
}

impl JobDir {
  fn new(root: &Path, id: JobId) -> Self {
    Self {
      path: root.join(id.to_string()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for JobDir {
  fn drop(&mut self) {
    if !self.path.exists() {
      return;
    }

    if let Err(e) = std::fs::remove_dir_all(&self.path) {
      warn!("failed to delete {}: {}", self.path.display(), e);
    } else {
      debug!("deleted {}", self.path.display());
    }
  }
}

struct Entry {
  job: Mutex<Job>,
  dir: Arc<JobDir>,
}

impl Entry {
  // poisoning is ignored, `Job` transitions never panic halfway
  fn lock(&self) -> MutexGuard<'_, Job> {
    self.job.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// In-memory store of all known jobs.
///
/// The map lock is only held to insert, look up or remove entries; every
/// field update goes through the entry's own mutex so readers always see a
/// job either fully before or fully after a transition.
pub struct JobRegistry {
  root: PathBuf,
  jobs: RwLock<HashMap<JobId, Arc<Entry>>>,
}

impl JobRegistry {
  /// Creates the registry rooted at `root`, clearing job directories left
  /// behind by a previous run.
  pub fn new(root: impl AsRef<Path>) -> Result<Self> {
    let root = root.as_ref().to_owned();
    std::fs::create_dir_all(&root)?;

    for entry in std::fs::read_dir(&root)? {
      let entry = entry?;
      let stale = entry
        .file_name()
        .to_str()
        .is_some_and(|name| Uuid::parse_str(name).is_ok());
      if stale && entry.file_type()?.is_dir() {
        std::fs::remove_dir_all(entry.path())?;
      }
    }

    Ok(Self {
      root,
      jobs: RwLock::new(HashMap::new()),
    })
  }

  /// Registers a job without checking the admission limit.
  #[cfg(test)]
  pub fn create(&self, request: JobRequest) -> JobId {
    let mut jobs = self.write();
    self.insert(&mut jobs, request)
  }

  /// Like `create`, but refuses new work once `max_active` jobs are queued
  /// or running.
  pub fn try_create(
    &self,
    request: JobRequest,
    max_active: usize,
  ) -> Result<JobId> {
    let mut jobs = self.write();
    let active = jobs
      .values()
      .filter(|e| !e.lock().status.is_terminal())
      .count();
    if active >= max_active {
      return Err(Error::Busy);
    }
    Ok(self.insert(&mut jobs, request))
  }

  fn insert(
    &self,
    jobs: &mut HashMap<JobId, Arc<Entry>>,
    request: JobRequest,
  ) -> JobId {
    let mut id = Uuid::new_v4();
    while jobs.contains_key(&id) {
      id = Uuid::new_v4();
    }

    let entry = Entry {
      job: Mutex::new(Job::new(id, request)),
      dir: Arc::new(JobDir::new(&self.root, id)),
    };
    jobs.insert(id, Arc::new(entry));
    id
  }

  pub fn get(&self, id: JobId) -> Result<Job> {
    let entry = self.entry(id)?;
    let job = entry.lock().clone();
    Ok(job)
  }

  pub fn job_dir(&self, id: JobId) -> Result<Arc<JobDir>> {
    Ok(self.entry(id)?.dir.clone())
  }

  /// Called from the download path; never fails.
  pub fn update_progress(&self, id: JobId, percent: u8) {
    match self.entry(id) {
      Ok(entry) => {
        entry.lock().advance(percent);
      }
      Err(_) => warn!("progress for unknown job {id}"),
    }
  }

  pub fn mark_running(&self, id: JobId) -> bool {
    self.transition(id, "running", |job| job.start())
  }

  pub fn mark_completed(&self, id: JobId, result: JobResult) -> bool {
    self.transition(id, "completed", |job| job.complete(result))
  }

  pub fn mark_failed(&self, id: JobId, error: JobError) -> bool {
    self.transition(id, "failed", |job| job.fail(error))
  }

  fn transition(
    &self,
    id: JobId,
    to: &str,
    apply: impl FnOnce(&mut Job) -> bool,
  ) -> bool {
    let Ok(entry) = self.entry(id) else {
      warn!("cannot mark unknown job {id} as {to}");
      return false;
    };

    let mut job = entry.lock();
    let from = job.status;
    let applied = apply(&mut job);
    if !applied {
      warn!("job {id}: ignored transition {from:?} -> {to}");
    }
    applied
  }

  pub fn active_count(&self) -> usize {
    self
      .read()
      .values()
      .filter(|e| !e.lock().status.is_terminal())
      .count()
  }

  pub fn len(&self) -> usize {
    self.read().len()
  }

  /// Drops finished jobs created more than `ttl` ago. Returns how many were
  /// removed.
  pub fn evict_expired(&self, ttl: Duration) -> usize {
    let now = Utc::now();
    let expired = |entry: &Entry| {
      let job = entry.lock();
      let old_enough = now
        .signed_duration_since(job.created_at)
        .to_std()
        .is_ok_and(|age| age >= ttl);
      job.status.is_terminal() && old_enough
    };

    let evicted = {
      let mut jobs = self.write();
      let ids = jobs
        .iter()
        .filter(|(_, entry)| expired(entry.as_ref()))
        .map(|(id, _)| *id)
        .collect::<Vec<_>>();
      ids
        .iter()
        .filter_map(|id| jobs.remove(id))
        .collect::<Vec<_>>()
    };

    // directories go away here, outside the map lock
    evicted.len()
  }

  fn entry(&self, id: JobId) -> Result<Arc<Entry>> {
    self
      .read()
      .get(&id)
      .cloned()
      .ok_or_else(|| Error::NotFound(id.to_string()))
  }

  fn read(
    &self,
  ) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Arc<Entry>>> {
    self.jobs.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(
    &self,
  ) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, Arc<Entry>>> {
    self.jobs.write().unwrap_or_else(|e| e.into_inner())
  }
}

/// Periodically evicts expired jobs until shutdown is requested.
pub async fn sweep(
  registry: Arc<JobRegistry>,
  ttl: Duration,
  every: Duration,
  subsys: SubsystemHandle,
) -> Result<()> {
  let mut ticker = tokio::time::interval(every);

  loop {
    tokio::select! {
      _ = subsys.on_shutdown_requested() => break,
      _ = ticker.tick() => {
        let evicted = registry.evict_expired(ttl);
        if evicted > 0 {
          info!("evicted {evicted} expired jobs, {} left", registry.len());
        }
      }
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use std::thread;

  use super::*;
  use crate::{
    job::{ErrorKind, JobStatus},
    platform::{OutputFormat, Platform, Quality},
  };

  fn request() -> JobRequest {
    JobRequest {
      platform: Platform::TikTok,
      source_url: "https://www.tiktok.com/@user/video/123".into(),
      quality: Quality::Best,
      format: OutputFormat::Mp4,
      section: None,
    }
  }

  fn result(registry: &JobRegistry, id: JobId) -> JobResult {
    let dir = registry.job_dir(id).unwrap();
    JobResult {
      file_path: dir.path().join("clip.mp4"),
      file_name: "clip.mp4".into(),
      size: 1,
      title: Some("clip".into()),
      duration: Some(1.5),
    }
  }

  #[test]
  fn test_new_clears_stale_job_dirs_only() {
    let root = tempfile::tempdir().unwrap();
    let stale = root.path().join(Uuid::new_v4().to_string());
    let unrelated = root.path().join("keep-me");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::create_dir_all(&unrelated).unwrap();

    JobRegistry::new(root.path()).unwrap();

    assert!(!stale.exists());
    assert!(unrelated.exists());
  }

  #[test]
  fn test_create_and_get() {
    let root = tempfile::tempdir().unwrap();
    let registry = JobRegistry::new(root.path()).unwrap();

    let id = registry.create(request());
    let job = registry.get(id).unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, 0);
    assert_eq!(job.request, request());
    assert_eq!(
      registry.job_dir(id).unwrap().path(),
      root.path().join(id.to_string())
    );
  }

  #[test]
  fn test_unknown_id() {
    let root = tempfile::tempdir().unwrap();
    let registry = JobRegistry::new(root.path()).unwrap();
    let id = Uuid::new_v4();

    assert!(matches!(registry.get(id), Err(Error::NotFound(_))));
    assert!(matches!(registry.job_dir(id), Err(Error::NotFound(_))));
    // must not panic
    registry.update_progress(id, 50);
    assert!(!registry.mark_running(id));
  }

  #[test]
  fn test_lifecycle() {
    let root = tempfile::tempdir().unwrap();
    let registry = JobRegistry::new(root.path()).unwrap();
    let id = registry.create(request());

    assert!(registry.mark_running(id));
    registry.update_progress(id, 42);
    assert_eq!(registry.get(id).unwrap().progress, 42);

    assert!(registry.mark_completed(id, result(&registry, id)));
    let job = registry.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.result.unwrap().file_name, "clip.mp4");

    // no resurrection
    let err = JobError::new(ErrorKind::ExtractionFailed, "late");
    assert!(!registry.mark_failed(id, err));
    registry.update_progress(id, 10);
    let job = registry.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
  }

  #[test]
  fn test_try_create_respects_limit() {
    let root = tempfile::tempdir().unwrap();
    let registry = JobRegistry::new(root.path()).unwrap();

    let first = registry.try_create(request(), 1).unwrap();
    assert!(matches!(
      registry.try_create(request(), 1),
      Err(Error::Busy)
    ));
    assert_eq!(registry.len(), 1);

    registry.mark_failed(first, JobError::new(ErrorKind::Timeout, "slow"));
    assert_eq!(registry.active_count(), 0);
    assert!(registry.try_create(request(), 1).is_ok());
  }

  #[test]
  fn test_concurrent_creates_get_distinct_ids() {
    let root = tempfile::tempdir().unwrap();
    let registry = Arc::new(JobRegistry::new(root.path()).unwrap());

    let handles = (0..8)
      .map(|_| {
        let registry = registry.clone();
        thread::spawn(move || {
          (0..50).map(|_| registry.create(request())).collect::<Vec<_>>()
        })
      })
      .collect::<Vec<_>>();

    let mut ids = handles
      .into_iter()
      .flat_map(|h| h.join().unwrap())
      .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 400);
    assert_eq!(registry.len(), 400);
  }

  #[test]
  fn test_readers_never_see_partial_completion() {
    let root = tempfile::tempdir().unwrap();
    let registry = Arc::new(JobRegistry::new(root.path()).unwrap());
    let id = registry.create(request());
    registry.mark_running(id);

    let reader = {
      let registry = registry.clone();
      thread::spawn(move || {
        for _ in 0..10_000 {
          let job = registry.get(id).unwrap();
          if job.status == JobStatus::Completed {
            assert!(job.result.is_some());
            assert_eq!(job.progress, 100);
          } else {
            assert!(job.result.is_none());
          }
        }
      })
    };

    for p in 0..99 {
      registry.update_progress(id, p);
    }
    registry.mark_completed(id, result(&registry, id));
    reader.join().unwrap();
  }

  #[test]
  fn test_evict_expired_removes_finished_jobs_and_their_dirs() {
    let root = tempfile::tempdir().unwrap();
    let registry = JobRegistry::new(root.path()).unwrap();

    let done = registry.create(request());
    let running = registry.create(request());
    let queued = registry.create(request());

    let dir = registry.job_dir(done).unwrap().path().to_owned();
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("clip.mp4"), b"x").unwrap();

    registry.mark_running(done);
    registry.mark_completed(done, result(&registry, done));
    registry.mark_running(running);

    // nothing is old enough yet
    assert_eq!(registry.evict_expired(Duration::from_secs(3600)), 0);

    assert_eq!(registry.evict_expired(Duration::ZERO), 1);
    assert!(matches!(registry.get(done), Err(Error::NotFound(_))));
    assert!(registry.get(running).is_ok());
    assert!(registry.get(queued).is_ok());
    assert!(!dir.exists());
  }

  #[test]
  fn test_job_dir_outlives_eviction_while_held() {
    let root = tempfile::tempdir().unwrap();
    let registry = JobRegistry::new(root.path()).unwrap();
    let id = registry.create(request());

    let held = registry.job_dir(id).unwrap();
    std::fs::create_dir_all(held.path()).unwrap();
    registry.mark_failed(id, JobError::new(ErrorKind::Timeout, "slow"));
    registry.evict_expired(Duration::ZERO);

    assert!(held.path().exists());
    let path = held.path().to_owned();
    drop(held);
    assert!(!path.exists());
  }
}
