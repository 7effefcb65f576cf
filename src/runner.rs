use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use serde::Deserialize;
use tokio::{sync::Semaphore, time::timeout};
use tracing::{error, info, warn};

use crate::{
  config::{ClientTuning, Config},
  extractor::{Extractor, VideoInfo},
  job::{ErrorKind, JobError, JobId, JobRequest, JobResult},
  platform::{OutputFormat, Platform, Quality, TimeRange},
  registry::JobRegistry,
  util, Error, Result,
};

/// Body of a download submission.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
  pub url: String,
  pub platform: String,
  #[serde(default)]
  pub quality: Option<String>,
  #[serde(default)]
  pub format: Option<String>,
  /// `HH:MM:SS` or `MM:SS`; given together with `end` to download a part
  #[serde(default)]
  pub start: Option<String>,
  #[serde(default)]
  pub end: Option<String>,
}

const DEFAULT_VOD_LIMIT: usize = 10;
const MAX_VOD_LIMIT: usize = 50;

/// Starts and supervises one background task per submitted job.
#[derive(Clone)]
pub struct JobRunner {
  inner: Arc<Inner>,
}

struct Inner {
  registry: Arc<JobRegistry>,
  extractor: Arc<dyn Extractor>,
  tuning: ClientTuning,
  // bounds jobs in the running state
  slots: Semaphore,
  // bounds jobs in the queued or running state
  max_pending: usize,
  job_timeout: Duration,
}

impl JobRunner {
  pub fn new(
    config: &Config,
    registry: Arc<JobRegistry>,
    extractor: Arc<dyn Extractor>,
  ) -> Self {
    let inner = Inner {
      registry,
      extractor,
      tuning: config.tuning.clone(),
      slots: Semaphore::new(config.max_concurrent_jobs),
      max_pending: config.max_pending_jobs,
      job_timeout: config.job_timeout,
    };

    Self {
      inner: Arc::new(inner),
    }
  }

  pub fn registry(&self) -> &Arc<JobRegistry> {
    &self.inner.registry
  }

  /// Validates the request, registers a queued job and starts working on it
  /// in the background. Returns as soon as the job is registered.
  pub fn submit(&self, req: DownloadRequest) -> Result<JobId> {
    let platform = validate(&req.platform, &req.url)?;
    let format = req
      .format
      .as_deref()
      .map(str::parse::<OutputFormat>)
      .transpose()?
      .unwrap_or_default();
    let quality = req
      .quality
      .as_deref()
      .map(Quality::parse)
      .unwrap_or_default();
    let section = match (req.start.as_deref(), req.end.as_deref()) {
      (None, None) => None,
      (Some(start), Some(end)) => Some(TimeRange::parse(start, end)?),
      _ => {
        return Err(Error::InvalidRange(
          "start and end must be given together".into(),
        ))
      }
    };

    let request = JobRequest {
      platform,
      source_url: req.url.trim().to_string(),
      quality,
      format,
      section,
    };

    let id = self
      .inner
      .registry
      .try_create(request.clone(), self.inner.max_pending)?;
    info!("job {id}: queued {} {}", platform, request.source_url);

    tokio::spawn(supervise(self.inner.clone(), id, request));
    Ok(id)
  }

  /// Fetches metadata for `url` without downloading it.
  pub async fn probe(&self, platform: &str, url: &str) -> Result<VideoInfo> {
    let platform = validate(platform, url)?;
    let config = platform.build_config(
      url,
      &Quality::Best,
      OutputFormat::default(),
      &self.inner.tuning,
    );

    let _permit = self.inner.slots.acquire().await.map_err(|_| Error::Busy)?;
    match timeout(self.inner.job_timeout, self.inner.extractor.probe(&config))
      .await
    {
      Ok(info) => info,
      Err(_) => Err(Error::Extraction("metadata lookup timed out".into())),
    }
  }

  /// Lists the most recent past broadcasts of a Twitch user.
  pub async fn list_vods(
    &self,
    user: &str,
    limit: Option<usize>,
  ) -> Result<Vec<VideoInfo>> {
    let url = Platform::twitch_videos_url(user)?;
    let limit = limit.unwrap_or(DEFAULT_VOD_LIMIT).clamp(1, MAX_VOD_LIMIT);
    let config = Platform::Twitch.build_config(
      &url,
      &Quality::Best,
      OutputFormat::default(),
      &self.inner.tuning,
    );

    let _permit = self.inner.slots.acquire().await.map_err(|_| Error::Busy)?;
    let listing = self.inner.extractor.list_videos(&config, limit);
    match timeout(self.inner.job_timeout, listing).await {
      Ok(videos) => videos,
      Err(_) => Err(Error::Extraction("vod listing timed out".into())),
    }
  }
}

fn validate(platform: &str, url: &str) -> Result<Platform> {
  let platform: Platform = platform.parse()?;
  if !platform.validate(url) {
    return Err(Error::InvalidUrl {
      platform: platform.to_string(),
      url: url.to_string(),
    });
  }
  Ok(platform)
}

// A panicking worker must not leave its job behind in a non-terminal state.
async fn supervise(inner: Arc<Inner>, id: JobId, request: JobRequest) {
  let registry = inner.registry.clone();

  if let Err(e) = tokio::spawn(work(inner, id, request)).await {
    error!("job {id}: worker crashed: {e}");
    registry.mark_failed(
      id,
      JobError::new(ErrorKind::ExtractionFailed, "internal download error"),
    );
  }
}

async fn work(inner: Arc<Inner>, id: JobId, request: JobRequest) {
  let registry = &inner.registry;

  // the job stays queued while waiting for a slot
  let Ok(_permit) = inner.slots.acquire().await else {
    registry.mark_failed(
      id,
      JobError::new(ErrorKind::ExtractionFailed, "runner shut down"),
    );
    return;
  };

  let dir = match registry.job_dir(id) {
    Ok(dir) => dir,
    Err(e) => {
      warn!("job {id}: {e}");
      return;
    }
  };

  if !registry.mark_running(id) {
    return;
  }

  match execute(&inner, id, &request, dir.path()).await {
    Ok(result) => {
      info!(
        "job {id}: completed with {} ({} bytes)",
        result.file_name, result.size
      );
      registry.mark_completed(id, result);
    }
    Err(error) => {
      info!("job {id}: failed ({:?}): {}", error.kind, error.message);
      registry.mark_failed(id, error);
    }
  }
}

async fn execute(
  inner: &Inner,
  id: JobId,
  request: &JobRequest,
  dir: &Path,
) -> Result<JobResult, JobError> {
  let failed = |e: Error| {
    warn!("job {id}: {e}");
    let message = match e {
      Error::Extraction(msg) => msg,
      e => e.to_string(),
    };
    JobError::new(ErrorKind::ExtractionFailed, util::redact(&message, Some(dir)))
  };

  tokio::fs::create_dir_all(dir)
    .await
    .map_err(|e| failed(e.into()))?;

  let config = request
    .platform
    .build_config(
      &request.source_url,
      &request.quality,
      request.format,
      &inner.tuning,
    )
    .with_section(request.section);

  let registry = &inner.registry;
  let sink = move |percent: u8| registry.update_progress(id, percent);

  // dropping the download future kills the client process
  let download = inner.extractor.download(&config, dir, &sink);
  let fetched = match timeout(inner.job_timeout, download).await {
    Ok(fetched) => fetched.map_err(failed)?,
    Err(_) => {
      warn!("job {id}: timed out after {:?}", inner.job_timeout);
      return Err(JobError::new(
        ErrorKind::Timeout,
        format!(
          "download timed out after {} seconds",
          inner.job_timeout.as_secs()
        ),
      ));
    }
  };

  let Some((file_path, size)) =
    pick_output(dir).await.map_err(|e| failed(e.into()))?
  else {
    return Err(JobError::new(
      ErrorKind::NoFileProduced,
      "download finished without producing a file",
    ));
  };

  let file_name = file_path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_default();

  Ok(JobResult {
    file_path,
    file_name,
    size,
    title: fetched.title,
    duration: fetched.duration,
  })
}

/// The largest non-empty regular file in `dir`, skipping leftovers of
/// interrupted or in-progress downloads.
async fn pick_output(dir: &Path) -> std::io::Result<Option<(PathBuf, u64)>> {
  let mut entries = tokio::fs::read_dir(dir).await?;
  let mut largest: Option<(PathBuf, u64)> = None;

  while let Some(entry) = entries.next_entry().await? {
    let meta = entry.metadata().await?;
    let path = entry.path();
    if !meta.is_file() || meta.len() == 0 || is_partial(&path) {
      continue;
    }

    if largest.as_ref().map_or(true, |(_, size)| meta.len() > *size) {
      largest = Some((path, meta.len()));
    }
  }

  Ok(largest)
}

fn is_partial(path: &Path) -> bool {
  let name = path
    .file_name()
    .and_then(|name| name.to_str())
    .unwrap_or_default();

  name.ends_with(".part")
    || name.ends_with(".ytdl")
    || name.contains(".part-Frag")
    || name.contains(".temp.")
}
