mod ytdlp;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{platform::ClientConfig, Result};

pub use ytdlp::Ytdlp;

/// Metadata reported by the client after a download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fetched {
  pub title: Option<String>,
  pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
  pub id: Option<String>,
  pub title: Option<String>,
  pub uploader: Option<String>,
  pub duration: Option<f64>,
  pub thumbnail: Option<String>,
  pub webpage_url: Option<String>,
  pub upload_date: Option<String>,
  pub view_count: Option<u64>,
}

/// Receives download progress in percent. Runs on the download path, so
/// implementations must not block.
pub trait ProgressSink: Send + Sync {
  fn report(&self, percent: u8);
}

impl<F> ProgressSink for F
where
  F: Fn(u8) + Send + Sync,
{
  fn report(&self, percent: u8) {
    (self)(percent)
  }
}

#[async_trait]
pub trait Extractor: Send + Sync {
  /// Fetch metadata without downloading anything.
  async fn probe(&self, config: &ClientConfig) -> Result<VideoInfo>;

  /// Metadata of the first `limit` entries of a channel or playlist url.
  async fn list_videos(
    &self,
    config: &ClientConfig,
    limit: usize,
  ) -> Result<Vec<VideoInfo>>;

  /// Download into `target_dir`, which the caller owns exclusively.
  async fn download(
    &self,
    config: &ClientConfig,
    target_dir: &Path,
    progress: &dyn ProgressSink,
  ) -> Result<Fetched>;
}

#[cfg(test)]
pub mod testing {
  use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
  };

  use tokio::sync::Semaphore;

  use super::*;
  use crate::Error;

  /// What a scripted download does, in order.
  #[derive(Debug, Clone)]
  pub enum Script {
    Succeed {
      progress: Vec<u8>,
      files: Vec<(&'static str, &'static [u8])>,
      title: Option<&'static str>,
    },
    Fail {
      progress: Vec<u8>,
      message: &'static str,
    },
    /// reports success without writing anything
    NoFile { progress: Vec<u8> },
    Hang,
    Panic,
  }

  impl Script {
    pub fn file(name: &'static str, bytes: &'static [u8]) -> Self {
      Script::Succeed {
        progress: vec![0, 50, 100],
        files: vec![(name, bytes)],
        title: Some("scripted"),
      }
    }
  }

  /// Fake client that plays back one script per download call. Downloads
  /// wait on `gate` when one is set.
  pub struct Scripted {
    scripts: Mutex<VecDeque<Script>>,
    gate: Option<Arc<Semaphore>>,
    configs: Mutex<Vec<ClientConfig>>,
  }

  impl Scripted {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
      Self {
        scripts: Mutex::new(scripts.into_iter().collect()),
        gate: None,
        configs: Mutex::new(Vec::new()),
      }
    }

    /// Configs passed to `download` so far, in call order.
    pub fn configs(&self) -> Vec<ClientConfig> {
      self.configs.lock().unwrap().clone()
    }

    pub fn gated(
      scripts: impl IntoIterator<Item = Script>,
    ) -> (Self, Arc<Semaphore>) {
      let gate = Arc::new(Semaphore::new(0));
      let scripted = Self {
        gate: Some(gate.clone()),
        ..Self::new(scripts)
      };
      (scripted, gate)
    }

    fn next(&self) -> Option<Script> {
      self.scripts.lock().unwrap().pop_front()
    }
  }

  #[async_trait]
  impl Extractor for Scripted {
    async fn probe(&self, config: &ClientConfig) -> Result<VideoInfo> {
      Ok(VideoInfo {
        title: Some("scripted".into()),
        webpage_url: Some(config.url.clone()),
        ..Default::default()
      })
    }

    async fn list_videos(
      &self,
      config: &ClientConfig,
      limit: usize,
    ) -> Result<Vec<VideoInfo>> {
      let videos = (1..=3)
        .map(|n| VideoInfo {
          id: Some(format!("v{n}")),
          title: Some(format!("broadcast {n}")),
          uploader: Some(config.url.clone()),
          ..Default::default()
        })
        .take(limit)
        .collect();
      Ok(videos)
    }

    async fn download(
      &self,
      config: &ClientConfig,
      target_dir: &Path,
      progress: &dyn ProgressSink,
    ) -> Result<Fetched> {
      self.configs.lock().unwrap().push(config.clone());
      if let Some(gate) = &self.gate {
        gate.acquire().await.unwrap().forget();
      }

      let script = self
        .next()
        .ok_or_else(|| Error::Extraction("no script left".into()))?;

      match script {
        Script::Succeed {
          progress: steps,
          files,
          title,
        } => {
          steps.into_iter().for_each(|p| progress.report(p));
          for (name, bytes) in files {
            tokio::fs::write(target_dir.join(name), bytes).await?;
          }
          Ok(Fetched {
            title: title.map(Into::into),
            duration: Some(12.5),
          })
        }
        Script::Fail {
          progress: steps,
          message,
        } => {
          steps.into_iter().for_each(|p| progress.report(p));
          Err(Error::Extraction(message.into()))
        }
        Script::NoFile { progress: steps } => {
          steps.into_iter().for_each(|p| progress.report(p));
          Ok(Fetched::default())
        }
        Script::Hang => {
          tokio::time::sleep(Duration::from_secs(3600)).await;
          Ok(Fetched::default())
        }
        Script::Panic => panic!("scripted panic"),
      }
    }
  }
}
