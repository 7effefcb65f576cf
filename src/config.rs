use std::{
  net::SocketAddr,
  path::PathBuf,
  str::FromStr,
  time::Duration,
};

use crate::{Error, Result};

/// Where the service runs. Selects the client tuning profile and a few
/// defaults; nothing else should branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
  /// short-lived function with a hard execution limit
  Serverless,
  /// long-lived process
  Local,
}

impl FromStr for DeploymentMode {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "serverless" | "vercel" => Ok(Self::Serverless),
      "local" => Ok(Self::Local),
      other => Err(Error::Config(format!("unknown deployment mode: {other}"))),
    }
  }
}

/// Network knobs handed to the extraction client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTuning {
  pub socket_timeout: Duration,
  pub retries: u32,
  pub fragment_retries: u32,
}

impl DeploymentMode {
  pub fn tuning(self) -> ClientTuning {
    match self {
      // few attempts so a function invocation doesn't run out of time
      DeploymentMode::Serverless => ClientTuning {
        socket_timeout: Duration::from_secs(20),
        retries: 3,
        fragment_retries: 2,
      },
      DeploymentMode::Local => ClientTuning {
        socket_timeout: Duration::from_secs(60),
        retries: 8,
        fragment_retries: 8,
      },
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub bind_addr: SocketAddr,
  pub mode: DeploymentMode,
  pub tuning: ClientTuning,
  pub download_dir: PathBuf,
  pub ytdlp_path: PathBuf,
  pub proxy: Option<String>,
  pub max_concurrent_jobs: usize,
  pub max_pending_jobs: usize,
  pub job_timeout: Duration,
  pub job_ttl: Duration,
  pub sweep_interval: Duration,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub(crate) fn from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
  ) -> Result<Self> {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let mode = match var("DEPLOYMENT_MODE") {
      Some(mode) => mode.parse()?,
      None if var("VERCEL").is_some() || var("VERCEL_ENV").is_some() => {
        DeploymentMode::Serverless
      }
      None => DeploymentMode::Local,
    };

    let (default_concurrency, default_timeout): (usize, u64) = match mode {
      DeploymentMode::Serverless => (1, 55),
      DeploymentMode::Local => (2, 600),
    };

    let bind_addr =
      parse_or(&var, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;
    let download_dir = var("DOWNLOAD_DIR")
      .map(PathBuf::from)
      .unwrap_or_else(|| std::env::temp_dir().join("media-fetch"));
    let ytdlp_path = var("YTDLP_PATH")
      .map(PathBuf::from)
      .unwrap_or_else(|| PathBuf::from("yt-dlp"));

    let max_concurrent_jobs =
      parse_or(&var, "YTDLP_CONCURRENCY", default_concurrency)?;
    let max_pending_jobs = parse_or(&var, "MAX_PENDING_JOBS", 32)?;
    if max_concurrent_jobs == 0 || max_pending_jobs == 0 {
      return Err(Error::Config(
        "job concurrency and pending limits must be positive".into(),
      ));
    }

    let secs = |key: &str, default: u64| {
      parse_or(&var, key, default).map(Duration::from_secs)
    };

    Ok(Self {
      bind_addr,
      mode,
      tuning: mode.tuning(),
      download_dir,
      ytdlp_path,
      proxy: var("YTDLP_PROXY"),
      max_concurrent_jobs,
      max_pending_jobs,
      job_timeout: secs("JOB_TIMEOUT_SECS", default_timeout)?,
      job_ttl: secs("JOB_TTL_SECS", 3600)?,
      sweep_interval: secs("SWEEP_INTERVAL_SECS", 60)?,
    })
  }
}

fn parse_or<T>(
  var: impl Fn(&str) -> Option<String>,
  key: &str,
  default: T,
) -> Result<T>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match var(key) {
    Some(raw) => raw
      .trim()
      .parse()
      .map_err(|e| Error::Config(format!("{key}={raw}: {e}"))),
    None => Ok(default),
  }
}
