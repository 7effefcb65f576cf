use std::{sync::Arc, time::Duration};

use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod extractor;
mod job;
mod platform;
mod registry;
mod runner;
mod util;

pub use error::{Error, Result};

use crate::{
  api::AppState, config::Config, extractor::Ytdlp, registry::JobRegistry,
  runner::JobRunner,
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let config = Config::from_env()?;
  info!(
    "starting in {:?} mode, jobs under {}",
    config.mode,
    config.download_dir.display()
  );

  let jobs = Arc::new(JobRegistry::new(&config.download_dir)?);
  let ytdlp = Ytdlp::new(config.ytdlp_path.clone(), config.proxy.clone());
  let runner = JobRunner::new(&config, jobs.clone(), Arc::new(ytdlp));
  let state = AppState {
    runner,
    mode: config.mode,
  };

  let bind_addr = config.bind_addr;
  let (ttl, every) = (config.job_ttl, config.sweep_interval);

  Toplevel::new(move |s: SubsystemHandle| async move {
    s.start(SubsystemBuilder::new("http", move |subsys| {
      api::serve(bind_addr, state, subsys)
    }));
    s.start(SubsystemBuilder::new("sweeper", move |subsys| {
      registry::sweep(jobs, ttl, every, subsys)
    }));
  })
  .catch_signals()
  .handle_shutdown_requests(Duration::from_secs(5))
  .await
  .map_err(|e| Error::Server(e.to_string()))
}
