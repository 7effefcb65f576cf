use std::{io, net::SocketAddr};

use axum::{
  body::StreamBody,
  extract::{
    rejection::{JsonRejection, QueryRejection},
    Path, Query, State,
  },
  http::{self, header, StatusCode},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::io::ReaderStream;
use tracing::info;
use uuid::Uuid;

use crate::{
  config::DeploymentMode,
  extractor::VideoInfo,
  job::{ErrorKind, JobId, JobStatus},
  platform::Platform,
  runner::{DownloadRequest, JobRunner},
  util, Error, Result,
};

#[derive(Clone)]
pub struct AppState {
  pub runner: JobRunner,
  pub mode: DeploymentMode,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/download", post(submit))
    .route("/status/:id", get(status))
    .route("/file/:id", get(file))
    .route("/info", get(info))
    .route("/twitch/vods", get(twitch_vods))
    .route("/health", get(health))
    .route("/api/info", get(api_info))
    .with_state(state)
}

pub async fn serve(
  addr: SocketAddr,
  state: AppState,
  subsys: SubsystemHandle,
) -> Result<()> {
  let server = axum::Server::try_bind(&addr)
    .map_err(|e| Error::Server(format!("cannot bind {addr}: {e}")))?;

  info!("listening on {addr}");
  server
    .serve(router(state).into_make_service())
    .with_graceful_shutdown(subsys.on_shutdown_requested())
    .await
    .map_err(|e| Error::Server(e.to_string()))
}

#[derive(Serialize)]
struct Submitted {
  id: JobId,
}

async fn submit(
  State(state): State<AppState>,
  req: std::result::Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
  // axum would answer a malformed body in plain text
  let Json(req) = req.map_err(|e| Error::BadRequest(e.body_text()))?;
  let id = state.runner.submit(req)?;
  Ok((StatusCode::ACCEPTED, Json(Submitted { id })))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
  id: JobId,
  platform: Platform,
  url: String,
  status: JobStatus,
  progress: u8,
  created_at: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  finished_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error_kind: Option<ErrorKind>,
  #[serde(skip_serializing_if = "Option::is_none")]
  title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  file_name: Option<String>,
}

// malformed ids can't name a job, so they are simply unknown
fn parse_id(id: &str) -> Result<JobId> {
  Uuid::parse_str(id).map_err(|_| Error::NotFound(id.to_string()))
}

async fn status(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Json<StatusResponse>> {
  let job = state.runner.registry().get(parse_id(&id)?)?;

  let (title, file_name) = match job.result {
    Some(result) => (result.title, Some(result.file_name)),
    None => (None, None),
  };

  Ok(Json(StatusResponse {
    id: job.id,
    platform: job.request.platform,
    url: job.request.source_url,
    status: job.status,
    progress: job.progress,
    created_at: job.created_at,
    finished_at: job.finished_at,
    error: job.error.as_ref().map(|e| e.message.clone()),
    error_kind: job.error.map(|e| e.kind),
    title,
    file_name,
  }))
}

async fn file(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Response> {
  let id = parse_id(&id)?;
  let registry = state.runner.registry();

  let job = registry.get(id)?;
  let result = match job.result {
    Some(result) if job.status == JobStatus::Completed => result,
    _ => return Err(Error::NotCompleted(id.to_string())),
  };

  // holding the directory handle keeps the file on disk while streaming,
  // even if the job is evicted meanwhile
  let dir = registry.job_dir(id)?;
  let file = match tokio::fs::File::open(&result.file_path).await {
    Ok(file) => file,
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      return Err(Error::NotFound(result.file_name));
    }
    Err(e) => return Err(e.into()),
  };
  let size = file.metadata().await?.len();

  let stream = ReaderStream::new(file).map(move |chunk: io::Result<Bytes>| {
    let _dir = &dir;
    chunk
  });

  let resp = http::Response::builder()
    .status(StatusCode::OK)
    .header(header::CONTENT_TYPE, util::mime_type(&result.file_path))
    .header(header::CONTENT_LENGTH, size)
    .header(
      header::CONTENT_DISPOSITION,
      util::content_disposition(&result.file_name),
    )
    .body(axum::body::boxed(StreamBody::new(stream)))?;

  Ok(resp)
}

#[derive(Debug, Deserialize)]
struct InfoQuery {
  url: String,
  platform: String,
}

async fn info(
  State(state): State<AppState>,
  query: std::result::Result<Query<InfoQuery>, QueryRejection>,
) -> Result<Json<VideoInfo>> {
  let Query(query) = query.map_err(|e| Error::BadRequest(e.body_text()))?;
  let info = state.runner.probe(&query.platform, &query.url).await?;
  Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct VodsQuery {
  user: String,
  limit: Option<usize>,
}

async fn twitch_vods(
  State(state): State<AppState>,
  query: std::result::Result<Query<VodsQuery>, QueryRejection>,
) -> Result<Json<Vec<VideoInfo>>> {
  let Query(query) = query.map_err(|e| Error::BadRequest(e.body_text()))?;
  let vods = state.runner.list_vods(&query.user, query.limit).await?;
  Ok(Json(vods))
}

async fn health() -> impl IntoResponse {
  "ok".to_owned()
}

async fn api_info(State(state): State<AppState>) -> impl IntoResponse {
  let platforms = Platform::ALL.map(Platform::name);
  Json(json!({
    "service": env!("CARGO_PKG_NAME"),
    "version": env!("CARGO_PKG_VERSION"),
    "platforms": platforms,
    "mode": state.mode,
    "active_jobs": state.runner.registry().active_count(),
  }))
}
