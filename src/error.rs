use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("invalid url for {platform}: {url}")]
  InvalidUrl { platform: String, url: String },
  #[error("unsupported platform: {0}")]
  UnsupportedPlatform(String),
  #[error("unsupported format: {0}")]
  UnsupportedFormat(String),
  #[error("invalid time range: {0}")]
  InvalidRange(String),
  #[error("bad request: {0}")]
  BadRequest(String),
  #[error("job not found: {0}")]
  NotFound(String),
  #[error("job {0} has not completed")]
  NotCompleted(String),
  #[error("too many pending jobs, try again later")]
  Busy,
  #[error("invalid configuration: {0}")]
  Config(String),
  #[error("extraction failed: {0}")]
  Extraction(String),
  #[error("server error: {0}")]
  Server(String),
  #[error(transparent)]
  IO(#[from] std::io::Error),
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  #[error(transparent)]
  Http(#[from] axum::http::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  pub fn status(&self) -> StatusCode {
    match self {
      Error::InvalidUrl { .. }
      | Error::UnsupportedPlatform(_)
      | Error::UnsupportedFormat(_)
      | Error::InvalidRange(_)
      | Error::BadRequest(_)
      | Error::NotCompleted(_) => StatusCode::BAD_REQUEST,
      Error::NotFound(_) => StatusCode::NOT_FOUND,
      Error::Busy => StatusCode::SERVICE_UNAVAILABLE,
      Error::Extraction(_) => StatusCode::BAD_GATEWAY,
      Error::Config(_)
      | Error::Server(_)
      | Error::IO(_)
      | Error::Json(_)
      | Error::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = self.status();
    let message = match &self {
      Error::Extraction(msg) => crate::util::redact(msg, None),
      // internal details stay in the log
      e if status == StatusCode::INTERNAL_SERVER_ERROR => {
        tracing::error!("request failed: {e}");
        "internal server error".to_string()
      }
      e => e.to_string(),
    };

    (status, Json(json!({ "error": message }))).into_response()
  }
}
