use std::{path::Path, sync::LazyLock};

use itertools::Itertools;
use regex::Regex;

const MAX_MESSAGE_LEN: usize = 300;

// credentials embedded in proxy urls
static AUTH_REGEX: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"//[^:/@\s]+(:[^@/\s]+)?@").unwrap());

// python tracebacks and similar noise never reach users
static TRACE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?s)Traceback \(most recent call last\):.*").unwrap()
});

/// Turn a raw client message into something safe to show to end users:
/// strips credentials, the job's own directory and tracebacks, and caps the
/// length.
pub fn redact(message: &str, job_dir: Option<&Path>) -> String {
  let mut message =
    AUTH_REGEX.replace_all(message, "//<REDACTED>@").into_owned();
  message = TRACE_REGEX.replace(&message, "").into_owned();

  if let Some(dir) = job_dir {
    let dir = dir.display().to_string();
    message = message.replace(&format!("{dir}/"), "").replace(&dir, "");
  }

  let message = message.split_whitespace().join(" ");
  if message.is_empty() {
    return "download failed".to_string();
  }

  match message.char_indices().nth(MAX_MESSAGE_LEN) {
    Some((cut, _)) => format!("{}...", &message[..cut]),
    None => message,
  }
}

/// `Content-Disposition` value suggesting `file_name` for the download.
pub fn content_disposition(file_name: &str) -> String {
  let fallback: String = file_name
    .chars()
    .map(|c| match c {
      '"' | '\\' | '/' => '_',
      c if c.is_ascii() && !c.is_ascii_control() => c,
      _ => '_',
    })
    .collect();

  let encoded: String = file_name
    .bytes()
    .map(|b| match b {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' => {
        (b as char).to_string()
      }
      _ => format!("%{b:02X}"),
    })
    .collect();

  format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

pub fn mime_type(path: &Path) -> &'static str {
  let ext = path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_ascii_lowercase());

  match ext.as_deref() {
    Some("mp4" | "m4v") => "video/mp4",
    Some("webm") => "video/webm",
    Some("mkv") => "video/x-matroska",
    Some("mov") => "video/quicktime",
    Some("mp3") => "audio/mpeg",
    Some("m4a") => "audio/mp4",
    Some("opus" | "ogg") => "audio/ogg",
    _ => "application/octet-stream",
  }
}
