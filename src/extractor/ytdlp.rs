use std::{
  io,
  path::{Path, PathBuf},
  process::Stdio,
};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, warn};

use crate::{platform::ClientConfig, util, Error, Result};

use super::{Extractor, Fetched, ProgressSink, VideoInfo};

// yt-dlp strips the leading `download:` as the output type, so lines come
// out starting with the marker.
const PROGRESS_MARKER: &str = "[progress]";
const OUTPUT_TEMPLATE: &str = "%(title).120B [%(id)s].%(ext)s";
const MAX_LINE_LENGTH: usize = 8 * 1024;

// run yt-dlp command line to fetch metadata or download into a directory.
// requires the yt-dlp executable to be in PATH (or configured explicitly).
pub struct Ytdlp {
  program: PathBuf,
  proxy: Option<String>,
}

impl Ytdlp {
  pub fn new(program: impl Into<PathBuf>, proxy: Option<String>) -> Self {
    Self {
      program: program.into(),
      proxy,
    }
  }

  fn command(&self, config: &ClientConfig) -> Command {
    let tuning = &config.tuning;
    let mut cmd = Command::new(&self.program);

    cmd
      .arg("--no-warnings")
      .arg("--socket-timeout")
      .arg(tuning.socket_timeout.as_secs().to_string())
      .arg("--retries")
      .arg(tuning.retries.to_string())
      .arg("--fragment-retries")
      .arg(tuning.fragment_retries.to_string())
      .arg("-f")
      .arg(&config.format_selector);

    for (name, value) in &config.headers {
      cmd.arg("--add-header").arg(format!("{name}:{value}"));
    }

    if let Some(proxy) = &self.proxy {
      debug!("using proxy: {}", util::redact(proxy, None));
      cmd.arg("--proxy").arg(proxy);
    }

    cmd.stdin(Stdio::null()).kill_on_drop(true);
    cmd
  }

  fn download_command(
    &self,
    config: &ClientConfig,
    target_dir: &Path,
  ) -> Command {
    let mut cmd = self.command(config);

    cmd
      .arg("--no-playlist")
      .arg("--newline")
      .arg("--progress")
      .arg("--progress-template")
      .arg(format!("download:{PROGRESS_MARKER}%(progress._percent_str)s"))
      .arg("--print")
      .arg("after_move:%(.{title,duration})j")
      .arg("--no-mtime")
      .arg("-o")
      .arg(target_dir.join(OUTPUT_TEMPLATE));

    if let Some(section) = &config.section {
      cmd
        .arg("--download-sections")
        .arg(format!("*{}-{}", section.start, section.end));
    }

    let ext = config.output.extension();
    if config.output.is_audio() {
      cmd
        .arg("-x")
        .arg("--audio-format")
        .arg(ext)
        .arg("--audio-quality")
        .arg("192K");
    } else {
      cmd.arg("--merge-output-format").arg(ext);
    }

    cmd.arg(&config.url);
    cmd
  }

  async fn dump_json(&self, mut cmd: Command, url: &str) -> Result<Vec<u8>> {
    let output = cmd.arg("--dump-single-json").arg(url).output().await?;
    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(Error::Extraction(
        last_error(stderr.lines())
          .unwrap_or_else(|| format!("yt-dlp exited with {}", output.status)),
      ));
    }
    Ok(output.stdout)
  }
}

#[async_trait]
impl Extractor for Ytdlp {
  async fn probe(&self, config: &ClientConfig) -> Result<VideoInfo> {
    let mut cmd = self.command(config);
    cmd.arg("--no-playlist");

    let stdout = self.dump_json(cmd, &config.url).await?;
    serde_json::from_slice(&stdout).map_err(|e| {
      warn!("unexpected yt-dlp output for {}: {}", config.url, e);
      Error::Extraction("unreadable metadata".into())
    })
  }

  async fn list_videos(
    &self,
    config: &ClientConfig,
    limit: usize,
  ) -> Result<Vec<VideoInfo>> {
    #[derive(Deserialize)]
    struct Playlist {
      #[serde(default)]
      entries: Vec<Option<VideoInfo>>,
    }

    let mut cmd = self.command(config);
    cmd
      .arg("--yes-playlist")
      .arg("--playlist-end")
      .arg(limit.to_string());

    let stdout = self.dump_json(cmd, &config.url).await?;
    let playlist: Playlist = serde_json::from_slice(&stdout).map_err(|e| {
      warn!("unexpected yt-dlp output for {}: {}", config.url, e);
      Error::Extraction("unreadable playlist".into())
    })?;

    Ok(playlist.entries.into_iter().flatten().take(limit).collect())
  }

  async fn download(
    &self,
    config: &ClientConfig,
    target_dir: &Path,
    progress: &dyn ProgressSink,
  ) -> Result<Fetched> {
    info!("downloading {} into {}", config.url, target_dir.display());

    let mut child = self
      .download_command(config, target_dir)
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()?;

    let (Some(stdout), Some(stderr)) =
      (child.stdout.take(), child.stderr.take())
    else {
      return Err(Error::Extraction("yt-dlp output not captured".into()));
    };

    let stdout = FramedRead::new(stdout, LossyLines::new(MAX_LINE_LENGTH))
      .map(|line| (Channel::Stdout, line));
    let stderr = FramedRead::new(stderr, LossyLines::new(MAX_LINE_LENGTH))
      .map(|line| (Channel::Stderr, line));
    let mut lines = futures::stream::select(stdout, stderr);

    let mut fetched = Fetched::default();
    let mut errors = Vec::new();

    while let Some((channel, line)) = lines.next().await {
      let line = match line {
        Ok(line) => line,
        Err(e) => {
          warn!("failed to read yt-dlp output: {e}");
          continue;
        }
      };

      if let Some(percent) = parse_progress(&line) {
        progress.report(percent);
      } else if let Some(meta) = parse_metadata(&line) {
        fetched = meta;
      } else if channel == Channel::Stderr && is_error(&line) {
        errors.push(line);
      } else {
        debug!("yt-dlp: {line}");
      }
    }

    let status = child.wait().await?;
    if !status.success() || !errors.is_empty() {
      let message = last_error(errors.iter().map(String::as_str))
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"));
      return Err(Error::Extraction(message));
    }

    Ok(fetched)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
  Stdout,
  Stderr,
}

/// Splits child output into lines without ever failing on content: invalid
/// UTF-8 is replaced and overlong lines are cut, so both pipes keep being
/// drained until the child exits.
struct LossyLines {
  max_length: usize,
  // inside an overlong line whose head was already emitted
  discarding: bool,
}

impl LossyLines {
  fn new(max_length: usize) -> Self {
    Self {
      max_length,
      discarding: false,
    }
  }

  fn line(&self, bytes: &[u8]) -> String {
    let bytes = &bytes[..bytes.len().min(self.max_length)];
    let line = String::from_utf8_lossy(bytes);
    line.trim_end_matches('\r').to_string()
  }
}

impl Decoder for LossyLines {
  type Item = String;
  type Error = io::Error;

  fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
    loop {
      match buf.iter().position(|b| *b == b'\n') {
        Some(pos) => {
          let chunk = buf.split_to(pos + 1);
          if std::mem::take(&mut self.discarding) {
            continue;
          }
          return Ok(Some(self.line(&chunk[..pos])));
        }
        None if buf.len() > self.max_length => {
          let chunk = buf.split();
          if self.discarding {
            return Ok(None);
          }
          self.discarding = true;
          return Ok(Some(self.line(&chunk)));
        }
        None => return Ok(None),
      }
    }
  }

  fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
    if let Some(line) = self.decode(buf)? {
      return Ok(Some(line));
    }
    if buf.is_empty() {
      return Ok(None);
    }

    let chunk = buf.split();
    if std::mem::take(&mut self.discarding) {
      return Ok(None);
    }
    Ok(Some(self.line(&chunk)))
  }
}

fn is_error(line: &str) -> bool {
  line.trim_start().starts_with("ERROR:")
}

fn last_error<'a>(lines: impl Iterator<Item = &'a str>) -> Option<String> {
  lines
    .filter(|l| is_error(l))
    .last()
    .map(|l| l.trim().to_string())
}

fn parse_progress(line: &str) -> Option<u8> {
  let pct = line
    .trim()
    .strip_prefix(PROGRESS_MARKER)?
    .trim()
    .trim_end_matches('%');
  let pct = pct.trim().parse::<f32>().ok()?;
  Some(pct.clamp(0.0, 100.0) as u8)
}

fn parse_metadata(line: &str) -> Option<Fetched> {
  #[derive(Deserialize)]
  struct Printed {
    title: Option<String>,
    duration: Option<f64>,
  }

  let line = line.trim();
  if !line.starts_with('{') {
    return None;
  }

  let printed: Printed = serde_json::from_str(line).ok()?;
  Some(Fetched {
    title: printed.title,
    duration: printed.duration,
  })
}
