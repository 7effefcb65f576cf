use std::{fmt, str::FromStr, sync::LazyLock};

use rand::seq::SliceRandom;
use regex::{Regex, RegexSet};

use crate::{config::ClientTuning, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Platform {
  YouTube,
  Instagram,
  Facebook,
  TikTok,
  Twitch,
}

impl Platform {
  pub const ALL: [Platform; 5] = [
    Platform::YouTube,
    Platform::Instagram,
    Platform::Facebook,
    Platform::TikTok,
    Platform::Twitch,
  ];

  fn profile(self) -> &'static Profile {
    match self {
      Platform::YouTube => &YOUTUBE,
      Platform::Instagram => &INSTAGRAM,
      Platform::Facebook => &FACEBOOK,
      Platform::TikTok => &TIKTOK,
      Platform::Twitch => &TWITCH,
    }
  }

  pub fn name(self) -> &'static str {
    self.profile().name
  }

  /// Syntactic check of the url shape. Does not touch the network.
  pub fn validate(self, url: &str) -> bool {
    self.profile().patterns.is_match(url.trim())
  }

  /// Translate a request into the options handed to the extraction client.
  ///
  /// Deterministic for identical inputs except for the user agent, which is
  /// picked from a per-platform pool.
  pub fn build_config(
    self,
    url: &str,
    quality: &Quality,
    format: OutputFormat,
    tuning: &ClientTuning,
  ) -> ClientConfig {
    let profile = self.profile();

    let format_selector = if format.is_audio() {
      "bestaudio/best".to_string()
    } else {
      (profile.selector)(quality)
    };

    let user_agent = profile
      .user_agents
      .choose(&mut rand::thread_rng())
      .copied()
      .unwrap_or(DESKTOP_UA);

    let mut headers = vec![("User-Agent".to_string(), user_agent.to_string())];
    headers.extend(
      profile
        .headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string())),
    );

    ClientConfig {
      url: url.trim().to_string(),
      format_selector,
      headers,
      output: format,
      tuning: tuning.clone(),
      section: None,
    }
  }

  /// Listing url of a Twitch user's past broadcasts.
  pub fn twitch_videos_url(user: &str) -> Result<String> {
    static USER: LazyLock<Regex> =
      LazyLock::new(|| Regex::new(r"^\w{3,25}$").unwrap());

    let user = user.trim();
    if !USER.is_match(user) {
      return Err(Error::BadRequest(format!("invalid twitch user: {user}")));
    }
    Ok(format!("https://www.twitch.tv/{user}/videos"))
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Platform {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let wanted = s.trim();
    Platform::ALL
      .into_iter()
      .find(|p| p.name().eq_ignore_ascii_case(wanted))
      .ok_or_else(|| Error::UnsupportedPlatform(wanted.to_string()))
  }
}

/// Requested video quality. Unknown values fall back to `Best`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
  #[default]
  Best,
  Worst,
  /// maximum frame height, from values like `720p`
  Height(u32),
}

impl Quality {
  pub fn parse(s: &str) -> Self {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
      "worst" => Quality::Worst,
      _ => s
        .strip_suffix('p')
        .and_then(|h| h.parse::<u32>().ok())
        .filter(|h| *h > 0)
        .map_or(Quality::Best, Quality::Height),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
  #[default]
  Mp4,
  Webm,
  Mkv,
  Mp3,
  M4a,
}

impl OutputFormat {
  pub fn is_audio(self) -> bool {
    matches!(self, OutputFormat::Mp3 | OutputFormat::M4a)
  }

  pub fn extension(self) -> &'static str {
    match self {
      OutputFormat::Mp4 => "mp4",
      OutputFormat::Webm => "webm",
      OutputFormat::Mkv => "mkv",
      OutputFormat::Mp3 => "mp3",
      OutputFormat::M4a => "m4a",
    }
  }
}

impl FromStr for OutputFormat {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "mp4" => Ok(OutputFormat::Mp4),
      "webm" => Ok(OutputFormat::Webm),
      "mkv" => Ok(OutputFormat::Mkv),
      "mp3" => Ok(OutputFormat::Mp3),
      "m4a" => Ok(OutputFormat::M4a),
      other => Err(Error::UnsupportedFormat(other.to_string())),
    }
  }
}

/// Part of a video to download, in whole seconds from the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
  pub start: u64,
  pub end: u64,
}

impl TimeRange {
  /// Parses `start` and `end` given as `HH:MM:SS` or `MM:SS`. The end must
  /// come after the start.
  pub fn parse(start: &str, end: &str) -> Result<Self> {
    let seconds = |s: &str| {
      parse_timestamp(s)
        .ok_or_else(|| Error::InvalidRange(format!("bad timestamp: {s}")))
    };

    let range = Self {
      start: seconds(start)?,
      end: seconds(end)?,
    };
    if range.end <= range.start {
      return Err(Error::InvalidRange(format!(
        "end {end} is not after start {start}"
      )));
    }
    Ok(range)
  }
}

fn parse_timestamp(s: &str) -> Option<u64> {
  let parts = s
    .trim()
    .split(':')
    .map(|p| p.parse::<u64>().ok())
    .collect::<Option<Vec<_>>>()?;

  match parts[..] {
    [m, s] if s < 60 => Some(m * 60 + s),
    [h, m, s] if m < 60 && s < 60 => Some(h * 3600 + m * 60 + s),
    _ => None,
  }
}

/// Everything the extraction client needs to fetch one url.
#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub url: String,
  pub format_selector: String,
  pub headers: Vec<(String, String)>,
  pub output: OutputFormat,
  pub tuning: ClientTuning,
  /// only download this part of the video
  pub section: Option<TimeRange>,
}

impl ClientConfig {
  pub fn with_section(mut self, section: Option<TimeRange>) -> Self {
    self.section = section;
    self
  }
}

struct Profile {
  name: &'static str,
  patterns: LazyLock<RegexSet>,
  user_agents: &'static [&'static str],
  headers: &'static [(&'static str, &'static str)],
  selector: fn(&Quality) -> String,
}

const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
  AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const ROTATING_UAS: &[&str] = &[
  DESKTOP_UA,
  "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
   (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
  "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
   (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
  "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) \
   AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 \
   Safari/604.1",
];

const BROWSER_HEADERS: &[(&str, &str)] = &[
  (
    "Accept",
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
  ),
  ("Accept-Language", "en-US,en;q=0.9"),
];

fn patterns(list: &[&str]) -> RegexSet {
  let anchored = list.iter().map(|p| format!("(?i)^https?://{p}"));
  RegexSet::new(anchored).expect("invalid url pattern")
}

fn youtube_selector(quality: &Quality) -> String {
  match quality {
    Quality::Best => "best[height>=720]/bestvideo+bestaudio/best".into(),
    Quality::Worst => "worst".into(),
    Quality::Height(h) => {
      format!("best[height<={h}]/bestvideo[height<={h}]+bestaudio/best")
    }
  }
}

fn twitch_selector(quality: &Quality) -> String {
  match quality {
    Quality::Height(h) => {
      format!("best[height<={h}][ext=mp4]/best[height<={h}]/best")
    }
    Quality::Worst => "worst".into(),
    Quality::Best => "best[ext=mp4]/best".into(),
  }
}

fn original_selector(_: &Quality) -> String {
  "best".into()
}

static YOUTUBE: Profile = Profile {
  name: "YouTube",
  patterns: LazyLock::new(|| {
    patterns(&[
      r"(www\.|m\.|music\.)?youtube\.com/watch\?([^#]*&)?v=[\w-]+",
      r"youtu\.be/[\w-]+",
      r"(www\.|m\.)?youtube\.com/(shorts|live|embed)/[\w-]+",
    ])
  }),
  user_agents: ROTATING_UAS,
  headers: BROWSER_HEADERS,
  selector: youtube_selector,
};

static INSTAGRAM: Profile = Profile {
  name: "Instagram",
  patterns: LazyLock::new(|| {
    patterns(&[
      r"(www\.)?instagram\.com/(p|reel|reels|tv)/[\w-]+",
      r"(www\.)?instagram\.com/stories/[\w.-]+/\d+",
    ])
  }),
  user_agents: &[DESKTOP_UA],
  headers: BROWSER_HEADERS,
  selector: original_selector,
};

static FACEBOOK: Profile = Profile {
  name: "Facebook",
  patterns: LazyLock::new(|| {
    patterns(&[
      r"(www\.|m\.|web\.)?facebook\.com/[\w.-]+/videos/([\w.-]+/)?\d+",
      r"(www\.|m\.)?facebook\.com/watch/?\?([^#]*&)?v=\d+",
      r"(www\.|m\.)?facebook\.com/reel/\d+",
      r"(www\.|m\.)?facebook\.com/(story|permalink)\.php\?",
      r"fb\.watch/[\w-]+",
    ])
  }),
  user_agents: &[DESKTOP_UA],
  headers: BROWSER_HEADERS,
  selector: original_selector,
};

static TIKTOK: Profile = Profile {
  name: "TikTok",
  patterns: LazyLock::new(|| {
    patterns(&[
      r"(www\.|m\.)?tiktok\.com/@[\w.-]+/video/\d+",
      r"(vm|vt)\.tiktok\.com/[\w-]+",
      r"(www\.)?tiktok\.com/t/[\w-]+",
    ])
  }),
  user_agents: &[DESKTOP_UA],
  headers: BROWSER_HEADERS,
  selector: original_selector,
};

static TWITCH: Profile = Profile {
  name: "Twitch",
  patterns: LazyLock::new(|| {
    patterns(&[
      r"(www\.|m\.)?twitch\.tv/videos/\d+",
      r"clips\.twitch\.tv/[\w-]+",
      r"(www\.|m\.)?twitch\.tv/\w+/clip/[\w-]+",
      // live channel
      r"(www\.|m\.)?twitch\.tv/\w{4,25}/?(\?.*)?$",
    ])
  }),
  user_agents: &[DESKTOP_UA],
  headers: &[],
  selector: twitch_selector,
};
