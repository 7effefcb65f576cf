use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::platform::{OutputFormat, Platform, Quality, TimeRange};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Queued,
  Running,
  Completed,
  Failed,
}

impl JobStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Failed)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
  ExtractionFailed,
  NoFileProduced,
  Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
  pub file_path: PathBuf,
  pub file_name: String,
  pub size: u64,
  pub title: Option<String>,
  pub duration: Option<f64>,
}

/// Failure as shown to users. The message is already redacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
  pub kind: ErrorKind,
  pub message: String,
}

impl JobError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }
}

/// What the caller asked for; fixed for the lifetime of the job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
  pub platform: Platform,
  pub source_url: String,
  pub quality: Quality,
  pub format: OutputFormat,
  pub section: Option<TimeRange>,
}

#[derive(Debug, Clone)]
pub struct Job {
  pub id: JobId,
  pub request: JobRequest,
  pub status: JobStatus,
  pub progress: u8,
  pub result: Option<JobResult>,
  pub error: Option<JobError>,
  pub created_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
}

// 100 is reserved for the completed transition
const MAX_RUNNING_PROGRESS: u8 = 99;

impl Job {
  pub fn new(id: JobId, request: JobRequest) -> Self {
    Self {
      id,
      request,
      status: JobStatus::Queued,
      progress: 0,
      result: None,
      error: None,
      created_at: Utc::now(),
      finished_at: None,
    }
  }

  pub fn start(&mut self) -> bool {
    if self.status != JobStatus::Queued {
      return false;
    }
    self.status = JobStatus::Running;
    true
  }

  /// Returns whether the stored progress changed.
  pub fn advance(&mut self, percent: u8) -> bool {
    if self.status != JobStatus::Running {
      return false;
    }
    let percent = percent.min(MAX_RUNNING_PROGRESS);
    if percent <= self.progress {
      return false;
    }
    self.progress = percent;
    true
  }

  pub fn complete(&mut self, result: JobResult) -> bool {
    if self.status != JobStatus::Running {
      return false;
    }
    self.status = JobStatus::Completed;
    self.progress = 100;
    self.result = Some(result);
    self.finished_at = Some(Utc::now());
    true
  }

  pub fn fail(&mut self, error: JobError) -> bool {
    if self.status.is_terminal() {
      return false;
    }
    self.status = JobStatus::Failed;
    self.error = Some(error);
    self.finished_at = Some(Utc::now());
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn job() -> Job {
    Job::new(
      Uuid::new_v4(),
      JobRequest {
        platform: Platform::YouTube,
        source_url: "https://youtu.be/abc".into(),
        quality: Quality::Best,
        format: OutputFormat::Mp4,
        section: None,
      },
    )
  }

  fn result() -> JobResult {
    JobResult {
      file_path: PathBuf::from("/tmp/x/video.mp4"),
      file_name: "video.mp4".into(),
      size: 3,
      title: None,
      duration: None,
    }
  }

  #[test]
  fn test_new_job_is_queued() {
    let job = job();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, 0);
    assert!(job.result.is_none() && job.error.is_none());
  }

  #[test]
  fn test_progress_only_moves_forward_while_running() {
    let mut job = job();
    assert!(!job.advance(10), "queued jobs don't take progress");

    assert!(job.start());
    assert!(job.advance(40));
    assert!(!job.advance(20));
    assert_eq!(job.progress, 40);

    job.advance(100);
    assert_eq!(job.progress, 99);
    assert_eq!(job.status, JobStatus::Running);
  }

  #[test]
  fn test_complete_sets_result_and_full_progress() {
    let mut job = job();
    assert!(!job.complete(result()), "must run before completing");
    job.start();
    assert!(job.complete(result()));
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.result, Some(result()));
    assert!(job.error.is_none());
    assert!(job.finished_at.is_some());
  }

  #[test]
  fn test_terminal_states_are_final() {
    let mut job = job();
    job.start();
    job.advance(30);
    assert!(job.fail(JobError::new(ErrorKind::Timeout, "timed out")));

    assert!(!job.start());
    assert!(!job.advance(80));
    assert!(!job.complete(result()));
    assert!(!job.fail(JobError::new(ErrorKind::ExtractionFailed, "again")));

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 30);
    assert!(job.result.is_none());
    assert_eq!(job.error.unwrap().kind, ErrorKind::Timeout);
  }

  #[test]
  fn test_queued_job_can_fail_directly() {
    let mut job = job();
    assert!(job.fail(JobError::new(ErrorKind::ExtractionFailed, "gone")));
    assert_eq!(job.status, JobStatus::Failed);
  }
}
