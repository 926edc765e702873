//! Represents a single download+upload request and its progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of a job.
///
/// Statuses only move forward: `Pending → Downloading → Uploading → Complete`,
/// with `Failed` reachable from any non-terminal state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Uploading,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Uploading => "uploading",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Downloading => 1,
            JobStatus::Uploading => 2,
            JobStatus::Complete | JobStatus::Failed => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == JobStatus::Failed || next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened to the finished file on the client side.
///
/// Tracked apart from `JobStatus` so a delivered job still reads `complete`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Not fetched yet.
    #[default]
    Ready,
    /// A request is streaming the file right now.
    Delivering,
    /// Fetched once without removal; may be fetched again.
    Downloaded,
    /// Fetched and removed, locally and remotely.
    Delivered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Ready => "ready",
            DeliveryState::Delivering => "delivering",
            DeliveryState::Downloaded => "downloaded",
            DeliveryState::Delivered => "delivered",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("job status cannot move from `{from}` to `{to}`")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One client-initiated download (and optional upload).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Job {
    /// Unique job identifier returned to the client.
    pub id: Uuid,

    /// Source URL of the video.
    pub url: String,

    /// Format preset key handed to the downloader.
    pub format: String,

    /// Drive folder the result is uploaded into, if any.
    pub folder_id: Option<String>,

    /// Whether the uploaded object should be readable by anyone with the link.
    pub share_public: bool,

    pub status: JobStatus,

    #[serde(default)]
    pub delivery: DeliveryState,

    /// ffmpeg directory requested for this job, overriding the configured one.
    pub ffmpeg_location: Option<PathBuf>,

    /// Local path of the downloaded file once known.
    pub output_file: Option<PathBuf>,

    pub file_name: Option<String>,

    pub size_bytes: Option<u64>,

    /// Shareable link (Drive view link, or the local file URL when uploads are off).
    pub link: Option<String>,

    /// Direct download link on the storage provider.
    pub download_link: Option<String>,

    pub remote_file_id: Option<String>,

    /// Set when the upload succeeded but public sharing did not.
    pub warning: Option<String>,

    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        url: impl Into<String>,
        format: impl Into<String>,
        folder_id: Option<String>,
        share_public: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            format: format.into(),
            folder_id,
            share_public,
            status: JobStatus::Pending,
            delivery: DeliveryState::Ready,
            ffmpeg_location: None,
            output_file: None,
            file_name: None,
            size_bytes: None,
            link: None,
            download_link: None,
            remote_file_id: None,
            warning: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the job to `next`, rejecting any regression.
    pub fn advance(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Mark the job failed with `message`. No-op once the job is terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.advance(JobStatus::Failed).is_ok() {
            self.error = Some(message.into());
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
