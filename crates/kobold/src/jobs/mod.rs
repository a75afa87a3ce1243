//! Jobs: one tracked e-book file and its position in the pipeline.

pub mod hash;
pub mod store;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::BookMetadata;

pub use hash::content_hash;
pub use store::{JobStore, StoreError};

/// Retries allowed per stage. A stage runs at most `RETRY_CEILING + 1` times.
pub const RETRY_CEILING: u32 = 3;

/// Delay before the first retry, in seconds; doubles with every further attempt.
pub const RETRY_BASE_DELAY_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Detected,
    MetadataPending,
    MetadataResolved,
    ConversionPending,
    Converted,
    EmbedPending,
    Embedded,
    OrganizePending,
    /// Everything else finished; only a failed metadata rewrite is retried.
    EmbedRetry,
    Done,
    Failed,
    /// The file was deleted from a watched directory.
    Removed,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 3] = [JobStatus::Done, JobStatus::Failed, JobStatus::Removed];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::MetadataPending => "metadata_pending",
            Self::MetadataResolved => "metadata_resolved",
            Self::ConversionPending => "conversion_pending",
            Self::Converted => "converted",
            Self::EmbedPending => "embed_pending",
            Self::Embedded => "embedded",
            Self::OrganizePending => "organize_pending",
            Self::EmbedRetry => "embed_retry",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "detected" => Self::Detected,
            "metadata_pending" => Self::MetadataPending,
            "metadata_resolved" => Self::MetadataResolved,
            "conversion_pending" => Self::ConversionPending,
            "converted" => Self::Converted,
            "embed_pending" => Self::EmbedPending,
            "embedded" => Self::Embedded,
            "organize_pending" => Self::OrganizePending,
            "embed_retry" => Self::EmbedRetry,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "removed" => Self::Removed,
            other => return Err(format!("unknown job status '{}'", other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Metadata,
    Conversion,
    Embed,
    Organize,
    SourceMissing,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Conversion => "conversion",
            Self::Embed => "embed",
            Self::Organize => "organize",
            Self::SourceMissing => "source_missing",
            Self::Io => "io",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "metadata" => Self::Metadata,
            "conversion" => Self::Conversion,
            "embed" => Self::Embed,
            "organize" => Self::Organize,
            "source_missing" => Self::SourceMissing,
            "io" => Self::Io,
            other => return Err(format!("unknown error kind '{}'", other)),
        })
    }
}

/// Last failure recorded on a job.
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

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub source_path: PathBuf,
    pub content_hash: String,
    pub status: JobStatus,
    pub metadata: Option<BookMetadata>,
    pub attempt: u32,
    pub last_error: Option<JobError>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be claimed again after a failed stage.
    pub not_before: Option<DateTime<Utc>>,
    /// Converted companion file, when the original was kept.
    pub kepub_path: Option<PathBuf>,
    /// Failed metadata rewrites since the last successful one. Tracked apart
    /// from `attempt` because embedding never holds the job back.
    pub embed_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn detected(source_path: PathBuf, content_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_path,
            content_hash,
            status: JobStatus::Detected,
            metadata: None,
            attempt: 0,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            not_before: None,
            kepub_path: None,
            embed_failures: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|exp| exp > now)
    }

    /// Moves to the next status after a stage succeeded.
    pub fn advance(&mut self, next: JobStatus, now: DateTime<Utc>) {
        self.status = next;
        self.attempt = 0;
        self.not_before = None;
        if next == JobStatus::Done {
            self.completed_at = Some(now);
        }
    }

    /// Records a stage failure. The stage is re-queued with exponential
    /// backoff until the retry ceiling is exceeded, then the job fails.
    /// Returns true if the job is now `Failed`.
    pub fn record_failure(&mut self, error: JobError, now: DateTime<Utc>) -> bool {
        self.attempt += 1;
        self.last_error = Some(error);
        if self.attempt > RETRY_CEILING {
            self.status = JobStatus::Failed;
            self.not_before = None;
            true
        } else {
            self.not_before = Some(now + retry_delay(self.attempt));
            false
        }
    }

    /// Records a failed metadata rewrite. Returns whether another attempt is
    /// still allowed.
    pub fn record_embed_failure(&mut self, error: JobError) -> bool {
        self.embed_failures += 1;
        self.last_error = Some(error);
        self.embed_failures <= RETRY_CEILING
    }

    /// Whether a failed rewrite is waiting for another attempt.
    pub fn embed_owed(&self) -> bool {
        (1..=RETRY_CEILING).contains(&self.embed_failures)
    }

    /// Resets a job to the start of the pipeline after its content changed.
    pub fn redetect(&mut self, content_hash: String) {
        self.content_hash = content_hash;
        self.status = JobStatus::Detected;
        self.metadata = None;
        self.attempt = 0;
        self.last_error = None;
        self.not_before = None;
        self.kepub_path = None;
        self.embed_failures = 0;
        self.completed_at = None;
    }
}

/// Backoff before retry number `attempt` (1-based): 10s, 20s, 40s, ...
pub fn retry_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::seconds(RETRY_BASE_DELAY_SECS << exponent)
}

/// Fixed-width UTC timestamps so lexical order matches time order in SQL.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
