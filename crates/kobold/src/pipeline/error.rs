use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::convert::ConvertError;
use crate::embed::EmbedError;
use crate::jobs::{ErrorKind, JobError};
use crate::organizer::OrganizeError;

/// A stage failure. Every variant maps onto the `JobError` persisted on
/// the job.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConvertError),

    #[error("Organizing failed: {0}")]
    Organize(#[from] OrganizeError),

    #[error("Source file is gone: {0}")]
    SourceMissing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] crate::error::StorageError),
}

impl PipelineError {
    pub fn to_job_error(&self) -> JobError {
        let kind = match self {
            Self::Conversion(_) => ErrorKind::Conversion,
            Self::Organize(OrganizeError::SourceMissing(_)) | Self::SourceMissing(_) => {
                ErrorKind::SourceMissing
            }
            Self::Organize(_) => ErrorKind::Organize,
            Self::Io(_) => ErrorKind::Io,
        };
        JobError::new(kind, self.to_string())
    }
}

/// Non-fatal conditions recorded while a job moves through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineWarning {
    ProviderFailed { provider: String, error: String },
    ProviderTimeout { provider: String, after: Duration },
    EmbedFailed { path: PathBuf, error: String },
    EmbedSkipped { path: PathBuf },
    CompanionMoveFailed { path: PathBuf, error: String },
}

impl PipelineWarning {
    pub fn from_embed(path: &std::path::Path, error: &EmbedError) -> Self {
        match error {
            EmbedError::Unsupported(_) => Self::EmbedSkipped {
                path: path.to_path_buf(),
            },
            other => Self::EmbedFailed {
                path: path.to_path_buf(),
                error: other.to_string(),
            },
        }
    }
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderFailed { provider, error } => {
                write!(f, "provider '{}' failed: {}", provider, error)
            }
            Self::ProviderTimeout { provider, after } => {
                write!(f, "provider '{}' timed out after {:?}", provider, after)
            }
            Self::EmbedFailed { path, error } => {
                write!(f, "embedding into {} failed: {}", path.display(), error)
            }
            Self::EmbedSkipped { path } => {
                write!(f, "embedding skipped for {}", path.display())
            }
            Self::CompanionMoveFailed { path, error } => {
                write!(f, "could not move companion {}: {}", path.display(), error)
            }
        }
    }
}
