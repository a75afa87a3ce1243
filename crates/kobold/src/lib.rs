pub mod config;
pub mod convert;
pub mod db;
pub mod embed;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metadata;
pub mod organizer;
pub mod pipeline;
pub mod sanitize;
pub mod service;
pub mod watcher;
pub mod worker;

pub use config::Config;
pub use error::{ConfigError, KoboldError, Result, StorageError, TemplateError, WatchError};
pub use jobs::{Job, JobError, JobStatus, JobStore};
pub use metadata::{BookMetadata, MetadataProvider, MetadataResolver};
pub use organizer::{Organizer, PathTemplate};
pub use pipeline::{Pipeline, PipelineConfig, PipelineContext};
pub use service::Service;
pub use watcher::{FileEvent, FileEventKind, WatchTarget, Watcher};
pub use worker::{Scheduler, WorkerPool};
