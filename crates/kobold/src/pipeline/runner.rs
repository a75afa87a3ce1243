use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};

use crate::convert::{
    converted_path, needs_conversion, verify_conversion, Converter, KepubifyConverter,
};
use crate::embed::{Embedder, OpfEmbedder};
use crate::error::StorageError;
use crate::jobs::{content_hash, retry_delay, ErrorKind, Job, JobError, JobStatus};
use crate::metadata::{
    file_stem, AmazonProvider, EmbeddedProvider, GoodreadsProvider, MetadataProvider,
    MetadataResolver,
};
use crate::organizer::Organizer;
use crate::sanitize;

use super::config::PipelineConfig;
use super::context::PipelineContext;
use super::error::{PipelineError, PipelineWarning};

/// Result of driving a job one status forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The job moved to its next status, possibly `Done`.
    Advanced,
    /// The job is re-queued after a backoff, because its stage failed or
    /// only a metadata rewrite is still owed.
    Retry,
    /// The job is terminal and nothing was done.
    Stopped,
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    resolver: MetadataResolver,
    converter: Arc<dyn Converter>,
    embedder: Arc<dyn Embedder>,
    organizer: Organizer,
}

impl Pipeline {
    /// Production constructor: builds every collaborator from config.
    pub fn from_config(config: Arc<PipelineConfig>) -> Self {
        let mut external: Vec<Arc<dyn MetadataProvider>> = Vec::new();
        if config.fetch_external {
            match AmazonProvider::new(
                &config.amazon_domain,
                config.amazon_cookie.clone(),
                config.provider_timeout,
            ) {
                Ok(provider) => external.push(Arc::new(provider)),
                Err(e) => warn!("Amazon lookups disabled: {}", e),
            }
            match GoodreadsProvider::new(config.provider_timeout) {
                Ok(provider) => external.push(Arc::new(provider)),
                Err(e) => warn!("Goodreads lookups disabled: {}", e),
            }
        }
        let resolver = MetadataResolver::new(
            Arc::new(EmbeddedProvider::new()),
            external,
            config.fetch_external,
            config.provider_timeout,
        );
        let converter = Arc::new(KepubifyConverter::new(
            config.kepubify_path.clone(),
            config.convert_timeout,
        ));

        Self::new(config, resolver, converter, Arc::new(OpfEmbedder::new()))
    }

    /// Injects specific collaborators.
    pub fn new(
        config: Arc<PipelineConfig>,
        resolver: MetadataResolver,
        converter: Arc<dyn Converter>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let organizer = Organizer::new(config.library_root.clone(), config.template.clone());
        Self {
            config,
            resolver,
            converter,
            embedder,
            organizer,
        }
    }

    /// Drives the job forward until it is terminal or a stage asks for a
    /// retry. `on_advance` runs after every non-terminal advance, typically
    /// to checkpoint; returning `false` stops the run early.
    pub fn run<F>(&self, ctx: &mut PipelineContext, mut on_advance: F) -> StepOutcome
    where
        F: FnMut(&mut PipelineContext) -> bool,
    {
        let filename = sanitize::redact_path(&ctx.job.source_path);
        let _pipeline_span = info_span!("pipeline",
            job_id = %ctx.job.id,
            filename = %filename,
        )
        .entered();

        let mut outcome = StepOutcome::Stopped;
        while !ctx.job.status.is_terminal() {
            outcome = self.step(ctx, Utc::now());
            if outcome != StepOutcome::Advanced || ctx.job.status.is_terminal() {
                break;
            }
            if !on_advance(ctx) {
                debug!(status = %ctx.job.status, "Run interrupted");
                break;
            }
        }

        if ctx.job.status == JobStatus::Done {
            info!(path = %sanitize::redact_path(&ctx.job.source_path), "Job done");
        }
        outcome
    }

    /// Performs the work of the job's current status and moves it on.
    pub fn step(&self, ctx: &mut PipelineContext, now: DateTime<Utc>) -> StepOutcome {
        let status = ctx.job.status;
        if status.is_terminal() {
            return StepOutcome::Stopped;
        }
        if status != JobStatus::OrganizePending && !ctx.job.source_path.exists() {
            if status == JobStatus::ConversionPending && self.recover_conversion(ctx) {
                ctx.job.advance(JobStatus::Converted, now);
                return StepOutcome::Advanced;
            }
            let path = ctx.job.source_path.clone();
            return self.fail(ctx, PipelineError::SourceMissing(path), now);
        }

        let next = match status {
            JobStatus::Detected => JobStatus::MetadataPending,
            JobStatus::MetadataPending => {
                let _step = info_span!("metadata").entered();
                self.step_metadata(ctx);
                JobStatus::MetadataResolved
            }
            JobStatus::MetadataResolved => self.after_metadata(&ctx.job),
            JobStatus::ConversionPending => {
                let _step = info_span!("convert").entered();
                if let Err(e) = self.step_convert(ctx) {
                    return self.fail(ctx, e, now);
                }
                JobStatus::Converted
            }
            JobStatus::Converted => self.after_conversion(&ctx.job),
            JobStatus::EmbedPending => {
                let _step = info_span!("embed").entered();
                self.step_embed(ctx);
                JobStatus::Embedded
            }
            JobStatus::Embedded => self.after_embed(&ctx.job),
            JobStatus::OrganizePending => {
                let _step = info_span!("organize").entered();
                match self.step_organize(ctx) {
                    Ok(next) => next,
                    Err(e) => return self.fail(ctx, e, now),
                }
            }
            JobStatus::EmbedRetry => {
                let _step = info_span!("embed", retry = ctx.job.embed_failures).entered();
                if !self.step_embed(ctx) && !ctx.job.embed_owed() {
                    warn!(attempts = ctx.job.embed_failures, "Giving up on embedding metadata");
                }
                self.finish(&ctx.job)
            }
            JobStatus::Done | JobStatus::Failed | JobStatus::Removed => {
                return StepOutcome::Stopped
            }
        };

        debug!(from = %status, to = %next, "Advancing job");
        ctx.job.advance(next, now);
        if next == JobStatus::EmbedRetry {
            ctx.job.not_before = Some(now + retry_delay(ctx.job.embed_failures));
            return StepOutcome::Retry;
        }
        StepOutcome::Advanced
    }

    fn after_metadata(&self, job: &Job) -> JobStatus {
        if self.config.convert_epub && needs_conversion(&job.source_path) {
            JobStatus::ConversionPending
        } else {
            self.after_conversion(job)
        }
    }

    fn after_conversion(&self, job: &Job) -> JobStatus {
        if self.config.embed_metadata {
            JobStatus::EmbedPending
        } else {
            self.after_embed(job)
        }
    }

    fn after_embed(&self, job: &Job) -> JobStatus {
        if self.config.organize {
            JobStatus::OrganizePending
        } else {
            self.finish(job)
        }
    }

    /// The end of the line, unless a failed metadata rewrite is still owed.
    fn finish(&self, job: &Job) -> JobStatus {
        if job.embed_owed() {
            JobStatus::EmbedRetry
        } else {
            JobStatus::Done
        }
    }

    fn step_metadata(&self, ctx: &mut PipelineContext) {
        let resolution = self.resolver.resolve(&ctx.job.source_path);
        for warning in resolution.warnings {
            warn!(%warning, "Metadata resolution degraded");
            ctx.warnings.push(warning);
        }

        let mut meta = resolution.metadata.unwrap_or_default().normalized();
        if meta.title.is_none() {
            meta.title = file_stem(&ctx.job.source_path);
        }
        debug!(
            title = meta.title.as_deref().unwrap_or_default(),
            author = meta.author.as_deref().unwrap_or_default(),
            "Metadata resolved"
        );
        ctx.job.metadata = Some(meta);
    }

    /// Deletes the original only after the output has been verified.
    fn step_convert(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let source = ctx.job.source_path.clone();
        let output = self.converter.convert(&source)?;
        if let Err(e) = verify_conversion(&output) {
            if output != source {
                let _ = std::fs::remove_file(&output);
            }
            return Err(e.into());
        }

        if self.config.delete_original {
            std::fs::remove_file(&source).map_err(|e| StorageError::RemoveFile {
                path: source.clone(),
                source: e,
            })?;
            info!(
                original = %sanitize::redact_path(&source),
                "Original removed after conversion"
            );
            ctx.job.source_path = output;
            ctx.job.kepub_path = None;
            ctx.job.content_hash = content_hash(&ctx.job.source_path)?;
        } else {
            ctx.job.kepub_path = Some(output);
        }
        Ok(())
    }

    /// The original was deleted after a verified conversion but the job
    /// still points at it: a crash hit before the converted file was
    /// recorded. Adopts the output if it is still intact.
    fn recover_conversion(&self, ctx: &mut PipelineContext) -> bool {
        if !self.config.delete_original {
            return false;
        }
        let output = converted_path(&ctx.job.source_path);
        if verify_conversion(&output).is_err() {
            return false;
        }
        let Ok(hash) = content_hash(&output) else {
            return false;
        };

        info!(
            output = %sanitize::redact_path(&output),
            "Recovered converted file of an interrupted run"
        );
        ctx.job.source_path = output;
        ctx.job.kepub_path = None;
        ctx.job.content_hash = hash;
        true
    }

    /// Best effort: a failure is recorded for a later retry and never
    /// blocks organizing. Returns whether every target was rewritten.
    fn step_embed(&self, ctx: &mut PipelineContext) -> bool {
        let Some(meta) = ctx.job.metadata.clone() else {
            return true;
        };

        let mut targets = vec![ctx.job.source_path.clone()];
        targets.extend(ctx.job.kepub_path.clone().filter(|k| k.exists()));
        let mut failure = None;
        for path in targets {
            if let Err(e) = self.embedder.embed(&path, &meta) {
                let warning = PipelineWarning::from_embed(&path, &e);
                warn!(%warning, "Metadata not embedded");
                if matches!(warning, PipelineWarning::EmbedFailed { .. }) {
                    failure = Some(warning.to_string());
                }
                ctx.warnings.push(warning);
            }
        }

        let embedded = match failure {
            Some(message) => {
                ctx.job.record_embed_failure(JobError::new(ErrorKind::Embed, message));
                false
            }
            None => {
                ctx.job.embed_failures = 0;
                if ctx.job.last_error.as_ref().is_some_and(|e| e.kind == ErrorKind::Embed) {
                    ctx.job.last_error = None;
                }
                true
            }
        };

        // The rewrite changes the bytes; keep the recorded hash current so
        // the watcher's echo of it is recognised as the same content.
        match content_hash(&ctx.job.source_path) {
            Ok(hash) => ctx.job.content_hash = hash,
            Err(e) => warn!(error = %e, "Could not rehash after embedding"),
        }
        embedded
    }

    fn step_organize(&self, ctx: &mut PipelineContext) -> Result<JobStatus, PipelineError> {
        let organized = self.organizer.organize(&ctx.job)?;
        ctx.warnings.extend(organized.warnings);
        if organized.duplicate {
            info!(
                existing = %sanitize::redact_path(&organized.path),
                "Duplicate of a book already in the library"
            );
            return Ok(JobStatus::Removed);
        }
        ctx.job.source_path = organized.path;
        ctx.job.kepub_path = organized.kepub_path;
        Ok(self.finish(&ctx.job))
    }

    fn fail(&self, ctx: &mut PipelineContext, err: PipelineError, now: DateTime<Utc>) -> StepOutcome {
        let job_error = err.to_job_error();

        if job_error.kind == ErrorKind::SourceMissing {
            warn!(error = %err, "Source file vanished, cancelling job");
            ctx.job.status = JobStatus::Removed;
            ctx.job.not_before = None;
            ctx.job.last_error = Some(job_error);
            return StepOutcome::Stopped;
        }

        let stage = ctx.job.status;
        if ctx.job.record_failure(job_error, now) {
            error!(stage = %stage, attempts = ctx.job.attempt, error = %err, "Job failed");
            StepOutcome::Stopped
        } else {
            warn!(stage = %stage, attempt = ctx.job.attempt, error = %err, "Stage failed, will retry");
            StepOutcome::Retry
        }
    }
}
