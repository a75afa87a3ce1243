use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info_span, warn};

use crate::jobs::{Job, JobStatus, JobStore, StoreError};
use crate::pipeline::{Pipeline, PipelineContext, StepOutcome};

/// What one tick did with the jobs it claimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub done: usize,
    pub retried: usize,
    pub failed: usize,
    pub removed: usize,
    /// Stopped between stages by shutdown; progress is committed.
    pub paused: usize,
    /// Handed back unprocessed because shutdown was requested.
    pub released: usize,
    /// Another worker took the job over after our lease expired.
    pub lost: usize,
}

/// One worker loop instance: claims a batch, drives each job, commits.
pub struct Scheduler {
    store: JobStore,
    pipeline: Arc<Pipeline>,
    owner: String,
    batch_size: u32,
    lease: chrono::Duration,
}

impl Scheduler {
    pub fn new(
        store: JobStore,
        pipeline: Arc<Pipeline>,
        owner: impl Into<String>,
        batch_size: u32,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            pipeline,
            owner: owner.into(),
            batch_size,
            lease: chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::minutes(15)),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Claims up to `batch_size` eligible jobs and processes them. Stage
    /// failures are recorded on the job, never returned; only a failing
    /// claim is an error.
    pub fn tick(&self, shutdown: &AtomicBool) -> Result<TickSummary, StoreError> {
        let _tick = info_span!("tick", owner = %self.owner).entered();

        let jobs = self.store.claim_next(&self.owner, self.batch_size, self.lease)?;
        let mut summary = TickSummary {
            claimed: jobs.len(),
            ..Default::default()
        };

        for mut job in jobs {
            if shutdown.load(Ordering::Relaxed) {
                if let Err(e) = self.store.release(&mut job) {
                    warn!(job_id = %job.id, error = %e, "Could not release lease");
                }
                summary.released += 1;
                continue;
            }
            self.process(job, shutdown, &mut summary);
        }

        if summary.claimed > 0 {
            debug!(?summary, "Tick finished");
        }
        Ok(summary)
    }

    fn process(&self, job: Job, shutdown: &AtomicBool, summary: &mut TickSummary) {
        let mut ctx = PipelineContext::new(job);
        let mut lease_lost = false;

        let outcome = self.pipeline.run(&mut ctx, |ctx| {
            match self.store.checkpoint(&mut ctx.job, self.lease) {
                Ok(()) => !shutdown.load(Ordering::Relaxed),
                Err(StoreError::LeaseLost { .. }) => {
                    lease_lost = true;
                    false
                }
                Err(e) => {
                    warn!(job_id = %ctx.job.id, error = %e, "Checkpoint failed");
                    false
                }
            }
        });

        if lease_lost {
            warn!(job_id = %ctx.job.id, "Lease lost mid-run, dropping local progress");
            summary.lost += 1;
            return;
        }

        let mut job = ctx.into_job();
        match self.store.commit(&mut job) {
            Ok(()) => match job.status {
                JobStatus::Done => summary.done += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Removed => summary.removed += 1,
                _ if outcome == StepOutcome::Retry => summary.retried += 1,
                _ => summary.paused += 1,
            },
            Err(StoreError::LeaseLost { id }) => {
                warn!(job_id = %id, "Lease lost before commit");
                summary.lost += 1;
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Commit failed, lease will expire"),
        }
    }
}
