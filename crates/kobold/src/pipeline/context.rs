use crate::jobs::Job;

use super::error::PipelineWarning;

/// A claimed job plus everything gathered while driving it.
pub struct PipelineContext {
    pub job: Job,

    // Non-fatal warnings
    pub warnings: Vec<PipelineWarning>,
}

impl PipelineContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            warnings: Vec::new(),
        }
    }

    pub fn into_job(self) -> Job {
        self.job
    }
}
