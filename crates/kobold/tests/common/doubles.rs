//! Test doubles for the pipeline's external collaborators.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kobold::convert::{converted_path, ConvertError, Converter};
use kobold::metadata::{BookMetadata, Fingerprint, MetadataProvider, ProviderError};

/// Always answers with the same record.
pub struct StaticProvider {
    pub name: &'static str,
    pub meta: Option<BookMetadata>,
}

impl StaticProvider {
    pub fn new(name: &'static str, meta: BookMetadata) -> Self {
        Self {
            name,
            meta: Some(meta),
        }
    }
}

impl MetadataProvider for StaticProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn lookup(&self, _query: &Fingerprint) -> Result<Option<BookMetadata>, ProviderError> {
        Ok(self.meta.clone())
    }
}

/// Sleeps before answering, to exercise the provider timeout.
pub struct SlowProvider {
    pub delay: Duration,
    pub meta: BookMetadata,
}

impl MetadataProvider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    fn lookup(&self, _query: &Fingerprint) -> Result<Option<BookMetadata>, ProviderError> {
        std::thread::sleep(self.delay);
        Ok(Some(self.meta.clone()))
    }
}

/// "Converts" by copying the source to where kepubify would write.
#[derive(Default)]
pub struct CopyConverter {
    pub calls: AtomicUsize,
}

impl Converter for CopyConverter {
    fn convert(&self, source: &Path) -> Result<PathBuf, ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let out = converted_path(source);
        std::fs::copy(source, &out)?;
        Ok(out)
    }
}

pub struct FailingConverter;

impl Converter for FailingConverter {
    fn convert(&self, _source: &Path) -> Result<PathBuf, ConvertError> {
        Err(ConvertError::Failed {
            status: "exit status: 2".to_string(),
            stderr: "conversion tool busy".to_string(),
        })
    }
}
