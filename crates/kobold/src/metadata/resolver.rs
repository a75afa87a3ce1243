use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, info_span, warn};

use super::{BookMetadata, Fingerprint, MetadataProvider, ProviderError};
use crate::pipeline::PipelineWarning;

/// Outcome of one resolution. `metadata` is `None` when no provider found
/// anything, which is not an error.
#[derive(Debug, Default)]
pub struct Resolution {
    pub metadata: Option<BookMetadata>,
    pub warnings: Vec<PipelineWarning>,
}

/// Queries the embedded provider, then each external provider in priority
/// order, merging field by field. The first provider to supply a field wins.
pub struct MetadataResolver {
    embedded: Arc<dyn MetadataProvider>,
    external: Vec<Arc<dyn MetadataProvider>>,
    fetch_external: bool,
    timeout: Duration,
}

impl MetadataResolver {
    pub fn new(
        embedded: Arc<dyn MetadataProvider>,
        external: Vec<Arc<dyn MetadataProvider>>,
        fetch_external: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            embedded,
            external,
            fetch_external,
            timeout,
        }
    }

    pub fn resolve(&self, path: &Path) -> Resolution {
        let mut resolution = Resolution::default();
        let mut merged = BookMetadata::default();
        let mut found = false;

        let embedded = Fingerprint::for_file(path);
        if let Some(meta) = self.call(&self.embedded, embedded, &mut resolution.warnings) {
            found |= merged.fill_from(&meta) > 0;
        }

        if self.fetch_external {
            for provider in &self.external {
                let query = Fingerprint::for_file(path).with_known(&merged);
                if let Some(meta) = self.call(provider, query, &mut resolution.warnings) {
                    let filled = merged.fill_from(&meta);
                    debug!(provider = provider.name(), filled, "Merged provider fields");
                    found |= filled > 0;
                }
            }
        }

        resolution.metadata = found.then_some(merged);
        resolution
    }

    /// Runs one provider call on its own thread, bounded by the timeout. A
    /// call that overruns is abandoned; its eventual result is discarded.
    fn call(
        &self,
        provider: &Arc<dyn MetadataProvider>,
        query: Fingerprint,
        warnings: &mut Vec<PipelineWarning>,
    ) -> Option<BookMetadata> {
        let name = provider.name().to_string();
        let _span = info_span!("provider", name = %name).entered();

        let (tx, rx) = bounded::<Result<Option<BookMetadata>, ProviderError>>(1);
        let worker = Arc::clone(provider);
        let spawned = thread::Builder::new()
            .name(format!("provider-{}", name))
            .spawn(move || {
                let _ = tx.send(worker.lookup(&query));
            });
        if let Err(e) = spawned {
            warn!("Could not start provider {}: {}", name, e);
            warnings.push(PipelineWarning::ProviderFailed {
                provider: name,
                error: e.to_string(),
            });
            return None;
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(Some(meta))) => Some(meta.normalized()),
            Ok(Ok(None)) => {
                debug!("Provider {} found nothing", name);
                None
            }
            Ok(Err(e)) => {
                warn!("Provider {} failed: {}", name, e);
                warnings.push(PipelineWarning::ProviderFailed {
                    provider: name,
                    error: e.to_string(),
                });
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Provider {} timed out after {:?}", name, self.timeout);
                warnings.push(PipelineWarning::ProviderTimeout {
                    provider: name,
                    after: self.timeout,
                });
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                warnings.push(PipelineWarning::ProviderFailed {
                    provider: name,
                    error: "provider thread panicked".to_string(),
                });
                None
            }
        }
    }
}
