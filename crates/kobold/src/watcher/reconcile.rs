//! Startup consistency pass: catches up on everything that happened while
//! no subscription was active.

use log::{debug, info, warn};
use walkdir::WalkDir;

use super::filter::is_tracked;
use super::{FileEvent, WatchTarget};
use crate::error::WatchError;
use crate::jobs::{JobStatus, JobStore};

/// Lists every tracked file under the targets and synthesizes `Created`
/// for those not already `Done`, plus `Removed` for tracked jobs under a
/// target whose file has disappeared.
pub fn reconcile(targets: &[WatchTarget], store: &JobStore) -> Result<Vec<FileEvent>, WatchError> {
    let mut events = Vec::new();

    for target in targets {
        let mut found = 0usize;
        let queued_before = events.len();
        for entry in WalkDir::new(&target.path).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                // An unreadable root means nothing under it can be trusted.
                Err(e) if e.depth() == 0 => {
                    return Err(WatchError::ScanFailed {
                        path: target.path.clone(),
                        source: e,
                    })
                }
                Err(e) => {
                    warn!("Reconcile: skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_tracked(entry.path()) {
                continue;
            }
            found += 1;

            let done = store
                .find_by_path(entry.path())?
                .is_some_and(|job| job.status == JobStatus::Done);
            if !done {
                debug!("Reconcile: pending file {}", entry.path().display());
                events.push(FileEvent::created(entry.path().to_path_buf()));
            }
        }
        info!(
            "Reconciled {}: {} tracked file(s), {} to process",
            target.path.display(),
            found,
            events.len() - queued_before
        );
    }

    for job in store.list(None)? {
        if job.status == JobStatus::Removed || job.source_path.exists() {
            continue;
        }
        if targets.iter().any(|t| job.source_path.starts_with(&t.path)) {
            debug!("Reconcile: job {} lost its file", job.id);
            events.push(FileEvent::removed(job.source_path));
        }
    }

    Ok(events)
}
