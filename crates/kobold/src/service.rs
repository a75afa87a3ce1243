//! Wires the watcher, job store and worker pool into one running service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{KoboldError, Result, StorageError};
use crate::jobs::JobStore;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::sanitize::redact_path;
use crate::watcher::{reconcile, FileEvent, FileEvents, Watcher};
use crate::worker::{WorkerPool, WorkerSettings};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

pub struct Service {
    config: Arc<Config>,
    store: JobStore,
    shutdown: Arc<AtomicBool>,
    ingest: Option<JoinHandle<()>>,
    workers: Option<WorkerPool>,
}

impl Service {
    /// Opens the store under `DATA_PATH` and starts with the production
    /// pipeline.
    pub fn start(config: Arc<Config>) -> Result<Self> {
        create_dir(&config.data_path)?;
        for dir in &config.watch_dirs {
            create_dir(dir)?;
        }

        let store = JobStore::open(&config.database_path())?;
        let pipeline = Pipeline::from_config(Arc::new(PipelineConfig::from_config(&config)));
        Self::start_with(config, store, Arc::new(pipeline))
    }

    /// Subscribes the watcher, reconciles, then starts ingesting events and
    /// running workers. Subscribing before reconciling means no file can
    /// slip between the two.
    pub fn start_with(config: Arc<Config>, store: JobStore, pipeline: Arc<Pipeline>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let watcher = Watcher::new(config.watch_targets(), config.watch_settings());
        let events = watcher.observe(Arc::clone(&shutdown))?;
        let queued = ingest_reconciled(&watcher, &store)?;
        info!("Startup reconciliation queued {} file(s)", queued);

        let ingest = {
            let store = store.clone();
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("kobold-ingest".to_string())
                .spawn(move || run_ingest(watcher, store, events, shutdown))
                .map_err(|e| KoboldError::Worker(e.to_string()))?
        };

        let settings = WorkerSettings {
            count: config.worker_count,
            batch_size: config.worker_batch_size,
            lease: config.lease_duration,
            poll_interval: config.worker_poll_interval,
        };
        let workers = WorkerPool::start(store.clone(), pipeline, &settings, Arc::clone(&shutdown))
            .map_err(|e| KoboldError::Worker(e.to_string()))?;

        Ok(Self {
            config,
            store,
            shutdown,
            ingest: Some(ingest),
            workers: Some(workers),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }

    /// Stops every thread, waiting at most `SHUTDOWN_GRACE` in total.
    /// Returns whether everything stopped in time.
    pub fn shutdown(mut self) -> bool {
        let grace = self.config.shutdown_grace;
        let deadline = Instant::now() + grace;
        self.shutdown.store(true, Ordering::Relaxed);

        let mut clean = self
            .workers
            .take()
            .map(|pool| pool.shutdown(grace))
            .unwrap_or(true);

        if let Some(handle) = self.ingest.take() {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Ingest thread panicked");
                }
            } else {
                warn!("Ingest thread still running after {:?}, abandoning it", grace);
                clean = false;
            }
        }

        info!("Service stopped");
        clean
    }
}

fn create_dir(path: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        KoboldError::Storage(StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })
    })
}

fn ingest_reconciled(watcher: &Watcher, store: &JobStore) -> Result<usize> {
    let events = reconcile(watcher.targets(), store)?;
    let count = events.len();
    for event in &events {
        apply(store, event);
    }
    Ok(count)
}

fn apply(store: &JobStore, event: &FileEvent) {
    match store.upsert(event) {
        Ok(Some(job)) => debug!(
            "{:?} {} -> job {} ({})",
            event.kind,
            redact_path(&event.path),
            job.id,
            job.status
        ),
        Ok(None) => {}
        Err(e) => error!("Could not record event for {}: {}", redact_path(&event.path), e),
    }
}

/// Feeds watcher events into the store. A lost subscription is replaced,
/// followed by a fresh reconciliation pass to cover the gap.
fn run_ingest(watcher: Watcher, store: JobStore, events: FileEvents, shutdown: Arc<AtomicBool>) {
    let mut events = Some(events);

    while !shutdown.load(Ordering::Relaxed) {
        if let Some(stream) = events.take() {
            for event in stream {
                apply(&store, &event);
            }
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            warn!("Watch subscription ended unexpectedly, resubscribing");
        }

        thread::sleep(RESUBSCRIBE_DELAY);
        match watcher.observe(Arc::clone(&shutdown)) {
            Ok(stream) => {
                events = Some(stream);
                match ingest_reconciled(&watcher, &store) {
                    Ok(n) => info!("Resubscribed; reconciliation queued {} file(s)", n),
                    Err(e) => error!("Reconciliation after resubscribe failed: {}", e),
                }
            }
            Err(e) => error!("Resubscribe failed: {}", e),
        }
    }

    debug!("Ingest thread stopped");
}
