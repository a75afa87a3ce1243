use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use super::scheduler::Scheduler;
use crate::jobs::JobStore;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub count: usize,
    pub batch_size: u32,
    pub lease: Duration,
    pub poll_interval: Duration,
}

/// Fixed-interval worker loops sharing one store and pipeline.
pub struct WorkerPool {
    workers: Vec<(String, JoinHandle<()>)>,
    stop: Option<Sender<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `settings.count` worker threads. Each owns a distinct lease
    /// owner id so their claims never alias, even across processes.
    pub fn start(
        store: JobStore,
        pipeline: Arc<Pipeline>,
        settings: &WorkerSettings,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let instance = uuid::Uuid::new_v4().simple().to_string();
        let mut workers = Vec::with_capacity(settings.count);

        for n in 0..settings.count.max(1) {
            let owner = format!("kobold-{}-{}", &instance[..8], n);
            let scheduler = Scheduler::new(
                store.clone(),
                Arc::clone(&pipeline),
                owner.clone(),
                settings.batch_size,
                settings.lease,
            );
            let stop_rx = stop_rx.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let interval = settings.poll_interval;

            let handle = thread::Builder::new()
                .name(format!("kobold-worker-{}", n))
                .spawn(move || run_worker(scheduler, stop_rx, shutdown_flag, interval))?;
            workers.push((owner, handle));
        }

        info!("Started {} worker(s)", workers.len());
        Ok(Self {
            workers,
            stop: Some(stop_tx),
            shutdown,
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Signals every worker and waits up to `grace` for them to finish
    /// their current job. Workers still busy afterwards are abandoned; their
    /// leases expire and the jobs are reclaimed by the next run. Returns
    /// whether every worker stopped in time.
    pub fn shutdown(mut self, grace: Duration) -> bool {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
        // Disconnecting wakes workers sleeping between ticks.
        drop(self.stop.take());

        let deadline = Instant::now() + grace;
        let mut pending = std::mem::take(&mut self.workers);
        while !pending.is_empty() && Instant::now() < deadline {
            let (finished, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|(_, h)| h.is_finished());
            for (owner, handle) in finished {
                match handle.join() {
                    Ok(()) => debug!("Worker {} finished", owner),
                    Err(e) => error!("Worker {} panicked: {:?}", owner, e),
                }
            }
            pending = running;
            if !pending.is_empty() {
                thread::sleep(Duration::from_millis(20));
            }
        }

        if pending.is_empty() {
            info!("All workers have stopped");
            true
        } else {
            for (owner, _) in &pending {
                warn!("Worker {} still busy after {:?}, abandoning it", owner, grace);
            }
            false
        }
    }
}

fn run_worker(
    scheduler: Scheduler,
    stop: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
) {
    debug!("Worker {} started", scheduler.owner());

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", scheduler.owner());
            break;
        }

        if let Err(e) = scheduler.tick(&shutdown) {
            error!("Worker {} tick failed: {}", scheduler.owner(), e);
        }

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Worker {} stopped", scheduler.owner());
}
