//! Directory watching: native or polling subscriptions, debounced into
//! [`FileEvent`]s for tracked e-book files.

pub mod debounce;
pub mod filter;
pub mod reconcile;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use notify::{PollWatcher, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    new_debouncer, new_debouncer_opt, DebounceEventHandler, DebounceEventResult, Debouncer,
    FileIdMap, RecommendedCache,
};

use crate::error::WatchError;

pub use debounce::collapse;
pub use filter::is_tracked;
pub use reconcile::reconcile;

/// How often a blocked stream looks at the shutdown flag.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(100);

/// A configured directory root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub path: PathBuf,
    pub polling: bool,
}

impl WatchTarget {
    pub fn new(path: impl Into<PathBuf>, polling: bool) -> Self {
        Self {
            path: path.into(),
            polling,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Removed,
    /// The file now at `path` was previously at `from`.
    Renamed { from: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
    pub observed_at: DateTime<Utc>,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            observed_at: Utc::now(),
        }
    }

    pub fn created(path: PathBuf) -> Self {
        Self::new(FileEventKind::Created, path)
    }

    pub fn modified(path: PathBuf) -> Self {
        Self::new(FileEventKind::Modified, path)
    }

    pub fn removed(path: PathBuf) -> Self {
        Self::new(FileEventKind::Removed, path)
    }

    pub fn renamed(from: PathBuf, to: PathBuf) -> Self {
        Self::new(FileEventKind::Renamed { from }, to)
    }
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub debounce: Duration,
    pub poll_delay: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            poll_delay: Duration::from_millis(300),
        }
    }
}

pub struct Watcher {
    targets: Vec<WatchTarget>,
    settings: WatchSettings,
}

impl Watcher {
    pub fn new(targets: Vec<WatchTarget>, settings: WatchSettings) -> Self {
        Self { targets, settings }
    }

    pub fn targets(&self) -> &[WatchTarget] {
        &self.targets
    }

    /// Subscribes to every target and returns the lazy event stream. The
    /// subscription is live once this returns, so a reconciliation pass run
    /// afterwards cannot miss a file. The stream ends when `shutdown` is set,
    /// or after a watch error or an overflow, in which case the caller has
    /// to resubscribe and reconcile.
    pub fn observe(&self, shutdown: Arc<AtomicBool>) -> Result<FileEvents, WatchError> {
        let (tx, rx) = unbounded();
        let mut subscriptions = Vec::with_capacity(self.targets.len());

        for target in &self.targets {
            let handler = {
                let tx = tx.clone();
                move |res: DebounceEventResult| {
                    let _ = tx.send(res);
                }
            };

            let subscription = if target.polling {
                self.poll_subscription(target, handler)?
            } else {
                match subscribe_native(&target.path, self.settings.debounce, handler.clone()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(
                            "Native notifications unavailable for {} ({}), falling back to polling",
                            target.path.display(),
                            e
                        );
                        self.poll_subscription(target, handler)?
                    }
                }
            };
            info!(
                "Watching {} ({})",
                target.path.display(),
                subscription.mode()
            );
            subscriptions.push(subscription);
        }

        Ok(FileEvents::new(rx, shutdown, subscriptions))
    }

    fn poll_subscription<F>(
        &self,
        target: &WatchTarget,
        handler: F,
    ) -> Result<Subscription, WatchError>
    where
        F: DebounceEventHandler,
    {
        let config = notify::Config::default().with_poll_interval(self.settings.poll_delay);
        let subscribe_err = |e: notify::Error| WatchError::Subscribe {
            path: target.path.clone(),
            source: e,
        };
        let mut debouncer = new_debouncer_opt::<_, PollWatcher, FileIdMap>(
            self.settings.debounce,
            None,
            handler,
            FileIdMap::new(),
            config,
        )
        .map_err(subscribe_err)?;
        debouncer
            .watch(&target.path, RecursiveMode::Recursive)
            .map_err(subscribe_err)?;
        Ok(Subscription::Polling(debouncer))
    }
}

fn subscribe_native<F>(path: &Path, timeout: Duration, handler: F) -> notify::Result<Subscription>
where
    F: DebounceEventHandler,
{
    let mut debouncer = new_debouncer(timeout, None, handler)?;
    debouncer.watch(path, RecursiveMode::Recursive)?;
    Ok(Subscription::Native(debouncer))
}

/// A live debounced subscription; dropping it stops the watch.
enum Subscription {
    Native(Debouncer<RecommendedWatcher, RecommendedCache>),
    Polling(Debouncer<PollWatcher, FileIdMap>),
}

impl Subscription {
    fn mode(&self) -> &'static str {
        match self {
            Subscription::Native(_) => "native",
            Subscription::Polling(_) => "polling",
        }
    }
}

/// Lazy, unbounded stream of debounced events.
pub struct FileEvents {
    _subscriptions: Vec<Subscription>,
    raw: Receiver<DebounceEventResult>,
    ready: VecDeque<FileEvent>,
    shutdown: Arc<AtomicBool>,
    broken: bool,
}

impl FileEvents {
    fn new(
        raw: Receiver<DebounceEventResult>,
        shutdown: Arc<AtomicBool>,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        Self {
            _subscriptions: subscriptions,
            raw,
            ready: VecDeque::new(),
            shutdown,
            broken: false,
        }
    }

    /// A stream fed from `raw` without any subscription behind it.
    #[cfg(test)]
    pub(crate) fn from_channel(raw: Receiver<DebounceEventResult>, shutdown: Arc<AtomicBool>) -> Self {
        Self::new(raw, shutdown, Vec::new())
    }

    fn take(&mut self, result: DebounceEventResult) {
        match result {
            Ok(batch) => {
                if batch.iter().any(|e| e.need_rescan()) {
                    warn!("Watcher dropped events, a rescan is needed");
                    self.broken = true;
                }
                self.ready
                    .extend(debounce::collapse(batch.iter().map(|e| &e.event)));
            }
            Err(errors) => {
                for e in &errors {
                    warn!("Watch error: {}", e);
                }
                self.broken = true;
            }
        }
    }
}

impl Iterator for FileEvents {
    type Item = FileEvent;

    fn next(&mut self) -> Option<FileEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("Watcher shutting down");
                return None;
            }
            if self.broken {
                return None;
            }

            match self.raw.recv_timeout(SHUTDOWN_CHECK) {
                Ok(result) => self.take(result),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Watch channel disconnected");
                    return None;
                }
            }
        }
    }
}
