//! Background index-change watcher
//!
//! [`IndexWatcher`] is the only component with background, unsolicited
//! execution: a single tokio task polling the backend's index generation
//! at a fixed interval. Everything else in the crate acts strictly in
//! response to a caller pull.
//!
//! State machine: `Undetermined -> {Available, Unavailable}`; a poll
//! whose generation differs from the last seen one yields `Changed`
//! (driving cache-wide invalidation) and subsequent polls return to
//! `Available`/`Unavailable`. Observers register once, before the task
//! starts; transitions are delivered on the polling task.

use crate::transport::SearchBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Observed backend index state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// No poll has completed yet.
    Undetermined,
    /// The backend answered and the generation is unchanged.
    Available,
    /// The backend did not answer.
    Unavailable,
    /// The backend answered with a new generation; caches must drop
    /// derived state.
    Changed,
}

/// Callback invoked on every poll with the resulting status.
pub type StatusObserver = Box<dyn Fn(IndexStatus) + Send + Sync>;

/// Periodic poller of the backend index generation.
pub struct IndexWatcher {
    backend: Arc<dyn SearchBackend>,
    interval: Duration,
    observers: Vec<StatusObserver>,
}

/// Handle to a started watcher; dropping it does not stop the task, call
/// [`WatcherHandle::shutdown`].
pub struct WatcherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IndexWatcher {
    /// Create a watcher polling `backend` every `interval`. Probes must
    /// bypass any cache, so hand the raw backend in.
    pub fn new(backend: Arc<dyn SearchBackend>, interval: Duration) -> Self {
        Self {
            backend,
            interval,
            observers: Vec::new(),
        }
    }

    /// Register an observer. Must happen before [`IndexWatcher::start`].
    pub fn on_status(mut self, observer: StatusObserver) -> Self {
        self.observers.push(observer);
        self
    }

    /// Spawn the polling task.
    pub fn start(self) -> WatcherHandle {
        let (stop, mut stopped) = watch::channel(false);
        info!(interval_secs = self.interval.as_secs_f64(), "index watcher started");
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_generation: Option<u64> = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => {
                        debug!("index watcher stopping");
                        return;
                    }
                }
                let status = Self::poll_once(&*self.backend, &mut last_generation).await;
                for observer in &self.observers {
                    observer(status);
                }
            }
        });
        WatcherHandle { stop, task }
    }

    /// One poll step: classify the backend answer against the last seen
    /// generation. Factored out of the task for direct testing.
    pub async fn poll_once(
        backend: &dyn SearchBackend,
        last_generation: &mut Option<u64>,
    ) -> IndexStatus {
        match backend.index_generation().await {
            Ok(generation) => {
                let status = match *last_generation {
                    Some(previous) if previous != generation => {
                        info!(previous, generation, "index generation changed");
                        IndexStatus::Changed
                    }
                    _ => IndexStatus::Available,
                };
                *last_generation = Some(generation);
                status
            }
            Err(error) => {
                warn!(%error, "index generation probe failed");
                IndexStatus::Unavailable
            }
        }
    }
}

impl WatcherHandle {
    /// Stop the polling task and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}
