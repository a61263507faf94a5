//! Background task applying snapshots pushed by the discovery backend.

use crate::backoff::ExponentialBackoff;
use crate::discovery::{self, ServiceInstance};
#[cfg(feature = "probes")]
use crate::probes;
use crate::refresh::Refresher;
use crate::service;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{event, span, Instrument, Level};

/// Where a [PushTask] is in its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushState {
    /// Opening the watch.
    Connecting,
    /// The watch is open, and pushed snapshots are being applied.
    Watching,
    /// The watch could not be opened; the task has exited.
    ///
    /// Upstreams for the service are still refreshed lazily.
    WatchFailed,
    /// The task was terminated.
    Stopped,
}

/// Counters describing a [PushTask].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushStats {
    pub state: PushState,
    /// Snapshots written into the cache.
    pub applied: usize,
    /// Snapshots dropped because they could not be translated.
    pub skipped: usize,
    /// Errors returned by the watch itself. Consecutive errors are spaced
    /// out by an exponential backoff.
    pub stream_errors: usize,
}

impl Default for PushStats {
    fn default() -> Self {
        Self {
            state: PushState::Connecting,
            applied: 0,
            skipped: 0,
            stream_errors: 0,
        }
    }
}

struct PushWorker {
    refresher: Arc<Refresher>,
    service: service::Name,
    ttl: Duration,
    stats_tx: watch::Sender<PushStats>,
}

impl PushWorker {
    fn set_state(&self, state: PushState) {
        self.stats_tx.send_modify(|stats| stats.state = state);
    }

    async fn run(self, mut terminate_rx: oneshot::Receiver<()>) {
        let watcher = tokio::select! {
            _ = &mut terminate_rx => {
                self.set_state(PushState::Stopped);
                return;
            }
            watcher = self.refresher.discovery().watch(&self.service) => watcher,
        };

        // Restarting the watch is left to whoever owns this task.
        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(err) => {
                event!(
                    Level::WARN,
                    err = ?err,
                    "Failed to watch service, upstreams will only be refreshed on demand"
                );
                self.set_state(PushState::WatchFailed);
                return;
            }
        };
        event!(Level::DEBUG, "Watching service for pushed upstreams");
        self.set_state(PushState::Watching);

        // Delay before asking the watch again, set while it keeps failing.
        let mut backoff = None;
        loop {
            let result = tokio::select! {
                _ = &mut terminate_rx => break,
                result = watcher.next() => result,
            };
            match result {
                Ok(instances) => {
                    backoff = None;
                    self.handle_snapshot(&instances).await;
                }
                Err(err) => {
                    let delay = self.handle_stream_error(err, &mut backoff);
                    tokio::select! {
                        _ = &mut terminate_rx => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        watcher.stop().await;
        self.set_state(PushState::Stopped);
    }

    // Returns how long to wait before calling the watch again.
    fn handle_stream_error(
        &self,
        err: discovery::Error,
        backoff: &mut Option<Duration>,
    ) -> Duration {
        let policy = self.refresher.cache().policy();
        let delay = match *backoff {
            None => policy.min_watch_backoff.add_spread(policy.spread),
            Some(delay) => delay.exponential_backoff(policy.max_watch_backoff),
        };
        *backoff = Some(delay);

        event!(Level::WARN, err = ?err, ?delay, "Watch returned an error");
        self.stats_tx.send_modify(|stats| stats.stream_errors += 1);
        delay
    }

    async fn handle_snapshot(&self, instances: &[ServiceInstance]) {
        // Pushed data is authoritative: no freshness check.
        match self
            .refresher
            .apply_push(&self.service, instances, self.ttl)
            .await
        {
            Ok(entry) => {
                event!(
                    Level::INFO,
                    upstreams = entry.upstreams().len(),
                    "Applied pushed upstreams"
                );
                #[cfg(feature = "probes")]
                probes::push__applied!(|| (
                    self.service.as_str(),
                    entry.upstreams().len() as u64
                ));
                self.stats_tx.send_modify(|stats| stats.applied += 1);
            }
            Err(err) => {
                event!(Level::WARN, err = ?err, "Dropping pushed snapshot");
                #[cfg(feature = "probes")]
                probes::push__skipped!(|| (self.service.as_str(), err.as_str()));
                self.stats_tx.send_modify(|stats| stats.skipped += 1);
            }
        }
    }
}

/// A background task which keeps one service's cache entry up to date with
/// snapshots pushed by the discovery backend.
///
/// Call [PushTask::terminate] to stop the task and wait for it. Dropping a
/// task without terminating it aborts it.
pub struct PushTask {
    service: service::Name,
    handle: Option<JoinHandle<()>>,
    terminate_tx: Option<oneshot::Sender<()>>,
    stats_rx: watch::Receiver<PushStats>,
}

impl PushTask {
    /// Spawns a task watching `service`.
    ///
    /// - `refresher`: Provides the discovery backend to watch, and the cache
    ///   to write into.
    /// - `ttl`: The TTL of the entry, if a push creates it.
    pub fn spawn(refresher: Arc<Refresher>, service: service::Name, ttl: Duration) -> Self {
        let (stats_tx, stats_rx) = watch::channel(PushStats::default());
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let span = span!(Level::INFO, "PushTask", service = %service);
        let worker = PushWorker {
            refresher,
            service: service.clone(),
            ttl,
            stats_tx,
        };
        let handle = Some(tokio::task::spawn(
            async move {
                worker.run(terminate_rx).await;
            }
            .instrument(span),
        ));

        Self {
            service,
            handle,
            terminate_tx: Some(terminate_tx),
            stats_rx,
        }
    }

    pub fn service(&self) -> &service::Name {
        &self.service
    }

    /// Returns a receiver to track the task's activity.
    pub fn monitor(&self) -> watch::Receiver<PushStats> {
        self.stats_rx.clone()
    }

    /// Samples the task's stats at a single point-in-time.
    pub fn stats(&self) -> PushStats {
        self.stats_rx.borrow().clone()
    }

    /// Stops the task, releasing its watch.
    ///
    /// Any pending wait for a pushed snapshot is abandoned. Panics within the
    /// task are propagated.
    pub async fn terminate(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Some(terminate_tx) = self.terminate_tx.take() {
            // The task may have already exited on its own.
            let _send_result = terminate_tx.send(());
        }
        crate::join::propagate_panics(handle.await);
    }
}

impl Drop for PushTask {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.abort();
    }
}
