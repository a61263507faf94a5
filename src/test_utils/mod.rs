//! Utilities to help with testing upstream resolution

use crate::discovery::{self, BoxedWatcher, Discovery, LookupError, ServiceInstance, Watcher};
use crate::service;

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What a [TestDiscovery] answers to lookups.
#[derive(Clone, Debug)]
pub enum Reply {
    /// A successful lookup.
    Instances(Vec<ServiceInstance>),
    /// A failed lookup which still found these instances.
    Partial(Vec<ServiceInstance>),
    /// A failed lookup with nothing found.
    Unavailable,
}

type Push = Result<Vec<ServiceInstance>, discovery::Error>;

/// A test-only discovery backend which counts lookups, can be slowed down
/// to mimic a struggling backend, and lets tests push watch updates.
pub struct TestDiscovery {
    lookups: AtomicUsize,
    delay_ms: AtomicU64,
    reply: Mutex<Reply>,
    refuse_watch: AtomicBool,
    push_tx: Mutex<Option<mpsc::UnboundedSender<Push>>>,
    watcher_stopped: Arc<AtomicBool>,
    watch_broken: Arc<AtomicBool>,
}

impl TestDiscovery {
    /// Creates a backend which instantly answers every lookup with `reply`.
    pub fn new(reply: Reply) -> Self {
        Self {
            lookups: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            reply: Mutex::new(reply),
            refuse_watch: AtomicBool::new(false),
            push_tx: Mutex::new(None),
            watcher_stopped: Arc::new(AtomicBool::new(false)),
            watch_broken: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_endpoints(endpoints: &[&str]) -> Self {
        Self::new(Reply::Instances(vec![ServiceInstance::new(
            endpoints.iter().copied(),
        )]))
    }

    /// The number of lookups started so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    /// Makes every following lookup take `delay_ms` before answering.
    pub fn stall(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    /// Makes every following watch fail to open.
    pub fn refuse_watch(&self) {
        self.refuse_watch.store(true, Ordering::SeqCst);
    }

    /// Sends a result to the most recently opened watcher.
    ///
    /// Returns false if no watcher is listening.
    pub fn push(&self, result: Push) -> bool {
        match self.push_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// While set, every call to the watcher's `next` fails immediately,
    /// unless a pushed result is already waiting.
    pub fn break_watch(&self, broken: bool) {
        self.watch_broken.store(broken, Ordering::SeqCst);
    }

    pub fn has_watcher(&self) -> bool {
        self.push_tx.lock().unwrap().is_some()
    }

    pub fn watcher_stopped(&self) -> bool {
        self.watcher_stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for TestDiscovery {
    async fn get_service(
        &self,
        _name: &service::Name,
    ) -> Result<Vec<ServiceInstance>, LookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
        }

        let reply = self.reply.lock().unwrap().clone();
        match reply {
            Reply::Instances(instances) => Ok(instances),
            Reply::Partial(instances) => Err(LookupError {
                instances,
                source: discovery::Error::Other(anyhow!("some servers did not answer")),
            }),
            Reply::Unavailable => Err(discovery::Error::Other(anyhow!("backend is down")).into()),
        }
    }

    async fn watch(&self, _name: &service::Name) -> Result<BoxedWatcher, discovery::Error> {
        if self.refuse_watch.load(Ordering::SeqCst) {
            return Err(discovery::Error::Other(anyhow!("watch refused")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.push_tx.lock().unwrap() = Some(tx);
        Ok(Box::new(TestWatcher {
            rx,
            stopped: self.watcher_stopped.clone(),
            broken: self.watch_broken.clone(),
        }))
    }
}

struct TestWatcher {
    rx: mpsc::UnboundedReceiver<Push>,
    stopped: Arc<AtomicBool>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl Watcher for TestWatcher {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, discovery::Error> {
        if let Ok(result) = self.rx.try_recv() {
            return result;
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(discovery::Error::WatchClosed);
        }
        match self.rx.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
