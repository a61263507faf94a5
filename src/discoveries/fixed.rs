//! Implementation of [Discovery] backed by an in-memory table of services.

use crate::discovery::{self, BoxedWatcher, Discovery, LookupError, ServiceInstance, Watcher};
use crate::service;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

type Services = Arc<BTreeMap<service::Name, Vec<ServiceInstance>>>;

/// A [`Discovery`] that serves whatever instances it was last given.
///
/// Watchers are notified whenever [`FixedDiscovery::replace`] or
/// [`FixedDiscovery::remove`] changes their service.
#[derive(Clone, Debug)]
pub struct FixedDiscovery {
    tx: watch::Sender<Services>,
}

impl FixedDiscovery {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(BTreeMap::new()));
        Self { tx }
    }

    pub fn with_services(
        services: impl IntoIterator<Item = (service::Name, Vec<ServiceInstance>)>,
    ) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(services.into_iter().collect()));
        Self { tx }
    }

    /// Sets the instances of a service.
    pub fn replace(&self, name: service::Name, instances: Vec<ServiceInstance>) {
        self.tx.send_modify(|services| {
            Arc::make_mut(services).insert(name, instances);
        });
    }

    /// Forgets a service. Watchers see an empty snapshot.
    pub fn remove(&self, name: &str) {
        self.tx
            .send_if_modified(|services| Arc::make_mut(services).remove(name).is_some());
    }
}

impl Default for FixedDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for FixedDiscovery {
    async fn get_service(
        &self,
        name: &service::Name,
    ) -> Result<Vec<ServiceInstance>, LookupError> {
        Ok(self
            .tx
            .borrow()
            .get(name.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn watch(&self, name: &service::Name) -> Result<BoxedWatcher, discovery::Error> {
        Ok(Box::new(FixedWatcher {
            service: name.clone(),
            stream: WatchStream::new(self.tx.subscribe()),
            last: None,
        }))
    }
}

struct FixedWatcher {
    service: service::Name,
    stream: WatchStream<Services>,
    // The last snapshot handed out, to skip changes to other services.
    last: Option<Vec<ServiceInstance>>,
}

#[async_trait]
impl Watcher for FixedWatcher {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, discovery::Error> {
        loop {
            let Some(services) = self.stream.next().await else {
                return Err(discovery::Error::WatchClosed);
            };
            let current = services
                .get(self.service.as_str())
                .cloned()
                .unwrap_or_default();
            if self.last.as_ref() == Some(&current) {
                continue;
            }
            self.last = Some(current.clone());
            return Ok(current);
        }
    }
}
