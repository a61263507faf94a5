//! The interface for the discovery backend, which finds service instances.

use crate::service;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Watch closed by the discovery backend")]
    WatchClosed,

    #[error(transparent)]
    Other(anyhow::Error),
}

/// A failed lookup, which may still have found some instances.
///
/// Backends report a non-empty `instances` when they could only partially
/// answer (e.g. some of their servers failed, or results were filtered).
#[derive(Error, Debug)]
#[error("Discovery lookup failed ({} instances found)", instances.len())]
pub struct LookupError {
    pub instances: Vec<ServiceInstance>,
    #[source]
    pub source: Error,
}

impl From<Error> for LookupError {
    fn from(source: Error) -> Self {
        Self {
            instances: Vec::new(),
            source,
        }
    }
}

/// One registered replica of a service, as reported by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceInstance {
    #[cfg_attr(feature = "serde", serde(default))]
    pub id: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub version: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: BTreeMap<String, String>,
    /// Endpoint URIs, such as `http://10.0.0.1:8000` or `grpc://host:9000`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Finds the instances of a service.
///
/// Implementations own their connection to the backend, including any
/// retries or client-side caching; callers see only these two operations.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Looks up the current instances of a service.
    ///
    /// Cancellation is expressed by dropping the returned future.
    async fn get_service(&self, name: &service::Name)
        -> Result<Vec<ServiceInstance>, LookupError>;

    /// Opens a long-lived watch on a service.
    async fn watch(&self, name: &service::Name) -> Result<BoxedWatcher, Error>;
}

/// A stream of instance snapshots pushed by the backend.
#[async_trait]
pub trait Watcher: Send {
    /// Waits until the backend pushes a new snapshot, or the watch fails.
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, Error>;

    /// Releases the watch.
    ///
    /// By default this method does nothing.
    async fn stop(&mut self) {}
}

/// Helper type for anything that implements the Watcher interface.
pub type BoxedWatcher = Box<dyn Watcher>;

pub type SharedDiscovery = Arc<dyn Discovery>;
