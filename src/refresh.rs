//! Resolves upstreams through the [Cache], refreshing from [Discovery] when
//! an entry is missing or stale.

use crate::cache::{Cache, Entry};
use crate::discovery::{self, LookupError, ServiceInstance, SharedDiscovery};
#[cfg(feature = "probes")]
use crate::probes;
use crate::service;
use crate::translate;
use crate::upstream::{AllUpstreams, Upstream};

use debug_ignore::DebugIgnore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Discovery backend unavailable")]
    BackendUnavailable(#[source] discovery::Error),

    #[error("Discovered instances could not be translated into upstreams")]
    Translation(#[from] translate::Error),
}

impl Error {
    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    const fn as_str(&self) -> &'static str {
        match self {
            Error::BackendUnavailable(_) => "BackendUnavailable",
            Error::Translation(_) => "Translation",
        }
    }
}

/// A wrapper type indicating that the USDT probes could not be registered.
///
/// In this case, no probes will be available in the process. However, similar
/// to `std::sync::PoisonError`, this contains the refresher itself.
pub struct RegistrationError(Refresher);

impl std::fmt::Debug for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl RegistrationError {
    /// Consume the error and get access to the contained refresher.
    pub fn into_inner(self) -> Refresher {
        self.0
    }
}

/// Resolves services against one discovery backend, caching the results.
#[derive(Debug)]
pub struct Refresher {
    cache: Arc<Cache>,
    discovery: DebugIgnore<SharedDiscovery>,
}

impl Refresher {
    /// Creates a refresher which stores into `cache` and refreshes
    /// from `discovery`.
    ///
    /// ```no_run
    /// use discovery_upstreams::cache::Cache;
    /// use discovery_upstreams::discoveries::fixed::FixedDiscovery;
    /// use discovery_upstreams::discovery::ServiceInstance;
    /// use discovery_upstreams::refresh::Refresher;
    /// use discovery_upstreams::service;
    /// use std::sync::Arc;
    ///
    /// # async {
    /// let discovery = Arc::new(FixedDiscovery::new());
    /// discovery.replace(
    ///     service::Name::new("echo"),
    ///     vec![ServiceInstance::new(["http://10.0.0.1:8000"])],
    /// );
    ///
    /// // The cache may be shared with refreshers for other backends.
    /// let cache = Arc::new(Cache::default());
    /// let refresher = Refresher::new(cache, discovery).unwrap();
    ///
    /// let upstreams = refresher.resolve(&service::Name::new("echo")).await.unwrap();
    /// assert_eq!(upstreams[0].dial(), "10.0.0.1:8000");
    /// # };
    /// ```
    ///
    /// # DTrace probe registration
    ///
    /// This constructor returns a `Result`, because it attempts to register
    /// the USDT probes it exposes. The `Err` variant still carries the
    /// refresher, for callers which don't want a registration failure to be
    /// fatal.
    ///
    /// If the `"probes"` feature is not enabled, this method is infallible.
    pub fn new(cache: Arc<Cache>, discovery: SharedDiscovery) -> Result<Self, RegistrationError> {
        let self_ = Self {
            cache,
            discovery: DebugIgnore(discovery),
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn discovery(&self) -> &SharedDiscovery {
        &self.discovery
    }

    /// Resolves upstreams for `service`, using the cache's default TTL if
    /// a new entry must be created.
    pub async fn resolve(&self, service: &service::Name) -> Result<AllUpstreams, Error> {
        self.resolve_with_ttl(service, self.cache.policy().default_ttl)
            .await
    }

    /// Resolves upstreams for `service`.
    ///
    /// Fresh entries are returned without contacting the backend. Otherwise
    /// the backend is asked while holding the cache's exclusive lock, and the
    /// result is cached with `ttl` (for a new entry).
    ///
    /// A failed lookup or translation is returned to the caller, even when a
    /// stale entry exists. The entry is left as it was.
    ///
    /// Dropping the returned future cancels the lookup without touching the
    /// cache.
    #[instrument(level = "debug", skip(self), err, name = "Refresher::resolve")]
    pub async fn resolve_with_ttl(
        &self,
        service: &service::Name,
        ttl: Duration,
    ) -> Result<AllUpstreams, Error> {
        #[cfg(feature = "probes")]
        probes::resolve__start!(|| service.as_str());
        let res = self.do_resolve(service, ttl).await;
        #[cfg(feature = "probes")]
        match &res {
            Ok(upstreams) => {
                probes::resolve__done!(|| (service.as_str(), upstreams.len() as u64))
            }
            Err(e) => probes::resolve__failed!(|| (service.as_str(), e.as_str())),
        }
        res
    }

    async fn do_resolve(
        &self,
        service: &service::Name,
        ttl: Duration,
    ) -> Result<AllUpstreams, Error> {
        // First, use the shared lock to return a cached result quickly.
        if let Some(upstreams) = self.cache.fresh(service.as_str()).await {
            return Ok(upstreams);
        }

        let mut table = self.cache.write().await;

        // Another task may have refreshed the entry while we waited for the
        // exclusive lock.
        if let Some(upstreams) = table.fresh(service.as_str()) {
            return Ok(upstreams);
        }

        event!(Level::DEBUG, %service, "Refreshing upstreams from discovery");
        #[cfg(feature = "probes")]
        probes::refresh__start!(|| service.as_str());

        match self.lookup(service).await {
            Ok(upstreams) => {
                let upstreams = Arc::new(upstreams);
                table.put(service, upstreams.clone(), ttl);
                #[cfg(feature = "probes")]
                probes::refresh__done!(|| (service.as_str(), upstreams.len() as u64));
                Ok(upstreams)
            }
            Err(err) => {
                // A stale entry is left as it was, so the next request retries.
                event!(
                    Level::WARN,
                    %service,
                    err = ?err,
                    stale = table.get(service.as_str()).is_some(),
                    "Refresh from discovery failed"
                );
                Err(err)
            }
        }
    }

    async fn lookup(&self, service: &service::Name) -> Result<Vec<Upstream>, Error> {
        let instances = match self.discovery.get_service(service).await {
            Ok(instances) => instances,
            // Prefer a partial answer over no answer.
            Err(LookupError { instances, source }) if !instances.is_empty() => {
                event!(
                    Level::WARN,
                    %service,
                    err = ?source,
                    instances = instances.len(),
                    "Discovery lookup degraded, using partial instances"
                );
                instances
            }
            Err(LookupError { source, .. }) => {
                return Err(Error::BackendUnavailable(source));
            }
        };
        Ok(translate::upstreams_from_instances(&instances)?)
    }

    /// Caches a snapshot pushed by the backend, regardless of the freshness
    /// of the current entry.
    pub(crate) async fn apply_push(
        &self,
        service: &service::Name,
        instances: &[ServiceInstance],
        ttl: Duration,
    ) -> Result<Entry, translate::Error> {
        let upstreams = translate::upstreams_from_instances(instances)?;
        Ok(self.cache.put(service, Arc::new(upstreams), ttl).await)
    }
}
