//! Upstreams for a single configured service.

use crate::config::{self, UpstreamsConfig};
use crate::push::{PushStats, PushTask};
use crate::refresh::{self, Refresher};
use crate::service;
use crate::upstream::AllUpstreams;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{event, instrument, Level};

/// Supplies the candidate upstreams for a proxied request.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn get_upstreams(&self) -> Result<AllUpstreams, refresh::Error>;
}

/// Upstreams of one service, resolved lazily and kept current by a watch.
pub struct DiscoveryUpstreams {
    service: service::Name,
    ttl: Duration,
    refresher: Arc<Refresher>,
    push: PushTask,
}

impl DiscoveryUpstreams {
    /// Validates `config` and starts watching its service.
    ///
    /// The discovery client behind `refresher` is expected to have been built
    /// from `config.config`. Must be called from within a tokio runtime.
    ///
    /// ```no_run
    /// use discovery_upstreams::cache::Cache;
    /// use discovery_upstreams::config::UpstreamsConfig;
    /// use discovery_upstreams::discoveries::fixed::FixedDiscovery;
    /// use discovery_upstreams::refresh::Refresher;
    /// use discovery_upstreams::source::{DiscoveryUpstreams, UpstreamSource};
    /// use std::sync::Arc;
    ///
    /// # async fn f(config: UpstreamsConfig) {
    /// let refresher = Refresher::new(
    ///     Arc::new(Cache::default()),
    ///     Arc::new(FixedDiscovery::new()),
    /// )
    /// .unwrap();
    /// let mut upstreams = DiscoveryUpstreams::provision(&config, Arc::new(refresher)).unwrap();
    ///
    /// // Once per request:
    /// let dial_targets = upstreams.get_upstreams().await.unwrap();
    ///
    /// upstreams.terminate().await;
    /// # }
    /// ```
    #[instrument(
        skip(config, refresher),
        fields(service = %config.service),
        err,
        name = "DiscoveryUpstreams::provision"
    )]
    pub fn provision(
        config: &UpstreamsConfig,
        refresher: Arc<Refresher>,
    ) -> Result<Self, config::Error> {
        config.validate()?;
        let service = config.service_name();
        let ttl = config.refresh_or_default();

        let push = PushTask::spawn(refresher.clone(), service.clone(), ttl);
        event!(Level::INFO, ?ttl, "Provisioned discovery upstreams");

        Ok(Self {
            service,
            ttl,
            refresher,
            push,
        })
    }

    pub fn service(&self) -> &service::Name {
        &self.service
    }

    /// How long resolved upstreams are served before asking the backend.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn refresher(&self) -> &Arc<Refresher> {
        &self.refresher
    }

    /// Returns a receiver tracking the service's watch.
    pub fn push_monitor(&self) -> watch::Receiver<PushStats> {
        self.push.monitor()
    }

    /// Stops watching the service. Cached upstreams are kept.
    pub async fn terminate(&mut self) {
        self.push.terminate().await;
    }
}

impl std::fmt::Display for DiscoveryUpstreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.service.fmt(f)
    }
}

#[async_trait]
impl UpstreamSource for DiscoveryUpstreams {
    async fn get_upstreams(&self) -> Result<AllUpstreams, refresh::Error> {
        self.refresher
            .resolve_with_ttl(&self.service, self.ttl)
            .await
    }
}
