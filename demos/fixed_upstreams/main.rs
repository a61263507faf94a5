//! Serves upstreams for one service out of an in-memory discovery backend.
//!
//! Usage: `fixed_upstreams [CONFIG_JSON]`
//!
//! The configuration has the same shape a proxy would deserialize, e.g.
//! `{"service":"echo","refresh":"2s","config":{"backend":"nacos","addr":"127.0.0.1","port":8848}}`.
//! The Nacos settings are only validated here; instances come from a
//! [FixedDiscovery] that the demo edits while running.

use anyhow::Context;
use discovery_upstreams::cache::Cache;
use discovery_upstreams::config::{DiscoveryConfig, UpstreamsConfig};
use discovery_upstreams::discoveries::fixed::FixedDiscovery;
use discovery_upstreams::discovery::ServiceInstance;
use discovery_upstreams::policy::Policy;
use discovery_upstreams::refresh::Refresher;
use discovery_upstreams::source::{DiscoveryUpstreams, UpstreamSource};
use std::env;
use std::sync::Arc;
use tokio::time::Duration;

const DEFAULT_CONFIG: &str = r#"{
    "service": "echo",
    "refresh": "2s",
    "config": { "backend": "nacos", "addr": "127.0.0.1", "port": 8848 }
}"#;

async fn print_upstreams(upstreams: &DiscoveryUpstreams) -> anyhow::Result<()> {
    let found = upstreams.get_upstreams().await?;
    let dials: Vec<_> = found.iter().map(|u| u.dial()).collect();
    println!("{upstreams}: {dials:?}");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let raw = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config: UpstreamsConfig =
        serde_json::from_str(&raw).context("Failed to parse configuration")?;
    if let Some(DiscoveryConfig::Nacos(nacos)) = &config.config {
        println!("Nacos client options: {:?}", nacos.client_options());
    }

    let discovery = Arc::new(FixedDiscovery::new());
    discovery.replace(
        config.service_name(),
        vec![
            ServiceInstance::new(["http://127.0.0.1:3030", "http://127.0.0.1:3031"]),
            ServiceInstance::new(["not a url", "http://127.0.0.1:3032"]),
        ],
    );

    let cache = Arc::new(Cache::new(Policy::default()));
    let refresher = match Refresher::new(cache, discovery.clone()) {
        Ok(refresher) => refresher,
        Err(err) => {
            eprintln!("{err}; continuing without probes");
            err.into_inner()
        }
    };
    let mut upstreams = DiscoveryUpstreams::provision(&config, Arc::new(refresher))?;
    print_upstreams(&upstreams).await?;

    let mut monitor = upstreams.push_monitor();
    monitor
        .wait_for(|stats| stats.applied >= 1)
        .await
        .context("Watch stopped")?;

    // Changes reach the cache through the watch, without waiting for the
    // refresh interval to pass.
    discovery.replace(
        config.service_name(),
        vec![ServiceInstance::new(["https://127.0.0.1:4040"])],
    );
    monitor
        .wait_for(|stats| stats.applied >= 2)
        .await
        .context("Watch stopped")?;
    print_upstreams(&upstreams).await?;

    tokio::time::sleep(upstreams.ttl() + Duration::from_millis(100)).await;
    print_upstreams(&upstreams).await?;

    println!("Watch: {:?}", upstreams.push_monitor().borrow().clone());
    upstreams.terminate().await;
    Ok(())
}
