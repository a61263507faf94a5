//! discovery-upstreams resolves reverse-proxy upstreams from a
//! service-discovery backend.
//!
//! It uses the following terminology:
//! * Services are named entities registered with a discovery backend.
//! * Instances are the registered replicas of a service, each advertising
//!   one or more endpoint URIs.
//! * Upstreams are the dial addresses handed to the proxy, translated from
//!   the endpoints of every instance.
//!
//! # Usage
//!
//! * The per-request interface is [refresh::Refresher], or
//!   [source::DiscoveryUpstreams] for a single configured service.
//! * To construct a refresher, you must supply a [cache::Cache] and a
//!   [discovery::Discovery]. The cache may be shared between refreshers
//!   that talk to different backends.
//!
//! Resolution is served from the cache while an entry is fresh. A stale or
//! missing entry is refreshed synchronously from the backend, under the
//! cache's write lock. Independently, a [push::PushTask] keeps a watch open
//! on each configured service and writes every pushed snapshot straight
//! into the cache.
//!
//! # DTrace probes
//!
//! This crate contains a number of DTrace USDT probes, which fire as upstreams
//! are resolved and refreshed. The full list of probes is:
//!
//! - `resolve-start`: Fires before resolving upstreams for a service.
//! - `resolve-done`: Fires before returning upstreams to the caller.
//! - `resolve-failed`: Fires when resolution returns an error.
//! - `refresh-start`: Fires before a synchronous lookup against the backend.
//! - `refresh-done`: Fires after a synchronous lookup has been cached.
//! - `push-applied`: Fires when a pushed snapshot has been cached.
//! - `push-skipped`: Fires when a pushed snapshot could not be used.
//! - `evict`: Fires when a full cache evicts an entry to make room.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly enabled,
//! by tracing the program with the `dtrace(1)` command-line tool.
//!
//! Registering the probes is technically fallible. [refresh::Refresher::new]
//! returns a `Result` whose error variant still gives access to the
//! refresher, so applications can decide whether that failure matters.

// Public API
pub mod cache;
pub mod config;
pub mod discovery;
pub mod policy;
pub mod push;
pub mod refresh;
pub mod service;
pub mod source;
pub mod translate;
pub mod upstream;

// Necessary for implementation
mod backoff;
mod join;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod discoveries;

/// USDT probes for tracing how upstreams are resolved and refreshed.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "discovery_upstreams")]
mod probes {
    /// Fires right before resolving upstreams for a service.
    fn resolve__start(service: &str) {}

    /// Fires when upstreams are returned to the caller, with the number of
    /// upstreams.
    fn resolve__done(service: &str, upstreams: u64) {}

    /// Fires when resolution fails, with a string identifying the reason.
    fn resolve__failed(service: &str, reason: &str) {}

    /// Fires right before looking up a stale or missing service against the
    /// discovery backend.
    fn refresh__start(service: &str) {}

    /// Fires after a synchronous lookup has been translated and cached.
    fn refresh__done(service: &str, upstreams: u64) {}

    /// Fires after a snapshot pushed through a watch has been cached.
    fn push__applied(service: &str, upstreams: u64) {}

    /// Fires when a pushed snapshot is dropped, with the reason.
    fn push__skipped(service: &str, reason: &str) {}

    /// Fires when a full cache evicts `evicted` to make room for `service`.
    fn evict(service: &str, evicted: &str) {}
}
