//! Configuration for a discovery-backed upstream source.
//!
//! With the `serde` feature, every type here can be deserialized from the
//! proxy's configuration, e.g.
//!
//! ```json
//! {
//!   "service": "echo",
//!   "refresh": "30s",
//!   "config": { "backend": "nacos", "addr": "10.0.0.5", "port": 8848 }
//! }
//! ```

use crate::service;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("No discovery backend is configured")]
    MissingDiscovery,

    #[error("No service name is configured")]
    EmptyService,

    #[error("Invalid discovery backend configuration: {0}")]
    InvalidBackend(&'static str),

    #[error("Invalid duration {0:?}")]
    InvalidDuration(String),
}

/// How long resolved upstreams are cached, when not configured.
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(60);

/// Configuration of a single service's upstreams.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct UpstreamsConfig {
    /// The service to resolve.
    #[cfg_attr(feature = "serde", serde(default))]
    pub service: String,

    /// How to reach the discovery backend.
    #[cfg_attr(feature = "serde", serde(default))]
    pub config: Option<DiscoveryConfig>,

    /// How long resolved upstreams are cached.
    ///
    /// Accepts nanoseconds, or a string such as `"1m"` or `"1h30m"`.
    ///
    /// Default: 1 minute
    #[cfg_attr(
        feature = "serde",
        serde(default, deserialize_with = "duration::deserialize_option")
    )]
    pub refresh: Option<Duration>,
}

impl UpstreamsConfig {
    pub fn new(service: impl ToString, config: DiscoveryConfig) -> Self {
        Self {
            service: service.to_string(),
            config: Some(config),
            refresh: None,
        }
    }

    /// Checks that the configuration can be provisioned.
    pub fn validate(&self) -> Result<(), Error> {
        if self.service.is_empty() {
            return Err(Error::EmptyService);
        }
        match &self.config {
            Some(config) => config.validate(),
            None => Err(Error::MissingDiscovery),
        }
    }

    pub fn service_name(&self) -> service::Name {
        service::Name::new(&self.service)
    }

    /// The configured refresh interval; unset or zero means the default.
    pub fn refresh_or_default(&self) -> Duration {
        match self.refresh {
            Some(refresh) if !refresh.is_zero() => refresh,
            _ => DEFAULT_REFRESH,
        }
    }
}

/// Describes the discovery backend.
///
/// The backend client itself lives outside this crate; these values are
/// handed to it unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize),
    serde(tag = "backend", rename_all = "snake_case")
)]
pub enum DiscoveryConfig {
    Nacos(NacosConfig),
}

impl DiscoveryConfig {
    fn validate(&self) -> Result<(), Error> {
        match self {
            DiscoveryConfig::Nacos(nacos) => nacos.validate(),
        }
    }
}

pub const DEFAULT_NACOS_NAMESPACE: &str = "public";
pub const DEFAULT_NACOS_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_NACOS_CACHE_DIR: &str = "./nacos_cache/cache";
pub const DEFAULT_NACOS_LOG_DIR: &str = "./nacos_cache/log";
pub const DEFAULT_NACOS_LOG_LEVEL: &str = "error";

/// Connection details for a Nacos naming server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct NacosConfig {
    pub addr: String,
    pub port: u16,

    /// Default: "public"
    #[cfg_attr(feature = "serde", serde(default, rename = "namespaceId"))]
    pub namespace_id: Option<String>,

    /// Client-side request timeout.
    ///
    /// Default: 5 seconds
    #[cfg_attr(
        feature = "serde",
        serde(default, deserialize_with = "duration::deserialize_option")
    )]
    pub timeout: Option<Duration>,

    #[cfg_attr(feature = "serde", serde(default))]
    pub cache_dir: Option<PathBuf>,

    #[cfg_attr(feature = "serde", serde(default))]
    pub log_dir: Option<PathBuf>,

    #[cfg_attr(feature = "serde", serde(default))]
    pub log_level: Option<String>,
}

/// Options for constructing a Nacos naming client, with defaults applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NacosClientOptions {
    pub server_addr: String,
    pub server_port: u16,
    pub namespace_id: String,
    pub timeout: Duration,
    /// Don't serve the client's on-disk cache before the first lookup.
    pub not_load_cache_at_start: bool,
    /// Let the client overwrite its cache with empty results.
    pub update_cache_when_empty: bool,
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl NacosConfig {
    pub fn new(addr: impl ToString, port: u16) -> Self {
        Self {
            addr: addr.to_string(),
            port,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.addr.is_empty() {
            return Err(Error::InvalidBackend("nacos addr is empty"));
        }
        if self.port == 0 {
            return Err(Error::InvalidBackend("nacos port is zero"));
        }
        Ok(())
    }

    pub fn client_options(&self) -> NacosClientOptions {
        let namespace_id = match self.namespace_id.as_deref() {
            None | Some("") => DEFAULT_NACOS_NAMESPACE.to_string(),
            Some(namespace) => namespace.to_string(),
        };
        NacosClientOptions {
            server_addr: self.addr.clone(),
            server_port: self.port,
            namespace_id,
            timeout: self.timeout.unwrap_or(DEFAULT_NACOS_TIMEOUT),
            not_load_cache_at_start: true,
            update_cache_when_empty: true,
            cache_dir: self
                .cache_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_NACOS_CACHE_DIR)),
            log_dir: self
                .log_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_NACOS_LOG_DIR)),
            log_level: self
                .log_level
                .clone()
                .unwrap_or_else(|| DEFAULT_NACOS_LOG_LEVEL.to_string()),
        }
    }
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parses durations such as `"250ms"`, `"1.5s"`, `"1m"`, `"1h30m"` or `"2d"`.
///
/// Each component is a decimal number, optionally with a fraction, followed
/// by a unit: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h` or `d`. A bare `"0"`
/// is also accepted. Negative durations are rejected, and fractions finer
/// than a nanosecond are truncated.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || Error::InvalidDuration(input.to_string());
    let mut rest = input.trim();
    if let Some(unsigned) = rest.strip_prefix('+') {
        rest = unsigned;
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 60 * 60 * NANOS_PER_SEC,
            "d" => 24 * 60 * 60 * NANOS_PER_SEC,
            _ => return Err(invalid()),
        };
        let nanos = component_nanos(number, unit_nanos).ok_or_else(invalid)?;
        total = total.checked_add(nanos).ok_or_else(invalid)?;
        rest = tail;
    }

    let secs = u64::try_from(total / NANOS_PER_SEC).map_err(|_| invalid())?;
    // The remainder is below one second, so it fits.
    let subsec_nanos = (total % NANOS_PER_SEC) as u32;
    Ok(Duration::new(secs, subsec_nanos))
}

// `number` is `whole[.fraction]`, where either side may be empty but not both.
fn component_nanos(number: &str, unit_nanos: u128) -> Option<u128> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return None;
    }
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut nanos = whole.checked_mul(unit_nanos)?;

    let mut scale = unit_nanos;
    for digit in fraction.chars() {
        scale /= 10;
        nanos = nanos.checked_add(u128::from(digit.to_digit(10)?) * scale)?;
    }
    Some(nanos)
}

#[cfg(feature = "serde")]
mod duration {
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;
    use std::time::Duration;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration in nanoseconds, or a string such as \"1m\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_nanos(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_nanos)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }

    struct OptionVisitor;

    impl<'de> Visitor<'de> for OptionVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an optional duration")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            d.deserialize_any(DurationVisitor).map(Some)
        }
    }

    pub(super) fn deserialize_option<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        d.deserialize_option(OptionVisitor)
    }
}
