//! Dial targets handed to the reverse proxy.

use std::sync::Arc;

/// A single dial target, as `host` or `host:port`.
///
/// Upstreams are produced by [crate::translate] and never change afterwards.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Upstream {
    dial: Arc<str>,
}

impl Upstream {
    pub fn new(dial: impl Into<Arc<str>>) -> Self {
        Self { dial: dial.into() }
    }

    /// The network address the proxy should dial.
    pub fn dial(&self) -> &str {
        &self.dial
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.dial.fmt(f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Upstream {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.dial.serialize(serializer)
    }
}

impl From<String> for Upstream {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&'_ str> for Upstream {
    fn from(s: &'_ str) -> Self {
        Self::new(s)
    }
}

/// The ordered upstreams of one service, shared between the cache and its
/// readers.
pub type AllUpstreams = Arc<Vec<Upstream>>;
