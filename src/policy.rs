//! Configuration options which can alter the behavior of the cache.

use std::time::Duration;

/// How long a refreshed entry is served before the backend is asked again,
/// unless configured otherwise.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// How many services the cache tracks before it starts evicting.
pub const DEFAULT_CAPACITY: usize = 100;

/// First delay after a watch returns an error.
pub const DEFAULT_MIN_WATCH_BACKOFF: Duration = Duration::from_millis(100);

/// Longest delay between consecutive watch errors.
pub const DEFAULT_MAX_WATCH_BACKOFF: Duration = Duration::from_secs(30);

/// Policy which is applicable to an upstream cache, and the push tasks
/// writing into it.
#[derive(Clone, Debug)]
pub struct Policy {
    /// The maximum number of distinct services held by the cache.
    ///
    /// Inserting a new service into a full cache evicts an arbitrary one.
    pub capacity: usize,

    /// TTL used for entries created without an explicit TTL.
    pub default_ttl: Duration,

    /// After a watch returns an error, the push task waits at least this
    /// long before asking it again.
    ///
    /// The delay doubles with each consecutive error, and resets once a
    /// snapshot arrives.
    pub min_watch_backoff: Duration,

    /// Upper bound on the delay between consecutive watch errors.
    pub max_watch_backoff: Duration,

    /// Upper bound on the random jitter added to the first delay.
    pub spread: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            default_ttl: DEFAULT_TTL,
            min_watch_backoff: DEFAULT_MIN_WATCH_BACKOFF,
            max_watch_backoff: DEFAULT_MAX_WATCH_BACKOFF,
            spread: Duration::from_millis(20),
        }
    }
}
