//! Client-wide defaults and per-query overrides.

use std::time::Duration;

use crate::error::RetryPolicy;

pub const DEFAULT_STALE_DURATION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CACHE_DURATION: Duration = Duration::MAX;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Option<tracing::Level> {
        match self {
            LogLevel::None => None,
            LogLevel::Error => Some(tracing::Level::ERROR),
            LogLevel::Warn => Some(tracing::Level::WARN),
            LogLevel::Info => Some(tracing::Level::INFO),
            LogLevel::Debug => Some(tracing::Level::DEBUG),
            LogLevel::Verbose => Some(tracing::Level::TRACE),
        }
    }

    /// Whether a configured level of `self` allows an event logged at
    /// `event_level` through. Mirrors ordinary log-level filtering: a level
    /// allows itself and anything less verbose (`Warn` allows `Warn` and
    /// `Error`, but not `Info`).
    pub fn allows(self, event_level: LogLevel) -> bool {
        self >= event_level
    }
}

/// Client-wide defaults, narrowed per query by [`QueryOptions`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub default_stale_duration: Duration,
    pub default_cache_duration: Duration,
    pub refetch_on_window_focus: bool,
    pub refetch_on_reconnect: bool,
    pub request_timeout: Duration,
    pub log_level: LogLevel,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            default_stale_duration: DEFAULT_STALE_DURATION,
            default_cache_duration: DEFAULT_CACHE_DURATION,
            refetch_on_window_focus: false,
            refetch_on_reconnect: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            log_level: LogLevel::Warn,
        }
    }
}

/// Per-query overrides of the client defaults. NOTE: if different
/// `stale_duration`/`cache_duration` values are declared across observers
/// of the same key, the entry keeps the maximum observed value (see
/// [`crate::garbage_collector`]).
#[derive(Clone)]
pub struct QueryOptions {
    pub stale_duration: Option<Duration>,
    pub cache_duration: Option<Duration>,
    pub refetch_interval: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub enabled: bool,
    pub refetch_on_signal_change: bool,
    pub log_level: Option<LogLevel>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            stale_duration: None,
            cache_duration: None,
            refetch_interval: None,
            request_timeout: None,
            retry: RetryPolicy::default(),
            enabled: true,
            refetch_on_signal_change: false,
            log_level: None,
        }
    }
}

impl QueryOptions {
    pub fn stale_duration(mut self, d: Duration) -> Self {
        self.stale_duration = Some(d);
        self
    }

    pub fn cache_duration(mut self, d: Duration) -> Self {
        self.cache_duration = Some(d);
        self
    }

    pub fn refetch_interval(mut self, d: Duration) -> Self {
        self.refetch_interval = Some(d);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
