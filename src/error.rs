//! Typed error taxonomy and retry policy.

use std::time::Duration;

use thiserror::Error;

/// The classification a [`FetchError`] is reduced to at the boundary
/// between the user's fetch function and the cache core. Never unwinds
/// past this point — it only ever becomes observable `error` state on a
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    Network,
    Timeout,
    Parsing,
    Server,
    Unknown,
}

/// Error surfaced to a query/mutation handle's `error` field.
#[derive(Debug, Error, Clone)]
#[error("{kind:?}: {message}")]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        QueryError {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(request_timeout: Duration) -> Self {
        QueryError::new(
            QueryErrorKind::Timeout,
            format!("request exceeded timeout of {request_timeout:?}"),
        )
    }

    pub fn cancelled() -> Self {
        QueryError::new(QueryErrorKind::Unknown, "fetch attempt was cancelled")
    }
}

/// What the user's fetch function can fail with. The cache classifies this
/// into a [`QueryErrorKind`] via [`classify`].
#[derive(Debug, Clone)]
pub struct FetchError {
    pub status: Option<u16>,
    pub is_timeout: bool,
    pub is_parsing: bool,
    pub message: String,
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        FetchError {
            status: None,
            is_timeout: false,
            is_parsing: false,
            message: message.into(),
        }
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        FetchError {
            status: None,
            is_timeout: false,
            is_parsing: true,
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        FetchError {
            status: Some(status),
            is_timeout: false,
            is_parsing: false,
            message: message.into(),
        }
    }
}

/// Classification rules: transport failure with no status →
/// `Network`; explicit timeout → `Timeout`; decode/transform failure →
/// `Parsing`; HTTP status >= 500 → `Server`; anything else → `Unknown`.
pub fn classify(error: &FetchError) -> QueryErrorKind {
    if error.is_timeout {
        QueryErrorKind::Timeout
    } else if error.is_parsing {
        QueryErrorKind::Parsing
    } else if let Some(status) = error.status {
        if status >= 500 {
            QueryErrorKind::Server
        } else {
            QueryErrorKind::Unknown
        }
    } else {
        QueryErrorKind::Network
    }
}

/// Exponential backoff with jitter, applied between retry attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_network_retries: u32,
    pub max_timeout_retries: u32,
    pub max_server_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_network_retries: 3,
            max_timeout_retries: 3,
            max_server_retries: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Whether a fetch that just failed with `kind` after `attempt` prior
    /// attempts (0-indexed) should retry.
    pub fn should_retry(&self, kind: QueryErrorKind, attempt: u32) -> bool {
        match kind {
            QueryErrorKind::Network => attempt < self.max_network_retries,
            QueryErrorKind::Timeout => attempt < self.max_timeout_retries,
            QueryErrorKind::Server => attempt < self.max_server_retries,
            QueryErrorKind::Parsing | QueryErrorKind::Unknown => false,
        }
    }

    /// Backoff delay before retry attempt number `attempt` (0-indexed),
    /// with jitter seeded from a caller-supplied `[0,1)` sample so the
    /// policy itself stays deterministic and test-friendly.
    pub fn backoff(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jitter_factor = 1.0 + self.jitter * (jitter_sample * 2.0 - 1.0);
        Duration::from_millis((capped * jitter_factor).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_rule() {
        assert_eq!(classify(&FetchError::network("x")), QueryErrorKind::Network);
        assert_eq!(classify(&FetchError::parsing("x")), QueryErrorKind::Parsing);
        assert_eq!(classify(&FetchError::server(503, "x")), QueryErrorKind::Server);
        assert_eq!(classify(&FetchError::server(404, "x")), QueryErrorKind::Unknown);
        let mut timeout = FetchError::network("x");
        timeout.is_timeout = true;
        assert_eq!(classify(&timeout), QueryErrorKind::Timeout);
    }

    #[test]
    fn retry_boundedness() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(QueryErrorKind::Network, 2));
        assert!(!policy.should_retry(QueryErrorKind::Network, 3));
        assert!(!policy.should_retry(QueryErrorKind::Parsing, 0));
        assert!(policy.should_retry(QueryErrorKind::Server, 0));
        assert!(!policy.should_retry(QueryErrorKind::Server, 1));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        let first = policy.backoff(0, 0.5);
        let second = policy.backoff(1, 0.5);
        assert!(second > first);
        let capped = policy.backoff(10, 0.5);
        assert!(capped <= policy.max_delay + policy.max_delay.mul_f64(policy.jitter));
    }
}
