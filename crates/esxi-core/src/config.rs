//! Connection and behaviour settings.

use std::time::Duration;

/// Default number of download attempts.
pub const DEFAULT_DOWNLOAD_ATTEMPTS: u32 = 5;

/// Default delay between download attempts.
pub const DEFAULT_DOWNLOAD_DELAY: Duration = Duration::from_secs(2);

/// Default number of export lease polls.
pub const DEFAULT_POLL_ATTEMPTS: u32 = 10;

/// Default interval between export lease polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound on property collector pages.
pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// Retry policy for file downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Fixed delay between two attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_DOWNLOAD_ATTEMPTS,
            delay: DEFAULT_DOWNLOAD_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// A single attempt, no retry.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Poll policy for the export lease handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum number of state polls.
    pub attempts: u32,
    /// Wait between two polls.
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_POLL_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PollPolicy {
    /// Create a poll policy.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// Bounds for property collector enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorOptions {
    /// Maximum number of result pages, the initial page included.
    pub max_pages: usize,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

/// Everything needed to talk to one ESXi host.
#[derive(Clone)]
pub struct EsxiConfig {
    /// Host name or address, optionally with a port.
    pub host: String,
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
    /// Verify the host's TLS certificate.
    pub ssl_verify: bool,
    /// Download retry behaviour.
    pub retry: RetryPolicy,
    /// Export lease poll behaviour.
    pub poll: PollPolicy,
    /// Property collector bounds.
    pub collector: CollectorOptions,
}

impl EsxiConfig {
    /// Create a configuration with default policies.
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        ssl_verify: bool,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            ssl_verify,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            collector: CollectorOptions::default(),
        }
    }

    /// Replace the download retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the export poll policy.
    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Replace the property collector bounds.
    pub fn with_collector(mut self, collector: CollectorOptions) -> Self {
        self.collector = collector;
        self
    }
}

impl std::fmt::Debug for EsxiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsxiConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl_verify", &self.ssl_verify)
            .field("retry", &self.retry)
            .field("poll", &self.poll)
            .field("collector", &self.collector)
            .finish()
    }
}
