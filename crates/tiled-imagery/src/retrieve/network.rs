//! Network reachability tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::absent::AbsentResourceList;

/// Failures before a host is considered unreachable.
pub const DEFAULT_HOST_ATTEMPTS: u32 = 7;
/// How long an unreachable host is left alone.
pub const DEFAULT_HOST_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide view of network reachability.
#[derive(Debug)]
pub struct NetworkStatus {
    offline: AtomicBool,
    unavailable_hosts: AbsentResourceList<String>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStatus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_HOST_ATTEMPTS, DEFAULT_HOST_RETRY_INTERVAL)
    }

    #[must_use]
    pub fn with_limits(host_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            offline: AtomicBool::new(false),
            unavailable_hosts: AbsentResourceList::new(host_attempts, retry_interval),
        }
    }

    /// Whether all network retrieval is disabled.
    #[must_use]
    pub fn is_offline_mode(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    pub fn set_offline_mode(&self, offline: bool) {
        if self.offline.swap(offline, Ordering::Relaxed) != offline {
            tracing::info!(offline, "network offline mode changed");
        }
    }

    /// Record a connection failure to `host`.
    pub fn add_unavailable_host(&self, host: &str) {
        self.unavailable_hosts
            .mark_resource_absent(host.to_ascii_lowercase());
        tracing::debug!(host, "host unavailable");
    }

    /// Record a successful connection to `host`.
    pub fn add_available_host(&self, host: &str) {
        self.unavailable_hosts
            .unmark_resource_absent(&host.to_ascii_lowercase());
    }

    #[must_use]
    pub fn is_host_unavailable(&self, host: &str) -> bool {
        self.unavailable_hosts
            .is_resource_absent(&host.to_ascii_lowercase())
    }

    /// Whether `url`'s host is currently reachable as far as we know.
    #[must_use]
    pub fn is_url_available(&self, url: &reqwest::Url) -> bool {
        url.host_str().is_none_or(|host| !self.is_host_unavailable(host))
    }
}
