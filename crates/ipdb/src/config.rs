//! Database configuration.

use std::time::Duration;

use crate::netlink::connection::DEFAULT_TIMEOUT;
use crate::netlink::socket::DEFAULT_RCVBUF;
use crate::netlink::rtnetlink_groups;

/// How mutations on database objects are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Every change is applied to the kernel at once.
    Direct,
    /// The first change opens a transaction; the caller commits.
    #[default]
    Implicit,
    /// Changes need a transaction opened with `begin()`.
    Explicit,
    /// Objects are read-only.
    Snapshot,
}

/// Settings for [`Ipdb`](crate::db::Ipdb).
///
/// ```
/// use std::time::Duration;
/// use ipdb::{Config, Mode};
///
/// let config = Config::new()
///     .mode(Mode::Explicit)
///     .commit_timeout(Duration::from_secs(2));
/// assert_eq!(config.mode, Mode::Explicit);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// How long a commit waits for the kernel to confirm each change.
    pub commit_timeout: Duration,
    /// Timeout of a single netlink request.
    pub request_timeout: Duration,
    /// Receive buffer of the event socket.
    pub rcvbuf: usize,
    /// Multicast groups the event socket joins.
    pub groups: u64,
    /// Reject IPv6 link-local /64 addresses instead of skipping them.
    pub strict_addresses: bool,
    /// Treat `EEXIST` on kernel default devices as an error.
    pub strict_create: bool,
    /// Keep deleted links around in a `flicker` state.
    pub keep_flicker: bool,
    /// Create bonds and bridges through sysfs and ioctls.
    pub ancient: bool,
    /// Trace every proxy verdict.
    pub proxy_debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            commit_timeout: Duration::from_secs(5),
            request_timeout: DEFAULT_TIMEOUT,
            rcvbuf: DEFAULT_RCVBUF,
            groups: rtnetlink_groups::DEFAULT,
            strict_addresses: false,
            strict_create: false,
            keep_flicker: false,
            ancient: false,
            proxy_debug: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !matches!(v.as_str(), "" | "0" | "false" | "no"))
        .unwrap_or(false)
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with `IPDB_ANCIENT` and `IPDB_PROXY_DEBUG` taken from the
    /// environment.
    pub fn from_env() -> Self {
        Self {
            ancient: env_flag("IPDB_ANCIENT"),
            proxy_debug: env_flag("IPDB_PROXY_DEBUG"),
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn rcvbuf(mut self, size: usize) -> Self {
        self.rcvbuf = size;
        self
    }

    pub fn groups(mut self, groups: u64) -> Self {
        self.groups = groups;
        self
    }

    pub fn strict_addresses(mut self, strict: bool) -> Self {
        self.strict_addresses = strict;
        self
    }

    pub fn strict_create(mut self, strict: bool) -> Self {
        self.strict_create = strict;
        self
    }

    pub fn keep_flicker(mut self, keep: bool) -> Self {
        self.keep_flicker = keep;
        self
    }

    pub fn ancient(mut self, ancient: bool) -> Self {
        self.ancient = ancient;
        self
    }

    pub fn proxy_debug(mut self, debug: bool) -> Self {
        self.proxy_debug = debug;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mode, Mode::Implicit);
        assert_eq!(config.commit_timeout, Duration::from_secs(5));
        assert_eq!(config.groups, rtnetlink_groups::DEFAULT);
        assert!(!config.strict_create);
    }

    #[test]
    fn test_builder() {
        let config = Config::new()
            .mode(Mode::Direct)
            .keep_flicker(true)
            .rcvbuf(1 << 20);
        assert_eq!(config.mode, Mode::Direct);
        assert!(config.keep_flicker);
        assert_eq!(config.rcvbuf, 1 << 20);
    }
}
