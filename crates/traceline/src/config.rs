//! Recorder configuration.

use crate::emitter::EmitterConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Default collector daemon address.
pub const DEFAULT_DAEMON_ADDRESS: &str = "127.0.0.1:2000";

/// Configuration for a [`Recorder`](crate::Recorder).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the local collector daemon.
    pub daemon_address: SocketAddr,
    /// Logical service name, used as the sampling request descriptor for
    /// traces begun without an explicit request.
    pub service_name: String,
    /// Hard deadline after which a root still waiting on open children is
    /// force-closed so emission cannot be blocked forever.
    pub close_deadline: Duration,
    /// Emitter policy (packet size, queue capacity).
    pub emitter: EmitterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_address: DEFAULT_DAEMON_ADDRESS
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 2000))),
            service_name: String::new(),
            close_deadline: Duration::from_secs(10),
            emitter: EmitterConfig::default(),
        }
    }
}

impl Config {
    /// Sets the collector daemon address.
    pub fn with_daemon_address(mut self, address: SocketAddr) -> Self {
        self.daemon_address = address;
        self
    }

    /// Sets the logical service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Sets the close deadline.
    pub fn with_close_deadline(mut self, deadline: Duration) -> Self {
        self.close_deadline = deadline;
        self
    }

    /// Sets the emitter policy.
    pub fn with_emitter(mut self, emitter: EmitterConfig) -> Self {
        self.emitter = emitter;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_local_daemon() {
        let config = Config::default();
        assert_eq!(config.daemon_address.port(), 2000);
        assert!(config.daemon_address.ip().is_loopback());
    }

    #[test]
    fn builder_setters() {
        let config = Config::default()
            .with_service_name("storefront")
            .with_close_deadline(Duration::from_secs(1));
        assert_eq!(config.service_name, "storefront");
        assert_eq!(config.close_deadline, Duration::from_secs(1));
    }
}
