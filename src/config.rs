// ABOUTME: Reader and IDENTIFY configuration types, built through a small chained builder
// ABOUTME: IdentifyConfig is serialized as-is into the IDENTIFY command body

use serde::Serialize;
use std::time::Duration;

/// The options sent to the broker as the IDENTIFY JSON body (§6).
#[derive(Clone, Debug, Serialize)]
pub struct IdentifyConfig {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub heartbeat_interval: i64,
    pub feature_negotiation: bool,
    pub tls_v1: bool,
    pub snappy: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub sample_rate: i32,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            hostname: String::new(),
            user_agent: format!("nsq-client/{}", env!("CARGO_PKG_VERSION")),
            heartbeat_interval: 30_000,
            feature_negotiation: true,
            tls_v1: false,
            snappy: false,
            deflate: false,
            deflate_level: 6,
            sample_rate: 0,
        }
    }
}

impl IdentifyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(mut self) -> Self {
        self.tls_v1 = true;
        self
    }

    pub fn with_snappy(mut self) -> Self {
        self.snappy = true;
        self.deflate = false;
        self
    }

    pub fn with_deflate(mut self, level: i32) -> Self {
        self.snappy = false;
        self.deflate = true;
        self.deflate_level = level;
        self
    }
}

/// Configuration for a [`crate::reader::Reader`]: seed brokers, discovery
/// endpoints, and the RDY/timing knobs from §6.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    pub nsqd_addresses: Vec<(String, u16)>,
    pub lookupd_addresses: Vec<String>,
    pub max_in_flight: u32,
    pub idle_timeout: Duration,
    pub lookupd_poll_time: Duration,
    /// Off by default (§4.6): periodic redistribution is opt-in.
    pub redistribute_interval: Option<Duration>,
    pub identify: IdentifyConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            nsqd_addresses: Vec::new(),
            lookupd_addresses: Vec::new(),
            max_in_flight: 42,
            idle_timeout: Duration::from_secs(10),
            lookupd_poll_time: Duration::from_secs(60),
            redistribute_interval: None,
            identify: IdentifyConfig::default(),
        }
    }
}

/// Builder for [`ReaderConfig`].
#[derive(Debug, Default)]
pub struct ReaderConfigBuilder {
    config: ReaderConfig,
}

impl ReaderConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nsqd_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.nsqd_addresses.push((host.into(), port));
        self
    }

    pub fn lookupd_address(mut self, url: impl Into<String>) -> Self {
        self.config.lookupd_addresses.push(url.into());
        self
    }

    pub fn max_in_flight(mut self, n: u32) -> Self {
        self.config.max_in_flight = n;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn lookupd_poll_time(mut self, interval: Duration) -> Self {
        self.config.lookupd_poll_time = interval;
        self
    }

    pub fn redistribute_interval(mut self, interval: Duration) -> Self {
        self.config.redistribute_interval = Some(interval);
        self
    }

    pub fn identify(mut self, identify: IdentifyConfig) -> Self {
        self.config.identify = identify;
        self
    }

    pub fn build(self) -> ReaderConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_seed_addresses() {
        let config = ReaderConfigBuilder::new()
            .nsqd_address("127.0.0.1", 4150)
            .nsqd_address("127.0.0.1", 4151)
            .max_in_flight(10)
            .build();

        assert_eq!(config.nsqd_addresses.len(), 2);
        assert_eq!(config.max_in_flight, 10);
    }

    #[test]
    fn identify_config_defaults_negotiate_no_upgrades() {
        let identify = IdentifyConfig::default();
        assert!(!identify.tls_v1);
        assert!(!identify.snappy);
        assert!(!identify.deflate);
    }
}
