//! Session Configuration
//!
//! Centralized configuration for the rendezvous pipeline with environment
//! variable overrides. Slot length must match between sender and receiver;
//! everything else is local tuning.

use std::time::Duration;

use ferry_core::DEFAULT_SLOT_LENGTH;

/// Session configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Advertise/discover on the local link via multicast DNS
    /// (env: FERRY_MDNS)
    pub enable_mdns: bool,

    /// Advertise/discover globally via the DHT (env: FERRY_DHT)
    pub enable_dht: bool,

    /// Truncation granularity for the rendezvous identifier; both sides of a
    /// session must agree (env: FERRY_SLOT_SECS)
    pub slot_length: Duration,

    /// Minimum successful bootstrap connections before the DHT channel
    /// proceeds (env: FERRY_CONN_THRESHOLD)
    pub conn_threshold: usize,

    /// Deadline for a single DHT provider lookup attempt
    /// (env: FERRY_LOOKUP_TIMEOUT_SECS)
    pub lookup_timeout: Duration,

    /// P2P listen port, 0 for ephemeral (env: FERRY_PORT)
    pub listen_port: u16,

    /// Idle connection timeout before the swarm closes a connection
    pub connection_idle_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable_mdns: true,
            enable_dht: true,
            slot_length: DEFAULT_SLOT_LENGTH,
            conn_threshold: 3,
            lookup_timeout: Duration::from_secs(10),
            listen_port: 0,
            connection_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl NetworkConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("FERRY_MDNS") {
            config.enable_mdns = v != "0" && v.to_lowercase() != "false";
        }

        if let Ok(v) = std::env::var("FERRY_DHT") {
            config.enable_dht = v != "0" && v.to_lowercase() != "false";
        }

        if let Ok(v) = std::env::var("FERRY_SLOT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                if secs > 0 {
                    config.slot_length = Duration::from_secs(secs);
                }
            }
        }

        if let Ok(v) = std::env::var("FERRY_CONN_THRESHOLD") {
            if let Ok(parsed) = v.parse::<usize>() {
                config.conn_threshold = parsed;
            }
        }

        if let Ok(v) = std::env::var("FERRY_LOOKUP_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.lookup_timeout = Duration::from_secs(secs);
            }
        }

        if let Ok(v) = std::env::var("FERRY_PORT") {
            if let Ok(parsed) = v.parse::<u16>() {
                config.listen_port = parsed;
            }
        }

        config
    }

    /// A session needs at least one active discovery channel.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enable_mdns && !self.enable_dht {
            return Err("at least one of mDNS and DHT must be enabled".to_string());
        }
        Ok(())
    }
}
