//! Realtime store connection configuration.

use serde::{Deserialize, Serialize};

/// Connection settings for the realtime key-value store relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
    pub ping_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787".into(),
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 30,
            ping_interval_secs: 25,
            request_timeout_secs: 10,
        }
    }
}
