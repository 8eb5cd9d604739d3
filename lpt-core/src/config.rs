//! Plugin tuning knobs. Durations are plain integer fields so they read naturally in TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with inbound bytes that arrive while a session is throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottlePolicy {
    /// Discard the chunk (reference behaviour; the frame reader may lose sync).
    Drop,
    /// Hold the chunk, pause the channel, replay when the delay has passed.
    Buffer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    /// Connection limit; each originating session uses two channels.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How long an accepting-side half may wait for its other half.
    #[serde(default = "default_half_open_timeout_secs")]
    pub half_open_timeout_secs: u64,
    /// Idle time after which an empty send channel is closed (originating side).
    #[serde(default = "default_put_disconnect_timeout_ms")]
    pub put_disconnect_timeout_ms: u64,
    /// Upper bound on waiting for channels to report closed during teardown.
    #[serde(default = "default_disconnect_linger_ms")]
    pub disconnect_linger_ms: u64,
    #[serde(default = "default_max_queue_bytes")]
    pub max_queue_bytes: usize,
    #[serde(default = "default_throttle")]
    pub throttle: ThrottlePolicy,
}

fn default_max_connections() -> usize {
    128
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_half_open_timeout_secs() -> u64 {
    15
}
fn default_put_disconnect_timeout_ms() -> u64 {
    1000
}
fn default_disconnect_linger_ms() -> u64 {
    1000
}
fn default_max_queue_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_throttle() -> ThrottlePolicy {
    ThrottlePolicy::Buffer
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            half_open_timeout_secs: default_half_open_timeout_secs(),
            put_disconnect_timeout_ms: default_put_disconnect_timeout_ms(),
            disconnect_linger_ms: default_disconnect_linger_ms(),
            max_queue_bytes: default_max_queue_bytes(),
            throttle: default_throttle(),
        }
    }
}

impl PluginConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn half_open_timeout(&self) -> Duration {
        Duration::from_secs(self.half_open_timeout_secs)
    }

    pub fn put_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.put_disconnect_timeout_ms)
    }

    pub fn disconnect_linger(&self) -> Duration {
        Duration::from_millis(self.disconnect_linger_ms)
    }
}
