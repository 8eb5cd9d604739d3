//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use lpt_core::{PeerId, PluginConfig};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/lpt/config.toml or /etc/lpt/config.toml.
/// Env overrides: LPT_LISTEN_PORT, LPT_MAX_CONNECTIONS, LPT_IDLE_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Accepting-side listen port (default 8080).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Own identity, hex. A random one is generated when absent.
    #[serde(default)]
    pub peer_id: Option<PeerId>,
    /// URL other peers use to reach this node; only logged.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Peers to keep a session open with.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    /// Keepalive interval; 0 derives it from the idle timeout.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub plugin: PluginConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub peer: PeerId,
    /// Base URL of the peer's endpoint, e.g. `http://10.0.0.2:8080/`.
    pub address: String,
}

fn default_listen_port() -> u16 {
    8080
}
fn default_keepalive_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            peer_id: None,
            public_url: None,
            peers: Vec::new(),
            keepalive_secs: default_keepalive_secs(),
            plugin: PluginConfig::default(),
        }
    }
}

impl Config {
    /// Interval between keepalive frames. `factor` intervals fit into one idle timeout
    /// when no explicit interval is configured.
    pub fn keepalive_interval(&self, factor: u32) -> Duration {
        if self.keepalive_secs > 0 {
            return Duration::from_secs(self.keepalive_secs);
        }
        let idle = self.plugin.idle_timeout();
        (idle / factor.max(1)).max(Duration::from_secs(1))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply overrides from `lookup`; unparsable values are ignored.
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(s) = lookup("LPT_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Some(s) = lookup("LPT_MAX_CONNECTIONS") {
        if let Ok(n) = s.parse::<usize>() {
            c.plugin.max_connections = n;
        }
    }
    if let Some(s) = lookup("LPT_IDLE_TIMEOUT_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.plugin.idle_timeout_secs = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lpt/config.toml"));
    }
    out.push(PathBuf::from("/etc/lpt/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpt_core::ThrottlePolicy;
    use std::collections::HashMap;

    const PEER: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.listen_port, 8080);
        assert_eq!(c.keepalive_secs, 30);
        assert!(c.peer_id.is_none());
        assert!(c.peers.is_empty());
        assert_eq!(c.plugin, PluginConfig::default());
    }

    #[test]
    fn full_file() {
        let text = format!(
            r#"
listen_port = 9000
peer_id = "{PEER}"
public_url = "http://node.example:9000/"
keepalive_secs = 10

[[peers]]
peer = "{PEER}"
address = "http://10.0.0.2:8080/"

[plugin]
max_connections = 16
throttle = "drop"
"#
        );
        let c: Config = toml::from_str(&text).unwrap();
        assert_eq!(c.listen_port, 9000);
        assert_eq!(c.peer_id, Some(PEER.parse().unwrap()));
        assert_eq!(c.peers.len(), 1);
        assert_eq!(c.peers[0].address, "http://10.0.0.2:8080/");
        assert_eq!(c.plugin.max_connections, 16);
        assert_eq!(c.plugin.throttle, ThrottlePolicy::Drop);
        assert_eq!(c.plugin.idle_timeout_secs, 300);
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(toml::from_str::<Config>("listen = 1").is_err());
        assert!(toml::from_str::<Config>("peer_id = \"zz\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LPT_LISTEN_PORT", "7000"),
            ("LPT_MAX_CONNECTIONS", "4"),
            ("LPT_IDLE_TIMEOUT_SECS", "not a number"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 7000);
        assert_eq!(c.plugin.max_connections, 4);
        assert_eq!(c.plugin.idle_timeout_secs, 300);
    }

    #[test]
    fn keepalive_interval_derived_from_idle_timeout() {
        let mut c = Config::default();
        assert_eq!(c.keepalive_interval(3), Duration::from_secs(30));
        c.keepalive_secs = 0;
        assert_eq!(c.keepalive_interval(3), Duration::from_secs(100));
        c.plugin.idle_timeout_secs = 1;
        assert_eq!(c.keepalive_interval(3), Duration::from_secs(1));
    }
}
