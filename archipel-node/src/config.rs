//! Load node configuration from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Node configuration. File: ~/.config/archipel/config.toml or
/// /etc/archipel/config.toml. Env overrides: ARCHIPEL_DISCOVERY_PORT,
/// ARCHIPEL_BROADCAST_INTERVAL_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 6000). The secure channel binds the next
    /// port up.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Seconds between HELLO beacons (default 2; 30 suits quiet networks).
    #[serde(default = "default_broadcast_interval_secs")]
    pub broadcast_interval_secs: u64,
    /// Directory offered files are expected under.
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,
    /// Directory completed downloads are written to.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// TOFU ledger location.
    #[serde(default = "default_trust_store_path")]
    pub trust_store_path: PathBuf,
}

fn default_discovery_port() -> u16 {
    6000
}
fn default_broadcast_interval_secs() -> u64 {
    2
}
fn default_share_dir() -> PathBuf {
    PathBuf::from("data/share")
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("data/downloads")
}
fn default_trust_store_path() -> PathBuf {
    PathBuf::from("data/trust/trust_store.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            broadcast_interval_secs: default_broadcast_interval_secs(),
            share_dir: default_share_dir(),
            download_dir: default_download_dir(),
            trust_store_path: default_trust_store_path(),
        }
    }
}

impl Config {
    /// Secure-channel port: discovery port + 1.
    pub fn secure_port(&self) -> u16 {
        self.discovery_port.saturating_add(1)
    }
}

/// Load config: merge defaults, then the config file (if present), then env
/// vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let mut config = load_file(explicit).unwrap_or_default();
    if let Ok(s) = std::env::var("ARCHIPEL_DISCOVERY_PORT") {
        if let Ok(port) = s.parse::<u16>() {
            config.discovery_port = port;
        }
    }
    if let Ok(s) = std::env::var("ARCHIPEL_BROADCAST_INTERVAL_SECS") {
        if let Ok(secs) = s.parse::<u64>() {
            config.broadcast_interval_secs = secs.max(1);
        }
    }
    config
}

fn config_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/archipel/config.toml"));
    }
    out.push(PathBuf::from("/etc/archipel/config.toml"));
    out
}

fn load_file(explicit: Option<&Path>) -> Option<Config> {
    for path in config_paths(explicit) {
        if path.exists() {
            if let Ok(text) = std::fs::read_to_string(&path) {
                match toml::from_str::<Config>(&text) {
                    Ok(config) => return Some(config),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config")
                    }
                }
            }
            break;
        }
    }
    None
}
