//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use medlink_core::{RadioBackend, TransportConfig};

/// Tool configuration. File: ~/.config/medlink/config.toml or /etc/medlink/config.toml.
/// Env overrides: MEDLINK_BACKEND, MEDLINK_DATA_DIR, MEDLINK_DEVICE_NAME, MEDLINK_SCAN_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Radio backend: "simulated" (default) or "ble".
    #[serde(default)]
    pub backend: RadioBackend,
    /// Name shown in the exchange payload and used as message sender.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Identity key and trust store live here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// How long `scan` listens (default 10).
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub simulated: SimulatedSection,
}

/// `[transport]`: durations in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransportSection {
    pub max_chunk_size: usize,
    /// Link MTU: largest single radio write.
    pub max_write_size: usize,
    pub inter_chunk_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub challenge_validity_ms: u64,
    pub reassembly_timeout_ms: u64,
    pub require_verified_peers: bool,
}

/// `[simulated]`: demo peers that join the in-process radio.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimulatedSection {
    pub peers: Vec<String>,
}

fn default_device_name() -> String {
    "medlink".to_string()
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/medlink"),
        None => PathBuf::from(".medlink"),
    }
}
fn default_scan_secs() -> u64 {
    10
}

impl Default for TransportSection {
    fn default() -> Self {
        let t = TransportConfig::default();
        Self {
            max_chunk_size: t.max_chunk_size,
            max_write_size: t.max_write_size,
            inter_chunk_delay_ms: millis(t.inter_chunk_delay),
            connect_timeout_ms: millis(t.connect_timeout),
            challenge_validity_ms: millis(t.challenge_validity),
            reassembly_timeout_ms: millis(t.reassembly_timeout),
            require_verified_peers: t.require_verified_peers,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl TransportSection {
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_chunk_size: self.max_chunk_size,
            max_write_size: self.max_write_size,
            inter_chunk_delay: Duration::from_millis(self.inter_chunk_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            challenge_validity: Duration::from_millis(self.challenge_validity_ms),
            reassembly_timeout: Duration::from_millis(self.reassembly_timeout_ms),
            require_verified_peers: self.require_verified_peers,
        }
    }
}

impl Default for SimulatedSection {
    fn default() -> Self {
        Self {
            peers: vec!["ward-tablet".to_string(), "triage-phone".to_string()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: RadioBackend::default(),
            device_name: default_device_name(),
            data_dir: default_data_dir(),
            scan_secs: default_scan_secs(),
            transport: TransportSection::default(),
            simulated: SimulatedSection::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

/// Apply overrides from `var`. Unparseable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MEDLINK_BACKEND") {
        match s.to_ascii_lowercase().as_str() {
            "simulated" => c.backend = RadioBackend::Simulated,
            "ble" => c.backend = RadioBackend::Ble,
            other => tracing::warn!(value = other, "ignoring unknown MEDLINK_BACKEND"),
        }
    }
    if let Some(s) = var("MEDLINK_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
    if let Some(s) = var("MEDLINK_DEVICE_NAME") {
        if !s.trim().is_empty() {
            c.device_name = s;
        }
    }
    if let Some(s) = var("MEDLINK_SCAN_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.scan_secs = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/medlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/medlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| parse(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => {
                    tracing::warn!(path = %p.display(), error = %e, "invalid config; using defaults")
                }
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config"),
            }
            break;
        }
    }
    None
}
