use crate::probe::{Credentials, DEFAULT_CONNECT_TARGET, ProbeConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub probe: ProbeSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
    pub shutdown_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            shutdown_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeSettings {
    /// Proxy checked by the periodic probe. No server, no periodic probe.
    pub server: Option<String>,
    pub timeout_ms: u64,
    pub connect_target: String,
    pub udp_test: bool,
    /// 0 disables the periodic probe.
    pub interval_secs: u64,
    pub auth: Option<Credentials>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            server: None,
            timeout_ms: 3000,
            connect_target: DEFAULT_CONNECT_TARGET.to_string(),
            udp_test: false,
            interval_secs: 0,
            auth: None,
        }
    }
}

impl ProbeSettings {
    pub fn probe_config(&self, server: &str) -> ProbeConfig {
        ProbeConfig {
            server: server.to_string(),
            timeout: Duration::from_millis(self.timeout_ms),
            auth: self.auth.clone(),
            connect_target: self.connect_target.clone(),
            udp_test: self.udp_test,
        }
    }

    /// Server and period of the background probe, when enabled.
    pub fn periodic(&self) -> Option<(&str, Duration)> {
        match (&self.server, self.interval_secs) {
            (Some(server), secs) if secs > 0 => Some((server.as_str(), Duration::from_secs(secs))),
            _ => None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&content)?;
        Ok(cfg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
