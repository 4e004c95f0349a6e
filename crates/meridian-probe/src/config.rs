use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Probe configuration, layered: built-in defaults, then the TOML file, then
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub probe: ProbeInfo,
    pub server: ServerSettings,
    pub capabilities: Vec<String>,
    pub executor: ExecutorSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeInfo {
    pub name: String,
    pub location: String,
    pub region: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// WebSocket URL of the controller, e.g. `ws://host:8080/ws`.
    pub url: String,
    pub auth_token: String,
    /// Seconds between reconnect attempts (linear).
    pub reconnect_interval: u64,
    /// 0 retries forever.
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub max_concurrent_tasks: usize,
    /// Default per-task timeout in seconds when the assignment carries none.
    pub task_timeout: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe: ProbeInfo::default(),
            server: ServerSettings::default(),
            capabilities: vec![
                meridian_proto::TASK_ICMP_PING.to_string(),
                meridian_proto::TASK_TCP_PING.to_string(),
                meridian_proto::TASK_TRACEROUTE.to_string(),
                meridian_proto::TASK_BIRD_ROUTE.to_string(),
            ],
            executor: ExecutorSettings::default(),
        }
    }
}

impl Default for ProbeInfo {
    fn default() -> Self {
        Self {
            name: "Default Probe".to_string(),
            location: String::new(),
            region: String::new(),
            latitude: None,
            longitude: None,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            auth_token: String::new(),
            reconnect_interval: 5,
            max_reconnect_attempts: 0,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            task_timeout: 300,
        }
    }
}

impl ProbeConfig {
    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(config_path).exists() {
            toml::from_str(&fs::read_to_string(config_path)?)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(name) = env::var("PROBE_NAME") {
            self.probe.name = name;
        }
        if let Ok(location) = env::var("PROBE_LOCATION") {
            self.probe.location = location;
        }
        if let Ok(region) = env::var("PROBE_REGION") {
            self.probe.region = region;
        }
        if let Ok(lat) = env::var("PROBE_LATITUDE") {
            if let Ok(v) = lat.trim().parse::<f64>() {
                self.probe.latitude = Some(v);
            }
        }
        if let Ok(lon) = env::var("PROBE_LONGITUDE") {
            if let Ok(v) = lon.trim().parse::<f64>() {
                self.probe.longitude = Some(v);
            }
        }
        if let Ok(url) = env::var("SERVER_URL") {
            self.server.url = url;
        }
        if let Ok(token) = env::var("AUTH_TOKEN") {
            self.server.auth_token = token;
        }
    }
}
