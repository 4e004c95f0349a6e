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

/// Controller configuration: defaults, overlaid by an optional TOML file,
/// overlaid by environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_port: u16,
    pub database_path: String,
    /// Bootstrap probe-auth secret; a persisted `shared_secret` config
    /// value takes precedence once set.
    pub shared_secret: String,
    pub jwt_secret: String,
    pub admin_password: String,
    /// Scheduler tick period.
    pub scan_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            database_path: "./data/meridian.db".to_string(),
            shared_secret: "change-me-shared-secret".to_string(),
            jwt_secret: "change-me-jwt-secret".to_string(),
            admin_password: String::new(),
            scan_interval_secs: 1,
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) if Path::new(path).exists() => {
                toml::from_str(&fs::read_to_string(path)?)?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = env::var("SERVER_PORT") {
            if let Ok(port) = port.trim().parse() {
                self.http_port = port;
            }
        }
        if let Ok(path) = env::var("DB_PATH") {
            self.database_path = path;
        }
        if let Ok(secret) = env::var("SHARED_SECRET") {
            self.shared_secret = secret;
        }
        if let Ok(secret) = env::var("JWT_SECRET") {
            self.jwt_secret = secret;
        }
        if let Ok(password) = env::var("ADMIN_PASSWORD") {
            self.admin_password = password;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.scan_interval_secs, 1);
        assert!(cfg.admin_password.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            http_port = 9090
            shared_secret = "probe-secret"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.shared_secret, "probe-secret");
        assert_eq!(cfg.scan_interval_secs, 1);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ServerConfig::load(Some("/definitely/not/here.toml")).unwrap();
        assert_eq!(cfg.http_port, 8080);
    }
}
