use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_service_name")]
    pub cloud_service_name: String,

    /// Database URL; operations are kept in memory when absent
    pub db_url: Option<String>,

    /// Seconds without any message before a session is dropped
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,

    /// Seconds without an operation before a user is shown as idle
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Seconds a document stays loaded after its last session left
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,

    /// Milliseconds between presence sweeps
    #[serde(default = "default_presence_sweep_ms")]
    pub presence_sweep_ms: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Parsed CORS origins, empty when unset
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Timing settings handed to every document coordinator
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            drain_grace: Duration::from_secs(self.drain_grace_secs),
            sweep_interval: Duration::from_millis(self.presence_sweep_ms.max(1)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            cloud_service_name: default_service_name(),
            db_url: None,
            liveness_timeout_secs: default_liveness_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            drain_grace_secs: default_drain_grace_secs(),
            presence_sweep_ms: default_presence_sweep_ms(),
        }
    }
}

/// Per-document timing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub liveness_timeout: Duration,
    pub idle_timeout: Duration,
    pub drain_grace: Duration,
    pub sweep_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Config::default().coordinator_settings()
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "colabri-sync".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_liveness_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_drain_grace_secs() -> u64 {
    5 * 60
}

fn default_presence_sweep_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_collaboration_policy() {
        let settings = Config::default().coordinator_settings();
        assert_eq!(settings.liveness_timeout, Duration::from_secs(30));
        assert_eq!(settings.idle_timeout, Duration::from_secs(60));
        assert_eq!(settings.drain_grace, Duration::from_secs(300));
        assert_eq!(settings.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn fields_deserialize_from_env_style_pairs() {
        let vars = vec![
            ("PORT".to_string(), "8080".to_string()),
            ("DRAIN_GRACE_SECS".to_string(), "10".to_string()),
            ("CORS_ORIGINS".to_string(), "http://a.test, http://b.test".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.drain_grace_secs, 10);
        assert_eq!(config.liveness_timeout_secs, 30);
        assert_eq!(config.cors_origin_list(), vec!["http://a.test", "http://b.test"]);
        assert_eq!(config.server_address(), "0.0.0.0:8080");
        assert!(config.is_development());
    }
}
