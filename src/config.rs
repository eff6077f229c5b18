use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::security::RateLimitConfig;

/// Default configuration file looked up next to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "homescript.toml";

/// Environment prefix; nested keys use `__`, e.g. `HOMESCRIPT_SERVER__PORT`.
pub const ENV_PREFIX: &str = "HOMESCRIPT_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Take the client address from `x-forwarded-for` when set.
    pub trust_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            trust_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HomeAssistantConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            base_url: "http://homeassistant.local:8123".to_string(),
            token: None,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitSettings {
    pub webhook: RateLimitConfig,
    pub public_debug: RateLimitConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            webhook: RateLimitConfig::new(60, 60_000),
            public_debug: RateLimitConfig::new(20, 60_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveConfig {
    pub auth_failure_max: u32,
    pub auth_failure_window_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            auth_failure_max: 5,
            auth_failure_window_ms: 5 * 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Seed data applied at startup, for deployments without a login flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BootstrapConfig {
    pub ui_session_token: Option<String>,
    pub ui_user_id: Option<String>,
    pub debug_whitelist: Vec<String>,
    pub debug_enabled: bool,
}

/// Configuration for the HomeScript server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub server: ServerConfig,
    pub home_assistant: HomeAssistantConfig,
    pub rate_limit: RateLimitSettings,
    pub live: LiveConfig,
    pub sweep_interval_secs: u64,
    pub logging: LoggingConfig,
    pub bootstrap: BootstrapConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            home_assistant: HomeAssistantConfig::default(),
            rate_limit: RateLimitSettings::default(),
            live: LiveConfig::default(),
            sweep_interval_secs: 60,
            logging: LoggingConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl Config {
    /// Layers defaults, the TOML file (if present) and `HOMESCRIPT_` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());

        Self::figment(&file).extract()
    }

    pub fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Configuration for tests: ephemeral port, generous limits.
    pub fn test_config_with_port(port: u16) -> Self {
        let mut config = Self::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = port;
        config.sweep_interval_secs = 1;
        config
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
