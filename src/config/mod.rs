//! Configuration management

use crate::bridge::ProviderType;
use crate::obfuscation::TransformerConfig;
use crate::transport::Backoff;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Churn negotiation
    #[serde(default)]
    pub churn: ChurnConfig,
    /// Obfuscation pipe
    #[serde(default)]
    pub pipe: PipeConfig,
    /// Provider selection
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Churn connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnConfig {
    /// STUN servers for the probe connection
    #[serde(default)]
    pub stun_servers: Vec<String>,
    /// Upper bound on candidate gathering by the probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Do not send the legacy `publicEndpoint` hint
    #[serde(default)]
    pub skip_public_endpoint: bool,
    /// Transformer to offer; a fresh Caesar key is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<TransformerConfig>,
}

fn default_probe_timeout_ms() -> u64 {
    crate::DEFAULT_PROBE_TIMEOUT_MS
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            probe_timeout_ms: default_probe_timeout_ms(),
            skip_public_endpoint: false,
            transformer: None,
        }
    }
}

impl ChurnConfig {
    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_skip_public_endpoint(mut self, skip: bool) -> Self {
        self.skip_public_endpoint = skip;
        self
    }

    pub fn with_transformer(mut self, transformer: TransformerConfig) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Obfuscation pipe configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeConfig {
    /// First delay between public socket bind attempts
    pub initial_rebind_interval_ms: u64,
    /// Total time allowed for bind retries
    pub max_rebind_interval_ms: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            initial_rebind_interval_ms: 10,
            max_rebind_interval_ms: 2000,
        }
    }
}

impl PipeConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_rebind_interval_ms),
            Duration::from_millis(self.max_rebind_interval_ms),
        )
    }
}

/// Bridging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Provider used when this side starts negotiation
    pub provider: ProviderType,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            provider: ProviderType::HoloIce,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        churn: ChurnConfig::default().with_transformer(TransformerConfig::Caesar(
            crate::obfuscation::CaesarConfig::random(),
        )),
        pipe: PipeConfig::default(),
        bridge: BridgeConfig::default(),
        logging: LoggingConfig::default(),
    }
}
