//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::sync::key_policy::KeyValidityMode;
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP intake server
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity of this node and the legal entities it manages
    #[serde(default)]
    pub node: NodeConfig,

    /// Consent intake rules
    #[serde(default)]
    pub consent: ConsentConfig,

    /// Aggregate runtime tuning
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Bridge synchronization
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Identity this node uses on the bridge
    #[serde(default = "default_node_identity")]
    pub identity: String,

    /// Legal entities whose keys this node generates and holds
    #[serde(default)]
    pub managed_entities: Vec<String>,

    /// RSA modulus size for generated key pairs
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: default_node_identity(),
            managed_entities: Vec::new(),
            rsa_key_bits: default_rsa_key_bits(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsentConfig {
    /// OID namespace every data class must live under
    #[serde(default = "default_classes_oid")]
    pub classes_oid: String,

    /// Domains written into bridge record metadata
    #[serde(default = "default_domain")]
    pub domain: Vec<String>,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            classes_oid: default_classes_oid(),
            domain: default_domain(),
        }
    }
}

impl ConsentConfig {
    /// Prefix a data class must carry, e.g. `urn:oid:1.3.6.1.4.1.54851.1:`.
    pub fn class_prefix(&self) -> String {
        format!("urn:oid:{}:", self.classes_oid)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Attempts after the first before a conflict is surfaced
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Base delay between conflict retries, grows linearly per attempt
    #[serde(default = "default_conflict_backoff", with = "humantime_serde")]
    pub conflict_backoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
            conflict_backoff: default_conflict_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Timestamp signature keys are validated against
    #[serde(default)]
    pub key_validity: KeyValidityMode,

    /// Name recorded as the publisher of outgoing bridge events
    #[serde(default = "default_publisher_name")]
    pub publisher_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            key_validity: KeyValidityMode::default(),
            publisher_name: default_publisher_name(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 1323 }
fn default_node_identity() -> String { "urn:oid:1.3.6.1.4.1.54851.4:123".to_string() }
fn default_rsa_key_bits() -> usize { 2048 }
fn default_classes_oid() -> String { "1.3.6.1.4.1.54851.1".to_string() }
fn default_domain() -> Vec<String> { vec!["medical".to_string()] }
fn default_max_conflict_retries() -> u32 { 5 }
fn default_conflict_backoff() -> Duration { Duration::from_millis(5) }
fn default_publisher_name() -> String { "consent-core".to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CONSENT").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CONSENT").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
