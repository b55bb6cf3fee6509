//! Configuration loading and parsing

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use virt_events::DomainEventId;

/// Main application configuration (loaded from a TOML file)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default, rename = "watch")]
    pub watches: Vec<WatchConfig>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub pump: PumpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { uri: default_uri() }
    }
}

fn default_uri() -> String {
    "test:///default".to_string()
}

/// One event subscription
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchConfig {
    /// Event kind name, e.g. "lifecycle" or "rtc_change"
    pub event: String,
    /// Only deliver events for the domain with this name
    pub domain: Option<String>,
}

impl WatchConfig {
    pub fn new(event: &str, domain: Option<String>) -> Self {
        Self {
            event: event.to_string(),
            domain,
        }
    }

    pub fn event_id(&self) -> Result<DomainEventId> {
        DomainEventId::from_name(&self.event).ok_or_else(|| {
            let known: Vec<&str> = DomainEventId::ALL.iter().map(|id| id.name()).collect();
            anyhow!("Unknown event kind '{}' (expected one of: {})", self.event, known.join(", "))
        })
    }

    /// Short label used in output, e.g. "lifecycle@test"
    pub fn label(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}@{}", self.event, domain),
            None => self.event.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PumpConfig {
    /// Event loop iterations before exiting; 0 runs until killed
    #[serde(default = "default_iterations")]
    pub iterations: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
        }
    }
}

fn default_iterations() -> u64 {
    10
}

impl AppConfig {
    /// Reject watches naming an unknown event kind
    pub fn validate(&self) -> Result<()> {
        for watch in &self.watches {
            watch.event_id()?;
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    Ok(config)
}
