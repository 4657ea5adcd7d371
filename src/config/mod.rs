//! Configuration loaded from a YAML catalog file.
//!
//! The file describes the database connection and, per flow type, the
//! applications and regex patterns that drive ingestion. `DATABASE_URL`
//! in the environment overrides the file's database URL.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::errors::AppError;

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub flux_types: BTreeMap<String, FluxTypeConfig>,
}

/// Database connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Log every SQL statement at info level.
    #[serde(default)]
    pub echo: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            echo: false,
        }
    }
}

fn default_database_url() -> String {
    "sqlite://logs_flow.db".to_string()
}

/// One configured flow type: its lifecycle stages and the applications
/// that emit logs for it.
#[derive(Debug, Clone, Deserialize)]
pub struct FluxTypeConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_steps: Vec<String>,
    #[serde(default)]
    pub optional_steps: Vec<String>,
    pub applications: BTreeMap<String, ApplicationConfig>,
}

/// One application within a flow type.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    pub patterns: BTreeMap<String, PatternConfig>,
}

/// Declarative schema for one `(flow type, application, stage)` pattern.
///
/// Every field listed in the three role lists, plus `timestamp`, must be a
/// named capture group of `regex`; the catalog validates this at build time.
#[derive(Debug, Clone, Deserialize)]
pub struct PatternConfig {
    pub regex: String,
    pub timestamp_format: String,
    pub identifier_fields: Vec<String>,
    pub payload_fields: Vec<String>,
    #[serde(default)]
    pub reference_links: Vec<String>,
}

impl Config {
    /// Load and deserialize the YAML configuration file, then apply
    /// environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml(&raw)?;

        if let Ok(url) = env::var("DATABASE_URL") {
            config.database.url = url;
        }

        Ok(config)
    }

    /// Deserialize a YAML configuration document.
    pub fn from_yaml(raw: &str) -> Result<Self, AppError> {
        serde_yaml::from_str(raw)
            .map_err(|e| AppError::Config(format!("invalid configuration: {e}")))
    }
}
