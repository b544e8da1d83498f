//! Server configuration.
//!
//! A JSON document selecting where data lives and which engine backend
//! serves it:
//!
//! ```json
//! {
//!     "version": "1.0",
//!     "directory": "./tmp/basalt/",
//!     "data_directories": [],
//!     "engine": {
//!         "config_url": "",
//!         "config_file_path": "",
//!         "config": { "backend": "lsm" }
//!     }
//! }
//! ```
//!
//! When the config file does not exist the defaults above apply and the
//! data directory is created on the spot.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

pub const DEFAULT_DIRECTORY: &str = "./tmp/basalt/";

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: String,
    pub directory: String,
    pub data_directories: Vec<String>,
    pub engine: EngineSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub config_url: String,
    pub config_file_path: String,
    pub config: serde_json::Value,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_owned(),
            directory: DEFAULT_DIRECTORY.to_owned(),
            data_directories: Vec::new(),
            engine: EngineSection::default(),
        }
    }
}

impl ServerConfig {
    /// Load the config file, falling back to defaults (and creating the
    /// default data directory) when it does not exist.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let config = if Path::new(path).exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read config file {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("parse config file {path}"))?
        } else {
            info!(path, "config file not found, using defaults");
            Self::default()
        };
        std::fs::create_dir_all(&config.directory)
            .with_context(|| format!("create data directory {}", config.directory))?;
        Ok(config)
    }

    /// Engine backend selector from the free-form engine config.
    pub fn backend(&self) -> &str {
        self.engine
            .config
            .get("backend")
            .and_then(|v| v.as_str())
            .unwrap_or("lsm")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_the_lsm_backend() {
        let config = ServerConfig::default();
        assert_eq!(config.backend(), "lsm");
        assert_eq!(config.directory, DEFAULT_DIRECTORY);
    }

    #[test]
    fn backend_override_parses() {
        let config: ServerConfig = serde_json::from_str(
            r#"{ "directory": "/tmp/x", "engine": { "config": { "backend": "memory" } } }"#,
        )
        .unwrap();
        assert_eq!(config.backend(), "memory");
        assert_eq!(config.version, "1.0");
    }
}
