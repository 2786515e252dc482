//! Service configuration loading
//!
//! Resolution priority for the config file path: command-line argument,
//! then the `CADENZA_CONFIG` environment variable, then `./cadenza.toml`.
//! A missing file yields the built-in defaults; a present-but-broken file
//! is an error.

use crate::error::{Error, Result};
use crate::node::http::NodeConfig;
use cadenza_common::PlayerParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 7440,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "cadenza.db".into(),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub database: DatabaseConfig,
    /// Rendering nodes registered at startup
    pub nodes: Vec<NodeConfig>,
    /// Recommendation service endpoint, if any
    pub recommender_url: Option<String>,
    pub default_skin: Option<String>,
    pub player: PlayerParams,
}

/// Load configuration with CLI > env > default-path priority
pub fn load(cli_path: Option<&Path>) -> Result<Config> {
    let path = resolve_path(cli_path);

    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
            toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
        }
        None => {
            info!("No configuration file found, using defaults");
            Ok(Config::default())
        }
    }
}

fn resolve_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: command-line argument (must exist if given)
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: environment variable
    if let Ok(path) = std::env::var("CADENZA_CONFIG") {
        return Some(PathBuf::from(path));
    }

    // Priority 3: conventional file next to the working directory
    let conventional = PathBuf::from("cadenza.toml");
    if conventional.exists() {
        return Some(conventional);
    }

    None
}
