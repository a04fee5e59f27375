//! Configuration loading and types
//!
//! The config file holds executor settings and a list of already-resolved
//! targets:
//!
//! ```toml
//! [executor]
//! concurrency = 20
//!
//! [[target]]
//! name = "web1"
//! host = "10.0.0.5"
//! user = "deploy"
//!
//! [target.options]
//! run-as = "root"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use fanout_core::{CoreError, ExecutorConfig};
use fanout_exec::Target;

/// Top-level configuration for the fanout binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Targets actions can run on
    #[serde(default)]
    pub target: Vec<Target>,
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::ConfigError(format!("could not read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| CoreError::ConfigError(format!("{}: {e}", path.display())))
    }

    /// Parse a TOML document
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` on invalid TOML or unknown values
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content).map_err(|e| CoreError::ConfigError(e.to_string()))
    }

    /// Find the config file to use
    ///
    /// An explicit path wins, then `FANOUT_CONFIG`, then `./fanout.toml`
    /// and the user config directory. Explicit paths are returned even if
    /// they do not exist so that loading reports the problem.
    #[must_use]
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var("FANOUT_CONFIG") {
            return Some(PathBuf::from(path));
        }

        let paths = [
            Some(PathBuf::from("fanout.toml")),
            dirs::config_dir().map(|p| p.join("fanout/fanout.toml")),
        ];
        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Targets named in `names`, in that order; every target when empty
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` for a name that is not configured
    pub fn select(&self, names: &[String]) -> Result<Vec<Target>, CoreError> {
        if names.is_empty() {
            return Ok(self.target.clone());
        }
        names
            .iter()
            .map(|name| {
                self.target
                    .iter()
                    .find(|t| &t.name == name)
                    .cloned()
                    .ok_or_else(|| CoreError::ConfigError(format!("unknown target '{name}'")))
            })
            .collect()
    }
}
