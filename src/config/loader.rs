// file: src/config/loader.rs
// version: 2.0.0
// guid: d4e5f6g7-h8i9-0123-4567-890123defghi

//! Configuration file loading with environment substitution
//!
//! `${VAR}` is replaced by the variable's value and `${VAR:-fallback}` uses
//! `fallback` when the variable is unset. Any other unset variable fails the
//! load so credentials never silently become empty strings.

use super::ProvisionerConfig;
use crate::error::{ProvisionError, Result};
use regex::{Captures, Regex};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

fn placeholder() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}"))
        .as_ref()
        .map_err(|e| ProvisionError::config(format!("Invalid placeholder pattern: {}", e)))
}

/// Reads YAML configuration, substituting environment variables
pub struct ConfigLoader {
    env_vars: HashMap<String, String>,
}

impl ConfigLoader {
    /// Loader over the current process environment
    pub fn new() -> Self {
        Self {
            env_vars: std::env::vars().collect(),
        }
    }

    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<ProvisionerConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        debug!("Loaded configuration from {}", path.display());
        self.load_from_str(&content)
    }

    /// Parse, expand `~` in every configured path, then validate
    pub fn load_from_str(&self, content: &str) -> Result<ProvisionerConfig> {
        let expanded = self.expand_env_vars(content)?;
        let mut config: ProvisionerConfig = serde_yaml::from_str(&expanded)?;

        config.cache_dir = expand_home(&config.cache_dir);
        let endpoints = config
            .bmc
            .iter_mut()
            .chain(config.remote_cache.iter_mut().map(|r| &mut r.endpoint))
            .chain(config.nodes.values_mut().map(|n| &mut n.endpoint));
        for endpoint in endpoints {
            if let Some(key) = endpoint.key_file.take() {
                endpoint.key_file = Some(expand_home(&key));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn expand_env_vars(&self, content: &str) -> Result<String> {
        let mut missing = BTreeSet::new();
        let expanded = placeholder()?.replace_all(content, |caps: &Captures| {
            let name = &caps[1];
            match (self.env_vars.get(name), caps.get(2)) {
                (Some(value), _) => value.clone(),
                (None, Some(fallback)) => fallback.as_str().to_string(),
                (None, None) => {
                    missing.insert(name.to_string());
                    String::new()
                }
            }
        });

        if !missing.is_empty() {
            return Err(ProvisionError::config(format!(
                "Missing environment variables: {}",
                missing.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }
        Ok(expanded.into_owned())
    }

    /// Override a variable for substitution
    pub fn set_env_var(&mut self, key: String, value: String) {
        self.env_vars.insert(key, value);
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).as_ref())
}
