//! `secrets.yaml` lookup for the `!secret` tag

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SECRETS_FILE: &str = "secrets.yaml";

/// Secret values keyed by name
///
/// Values keep their YAML type, so a numeric secret substitutes as a number.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: HashMap<String, Value>,
    path: PathBuf,
}

impl Secrets {
    /// Read `secrets.yaml` from the config directory; a missing file yields an empty store
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join(SECRETS_FILE);
        if !path.is_file() {
            debug!(path = %path.display(), "No secrets file");
            return Ok(Self {
                values: HashMap::new(),
                path,
            });
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        let values: HashMap<String, Value> = if content.trim().is_empty() {
            HashMap::new()
        } else {
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
                path: path.clone(),
                source,
            })?
        };

        debug!(path = %path.display(), count = values.len(), "Loaded secrets");
        Ok(Self { values, path })
    }

    pub fn from_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            values: values.into_iter().collect(),
            path: PathBuf::from(SECRETS_FILE),
        }
    }

    pub fn get(&self, key: &str) -> ConfigResult<&Value> {
        self.values
            .get(key)
            .ok_or_else(|| ConfigError::SecretNotFound {
                key: key.to_string(),
                path: self.path.clone(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
