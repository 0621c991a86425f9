//! YAML loader resolving the hub's custom tags
//!
//! Relative paths in `!include` and `!include_dir_*` resolve against the
//! directory of the file containing the tag. Include cycles are reported with
//! the full chain of files that led back to the repeated one.

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub struct YamlLoader {
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being loaded, outermost first
    stack: Vec<PathBuf>,
}

impl YamlLoader {
    /// Loader for a config directory, reading its `secrets.yaml`
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            stack: Vec::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    /// Load a file relative to the config directory and resolve its tags
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.config_dir.join(path.as_ref());
        self.load_path(path)
    }

    /// Parse YAML text as if it were the file at `source`
    pub fn load_str(&mut self, content: &str, source: &Path) -> ConfigResult<Value> {
        if content.trim().is_empty() {
            return Ok(Value::Null);
        }
        let value: Value = serde_yaml::from_str(content).map_err(|source_err| {
            ConfigError::ParseYaml {
                path: source.to_path_buf(),
                source: source_err,
            }
        })?;
        self.resolve(value, source)
    }

    fn load_path(&mut self, path: PathBuf) -> ConfigResult<Value> {
        let key = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if self.stack.contains(&key) {
            let mut chain = self.stack.clone();
            chain.push(key);
            return Err(ConfigError::CircularInclude { chain });
        }

        debug!(path = %path.display(), "Loading YAML");
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.stack.push(key);
        let result = self.load_str(&content, &path);
        self.stack.pop();
        result
    }

    fn resolve(&mut self, value: Value, source: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.resolve_tag(*tagged, source),
            Value::Mapping(map) => {
                let mut resolved = Mapping::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(self.resolve(key, source)?, self.resolve(value, source)?);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(items) => items
                .into_iter()
                .map(|item| self.resolve(item, source))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn resolve_tag(&mut self, tagged: TaggedValue, source: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Resolving tag");

        match tag.as_str() {
            "!include" => {
                let path = self.tag_path(&tag, &tagged.value, source)?;
                self.load_path(path)
            }
            "!include_dir_list" => {
                let dir = self.tag_path(&tag, &tagged.value, source)?;
                let files = yaml_files(&dir)?;
                files
                    .into_iter()
                    .map(|file| self.load_path(file))
                    .collect::<ConfigResult<Vec<_>>>()
                    .map(Value::Sequence)
            }
            "!include_dir_merge_list" => {
                let dir = self.tag_path(&tag, &tagged.value, source)?;
                let mut merged = Vec::new();
                for file in yaml_files(&dir)? {
                    match self.load_path(file)? {
                        Value::Sequence(items) => merged.extend(items),
                        Value::Null => {}
                        other => merged.push(other),
                    }
                }
                Ok(Value::Sequence(merged))
            }
            "!secret" => {
                let key = tag_string(&tag, &tagged.value)?;
                let value = self.secrets.get(key)?.clone();
                debug!(secret = key, "Substituted secret");
                Ok(value)
            }
            "!env_var" => {
                let var = tag_string(&tag, &tagged.value)?;
                std::env::var(var)
                    .map(Value::String)
                    .map_err(|_| ConfigError::EnvVarNotFound {
                        var: var.to_string(),
                    })
            }
            _ => {
                // Tags we do not own are passed through with their content resolved
                let value = self.resolve(tagged.value, source)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value,
                })))
            }
        }
    }

    fn tag_path(&self, tag: &str, value: &Value, source: &Path) -> ConfigResult<PathBuf> {
        let path = Path::new(tag_string(tag, value)?);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let base = source.parent().unwrap_or(&self.config_dir);
        Ok(base.join(path))
    }
}

fn tag_string<'a>(tag: &str, value: &'a Value) -> ConfigResult<&'a str> {
    value.as_str().ok_or_else(|| ConfigError::BadTagArgument {
        tag: tag.to_string(),
        expected: "a string",
    })
}

/// YAML files directly inside `dir`, sorted by name
fn yaml_files(dir: &Path) -> ConfigResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(ConfigError::NotADirectory {
            path: dir.to_path_buf(),
        });
    }

    let entries = fs::read_dir(dir).map_err(|source| ConfigError::ReadFile {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml" | "yml")
                )
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Load one file from a config directory with all tags resolved
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir)?.load_file(file)
}
