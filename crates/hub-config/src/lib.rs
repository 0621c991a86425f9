//! Configuration loading for the hub
//!
//! Reads `configuration.yaml` (or any file in the config directory) and
//! resolves the custom YAML tags before deserializing into [`HubConfig`]:
//!
//! - `!include path` - Replace the node with the contents of another file
//! - `!include_dir_list dir` - One list entry per YAML file in a directory
//! - `!include_dir_merge_list dir` - Concatenate the lists found in a directory
//! - `!secret key` - Look the value up in `secrets.yaml`
//! - `!env_var NAME` - Substitute an environment variable
//!
//! # Example
//!
//! ```ignore
//! use hub_config::HubConfig;
//!
//! let config = HubConfig::load("/etc/hub", "configuration.yaml")?;
//! for automation in &config.automations {
//!     println!("{:?}", automation.name);
//! }
//! ```

mod error;
mod hub;
mod loader;
mod secrets;

pub use error::{ConfigError, ConfigResult};
pub use hub::{AccessoryConfig, HubConfig};
pub use loader::{load_yaml, YamlLoader};
pub use secrets::Secrets;

pub use serde_yaml::Value;
