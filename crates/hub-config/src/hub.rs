//! Top-level hub configuration

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;
use hub_automation::{AutomationConfig, SceneConfig};
use hub_core::CharacteristicPath;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// Everything `hubd` needs to build an automation group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// Characteristics seeded into the in-memory accessory model
    #[serde(default)]
    pub accessories: Vec<AccessoryConfig>,

    #[serde(default)]
    pub automations: Vec<AutomationConfig>,

    #[serde(default)]
    pub scenes: Vec<SceneConfig>,
}

/// One seeded characteristic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessoryConfig {
    pub characteristic: CharacteristicPath,

    #[serde(default)]
    pub value: serde_json::Value,

    #[serde(default = "default_writable")]
    pub writable: bool,
}

fn default_name() -> String {
    "Hub".to_string()
}

fn default_writable() -> bool {
    true
}

impl HubConfig {
    /// Load `file` from `config_dir`, resolving tags against that directory
    pub fn load(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Self> {
        let mut loader = YamlLoader::new(config_dir)?;
        let value = loader.load_file(file.as_ref())?;
        let config = Self::from_value(value)?;

        info!(
            name = %config.name,
            accessories = config.accessories.len(),
            automations = config.automations.len(),
            scenes = config.scenes.len(),
            "Loaded hub configuration"
        );
        Ok(config)
    }

    /// Build from an already-resolved YAML document
    pub fn from_value(value: serde_yaml::Value) -> ConfigResult<Self> {
        let config: Self = if value.is_null() {
            Self {
                name: default_name(),
                ..Self::default()
            }
        } else {
            serde_yaml::from_value(value).map_err(ConfigError::Schema)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicates the automation group would refuse at load time
    pub fn validate(&self) -> ConfigResult<()> {
        let mut paths = HashSet::new();
        for accessory in &self.accessories {
            if !paths.insert(&accessory.characteristic) {
                return Err(ConfigError::InvalidValue {
                    key: "accessories".to_string(),
                    reason: format!("characteristic {} listed twice", accessory.characteristic),
                });
            }
        }

        unique_uuids(
            "automations",
            self.automations.iter().filter_map(|a| a.uuid.as_deref()),
        )?;
        unique_uuids("scenes", self.scenes.iter().filter_map(|s| s.uuid.as_deref()))
    }
}

fn unique_uuids<'a>(key: &str, uuids: impl Iterator<Item = &'a str>) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for uuid in uuids {
        if !seen.insert(uuid) {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("uuid '{}' used more than once", uuid),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    const CONFIGURATION: &str = r#"
name: !secret hub_name
accessories:
  - characteristic: [lamp, lightbulb, power]
    value: false
  - characteristic: [thermostat, sensor, temperature]
    value: 21.5
    writable: false
scenes: !include scenes.yaml
automations:
  - uuid: evening
    name: Evening lights
    triggers:
      - trigger: cron
        expression: "0 19 * * *"
        timezone: Europe/London
    conditions:
      - condition: script
        script: |
          local temperature = getCharacteristicValue("thermostat", "sensor", "temperature")
          return temperature < 25
    actions:
      - action: set_characteristic
        characteristic: [lamp, lightbulb, power]
        value: true
"#;

    #[test]
    fn test_load_full_configuration() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("configuration.yaml"), CONFIGURATION).unwrap();
        fs::write(dir.path().join("secrets.yaml"), "hub_name: Cottage\n").unwrap();
        fs::write(
            dir.path().join("scenes.yaml"),
            "- uuid: movie\n  name: Movie\n  enable_actions:\n    - action: test\n",
        )
        .unwrap();

        let config = HubConfig::load(dir.path(), "configuration.yaml").unwrap();
        assert_eq!(config.name, "Cottage");

        assert_eq!(config.accessories.len(), 2);
        assert_eq!(
            config.accessories[0].characteristic,
            CharacteristicPath::new("lamp", "lightbulb", "power")
        );
        assert!(config.accessories[0].writable);
        assert!(!config.accessories[1].writable);
        assert_eq!(config.accessories[1].value, json!(21.5));

        assert_eq!(config.scenes.len(), 1);
        assert_eq!(config.scenes[0].uuid.as_deref(), Some("movie"));
        assert_eq!(config.scenes[0].enable_actions.len(), 1);

        let automation = &config.automations[0];
        assert_eq!(automation.name.as_deref(), Some("Evening lights"));
        assert_eq!(automation.triggers[0].trigger, "cron");
        assert_eq!(
            automation.triggers[0].options.get("timezone"),
            Some(&json!("Europe/London"))
        );
        assert_eq!(automation.conditions[0].condition, "script");
        assert_eq!(automation.actions[0].action, "set_characteristic");
        assert_eq!(
            automation.actions[0].options.get("characteristic"),
            Some(&json!(["lamp", "lightbulb", "power"]))
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HubConfig::from_value(serde_yaml::Value::Null).unwrap();
        assert_eq!(config.name, "Hub");
        assert!(config.automations.is_empty());
    }

    #[test]
    fn test_duplicate_automation_uuid_rejected() {
        let value: serde_yaml::Value = serde_yaml::from_str(
            "automations:\n  - uuid: same\n  - uuid: same\n",
        )
        .unwrap();

        let result = HubConfig::from_value(value);
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "automations"));
    }

    #[test]
    fn test_duplicate_characteristic_rejected() {
        let value: serde_yaml::Value = serde_yaml::from_str(
            "accessories:\n  - characteristic: [a, s, c]\n  - characteristic: [a, s, c]\n",
        )
        .unwrap();

        assert!(HubConfig::from_value(value).is_err());
    }

    #[test]
    fn test_schema_error() {
        let value: serde_yaml::Value = serde_yaml::from_str("automations: 12\n").unwrap();
        assert!(matches!(HubConfig::from_value(value), Err(ConfigError::Schema(_))));
    }
}
