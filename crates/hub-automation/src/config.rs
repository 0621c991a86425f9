//! Configuration records for triggers, conditions, actions, automations
//! and scenes
//!
//! Each typed entry carries a discriminator (`trigger`, `condition` or
//! `action`), an optional `uuid`, an optional `plugin` naming the plugin that
//! provides the type, and type-specific options flattened alongside.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AutomationError, AutomationResult};

/// Trigger configuration, e.g. `{ trigger: cron, expression: "0 7 * * *" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub trigger: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// Condition configuration, e.g. `{ condition: all, conditions: [...] }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub condition: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// Action configuration, e.g. `{ action: set_characteristic, ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    #[serde(flatten)]
    pub options: Map<String, Value>,
}

macro_rules! typed_config {
    ($config:ty, $field:ident, $kind:literal) => {
        impl $config {
            pub fn new(type_name: impl Into<String>) -> Self {
                Self {
                    $field: type_name.into(),
                    uuid: None,
                    plugin: None,
                    options: Map::new(),
                }
            }

            pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
                self.uuid = Some(uuid.into());
                self
            }

            pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
                self.plugin = Some(plugin.into());
                self
            }

            pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
                self.options.insert(key.into(), value);
                self
            }

            /// The type name, qualified with the plugin when there is one
            pub fn type_name(&self) -> String {
                match &self.plugin {
                    Some(plugin) => format!("{}:{}", plugin, self.$field),
                    None => self.$field.clone(),
                }
            }

            /// The options as a JSON object
            pub fn options_value(&self) -> Value {
                Value::Object(self.options.clone())
            }

            /// Deserialize the type-specific options
            pub fn options<T: DeserializeOwned>(&self) -> AutomationResult<T> {
                serde_json::from_value(self.options_value()).map_err(|e| {
                    AutomationError::Config(format!(
                        "invalid options for {} {}: {}",
                        $kind,
                        self.type_name(),
                        e
                    ))
                })
            }
        }
    };
}

typed_config!(TriggerConfig, trigger, "trigger");
typed_config!(ConditionConfig, condition, "condition");
typed_config!(ActionConfig, action, "action");

/// Automation configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, alias = "trigger")]
    pub triggers: Vec<TriggerConfig>,

    #[serde(default, alias = "condition")]
    pub conditions: Vec<ConditionConfig>,

    #[serde(default, alias = "action")]
    pub actions: Vec<ActionConfig>,
}

/// Scene configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// All must pass for the scene to count as active
    #[serde(default)]
    pub active_conditions: Vec<ConditionConfig>,

    #[serde(default)]
    pub enable_actions: Vec<ActionConfig>,

    #[serde(default)]
    pub disable_actions: Vec<ActionConfig>,
}
