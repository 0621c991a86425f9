//! Plugin registry
//!
//! Plugins contribute trigger, condition and action types by name. A config
//! entry with `plugin: <name>` is built by that plugin's factory for the
//! entry's type; entries without a plugin use the built-in types.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::action::CustomAction;
use crate::condition::CustomCondition;
use crate::error::{AutomationError, AutomationResult};
use crate::trigger::TriggerDriver;

/// Builds a trigger driver from its config options
pub type TriggerFactory =
    Arc<dyn Fn(&Value) -> AutomationResult<Box<dyn TriggerDriver>> + Send + Sync>;

/// Builds a condition from its config options
pub type ConditionFactory =
    Arc<dyn Fn(&Value) -> AutomationResult<Box<dyn CustomCondition>> + Send + Sync>;

/// Builds an action from its config options
pub type ActionFactory =
    Arc<dyn Fn(&Value) -> AutomationResult<Box<dyn CustomAction>> + Send + Sync>;

/// The types one plugin provides
#[derive(Clone, Default)]
pub struct PluginTypes {
    triggers: HashMap<String, TriggerFactory>,
    conditions: HashMap<String, ConditionFactory>,
    actions: HashMap<String, ActionFactory>,
}

impl PluginTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trigger(
        mut self,
        name: impl Into<String>,
        factory: impl Fn(&Value) -> AutomationResult<Box<dyn TriggerDriver>> + Send + Sync + 'static,
    ) -> Self {
        self.triggers.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn with_condition(
        mut self,
        name: impl Into<String>,
        factory: impl Fn(&Value) -> AutomationResult<Box<dyn CustomCondition>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.conditions.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn with_action(
        mut self,
        name: impl Into<String>,
        factory: impl Fn(&Value) -> AutomationResult<Box<dyn CustomAction>> + Send + Sync + 'static,
    ) -> Self {
        self.actions.insert(name.into(), Arc::new(factory));
        self
    }
}

/// Registry of plugin-provided types, keyed by plugin name
#[derive(Default)]
pub struct Registry {
    plugins: DashMap<String, PluginTypes>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin's types, replacing any previous registration
    pub fn register(&self, plugin: impl Into<String>, types: PluginTypes) {
        let plugin = plugin.into();
        debug!(
            plugin = %plugin,
            triggers = types.triggers.len(),
            conditions = types.conditions.len(),
            actions = types.actions.len(),
            "Registering plugin"
        );
        self.plugins.insert(plugin, types);
    }

    pub fn unregister(&self, plugin: &str) -> bool {
        self.plugins.remove(plugin).is_some()
    }

    pub fn has_plugin(&self, plugin: &str) -> bool {
        self.plugins.contains_key(plugin)
    }

    pub fn trigger_factory(&self, plugin: &str, name: &str) -> AutomationResult<TriggerFactory> {
        let types = self.plugin(plugin)?;
        types
            .triggers
            .get(name)
            .cloned()
            .ok_or_else(|| missing_type(plugin, "trigger", name))
    }

    pub fn condition_factory(
        &self,
        plugin: &str,
        name: &str,
    ) -> AutomationResult<ConditionFactory> {
        let types = self.plugin(plugin)?;
        types
            .conditions
            .get(name)
            .cloned()
            .ok_or_else(|| missing_type(plugin, "condition", name))
    }

    pub fn action_factory(&self, plugin: &str, name: &str) -> AutomationResult<ActionFactory> {
        let types = self.plugin(plugin)?;
        types
            .actions
            .get(name)
            .cloned()
            .ok_or_else(|| missing_type(plugin, "action", name))
    }

    fn plugin(
        &self,
        plugin: &str,
    ) -> AutomationResult<dashmap::mapref::one::Ref<'_, String, PluginTypes>> {
        self.plugins
            .get(plugin)
            .ok_or_else(|| AutomationError::Config(format!("unknown plugin '{}'", plugin)))
    }
}

fn missing_type(plugin: &str, kind: &str, name: &str) -> AutomationError {
    AutomationError::Config(format!("plugin '{}' has no {} type '{}'", plugin, kind, name))
}
