//! Automation groups
//!
//! A group owns a set of automations and scenes, the triggers they share,
//! and a registry of runners that have been created and not yet finished.
//! Every trigger, condition and action belongs to exactly one group and can
//! only be attached to automations and scenes of that group.

use dashmap::DashMap;
use futures::future::join_all;
use hub_core::AccessoryModel;
use hub_event_bus::EventBus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::automation::Automation;
use crate::condition::Condition;
use crate::config::{ActionConfig, AutomationConfig, ConditionConfig, SceneConfig, TriggerConfig};
use crate::error::{AutomationError, AutomationResult};
use crate::ids::{next_id, IdKind};
use crate::registry::Registry;
use crate::runner::Runner;
use crate::scene::Scene;
use crate::sync::{read, write};
use crate::trigger::Trigger;

/// A set of automations and scenes sharing triggers, accessories and a bus
pub struct AutomationGroup {
    id: u64,
    name: String,
    running: AtomicBool,
    automations: RwLock<Vec<Arc<Automation>>>,
    scenes: RwLock<Vec<Arc<Scene>>>,
    runners: DashMap<u64, Arc<Runner>>,
    registry: Arc<Registry>,
    accessories: Arc<dyn AccessoryModel>,
    bus: Arc<EventBus>,
    this: Weak<AutomationGroup>,
}

impl AutomationGroup {
    pub fn new(
        name: impl Into<String>,
        accessories: Arc<dyn AccessoryModel>,
        bus: Arc<EventBus>,
        registry: Arc<Registry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| AutomationGroup {
            id: next_id(IdKind::Group),
            name: name.into(),
            running: AtomicBool::new(false),
            automations: RwLock::new(Vec::new()),
            scenes: RwLock::new(Vec::new()),
            runners: DashMap::new(),
            registry,
            accessories,
            bus,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn accessories(&self) -> &Arc<dyn AccessoryModel> {
        &self.accessories
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub(crate) fn downgrade(&self) -> Weak<AutomationGroup> {
        self.this.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn load_trigger(&self, config: &TriggerConfig) -> AutomationResult<Arc<Trigger>> {
        Trigger::load(self, config)
    }

    pub fn load_condition(&self, config: &ConditionConfig) -> AutomationResult<Arc<Condition>> {
        Condition::load(self, config)
    }

    pub fn load_action(&self, config: &ActionConfig) -> AutomationResult<Arc<Action>> {
        Action::load(self, config)
    }

    /// Build an automation from config and add it to the group
    ///
    /// A trigger whose uuid matches one already in the group is shared
    /// rather than loaded again. When the group is running the new
    /// automation's triggers are started before this returns; if one fails
    /// to start the automation is removed again and the error returned.
    pub async fn load_automation(
        &self,
        config: &AutomationConfig,
    ) -> AutomationResult<Arc<Automation>> {
        let automation = self.insert_automation(config)?;

        if self.is_running() {
            for trigger in automation.triggers() {
                if let Err(e) = trigger.start().await {
                    error!(
                        automation = automation.id(),
                        trigger = trigger.id(),
                        "Failed to start trigger, unloading automation: {}",
                        e
                    );
                    if let Err(stop_error) = self.remove_automation(&automation).await {
                        warn!(
                            automation = automation.id(),
                            "Error unloading automation: {}",
                            stop_error
                        );
                    }
                    return Err(e);
                }
            }
        }
        Ok(automation)
    }

    /// Build and add an automation without starting anything
    pub(crate) fn insert_automation(
        &self,
        config: &AutomationConfig,
    ) -> AutomationResult<Arc<Automation>> {
        if let Some(uuid) = &config.uuid {
            if self.automation_by_uuid(uuid).is_some() {
                return Err(AutomationError::DuplicateUuid(uuid.clone()));
            }
        }

        let automation = Automation::new(self, config);
        for trigger in &config.triggers {
            let shared = trigger.uuid.as_deref().and_then(|uuid| self.trigger_by_uuid(uuid));
            let trigger = match shared {
                Some(existing) => {
                    debug!(trigger = existing.id(), "Sharing existing trigger");
                    existing
                }
                None => self.load_trigger(trigger)?,
            };
            automation.add_trigger(trigger)?;
        }
        for condition in &config.conditions {
            automation.add_condition(self.load_condition(condition)?)?;
        }
        for action in &config.actions {
            automation.add_action(self.load_action(action)?)?;
        }

        debug!(
            automation = automation.id(),
            name = automation.name().unwrap_or_default(),
            "Loaded automation"
        );
        write(&self.automations).push(automation.clone());
        Ok(automation)
    }

    /// Remove an automation, stopping triggers no other automation uses
    pub async fn remove_automation(&self, automation: &Arc<Automation>) -> AutomationResult<bool> {
        let removed = {
            let mut automations = write(&self.automations);
            let before = automations.len();
            automations.retain(|a| !Arc::ptr_eq(a, automation));
            automations.len() != before
        };
        if !removed {
            return Ok(false);
        }

        for trigger in automation.triggers() {
            automation.remove_trigger(&trigger);
            if trigger.owners().is_empty() {
                trigger.stop().await?;
            }
        }
        debug!(automation = automation.id(), "Removed automation");
        Ok(true)
    }

    pub fn load_scene(&self, config: &SceneConfig) -> AutomationResult<Arc<Scene>> {
        if let Some(uuid) = &config.uuid {
            if self.scene_by_uuid(uuid).is_some() {
                return Err(AutomationError::DuplicateUuid(uuid.clone()));
            }
        }

        let scene = Scene::new(self, config);
        for condition in &config.active_conditions {
            scene.add_active_condition(self.load_condition(condition)?)?;
        }
        for action in &config.enable_actions {
            scene.add_enable_action(self.load_action(action)?)?;
        }
        for action in &config.disable_actions {
            scene.add_disable_action(self.load_action(action)?)?;
        }

        debug!(scene = scene.id(), name = scene.name().unwrap_or_default(), "Loaded scene");
        write(&self.scenes).push(scene.clone());
        Ok(scene)
    }

    pub fn remove_scene(&self, scene: &Arc<Scene>) -> bool {
        let mut scenes = write(&self.scenes);
        let before = scenes.len();
        scenes.retain(|s| !Arc::ptr_eq(s, scene));
        scenes.len() != before
    }

    pub fn automations(&self) -> Vec<Arc<Automation>> {
        read(&self.automations).clone()
    }

    pub fn automation(&self, id: u64) -> Option<Arc<Automation>> {
        read(&self.automations).iter().find(|a| a.id() == id).cloned()
    }

    pub fn automation_by_uuid(&self, uuid: &str) -> Option<Arc<Automation>> {
        read(&self.automations)
            .iter()
            .find(|a| a.uuid() == Some(uuid))
            .cloned()
    }

    pub fn scenes(&self) -> Vec<Arc<Scene>> {
        read(&self.scenes).clone()
    }

    pub fn scene(&self, id: u64) -> Option<Arc<Scene>> {
        read(&self.scenes).iter().find(|s| s.id() == id).cloned()
    }

    pub fn scene_by_uuid(&self, uuid: &str) -> Option<Arc<Scene>> {
        read(&self.scenes).iter().find(|s| s.uuid() == Some(uuid)).cloned()
    }

    /// Every distinct trigger used by the group's automations
    pub fn triggers(&self) -> Vec<Arc<Trigger>> {
        let mut triggers: Vec<Arc<Trigger>> = Vec::new();
        for automation in self.automations() {
            for trigger in automation.triggers() {
                if !triggers.iter().any(|t| Arc::ptr_eq(t, &trigger)) {
                    triggers.push(trigger);
                }
            }
        }
        triggers
    }

    fn trigger_by_uuid(&self, uuid: &str) -> Option<Arc<Trigger>> {
        self.triggers().into_iter().find(|t| t.uuid() == Some(uuid))
    }

    /// Runners created and not yet finished
    pub fn runners(&self) -> Vec<Arc<Runner>> {
        self.runners.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn runner(&self, id: u64) -> Option<Arc<Runner>> {
        self.runners.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn register_runner(&self, runner: Arc<Runner>) {
        self.runners.insert(runner.id(), runner);
    }

    pub(crate) fn forget_runner(&self, runner_id: u64) {
        self.runners.remove(&runner_id);
    }

    /// Start every trigger
    ///
    /// All triggers are attempted; the first failure is returned.
    pub async fn start(&self) -> AutomationResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(group = self.id, "Automation group already running");
            return Ok(());
        }

        let triggers = self.triggers();
        let results = join_all(triggers.iter().map(|t| t.start())).await;
        let first_error = report(&triggers, results, "start");

        info!(
            group = self.id,
            name = %self.name,
            automations = read(&self.automations).len(),
            scenes = read(&self.scenes).len(),
            triggers = triggers.len(),
            "Automation group started"
        );
        first_error.map_or(Ok(()), Err)
    }

    /// Stop every trigger; running runners are left to finish
    pub async fn stop(&self) -> AutomationResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let triggers = self.triggers();
        let results = join_all(triggers.iter().map(|t| t.stop())).await;
        let first_error = report(&triggers, results, "stop");

        info!(group = self.id, name = %self.name, "Automation group stopped");
        first_error.map_or(Ok(()), Err)
    }
}

fn report(
    triggers: &[Arc<Trigger>],
    results: Vec<AutomationResult<()>>,
    operation: &str,
) -> Option<AutomationError> {
    let mut first_error = None;
    for (trigger, result) in triggers.iter().zip(results) {
        if let Err(e) = result {
            error!(trigger = trigger.id(), "Failed to {} trigger: {}", operation, e);
            first_error.get_or_insert(e);
        }
    }
    first_error
}

impl std::fmt::Debug for AutomationGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PluginTypes;
    use crate::testing::{test_group, CountingDriver};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn automation_config(config: serde_json::Value) -> AutomationConfig {
        serde_json::from_value(config).unwrap()
    }

    fn with_counting_triggers(group: &AutomationGroup) -> CountingDriver {
        let driver = CountingDriver::default();
        let factory = driver.clone();
        group.registry().register(
            "counting",
            PluginTypes::new().with_trigger("tick", move |_| Ok(Box::new(factory.clone()))),
        );
        driver
    }

    #[tokio::test]
    async fn test_shared_trigger_started_once() {
        let group = test_group();
        let driver = with_counting_triggers(&group);
        let trigger = json!({"trigger": "tick", "plugin": "counting", "uuid": "shared"});

        let first = group
            .load_automation(&automation_config(json!({"triggers": [trigger.clone()]})))
            .await
            .unwrap();
        let second = group
            .load_automation(&automation_config(json!({"triggers": [trigger]})))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first.triggers()[0], &second.triggers()[0]));
        assert_eq!(group.triggers().len(), 1);

        group.start().await.unwrap();
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);

        group.stop().await.unwrap();
        assert_eq!(driver.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loading_into_running_group_starts_triggers() {
        let group = test_group();
        let driver = with_counting_triggers(&group);
        group.start().await.unwrap();

        let automation = group
            .load_automation(&automation_config(
                json!({"triggers": [{"trigger": "tick", "plugin": "counting"}]}),
            ))
            .await
            .unwrap();

        assert!(automation.triggers()[0].is_running());
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
    }

    struct RefusingDriver;

    #[async_trait::async_trait]
    impl crate::trigger::TriggerDriver for RefusingDriver {
        async fn on_start(&self, _handle: crate::trigger::TriggerHandle) -> AutomationResult<()> {
            Err(AutomationError::Failed("port busy".to_string()))
        }

        async fn on_stop(&self) -> AutomationResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_trigger_start_failure_unloads_automation() {
        let group = test_group();
        let driver = with_counting_triggers(&group);
        group.registry().register(
            "refusing",
            PluginTypes::new().with_trigger("listen", |_| Ok(Box::new(RefusingDriver))),
        );
        group.start().await.unwrap();

        let result = group
            .load_automation(&automation_config(json!({
                "uuid": "doorbell",
                "triggers": [
                    {"trigger": "tick", "plugin": "counting"},
                    {"trigger": "listen", "plugin": "refusing"}
                ]
            })))
            .await;

        assert!(matches!(result, Err(AutomationError::Failed(_))));
        assert!(group.automation_by_uuid("doorbell").is_none());
        assert!(group.triggers().is_empty());
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
        assert_eq!(driver.stops.load(Ordering::SeqCst), 1);

        let retried = group
            .load_automation(&automation_config(json!({
                "uuid": "doorbell",
                "triggers": [{"trigger": "tick", "plugin": "counting"}]
            })))
            .await
            .unwrap();
        assert!(retried.triggers()[0].is_running());
    }

    #[tokio::test]
    async fn test_remove_automation_stops_unshared_triggers() {
        let group = test_group();
        let driver = with_counting_triggers(&group);
        let automation = group
            .load_automation(&automation_config(
                json!({"uuid": "a", "triggers": [{"trigger": "tick", "plugin": "counting"}]}),
            ))
            .await
            .unwrap();
        group.start().await.unwrap();

        assert!(group.remove_automation(&automation).await.unwrap());
        assert!(group.automation_by_uuid("a").is_none());
        assert_eq!(driver.stops.load(Ordering::SeqCst), 1);
        assert!(!group.remove_automation(&automation).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_automation_uuid() {
        let group = test_group();
        group
            .load_automation(&automation_config(json!({"uuid": "morning"})))
            .await
            .unwrap();

        assert!(matches!(
            group
                .load_automation(&automation_config(json!({"uuid": "morning"})))
                .await,
            Err(AutomationError::DuplicateUuid(_))
        ));
    }

    #[test]
    fn test_lookups() {
        let group = test_group();
        let scene = group
            .load_scene(&serde_json::from_value(json!({"uuid": "movie", "name": "Movie"})).unwrap())
            .unwrap();

        assert!(Arc::ptr_eq(&group.scene(scene.id()).unwrap(), &scene));
        assert!(Arc::ptr_eq(&group.scene_by_uuid("movie").unwrap(), &scene));
        assert!(group.remove_scene(&scene));
        assert!(group.scene_by_uuid("movie").is_none());
    }
}
