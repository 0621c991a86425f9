//! Automations
//!
//! An automation owns ordered lists of triggers, conditions and actions.
//! When one of its triggers fires it creates a [`Runner`] over a snapshot of
//! its conditions and actions and starts it.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::condition::Condition;
use crate::config::AutomationConfig;
use crate::error::{AutomationError, AutomationResult};
use crate::events::{AutomationTriggered, TriggerEvent};
use crate::group::AutomationGroup;
use crate::ids::{next_id, IdKind};
use crate::runner::Runner;
use crate::sync::{lock, read, write};
use crate::trigger::Trigger;

const EVENT_CAPACITY: usize = 64;

/// A loaded automation
pub struct Automation {
    id: u64,
    group_id: u64,
    group: Weak<AutomationGroup>,
    config: AutomationConfig,
    triggers: RwLock<Vec<Arc<Trigger>>>,
    conditions: RwLock<Vec<Arc<Condition>>>,
    actions: RwLock<Vec<Arc<Action>>>,
    running: Mutex<Vec<Arc<Runner>>>,
    events: broadcast::Sender<AutomationTriggered>,
    this: Weak<Automation>,
}

impl Automation {
    pub(crate) fn new(group: &AutomationGroup, config: &AutomationConfig) -> Arc<Automation> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|this| Automation {
            id: next_id(IdKind::Automation),
            group_id: group.id(),
            group: group.downgrade(),
            config: config.clone(),
            triggers: RwLock::new(Vec::new()),
            conditions: RwLock::new(Vec::new()),
            actions: RwLock::new(Vec::new()),
            running: Mutex::new(Vec::new()),
            events,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uuid(&self) -> Option<&str> {
        self.config.uuid.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn group(&self) -> Option<Arc<AutomationGroup>> {
        self.group.upgrade()
    }

    pub(crate) fn group_weak(&self) -> Weak<AutomationGroup> {
        self.group.clone()
    }

    pub(crate) fn downgrade(&self) -> Weak<Automation> {
        self.this.clone()
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    pub fn triggers(&self) -> Vec<Arc<Trigger>> {
        read(&self.triggers).clone()
    }

    pub fn conditions(&self) -> Vec<Arc<Condition>> {
        read(&self.conditions).clone()
    }

    pub fn actions(&self) -> Vec<Arc<Action>> {
        read(&self.actions).clone()
    }

    /// Runners created and not yet finished
    pub fn running_runners(&self) -> Vec<Arc<Runner>> {
        lock(&self.running).clone()
    }

    /// Trigger receipts: one per firing this automation receives
    pub fn subscribe(&self) -> broadcast::Receiver<AutomationTriggered> {
        self.events.subscribe()
    }

    /// Attach a trigger
    ///
    /// The caller starts it if the group is already running.
    pub fn add_trigger(&self, trigger: Arc<Trigger>) -> AutomationResult<()> {
        self.check_member("trigger", trigger.id(), trigger.group_id())?;
        let mut triggers = write(&self.triggers);
        check_unique(trigger.uuid(), triggers.iter().map(|t| t.uuid()))?;

        if let Some(this) = self.this.upgrade() {
            trigger.attach(&this);
        }
        triggers.push(trigger);
        Ok(())
    }

    /// Detach a trigger; the caller decides whether to stop it
    pub fn remove_trigger(&self, trigger: &Arc<Trigger>) -> bool {
        let mut triggers = write(&self.triggers);
        let before = triggers.len();
        triggers.retain(|t| !Arc::ptr_eq(t, trigger));
        let removed = triggers.len() != before;
        if removed {
            trigger.detach(self);
        }
        removed
    }

    pub fn add_condition(&self, condition: Arc<Condition>) -> AutomationResult<()> {
        self.check_member("condition", condition.id(), condition.group_id())?;
        let mut conditions = write(&self.conditions);
        check_unique(condition.uuid(), conditions.iter().map(|c| c.uuid()))?;
        conditions.push(condition);
        Ok(())
    }

    pub fn remove_condition(&self, condition: &Arc<Condition>) -> bool {
        remove(&self.conditions, condition)
    }

    pub fn add_action(&self, action: Arc<Action>) -> AutomationResult<()> {
        self.check_member("action", action.id(), action.group_id())?;
        let mut actions = write(&self.actions);
        check_unique(action.uuid(), actions.iter().map(|a| a.uuid()))?;
        actions.push(action);
        Ok(())
    }

    pub fn remove_action(&self, action: &Arc<Action>) -> bool {
        remove(&self.actions, action)
    }

    fn check_member(&self, kind: &'static str, id: u64, group_id: u64) -> AutomationResult<()> {
        if group_id != self.group_id {
            return Err(AutomationError::CrossGroup { kind, id });
        }
        Ok(())
    }

    /// Create a runner over the current conditions and actions
    ///
    /// The runner is listed as running once [`Runner::run`] is called.
    pub fn runner(&self, event: TriggerEvent) -> Arc<Runner> {
        Runner::new(self, event, self.conditions(), self.actions())
    }

    /// Create a runner that skips every condition
    ///
    /// The condition list is cleared only while the snapshot is taken.
    pub fn runner_without_conditions(&self, event: TriggerEvent) -> Arc<Runner> {
        let mut conditions = write(&self.conditions);
        let saved = std::mem::take(&mut *conditions);
        let runner = Runner::new(self, event, conditions.clone(), self.actions());
        *conditions = saved;
        runner
    }

    pub(crate) fn attach_runner(&self, runner: Arc<Runner>) {
        lock(&self.running).push(runner);
    }

    pub(crate) fn forget_runner(&self, runner_id: u64) {
        lock(&self.running).retain(|r| r.id() != runner_id);
    }

    /// Handle a trigger firing: emit a receipt and start a run
    pub fn trigger(&self, event: TriggerEvent) -> Arc<Runner> {
        let runner = self.runner(event.clone());
        info!(
            automation = self.id,
            name = self.name().unwrap_or_default(),
            runner = runner.id(),
            "Automation triggered"
        );

        let receipt = AutomationTriggered {
            automation_id: self.id,
            automation_uuid: self.config.uuid.clone(),
            runner_id: runner.id(),
            event,
        };
        let _ = self.events.send(receipt.clone());
        if let Some(group) = self.group.upgrade() {
            let context = receipt.event.context.clone();
            group.bus().fire_typed(receipt, context);
        }

        let run = runner.run();
        let automation_id = self.id;
        tokio::spawn(async move {
            match run.await {
                Ok(passed) => debug!(automation = automation_id, passed, "Run complete"),
                Err(e) => warn!(automation = automation_id, "Run failed: {}", e),
            }
        });

        runner
    }

    /// JSON view handed to scripts
    pub fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "uuid": self.uuid(),
            "name": self.name(),
            "running": lock(&self.running).len(),
        })
    }
}

impl std::fmt::Debug for Automation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automation")
            .field("id", &self.id)
            .field("uuid", &self.config.uuid)
            .field("name", &self.config.name)
            .finish()
    }
}

pub(crate) fn check_unique<'a>(
    uuid: Option<&str>,
    mut existing: impl Iterator<Item = Option<&'a str>>,
) -> AutomationResult<()> {
    match uuid {
        Some(uuid) if existing.any(|other| other == Some(uuid)) => {
            Err(AutomationError::DuplicateUuid(uuid.to_string()))
        }
        _ => Ok(()),
    }
}

pub(crate) fn remove<T>(list: &RwLock<Vec<Arc<T>>>, item: &Arc<T>) -> bool {
    let mut list = write(list);
    let before = list.len();
    list.retain(|existing| !Arc::ptr_eq(existing, item));
    list.len() != before
}
