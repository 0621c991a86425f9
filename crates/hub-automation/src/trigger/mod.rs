//! Triggers
//!
//! A trigger starts automation runs. Starting and stopping are memoized:
//! concurrent callers share one in-flight operation, a start issued while a
//! stop is pending waits for the stop to settle (and the reverse), and
//! starting a running trigger or stopping a stopped one does nothing.

mod cron;
mod scene;

pub use self::cron::CronTrigger;
pub use self::scene::SceneTrigger;

use async_trait::async_trait;
use futures::future::{self, FutureExt};
use hub_core::Context;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use crate::automation::Automation;
use crate::config::TriggerConfig;
use crate::error::{AutomationError, AutomationResult};
use crate::events::{TriggerEvent, TriggerSource};
use crate::group::AutomationGroup;
use crate::ids::{next_id, IdKind};
use crate::sync::{lock, SharedFuture};

/// Start/stop hooks for a trigger type
///
/// `on_start` arranges for [`TriggerHandle::fire`] to be called whenever the
/// trigger should fire; `on_stop` undoes it. The owning [`Trigger`] handles
/// memoization, so each hook only runs on an actual state change.
#[async_trait]
pub trait TriggerDriver: Send + Sync {
    async fn on_start(&self, handle: TriggerHandle) -> AutomationResult<()>;

    async fn on_stop(&self) -> AutomationResult<()>;
}

/// Lets a driver fire the trigger it belongs to
#[derive(Clone)]
pub struct TriggerHandle {
    id: u64,
    trigger: Weak<Trigger>,
}

impl TriggerHandle {
    fn new(trigger: &Arc<Trigger>) -> Self {
        Self {
            id: trigger.id,
            trigger: Arc::downgrade(trigger),
        }
    }

    pub fn trigger_id(&self) -> u64 {
        self.id
    }

    /// Fire the trigger; fails when it is not running
    pub fn fire(&self, data: Value) -> AutomationResult<TriggerEvent> {
        match self.trigger.upgrade() {
            Some(trigger) => trigger.trigger(data),
            None => Err(AutomationError::NotRunning(self.id)),
        }
    }
}

pub(crate) enum TriggerKind {
    Cron(CronTrigger),
    Scene(SceneTrigger),
    Plugin(Box<dyn TriggerDriver>),
}

impl TriggerKind {
    fn driver(&self) -> &dyn TriggerDriver {
        match self {
            TriggerKind::Cron(cron) => cron,
            TriggerKind::Scene(scene) => scene,
            TriggerKind::Plugin(driver) => driver.as_ref(),
        }
    }
}

#[derive(Default)]
struct TriggerState {
    running: bool,
    starting: Option<SharedFuture<()>>,
    stopping: Option<SharedFuture<()>>,
}

/// A loaded trigger, shared by every automation that lists it
pub struct Trigger {
    id: u64,
    group_id: u64,
    config: TriggerConfig,
    kind: TriggerKind,
    state: Mutex<TriggerState>,
    owners: Mutex<Vec<Weak<Automation>>>,
    this: Weak<Trigger>,
}

impl Trigger {
    pub(crate) fn load(
        group: &AutomationGroup,
        config: &TriggerConfig,
    ) -> AutomationResult<Arc<Trigger>> {
        let kind = match &config.plugin {
            Some(plugin) => {
                let factory = group.registry().trigger_factory(plugin, &config.trigger)?;
                TriggerKind::Plugin(factory(&config.options_value())?)
            }
            None => match config.trigger.as_str() {
                "cron" => TriggerKind::Cron(CronTrigger::new(config.options()?)?),
                "scene" => TriggerKind::Scene(SceneTrigger::new(
                    config.options()?,
                    group.bus().clone(),
                )),
                other => {
                    return Err(AutomationError::Config(format!(
                        "unknown trigger type '{}'",
                        other
                    )))
                }
            },
        };

        Ok(Arc::new_cyclic(|this| Trigger {
            id: next_id(IdKind::Trigger),
            group_id: group.id(),
            config: config.clone(),
            kind,
            state: Mutex::new(TriggerState::default()),
            owners: Mutex::new(Vec::new()),
            this: this.clone(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uuid(&self) -> Option<&str> {
        self.config.uuid.as_deref()
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Start the trigger
    ///
    /// Returns the in-flight start if there is one.
    pub fn start(&self) -> SharedFuture<()> {
        let mut state = lock(&self.state);
        if let Some(starting) = &state.starting {
            return starting.clone();
        }
        let Some(this) = self.this.upgrade() else {
            return self.dropped();
        };

        let stopping = state.stopping.clone();
        let starting = async move {
            if let Some(stopping) = stopping {
                let _ = stopping.await;
            }
            let result = this.start_driver().await;
            lock(&this.state).starting = None;
            result
        }
        .boxed()
        .shared();

        state.starting = Some(starting.clone());
        starting
    }

    /// Stop the trigger
    ///
    /// Returns the in-flight stop if there is one.
    pub fn stop(&self) -> SharedFuture<()> {
        let mut state = lock(&self.state);
        if let Some(stopping) = &state.stopping {
            return stopping.clone();
        }
        let Some(this) = self.this.upgrade() else {
            return self.dropped();
        };

        let starting = state.starting.clone();
        let stopping = async move {
            if let Some(starting) = starting {
                let _ = starting.await;
            }
            let result = this.stop_driver().await;
            lock(&this.state).stopping = None;
            result
        }
        .boxed()
        .shared();

        state.stopping = Some(stopping.clone());
        stopping
    }

    async fn start_driver(self: &Arc<Self>) -> AutomationResult<()> {
        if self.is_running() {
            return Ok(());
        }

        debug!(trigger = self.id, kind = %self.config.type_name(), "Starting trigger");
        self.kind.driver().on_start(TriggerHandle::new(self)).await?;
        lock(&self.state).running = true;
        Ok(())
    }

    async fn stop_driver(&self) -> AutomationResult<()> {
        if !self.is_running() {
            return Ok(());
        }

        debug!(trigger = self.id, kind = %self.config.type_name(), "Stopping trigger");
        lock(&self.state).running = false;
        self.kind.driver().on_stop().await
    }

    fn dropped(&self) -> SharedFuture<()> {
        future::ready(Err(AutomationError::NotFound(format!("trigger {}", self.id))))
            .boxed()
            .shared()
    }

    /// Fire the trigger, starting a run in every automation that lists it
    pub fn trigger(&self, data: Value) -> AutomationResult<TriggerEvent> {
        if !self.is_running() {
            return Err(AutomationError::NotRunning(self.id));
        }

        let event = TriggerEvent::new(
            TriggerSource::Trigger {
                trigger_id: self.id,
                trigger_uuid: self.config.uuid.clone(),
            },
            data,
            Context::new(),
        );

        let owners = self.owners();
        debug!(trigger = self.id, automations = owners.len(), "Trigger fired");
        if owners.is_empty() {
            warn!(trigger = self.id, "Trigger fired with no automations attached");
        }
        for automation in owners {
            automation.trigger(event.clone());
        }

        Ok(event)
    }

    /// Automations that list this trigger
    pub fn owners(&self) -> Vec<Arc<Automation>> {
        lock(&self.owners).iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn attach(&self, automation: &Arc<Automation>) {
        let mut owners = lock(&self.owners);
        owners.retain(|owner| owner.strong_count() > 0);
        if !owners.iter().any(|owner| std::ptr::eq(owner.as_ptr(), Arc::as_ptr(automation))) {
            owners.push(Arc::downgrade(automation));
        }
    }

    pub(crate) fn detach(&self, automation: &Automation) {
        lock(&self.owners).retain(|owner| {
            owner.strong_count() > 0 && !std::ptr::eq(owner.as_ptr(), automation)
        });
    }

    /// JSON view used in logs and scripts
    pub fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "uuid": self.uuid(),
            "type": self.config.type_name(),
            "running": self.is_running(),
        })
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("id", &self.id)
            .field("type", &self.config.type_name())
            .field("uuid", &self.config.uuid)
            .field("running", &self.is_running())
            .finish()
    }
}
