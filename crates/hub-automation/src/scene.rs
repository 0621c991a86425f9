//! Scenes
//!
//! A scene has active conditions (all must pass for the scene to count as
//! active), enable actions and disable actions. Enabling and disabling are
//! memoized per direction, and a transition in one direction waits for any
//! in-flight transition in the other, so enable and disable actions never
//! run at the same time. Every transition closes with `activated` or
//! `deactivated` once its actions settle. A standalone active check emits
//! the same events only when the result flips.

use futures::future::{self, join_all, FutureExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::action::Action;
use crate::automation::{check_unique, remove};
use crate::condition::Condition;
use crate::config::SceneConfig;
use crate::context::RunContext;
use crate::error::{AutomationError, AutomationResult};
use crate::events::{SceneActivated, SceneEvent, SceneStateEvent};
use crate::group::AutomationGroup;
use crate::ids::{next_id, IdKind};
use crate::progress::Progress;
use crate::sync::{lock, read, write, SharedFuture};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Enable,
    Disable,
}

impl Direction {
    fn opposite(self) -> Direction {
        match self {
            Direction::Enable => Direction::Disable,
            Direction::Disable => Direction::Enable,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Direction::Enable => "enable",
            Direction::Disable => "disable",
        }
    }
}

#[derive(Default)]
struct SceneState {
    last_active: Option<bool>,
    checking: Option<SharedFuture<bool>>,
    enabling: Option<SharedFuture<()>>,
    disabling: Option<SharedFuture<()>>,
}

impl SceneState {
    fn transition(&mut self, direction: Direction) -> &mut Option<SharedFuture<()>> {
        match direction {
            Direction::Enable => &mut self.enabling,
            Direction::Disable => &mut self.disabling,
        }
    }
}

/// A loaded scene
pub struct Scene {
    id: u64,
    group_id: u64,
    group: Weak<AutomationGroup>,
    config: SceneConfig,
    active_conditions: RwLock<Vec<Arc<Condition>>>,
    enable_actions: RwLock<Vec<Arc<Action>>>,
    disable_actions: RwLock<Vec<Arc<Action>>>,
    state: Mutex<SceneState>,
    events: broadcast::Sender<SceneEvent>,
    this: Weak<Scene>,
}

impl Scene {
    pub(crate) fn new(group: &AutomationGroup, config: &SceneConfig) -> Arc<Scene> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|this| Scene {
            id: next_id(IdKind::Scene),
            group_id: group.id(),
            group: group.downgrade(),
            config: config.clone(),
            active_conditions: RwLock::new(Vec::new()),
            enable_actions: RwLock::new(Vec::new()),
            disable_actions: RwLock::new(Vec::new()),
            state: Mutex::new(SceneState::default()),
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

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Result of the last completed active check, if any
    pub fn last_active(&self) -> Option<bool> {
        lock(&self.state).last_active
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SceneEvent> {
        self.events.subscribe()
    }

    pub fn active_conditions(&self) -> Vec<Arc<Condition>> {
        read(&self.active_conditions).clone()
    }

    pub fn enable_actions(&self) -> Vec<Arc<Action>> {
        read(&self.enable_actions).clone()
    }

    pub fn disable_actions(&self) -> Vec<Arc<Action>> {
        read(&self.disable_actions).clone()
    }

    pub fn add_active_condition(&self, condition: Arc<Condition>) -> AutomationResult<()> {
        self.check_member("condition", condition.id(), condition.group_id())?;
        let mut conditions = write(&self.active_conditions);
        check_unique(condition.uuid(), conditions.iter().map(|c| c.uuid()))?;
        conditions.push(condition);
        Ok(())
    }

    pub fn remove_active_condition(&self, condition: &Arc<Condition>) -> bool {
        remove(&self.active_conditions, condition)
    }

    pub fn add_enable_action(&self, action: Arc<Action>) -> AutomationResult<()> {
        self.add_action(&self.enable_actions, action)
    }

    pub fn remove_enable_action(&self, action: &Arc<Action>) -> bool {
        remove(&self.enable_actions, action)
    }

    pub fn add_disable_action(&self, action: Arc<Action>) -> AutomationResult<()> {
        self.add_action(&self.disable_actions, action)
    }

    pub fn remove_disable_action(&self, action: &Arc<Action>) -> bool {
        remove(&self.disable_actions, action)
    }

    fn add_action(&self, list: &RwLock<Vec<Arc<Action>>>, action: Arc<Action>) -> AutomationResult<()> {
        self.check_member("action", action.id(), action.group_id())?;
        let mut actions = write(list);
        check_unique(action.uuid(), actions.iter().map(|a| a.uuid()))?;
        actions.push(action);
        Ok(())
    }

    fn check_member(&self, kind: &'static str, id: u64, group_id: u64) -> AutomationResult<()> {
        if group_id != self.group_id {
            return Err(AutomationError::CrossGroup { kind, id });
        }
        Ok(())
    }

    /// Run the enable actions
    pub fn enable(&self) -> SharedFuture<()> {
        self.transition(Direction::Enable)
    }

    /// Run the disable actions
    pub fn disable(&self) -> SharedFuture<()> {
        self.transition(Direction::Disable)
    }

    fn transition(&self, direction: Direction) -> SharedFuture<()> {
        let mut state = lock(&self.state);
        if let Some(pending) = state.transition(direction) {
            return pending.clone();
        }
        let Some(this) = self.this.upgrade() else {
            return future::ready(Err(AutomationError::NotFound(format!("scene {}", self.id))))
                .boxed()
                .shared();
        };

        let opposite = state.transition(direction.opposite()).clone();
        let span = info_span!("scene", scene = self.id, direction = direction.name());
        let pending = async move {
            if let Some(opposite) = opposite {
                let _ = opposite.await;
            }
            let result = this.run_transition(direction).await;
            *lock(&this.state).transition(direction) = None;
            result
        }
        .instrument(span)
        .boxed()
        .shared();

        *state.transition(direction) = Some(pending.clone());
        pending
    }

    async fn run_transition(self: &Arc<Self>, direction: Direction) -> AutomationResult<()> {
        let actions = match direction {
            Direction::Enable => {
                self.emit(SceneEvent::Activating);
                self.enable_actions()
            }
            Direction::Disable => {
                self.emit(SceneEvent::Deactivating);
                self.disable_actions()
            }
        };
        debug!(actions = actions.len(), "Running scene actions");

        let ctx = RunContext::Scene(self.clone());
        let ctx = &ctx;
        let slots = Arc::new(Mutex::new(vec![0.0; actions.len()]));

        let runs = actions.iter().enumerate().map(|(index, action)| {
            let progress = self.slot(&slots, index);
            async move {
                let result = action.run(ctx, &progress, &[]).await;
                progress.finish();

                if let Err(e) = result {
                    warn!(action = action.id(), "Error running scene action: {}", e);
                    self.emit(SceneEvent::ActionError {
                        index,
                        action_id: action.id(),
                        error: e.to_string(),
                    });
                }
            }
        });
        join_all(runs).await;
        self.emit(SceneEvent::Progress { progress: 1.0 });

        match self.evaluate_active().await {
            Ok(active) => {
                lock(&self.state).last_active = Some(active);
            }
            Err(e) => warn!(scene = self.id, "Error checking whether scene is active: {}", e),
        }
        match direction {
            Direction::Enable => self.announce_activated(),
            Direction::Disable => self.announce_deactivated(),
        }
        Ok(())
    }

    fn slot(self: &Arc<Self>, slots: &Arc<Mutex<Vec<f64>>>, index: usize) -> Progress {
        let scene = Arc::downgrade(self);
        let slots = slots.clone();
        Progress::new(move |value| {
            let progress = {
                let mut slots = lock(&slots);
                slots[index] = value;
                slots.iter().sum::<f64>() / slots.len() as f64
            };
            if let Some(scene) = scene.upgrade() {
                scene.emit(SceneEvent::Progress { progress });
            }
            Ok(())
        })
    }

    /// Check whether every active condition passes
    ///
    /// Concurrent callers share one in-flight check. A completed check
    /// updates [`Scene::last_active`] and emits `activated`/`deactivated`
    /// when the result differs from the previous one (no previous result
    /// counts as inactive).
    pub fn check_active(&self) -> SharedFuture<bool> {
        let mut state = lock(&self.state);
        if let Some(checking) = &state.checking {
            return checking.clone();
        }
        let Some(this) = self.this.upgrade() else {
            return future::ready(Err(AutomationError::NotFound(format!("scene {}", self.id))))
                .boxed()
                .shared();
        };

        let checking = async move {
            let result = this.evaluate_active().await;
            lock(&this.state).checking = None;
            if let Ok(active) = result {
                this.record_active(active);
            }
            result
        }
        .boxed()
        .shared();

        state.checking = Some(checking.clone());
        checking
    }

    async fn evaluate_active(self: &Arc<Self>) -> AutomationResult<bool> {
        let ctx = RunContext::Scene(self.clone());
        for condition in self.active_conditions() {
            let progress = Progress::noop();
            let passed = condition.check(&ctx, &progress, &[]).await;
            progress.finish();
            if !passed? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn record_active(&self, active: bool) {
        let previous = lock(&self.state).last_active.replace(active);
        if previous.unwrap_or(false) == active {
            return;
        }

        if active {
            self.announce_activated();
        } else {
            self.announce_deactivated();
        }
    }

    fn announce_activated(&self) {
        info!(scene = self.id, name = self.name().unwrap_or_default(), "Scene activated");
        self.emit(SceneEvent::Activated);
        if let Some(group) = self.group.upgrade() {
            group.bus().fire_typed(
                SceneActivated {
                    scene_id: self.id,
                    scene_uuid: self.config.uuid.clone(),
                },
                hub_core::Context::new(),
            );
        }
    }

    fn announce_deactivated(&self) {
        info!(scene = self.id, name = self.name().unwrap_or_default(), "Scene deactivated");
        self.emit(SceneEvent::Deactivated);
    }

    fn emit(&self, event: SceneEvent) {
        let _ = self.events.send(event.clone());
        if let Some(group) = self.group.upgrade() {
            group.bus().fire_typed(
                SceneStateEvent {
                    scene_id: self.id,
                    scene_uuid: self.config.uuid.clone(),
                    event,
                },
                hub_core::Context::new(),
            );
        }
    }

    /// JSON view used by the server's status output
    pub fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "uuid": self.uuid(),
            "name": self.name(),
            "active": self.last_active(),
        })
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("id", &self.id)
            .field("uuid", &self.config.uuid)
            .field("name", &self.config.name)
            .finish()
    }
}
