//! A single execution of an automation
//!
//! A runner snapshots the automation's conditions and actions when it is
//! created, so edits to the automation never affect a run in progress. It
//! checks the conditions one at a time, stopping at the first that fails,
//! then runs every action concurrently. Each condition and action owns a
//! progress slot; overall progress is the mean of all slots, held below 1
//! until the run has finished.

use futures::future::{self, join_all, FutureExt};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info_span, trace, Instrument};

use crate::action::Action;
use crate::automation::Automation;
use crate::condition::Condition;
use crate::context::RunContext;
use crate::error::{AutomationError, AutomationResult};
use crate::events::{AutomationRunnerEvent, RunnerEvent, TriggerEvent};
use crate::group::AutomationGroup;
use crate::ids::{next_id, IdKind};
use crate::progress::Progress;
use crate::sync::{lock, SharedFuture};

const EVENT_CAPACITY: usize = 256;

/// Highest progress a runner reports before it has finished
const RUNNING_CEILING: f64 = 1.0 - f64::EPSILON;

struct RunnerState {
    conditions: Vec<f64>,
    actions: Vec<f64>,
    finished: bool,
    run: Option<SharedFuture<bool>>,
}

impl RunnerState {
    fn progress(&self) -> f64 {
        let total = self.conditions.len() + self.actions.len();
        if self.finished || total == 0 {
            return 1.0;
        }
        let sum: f64 = self.conditions.iter().chain(self.actions.iter()).sum();
        (sum / total as f64).min(RUNNING_CEILING)
    }
}

fn mean(slots: &[f64]) -> f64 {
    if slots.is_empty() {
        1.0
    } else {
        slots.iter().sum::<f64>() / slots.len() as f64
    }
}

/// One execution of an automation
pub struct Runner {
    id: u64,
    automation: Weak<Automation>,
    automation_id: u64,
    automation_uuid: Option<String>,
    group: Weak<AutomationGroup>,
    event: TriggerEvent,
    conditions: Vec<Arc<Condition>>,
    actions: Vec<Arc<Action>>,
    state: Mutex<RunnerState>,
    events: broadcast::Sender<RunnerEvent>,
    this: Weak<Runner>,
}

impl Runner {
    pub(crate) fn new(
        automation: &Automation,
        event: TriggerEvent,
        conditions: Vec<Arc<Condition>>,
        actions: Vec<Arc<Action>>,
    ) -> Arc<Runner> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|this| Runner {
            id: next_id(IdKind::Runner),
            automation: automation.downgrade(),
            automation_id: automation.id(),
            automation_uuid: automation.uuid().map(str::to_string),
            group: automation.group_weak(),
            event,
            state: Mutex::new(RunnerState {
                conditions: vec![0.0; conditions.len()],
                actions: vec![0.0; actions.len()],
                finished: false,
                run: None,
            }),
            conditions,
            actions,
            events,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn automation(&self) -> Option<Arc<Automation>> {
        self.automation.upgrade()
    }

    pub fn automation_id(&self) -> u64 {
        self.automation_id
    }

    pub fn automation_uuid(&self) -> Option<&str> {
        self.automation_uuid.as_deref()
    }

    pub fn group(&self) -> Option<Arc<AutomationGroup>> {
        self.group.upgrade()
    }

    /// The trigger event this run was started for
    pub fn event(&self) -> &TriggerEvent {
        &self.event
    }

    /// Conditions captured when the runner was created
    pub fn conditions(&self) -> &[Arc<Condition>] {
        &self.conditions
    }

    /// Actions captured when the runner was created
    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.state).finished
    }

    /// Mean of every condition and action slot; 1 once finished
    pub fn progress(&self) -> f64 {
        lock(&self.state).progress()
    }

    pub fn condition_progress(&self) -> Vec<f64> {
        lock(&self.state).conditions.clone()
    }

    pub fn action_progress(&self) -> Vec<f64> {
        lock(&self.state).actions.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    /// Run the automation
    ///
    /// Resolves to whether the actions ran. Every caller gets the same
    /// in-flight run; calling after the run has finished is an error.
    pub fn run(&self) -> SharedFuture<bool> {
        let mut state = lock(&self.state);
        if state.finished {
            return future::ready(Err(AutomationError::RunnerFinished(self.id)))
                .boxed()
                .shared();
        }
        if let Some(run) = &state.run {
            return run.clone();
        }
        let Some(this) = self.this.upgrade() else {
            return future::ready(Err(AutomationError::RunnerFinished(self.id)))
                .boxed()
                .shared();
        };

        this.attach();

        let span = info_span!("runner", automation = self.automation_id, runner = self.id);
        let run = async move {
            let result = this.execute().await;
            this.detach();
            result
        }
        .instrument(span)
        .boxed()
        .shared();

        state.run = Some(run.clone());
        run
    }

    async fn execute(self: &Arc<Self>) -> AutomationResult<bool> {
        let ctx = RunContext::Runner(self.clone());

        debug!(
            conditions = self.conditions.len(),
            actions = self.actions.len(),
            "Starting run"
        );

        for (index, condition) in self.conditions.iter().enumerate() {
            let progress = self.slot(Slot::Condition, index);
            let result = condition.check(&ctx, &progress, &[]).await;
            progress.finish();
            self.complete(Slot::Condition, index);

            let condition_id = condition.id();
            match result {
                Ok(passed) => {
                    self.emit(RunnerEvent::ConditionFinished {
                        index,
                        condition_id,
                        passed,
                    });
                    if !passed {
                        debug!(condition = condition_id, "Condition failed, skipping actions");
                        self.emit(RunnerEvent::ConditionFailed { index, condition_id });
                        self.mark_finished();
                        self.emit(RunnerEvent::Finished { success: false });
                        return Ok(false);
                    }
                    self.emit(RunnerEvent::ConditionPassed { index, condition_id });
                }
                Err(e) => {
                    error!(condition = condition_id, "Error checking condition: {}", e);
                    self.emit(RunnerEvent::ConditionError {
                        index,
                        condition_id,
                        error: e.to_string(),
                    });
                    self.emit(RunnerEvent::ConditionFailed { index, condition_id });
                    self.mark_finished();
                    self.emit(RunnerEvent::Error {
                        error: e.to_string(),
                    });
                    self.emit(RunnerEvent::Finished { success: false });
                    return Err(e);
                }
            }
        }

        let ctx = &ctx;
        let runs = self.actions.iter().enumerate().map(|(index, action)| async move {
            let progress = self.slot(Slot::Action, index);
            let result = action.run(ctx, &progress, &[]).await;
            progress.finish();
            self.complete(Slot::Action, index);

            let action_id = action.id();
            match result {
                Ok(_) => self.emit(RunnerEvent::ActionFinished { index, action_id }),
                Err(e) => {
                    error!(action = action_id, "Error running action: {}", e);
                    self.emit(RunnerEvent::ActionError {
                        index,
                        action_id,
                        error: e.to_string(),
                    });
                }
            }
        });
        join_all(runs).await;

        self.mark_finished();
        self.emit(RunnerEvent::Finished { success: true });
        debug!("Run finished");
        Ok(true)
    }

    fn slot(self: &Arc<Self>, slot: Slot, index: usize) -> Progress {
        let runner = Arc::downgrade(self);
        Progress::new(move |value| {
            if let Some(runner) = runner.upgrade() {
                runner.update(slot, index, value);
            }
            Ok(())
        })
    }

    fn update(&self, slot: Slot, index: usize, value: f64) {
        let (group_progress, overall) = {
            let mut state = lock(&self.state);
            let slots = match slot {
                Slot::Condition => &mut state.conditions,
                Slot::Action => &mut state.actions,
            };
            slots[index] = value;
            let group_progress = mean(slots);
            (group_progress, state.progress())
        };

        match slot {
            Slot::Condition => {
                let condition_id = self.conditions[index].id();
                self.emit(RunnerEvent::ConditionProgress {
                    index,
                    condition_id,
                    progress: value,
                });
                self.emit(RunnerEvent::ConditionsProgress {
                    progress: group_progress,
                });
            }
            Slot::Action => {
                let action_id = self.actions[index].id();
                self.emit(RunnerEvent::ActionProgress {
                    index,
                    action_id,
                    progress: value,
                });
                self.emit(RunnerEvent::ActionsProgress {
                    progress: group_progress,
                });
            }
        }
        self.emit(RunnerEvent::Progress { progress: overall });
    }

    /// Fill a slot without emitting progress events
    fn complete(&self, slot: Slot, index: usize) {
        let mut state = lock(&self.state);
        match slot {
            Slot::Condition => state.conditions[index] = 1.0,
            Slot::Action => state.actions[index] = 1.0,
        }
    }

    fn mark_finished(&self) {
        lock(&self.state).finished = true;
    }

    fn emit(&self, event: RunnerEvent) {
        trace!(runner = self.id, event = event.name(), "Runner event");

        // Nobody listening is fine
        let _ = self.events.send(event.clone());

        if let Some(group) = self.group.upgrade() {
            group.bus().fire_typed(
                AutomationRunnerEvent {
                    automation_id: self.automation_id,
                    automation_uuid: self.automation_uuid.clone(),
                    runner_id: self.id,
                    event,
                },
                self.event.context.clone(),
            );
        }
    }

    fn attach(self: &Arc<Self>) {
        if let Some(automation) = self.automation.upgrade() {
            automation.attach_runner(self.clone());
        }
        if let Some(group) = self.group.upgrade() {
            group.register_runner(self.clone());
        }
    }

    fn detach(&self) {
        if let Some(automation) = self.automation.upgrade() {
            automation.forget_runner(self.id);
        }
        if let Some(group) = self.group.upgrade() {
            group.forget_runner(self.id);
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.id)
            .field("automation_id", &self.automation_id)
            .field("progress", &self.progress())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Condition,
    Action,
}
