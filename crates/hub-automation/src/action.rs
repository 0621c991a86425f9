//! Actions
//!
//! An action is one step an automation or scene performs. Built-in types are
//! `test`, `conditional`, `script`, `set_characteristic` and
//! `run_automation`; plugins provide the rest.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use hub_core::{CharacteristicError, CharacteristicPath};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};

use crate::condition::Condition;
use crate::config::{ActionConfig, ConditionConfig};
use crate::context::RunContext;
use crate::error::{AutomationError, AutomationResult};
use crate::events::{RunnerEvent, TriggerEvent, TriggerSource};
use crate::group::AutomationGroup;
use crate::ids::{next_id, IdKind};
use crate::progress::Progress;
use crate::script::{Script, ScriptOptions, ScriptRole};

/// An action type provided by a plugin
#[async_trait]
pub trait CustomAction: Send + Sync {
    /// Perform the action
    ///
    /// `parents` lists the enclosing conditional actions, outermost first.
    async fn run(
        &self,
        ctx: &RunContext,
        progress: &Progress,
        parents: &[Arc<Action>],
    ) -> AutomationResult<Value>;
}

pub(crate) enum ActionKind {
    /// Completes immediately
    Test,
    Conditional(ConditionalAction),
    Script(Script),
    SetCharacteristic(SetCharacteristic),
    RunAutomation(RunAutomation),
    Plugin(Box<dyn CustomAction>),
}

/// Runs child actions in parallel when its condition passes
pub(crate) struct ConditionalAction {
    condition: Arc<Condition>,
    actions: Vec<Arc<Action>>,
}

#[derive(Deserialize)]
struct ConditionalOptions {
    condition: ConditionConfig,
    #[serde(default)]
    actions: Vec<ActionConfig>,
}

/// Writes, increments or decrements one characteristic
#[derive(Debug, Deserialize)]
pub(crate) struct SetCharacteristic {
    characteristic: CharacteristicPath,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    increase: Option<f64>,
    #[serde(default)]
    decrease: Option<f64>,
}

/// Runs another automation in the same group
#[derive(Debug, Deserialize)]
pub(crate) struct RunAutomation {
    automation_uuid: String,
    #[serde(default)]
    skip_conditions: bool,
}

/// A loaded action
pub struct Action {
    id: u64,
    group_id: u64,
    config: ActionConfig,
    kind: ActionKind,
}

impl Action {
    pub(crate) fn load(
        group: &AutomationGroup,
        config: &ActionConfig,
    ) -> AutomationResult<Arc<Action>> {
        let id = next_id(IdKind::Action);

        let kind = match &config.plugin {
            Some(plugin) => {
                let factory = group.registry().action_factory(plugin, &config.action)?;
                ActionKind::Plugin(factory(&config.options_value())?)
            }
            None => match config.action.as_str() {
                "test" => ActionKind::Test,
                "conditional" => {
                    let options: ConditionalOptions = config.options()?;
                    ActionKind::Conditional(ConditionalAction {
                        condition: Condition::load(group, &options.condition)?,
                        actions: options
                            .actions
                            .iter()
                            .map(|child| Action::load(group, child))
                            .collect::<AutomationResult<_>>()?,
                    })
                }
                "script" => {
                    let options: ScriptOptions = config.options()?;
                    ActionKind::Script(Script::compile(
                        group,
                        &format!("action {}", id),
                        &options.script,
                        ScriptRole::Action,
                    )?)
                }
                "set_characteristic" => ActionKind::SetCharacteristic(config.options()?),
                "run_automation" => ActionKind::RunAutomation(config.options()?),
                other => {
                    return Err(AutomationError::Config(format!(
                        "unknown action type '{}'",
                        other
                    )))
                }
            },
        };

        Ok(Arc::new(Action {
            id,
            group_id: group.id(),
            config: config.clone(),
            kind,
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

    pub fn config(&self) -> &ActionConfig {
        &self.config
    }

    /// JSON view handed to scripts
    pub fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "uuid": self.uuid(),
            "type": self.config.type_name(),
        })
    }

    /// Perform the action
    pub fn run<'a>(
        self: &'a Arc<Self>,
        ctx: &'a RunContext,
        progress: &'a Progress,
        parents: &'a [Arc<Action>],
    ) -> BoxFuture<'a, AutomationResult<Value>> {
        Box::pin(async move {
            trace!(action = self.id, kind = %self.config.type_name(), "Running action");

            match &self.kind {
                ActionKind::Test => {
                    tokio::task::yield_now().await;
                    Ok(Value::Null)
                }
                ActionKind::Conditional(conditional) => {
                    conditional.run(self, ctx, progress, parents).await
                }
                ActionKind::Script(script) => {
                    let parents = Value::Array(parents.iter().map(|a| a.describe()).collect());
                    script.call(ctx, progress, parents, self.describe()).await
                }
                ActionKind::SetCharacteristic(set) => set.run(ctx).await,
                ActionKind::RunAutomation(run) => run.run(self, ctx, progress).await,
                ActionKind::Plugin(action) => action.run(ctx, progress, parents).await,
            }
        })
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("type", &self.config.type_name())
            .field("uuid", &self.config.uuid)
            .finish()
    }
}

impl ConditionalAction {
    /// The condition fills the first half of the progress range, the child
    /// actions the second half
    async fn run(
        &self,
        this: &Arc<Action>,
        ctx: &RunContext,
        progress: &Progress,
        parents: &[Arc<Action>],
    ) -> AutomationResult<Value> {
        let band = progress.band(0.0, 0.5);
        let passed = self.condition.check(ctx, &band, &[]).await;
        band.finish();

        if !passed? {
            debug!(action = this.id, "Condition not met, skipping actions");
            return Ok(Value::Bool(false));
        }
        progress.set(0.5)?;

        let mut lineage = parents.to_vec();
        lineage.push(this.clone());
        let lineage = &lineage;

        let count = self.actions.len() as f64;
        let runs = self.actions.iter().enumerate().map(|(index, action)| async move {
            let band = progress.band(
                0.5 + 0.5 * index as f64 / count,
                0.5 + 0.5 * (index + 1) as f64 / count,
            );
            let result = action.run(ctx, &band, lineage).await;
            band.finish();

            if let Err(e) = &result {
                warn!(action = this.id, child = action.id, "Error running action: {}", e);
            }
        });
        join_all(runs).await;

        Ok(Value::Bool(true))
    }
}

enum Change<'a> {
    Set(&'a Value),
    Add(f64),
}

impl SetCharacteristic {
    async fn run(&self, ctx: &RunContext) -> AutomationResult<Value> {
        let change = match (&self.value, self.increase, self.decrease) {
            (Some(value), None, None) => Change::Set(value),
            (None, Some(amount), None) => Change::Add(amount),
            (None, None, Some(amount)) => Change::Add(-amount),
            _ => {
                return Err(AutomationError::Config(
                    "set_characteristic needs exactly one of value, increase or decrease"
                        .to_string(),
                ))
            }
        };

        let group = ctx.group()?;
        let characteristic = group
            .accessories()
            .characteristic(&self.characteristic)
            .ok_or_else(|| CharacteristicError::NotFound(self.characteristic.clone()))?;

        let value = match change {
            Change::Set(value) => value.clone(),
            Change::Add(amount) => offset(&self.characteristic, &characteristic.value(), amount)?,
        };

        debug!(characteristic = %self.characteristic, value = %value, "Setting characteristic");
        characteristic.set_value(value).await?;
        Ok(Value::Null)
    }
}

/// Numeric value shifted by `amount`, staying an integer where possible
fn offset(path: &CharacteristicPath, current: &Value, amount: f64) -> AutomationResult<Value> {
    let invalid = |reason: String| -> AutomationError {
        CharacteristicError::InvalidValue {
            path: path.clone(),
            reason,
        }
        .into()
    };

    if let (Some(integer), true) = (current.as_i64(), amount.fract() == 0.0) {
        return integer
            .checked_add(amount as i64)
            .map(|shifted| json!(shifted))
            .ok_or_else(|| invalid(format!("offsetting {} by {} overflows", integer, amount)));
    }
    let Some(number) = current.as_f64() else {
        return Err(invalid(format!("cannot offset non-numeric value {}", current)));
    };
    let shifted = number + amount;
    if !shifted.is_finite() {
        return Err(invalid(format!("offsetting {} by {} is not finite", number, amount)));
    }
    Ok(json!(shifted))
}

impl RunAutomation {
    /// Resolves to whether the target's run succeeded, or null when no
    /// automation has the uuid
    async fn run(
        &self,
        this: &Arc<Action>,
        ctx: &RunContext,
        progress: &Progress,
    ) -> AutomationResult<Value> {
        let group = ctx.group()?;
        let Some(automation) = group.automation_by_uuid(&self.automation_uuid) else {
            debug!(action = this.id, uuid = %self.automation_uuid, "No automation to run");
            return Ok(Value::Null);
        };

        let runner = ctx.runner();
        let event = TriggerEvent::new(
            TriggerSource::Action {
                action_id: this.id,
                action_uuid: this.config.uuid.clone(),
                automation_id: runner.map(|r| r.automation_id()),
                runner_id: runner.map(|r| r.id()),
            },
            json!({}),
            ctx.event_context(),
        );

        let runner = if self.skip_conditions {
            automation.runner_without_conditions(event)
        } else {
            automation.runner(event)
        };

        let mut events = runner.subscribe();
        let forward = async {
            loop {
                match events.recv().await {
                    Ok(RunnerEvent::Progress { progress: value }) => {
                        if let Err(e) = progress.set(value) {
                            warn!(action = this.id, "Dropping nested progress: {}", e);
                        }
                    }
                    Ok(RunnerEvent::Finished { .. }) => {
                        if let Err(e) = progress.set(1.0) {
                            warn!(action = this.id, "Dropping nested progress: {}", e);
                        }
                        break;
                    }
                    Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        };

        let (result, ()) = futures::join!(runner.run(), forward);
        Ok(Value::Bool(result?))
    }
}
