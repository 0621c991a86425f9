//! Conditions
//!
//! A condition is a boolean check evaluated before an automation's actions
//! run, or to decide whether a scene is active. Built-in types are `test`,
//! `any`, `all` and `script`; plugins provide the rest.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::config::ConditionConfig;
use crate::context::RunContext;
use crate::error::{AutomationError, AutomationResult};
use crate::group::AutomationGroup;
use crate::ids::{next_id, IdKind};
use crate::progress::Progress;
use crate::script::{Script, ScriptOptions, ScriptRole};

/// A condition type provided by a plugin
#[async_trait]
pub trait CustomCondition: Send + Sync {
    /// Evaluate the condition
    ///
    /// `parents` lists the enclosing composite conditions, outermost first.
    async fn check(
        &self,
        ctx: &RunContext,
        progress: &Progress,
        parents: &[Arc<Condition>],
    ) -> AutomationResult<bool>;
}

pub(crate) enum ConditionKind {
    /// Always passes
    Test,
    /// Passes when any child passes; child errors are logged and skipped
    Any(Vec<Arc<Condition>>),
    /// Passes when every child passes
    All(Vec<Arc<Condition>>),
    Script(Script),
    Plugin(Box<dyn CustomCondition>),
}

#[derive(Deserialize)]
struct CompositeOptions {
    #[serde(default)]
    conditions: Vec<ConditionConfig>,
}

/// A loaded condition
pub struct Condition {
    id: u64,
    group_id: u64,
    config: ConditionConfig,
    kind: ConditionKind,
}

impl Condition {
    pub(crate) fn load(
        group: &AutomationGroup,
        config: &ConditionConfig,
    ) -> AutomationResult<Arc<Condition>> {
        let id = next_id(IdKind::Condition);

        let kind = match &config.plugin {
            Some(plugin) => {
                let factory = group.registry().condition_factory(plugin, &config.condition)?;
                ConditionKind::Plugin(factory(&config.options_value())?)
            }
            None => match config.condition.as_str() {
                "test" => ConditionKind::Test,
                "any" => ConditionKind::Any(load_children(group, config)?),
                "all" => ConditionKind::All(load_children(group, config)?),
                "script" => {
                    let options: ScriptOptions = config.options()?;
                    ConditionKind::Script(Script::compile(
                        group,
                        &format!("condition {}", id),
                        &options.script,
                        ScriptRole::Condition,
                    )?)
                }
                other => {
                    return Err(AutomationError::Config(format!(
                        "unknown condition type '{}'",
                        other
                    )))
                }
            },
        };

        Ok(Arc::new(Condition {
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

    pub fn config(&self) -> &ConditionConfig {
        &self.config
    }

    /// Child conditions of an `any` or `all` condition
    pub fn children(&self) -> &[Arc<Condition>] {
        match &self.kind {
            ConditionKind::Any(children) | ConditionKind::All(children) => children,
            _ => &[],
        }
    }

    /// JSON view handed to scripts
    pub fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "uuid": self.uuid(),
            "type": self.config.type_name(),
        })
    }

    /// Evaluate the condition
    pub fn check<'a>(
        self: &'a Arc<Self>,
        ctx: &'a RunContext,
        progress: &'a Progress,
        parents: &'a [Arc<Condition>],
    ) -> BoxFuture<'a, AutomationResult<bool>> {
        Box::pin(async move {
            trace!(condition = self.id, kind = %self.config.type_name(), "Checking condition");

            match &self.kind {
                ConditionKind::Test => Ok(true),
                ConditionKind::Any(children) => {
                    self.check_any(children, ctx, progress, parents).await
                }
                ConditionKind::All(children) => {
                    self.check_all(children, ctx, progress, parents).await
                }
                ConditionKind::Script(script) => {
                    let parents = Value::Array(parents.iter().map(|c| c.describe()).collect());
                    let result = script.call(ctx, progress, parents, self.describe()).await?;
                    Ok(is_truthy(&result))
                }
                ConditionKind::Plugin(condition) => condition.check(ctx, progress, parents).await,
            }
        })
    }

    async fn check_any(
        self: &Arc<Self>,
        children: &[Arc<Condition>],
        ctx: &RunContext,
        progress: &Progress,
        parents: &[Arc<Condition>],
    ) -> AutomationResult<bool> {
        let lineage = lineage(parents, self);
        let count = children.len() as f64;

        for (index, child) in children.iter().enumerate() {
            let band = progress.band(index as f64 / count, (index + 1) as f64 / count);
            let result = child.check(ctx, &band, &lineage).await;
            band.finish();

            let passed = match result {
                Ok(passed) => passed,
                Err(e) => {
                    warn!(condition = self.id, child = child.id, "Error checking condition: {}", e);
                    false
                }
            };
            progress.set((index + 1) as f64 / count)?;

            if passed {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn check_all(
        self: &Arc<Self>,
        children: &[Arc<Condition>],
        ctx: &RunContext,
        progress: &Progress,
        parents: &[Arc<Condition>],
    ) -> AutomationResult<bool> {
        let lineage = lineage(parents, self);
        let count = children.len() as f64;

        for (index, child) in children.iter().enumerate() {
            let band = progress.band(index as f64 / count, (index + 1) as f64 / count);
            let result = child.check(ctx, &band, &lineage).await;
            band.finish();

            let passed = result?;
            progress.set((index + 1) as f64 / count)?;

            if !passed {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("id", &self.id)
            .field("type", &self.config.type_name())
            .field("uuid", &self.config.uuid)
            .finish()
    }
}

fn load_children(
    group: &AutomationGroup,
    config: &ConditionConfig,
) -> AutomationResult<Vec<Arc<Condition>>> {
    let options: CompositeOptions = config.options()?;
    options
        .conditions
        .iter()
        .map(|child| Condition::load(group, child))
        .collect()
}

fn lineage(parents: &[Arc<Condition>], this: &Arc<Condition>) -> Vec<Arc<Condition>> {
    let mut lineage = parents.to_vec();
    lineage.push(this.clone());
    lineage
}

/// Truthiness of a script result
///
/// `null`, `false`, zero, NaN and the empty string are false; everything
/// else, including empty arrays and objects, is true.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
