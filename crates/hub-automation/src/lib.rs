//! Automation execution engine
//!
//! Automations are built from three parts:
//! - **Triggers** start runs (cron schedules, scene activations, plugins)
//! - **Conditions** are checked in order before any action runs
//! - **Actions** run concurrently once every condition has passed
//!
//! A [`Runner`] is one execution of an [`Automation`], reporting progress
//! and lifecycle events as it goes. [`Scene`]s pair enable and disable
//! actions with conditions that decide whether the scene is active. All of
//! these live in an [`AutomationGroup`], which shares one accessory model,
//! event bus and plugin [`Registry`] between them.

pub mod action;
pub mod automation;
pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod group;
mod ids;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod scene;
pub mod script;
mod sync;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use action::{Action, CustomAction};
pub use automation::Automation;
pub use condition::{Condition, CustomCondition};
pub use config::{ActionConfig, AutomationConfig, ConditionConfig, SceneConfig, TriggerConfig};
pub use context::RunContext;
pub use error::{AutomationError, AutomationResult};
pub use events::{
    AutomationRunnerEvent, AutomationTriggered, RunnerEvent, SceneActivated, SceneEvent,
    SceneStateEvent, TriggerEvent, TriggerSource,
};
pub use group::AutomationGroup;
pub use progress::Progress;
pub use registry::{PluginTypes, Registry};
pub use runner::Runner;
pub use scene::Scene;
pub use script::ScriptSource;
pub use sync::SharedFuture;
pub use trigger::{CronTrigger, SceneTrigger, Trigger, TriggerDriver, TriggerHandle};
