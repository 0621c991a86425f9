//! Lifecycle events published by triggers, runners, automations and scenes

use chrono::{DateTime, Utc};
use hub_core::{Context, EventData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Why an automation run was started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Unique id for this firing (ULID)
    pub id: String,

    pub source: TriggerSource,

    pub context: Context,

    /// Trigger-specific payload
    pub data: Value,

    pub time: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(source: TriggerSource, data: Value, context: Context) -> Self {
        Self {
            id: Ulid::new().to_string(),
            source,
            context,
            data,
            time: Utc::now(),
        }
    }

    /// An event for a run started by hand rather than by a trigger
    pub fn manual(data: Value) -> Self {
        Self::new(TriggerSource::Manual, data, Context::new())
    }
}

/// What fired a [`TriggerEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSource {
    Trigger {
        trigger_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        trigger_uuid: Option<String>,
    },
    /// A run-automation action inside another automation's runner
    Action {
        action_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        action_uuid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        automation_id: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        runner_id: Option<u64>,
    },
    Manual,
}

/// Events emitted by a runner over its lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunnerEvent {
    /// Overall progress, the mean of every condition and action slot
    Progress { progress: f64 },
    ConditionProgress { index: usize, condition_id: u64, progress: f64 },
    /// Mean of the condition slots
    ConditionsProgress { progress: f64 },
    ConditionFinished { index: usize, condition_id: u64, passed: bool },
    ConditionPassed { index: usize, condition_id: u64 },
    ConditionFailed { index: usize, condition_id: u64 },
    ConditionError { index: usize, condition_id: u64, error: String },
    ActionProgress { index: usize, action_id: u64, progress: f64 },
    /// Mean of the action slots
    ActionsProgress { progress: f64 },
    ActionFinished { index: usize, action_id: u64 },
    ActionError { index: usize, action_id: u64, error: String },
    Error { error: String },
    Finished { success: bool },
}

impl RunnerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunnerEvent::Progress { .. } => "progress",
            RunnerEvent::ConditionProgress { .. } => "condition-progress",
            RunnerEvent::ConditionsProgress { .. } => "conditions-progress",
            RunnerEvent::ConditionFinished { .. } => "condition-finished",
            RunnerEvent::ConditionPassed { .. } => "condition-passed",
            RunnerEvent::ConditionFailed { .. } => "condition-failed",
            RunnerEvent::ConditionError { .. } => "condition-error",
            RunnerEvent::ActionProgress { .. } => "action-progress",
            RunnerEvent::ActionsProgress { .. } => "actions-progress",
            RunnerEvent::ActionFinished { .. } => "action-finished",
            RunnerEvent::ActionError { .. } => "action-error",
            RunnerEvent::Error { .. } => "error",
            RunnerEvent::Finished { .. } => "finished",
        }
    }
}

/// Events emitted by a scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SceneEvent {
    Progress { progress: f64 },
    Activating,
    Activated,
    Deactivating,
    Deactivated,
    ActionError { index: usize, action_id: u64, error: String },
}

impl SceneEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SceneEvent::Progress { .. } => "progress",
            SceneEvent::Activating => "activating",
            SceneEvent::Activated => "activated",
            SceneEvent::Deactivating => "deactivating",
            SceneEvent::Deactivated => "deactivated",
            SceneEvent::ActionError { .. } => "action-error",
        }
    }
}

/// Receipt of a trigger firing, emitted by the automation that received it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationTriggered {
    pub automation_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_uuid: Option<String>,
    pub runner_id: u64,
    pub event: TriggerEvent,
}

impl EventData for AutomationTriggered {
    fn event_type() -> &'static str {
        "automation_triggered"
    }
}

/// A runner event mirrored onto the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRunnerEvent {
    pub automation_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_uuid: Option<String>,
    pub runner_id: u64,
    pub event: RunnerEvent,
}

impl EventData for AutomationRunnerEvent {
    fn event_type() -> &'static str {
        "automation_runner"
    }
}

/// A scene event mirrored onto the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneStateEvent {
    pub scene_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_uuid: Option<String>,
    pub event: SceneEvent,
}

impl EventData for SceneStateEvent {
    fn event_type() -> &'static str {
        "scene"
    }
}

/// Fired when a scene flips to active; scene triggers listen for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneActivated {
    pub scene_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_uuid: Option<String>,
}

impl EventData for SceneActivated {
    fn event_type() -> &'static str {
        "scene_activated"
    }
}
