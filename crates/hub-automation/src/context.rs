//! The execution context a condition or action runs under

use hub_core::Context;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{AutomationError, AutomationResult};
use crate::group::AutomationGroup;
use crate::runner::Runner;
use crate::scene::Scene;

/// Who is evaluating a condition or running an action
#[derive(Clone)]
pub enum RunContext {
    /// An automation run
    Runner(Arc<Runner>),
    /// A scene enabling, disabling or checking whether it is active
    Scene(Arc<Scene>),
}

impl RunContext {
    pub fn runner(&self) -> Option<&Arc<Runner>> {
        match self {
            RunContext::Runner(runner) => Some(runner),
            RunContext::Scene(_) => None,
        }
    }

    pub fn scene(&self) -> Option<&Arc<Scene>> {
        match self {
            RunContext::Scene(scene) => Some(scene),
            RunContext::Runner(_) => None,
        }
    }

    /// The group the runner or scene belongs to
    pub fn group(&self) -> AutomationResult<Arc<AutomationGroup>> {
        let group = match self {
            RunContext::Runner(runner) => runner.group(),
            RunContext::Scene(scene) => scene.group(),
        };
        group.ok_or(AutomationError::GroupDropped)
    }

    /// Context for anything this run causes
    pub fn event_context(&self) -> Context {
        match self {
            RunContext::Runner(runner) => runner.event().context.child(),
            RunContext::Scene(_) => Context::new(),
        }
    }

    /// JSON view handed to scripts
    pub fn describe(&self) -> Value {
        match self {
            RunContext::Runner(runner) => json!({
                "kind": "runner",
                "id": runner.id(),
                "automation": {
                    "id": runner.automation_id(),
                    "uuid": runner.automation_uuid(),
                },
                "event": runner.event(),
            }),
            RunContext::Scene(scene) => json!({
                "kind": "scene",
                "scene": {
                    "id": scene.id(),
                    "uuid": scene.uuid(),
                    "name": scene.name(),
                },
            }),
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunContext::Runner(runner) => write!(f, "Runner({})", runner.id()),
            RunContext::Scene(scene) => write!(f, "Scene({})", scene.id()),
        }
    }
}
