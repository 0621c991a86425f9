//! Trigger that fires when a scene becomes active

use async_trait::async_trait;
use hub_event_bus::EventBus;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{TriggerDriver, TriggerHandle};
use crate::error::AutomationResult;
use crate::events::SceneActivated;
use crate::sync::lock;

#[derive(Debug, Deserialize)]
pub(crate) struct SceneTriggerOptions {
    #[serde(alias = "scene")]
    scene_uuid: String,
}

/// Fires with `{ parent: <activation event> }` each time the scene with
/// the configured uuid flips to active
pub struct SceneTrigger {
    scene_uuid: String,
    bus: Arc<EventBus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SceneTrigger {
    pub(crate) fn new(options: SceneTriggerOptions, bus: Arc<EventBus>) -> Self {
        Self {
            scene_uuid: options.scene_uuid,
            bus,
            task: Mutex::new(None),
        }
    }

    pub fn scene_uuid(&self) -> &str {
        &self.scene_uuid
    }
}

#[async_trait]
impl TriggerDriver for SceneTrigger {
    async fn on_start(&self, handle: TriggerHandle) -> AutomationResult<()> {
        // Subscribe before returning so no activation after start is missed
        let mut activations = self.bus.subscribe_typed::<SceneActivated>();
        let scene_uuid = self.scene_uuid.clone();

        let task = tokio::spawn(async move {
            loop {
                match activations.recv().await {
                    Ok(event) if event.data.scene_uuid.as_deref() == Some(scene_uuid.as_str()) => {
                        let parent = serde_json::to_value(&event).unwrap_or(Value::Null);
                        if let Err(e) = handle.fire(json!({ "parent": parent })) {
                            debug!(trigger = handle.trigger_id(), "Skipping scene firing: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(trigger = handle.trigger_id(), skipped, "Scene trigger lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn on_stop(&self) -> AutomationResult<()> {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        Ok(())
    }
}
