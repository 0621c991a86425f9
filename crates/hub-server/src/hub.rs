//! The running hub: accessory model, event bus and automation group

use anyhow::{Context as _, Result};
use hub_automation::{AutomationGroup, Registry};
use hub_config::HubConfig;
use hub_core::MemoryAccessoryModel;
use hub_event_bus::EventBus;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Hub {
    pub bus: Arc<EventBus>,
    pub accessories: Arc<MemoryAccessoryModel>,
    pub group: Arc<AutomationGroup>,
}

impl Hub {
    /// Seed accessories, then load every scene before any automation so
    /// automations can reference scenes from their first start
    pub async fn from_config(config: &HubConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let accessories = Arc::new(MemoryAccessoryModel::new());
        for accessory in &config.accessories {
            accessories.add_characteristic(
                accessory.characteristic.clone(),
                accessory.value.clone(),
                accessory.writable,
            );
        }

        let group = AutomationGroup::new(
            config.name.clone(),
            accessories.clone(),
            bus.clone(),
            Arc::new(Registry::new()),
        );

        for (index, scene) in config.scenes.iter().enumerate() {
            group
                .load_scene(scene)
                .with_context(|| format!("loading scene #{} ({:?})", index, scene.name))?;
        }
        for (index, automation) in config.automations.iter().enumerate() {
            group
                .load_automation(automation)
                .await
                .with_context(|| {
                    format!("loading automation #{} ({:?})", index, automation.name)
                })?;
        }

        info!(
            characteristics = accessories.characteristic_count(),
            scenes = group.scenes().len(),
            automations = group.automations().len(),
            "Hub built"
        );

        Ok(Self {
            bus,
            accessories,
            group,
        })
    }

    /// Log every bus event at debug level until the bus goes away
    pub fn spawn_bus_logger(&self) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe_all();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => debug!(
                        event_type = %event.event_type,
                        context = %event.context.id,
                        data = %event.data,
                        "Bus event"
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Bus logger fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.group.start().await.context("starting triggers")
    }

    pub async fn stop(&self) -> Result<()> {
        self.group.stop().await.context("stopping triggers")
    }
}
