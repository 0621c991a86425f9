//! Shared fixtures for unit tests

use async_trait::async_trait;
use hub_core::MemoryAccessoryModel;
use hub_event_bus::EventBus;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::AutomationConfig;
use crate::error::AutomationResult;
use crate::events::TriggerEvent;
use crate::group::AutomationGroup;
use crate::registry::Registry;
use crate::runner::Runner;
use crate::trigger::{TriggerDriver, TriggerHandle};

pub(crate) fn test_group() -> Arc<AutomationGroup> {
    test_group_with(Arc::new(MemoryAccessoryModel::new()))
}

pub(crate) fn test_group_with(accessories: Arc<MemoryAccessoryModel>) -> Arc<AutomationGroup> {
    AutomationGroup::new(
        "test",
        accessories,
        Arc::new(EventBus::new()),
        Arc::new(Registry::new()),
    )
}

/// A runner over an empty automation, for building a run context
pub(crate) fn test_runner(group: &Arc<AutomationGroup>) -> Arc<Runner> {
    let automation = group
        .insert_automation(&AutomationConfig::default())
        .unwrap();
    automation.runner(TriggerEvent::manual(json!({})))
}

/// Trigger driver that counts start and stop calls
#[derive(Clone, Default)]
pub(crate) struct CountingDriver {
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
}

#[async_trait]
impl TriggerDriver for CountingDriver {
    async fn on_start(&self, _handle: TriggerHandle) -> AutomationResult<()> {
        tokio::task::yield_now().await;
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_stop(&self) -> AutomationResult<()> {
        tokio::task::yield_now().await;
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
