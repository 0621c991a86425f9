//! In-memory accessory model
//!
//! Holds accessory, service and characteristic state in process. The server
//! seeds it from configuration; tests use it to observe characteristic writes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::accessory::{
    AccessoryInfo, AccessoryModel, Characteristic, CharacteristicError, CharacteristicPath,
    CharacteristicResult, ServiceInfo,
};

/// A characteristic whose value lives in memory
#[derive(Debug)]
pub struct MemoryCharacteristic {
    path: CharacteristicPath,
    value: RwLock<serde_json::Value>,
    writable: bool,
    writes: AtomicU64,
}

impl MemoryCharacteristic {
    pub fn new(path: CharacteristicPath, value: serde_json::Value, writable: bool) -> Self {
        Self {
            path,
            value: RwLock::new(value),
            writable,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Characteristic for MemoryCharacteristic {
    fn path(&self) -> &CharacteristicPath {
        &self.path
    }

    fn value(&self) -> serde_json::Value {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn set_value(&self, value: serde_json::Value) -> CharacteristicResult<()> {
        if !self.writable {
            return Err(CharacteristicError::ReadOnly(self.path.clone()));
        }

        debug!(characteristic = %self.path, value = %value, "Setting characteristic value");
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Accessory model backed by concurrent maps
#[derive(Default)]
pub struct MemoryAccessoryModel {
    accessories: DashMap<String, AccessoryInfo>,
    services: DashMap<(String, String), ServiceInfo>,
    characteristics: DashMap<CharacteristicPath, Arc<MemoryCharacteristic>>,
}

impl MemoryAccessoryModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_accessory(&self, info: AccessoryInfo) {
        self.accessories.insert(info.uuid.clone(), info);
    }

    pub fn add_service(&self, accessory: &str, info: ServiceInfo) {
        self.services
            .insert((accessory.to_string(), info.uuid.clone()), info);
    }

    /// Add a characteristic, creating bare accessory/service entries if missing
    pub fn add_characteristic(
        &self,
        path: CharacteristicPath,
        value: serde_json::Value,
        writable: bool,
    ) -> Arc<MemoryCharacteristic> {
        self.accessories
            .entry(path.accessory.clone())
            .or_insert_with(|| AccessoryInfo {
                uuid: path.accessory.clone(),
                name: None,
            });
        self.services
            .entry((path.accessory.clone(), path.service.clone()))
            .or_insert_with(|| ServiceInfo {
                uuid: path.service.clone(),
                service_type: None,
                name: None,
            });

        let characteristic = Arc::new(MemoryCharacteristic::new(path.clone(), value, writable));
        self.characteristics.insert(path, characteristic.clone());
        characteristic
    }

    pub fn characteristic_count(&self) -> usize {
        self.characteristics.len()
    }
}

impl AccessoryModel for MemoryAccessoryModel {
    fn accessory(&self, uuid: &str) -> Option<AccessoryInfo> {
        self.accessories.get(uuid).map(|a| a.value().clone())
    }

    fn service(&self, accessory: &str, service: &str) -> Option<ServiceInfo> {
        self.services
            .get(&(accessory.to_string(), service.to_string()))
            .map(|s| s.value().clone())
    }

    fn characteristic(&self, path: &CharacteristicPath) -> Option<Arc<dyn Characteristic>> {
        self.characteristics
            .get(path)
            .map(|c| c.value().clone() as Arc<dyn Characteristic>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_read_value() {
        let model = MemoryAccessoryModel::new();
        let path = CharacteristicPath::new("lamp", "lightbulb", "on");
        let memory = model.add_characteristic(path.clone(), json!(false), true);

        let characteristic = model.characteristic(&path).unwrap();
        characteristic.set_value(json!(true)).await.unwrap();

        assert_eq!(characteristic.value(), json!(true));
        assert_eq!(memory.write_count(), 1);
    }

    #[tokio::test]
    async fn test_read_only_rejects_write() {
        let model = MemoryAccessoryModel::new();
        let path = CharacteristicPath::new("sensor", "temperature", "current");
        model.add_characteristic(path.clone(), json!(21.5), false);

        let result = model.characteristic(&path).unwrap().set_value(json!(0)).await;
        assert!(matches!(result, Err(CharacteristicError::ReadOnly(_))));
    }

    #[test]
    fn test_implicit_accessory_and_service() {
        let model = MemoryAccessoryModel::new();
        model.add_characteristic(CharacteristicPath::new("a", "s", "c"), json!(1), true);

        assert!(model.accessory("a").is_some());
        assert!(model.service("a", "s").is_some());
        assert!(model.service("a", "other").is_none());
        assert!(model.characteristic(&CharacteristicPath::new("a", "s", "x")).is_none());
    }
}
