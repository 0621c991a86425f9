//! Accessory model interface
//!
//! The automation engine never talks to the HomeKit bridge directly. It reads
//! and writes characteristics through [`AccessoryModel`], which the bridge (or
//! [`crate::MemoryAccessoryModel`] in tests) implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Characteristic access errors
#[derive(Debug, Clone, Error)]
pub enum CharacteristicError {
    #[error("Characteristic not found: {0}")]
    NotFound(CharacteristicPath),

    #[error("Characteristic is read-only: {0}")]
    ReadOnly(CharacteristicPath),

    #[error("Invalid value for {path}: {reason}")]
    InvalidValue {
        path: CharacteristicPath,
        reason: String,
    },

    #[error("Characteristic write failed: {0}")]
    Failed(String),
}

/// Result type for characteristic operations
pub type CharacteristicResult<T> = Result<T, CharacteristicError>;

/// Address of a characteristic: accessory uuid, service uuid, characteristic uuid
///
/// Serialized as a three element array, which is how automation configs
/// refer to characteristics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[String; 3]", into = "[String; 3]")]
pub struct CharacteristicPath {
    pub accessory: String,
    pub service: String,
    pub characteristic: String,
}

impl CharacteristicPath {
    pub fn new(
        accessory: impl Into<String>,
        service: impl Into<String>,
        characteristic: impl Into<String>,
    ) -> Self {
        Self {
            accessory: accessory.into(),
            service: service.into(),
            characteristic: characteristic.into(),
        }
    }
}

impl From<[String; 3]> for CharacteristicPath {
    fn from([accessory, service, characteristic]: [String; 3]) -> Self {
        Self {
            accessory,
            service,
            characteristic,
        }
    }
}

impl From<CharacteristicPath> for [String; 3] {
    fn from(path: CharacteristicPath) -> Self {
        [path.accessory, path.service, path.characteristic]
    }
}

impl std::fmt::Display for CharacteristicPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.accessory, self.service, self.characteristic)
    }
}

/// Descriptive data about an accessory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessoryInfo {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Descriptive data about a service on an accessory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub uuid: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A single readable (and possibly writable) characteristic
#[async_trait]
pub trait Characteristic: Send + Sync {
    fn path(&self) -> &CharacteristicPath;

    /// Last known value
    fn value(&self) -> serde_json::Value;

    /// Write a new value through to the accessory
    async fn set_value(&self, value: serde_json::Value) -> CharacteristicResult<()>;
}

/// Lookup of accessories, services and characteristics
pub trait AccessoryModel: Send + Sync {
    fn accessory(&self, uuid: &str) -> Option<AccessoryInfo>;

    fn service(&self, accessory: &str, service: &str) -> Option<ServiceInfo>;

    fn characteristic(&self, path: &CharacteristicPath) -> Option<Arc<dyn Characteristic>>;
}
