//! Core types for the hub
//!
//! This crate provides the fundamental types shared by the automation engine
//! and its collaborators: causal [`Context`], bus [`Event`]s, and the
//! accessory model through which automations read and write characteristics.

mod accessory;
mod context;
mod event;
mod memory;

pub use accessory::{
    AccessoryInfo, AccessoryModel, Characteristic, CharacteristicError, CharacteristicPath,
    CharacteristicResult, ServiceInfo,
};
pub use context::Context;
pub use event::{Event, EventData, EventOrigin, EventType};
pub use memory::{MemoryAccessoryModel, MemoryCharacteristic};

/// Event type used to match every event on the bus
pub const MATCH_ALL: &str = "*";
