//! # roomsense-core
//!
//! Core business logic for the roomsense Bluetooth room presence system.
//!
//! This crate provides:
//! - Bluetooth adapter lifecycle management with deadlock and scanner watchdogs
//! - Low-energy connect/query plumbing with bounded retries and deadlines
//! - Bluetooth Classic RSSI and device-info inquiries via `hcitool`
//! - A reactive entity model with leaf diffing, behavior chains, and a typed
//!   event bus
//! - Configuration loading, saving, and validation
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`adapter`] - Adapter state machine, exclusive inquiry locks, and watchdogs
//! - [`ble`] - Low-energy driver/peripheral ports and the connect/query engine
//! - [`classic`] - Bluetooth Classic inquiries through shelled-out `hcitool`
//! - [`entity`] - Entity registry, value diffing, behaviors, and events
//! - [`config`] - Application configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - [`util`] - Deadline and retry helpers shared across the engines

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod adapter;
pub mod ble;
pub mod classic;
pub mod config;
pub mod entity;
pub mod error;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

// Re-export primary types for convenience
pub use adapter::{AdapterManager, AdapterState};
pub use ble::{BleEngine, Discovery, Peripheral, RadioDriver, RadioEvent};
pub use classic::{ClassicEngine, CommandRunner, DeviceInfo, ShellCommandRunner};
pub use config::{is_valid_mac_address, RoomsenseConfig};
pub use entity::{
    EntityDescriptor, EntityDiff, EntityEvent, EntityHandle, EntityRegistry, LeadershipOracle,
};
pub use error::{Result, RoomsenseError};
