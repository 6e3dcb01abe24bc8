//! Picore-W WiFi connection manager.
//!
//! Keeps a device online and falls back to a captive-portal hotspot for
//! provisioning when it cannot connect. Everything except the ESP-IDF radio
//! and NVS backends builds and tests on the host.
//!
//! # Modules
//!
//! - [`manager`] - lifecycle state machine and public API
//! - [`portal`] - captive DNS, HTTP server and provisioning routes
//! - [`store`] - versioned JSON config document
//! - [`network`] - radio traits with ESP32 and host implementations
//! - [`config`], [`state`], [`events`] - supporting types

pub mod config;
pub mod events;
pub mod manager;
pub mod network;
pub mod portal;
pub mod state;
pub mod store;
#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use config::{ConfigError, Credentials, CredentialsError, ManagerConfig};
pub use events::{Event, EventBus, EventKind, SubscriptionId};
pub use manager::{ManagerError, WifiManager, WifiManagerBuilder};
pub use state::{ApSession, ConnectionState};
pub use store::{ConfigStore, StoreError, StoredConfig, CONFIG_VERSION};
