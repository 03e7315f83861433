//! Bluetooth Module
//!
//! Provides BLE connectivity with the wearable vitals band.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    WearableService                       │
//! │  (Main coordinator - wires components from Settings)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!    ┌──────────────┬───┴──────────┬───────────────┐
//!    ▼              ▼              ▼               ▼
//! ┌──────────┐ ┌────────────┐ ┌───────────┐ ┌────────────┐
//! │ Registry │ │ Connection │ │ Telemetry │ │ Flash log  │
//! │ (scan)   │ │ (lifecycle)│ │ (vitals)  │ │ (upload)   │
//! └────┬─────┘ └─────┬──────┘ └─────┬─────┘ └─────┬──────┘
//!      └─────────────┴──────┬───────┴─────────────┘
//!                           ▼
//!                ┌─────────────────────┐
//!                │  dyn BleTransport   │
//!                └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Hardware capability trait the components drive
//! - [`protocol`] - UUIDs, vitals record decoding and flash-log framing
//! - [`scanner`] - Device discovery and the candidate registry
//! - [`connection`] - Connection state machine and link-loss handling
//! - [`telemetry`] - Live vitals ingestion (notifications or polling)
//! - [`flash_log`] - Bulk retrieval of readings buffered on the device
//! - [`service`] - Main service coordinator

#[cfg(feature = "hardware")]
pub mod btleplug_transport;
pub mod connection;
pub mod flash_log;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod telemetry;
pub mod transport;

// Re-export main service for convenience
pub use service::WearableService;
