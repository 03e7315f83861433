//! Connectivity core for a BLE wearable vitals band: discovery, connection
//! lifecycle, live telemetry, flash-log retrieval and an event bus that UI
//! layers subscribe to.

pub mod domain;
pub mod infrastructure;

pub use domain::events::{EventBus, Topic, WearableEvent};
pub use domain::models::{ConnectionState, DeviceCandidate, VitalsReading};
pub use infrastructure::bluetooth::transport::{BleTransport, TransportError};
pub use infrastructure::bluetooth::WearableService;
