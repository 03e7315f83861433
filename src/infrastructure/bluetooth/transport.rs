//! BLE Transport
//!
//! The hardware capability the connectivity core drives. The real
//! implementation lives behind the `hardware` feature; tests script their own.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// One received advertisement
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub device_id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
}

/// Out-of-band link status reported by the hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected { device_id: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth permission not granted")]
    NotAuthorized,
    #[error("No Bluetooth adapter available: {0}")]
    AdapterUnavailable(String),
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("Device {0} is not connected")]
    NotConnected(String),
    #[error("Operation not supported: {0}")]
    Unsupported(String),
    #[error("Bluetooth error: {0}")]
    Backend(String),
}

/// Scan/connect/read/write/subscribe primitives keyed by device id and
/// characteristic UUID.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Whether radio access is authorized
    async fn is_authorized(&self) -> bool;

    /// Start discovery for devices advertising `service`. The receiver closes
    /// when the scan is stopped.
    async fn start_scan(
        &self,
        service: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, device_id: &str) -> Result<(), TransportError>;

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError>;

    async fn read(&self, device_id: &str, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        device_id: &str,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Enable notifications; each received value is delivered on the channel
    async fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError>;

    /// Link-loss reports for connected devices
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}
