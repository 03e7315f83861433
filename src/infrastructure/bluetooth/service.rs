//! Wearable Service Module
//!
//! Main service that wires scanning, connection, telemetry and flash-log
//! upload together from [`Settings`], and runs the background supervisors.

use crate::domain::buffer::{ReadingBuffer, SharedReadings};
use crate::domain::events::{EventBus, Topic};
use crate::domain::export::{self, ExportError};
use crate::domain::models::{ConnectionState, VitalsReading};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionConfig, ConnectionManager},
    flash_log::{FlashLogConfig, FlashLogUploader},
    scanner::{DeviceRegistry, ScanConfig, ScanOptions},
    telemetry::{IoLock, TelemetryConfig, TelemetryIngestion},
    transport::BleTransport,
};
use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exponential backoff before reconnection attempt `attempt` (0-based),
/// doubling from `base` and capped at `max`.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Main service coordinating all wearable BLE operations
pub struct WearableService {
    bus: Arc<EventBus>,
    readings: SharedReadings,
    registry: Arc<DeviceRegistry>,
    telemetry: Arc<TelemetryIngestion>,
    connection: Arc<ConnectionManager>,
    uploader: Arc<FlashLogUploader>,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
    auto_reconnect: bool,
    auto_flash_upload: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WearableService {
    /// Build every component from settings and remember the known devices
    pub fn new(transport: Arc<dyn BleTransport>, settings: &Settings) -> Result<Self> {
        let bus = EventBus::new();
        let readings = ReadingBuffer::shared(settings.max_readings);
        let io_lock: IoLock = Arc::new(tokio::sync::Mutex::new(()));

        let registry = Arc::new(DeviceRegistry::new(
            transport.clone(),
            bus.clone(),
            ScanConfig::from_settings(settings)?,
        ));
        for device in &settings.known_devices {
            registry.remember(&device.id, &device.name);
        }

        let telemetry = Arc::new(TelemetryIngestion::new(
            transport.clone(),
            bus.clone(),
            readings.clone(),
            io_lock.clone(),
            TelemetryConfig::from_settings(settings)?,
        ));

        let connection = Arc::new(ConnectionManager::new(
            transport.clone(),
            bus.clone(),
            registry.clone(),
            telemetry.clone(),
            ConnectionConfig::from_settings(settings),
        ));

        let uploader = Arc::new(FlashLogUploader::new(
            transport,
            bus.clone(),
            readings.clone(),
            io_lock,
            connection.clone(),
            FlashLogConfig::from_settings(settings)?,
        ));

        info!(
            "Wearable service ready ({} known device(s))",
            settings.known_devices.len()
        );

        Ok(Self {
            bus,
            readings,
            registry,
            telemetry,
            connection,
            uploader,
            reconnect_base_delay: Duration::from_millis(settings.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
            auto_reconnect: settings.auto_reconnect,
            auto_flash_upload: settings.auto_flash_upload,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn readings(&self) -> &SharedReadings {
        &self.readings
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<TelemetryIngestion> {
        &self.telemetry
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn uploader(&self) -> &Arc<FlashLogUploader> {
        &self.uploader
    }

    /// Start scanning for devices
    pub async fn scan(&self, options: ScanOptions) -> bool {
        self.registry.scan(options).await
    }

    /// Connect to a device by id
    pub async fn connect(&self, device_id: &str) -> bool {
        self.connection.connect(device_id).await
    }

    /// Disconnect from the current device
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Spawn whichever supervisors the settings enable
    pub fn start_background_tasks(&self) {
        if self.auto_reconnect {
            self.spawn_reconnect_supervisor();
        }
        if self.auto_flash_upload {
            self.spawn_auto_flash_upload();
        }
    }

    /// Retry the remembered device with backoff after every link loss, until
    /// it reconnects or the attempt limit is reached.
    pub fn spawn_reconnect_supervisor(&self) {
        let mut disconnects = self.bus.subscribe_channel(Some(Topic::Disconnected));
        let connection = self.connection.clone();
        let base = self.reconnect_base_delay;
        let max = self.reconnect_max_delay;

        let task = tokio::spawn(async move {
            while disconnects.recv().await.is_some() {
                while connection.state() == ConnectionState::Reconnecting {
                    let delay = reconnect_delay(connection.reconnection_attempts(), base, max);
                    debug!("Reconnecting in {:?}", delay);
                    tokio::time::sleep(delay).await;

                    if connection.state() != ConnectionState::Reconnecting {
                        break;
                    }
                    if connection.reconnect().await {
                        info!("Reconnection succeeded");
                    }
                }
            }
        });
        self.track(task);
    }

    /// Start an upload whenever the connection reports buffered data may exist
    pub fn spawn_auto_flash_upload(&self) {
        let mut hints = self.bus.subscribe_channel(Some(Topic::FlashDataAvailable));
        let uploader = self.uploader.clone();

        let task = tokio::spawn(async move {
            while hints.recv().await.is_some() {
                if !uploader.start().await {
                    warn!("Automatic flash-log upload did not complete");
                }
            }
        });
        self.track(task);
    }

    pub fn export_json(&self) -> Result<String, ExportError> {
        export::to_json(&self.snapshot())
    }

    pub fn export_csv(&self) -> String {
        export::to_csv(&self.snapshot())
    }

    /// Stop the supervisors and drop the link
    pub async fn shutdown(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.connection.disconnect().await;
        info!("Wearable service shut down");
    }

    fn snapshot(&self) -> Vec<VitalsReading> {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    fn track(&self, task: JoinHandle<()>) {
        self.lock_tasks().push(task);
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_then_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let delays: Vec<u64> = (0..7)
            .map(|n| reconnect_delay(n, base, max).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_reconnect_delay_huge_attempt() {
        let max = Duration::from_secs(30);
        assert_eq!(reconnect_delay(200, Duration::from_secs(1), max), max);
    }
}
