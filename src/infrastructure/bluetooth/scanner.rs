//! BLE Scanner Module
//!
//! Device Registry: discovers wearables advertising the service UUID,
//! deduplicates them by id and remembers devices that may be connected to.

use crate::domain::events::{EventBus, WearableEvent};
use crate::domain::models::DeviceCandidate;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{Advertisement, BleTransport};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for scanning
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Used when a scan does not specify its own timeout
    pub default_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            service_uuid: Uuid::parse_str(protocol::SERVICE_UUID).unwrap_or_default(),
            default_timeout: Duration::from_secs(10),
        }
    }
}

impl ScanConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            default_timeout: Duration::from_millis(settings.scan_timeout_ms),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub timeout: Option<Duration>,
    /// Re-announce candidates on every repeated advertisement
    pub allow_duplicates: bool,
}

#[derive(Default)]
struct RegistryState {
    scanning: bool,
    candidates: Vec<DeviceCandidate>,
    /// id -> display name of every device seen or remembered
    known: HashMap<String, String>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Device Registry
pub struct DeviceRegistry {
    transport: Arc<dyn BleTransport>,
    bus: Arc<EventBus>,
    config: ScanConfig,
    state: Mutex<RegistryState>,
}

impl DeviceRegistry {
    pub fn new(transport: Arc<dyn BleTransport>, bus: Arc<EventBus>, config: ScanConfig) -> Self {
        Self {
            transport,
            bus,
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Run one scan to completion (timeout or [`stop_scan`](Self::stop_scan)).
    ///
    /// Returns false without queueing anything if a scan is already running.
    pub async fn scan(&self, options: ScanOptions) -> bool {
        let cancel_rx = {
            let mut state = self.lock();
            if state.scanning {
                drop(state);
                warn!("Scan requested while another scan is running");
                self.emit_error("A scan is already in progress");
                return false;
            }
            let (tx, rx) = oneshot::channel();
            state.scanning = true;
            state.candidates.clear();
            state.cancel = Some(tx);
            rx
        };

        if !self.transport.is_authorized().await {
            self.finish_early();
            self.emit_error("Bluetooth permission not granted");
            return false;
        }

        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        info!(
            "Starting BLE scan for service UUID: {} ({:?})",
            self.config.service_uuid, timeout
        );
        self.bus.emit(WearableEvent::ScanStarted);

        let mut adverts = match self.transport.start_scan(self.config.service_uuid).await {
            Ok(rx) => rx,
            Err(e) => {
                self.finish_early();
                self.emit_error(&format!("Could not start scan: {}", e));
                return false;
            }
        };

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        tokio::pin!(cancel_rx);

        loop {
            tokio::select! {
                advert = adverts.recv() => match advert {
                    Some(advert) => self.handle_advertisement(advert, options.allow_duplicates),
                    None => {
                        debug!("Advertisement stream closed");
                        break;
                    }
                },
                _ = &mut deadline => {
                    debug!("Scan timed out");
                    break;
                }
                _ = &mut cancel_rx => {
                    debug!("Scan stopped");
                    break;
                }
            }
        }

        info!("Stopping BLE scan...");
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan cleanly: {}", e);
        }

        let device_count = {
            let mut state = self.lock();
            state.scanning = false;
            state.cancel = None;
            state.candidates.len()
        };
        info!("Scan complete: {} device(s) found", device_count);
        self.bus.emit(WearableEvent::ScanComplete { device_count });
        true
    }

    /// End a running scan early. No-op when idle.
    pub fn stop_scan(&self) {
        if let Some(cancel) = self.lock().cancel.take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    /// Snapshot of the current candidate list in discovery order
    pub fn discovered(&self) -> Vec<DeviceCandidate> {
        self.lock().candidates.clone()
    }

    pub fn candidate(&self, id: &str) -> Option<DeviceCandidate> {
        self.lock().candidates.iter().find(|c| c.id == id).cloned()
    }

    /// Mark a device as connectable without a fresh scan
    pub fn remember(&self, id: &str, name: &str) {
        self.lock().known.insert(id.to_string(), name.to_string());
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.lock().known.contains_key(id)
    }

    /// Best display name for a device
    pub fn name_of(&self, id: &str) -> Option<String> {
        let state = self.lock();
        state
            .candidates
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.clone())
            .or_else(|| state.known.get(id).cloned())
    }

    /// Update the local name of a device
    pub fn rename(&self, id: &str, name: &str) {
        let mut state = self.lock();
        if let Some(candidate) = state.candidates.iter_mut().find(|c| c.id == id) {
            candidate.name = name.to_string();
        }
        state.known.insert(id.to_string(), name.to_string());
    }

    fn handle_advertisement(&self, advert: Advertisement, allow_duplicates: bool) {
        if !advert.services.contains(&self.config.service_uuid) {
            return;
        }

        let name = advert
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        let rssi = advert.rssi.unwrap_or(i16::MIN);
        let now = Utc::now();

        let announce = {
            let mut state = self.lock();
            state.known.insert(advert.device_id.clone(), name.clone());
            match state
                .candidates
                .iter_mut()
                .find(|c| c.id == advert.device_id)
            {
                Some(existing) => {
                    existing.signal_strength = rssi;
                    existing.last_seen = now;
                    existing.name = name;
                    allow_duplicates.then(|| state.candidates.clone())
                }
                None => {
                    debug!("Discovered {} ({}) at {} dBm", name, advert.device_id, rssi);
                    state.candidates.push(DeviceCandidate {
                        id: advert.device_id,
                        name,
                        signal_strength: rssi,
                        last_seen: now,
                    });
                    Some(state.candidates.clone())
                }
            }
        };

        if let Some(devices) = announce {
            self.bus.emit(WearableEvent::DevicesDiscovered { devices });
        }
    }

    fn finish_early(&self) {
        let mut state = self.lock();
        state.scanning = false;
        state.cancel = None;
    }

    fn emit_error(&self, message: &str) {
        self.bus.emit(WearableEvent::ScanError {
            error: message.to_string(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
