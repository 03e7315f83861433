//! Telemetry Ingestion
//!
//! Streams live vitals from the connected wearable. Notifications are used
//! when the device supports them; otherwise the vitals characteristic is
//! polled. Both sources feed [`TelemetryIngestion::ingest_frame`].

use crate::domain::buffer::{ReadingBuffer, SharedReadings};
use crate::domain::events::{EventBus, WearableEvent};
use crate::domain::models::{FeverKind, VitalsReading};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{self, VitalsFrame};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Serializes device reads between the poll source and the flash-log uploader
pub type IoLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub vitals_char: Uuid,
    pub wear_char: Uuid,
    pub poll_interval: Duration,
    /// Skip the notification probe
    pub force_polling: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            vitals_char: Uuid::parse_str(protocol::VITALS_CHAR_UUID).unwrap_or_default(),
            wear_char: Uuid::parse_str(protocol::WEAR_CHAR_UUID).unwrap_or_default(),
            poll_interval: Duration::from_millis(5000),
            force_polling: false,
        }
    }
}

impl TelemetryConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            vitals_char: protocol::parse_uuid(&settings.ble_vitals_char_uuid)?,
            wear_char: protocol::parse_uuid(&settings.ble_wear_char_uuid)?,
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            force_polling: settings.force_polling,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Notification,
    Polling,
}

/// Where raw vitals records come from during a session
#[async_trait]
pub trait ReadingSource: Send {
    fn kind(&self) -> SourceKind;

    /// Next raw record; `None` once the source is exhausted
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

/// Values pushed by the device
pub struct NotificationSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl NotificationSource {
    pub fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl ReadingSource for NotificationSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Notification
    }

    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Fixed-interval reads of the vitals characteristic
pub struct PollingSource {
    transport: Arc<dyn BleTransport>,
    io_lock: IoLock,
    device_id: String,
    characteristic: Uuid,
    interval: Interval,
}

impl PollingSource {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        io_lock: IoLock,
        device_id: String,
        characteristic: Uuid,
        period: Duration,
    ) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            transport,
            io_lock,
            device_id,
            characteristic,
            interval,
        }
    }
}

#[async_trait]
impl ReadingSource for PollingSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Polling
    }

    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.interval.tick().await;
        let _io = self.io_lock.lock().await;
        Some(
            self.transport
                .read(&self.device_id, self.characteristic)
                .await,
        )
    }
}

#[derive(Default)]
struct SessionState {
    device_id: Option<String>,
    source: Option<SourceKind>,
    worn: bool,
    tasks: Vec<JoinHandle<()>>,
    /// Bumped by every `stop`; a `start` that sees it move was cancelled
    epoch: u64,
}

pub struct TelemetryIngestion {
    transport: Arc<dyn BleTransport>,
    bus: Arc<EventBus>,
    readings: SharedReadings,
    io_lock: IoLock,
    config: TelemetryConfig,
    session: Mutex<SessionState>,
}

impl TelemetryIngestion {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        bus: Arc<EventBus>,
        readings: SharedReadings,
        io_lock: IoLock,
        config: TelemetryConfig,
    ) -> Self {
        Self {
            transport,
            bus,
            readings,
            io_lock,
            config,
            session: Mutex::new(SessionState {
                worn: true,
                ..Default::default()
            }),
        }
    }

    /// Begin streaming from `device_id`, replacing any previous session.
    ///
    /// Probes for notification support and falls back to polling. Returns
    /// `None` when `stop` ran while the probe was in flight; nothing is left
    /// running in that case.
    pub async fn start(self: &Arc<Self>, device_id: &str) -> Option<SourceKind> {
        self.stop();
        let epoch = self.lock().epoch;

        let source: Box<dyn ReadingSource> = match self.probe_notifications(device_id).await {
            Some(rx) => Box::new(NotificationSource::new(rx)),
            None => Box::new(PollingSource::new(
                self.transport.clone(),
                self.io_lock.clone(),
                device_id.to_string(),
                self.config.vitals_char,
                self.config.poll_interval,
            )),
        };
        let kind = source.kind();
        let wear_rx = self.probe_wear_state(device_id).await;

        let mut session = self.lock();
        if session.epoch != epoch {
            debug!("Telemetry start for {} cancelled", device_id);
            return None;
        }
        let mut tasks = vec![self.spawn_reader(source)];
        if let Some(rx) = wear_rx {
            tasks.push(self.spawn_wear_watcher(rx));
        }
        info!("Telemetry started for {} using {:?}", device_id, kind);
        session.device_id = Some(device_id.to_string());
        session.source = Some(kind);
        session.worn = true;
        session.tasks = tasks;
        Some(kind)
    }

    /// Cancel the poll timer and notification tasks. Idempotent.
    pub fn stop(&self) {
        let mut session = self.lock();
        session.epoch += 1;
        if session.device_id.is_none() && session.tasks.is_empty() {
            return;
        }
        for task in session.tasks.drain(..) {
            task.abort();
        }
        if let Some(device_id) = session.device_id.take() {
            info!("Telemetry stopped for {}", device_id);
        }
        session.source = None;
    }

    pub fn is_running(&self) -> bool {
        self.lock().source.is_some()
    }

    /// Reading source of the current session
    pub fn source_kind(&self) -> Option<SourceKind> {
        self.lock().source
    }

    pub fn is_worn(&self) -> bool {
        self.lock().worn
    }

    /// Decode one raw record, store it and publish it.
    ///
    /// Malformed records are dropped here and never reach the buffer or bus.
    pub fn ingest_frame(&self, bytes: &[u8]) -> Option<VitalsReading> {
        let frame = match protocol::decode_vitals(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping vitals record: {}", e);
                return None;
            }
        };

        let reading = self.store(frame);

        self.bus.emit(WearableEvent::VitalUpdate(reading));
        if reading.fever_flag {
            info!("Fever flag set: {:.1} °C", reading.temperature_celsius());
            self.bus.emit(WearableEvent::FeverAlert {
                temperature: reading.temperature_celsius(),
                kind: FeverKind::High,
            });
        }
        Some(reading)
    }

    /// Apply a worn/removed signal, publishing only changes
    pub fn set_worn(&self, worn: bool) {
        let changed = {
            let mut session = self.lock();
            std::mem::replace(&mut session.worn, worn) != worn
        };
        if changed {
            info!("Wear state changed: worn={}", worn);
            self.bus.emit(WearableEvent::WearState { worn });
        }
    }

    /// Most recent reading
    pub fn last(&self) -> Option<VitalsReading> {
        self.buffer().last()
    }

    /// Readings from the last `days` days
    pub fn window(&self, days: u32) -> Vec<VitalsReading> {
        self.buffer().window(days, Utc::now().timestamp_millis())
    }

    async fn probe_notifications(&self, device_id: &str) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        if self.config.force_polling {
            info!("Polling forced by configuration");
            return None;
        }
        match self
            .transport
            .subscribe(device_id, self.config.vitals_char)
            .await
        {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(
                    "Could not enable vitals notifications: {}. Falling back to polling every {:?}",
                    e, self.config.poll_interval
                );
                None
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut source: Box<dyn ReadingSource>) -> JoinHandle<()> {
        let ingestion = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next_frame().await {
                match frame {
                    Ok(bytes) => {
                        ingestion.ingest_frame(&bytes);
                    }
                    Err(e) => warn!("Vitals read failed: {}", e),
                }
            }
            debug!("Vitals source ended");
        })
    }

    async fn probe_wear_state(&self, device_id: &str) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        match self
            .transport
            .subscribe(device_id, self.config.wear_char)
            .await
        {
            Ok(rx) => Some(rx),
            Err(e) => {
                debug!("Wear state not available: {}", e);
                None
            }
        }
    }

    fn spawn_wear_watcher(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()> {
        let ingestion = self.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                match protocol::decode_wear_state(&bytes) {
                    Some(worn) => ingestion.set_worn(worn),
                    None => warn!("Empty wear-state notification"),
                }
            }
        })
    }

    /// Stamp with ingestion time, kept strictly increasing so delivery order
    /// survives records that arrive within the same millisecond.
    fn store(&self, frame: VitalsFrame) -> VitalsReading {
        let mut buffer = self.buffer();
        let now = Utc::now().timestamp_millis();
        let timestamp = buffer
            .last()
            .map_or(now, |last| now.max(last.timestamp + 1));
        let reading = frame.into_reading(timestamp);
        buffer.append(reading);
        reading
    }

    fn buffer(&self) -> MutexGuard<'_, ReadingBuffer> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
