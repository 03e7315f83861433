//! Scripted BLE transport and helpers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use wearable_link::domain::events::{EventBus, Topic, WearableEvent};
use wearable_link::domain::settings::Settings;
use wearable_link::infrastructure::bluetooth::protocol::{
    self, FlashChunk, FlashLogHeader, FlashRecord, VitalsFrame,
};
use wearable_link::infrastructure::bluetooth::transport::{
    Advertisement, BleTransport, LinkEvent, TransportError,
};
use wearable_link::WearableService;

pub fn service_uuid() -> Uuid {
    Uuid::parse_str(protocol::SERVICE_UUID).unwrap()
}

pub fn vitals_uuid() -> Uuid {
    Uuid::parse_str(protocol::VITALS_CHAR_UUID).unwrap()
}

pub fn wear_uuid() -> Uuid {
    Uuid::parse_str(protocol::WEAR_CHAR_UUID).unwrap()
}

pub fn flash_control_uuid() -> Uuid {
    Uuid::parse_str(protocol::FLASH_CONTROL_CHAR_UUID).unwrap()
}

pub fn flash_data_uuid() -> Uuid {
    Uuid::parse_str(protocol::FLASH_DATA_CHAR_UUID).unwrap()
}

/// One scripted response to a characteristic read
#[derive(Debug, Clone)]
pub enum ReadStep {
    Value(Vec<u8>),
    Fail(TransportError),
    /// Answer after a pause
    Delayed(Duration, Vec<u8>),
    /// Report link loss for the connected device, then never answer
    DropLink,
}

#[derive(Default)]
pub struct MockState {
    pub authorized: bool,
    pub adverts: Vec<Advertisement>,
    /// Consumed front to back; an empty queue means success
    pub connect_results: VecDeque<Result<(), TransportError>>,
    pub connect_delay: Option<Duration>,
    pub subscribe_delay: Option<Duration>,
    pub connect_calls: usize,
    pub disconnect_calls: usize,
    pub connected: Option<String>,
    /// Characteristics that accept `subscribe`
    pub notifiable: HashSet<Uuid>,
    pub notify_senders: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
    pub reads: HashMap<Uuid, VecDeque<ReadStep>>,
    pub read_calls: HashMap<Uuid, usize>,
    pub writes: Vec<(Uuid, Vec<u8>)>,
    scan_tx: Option<mpsc::UnboundedSender<Advertisement>>,
}

pub struct MockTransport {
    pub state: Mutex<MockState>,
    link_tx: broadcast::Sender<LinkEvent>,
}

impl MockTransport {
    /// Authorized transport advertising nothing, with vitals and wear
    /// notifications available
    pub fn new() -> Arc<Self> {
        let (link_tx, _) = broadcast::channel(16);
        let state = MockState {
            authorized: true,
            notifiable: [vitals_uuid(), wear_uuid()].into_iter().collect(),
            ..Default::default()
        };
        Arc::new(Self {
            state: Mutex::new(state),
            link_tx,
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_advert(&self, id: &str, name: Option<&str>, rssi: i16) {
        self.with(|s| s.adverts.push(advert(id, name, rssi)));
    }

    /// Push a value on an active notification subscription
    pub fn notify(&self, characteristic: Uuid, bytes: &[u8]) -> bool {
        self.with(|s| {
            s.notify_senders
                .get(&characteristic)
                .map(|tx| tx.send(bytes.to_vec()).is_ok())
                .unwrap_or(false)
        })
    }

    pub fn push_read(&self, characteristic: Uuid, step: ReadStep) {
        self.with(|s| s.reads.entry(characteristic).or_default().push_back(step));
    }

    pub fn reads_of(&self, characteristic: Uuid) -> usize {
        self.with(|s| s.read_calls.get(&characteristic).copied().unwrap_or(0))
    }

    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.with(|s| {
            s.writes
                .iter()
                .filter(|(uuid, _)| *uuid == characteristic)
                .map(|(_, data)| data.clone())
                .collect()
        })
    }

    /// Simulate the hardware reporting link loss
    pub fn drop_link(&self, device_id: &str) {
        self.with(|s| {
            s.connected = None;
            s.notify_senders.clear();
        });
        let _ = self.link_tx.send(LinkEvent::Disconnected {
            device_id: device_id.to_string(),
        });
    }

    /// Script a complete flash log of `records` split into chunks
    pub fn script_flash_log(&self, records: &[FlashRecord], per_chunk: usize) {
        let chunks: Vec<&[FlashRecord]> = records.chunks(per_chunk.max(1)).collect();
        let header = FlashLogHeader {
            record_count: records.len() as u16,
            chunk_count: chunks.len() as u16,
        };
        self.push_read(flash_data_uuid(), ReadStep::Value(header.to_bytes().to_vec()));
        for (index, chunk) in chunks.iter().enumerate() {
            self.push_read(
                flash_data_uuid(),
                ReadStep::Value(FlashChunk::encode(index as u16, chunk)),
            );
        }
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn is_authorized(&self) -> bool {
        self.with(|s| s.authorized)
    }

    async fn start_scan(
        &self,
        _service: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with(|s| {
            for advert in &s.adverts {
                let _ = tx.send(advert.clone());
            }
            s.scan_tx = Some(tx);
        });
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.with(|s| s.scan_tx = None);
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<(), TransportError> {
        let delay = self.with(|s| {
            s.connect_calls += 1;
            s.connect_delay
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            let result = s.connect_results.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                s.connected = Some(device_id.to_string());
            }
            result
        })
    }

    async fn disconnect(&self, _device_id: &str) -> Result<(), TransportError> {
        self.with(|s| {
            s.disconnect_calls += 1;
            s.connected = None;
            s.notify_senders.clear();
        });
        Ok(())
    }

    async fn read(&self, device_id: &str, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let step = self.with(|s| {
            *s.read_calls.entry(characteristic).or_default() += 1;
            if s.connected.as_deref() != Some(device_id) {
                return Err(TransportError::NotConnected(device_id.to_string()));
            }
            s.reads
                .get_mut(&characteristic)
                .and_then(|queue| queue.pop_front())
                .ok_or_else(|| TransportError::Backend("nothing scripted".into()))
        })?;

        match step {
            ReadStep::Value(bytes) => Ok(bytes),
            ReadStep::Fail(e) => Err(e),
            ReadStep::Delayed(pause, bytes) => {
                tokio::time::sleep(pause).await;
                Ok(bytes)
            }
            ReadStep::DropLink => {
                self.drop_link(device_id);
                std::future::pending().await
            }
        }
    }

    async fn write(
        &self,
        device_id: &str,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.with(|s| {
            if s.connected.as_deref() != Some(device_id) {
                return Err(TransportError::NotConnected(device_id.to_string()));
            }
            s.writes.push((characteristic, data.to_vec()));
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        if let Some(delay) = self.with(|s| s.subscribe_delay) {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            if s.connected.as_deref() != Some(device_id) {
                return Err(TransportError::NotConnected(device_id.to_string()));
            }
            if !s.notifiable.contains(&characteristic) {
                return Err(TransportError::Unsupported(format!(
                    "{} does not notify",
                    characteristic
                )));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            s.notify_senders.insert(characteristic, tx);
            Ok(rx)
        })
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}

pub fn advert(id: &str, name: Option<&str>, rssi: i16) -> Advertisement {
    Advertisement {
        device_id: id.to_string(),
        name: name.map(str::to_string),
        rssi: Some(rssi),
        services: vec![service_uuid()],
    }
}

pub fn frame(heart_rate: u8, temperature: i16, fever: bool) -> VitalsFrame {
    VitalsFrame {
        heart_rate,
        spo2: 97,
        temperature,
        battery: 80,
        motion_level: 1,
        fever_flag: fever,
        readiness_score: 70,
    }
}

pub fn vitals_bytes(heart_rate: u8, temperature: i16, fever: bool) -> Vec<u8> {
    protocol::encode_vitals(&frame(heart_rate, temperature, fever)).to_vec()
}

/// `count` flash records, oldest first, five seconds apart
pub fn flash_records(count: u16) -> Vec<FlashRecord> {
    (0..count)
        .map(|sequence| FlashRecord {
            sequence,
            age_secs: u32::from(count - sequence) * 5 + 60,
            frame: frame(60 + (sequence % 40) as u8, 365, false),
        })
        .collect()
}

/// Settings for tests: no file logging, no background supervisors
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.log_settings.file_logging_enabled = false;
    settings.auto_reconnect = false;
    settings.auto_flash_upload = false;
    settings
}

pub fn build_service(transport: &Arc<MockTransport>, settings: &Settings) -> WearableService {
    let transport: Arc<dyn BleTransport> = transport.clone();
    WearableService::new(transport, settings).unwrap()
}

pub type EventLog = Arc<Mutex<Vec<WearableEvent>>>;

/// Record every event emitted on `bus`
pub fn record_events(bus: &EventBus) -> EventLog {
    let log: EventLog = Arc::default();
    let sink = log.clone();
    bus.subscribe_all(move |event| sink.lock().unwrap().push(event.clone()));
    log
}

pub fn topics(log: &EventLog) -> Vec<Topic> {
    log.lock().unwrap().iter().map(WearableEvent::topic).collect()
}

pub fn count(log: &EventLog, topic: Topic) -> usize {
    topics(log).into_iter().filter(|t| *t == topic).count()
}

pub fn progress_values(log: &EventLog) -> Vec<u8> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            WearableEvent::FlashUploadProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect()
}

/// Let spawned tasks run until `condition` holds (virtual time in paused tests)
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Scan, then connect to `id`
pub async fn scan_and_connect(service: &WearableService, id: &str) {
    assert!(service.scan(Default::default()).await);
    assert!(service.connect(id).await);
}
