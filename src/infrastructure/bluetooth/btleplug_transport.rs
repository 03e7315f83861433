//! btleplug-backed BLE transport
//!
//! Uses the first adapter the platform reports. Peripherals are keyed by the
//! display form of their `PeripheralId`.

use crate::infrastructure::bluetooth::transport::{
    Advertisement, BleTransport, LinkEvent, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type PeripheralMap = Arc<Mutex<HashMap<String, Peripheral>>>;

pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: PeripheralMap,
    link_tx: broadcast::Sender<LinkEvent>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    link_task: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter and start watching for link loss
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(backend)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(backend)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::AdapterUnavailable("no adapter found".into()))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter: {}", info);
        }

        let (link_tx, _) = broadcast::channel(16);
        let mut events = adapter.events().await.map_err(backend)?;
        let tx = link_tx.clone();
        let link_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let device_id = id.to_string();
                    info!("Device {} disconnected", device_id);
                    let _ = tx.send(LinkEvent::Disconnected { device_id });
                }
            }
        });

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            link_tx,
            scan_task: Mutex::new(None),
            link_task,
        })
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = lock(&self.peripherals).get(device_id) {
            return Ok(peripheral.clone());
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await
            .map_err(backend)?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| TransportError::DeviceNotFound(device_id.to_string()))?;
        lock(&self.peripherals).insert(device_id.to_string(), peripheral.clone());
        Ok(peripheral)
    }

    async fn characteristic(
        &self,
        device_id: &str,
        uuid: Uuid,
    ) -> Result<(Peripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        if !peripheral.is_connected().await.map_err(backend)? {
            return Err(TransportError::NotConnected(device_id.to_string()));
        }
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))?;
        Ok((peripheral, characteristic))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.link_task.abort();
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn is_authorized(&self) -> bool {
        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => true,
            Ok(state) => {
                warn!("Bluetooth adapter not ready: {:?}", state);
                false
            }
            // Not every backend reports adapter state
            Err(e) => {
                debug!("Adapter state unavailable: {}", e);
                true
            }
        }
    }

    async fn start_scan(
        &self,
        service: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>, TransportError> {
        let mut events = self.adapter.events().await.map_err(backend)?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(backend)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                if let Some(advert) = advertisement(&adapter, &peripherals, &id).await {
                    if tx.send(advert).is_err() {
                        break;
                    }
                }
            }
        });

        if let Some(previous) = lock(&self.scan_task).replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
        self.adapter.stop_scan().await.map_err(backend)
    }

    async fn connect(&self, device_id: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.connect().await.map_err(backend)?;
        peripheral.discover_services().await.map_err(backend)?;
        info!(
            "Connected to {} ({} characteristic(s))",
            device_id,
            peripheral.characteristics().len()
        );
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.disconnect().await.map_err(backend)
    }

    async fn read(&self, device_id: &str, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let (peripheral, characteristic) = self.characteristic(device_id, characteristic).await?;
        peripheral.read(&characteristic).await.map_err(backend)
    }

    async fn write(
        &self,
        device_id: &str,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(device_id, characteristic).await?;
        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(backend)
    }

    async fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let (peripheral, characteristic) = self.characteristic(device_id, characteristic).await?;
        if !characteristic
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Err(TransportError::Unsupported(format!(
                "{} does not notify",
                characteristic.uuid
            )));
        }

        let mut notifications = peripheral.notifications().await.map_err(backend)?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(backend)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let uuid = characteristic.uuid;
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid && tx.send(notification.value).is_err() {
                    break;
                }
            }
            debug!("Notification stream for {} ended", uuid);
        });
        Ok(rx)
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}

async fn advertisement(
    adapter: &Adapter,
    peripherals: &PeripheralMap,
    id: &PeripheralId,
) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let PeripheralProperties {
        local_name,
        rssi,
        services,
        ..
    } = peripheral.properties().await.ok()??;

    let device_id = id.to_string();
    lock(peripherals).insert(device_id.clone(), peripheral);
    Some(Advertisement {
        device_id,
        name: local_name,
        rssi,
        services,
    })
}

fn backend(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::PermissionDenied => TransportError::NotAuthorized,
        btleplug::Error::NotSupported(what) => TransportError::Unsupported(what),
        other => TransportError::Backend(other.to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
