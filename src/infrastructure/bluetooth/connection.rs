//! BLE Connection Module
//!
//! Connection Manager: owns the single link to one wearable and drives the
//! `Disconnected -> Connecting -> Connected -> Reconnecting` state machine.

use crate::domain::events::{EventBus, WearableEvent};
use crate::domain::models::ConnectionState;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::scanner::DeviceRegistry;
use crate::infrastructure::bluetooth::telemetry::TelemetryIngestion;
use crate::infrastructure::bluetooth::transport::{BleTransport, LinkEvent, TransportError};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default number of failed reconnects before giving up
pub const MAX_RECONNECTION_ATTEMPTS: u32 = 5;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound on a single hardware connect
    pub connect_timeout: Duration,
    /// Failed attempts allowed while Reconnecting
    pub max_reconnection_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_reconnection_attempts: MAX_RECONNECTION_ATTEMPTS,
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            max_reconnection_attempts: settings.max_reconnection_attempts,
        }
    }
}

/// The link currently in use. `session` changes on every connect and teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLink {
    pub device_id: String,
    pub session: u64,
}

#[derive(Default)]
struct ConnectionInner {
    state: ConnectionState,
    /// Active device, or the device being reconnected
    device_id: Option<String>,
    device_name: Option<String>,
    reconnect_attempts: u32,
    /// Bumped on every connect attempt and teardown to detect stale results
    generation: u64,
    /// Set while a hardware connect is pending, including reconnect attempts
    attempt_in_flight: bool,
    link_watcher: Option<JoinHandle<()>>,
}

/// Connection Manager
pub struct ConnectionManager {
    transport: Arc<dyn BleTransport>,
    bus: Arc<EventBus>,
    registry: Arc<DeviceRegistry>,
    telemetry: Arc<TelemetryIngestion>,
    config: ConnectionConfig,
    inner: Mutex<ConnectionInner>,
    link_tx: watch::Sender<Option<ActiveLink>>,
}

/// Outcome of the synchronous precondition check in `connect`
enum Admission {
    Proceed {
        generation: u64,
        reconnecting: bool,
    },
    AlreadyConnected,
    Rejected(String),
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        bus: Arc<EventBus>,
        registry: Arc<DeviceRegistry>,
        telemetry: Arc<TelemetryIngestion>,
        config: ConnectionConfig,
    ) -> Self {
        let (link_tx, _) = watch::channel(None);
        Self {
            transport,
            bus,
            registry,
            telemetry,
            config,
            inner: Mutex::new(ConnectionInner::default()),
            link_tx,
        }
    }

    /// Connect to a device from the last scan (or otherwise remembered).
    ///
    /// Emits `connecting`, then `connected` or `connection-error`. While
    /// Reconnecting, each failure counts toward the reconnection limit.
    pub async fn connect(self: &Arc<Self>, device_id: &str) -> bool {
        let (generation, reconnecting) = match self.admit(device_id) {
            Admission::Proceed {
                generation,
                reconnecting,
            } => (generation, reconnecting),
            Admission::AlreadyConnected => {
                debug!("Already connected to {}", device_id);
                return true;
            }
            Admission::Rejected(message) => {
                warn!("Connect to {} rejected: {}", device_id, message);
                self.emit_connection_error(device_id, &message);
                return false;
            }
        };

        info!("Connecting to Bluetooth device: {}", device_id);
        self.bus.emit(WearableEvent::Connecting {
            device_id: device_id.to_string(),
        });

        // Step 1: Permission check
        let mut timed_out = false;
        let result = if !self.transport.is_authorized().await {
            Err(TransportError::NotAuthorized.to_string())
        } else {
            // Step 2: Hardware connect, bounded by the configured timeout
            match tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.connect(device_id),
            )
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("Could not connect to {}: {}", device_id, e)),
                Err(_) => {
                    timed_out = true;
                    Err(format!(
                        "Connection to {} timed out after {} ms",
                        device_id,
                        self.config.connect_timeout.as_millis()
                    ))
                }
            }
        };

        // A disconnect() while we were waiting makes this attempt stale
        let (superseded, device_in_use) = {
            let inner = self.lock();
            let superseded = inner.generation != generation;
            let device_in_use = superseded
                && inner.state != ConnectionState::Disconnected
                && inner.device_id.as_deref() == Some(device_id);
            (superseded, device_in_use)
        };

        // Release whatever the hardware set up, unless a newer session owns it
        if (timed_out || (superseded && result.is_ok())) && !device_in_use {
            let _ = self.transport.disconnect(device_id).await;
        }
        if superseded {
            info!("Connect to {} superseded; discarding result", device_id);
            return false;
        }

        match result {
            Ok(()) => self.on_connected(device_id, generation, reconnecting).await,
            Err(message) => {
                self.on_connect_failed(device_id, &message, generation, reconnecting);
                false
            }
        }
    }

    /// Re-attempt the remembered device. Only valid while Reconnecting.
    pub async fn reconnect(self: &Arc<Self>) -> bool {
        let target = {
            let inner = self.lock();
            match (inner.state, inner.device_id.clone()) {
                (ConnectionState::Reconnecting, Some(id)) => id,
                _ => return false,
            }
        };
        self.connect(&target).await
    }

    /// Tear down the link. Safe to call in any state; always emits
    /// `disconnected`.
    pub async fn disconnect(&self) {
        let (device_id, was_linked) = {
            let mut inner = self.lock();
            let was_linked = matches!(
                inner.state,
                ConnectionState::Connected | ConnectionState::Connecting
            );
            inner.generation += 1;
            inner.attempt_in_flight = false;
            inner.state = ConnectionState::Disconnected;
            inner.device_name = None;
            if let Some(watcher) = inner.link_watcher.take() {
                watcher.abort();
            }
            (inner.device_id.take(), was_linked)
        };
        self.link_tx.send_replace(None);

        self.registry.stop_scan();
        self.telemetry.stop();

        if let Some(id) = device_id.as_deref().filter(|_| was_linked) {
            info!("Disconnecting from {}", id);
            if let Err(e) = self.transport.disconnect(id).await {
                warn!("Hardware disconnect from {} failed: {}", id, e);
            }
        }

        self.bus.emit(WearableEvent::Disconnected);
    }

    /// Hardware-reported link loss. Moves Connected to Reconnecting.
    pub fn handle_link_loss(&self, device_id: &str) {
        {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Connected
                || inner.device_id.as_deref() != Some(device_id)
            {
                debug!("Ignoring link loss for inactive device {}", device_id);
                return;
            }
            warn!("Link to {} lost; waiting for reconnection", device_id);
            inner.generation += 1;
            inner.state = ConnectionState::Reconnecting;
            inner.link_watcher = None;
        }
        self.link_tx.send_replace(None);
        self.telemetry.stop();
        self.bus.emit(WearableEvent::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn device_id(&self) -> Option<String> {
        self.lock().device_id.clone()
    }

    pub fn device_name(&self) -> Option<String> {
        self.lock().device_name.clone()
    }

    /// Rename the active device locally. Returns false when there is no
    /// device or the name is blank.
    pub fn set_device_name(&self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let device_id = {
            let mut inner = self.lock();
            let Some(device_id) = inner.device_id.clone() else {
                return false;
            };
            inner.device_name = Some(name.to_string());
            device_id
        };
        self.registry.rename(&device_id, name);
        info!("Device {} renamed to {}", device_id, name);
        self.bus.emit(WearableEvent::DeviceRenamed {
            name: name.to_string(),
        });
        true
    }

    /// Consecutive failed attempts in the current reconnection cycle
    pub fn reconnection_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    pub fn max_reconnection_attempts(&self) -> u32 {
        self.config.max_reconnection_attempts
    }

    pub fn active_link(&self) -> Option<ActiveLink> {
        self.link_tx.borrow().clone()
    }

    /// Observe link changes; the value is `None` whenever no link is usable
    pub fn watch_link(&self) -> watch::Receiver<Option<ActiveLink>> {
        self.link_tx.subscribe()
    }

    pub fn is_link_current(&self, link: &ActiveLink) -> bool {
        self.link_tx.borrow().as_ref() == Some(link)
    }

    fn admit(&self, device_id: &str) -> Admission {
        let mut inner = self.lock();
        let current = inner.device_id.as_deref();

        if inner.attempt_in_flight {
            return Admission::Rejected(format!(
                "A connection attempt to {} is already in progress",
                current.unwrap_or("another device")
            ));
        }

        match inner.state {
            ConnectionState::Connected if current == Some(device_id) => {
                return Admission::AlreadyConnected;
            }
            ConnectionState::Connected => {
                return Admission::Rejected(format!(
                    "Already connected to {}; disconnect first",
                    current.unwrap_or("another device")
                ));
            }
            ConnectionState::Connecting => {
                return Admission::Rejected(format!(
                    "A connection attempt to {} is already in progress",
                    current.unwrap_or("another device")
                ));
            }
            ConnectionState::Reconnecting if current != Some(device_id) => {
                return Admission::Rejected(format!(
                    "Reconnection to {} is in progress",
                    current.unwrap_or("another device")
                ));
            }
            ConnectionState::Reconnecting | ConnectionState::Disconnected => {}
        }

        if current != Some(device_id) && !self.registry.is_known(device_id) {
            return Admission::Rejected(format!(
                "Device {} not found in scan results",
                device_id
            ));
        }

        let reconnecting = inner.state == ConnectionState::Reconnecting;
        if !reconnecting {
            inner.state = ConnectionState::Connecting;
            inner.device_id = Some(device_id.to_string());
        }
        inner.generation += 1;
        inner.attempt_in_flight = true;
        Admission::Proceed {
            generation: inner.generation,
            reconnecting,
        }
    }

    async fn on_connected(
        self: &Arc<Self>,
        device_id: &str,
        generation: u64,
        reconnected: bool,
    ) -> bool {
        let device_name = self
            .registry
            .name_of(device_id)
            .unwrap_or_else(|| device_id.to_string());

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return false;
            }
            inner.attempt_in_flight = false;
            inner.state = ConnectionState::Connected;
            inner.device_id = Some(device_id.to_string());
            inner.device_name = Some(device_name.clone());
            inner.reconnect_attempts = 0;
            inner.link_watcher = Some(self.spawn_link_watcher(device_id));
        }
        self.link_tx.send_replace(Some(ActiveLink {
            device_id: device_id.to_string(),
            session: generation,
        }));
        info!("Device connected: {} ({})", device_name, device_id);

        let started = self.telemetry.start(device_id).await;

        // disconnect() or link loss while telemetry was starting
        if started.is_none() || self.lock().generation != generation {
            info!("Session with {} ended before it was announced", device_id);
            return false;
        }

        self.bus.emit(WearableEvent::Connected {
            device_id: device_id.to_string(),
            device_name,
        });
        if reconnected {
            info!("Reconnected to {}; flash log may hold buffered readings", device_id);
            self.bus.emit(WearableEvent::FlashDataAvailable);
        }
        true
    }

    fn on_connect_failed(&self, device_id: &str, message: &str, generation: u64, reconnecting: bool) {
        error!("Connection failed: {}", message);

        let exhausted = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.attempt_in_flight = false;
            if reconnecting {
                inner.reconnect_attempts += 1;
                warn!(
                    "Reconnection attempt {}/{} to {} failed",
                    inner.reconnect_attempts, self.config.max_reconnection_attempts, device_id
                );
                if inner.reconnect_attempts >= self.config.max_reconnection_attempts {
                    inner.state = ConnectionState::Disconnected;
                    inner.device_id = None;
                    Some(inner.reconnect_attempts)
                } else {
                    None
                }
            } else {
                inner.state = ConnectionState::Disconnected;
                inner.device_id = None;
                None
            }
        };

        self.emit_connection_error(device_id, message);

        if let Some(attempts) = exhausted {
            error!("Giving up on {} after {} attempts", device_id, attempts);
            self.bus.emit(WearableEvent::ReconnectionFailed {
                attempts,
                message: format!(
                    "Could not reconnect to {} after {} attempts",
                    device_id, attempts
                ),
            });
        }
    }

    fn spawn_link_watcher(self: &Arc<Self>, device_id: &str) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let watched = device_id.to_string();
        let mut events = self.transport.link_events();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::Disconnected { device_id }) if device_id == watched => {
                        if let Some(manager) = manager.upgrade() {
                            manager.handle_link_loss(&device_id);
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Link watcher lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn emit_connection_error(&self, device_id: &str, message: &str) {
        self.bus.emit(WearableEvent::ConnectionError {
            device_id: device_id.to_string(),
            error: message.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.connect_timeout_ms = 2_500;
        settings.max_reconnection_attempts = 3;

        let config = ConnectionConfig::from_settings(&settings);
        assert_eq!(config.connect_timeout, Duration::from_millis(2_500));
        assert_eq!(config.max_reconnection_attempts, 3);
    }

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_reconnection_attempts, MAX_RECONNECTION_ATTEMPTS);
    }
}
