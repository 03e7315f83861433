//! Event Bus
//!
//! Typed publish/subscribe channel between the connectivity core and its
//! consumers. Dispatch is synchronous and in registration order.

use crate::domain::models::{DeviceCandidate, FeverKind, FlashStage, VitalsReading};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

/// Event topics, one per [`WearableEvent`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ScanStarted,
    DevicesDiscovered,
    ScanComplete,
    ScanError,
    Connecting,
    Connected,
    Disconnected,
    ConnectionError,
    DeviceRenamed,
    ReconnectionFailed,
    FlashDataAvailable,
    VitalUpdate,
    WearState,
    FeverAlert,
    FlashUploadStart,
    FlashUploadProgress,
    FlashUploadComplete,
    FlashUploadError,
}

impl Topic {
    /// Wire name used by UI consumers
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ScanStarted => "scan-started",
            Topic::DevicesDiscovered => "devices-discovered",
            Topic::ScanComplete => "scan-complete",
            Topic::ScanError => "scan-error",
            Topic::Connecting => "connecting",
            Topic::Connected => "connected",
            Topic::Disconnected => "disconnected",
            Topic::ConnectionError => "connection-error",
            Topic::DeviceRenamed => "device-renamed",
            Topic::ReconnectionFailed => "reconnection-failed",
            Topic::FlashDataAvailable => "flash-data-available",
            Topic::VitalUpdate => "vital-update",
            Topic::WearState => "wear-state",
            Topic::FeverAlert => "fever-alert",
            Topic::FlashUploadStart => "flash-upload-start",
            Topic::FlashUploadProgress => "flash-upload-progress",
            Topic::FlashUploadComplete => "flash-upload-complete",
            Topic::FlashUploadError => "flash-upload-error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum WearableEvent {
    ScanStarted,
    DevicesDiscovered {
        devices: Vec<DeviceCandidate>,
    },
    ScanComplete {
        device_count: usize,
    },
    ScanError {
        error: String,
    },
    Connecting {
        device_id: String,
    },
    Connected {
        device_id: String,
        device_name: String,
    },
    Disconnected,
    ConnectionError {
        device_id: String,
        error: String,
        /// Unix milliseconds
        timestamp: i64,
    },
    DeviceRenamed {
        name: String,
    },
    ReconnectionFailed {
        attempts: u32,
        message: String,
    },
    FlashDataAvailable,
    VitalUpdate(VitalsReading),
    WearState {
        worn: bool,
    },
    FeverAlert {
        /// Degrees Celsius to one decimal place (e.g. `38.6`), not rounded
        /// to whole degrees
        temperature: f32,
        #[serde(rename = "type")]
        kind: FeverKind,
    },
    FlashUploadStart,
    FlashUploadProgress {
        progress: u8,
        stage: FlashStage,
    },
    FlashUploadComplete {
        reading_count: usize,
    },
    FlashUploadError {
        error: String,
    },
}

impl WearableEvent {
    pub fn topic(&self) -> Topic {
        match self {
            WearableEvent::ScanStarted => Topic::ScanStarted,
            WearableEvent::DevicesDiscovered { .. } => Topic::DevicesDiscovered,
            WearableEvent::ScanComplete { .. } => Topic::ScanComplete,
            WearableEvent::ScanError { .. } => Topic::ScanError,
            WearableEvent::Connecting { .. } => Topic::Connecting,
            WearableEvent::Connected { .. } => Topic::Connected,
            WearableEvent::Disconnected => Topic::Disconnected,
            WearableEvent::ConnectionError { .. } => Topic::ConnectionError,
            WearableEvent::DeviceRenamed { .. } => Topic::DeviceRenamed,
            WearableEvent::ReconnectionFailed { .. } => Topic::ReconnectionFailed,
            WearableEvent::FlashDataAvailable => Topic::FlashDataAvailable,
            WearableEvent::VitalUpdate(_) => Topic::VitalUpdate,
            WearableEvent::WearState { .. } => Topic::WearState,
            WearableEvent::FeverAlert { .. } => Topic::FeverAlert,
            WearableEvent::FlashUploadStart => Topic::FlashUploadStart,
            WearableEvent::FlashUploadProgress { .. } => Topic::FlashUploadProgress,
            WearableEvent::FlashUploadComplete { .. } => Topic::FlashUploadComplete,
            WearableEvent::FlashUploadError { .. } => Topic::FlashUploadError,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&WearableEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every topic
    topic: Option<Topic>,
    listener: Listener,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

/// Process-wide event bus. Construct one and share it behind an `Arc`.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener for one topic
    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&WearableEvent) + Send + Sync + 'static,
    {
        self.register(Some(topic), Arc::new(listener))
    }

    /// Register a listener for every topic
    pub fn subscribe_all<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&WearableEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    /// Forward events into an async channel. Sends after the receiver is
    /// dropped are discarded.
    pub fn subscribe_channel(&self, topic: Option<Topic>) -> mpsc::UnboundedReceiver<WearableEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(
            topic,
            Arc::new(move |event: &WearableEvent| {
                let _ = tx.send(event.clone());
            }),
        );
        rx
    }

    /// Returns false if the id was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id);
        inner.subscriptions.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Deliver an event to every matching listener, in registration order.
    pub fn emit(&self, event: WearableEvent) {
        let topic = event.topic();
        // Snapshot so listeners can subscribe or emit without deadlocking
        let listeners: Vec<Listener> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.topic.map_or(true, |t| t == topic))
            .map(|s| s.listener.clone())
            .collect();

        trace!("emit {} to {} listener(s)", topic.as_str(), listeners.len());
        for listener in listeners {
            listener(&event);
        }
    }

    fn register(&self, topic: Option<Topic>, listener: Listener) -> SubscriptionId {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscriptions.push(Subscription {
            id,
            topic,
            listener,
        });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus, topic: Option<Topic>) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = move |e: &WearableEvent| sink.lock().unwrap().push(e.topic().as_str().to_string());
        match topic {
            Some(t) => bus.subscribe(t, listener),
            None => bus.subscribe_all(listener),
        };
        seen
    }

    #[test]
    fn test_topic_filtering() {
        let bus = EventBus::new();
        let connected = recorder(&bus, Some(Topic::Connected));
        let all = recorder(&bus, None);

        bus.emit(WearableEvent::ScanStarted);
        bus.emit(WearableEvent::Connected {
            device_id: "a".into(),
            device_name: "Band".into(),
        });

        assert_eq!(*connected.lock().unwrap(), vec!["connected"]);
        assert_eq!(*all.lock().unwrap(), vec!["scan-started", "connected"]);
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe(Topic::Disconnected, move |_| order.lock().unwrap().push(i));
        }
        bus.emit(WearableEvent::Disconnected);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe_all(|_| {});
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_reentrant_emit() {
        let bus = EventBus::new();
        let seen = recorder(&bus, Some(Topic::FlashDataAvailable));
        let inner = bus.clone();
        bus.subscribe(Topic::Connected, move |_| inner.emit(WearableEvent::FlashDataAvailable));

        bus.emit(WearableEvent::Connected {
            device_id: "a".into(),
            device_name: "Band".into(),
        });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_channel(Some(Topic::WearState));
        bus.emit(WearableEvent::ScanStarted);
        bus.emit(WearableEvent::WearState { worn: false });
        assert_eq!(rx.recv().await, Some(WearableEvent::WearState { worn: false }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let event = WearableEvent::ConnectionError {
            device_id: "nestor-001".into(),
            error: "timed out".into(),
            timestamp: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "connection-error");
        assert_eq!(json["payload"]["deviceId"], "nestor-001");

        let json = serde_json::to_value(WearableEvent::FeverAlert {
            temperature: 38.5,
            kind: FeverKind::High,
        })
        .unwrap();
        assert_eq!(json["event"], "fever-alert");
        assert_eq!(json["payload"]["type"], "high");
        // Tenths survive; the value is not rounded to whole degrees
        assert_eq!(json["payload"]["temperature"], 38.5);
    }
}
