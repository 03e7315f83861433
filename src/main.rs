use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};
use wearable_link::domain::events::WearableEvent;
use wearable_link::domain::export::format_temperature;
use wearable_link::domain::settings::SettingsService;
use wearable_link::infrastructure::bluetooth::btleplug_transport::BtleplugTransport;
use wearable_link::infrastructure::bluetooth::scanner::ScanOptions;
use wearable_link::infrastructure::logging;
use wearable_link::WearableService;

#[tokio::main]
async fn main() -> Result<()> {
    let mut settings = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting Wearable Link ({})", settings.path().display());

    let transport = Arc::new(BtleplugTransport::new().await?);
    let service = WearableService::new(transport, settings.get())?;
    service.start_background_tasks();

    let unit = settings.get().temperature_unit;
    let mut events = service.bus().subscribe_channel(None);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                WearableEvent::VitalUpdate(r) => info!(
                    "HR {} bpm, SpO2 {}%, {}, battery {}%, readiness {}",
                    r.heart_rate,
                    r.spo2,
                    format_temperature(r.temperature, unit),
                    r.battery,
                    r.readiness_score
                ),
                WearableEvent::FeverAlert { temperature, .. } => {
                    warn!("Fever alert: {:.1} °C", temperature)
                }
                WearableEvent::ConnectionError { error, .. }
                | WearableEvent::ScanError { error }
                | WearableEvent::FlashUploadError { error } => error!("{}", error),
                other => info!("Event: {}", other.topic().as_str()),
            }
        }
    });

    // Target: explicit argument, then the last device, then the first found
    let requested = std::env::args()
        .nth(1)
        .or_else(|| settings.get().last_connected_device.clone());

    // The adapter only knows peripherals it has seen since start-up
    service.scan(ScanOptions::default()).await;
    let target = requested
        .filter(|id| service.registry().candidate(id).is_some())
        .or_else(|| service.registry().discovered().first().map(|d| d.id.clone()));

    let Some(device_id) = target else {
        warn!("No wearable found");
        return Ok(());
    };

    if !service.connect(&device_id).await {
        anyhow::bail!("Could not connect to {}", device_id);
    }

    let name = service
        .connection()
        .device_name()
        .unwrap_or_else(|| device_id.clone());
    settings.remember_device(&device_id, &name)?;

    info!("Streaming vitals; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    service.shutdown().await;
    let collected = service.readings().lock().map(|b| b.len()).unwrap_or(0);
    info!("Readings in buffer at exit: {}", collected);
    Ok(())
}
