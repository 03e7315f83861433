//! Flash-Log Uploader
//!
//! Pulls readings the wearable buffered in flash while it was out of range.
//! The transfer runs as a fixed sequence of stages (see [`FlashStage`]); all
//! device I/O goes through the shared I/O lock and is abandoned as soon as the
//! link it started on goes away.

use crate::domain::buffer::{ReadingBuffer, SharedReadings};
use crate::domain::events::{EventBus, WearableEvent};
use crate::domain::models::{FlashLogSession, FlashStage, VitalsReading};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{ActiveLink, ConnectionManager};
use crate::infrastructure::bluetooth::protocol::{
    self, FlashChunk, FlashCommand, FlashLogHeader, FlashRecord, ProtocolError,
};
use crate::infrastructure::bluetooth::telemetry::IoLock;
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportError};
use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FlashLogConfig {
    pub control_char: Uuid,
    pub data_char: Uuid,
    /// Fail the session on sequence gaps instead of accepting them
    pub strict_integrity: bool,
    pub max_consecutive_chunk_failures: u32,
    /// Bound on every single read or write
    pub io_timeout: Duration,
}

impl Default for FlashLogConfig {
    fn default() -> Self {
        Self {
            control_char: Uuid::parse_str(protocol::FLASH_CONTROL_CHAR_UUID).unwrap_or_default(),
            data_char: Uuid::parse_str(protocol::FLASH_DATA_CHAR_UUID).unwrap_or_default(),
            strict_integrity: false,
            max_consecutive_chunk_failures: 5,
            io_timeout: Duration::from_millis(5000),
        }
    }
}

impl FlashLogConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            control_char: protocol::parse_uuid(&settings.ble_flash_control_char_uuid)?,
            data_char: protocol::parse_uuid(&settings.ble_flash_data_char_uuid)?,
            strict_integrity: settings.flash_strict_integrity,
            max_consecutive_chunk_failures: settings.flash_max_consecutive_chunk_failures.max(1),
            io_timeout: Duration::from_millis(settings.flash_io_timeout_ms),
        })
    }
}

#[derive(Debug, Error)]
pub enum FlashLogError {
    #[error("No device connected")]
    NotConnected,
    #[error("Link to the device was lost")]
    LinkLost,
    #[error("{op} timed out")]
    Timeout { op: &'static str },
    #[error("{op} failed: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("Invalid flash-log header: {0}")]
    Header(#[from] ProtocolError),
    #[error("Gave up after {0} consecutive chunk read failures")]
    TooManyChunkFailures(u32),
    #[error("{missing} record(s) missing from the flash log")]
    Incomplete { missing: usize },
}

impl FlashLogError {
    /// Message suitable for showing to the wearer
    pub fn user_message(&self) -> String {
        match self {
            Self::NotConnected => "No device connected. Connect your band and try again.".into(),
            Self::LinkLost => {
                "The band disconnected during the upload. Please reconnect and try again.".into()
            }
            Self::Timeout { .. } => "The band stopped responding. Upload failed, please try again.".into(),
            Self::Device { op, .. } => format!("Upload failed while trying to {}. Please try again.", op),
            Self::Header(_) => "The band sent an unreadable log. Upload failed, please try again.".into(),
            Self::TooManyChunkFailures(_) => {
                "Too many read errors while downloading the log. Upload failed, please try again.".into()
            }
            Self::Incomplete { missing } => format!(
                "The downloaded log is incomplete ({} readings missing). Please try again.",
                missing
            ),
        }
    }
}

/// Flash-Log Uploader
pub struct FlashLogUploader {
    transport: Arc<dyn BleTransport>,
    bus: Arc<EventBus>,
    readings: SharedReadings,
    io_lock: IoLock,
    connection: Arc<ConnectionManager>,
    config: FlashLogConfig,
    session: Mutex<FlashLogSession>,
}

impl FlashLogUploader {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        bus: Arc<EventBus>,
        readings: SharedReadings,
        io_lock: IoLock,
        connection: Arc<ConnectionManager>,
        config: FlashLogConfig,
    ) -> Self {
        Self {
            transport,
            bus,
            readings,
            io_lock,
            connection,
            config,
            session: Mutex::new(FlashLogSession::default()),
        }
    }

    /// Run one upload session to completion.
    ///
    /// Returns false without any event if a session is already running, and
    /// false with `flash-upload-error` if there is no connected device or the
    /// session fails.
    pub async fn start(&self) -> bool {
        {
            let mut session = self.lock();
            if session.in_progress {
                warn!("Flash-log upload already in progress");
                return false;
            }
            *session = FlashLogSession {
                in_progress: true,
                progress: 0,
                stage: None,
            };
        }

        let link = match self.connection.active_link() {
            Some(link) if self.connection.is_connected() => link,
            _ => {
                self.fail(FlashLogError::NotConnected);
                return false;
            }
        };

        info!("Starting flash-log upload from {}", link.device_id);
        self.bus.emit(WearableEvent::FlashUploadStart);

        match self.run(&link).await {
            Ok(reading_count) => {
                self.advance(FlashStage::Complete, FlashStage::Complete.checkpoint());
                self.lock().in_progress = false;
                info!("Flash-log upload complete: {} reading(s) merged", reading_count);
                self.bus
                    .emit(WearableEvent::FlashUploadComplete { reading_count });
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.lock().in_progress
    }

    pub fn progress(&self) -> u8 {
        self.lock().progress
    }

    pub fn session(&self) -> FlashLogSession {
        *self.lock()
    }

    async fn run(&self, link: &ActiveLink) -> Result<usize, FlashLogError> {
        let transfer_start = Utc::now().timestamp_millis();

        self.enter(FlashStage::Initializing);
        self.write_command(link, FlashCommand::Init, "initialize the log")
            .await?;

        self.enter(FlashStage::Authenticating);
        self.write_command(link, FlashCommand::Authenticate, "authenticate")
            .await?;

        self.enter(FlashStage::Requesting);
        self.write_command(link, FlashCommand::RequestLog, "request the log")
            .await?;
        let header = FlashLogHeader::parse(
            &self
                .device_io(link, "read the log header", self.read_data(link))
                .await?,
        )?;
        info!(
            "Flash log holds {} record(s) in {} chunk(s)",
            header.record_count, header.chunk_count
        );
        let raw_chunks = self.read_chunks(link, header.chunk_count).await?;

        self.enter(FlashStage::Decrypting);
        let records = decode_chunks(&raw_chunks);

        self.enter(FlashStage::Verifying);
        let (records, missing) = verify_sequence(records, usize::from(header.record_count));
        if missing > 0 {
            if self.config.strict_integrity {
                return Err(FlashLogError::Incomplete { missing });
            }
            warn!("Flash log has {} missing record(s); continuing", missing);
        }

        self.enter(FlashStage::Processing);
        let readings = to_readings(&records, transfer_start);

        self.enter(FlashStage::Finalizing);
        match self
            .write_command(link, FlashCommand::Finalize, "finalize the log")
            .await
        {
            Ok(()) => {}
            Err(FlashLogError::LinkLost) => return Err(FlashLogError::LinkLost),
            Err(e) => warn!("Finalize not acknowledged: {}", e),
        }

        let merged = self.buffer().merge(readings);
        Ok(merged)
    }

    /// Read every chunk in order. Individual failures are skipped; a run of
    /// them or a lost link ends the session.
    async fn read_chunks(
        &self,
        link: &ActiveLink,
        chunk_count: u16,
    ) -> Result<Vec<Vec<u8>>, FlashLogError> {
        let total = usize::from(chunk_count);
        let mut chunks = Vec::with_capacity(total);
        let mut consecutive_failures = 0u32;

        for index in 0..total {
            match self
                .device_io(link, "read a log chunk", self.read_data(link))
                .await
            {
                Ok(bytes) => {
                    consecutive_failures = 0;
                    debug!("Chunk {}/{}: {} bytes", index + 1, total, bytes.len());
                    chunks.push(bytes);
                }
                Err(FlashLogError::LinkLost) => return Err(FlashLogError::LinkLost),
                Err(e) => {
                    consecutive_failures += 1;
                    warn!("Skipping chunk {}/{}: {}", index + 1, total, e);
                    if consecutive_failures >= self.config.max_consecutive_chunk_failures {
                        return Err(FlashLogError::TooManyChunkFailures(consecutive_failures));
                    }
                }
            }

            let progress = chunk_progress(index + 1, total);
            if progress > self.progress() {
                self.advance(FlashStage::Requesting, progress);
            }
        }
        Ok(chunks)
    }

    async fn write_command(
        &self,
        link: &ActiveLink,
        command: FlashCommand,
        op: &'static str,
    ) -> Result<(), FlashLogError> {
        let write = self
            .transport
            .write(&link.device_id, self.config.control_char, command.as_bytes());
        self.device_io(link, op, write).await
    }

    fn read_data<'a>(
        &'a self,
        link: &'a ActiveLink,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send + 'a {
        self.transport.read(&link.device_id, self.config.data_char)
    }

    /// Perform one device operation under the I/O lock and timeout, raced
    /// against the loss of `link`.
    async fn device_io<T, F>(
        &self,
        link: &ActiveLink,
        op: &'static str,
        io: F,
    ) -> Result<T, FlashLogError>
    where
        F: Future<Output = Result<T, TransportError>> + Send,
    {
        let mut link_rx = self.connection.watch_link();

        let guarded = async {
            let _io = self.io_lock.lock().await;
            if !self.connection.is_link_current(link) {
                return Err(FlashLogError::LinkLost);
            }
            match tokio::time::timeout(self.config.io_timeout, io).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(source)) => Err(FlashLogError::Device { op, source }),
                Err(_) => Err(FlashLogError::Timeout { op }),
            }
        };

        tokio::select! {
            result = guarded => result,
            _ = async {
                let _ = link_rx.wait_for(|current| current.as_ref() != Some(link)).await;
            } => Err(FlashLogError::LinkLost),
        }
    }

    fn enter(&self, stage: FlashStage) {
        self.advance(stage, stage.checkpoint());
    }

    fn advance(&self, stage: FlashStage, progress: u8) {
        {
            let mut session = self.lock();
            session.progress = progress;
            session.stage = Some(stage);
        }
        debug!("Flash upload {}% ({})", progress, stage);
        self.bus
            .emit(WearableEvent::FlashUploadProgress { progress, stage });
    }

    fn fail(&self, e: FlashLogError) {
        error!("Flash-log upload failed: {}", e);
        self.lock().in_progress = false;
        self.bus.emit(WearableEvent::FlashUploadError {
            error: e.user_message(),
        });
    }

    fn buffer(&self) -> MutexGuard<'_, ReadingBuffer> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, FlashLogSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Progress within the Requesting stage after `received` of `total` chunks
fn chunk_progress(received: usize, total: usize) -> u8 {
    let first = FlashStage::Requesting.checkpoint() + 1;
    let last = FlashStage::Decrypting.checkpoint() - 1;
    if total == 0 {
        return last;
    }
    let span = usize::from(last - first);
    first + (span * received.min(total) / total) as u8
}

/// Decode raw chunks, dropping any that are malformed
fn decode_chunks(raw_chunks: &[Vec<u8>]) -> Vec<FlashRecord> {
    let mut records = Vec::new();
    for raw in raw_chunks {
        match FlashChunk::parse(raw).and_then(|chunk| Ok((chunk.index, chunk.records()?))) {
            Ok((index, chunk_records)) => {
                debug!("Chunk {} decoded: {} record(s)", index, chunk_records.len());
                records.extend(chunk_records);
            }
            Err(e) => warn!("Dropping malformed chunk: {}", e),
        }
    }
    records
}

/// Deduplicate by sequence number and count records missing either as gaps
/// in the sequence or as a shortfall against the header's record count.
///
/// Sequence numbers are `u16` and may wrap within one log (`65535, 0, 1`).
/// The log is taken to start after the widest gap around the circle, so a
/// wrapped run stays in order and is not counted as missing.
fn verify_sequence(mut records: Vec<FlashRecord>, expected: usize) -> (Vec<FlashRecord>, usize) {
    records.sort_by_key(|r| r.sequence);
    records.dedup_by_key(|r| r.sequence);

    let n = records.len();
    if n > 1 {
        let widest = (0..n)
            .max_by_key(|&i| records[(i + 1) % n].sequence.wrapping_sub(records[i].sequence))
            .unwrap_or(n - 1);
        records.rotate_left((widest + 1) % n);
    }

    let gaps: usize = records
        .windows(2)
        .map(|pair| usize::from(pair[1].sequence.wrapping_sub(pair[0].sequence) - 1))
        .sum();
    let shortfall = expected.saturating_sub(records.len());
    (records, gaps.max(shortfall))
}

/// Stamp records relative to the transfer start, oldest first
fn to_readings(records: &[FlashRecord], transfer_start: i64) -> Vec<VitalsReading> {
    let mut readings: Vec<VitalsReading> = records
        .iter()
        .map(|r| {
            r.frame
                .into_reading(transfer_start - i64::from(r.age_secs) * 1000)
        })
        .collect();
    readings.sort_by_key(|r| r.timestamp);
    readings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::VitalsFrame;

    fn record(sequence: u16, age_secs: u32) -> FlashRecord {
        FlashRecord {
            sequence,
            age_secs,
            frame: VitalsFrame {
                heart_rate: 60,
                spo2: 98,
                temperature: 365,
                battery: 80,
                motion_level: 0,
                fever_flag: false,
                readiness_score: 75,
            },
        }
    }

    #[test]
    fn test_chunk_progress_stays_inside_requesting() {
        let values: Vec<u8> = (1..=10).map(|k| chunk_progress(k, 10)).collect();
        assert!(values.iter().all(|p| (31..=49).contains(p)));
        assert_eq!(values.last(), Some(&49));
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(chunk_progress(0, 0), 49);
    }

    #[test]
    fn test_verify_dedupes_and_counts_gaps() {
        let (records, missing) =
            verify_sequence(vec![record(3, 10), record(1, 20), record(3, 10), record(5, 0)], 4);
        let sequences: Vec<u16> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 3, 5]);
        assert_eq!(missing, 2);
    }

    #[test]
    fn test_verify_handles_sequence_wrap() {
        let (records, missing) = verify_sequence(
            vec![record(0, 10), record(65534, 40), record(1, 0), record(65535, 20)],
            4,
        );
        let sequences: Vec<u16> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![65534, 65535, 0, 1]);
        assert_eq!(missing, 0);

        let (_, missing) = verify_sequence(vec![record(65535, 10), record(1, 0)], 2);
        assert_eq!(missing, 1);
    }

    #[test]
    fn test_verify_counts_shortfall() {
        let (_, missing) = verify_sequence(vec![record(0, 10), record(1, 5)], 5);
        assert_eq!(missing, 3);
        let (_, missing) = verify_sequence(vec![record(0, 10), record(1, 5)], 2);
        assert_eq!(missing, 0);
    }

    #[test]
    fn test_decode_drops_bad_chunks() {
        let good = FlashChunk::encode(0, &[record(0, 10), record(1, 5)]);
        let ragged = vec![1, 0, 9, 9, 9];
        let records = decode_chunks(&[good, ragged, vec![7]]);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_readings_are_stamped_from_age() {
        let readings = to_readings(&[record(1, 5), record(0, 10)], 100_000);
        let stamps: Vec<i64> = readings.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![90_000, 95_000]);
    }

    #[test]
    fn test_user_messages_are_distinct() {
        let lost = FlashLogError::LinkLost.user_message();
        let none = FlashLogError::NotConnected.user_message();
        assert_ne!(lost, none);
        assert!(lost.contains("disconnected"));
    }
}
