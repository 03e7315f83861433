//! Wearable Protocol
//!
//! UUIDs, the live vitals record layout and the flash-log framing.

use crate::domain::models::VitalsReading;
use anyhow::Result;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// Wearable BLE Service UUID
/// Decoded: "NestorVitalsBand" in ASCII (4E 65 73 74 6F 72 56 69 74 61 6C 73 42 61 6E 64)
pub const SERVICE_UUID: &str = "4e657374-6f72-5669-7461-6c7342616e64";

/// Vitals characteristic - read and notify
pub const VITALS_CHAR_UUID: &str = "4e657374-0001-5669-7461-6c7342616e64";

/// Wear state characteristic - notify, 1 byte
pub const WEAR_CHAR_UUID: &str = "4e657374-0002-5669-7461-6c7342616e64";

/// Flash-log control characteristic - commands are written here
pub const FLASH_CONTROL_CHAR_UUID: &str = "4e657374-0003-5669-7461-6c7342616e64";

/// Flash-log data characteristic - header and chunks are read from here
pub const FLASH_DATA_CHAR_UUID: &str = "4e657374-0004-5669-7461-6c7342616e64";

/// Minimum length of a live vitals record
pub const VITALS_RECORD_LEN: usize = 7;

/// Flash-log header: magic + record count + chunk count
pub const FLASH_HEADER_LEN: usize = 5;
pub const FLASH_HEADER_MAGIC: u8 = 0xF1;

/// Flash-log record: sequence + age + vitals record
pub const FLASH_RECORD_LEN: usize = 2 + 4 + VITALS_RECORD_LEN;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Record too short: {0} bytes (expected at least {1})")]
    TooShort(usize, usize),
    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u8 },
    #[error("Bad flash-log header magic: {0:#04X}")]
    BadMagic(u8),
    #[error("Flash-log chunk payload of {0} bytes is not a whole number of records")]
    RaggedChunk(usize),
}

/// Flash-log control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashCommand {
    /// Prepare the log for transfer
    Init,
    /// Open an authenticated transfer session
    Authenticate,
    /// Ask the device to stage the header and chunks for reading
    RequestLog,
    /// Acknowledge the transfer and erase the transferred log
    Finalize,
}

impl FlashCommand {
    /// Get the raw bytes for this command
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Init => &[0x01, 0x00],
            Self::Authenticate => &[0x02, 0x00],
            Self::RequestLog => &[0x03, 0x00],
            Self::Finalize => &[0x04, 0x00],
        }
    }
}

/// A decoded vitals record before it is stamped with a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VitalsFrame {
    pub heart_rate: u8,
    pub spo2: u8,
    pub temperature: i16,
    pub battery: u8,
    pub motion_level: u8,
    pub fever_flag: bool,
    pub readiness_score: u8,
}

impl VitalsFrame {
    pub fn into_reading(self, timestamp: i64) -> VitalsReading {
        VitalsReading {
            heart_rate: self.heart_rate,
            spo2: self.spo2,
            temperature: self.temperature,
            battery: self.battery,
            motion_level: self.motion_level,
            readiness_score: self.readiness_score,
            fever_flag: self.fever_flag,
            timestamp,
        }
    }
}

/// Decode a live vitals record
///
/// # Record Structure (7 bytes minimum)
///
/// ```text
/// [0]     : Heart rate (u8, bpm)
/// [1]     : SpO2 (u8, percent)
/// [2-3]   : Temperature (u16 little-endian, tenths of a degree Celsius)
/// [4]     : Battery (u8, percent)
/// [5]     : Flags
///           bits 0-1: Motion level (0-3)
///           bit 2:    Fever flag
/// [6]     : Readiness score (u8, 0-100)
/// ```
///
/// Trailing bytes are ignored. Nothing is returned for a record that fails
/// a length or range check.
pub fn decode_vitals(bytes: &[u8]) -> Result<VitalsFrame, ProtocolError> {
    if bytes.len() < VITALS_RECORD_LEN {
        return Err(ProtocolError::TooShort(bytes.len(), VITALS_RECORD_LEN));
    }

    #[cfg(debug_assertions)]
    trace!("Raw vitals record: {:02X?}", bytes);

    let spo2 = check_percent("spo2", bytes[1])?;
    let battery = check_percent("battery", bytes[4])?;
    let readiness_score = check_percent("readiness", bytes[6])?;

    let flags = bytes[5];

    Ok(VitalsFrame {
        heart_rate: bytes[0],
        spo2,
        temperature: i16::from_le_bytes([bytes[2], bytes[3]]),
        battery,
        motion_level: flags & 0x03,
        fever_flag: (flags & 0x04) != 0,
        readiness_score,
    })
}

fn check_percent(field: &'static str, value: u8) -> Result<u8, ProtocolError> {
    if value > 100 {
        return Err(ProtocolError::OutOfRange { field, value });
    }
    Ok(value)
}

/// Encode a frame in the live record layout
pub fn encode_vitals(frame: &VitalsFrame) -> [u8; VITALS_RECORD_LEN] {
    let temp = frame.temperature.to_le_bytes();
    let flags = (frame.motion_level & 0x03) | if frame.fever_flag { 0x04 } else { 0 };
    [
        frame.heart_rate,
        frame.spo2,
        temp[0],
        temp[1],
        frame.battery,
        flags,
        frame.readiness_score,
    ]
}

/// Decode the wear-state notification (non-zero = worn)
pub fn decode_wear_state(bytes: &[u8]) -> Option<bool> {
    bytes.first().map(|b| *b != 0)
}

/// First read after [`FlashCommand::RequestLog`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLogHeader {
    pub record_count: u16,
    pub chunk_count: u16,
}

impl FlashLogHeader {
    /// ```text
    /// [0]   : Magic (0xF1)
    /// [1-2] : Record count (u16 little-endian)
    /// [3-4] : Chunk count (u16 little-endian)
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FLASH_HEADER_LEN {
            return Err(ProtocolError::TooShort(bytes.len(), FLASH_HEADER_LEN));
        }
        if bytes[0] != FLASH_HEADER_MAGIC {
            return Err(ProtocolError::BadMagic(bytes[0]));
        }
        Ok(Self {
            record_count: u16::from_le_bytes([bytes[1], bytes[2]]),
            chunk_count: u16::from_le_bytes([bytes[3], bytes[4]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; FLASH_HEADER_LEN] {
        let records = self.record_count.to_le_bytes();
        let chunks = self.chunk_count.to_le_bytes();
        [FLASH_HEADER_MAGIC, records[0], records[1], chunks[0], chunks[1]]
    }
}

/// One buffered reading from the device's flash log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRecord {
    pub sequence: u16,
    /// Seconds between the reading and the start of the transfer
    pub age_secs: u32,
    pub frame: VitalsFrame,
}

impl FlashRecord {
    pub fn to_bytes(&self) -> [u8; FLASH_RECORD_LEN] {
        let mut out = [0u8; FLASH_RECORD_LEN];
        out[0..2].copy_from_slice(&self.sequence.to_le_bytes());
        out[2..6].copy_from_slice(&self.age_secs.to_le_bytes());
        out[6..].copy_from_slice(&encode_vitals(&self.frame));
        out
    }
}

/// A raw chunk as read from the flash-log data characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashChunk {
    pub index: u16,
    pub payload: Vec<u8>,
}

impl FlashChunk {
    /// Split off the chunk index; the payload is decoded later
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < 2 {
            return Err(ProtocolError::TooShort(bytes.len(), 2));
        }
        Ok(Self {
            index: u16::from_le_bytes([bytes[0], bytes[1]]),
            payload: bytes[2..].to_vec(),
        })
    }

    /// Decode every record in the payload. A ragged payload or any invalid
    /// record rejects the whole chunk.
    pub fn records(&self) -> Result<Vec<FlashRecord>, ProtocolError> {
        if self.payload.len() % FLASH_RECORD_LEN != 0 {
            return Err(ProtocolError::RaggedChunk(self.payload.len()));
        }

        self.payload
            .chunks_exact(FLASH_RECORD_LEN)
            .map(|raw| {
                Ok(FlashRecord {
                    sequence: u16::from_le_bytes([raw[0], raw[1]]),
                    age_secs: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
                    frame: decode_vitals(&raw[6..])?,
                })
            })
            .collect()
    }

    /// Encode a chunk from records
    pub fn encode(index: u16, records: &[FlashRecord]) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + records.len() * FLASH_RECORD_LEN);
        out.extend_from_slice(&index.to_le_bytes());
        for record in records {
            out.extend_from_slice(&record.to_bytes());
        }
        out
    }
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str).map_err(|e| anyhow::anyhow!("Invalid UUID {}: {}", uuid_str, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> VitalsFrame {
        VitalsFrame {
            heart_rate: 72,
            spo2: 97,
            temperature: 372,
            battery: 64,
            motion_level: 2,
            fever_flag: false,
            readiness_score: 88,
        }
    }

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(SERVICE_UUID).unwrap();
        assert_eq!(uuid.as_bytes()[..6], *b"Nestor");
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(FlashCommand::Init.as_bytes(), &[0x01, 0x00]);
        assert_eq!(FlashCommand::Finalize.as_bytes(), &[0x04, 0x00]);
    }

    #[test]
    fn test_decode_vitals_layout() {
        let decoded = decode_vitals(&[80, 96, 0x81, 0x01, 50, 0b0000_0111, 42]).unwrap();
        assert_eq!(decoded.heart_rate, 80);
        assert_eq!(decoded.spo2, 96);
        assert_eq!(decoded.temperature, 385);
        assert_eq!(decoded.battery, 50);
        assert_eq!(decoded.motion_level, 3);
        assert!(decoded.fever_flag);
        assert_eq!(decoded.readiness_score, 42);
    }

    #[test]
    fn test_decode_rejects_short_records() {
        for len in 0..VITALS_RECORD_LEN {
            let bytes = vec![50u8; len];
            assert_eq!(
                decode_vitals(&bytes),
                Err(ProtocolError::TooShort(len, VITALS_RECORD_LEN))
            );
        }
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        let err = decode_vitals(&[70, 97, 0x70, 0x01, 101, 0, 50]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::OutOfRange {
                field: "battery",
                value: 101
            }
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = encode_vitals(&frame()).to_vec();
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(decode_vitals(&bytes), Ok(frame()));
    }

    #[test]
    fn test_wear_state() {
        assert_eq!(decode_wear_state(&[1]), Some(true));
        assert_eq!(decode_wear_state(&[0]), Some(false));
        assert_eq!(decode_wear_state(&[]), None);
    }

    #[test]
    fn test_flash_header() {
        let header = FlashLogHeader::parse(&[0xF1, 0x2C, 0x01, 0x03, 0x00]).unwrap();
        assert_eq!(header.record_count, 300);
        assert_eq!(header.chunk_count, 3);
        assert_eq!(
            FlashLogHeader::parse(&[0x00, 0, 0, 0, 0]),
            Err(ProtocolError::BadMagic(0))
        );
        assert!(FlashLogHeader::parse(&[0xF1, 0]).is_err());
    }

    #[test]
    fn test_flash_chunk_records() {
        let records = vec![
            FlashRecord {
                sequence: 7,
                age_secs: 600,
                frame: frame(),
            },
            FlashRecord {
                sequence: 8,
                age_secs: 595,
                frame: frame(),
            },
        ];
        let chunk = FlashChunk::parse(&FlashChunk::encode(4, &records)).unwrap();
        assert_eq!(chunk.index, 4);
        assert_eq!(chunk.records().unwrap(), records);
    }

    #[test]
    fn test_flash_chunk_ragged_payload() {
        let chunk = FlashChunk::parse(&[0, 0, 1, 2, 3]).unwrap();
        assert_eq!(chunk.records(), Err(ProtocolError::RaggedChunk(3)));
    }
}
