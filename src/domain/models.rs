//! Core data model shared by every part of the connectivity layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A wearable found during a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCandidate {
    /// Stable hardware address
    pub id: String,
    pub name: String,
    /// RSSI in dBm, typically -100..0
    pub signal_strength: i16,
    pub last_seen: DateTime<Utc>,
}

impl DeviceCandidate {
    pub fn signal_quality(&self) -> SignalQuality {
        SignalQuality::classify(self.signal_strength)
    }
}

/// Link quality bucket derived from RSSI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    Strong,
    Medium,
    Weak,
}

impl SignalQuality {
    /// `>= -70` strong, `-85..-70` medium, below `-85` weak.
    pub fn classify(rssi: i16) -> Self {
        if rssi >= -70 {
            Self::Strong
        } else if rssi >= -85 {
            Self::Medium
        } else {
            Self::Weak
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strong => "strong",
            Self::Medium => "medium",
            Self::Weak => "weak",
        }
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting...",
        }
    }
}

/// One decoded vitals sample. Live and flash-log paths both produce this shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsReading {
    /// Beats per minute
    pub heart_rate: u8,
    /// Percent
    pub spo2: u8,
    /// Tenths of a degree Celsius
    pub temperature: i16,
    /// Percent 0-100
    pub battery: u8,
    /// 0-3
    pub motion_level: u8,
    /// 0-100
    pub readiness_score: u8,
    pub fever_flag: bool,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl VitalsReading {
    /// Temperature in degrees Celsius
    pub fn temperature_celsius(&self) -> f32 {
        self.temperature as f32 / 10.0
    }
}

/// Type tag carried by `fever-alert`. The live path only reports high readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum FeverKind {
    High,
}

/// Named checkpoints of a flash-log upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlashStage {
    Initializing,
    Authenticating,
    Requesting,
    Decrypting,
    Verifying,
    Processing,
    Finalizing,
    Complete,
}

impl FlashStage {
    /// Progress percentage reported when the stage begins
    pub fn checkpoint(&self) -> u8 {
        match self {
            FlashStage::Initializing => 10,
            FlashStage::Authenticating => 20,
            FlashStage::Requesting => 30,
            FlashStage::Decrypting => 50,
            FlashStage::Verifying => 70,
            FlashStage::Processing => 85,
            FlashStage::Finalizing => 95,
            FlashStage::Complete => 100,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FlashStage::Initializing => "Initializing",
            FlashStage::Authenticating => "Authenticating",
            FlashStage::Requesting => "Requesting",
            FlashStage::Decrypting => "Decrypting",
            FlashStage::Verifying => "Verifying",
            FlashStage::Processing => "Processing",
            FlashStage::Finalizing => "Finalizing",
            FlashStage::Complete => "Complete",
        }
    }
}

impl fmt::Display for FlashStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of the (at most one) flash-log upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashLogSession {
    pub in_progress: bool,
    pub progress: u8,
    pub stage: Option<FlashStage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_classification() {
        assert_eq!(SignalQuality::classify(-65), SignalQuality::Strong);
        assert_eq!(SignalQuality::classify(-75), SignalQuality::Medium);
        assert_eq!(SignalQuality::classify(-90), SignalQuality::Weak);
    }

    #[test]
    fn test_signal_classification_boundaries() {
        assert_eq!(SignalQuality::classify(-70).as_str(), "strong");
        assert_eq!(SignalQuality::classify(-71).as_str(), "medium");
        assert_eq!(SignalQuality::classify(-85).as_str(), "medium");
        assert_eq!(SignalQuality::classify(-86).as_str(), "weak");
        assert_eq!(SignalQuality::classify(0).as_str(), "strong");
    }

    #[test]
    fn test_stage_checkpoints_increase() {
        let stages = [
            FlashStage::Initializing,
            FlashStage::Authenticating,
            FlashStage::Requesting,
            FlashStage::Decrypting,
            FlashStage::Verifying,
            FlashStage::Processing,
            FlashStage::Finalizing,
            FlashStage::Complete,
        ];
        let checkpoints: Vec<u8> = stages.iter().map(|s| s.checkpoint()).collect();
        assert_eq!(checkpoints, vec![10, 20, 30, 50, 70, 85, 95, 100]);
    }

    #[test]
    fn test_reading_serializes_camel_case() {
        let reading = VitalsReading {
            heart_rate: 72,
            spo2: 98,
            temperature: 366,
            battery: 80,
            motion_level: 1,
            readiness_score: 77,
            fever_flag: false,
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_value(reading).unwrap();
        assert_eq!(json["heartRate"], 72);
        assert_eq!(json["readinessScore"], 77);
        assert_eq!(json["feverFlag"], false);
        assert!((reading.temperature_celsius() - 36.6).abs() < 0.001);
    }
}
