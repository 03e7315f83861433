//! Export and unit formatting over reading snapshots.
//!
//! The CSV layout is an external contract:
//! `timestamp,hr,spo2,temp,battery,motion,readiness,fever` with RFC 3339 UTC
//! timestamps and temperature in degrees Celsius.

use crate::domain::models::VitalsReading;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;

pub const CSV_HEADER: &str = "timestamp,hr,spo2,temp,battery,motion,readiness,fever";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Missing or unexpected CSV header")]
    BadHeader,
    #[error("CSV line {line}: {reason}")]
    BadRow { line: usize, reason: String },
}

/// Pretty-printed JSON array of readings
pub fn to_json(readings: &[VitalsReading]) -> Result<String, ExportError> {
    Ok(serde_json::to_string_pretty(readings)?)
}

pub fn to_csv(readings: &[VitalsReading]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + readings.len() * 64);
    out.push_str(CSV_HEADER);
    out.push('\n');

    for r in readings {
        let _ = writeln!(
            out,
            "{},{},{},{:.1},{},{},{},{}",
            format_timestamp(r.timestamp),
            r.heart_rate,
            r.spo2,
            r.temperature_celsius(),
            r.battery,
            r.motion_level,
            r.readiness_score,
            r.fever_flag
        );
    }
    out
}

/// Parse CSV produced by [`to_csv`]
pub fn parse_csv(input: &str) -> Result<Vec<VitalsReading>, ExportError> {
    let mut lines = input.lines().enumerate();
    match lines.next() {
        Some((_, header)) if header.trim() == CSV_HEADER => {}
        _ => return Err(ExportError::BadHeader),
    }

    let mut readings = Vec::new();
    for (index, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        readings.push(parse_row(line).map_err(|reason| ExportError::BadRow {
            line: index + 1,
            reason,
        })?);
    }
    Ok(readings)
}

fn parse_row(line: &str) -> Result<VitalsReading, String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 8 {
        return Err(format!("expected 8 fields, found {}", fields.len()));
    }

    let timestamp = DateTime::parse_from_rfc3339(fields[0])
        .map_err(|e| format!("bad timestamp: {}", e))?
        .timestamp_millis();
    let celsius: f32 = fields[3]
        .parse()
        .map_err(|e| format!("bad temperature: {}", e))?;

    Ok(VitalsReading {
        heart_rate: parse_field(fields[1], "hr")?,
        spo2: parse_field(fields[2], "spo2")?,
        temperature: (celsius * 10.0).round() as i16,
        battery: parse_field(fields[4], "battery")?,
        motion_level: parse_field(fields[5], "motion")?,
        readiness_score: parse_field(fields[6], "readiness")?,
        fever_flag: parse_field(fields[7], "fever")?,
        timestamp,
    })
}

fn parse_field<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| format!("bad {}: {}", name, e))
}

/// RFC 3339 UTC with millisecond precision, e.g. `2024-03-01T08:00:00.000Z`
pub fn format_timestamp(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

pub fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Format a tenths-of-a-degree Celsius value for display
pub fn format_temperature(tenths_celsius: i16, unit: TemperatureUnit) -> String {
    let celsius = tenths_celsius as f32 / 10.0;
    match unit {
        TemperatureUnit::Celsius => format!("{:.1} °C", celsius),
        TemperatureUnit::Fahrenheit => format!("{:.1} °F", celsius_to_fahrenheit(celsius)),
    }
}
