use crate::domain::buffer::DEFAULT_MAX_READINGS;
use crate::domain::export::TemperatureUnit;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "wearable_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// A device the user has connected to before
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE identifiers
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_vitals_uuid")]
    pub ble_vitals_char_uuid: String,
    #[serde(default = "default_wear_uuid")]
    pub ble_wear_char_uuid: String,
    #[serde(default = "default_flash_control_uuid")]
    pub ble_flash_control_char_uuid: String,
    #[serde(default = "default_flash_data_uuid")]
    pub ble_flash_data_char_uuid: String,

    // Scanning and connection
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_reconnection_attempts")]
    pub max_reconnection_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    // Telemetry
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_false")]
    pub force_polling: bool,
    #[serde(default = "default_max_readings")]
    pub max_readings: usize,

    // Flash log
    #[serde(default = "default_false")]
    pub flash_strict_integrity: bool,
    #[serde(default = "default_max_chunk_failures")]
    pub flash_max_consecutive_chunk_failures: u32,
    #[serde(default = "default_flash_io_timeout_ms")]
    pub flash_io_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub auto_flash_upload: bool,

    // Devices
    #[serde(default)]
    pub known_devices: Vec<KnownDevice>,
    #[serde(default)]
    pub last_connected_device: Option<String>,

    // Display
    #[serde(default)]
    pub temperature_unit: TemperatureUnit,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),

            ble_service_uuid: default_service_uuid(),
            ble_vitals_char_uuid: default_vitals_uuid(),
            ble_wear_char_uuid: default_wear_uuid(),
            ble_flash_control_char_uuid: default_flash_control_uuid(),
            ble_flash_data_char_uuid: default_flash_data_uuid(),

            scan_timeout_ms: default_scan_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_reconnection_attempts: default_max_reconnection_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            auto_reconnect: true,

            poll_interval_ms: default_poll_interval_ms(),
            force_polling: false,
            max_readings: default_max_readings(),

            flash_strict_integrity: false,
            flash_max_consecutive_chunk_failures: default_max_chunk_failures(),
            flash_io_timeout_ms: default_flash_io_timeout_ms(),
            auto_flash_upload: true,

            known_devices: Vec::new(),
            last_connected_device: None,

            temperature_unit: TemperatureUnit::default(),
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_vitals_uuid() -> String {
    protocol::VITALS_CHAR_UUID.to_string()
}
fn default_wear_uuid() -> String {
    protocol::WEAR_CHAR_UUID.to_string()
}
fn default_flash_control_uuid() -> String {
    protocol::FLASH_CONTROL_CHAR_UUID.to_string()
}
fn default_flash_data_uuid() -> String {
    protocol::FLASH_DATA_CHAR_UUID.to_string()
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_reconnection_attempts() -> u32 {
    5
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_max_readings() -> usize {
    DEFAULT_MAX_READINGS
}
fn default_max_chunk_failures() -> u32 {
    5
}
fn default_flash_io_timeout_ms() -> u64 {
    5000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the platform config directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("WearableLink");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Record a successful connection and persist it
    pub fn remember_device(&mut self, id: &str, name: &str) -> anyhow::Result<()> {
        match self.settings.known_devices.iter_mut().find(|d| d.id == id) {
            Some(known) => known.name = name.to_string(),
            None => self.settings.known_devices.push(KnownDevice {
                id: id.to_string(),
                name: name.to_string(),
            }),
        }
        self.settings.last_connected_device = Some(id.to_string());
        self.save()
    }
}
