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
    "ble_gatt_session".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE identifiers
    #[serde(default = "default_advertising_uuid")]
    pub ble_advertising_uuid: String,
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_read_uuid")]
    pub ble_read_char_uuid: String,
    #[serde(default = "default_percentage_uuid")]
    pub ble_percentage_char_uuid: String,
    #[serde(default = "default_switch_uuid")]
    pub ble_switch_char_uuid: String,

    // Timing
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub auto_poll: bool,

    // Known devices
    #[serde(default)]
    pub known_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_advertising_uuid: default_advertising_uuid(),
            ble_service_uuid: default_service_uuid(),
            ble_read_char_uuid: default_read_uuid(),
            ble_percentage_char_uuid: default_percentage_uuid(),
            ble_switch_char_uuid: default_switch_uuid(),
            scan_timeout_ms: default_scan_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            auto_poll: true,
            known_addresses: Vec::new(),
            last_connected_address: None,
        }
    }
}

fn default_advertising_uuid() -> String {
    "c8bac71f-579e-4d69-b18e-83639e15e705".to_string()
}
fn default_service_uuid() -> String {
    "12345678-1234-5678-1234-56789abcdef0".to_string()
}
fn default_read_uuid() -> String {
    "abcdef01-1234-5678-1234-56789abcdef0".to_string()
}
fn default_percentage_uuid() -> String {
    "abcdef02-1234-5678-1234-56789abcdef0".to_string()
}
fn default_switch_uuid() -> String {
    "abcdef03-1234-5678-1234-56789abcdef0".to_string()
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_operation_timeout_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    3_000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleGattSession");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    /// Remember an address that reached Ready
    pub fn remember_address(&mut self, address: &str) -> anyhow::Result<()> {
        if !self.settings.known_addresses.iter().any(|a| a == address) {
            self.settings.known_addresses.push(address.to_string());
        }
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(
            settings.ble_service_uuid,
            "12345678-1234-5678-1234-56789abcdef0"
        );
        assert_eq!(settings.poll_interval_ms, 3000);
        assert_eq!(settings.scan_timeout_ms, 10_000);
        assert!(settings.auto_poll);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "poll_interval_ms": 500 }"#).unwrap();
        assert_eq!(settings.poll_interval_ms, 500);
        assert_eq!(settings.operation_timeout_ms, 5000);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_remember_address_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service.remember_address("AA:BB:CC:DD:EE:FF").unwrap();
        service.remember_address("AA:BB:CC:DD:EE:FF").unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().known_addresses.len(), 1);
        assert_eq!(
            reloaded.get().last_connected_address.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
    }
}
