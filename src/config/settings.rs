use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    InvalidValue(String),
}

/// Driver wide defaults, loadable from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    pub default_baud_rate: u32,
    pub default_timeout_secs: u32,
    /// How often an idle session looks for unsolicited frames
    pub idle_read_ms: u64,
    /// After a timeout, input arriving within this window is dropped as
    /// the late reply of the timed out request
    pub stale_reply_ms: u64,
    pub command_capacity: usize,
    pub event_capacity: usize,
    pub log_level: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            default_baud_rate: crate::serial::interface::DEFAULT_BAUD_RATE,
            default_timeout_secs: 1,
            idle_read_ms: 10,
            stale_reply_ms: 250,
            command_capacity: 64,
            event_capacity: 256,
            log_level: "info".to_string(),
        }
    }
}

impl DriverSettings {
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loading driver settings from {}", path.as_ref().display());
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.default_baud_rate == 0 {
            return Err(SettingsError::InvalidValue("default_baud_rate must be positive".to_string()));
        }
        if self.idle_read_ms == 0 {
            return Err(SettingsError::InvalidValue("idle_read_ms must be positive".to_string()));
        }
        if self.command_capacity == 0 || self.event_capacity == 0 {
            return Err(SettingsError::InvalidValue("queue capacities must be positive".to_string()));
        }
        self.level_filter()?;
        Ok(())
    }

    pub fn level_filter(&self) -> Result<log::LevelFilter, SettingsError> {
        self.log_level
            .parse()
            .map_err(|_| SettingsError::InvalidValue(format!("unknown log level '{}'", self.log_level)))
    }

    /// Install `env_logger` at the configured level. `RUST_LOG` still wins
    /// for modules it names. Does nothing if a logger is already installed.
    pub fn init_logging(&self) {
        let level = self.level_filter().unwrap_or(log::LevelFilter::Info);
        let result = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .try_init();
        if result.is_err() {
            log::debug!("Logger already initialised");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = DriverSettings::from_json(r#"{ "default_timeout_secs": 5, "log_level": "debug" }"#).unwrap();
        assert_eq!(settings.default_timeout_secs, 5);
        assert_eq!(settings.default_baud_rate, 115200);
        assert_eq!(settings.level_filter().unwrap(), log::LevelFilter::Debug);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            DriverSettings::from_json(r#"{ "idle_read_ms": 0 }"#),
            Err(SettingsError::InvalidValue(_))
        ));
        assert!(matches!(
            DriverSettings::from_json(r#"{ "log_level": "loud" }"#),
            Err(SettingsError::InvalidValue(_))
        ));
        assert!(matches!(DriverSettings::from_json("{"), Err(SettingsError::ParseError(_))));
    }

    #[test]
    fn test_settings_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("mcm-host-settings-{}.json", std::process::id()));
        let settings = DriverSettings {
            command_capacity: 8,
            ..DriverSettings::default()
        };
        std::fs::write(&path, settings.to_json().unwrap()).unwrap();
        assert_eq!(DriverSettings::load(&path).unwrap(), settings);
        let _ = std::fs::remove_file(&path);
    }
}
