pub mod settings;

pub use settings::{DriverSettings, SettingsError};
