/*!
Configuration management for the KStat backend.
*/

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};

use shared::{IvGain, PgaGain, RetryPolicy, SampleRate};

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub state: StateConfig,
    pub storage: StorageConfig,
    pub hardware: HardwareConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            device: DeviceConfig::default(),
            state: StateConfig::default(),
            storage: StorageConfig::default(),
            hardware: HardwareConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Instrument link and measurement defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial port; empty means search for a DStat board
    pub port: String,

    pub baud_rate: u32,

    /// Read timeout for handshake lines and stream chunks
    pub read_timeout_ms: u64,

    /// ADC buffer flag sent with `EA` (0 or 1)
    pub adc_buffer: u8,

    /// Used when the document carries no `samplefreq_input`
    pub sample_rate: SampleRate,

    /// Used when the document carries no `pga_gain_input`
    pub pga_gain: PgaGain,

    /// Used when the document carries no `iv_gain_input`
    pub iv_gain: IvGain,

    /// Handshake attempts before a command is given up
    pub handshake_attempts: u32,

    pub retry_delay_ms: u64,

    /// Fresh retry budgets granted to a silent device
    pub max_unresponsive_rounds: u32,
}

impl DeviceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.handshake_attempts.max(1),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_unresponsive_rounds: self.max_unresponsive_rounds.max(1),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            adc_buffer: 1,
            sample_rate: SampleRate::KHz1,
            pga_gain: PgaGain::default(),
            iv_gain: IvGain::Gain300K,
            handshake_attempts: 3,
            retry_delay_ms: 1000,
            max_unresponsive_rounds: 10,
        }
    }
}

/// Where the shared state document lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    File,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackend,

    /// Document path for the file backend
    pub path: String,

    /// How often the control loop checks for changes
    pub poll_interval_ms: u64,

    /// Pause between failed write attempts
    pub write_backoff_ms: u64,
}

impl StateConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::File,
            path: "./kstat_state.json".to_string(),
            poll_interval_ms: 50,
            write_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Result files are written here as `<measurement id>.csv`
    pub working_directory: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            working_directory: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// `stirr_speed_slider` value is divided by this before it reaches the motor
    pub stir_speed_divisor: f64,

    /// Profiler microsteps per millimetre
    pub steps_per_mm: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            stir_speed_divisor: 25.0,
            steps_per_mm: 1600.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original_config = AppConfig::new();
        original_config.device.port = "/dev/ttyACM0".to_string();
        original_config.state.backend = StateBackend::Memory;

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        // Save and load
        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(original_config, loaded_config);
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.device.baud_rate, 9600);
        assert_eq!(config.device.read_timeout_ms, 1000);
        assert_eq!(config.device.sample_rate, SampleRate::KHz1);
        assert_eq!(config.device.pga_gain.value(), 2);
        assert_eq!(config.device.iv_gain, IvGain::Gain300K);
        assert_eq!(config.device.retry_policy(), RetryPolicy::default());

        assert_eq!(config.state.backend, StateBackend::File);
        assert_eq!(config.state.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.storage.working_directory, "./data");
        assert_eq!(config.hardware.stir_speed_divisor, 25.0);
        assert_eq!(config.hardware.steps_per_mm, 1600.0);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [device]
            port = "/dev/ttyUSB1"
            sample_rate = "30Hz"
            iv_gain = "POT_GAIN_30K"

            [state]
            backend = "memory"

            [storage]

            [hardware]
            "#,
        )
        .unwrap();

        assert_eq!(config.device.port, "/dev/ttyUSB1");
        assert_eq!(config.device.sample_rate, SampleRate::Hz30);
        assert_eq!(config.device.iv_gain, IvGain::Gain30K);
        assert_eq!(config.device.baud_rate, 9600);
        assert_eq!(config.state.backend, StateBackend::Memory);
        assert_eq!(config.state.write_backoff_ms, 200);
    }

    #[test]
    fn test_rejects_unknown_gain() {
        let parsed: std::result::Result<AppConfig, _> = toml::from_str(
            "[device]\niv_gain = \"POT_GAIN_1G\"\n[state]\n[storage]\n[hardware]\n",
        );
        assert!(parsed.is_err());
    }
}
