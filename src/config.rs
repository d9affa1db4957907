//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/rust_eudaq.toml` by default)
//! 2. environment variables prefixed with `RUST_EUDAQ_`, nesting split on `__`
//!    (e.g. `RUST_EUDAQ_APPLICATION__LOG_LEVEL=debug`)
//!
//! Durations are written human readably (`"4s"`, `"250ms"`).
//!
//! # Example
//! ```no_run
//! use rust_eudaq::config::EudaqConfig;
//!
//! let config = EudaqConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), rust_eudaq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/rust_eudaq.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EudaqConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Run controller settings
    #[serde(default)]
    pub run_control: RunControlConfig,
    /// Data collector settings
    #[serde(default)]
    pub collector: CollectorConfig,
    /// Raw to standard event conversion settings
    #[serde(default)]
    pub conversion: ConversionConfig,
    /// Log collector settings
    #[serde(default)]
    pub log_collector: LogCollectorConfig,
    /// Producer definitions
    #[serde(default)]
    pub producers: Vec<ProducerConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Logging output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Run controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunControlConfig {
    /// Registered run controller implementation
    #[serde(default = "default_run_controller")]
    pub kind: String,
    /// Bound on a single command round trip to one component
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Bound on Terminate, including hardware release
    #[serde(with = "humantime_serde", default = "default_terminate_timeout")]
    pub terminate_timeout: Duration,
    /// Interval at which a producer run loop polls its hardware
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Bound on any single hardware call
    #[serde(with = "humantime_serde", default = "default_hardware_timeout")]
    pub hardware_timeout: Duration,
}

/// Data collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Component name reported to the run controller
    #[serde(default = "default_collector_name")]
    pub name: String,
    /// Control endpoint of an out-of-process collector; in-process when unset
    #[serde(default)]
    pub address: Option<String>,
    /// Address the data channel listens on
    #[serde(default = "default_data_address")]
    pub data_address: String,
    /// Output directory for run files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// File name pattern, `$<width>R` is the zero padded run number, `$X` the extension
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    /// Registered writer format
    #[serde(default = "default_writer")]
    pub writer: String,
    /// Bound on waiting for every stream's end-of-run event
    #[serde(with = "humantime_serde", default = "default_eore_timeout")]
    pub eore_timeout: Duration,
}

/// Conversion configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Directory receiving `Errors<run>.txt` files; failures are only logged when unset
    #[serde(default)]
    pub error_dir: Option<PathBuf>,
    /// Apply the ROC calibration factor to pixel charges
    #[serde(default = "default_enabled")]
    pub charge_calibration: bool,
}

/// Log collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogCollectorConfig {
    /// Registered log collector implementation
    #[serde(default = "default_log_collector")]
    pub kind: String,
    /// Records kept by the in-memory collector
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
    /// Output file of the file collector
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Producer definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Unique producer name
    pub name: String,
    /// Registered producer type (e.g., "CMSPixelProducer", "DRS4Producer")
    pub r#type: String,
    /// Whether this producer takes part in runs
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Control endpoint of an out-of-process producer; in-process when unset
    #[serde(default)]
    pub address: Option<String>,
    /// Producer-specific parameters
    #[serde(default)]
    pub params: toml::Table,
}

// Default value functions
fn default_app_name() -> String {
    "rust_eudaq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_run_controller() -> String {
    "default".to_string()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_terminate_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(5)
}

fn default_hardware_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_collector_name() -> String {
    "DataCollector".to_string()
}

fn default_data_address() -> String {
    "127.0.0.1:44001".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_file_pattern() -> String {
    "run$6R$X".to_string()
}

fn default_writer() -> String {
    "native".to_string()
}

fn default_eore_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_log_collector() -> String {
    "memory".to_string()
}

fn default_log_capacity() -> usize {
    10_000
}

fn default_enabled() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for RunControlConfig {
    fn default() -> Self {
        Self {
            kind: default_run_controller(),
            command_timeout: default_command_timeout(),
            terminate_timeout: default_terminate_timeout(),
            poll_interval: default_poll_interval(),
            hardware_timeout: default_hardware_timeout(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            name: default_collector_name(),
            address: None,
            data_address: default_data_address(),
            data_dir: default_data_dir(),
            file_pattern: default_file_pattern(),
            writer: default_writer(),
            eore_timeout: default_eore_timeout(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            error_dir: None,
            charge_calibration: default_enabled(),
        }
    }
}

impl Default for LogCollectorConfig {
    fn default() -> Self {
        Self {
            kind: default_log_collector(),
            capacity: default_log_capacity(),
            path: None,
        }
    }
}

impl EudaqConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(EudaqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_EUDAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(EudaqConfig::default()))
            .merge(Toml::string(text))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.run_control.command_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "run_control.command_timeout must be greater than zero".to_string(),
            ));
        }

        // The collector must give up on missing EOREs before the controller gives up on it
        if self.collector.eore_timeout >= self.run_control.command_timeout {
            return Err(DaqError::Configuration(format!(
                "collector.eore_timeout ({:?}) must be shorter than run_control.command_timeout ({:?})",
                self.collector.eore_timeout, self.run_control.command_timeout
            )));
        }

        if !self.collector.file_pattern.contains("$X") && !self.collector.file_pattern.contains('R') {
            return Err(DaqError::Configuration(format!(
                "collector.file_pattern '{}' has no run number or extension field",
                self.collector.file_pattern
            )));
        }

        // Producer names identify streams and log senders, so they must be unique
        let mut names = HashSet::new();
        names.insert(self.collector.name.as_str());
        for producer in &self.producers {
            if producer.name.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Producer of type '{}' has no name",
                    producer.r#type
                )));
            }
            if !names.insert(producer.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate component name: {}",
                    producer.name
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled producers
    pub fn enabled_producers(&self) -> Vec<&ProducerConfig> {
        self.producers.iter().filter(|p| p.enabled).collect()
    }
}

impl ProducerConfig {
    /// Producer with no parameters.
    pub fn new(name: impl Into<String>, r#type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            r#type: r#type.into(),
            enabled: true,
            address: None,
            params: toml::Table::new(),
        }
    }

    /// Set a parameter, builder style.
    pub fn with_param(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Parameter `key` converted to `T`, or `default` when missing or of the wrong type.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.params
            .get(key)
            .and_then(|value| value.clone().try_into().ok())
            .unwrap_or(default)
    }

    /// String parameter `key`, or `default`.
    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.params.get(key) {
            Some(toml::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    /// Parameters as TOML text, the Configure payload on the control channel.
    pub fn params_to_toml(&self) -> AppResult<String> {
        toml::to_string(&self.params)
            .map_err(|e| DaqError::Configuration(format!("Cannot encode parameters: {e}")))
    }

    /// Rebuild a producer configuration from a Configure payload.
    pub fn from_params_toml(name: &str, r#type: &str, text: &str) -> AppResult<Self> {
        let params: toml::Table = toml::from_str(text).map_err(|e| {
            DaqError::Configuration(format!("Invalid parameters for '{name}': {e}"))
        })?;
        Ok(Self {
            params,
            ..Self::new(name, r#type)
        })
    }
}
