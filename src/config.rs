// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// TOML file parsing with environment variable overrides (PERFSTORE_ prefix,
// nested keys separated by `__`) and validation after extraction.
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::*;

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the storage engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// General engine settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Global buffer pool
    #[serde(default)]
    pub buffers: BufferConfig,

    /// Pooled input stream tuning
    #[serde(default)]
    pub streams: StreamConfig,

    /// Storage writer and channel files
    #[serde(default)]
    pub storage: StorageConfig,

    /// Aggregation ahead of the storage writer
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Aggregation ahead of the persistence store
    #[serde(default)]
    pub live_aggregation: LiveAggregationConfig,

    /// Agent listener
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StoreConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PERFSTORE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, message: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.into(),
                message: message.into(),
            }
        }

        if self.buffers.buffer_size == 0 {
            return Err(invalid("buffers.buffer_size", "Buffer size must be positive"));
        }
        if self.buffers.max_buffers < MIN_STREAM_BUFFERS {
            return Err(ConfigError::InvalidValue {
                field: "buffers.max_buffers".into(),
                message: format!("Pool must hold at least {} buffers", MIN_STREAM_BUFFERS),
            });
        }
        if self.buffers.acquire_attempts == 0 {
            return Err(invalid("buffers.acquire_attempts", "At least one attempt is required"));
        }
        if self.streams.max_buffer_tries == 0 {
            return Err(invalid("streams.max_buffer_tries", "At least one try is required"));
        }
        if self.storage.write_threads == 0 {
            return Err(invalid("storage.write_threads", "At least one writer thread is required"));
        }
        if self.storage.io_threads == 0 {
            return Err(invalid("storage.io_threads", "At least one IO thread is required"));
        }
        if self.streams.producer_threads == 0 {
            return Err(invalid("streams.producer_threads", "At least one producer thread is required"));
        }
        if self.aggregation.aggregation_period_millis <= 0 {
            return Err(invalid(
                "aggregation.aggregation_period_millis",
                "Aggregation period must be positive",
            ));
        }
        if self.aggregation.max_elements == 0 {
            return Err(invalid("aggregation.max_elements", "Cache capacity must be positive"));
        }
        if self.live_aggregation.aggregation_period_millis <= 0 {
            return Err(invalid(
                "live_aggregation.aggregation_period_millis",
                "Aggregation period must be positive",
            ));
        }
        if self.live_aggregation.max_elements == 0 {
            return Err(invalid("live_aggregation.max_elements", "Cache capacity must be positive"));
        }
        if self.live_aggregation.sleep_between_sweeps_millis == 0 {
            return Err(invalid(
                "live_aggregation.sleep_between_sweeps_millis",
                "Sweep interval must be positive",
            ));
        }
        if self.ingest.max_record_size == 0 {
            return Err(invalid("ingest.max_record_size", "Record size limit must be positive"));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name reported in logs and storage descriptors
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Upper bound for draining writes on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    STORE_NAME.into()
}

fn default_shutdown_timeout() -> u64 {
    30
}

// ----------------------------------------------------------------------------
// Buffer Pool Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Capacity of one buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum number of buffers the pool allocates
    #[serde(default = "default_max_buffers")]
    pub max_buffers: usize,

    /// Acquire attempts before the pool reports exhaustion
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,

    /// Pause between acquire attempts
    #[serde(default = "default_acquire_retry_interval")]
    pub acquire_retry_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_buffers: default_max_buffers(),
            acquire_attempts: default_acquire_attempts(),
            acquire_retry_interval_ms: default_acquire_retry_interval(),
        }
    }
}

impl BufferConfig {
    pub fn acquire_retry_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_interval_ms)
    }
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_max_buffers() -> usize {
    DEFAULT_MAX_BUFFERS
}

fn default_acquire_attempts() -> u32 {
    DEFAULT_ACQUIRE_ATTEMPTS
}

fn default_acquire_retry_interval() -> u64 {
    DEFAULT_ACQUIRE_RETRY_INTERVAL_MS
}

// ----------------------------------------------------------------------------
// Stream Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Buffers per input stream, clamped to [2, 5] when used
    #[serde(default = "default_number_of_buffers")]
    pub number_of_buffers: usize,

    /// Buffer swap attempts before a stream fails
    #[serde(default = "default_max_buffer_tries")]
    pub max_buffer_tries: u32,

    /// Wait per swap attempt
    #[serde(default = "default_buffer_poll_interval")]
    pub buffer_poll_interval_ms: u64,

    /// Threads filling socket-backed streams, apart from the storage IO pool
    #[serde(default = "default_producer_threads")]
    pub producer_threads: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            number_of_buffers: default_number_of_buffers(),
            max_buffer_tries: default_max_buffer_tries(),
            buffer_poll_interval_ms: default_buffer_poll_interval(),
            producer_threads: default_producer_threads(),
        }
    }
}

impl StreamConfig {
    /// Buffer count actually used by a stream
    pub fn effective_buffer_count(&self) -> usize {
        self.number_of_buffers.clamp(MIN_STREAM_BUFFERS, MAX_STREAM_BUFFERS)
    }

    pub fn buffer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_poll_interval_ms)
    }
}

fn default_number_of_buffers() -> usize {
    3
}

fn default_max_buffer_tries() -> u32 {
    DEFAULT_MAX_BUFFER_TRIES
}

fn default_buffer_poll_interval() -> u64 {
    DEFAULT_BUFFER_POLL_INTERVAL_MS
}

fn default_producer_threads() -> usize {
    4
}

// ----------------------------------------------------------------------------
// Storage Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one folder per storage
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Bytes a storage may hold before writes are refused (0 = unlimited)
    #[serde(default)]
    pub max_storage_bytes: u64,

    /// Write task executor threads, also the serializer count
    #[serde(default = "default_write_threads")]
    pub write_threads: usize,

    /// Threads for channel writes and disk reads
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    /// Bounded wait for a serializer
    #[serde(default = "default_serializer_wait")]
    pub serializer_wait_ms: u64,

    /// Cadence of the writing status check
    #[serde(default = "default_status_check_interval")]
    pub status_check_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            max_storage_bytes: 0,
            write_threads: default_write_threads(),
            io_threads: default_io_threads(),
            serializer_wait_ms: default_serializer_wait(),
            status_check_interval_secs: default_status_check_interval(),
        }
    }
}

impl StorageConfig {
    pub fn serializer_wait(&self) -> Duration {
        Duration::from_millis(self.serializer_wait_ms)
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./storage")
}

fn default_write_threads() -> usize {
    4
}

fn default_io_threads() -> usize {
    2
}

fn default_serializer_wait() -> u64 {
    DEFAULT_SERIALIZER_WAIT_MS
}

fn default_status_check_interval() -> u64 {
    DEFAULT_STATUS_CHECK_INTERVAL_SECS
}

// ----------------------------------------------------------------------------
// Aggregation Configuration
// ----------------------------------------------------------------------------

/// Storage-path aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Aggregate timer records before writing them
    #[serde(default)]
    pub enabled: bool,

    /// Bucket width
    #[serde(default = "default_aggregation_period")]
    pub aggregation_period_millis: i64,

    /// Live entries before the oldest is evicted
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            aggregation_period_millis: default_aggregation_period(),
            max_elements: default_max_elements(),
        }
    }
}

/// Live-path aggregation feeding the persistence store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveAggregationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_aggregation_period")]
    pub aggregation_period_millis: i64,

    #[serde(default = "default_max_elements")]
    pub max_elements: usize,

    /// Cadence of the background flush
    #[serde(default = "default_sweep_interval")]
    pub sleep_between_sweeps_millis: u64,
}

impl Default for LiveAggregationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            aggregation_period_millis: default_aggregation_period(),
            max_elements: default_max_elements(),
            sleep_between_sweeps_millis: default_sweep_interval(),
        }
    }
}

impl LiveAggregationConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_between_sweeps_millis)
    }
}

fn default_aggregation_period() -> i64 {
    DEFAULT_AGGREGATION_PERIOD_MS
}

fn default_max_elements() -> usize {
    DEFAULT_MAX_ELEMENTS
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Ingestion Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Address the agent listener binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Largest accepted frame
    #[serde(default = "default_max_record_size")]
    pub max_record_size: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            max_record_size: default_max_record_size(),
        }
    }
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.into()
}

fn default_max_record_size() -> u64 {
    MAX_RECORD_SIZE
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
