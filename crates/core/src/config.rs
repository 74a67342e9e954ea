//! Configuration types shared across crates.

use crate::context::{FetchContext, FetchContextBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Local block store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-memory store, lost on exit.
    Memory,
    /// Blocks stored as files under a root directory.
    Filesystem {
        /// Root directory for blocks.
        path: PathBuf,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Filesystem {
            path: PathBuf::from("./data/blocks"),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StoreConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("filesystem store requires a non-empty path".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Temporary buffer allocation limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Directory for disk-backed buffers. Defaults to the system temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Largest size hint that may start in memory.
    #[serde(default = "default_max_ram_bucket_size")]
    pub max_ram_bucket_size: u64,
    /// Ceiling on bytes held by all memory-backed buffers.
    #[serde(default = "default_max_ram_total")]
    pub max_ram_total: u64,
    /// Memory-backed buffers older than this are moved to disk by the sweep.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// A memory buffer migrates once it grows past this multiple of
    /// `max_ram_bucket_size`.
    #[serde(default = "default_conversion_factor")]
    pub conversion_factor: u64,
    /// How often the age sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_ram_bucket_size() -> u64 {
    32 * 1024
}

fn default_max_ram_total() -> u64 {
    16 * 1024 * 1024
}

fn default_max_age_secs() -> u64 {
    300
}

fn default_conversion_factor() -> u64 {
    4
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            max_ram_bucket_size: default_max_ram_bucket_size(),
            max_ram_total: default_max_ram_total(),
            max_age_secs: default_max_age_secs(),
            conversion_factor: default_conversion_factor(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl BucketConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Size at which a growing memory buffer is forced to disk.
    pub fn migration_threshold(&self) -> u64 {
        self.max_ram_bucket_size
            .saturating_mul(self.conversion_factor)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.conversion_factor == 0 {
            return Err("buckets.conversion_factor must be at least 1".to_string());
        }
        if self.max_ram_bucket_size > self.max_ram_total {
            return Err(format!(
                "buckets.max_ram_bucket_size ({}) exceeds buckets.max_ram_total ({})",
                self.max_ram_bucket_size, self.max_ram_total
            ));
        }
        Ok(())
    }

    /// Small limits and a private temp dir.
    ///
    /// **For testing only.**
    pub fn for_testing(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: Some(temp_dir.into()),
            max_ram_bucket_size: 1024,
            max_ram_total: 64 * 1024,
            max_age_secs: 300,
            conversion_factor: 4,
            sweep_interval_secs: 1,
        }
    }
}

/// Request starter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Block operations allowed in flight at once.
    #[serde(default = "default_max_concurrent_blocks")]
    pub max_concurrent_blocks: usize,
    /// How long the starter waits for new work before polling again.
    #[serde(default = "default_idle_poll_millis")]
    pub idle_poll_millis: u64,
}

fn default_max_concurrent_blocks() -> usize {
    32
}

fn default_idle_poll_millis() -> u64 {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_blocks: default_max_concurrent_blocks(),
            idle_poll_millis: default_idle_poll_millis(),
        }
    }
}

impl SchedulerConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_millis)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_blocks == 0 {
            return Err("scheduler.max_concurrent_blocks must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Store lookahead checker limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Cap on keys from persistent requests queued for a store check.
    #[serde(default = "default_max_persistent_keys")]
    pub max_persistent_keys: usize,
    /// Pending key deliveries above which the checker pauses entirely.
    #[serde(default = "default_trip_queue_high")]
    pub trip_queue_high: usize,
    /// Pending key deliveries above which persistent checks are skipped.
    #[serde(default = "default_trip_queue_low")]
    pub trip_queue_low: usize,
    /// Pause when over `trip_queue_high`.
    #[serde(default = "default_overload_backoff_millis")]
    pub overload_backoff_millis: u64,
    /// Wait for new work when every queue is empty.
    #[serde(default = "default_idle_wait_secs")]
    pub idle_wait_secs: u64,
}

fn default_max_persistent_keys() -> usize {
    1024
}

fn default_trip_queue_high() -> usize {
    500
}

fn default_trip_queue_low() -> usize {
    100
}

fn default_overload_backoff_millis() -> u64 {
    10_000
}

fn default_idle_wait_secs() -> u64 {
    100
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_persistent_keys: default_max_persistent_keys(),
            trip_queue_high: default_trip_queue_high(),
            trip_queue_low: default_trip_queue_low(),
            overload_backoff_millis: default_overload_backoff_millis(),
            idle_wait_secs: default_idle_wait_secs(),
        }
    }
}

impl CheckerConfig {
    pub fn overload_backoff(&self) -> Duration {
        Duration::from_millis(self.overload_backoff_millis)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_secs(self.idle_wait_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.trip_queue_low > self.trip_queue_high {
            return Err(format!(
                "checker.trip_queue_low ({}) exceeds checker.trip_queue_high ({})",
                self.trip_queue_low, self.trip_queue_high
            ));
        }
        Ok(())
    }

    /// Short waits so tests do not stall.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            overload_backoff_millis: 20,
            idle_wait_secs: 1,
            ..Self::default()
        }
    }
}

/// Defaults for the top-level fetch context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchDefaults {
    #[serde(default = "default_max_output_length")]
    pub max_output_length: u64,
    #[serde(default = "default_max_output_length")]
    pub max_temp_length: u64,
    #[serde(default = "default_max_metadata_size")]
    pub max_metadata_size: u64,
    #[serde(default = "default_max_recursion_level")]
    pub max_recursion_level: u32,
    #[serde(default = "default_max_archive_levels")]
    pub max_archive_levels: u32,
    #[serde(default = "default_max_path_components")]
    pub max_path_components: usize,
    #[serde(default)]
    pub dont_enter_implicit_archives: bool,
    #[serde(default)]
    pub local_request_only: bool,
    /// Restrict results to these MIME types. Empty means unrestricted.
    #[serde(default)]
    pub allowed_mime_types: Vec<String>,
}

fn default_max_output_length() -> u64 {
    crate::DEFAULT_MAX_OUTPUT_LENGTH
}

fn default_max_metadata_size() -> u64 {
    crate::DEFAULT_MAX_METADATA_SIZE
}

fn default_max_recursion_level() -> u32 {
    10
}

fn default_max_archive_levels() -> u32 {
    4
}

fn default_max_path_components() -> usize {
    64
}

impl Default for FetchDefaults {
    fn default() -> Self {
        Self {
            max_output_length: default_max_output_length(),
            max_temp_length: default_max_output_length(),
            max_metadata_size: default_max_metadata_size(),
            max_recursion_level: default_max_recursion_level(),
            max_archive_levels: default_max_archive_levels(),
            max_path_components: default_max_path_components(),
            dont_enter_implicit_archives: false,
            local_request_only: false,
            allowed_mime_types: Vec::new(),
        }
    }
}

impl FetchDefaults {
    /// Builder preloaded with these defaults.
    pub fn builder(&self) -> FetchContextBuilder {
        let builder = FetchContext::builder()
            .max_output_length(self.max_output_length)
            .max_temp_length(self.max_temp_length.max(self.max_output_length))
            .max_metadata_size(self.max_metadata_size)
            .max_recursion_level(self.max_recursion_level)
            .max_archive_levels(self.max_archive_levels)
            .max_path_components(self.max_path_components)
            .dont_enter_implicit_archives(self.dont_enter_implicit_archives)
            .local_request_only(self.local_request_only);
        if self.allowed_mime_types.is_empty() {
            builder
        } else {
            builder.allowed_mime_types(self.allowed_mime_types.iter().cloned())
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_output_length == 0 {
            return Err("fetch.max_output_length must be positive".to_string());
        }
        if self.max_metadata_size == 0 {
            return Err("fetch.max_metadata_size must be positive".to_string());
        }
        Ok(())
    }
}

/// Where persistent request snapshots are kept.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PersistenceConfig {
    /// Snapshots live only for the life of the process.
    #[default]
    Memory,
    /// Snapshots are written to a JSON file.
    File {
        path: PathBuf,
    },
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Log every metadata transition at info level.
    #[serde(default)]
    pub trace_resolver: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            trace_resolver: false,
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub buckets: BucketConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub checker: CheckerConfig,
    #[serde(default)]
    pub fetch: FetchDefaults,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.store.validate()?;
        self.buckets.validate()?;
        self.scheduler.validate()?;
        self.checker.validate()?;
        self.fetch.validate()?;
        Ok(())
    }

    /// In-memory store and persistence with small buffers under `dir`.
    ///
    /// **For testing only.**
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::Memory,
            buckets: BucketConfig::for_testing(dir),
            scheduler: SchedulerConfig::default(),
            checker: CheckerConfig::for_testing(),
            fetch: FetchDefaults::default(),
            persistence: PersistenceConfig::Memory,
            logging: LoggingConfig::default(),
        }
    }
}
