//! Storage engine configuration
//!
//! Handles TOML configuration files and per-collection tunables. The node
//! server typically loads a [`StorageConfig`] from its configuration file and
//! passes it to [`crate::StorageEngine::initialize`]; collection tunables are
//! adjusted at runtime through the setinfo surface.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StorageError;
use crate::Result;

/// Complete storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding bstream data (the "data path")
    pub data_path: PathBuf,
    /// Directory holding the embedded databases (the "metadata path")
    pub meta_path: PathBuf,
    /// Worker thread counts per queue role
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Cap on simultaneously outstanding AIO submissions
    #[serde(default = "default_max_concurrent_io")]
    pub max_concurrent_io: usize,
    /// Number of preallocated open-cache entries
    #[serde(default = "default_open_cache_size")]
    pub open_cache_size: usize,
    /// Which bytestream engine services read/write lists
    #[serde(default)]
    pub bstream_engine: BstreamEngineKind,
    /// Thread-pool bytestream engine tuning
    #[serde(default)]
    pub directio: DirectIoConfig,
}

impl StorageConfig {
    pub fn new(data_path: impl Into<PathBuf>, meta_path: impl Into<PathBuf>) -> Self {
        StorageConfig {
            data_path: data_path.into(),
            meta_path: meta_path.into(),
            workers: WorkerConfig::default(),
            max_concurrent_io: default_max_concurrent_io(),
            open_cache_size: default_open_cache_size(),
            bstream_engine: BstreamEngineKind::default(),
            directio: DirectIoConfig::default(),
        }
    }
}

/// Worker thread counts for the four operation queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_meta_workers")]
    pub meta_read: usize,
    #[serde(default = "default_meta_workers")]
    pub meta_write: usize,
    #[serde(default = "default_io_workers")]
    pub io: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            meta_read: default_meta_workers(),
            meta_write: default_meta_workers(),
            io: default_io_workers(),
        }
    }
}

fn default_meta_workers() -> usize {
    (num_cpus::get() / 4).max(1)
}

fn default_io_workers() -> usize {
    (num_cpus::get() / 2).max(1)
}

fn default_max_concurrent_io() -> usize {
    16
}

fn default_open_cache_size() -> usize {
    64
}

/// Bytestream engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BstreamEngineKind {
    /// Kernel AIO with batch submission and a completion reaper
    #[default]
    Aio,
    /// Explicit thread pool with per-handle queues and direct-I/O support
    Threaded,
}

/// Tuning for the thread-pool bytestream engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectIoConfig {
    /// Number of I/O threads in the pool
    #[serde(default = "default_directio_threads")]
    pub threads: usize,
    /// Slices handed out per wakeup before rechecking the handle queues
    #[serde(default = "default_directio_ops_per_queue")]
    pub ops_per_queue: usize,
    /// Idle wait in milliseconds before a pool thread rechecks for work
    #[serde(default = "default_directio_timeout_ms")]
    pub timeout_ms: u64,
    /// Open backing files with O_DIRECT
    #[serde(default)]
    pub direct: bool,
}

impl Default for DirectIoConfig {
    fn default() -> Self {
        DirectIoConfig {
            threads: default_directio_threads(),
            ops_per_queue: default_directio_ops_per_queue(),
            timeout_ms: default_directio_timeout_ms(),
            direct: false,
        }
    }
}

fn default_directio_threads() -> usize {
    num_cpus::get().clamp(2, 30)
}

fn default_directio_ops_per_queue() -> usize {
    10
}

fn default_directio_timeout_ms() -> u64 {
    1000
}

/// Parse a TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<StorageConfig> {
    let contents = std::fs::read_to_string(path)?;
    parse_toml_string(&contents)
}

/// Parse TOML configuration from a string
pub fn parse_toml_string(contents: &str) -> Result<StorageConfig> {
    toml::from_str(contents).map_err(|_| StorageError::Invalid)
}

/// Per-collection tunables, adjusted via [`CollectionSetInfo`].
#[derive(Debug, Clone)]
pub struct CollectionOptions {
    /// Force a coalesced sync once this many operations are waiting
    pub high_watermark: usize,
    /// Sync immediately while fewer than this many sync-required operations
    /// are outstanding
    pub low_watermark: usize,
    /// Whether metadata modifications sync their database at all
    pub meta_sync_enabled: bool,
    /// Service eligible metadata operations in the caller's thread
    pub immediate_completion: bool,
    /// Attribute cache sizing
    pub attr_cache_size: usize,
    pub attr_cache_max_num_elems: usize,
    /// Keyval keywords the attribute cache is allowed to shadow
    pub attr_cache_keywords: Vec<String>,
    /// Handle ranges this collection may mint (recorded for the allocator)
    pub handle_ranges: Vec<(u128, u128)>,
    /// How long a freed handle stays unreusable
    pub handle_timeout: Duration,
    /// Direct-I/O pool overrides recorded via setinfo; the pool reads them
    /// on its next start
    pub directio_threads: Option<usize>,
    pub directio_ops_per_queue: Option<usize>,
    pub directio_timeout_ms: Option<u64>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            high_watermark: 8,
            low_watermark: 1,
            meta_sync_enabled: true,
            immediate_completion: false,
            attr_cache_size: 511,
            attr_cache_max_num_elems: 1024,
            attr_cache_keywords: Vec::new(),
            handle_ranges: Vec::new(),
            handle_timeout: Duration::from_secs(360),
            directio_threads: None,
            directio_ops_per_queue: None,
            directio_timeout_ms: None,
        }
    }
}

/// Collection configuration options for the setinfo surface.
#[derive(Debug, Clone)]
pub enum CollectionSetInfo {
    HandleRanges(Vec<(u128, u128)>),
    HandleTimeout(Duration),
    AttrCacheKeywords(Vec<String>),
    AttrCacheSize(usize),
    AttrCacheMaxNumElems(usize),
    AttrCacheInitialize,
    CoalescingHighWatermark(usize),
    CoalescingLowWatermark(usize),
    MetaSyncEnabled(bool),
    ImmediateCompletionEnabled(bool),
    DirectIoThreadNum(usize),
    DirectIoOpsPerQueue(usize),
    DirectIoTimeout(u64),
}

/// Filesystem statistics returned by getinfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub fs_id: crate::CollId,
    pub bytes_total: u64,
    pub bytes_available: u64,
}
