//! # Observer Stats - Cluster Performance Time-Series Engine
//!
//! Turns the periodic performance snapshots collected from every node of a
//! storage cluster into analysis-ready JSON time series for the observer
//! dashboard.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          OBSERVER STATS ENGINE                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SNAPSHOT → DECODER → STATS ENGINE → METRIC SERIES (STATS DB)                │
//! │                                            │                                 │
//! │                 dump: NORMALIZE → MERGE (ROLL-UPS) → COMPACT → JSON FILES    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Counter-to-rate conversion** with reset detection and divisor-weighted rates
//! - **Dynamic registry** keyed by identity tuples with lazily built metadata
//! - **Grid normalization** so series sampled at different instants line up
//! - **Cluster roll-ups** by sum, IOPS-weighted latency, or static concatenation
//! - **Thumbnails** bounded to a fixed number of points for dashboard previews
//! - **Sharded ingestion** across worker threads with a single merge barrier

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

// ----------------------------------------------------------------------------
// Channels
// ----------------------------------------------------------------------------
use flume::Sender as FlumeSender;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::{format_compact, CompactString};
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, trace, warn};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, TimeZone, Utc};

// ----------------------------------------------------------------------------
// Filesystem
// ----------------------------------------------------------------------------
use tempfile::NamedTempFile;

// ----------------------------------------------------------------------------
// Configuration & Validation
// ----------------------------------------------------------------------------
use figment::providers::{Format, Toml};
use figment::Figment;
use validator::Validate;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "observer-stats";

// ----------------------------------------------------------------------------
// Grid & Thumbnails
// ----------------------------------------------------------------------------

/// Canonical grid resolution used to align series from different hosts.
pub const DEFAULT_GRID_INTERVAL_SECS: i64 = 60;

/// Default number of points in a thumbnail document.
pub const DEFAULT_THUMBNAIL_POINTS: usize = 60;

/// Lower bound on elapsed time when converting a delta into a per-second rate.
/// Timestamps are whole seconds, so this only matters for repeated timestamps.
pub const RATE_EPSILON_SECS: f64 = 1.0;

// ----------------------------------------------------------------------------
// Output Layout
// ----------------------------------------------------------------------------

pub const DEFAULT_OUTPUT_ROOT: &str = "jsonstats";
pub const TIMERANGE_FILE: &str = "timerange.json";
pub const THUMBNAIL_SUFFIX: &str = "_thumb";
pub const ROLLUP_GROUP: &str = "cluster";

// ----------------------------------------------------------------------------
// Display Groups
// ----------------------------------------------------------------------------

pub const DOM_GROUP: &str = "dom";
pub const LSOM_GROUP: &str = "lsom";
pub const CPU_GROUP: &str = "cpu";
pub const WORLDLET_GROUP: &str = "worldlets";
pub const NETWORK_GROUP: &str = "network";
pub const CAPACITY_GROUP: &str = "capacity";
pub const CMMDS_GROUP: &str = "cmmds";
pub const INVENTORY_GROUP: &str = "inventory";

// ----------------------------------------------------------------------------
// Snapshot Layout
// ----------------------------------------------------------------------------

/// Suffix of the sibling field carrying a counter group's collection time.
pub const TAKEN_SUFFIX: &str = "-taken";

/// Latest collection time accepted from a snapshot (9999-12-31T23:59:59Z).
pub const MAX_TIMESTAMP_SECS: i64 = 253_402_300_799;

/// How far a group's `-taken` time may sit from its record's timestamp.
pub const MAX_TAKEN_SKEW_SECS: i64 = 3600;

/// CMMDS entry type describing one component of an object.
pub const LSOM_OBJECT_TYPE: &str = "LSOM_OBJECT";

// ----------------------------------------------------------------------------
// Sharding
// ----------------------------------------------------------------------------

pub const DEFAULT_SHARD_CHANNEL_CAPACITY: usize = 64;
pub const MAX_SHARDS: usize = 256;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Epoch Seconds
// ----------------------------------------------------------------------------

/// Sample time in whole seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0
    }

    /// Round down to the start of the enclosing interval.
    pub fn floor_to_interval(&self, interval_secs: i64) -> Self {
        if interval_secs <= 0 {
            return *self;
        }
        Self(self.0.saturating_sub(self.0.rem_euclid(interval_secs)))
    }

    /// Round up to the next interval boundary (identity when already aligned).
    pub fn ceil_to_interval(&self, interval_secs: i64) -> Self {
        let floor = self.floor_to_interval(interval_secs);
        if interval_secs <= 0 || floor.0 == self.0 {
            floor
        } else {
            Self(floor.0.saturating_add(interval_secs))
        }
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0).single().unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(secs: i64) -> Self {
        Self(secs)
    }
}

impl From<Timestamp> for i64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ----------------------------------------------------------------------------
// 3.2 Time Range - Span Covered By An Analysis Run
// ----------------------------------------------------------------------------

/// First and last snapshot timestamps seen, written out as `timerange.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(rename = "firstTS")]
    pub first_ts: Option<i64>,
    #[serde(rename = "lastTS")]
    pub last_ts: Option<i64>,
}

impl TimeRange {
    pub fn observe(&mut self, ts: i64) {
        self.first_ts = Some(self.first_ts.map_or(ts, |first| first.min(ts)));
        self.last_ts = Some(self.last_ts.map_or(ts, |last| last.max(ts)));
    }

    pub fn merge(&mut self, other: &TimeRange) {
        if let Some(first) = other.first_ts {
            self.observe(first);
        }
        if let Some(last) = other.last_ts {
            self.observe(last);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first_ts.is_none()
    }
}

// ----------------------------------------------------------------------------
// 3.3 Stats Key - Entity Identity
// ----------------------------------------------------------------------------

/// Identity of one entity's set of related metrics, e.g. `["host-01", "dom.client"]`.
///
/// The parts are opaque to the registry; callers pick whatever tuple uniquely
/// names the entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatsKey(SmallVec<[CompactString; 4]>);

impl StatsKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    #[inline]
    pub fn parts(&self) -> &[CompactString] {
        &self.0
    }

    pub fn part(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).map(CompactString::as_str)
    }
}

impl Display for StatsKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (idx, part) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("/")?;
            }
            f.write_str(part)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Sample Point & Series Field
// ----------------------------------------------------------------------------

/// The delta/rate pair computed for the most recent sample of a series.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SamplePoint {
    pub delta: f64,
    pub rate: f64,
}

/// Selects one of the value sequences held by a [`MetricSeries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeriesField {
    Rates,
    Deltas,
    RawTotals,
}

/// Replace characters that are unsafe in a file name.
pub fn sanitize_file_stem(raw: &str) -> CompactString {
    let mut out = CompactString::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.chars().all(|c| c == '.') {
        out = CompactString::from("_");
    }
    out
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every stage of the engine. Only dump I/O and configuration
// problems are fatal; everything raised while ingesting snapshot data is
// downgraded to an ingest warning by the engine.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the stats engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Series error: {0}")]
    Series(#[from] SeriesError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Dump error: {0}")]
    Dump(#[from] DumpError),

    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Config(_) => false,
            EngineError::Series(_) => true,
            EngineError::Decode(_) => true,
            EngineError::Dump(e) => e.is_recoverable(),
            EngineError::Shard(_) => false,
            EngineError::Io(_) => true,
            EngineError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Series(_) => "series",
            EngineError::Decode(_) => "decode",
            EngineError::Dump(_) => "dump",
            EngineError::Shard(_) => "shard",
            EngineError::Io(_) => "io",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            EngineError::Config(_) => RecoveryHint::FixConfiguration,
            EngineError::Series(_) | EngineError::Decode(_) => RecoveryHint::Skip,
            EngineError::Dump(e) => e.recovery_hint(),
            EngineError::Shard(_) | EngineError::Internal(_) => RecoveryHint::None,
            EngineError::Io(_) => RecoveryHint::RetryDump,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Run the whole dump again
    RetryDump,
    /// Skip this item and continue
    Skip,
    /// Fix configuration and restart
    FixConfiguration,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Series Errors
// ----------------------------------------------------------------------------

/// Rejected samples. The series is left untouched when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeriesError {
    #[error("sample at {timestamp} is older than the last sample at {last_timestamp}")]
    OutOfOrder { timestamp: i64, last_timestamp: i64 },

    #[error("non-finite value {value} at {timestamp}")]
    NonFinite { timestamp: i64, value: f64 },
}

impl SeriesError {
    pub fn warning_kind(&self) -> WarningKind {
        match self {
            SeriesError::OutOfOrder { .. } => WarningKind::OutOfOrderSample,
            SeriesError::NonFinite { .. } => WarningKind::InvalidValue,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Decode Errors
// ----------------------------------------------------------------------------

/// Errors raised while decoding snapshot records.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid snapshot record: {0}")]
    Record(#[source] serde_json::Error),

    #[error("malformed section '{section}' for '{entity}': {message}")]
    MalformedSection {
        entity: String,
        section: String,
        message: String,
    },
}

// ----------------------------------------------------------------------------
// 4.5 Dump Errors
// ----------------------------------------------------------------------------

/// Errors from the serializer. Any of these aborts the current dump; files
/// finished before the failure stay complete.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("dump cancelled after {files_written} files")]
    Cancelled { files_written: usize },
}

impl DumpError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            DumpError::CreateDir { .. } | DumpError::Io { .. } => true,
            DumpError::Serialize { .. } => false,
            DumpError::Cancelled { .. } => true,
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        if self.is_recoverable() {
            RecoveryHint::RetryDump
        } else {
            RecoveryHint::None
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Shard Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("shard {shard} worker panicked")]
    WorkerPanicked { shard: usize },

    #[error("shard {shard} channel closed")]
    ChannelClosed { shard: usize },
}

// ----------------------------------------------------------------------------
// 4.7 Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for series mutations
pub type SeriesResult<T> = Result<T, SeriesError>;

/// Result type for dump operations
pub type DumpResult<T> = Result<T, DumpError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML configuration with defaults for every field, validated on load.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for one analysis run
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct EngineConfig {
    /// Stats engine settings
    #[serde(default)]
    #[validate]
    pub stats: StatsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| ConfigError::ParseError {
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
        <Self as Validate>::validate(self).map_err(|e| ConfigError::ValidationFailed {
            message: e.to_string(),
        })?;

        if Path::new(&self.stats.output_root).is_absolute() || self.stats.output_root.contains("..") {
            return Err(ConfigError::invalid_value(
                "stats.output_root",
                "must be a relative path inside the dump directory",
            ));
        }

        for (idx, rule) in self.stats.rollups.iter().enumerate() {
            if rule.source_group.is_empty() || rule.file.is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("stats.rollups[{}]", idx),
                    "source_group and file must not be empty",
                ));
            }
            for (metric, strategy) in &rule.metrics {
                if let MergeStrategy::WeightedAverage { divisor } = strategy {
                    if divisor.is_empty() {
                        return Err(ConfigError::invalid_value(
                            format!("stats.rollups[{}].metrics.{}", idx, metric),
                            "weighted_average needs a divisor metric",
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.2 Stats Engine Configuration
// ----------------------------------------------------------------------------

/// Settings for accumulation, roll-ups and dumping
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StatsConfig {
    /// Canonical grid resolution in seconds
    #[serde(default = "default_grid_interval")]
    #[validate(range(min = 1, max = 3600))]
    pub grid_interval_secs: i64,

    /// Maximum points per series in thumbnail documents
    #[serde(default = "default_thumbnail_points")]
    #[validate(range(min = 1, max = 100000))]
    pub thumbnail_points: usize,

    /// Directory (relative to the dump directory) holding all documents
    #[serde(default = "default_output_root")]
    #[validate(length(min = 1))]
    pub output_root: String,

    /// Number of ingest shards (0 = one per available CPU)
    #[serde(default)]
    #[validate(range(max = 256))]
    pub shards: usize,

    /// Bounded channel capacity per shard worker
    #[serde(default = "default_shard_channel_capacity")]
    #[validate(range(min = 1))]
    pub shard_channel_capacity: usize,

    /// Drop series buffers (keeping keys and cursors) after a successful dump
    #[serde(default)]
    pub trim_after_dump: bool,

    /// Emit cluster roll-up documents
    #[serde(default = "default_true")]
    pub rollups_enabled: bool,

    /// Roll-up definitions
    #[serde(default = "default_rollup_rules")]
    pub rollups: Vec<RollupRule>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            grid_interval_secs: default_grid_interval(),
            thumbnail_points: default_thumbnail_points(),
            output_root: default_output_root(),
            shards: 0,
            shard_channel_capacity: default_shard_channel_capacity(),
            trim_after_dump: false,
            rollups_enabled: true,
            rollups: default_rollup_rules(),
        }
    }
}

impl StatsConfig {
    /// Get effective shard count (auto-detect if 0)
    pub fn effective_shards(&self) -> usize {
        if self.shards == 0 {
            num_cpus().min(MAX_SHARDS)
        } else {
            self.shards.min(MAX_SHARDS)
        }
    }
}

fn default_grid_interval() -> i64 {
    DEFAULT_GRID_INTERVAL_SECS
}

fn default_thumbnail_points() -> usize {
    DEFAULT_THUMBNAIL_POINTS
}

fn default_output_root() -> String {
    DEFAULT_OUTPUT_ROOT.into()
}

fn default_shard_channel_capacity() -> usize {
    DEFAULT_SHARD_CHANNEL_CAPACITY
}

fn default_true() -> bool {
    true
}

/// Helper to get number of CPUs
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

// ----------------------------------------------------------------------------
// 5.3 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Extra filter directives, e.g. "observer_stats=debug"
    #[serde(default)]
    pub directives: Option<String>,

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
            directives: None,
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

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Output layout of the `fmt` layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
    Pretty,
}

impl LogFormat {
    /// Unknown names fall back to `Pretty`.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

impl LoggingConfig {
    /// Default level for targets without a directive. Unknown names mean INFO.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            "off" => LevelFilter::OFF,
            _ => LevelFilter::INFO,
        }
    }

    pub fn log_format(&self) -> LogFormat {
        LogFormat::from_name(&self.format)
    }

    /// The level plus any extra directives. Directives that fail to parse are
    /// dropped.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.level_filter().into())
            .parse_lossy(self.directives.as_deref().unwrap_or_default())
    }
}

/// Install the global subscriber described by `config`. Fails when a global
/// subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> EngineResult<()> {
    let fmt_layer = match config.log_format() {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(config.env_filter());
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "observer::init",
        level = %config.level,
        format = %config.format,
        version = ENGINE_VERSION,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: METRIC SERIES & COUNTER-TO-RATE CONVERSION
// ============================================================================
// One named counter or gauge history for one entity:
// - Raw totals as received
// - Per-interval deltas with reset detection
// - Per-second or per-divisor rates
// - A cursor that survives trimming
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Metric Series
// ----------------------------------------------------------------------------

/// History of one metric for one entity.
///
/// The four buffers are always the same length. Deltas are never negative: a
/// raw value below the previous one is treated as a counter reset and yields
/// a delta of zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSeries {
    times: Vec<i64>,
    raw_totals: Vec<f64>,
    deltas: Vec<f64>,
    rates: Vec<f64>,
    last_raw_value: Option<f64>,
    last_timestamp: Option<i64>,
    last_point: Option<SamplePoint>,
}

impl MetricSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cumulative counter sample.
    ///
    /// Without a divisor the rate is the delta per elapsed second. With a
    /// divisor the rate is the delta per divisor unit, which is how average
    /// latency is derived from a latency sum and an operation count.
    pub fn add(&mut self, timestamp: i64, raw: f64, divisor: Option<f64>) -> SeriesResult<SamplePoint> {
        self.check_sample(timestamp, raw)?;
        if let Some(d) = divisor {
            if !d.is_finite() {
                return Err(SeriesError::NonFinite { timestamp, value: d });
            }
        }

        let delta = match self.last_raw_value {
            Some(prev) if prev <= raw => raw - prev,
            _ => 0.0,
        };

        let rate = match divisor {
            Some(d) if d == 0.0 => 0.0,
            Some(d) => delta / d,
            None => match self.last_timestamp {
                Some(prev_ts) => delta / (timestamp.saturating_sub(prev_ts) as f64).max(RATE_EPSILON_SECS),
                None => 0.0,
            },
        };

        Ok(self.push(timestamp, raw, SamplePoint { delta, rate }))
    }

    /// Append a gauge sample. The value is stored as raw total, delta and rate.
    pub fn add_static(&mut self, timestamp: i64, value: f64) -> SeriesResult<SamplePoint> {
        self.check_sample(timestamp, value)?;
        Ok(self.push(timestamp, value, SamplePoint { delta: value, rate: value }))
    }

    fn check_sample(&self, timestamp: i64, value: f64) -> SeriesResult<()> {
        if !value.is_finite() {
            return Err(SeriesError::NonFinite { timestamp, value });
        }
        match self.last_timestamp {
            Some(last_timestamp) if timestamp < last_timestamp => Err(SeriesError::OutOfOrder {
                timestamp,
                last_timestamp,
            }),
            _ => Ok(()),
        }
    }

    fn push(&mut self, timestamp: i64, raw: f64, point: SamplePoint) -> SamplePoint {
        self.times.push(timestamp);
        self.raw_totals.push(raw);
        self.deltas.push(point.delta);
        self.rates.push(point.rate);
        self.last_raw_value = Some(raw);
        self.last_timestamp = Some(timestamp);
        self.last_point = Some(point);
        point
    }

    /// The delta/rate pair of the most recent sample, kept across trims.
    #[inline]
    pub fn last_value(&self) -> Option<SamplePoint> {
        self.last_point
    }

    #[inline]
    pub fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }

    #[inline]
    pub fn last_raw_value(&self) -> Option<f64> {
        self.last_raw_value
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[i64] {
        &self.times
    }

    pub fn raw_totals(&self) -> &[f64] {
        &self.raw_totals
    }

    pub fn deltas(&self) -> &[f64] {
        &self.deltas
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn field(&self, field: SeriesField) -> &[f64] {
        match field {
            SeriesField::Rates => &self.rates,
            SeriesField::Deltas => &self.deltas,
            SeriesField::RawTotals => &self.raw_totals,
        }
    }

    /// `(time, value)` pairs of one field.
    pub fn samples(&self, field: SeriesField) -> Vec<(i64, f64)> {
        self.times
            .iter()
            .copied()
            .zip(self.field(field).iter().copied())
            .collect()
    }

    /// Resample one field onto the canonical grid.
    pub fn normalized(&self, field: SeriesField, step_secs: i64) -> Normalized {
        normalize(&self.times, self.field(field), step_secs)
    }

    /// Drop the value buffers. The cursor is kept so later samples still
    /// produce correct deltas.
    pub fn trim(&mut self) {
        self.times = Vec::new();
        self.raw_totals = Vec::new();
        self.deltas = Vec::new();
        self.rates = Vec::new();
    }

    /// Serializable form. With `points`, the buffers are compacted to at most
    /// that many entries and the cursor is left out.
    pub fn to_series(&self, points: Option<usize>) -> SeriesPayload {
        let full = SeriesPayload {
            times: self.times.clone(),
            avgs: self.rates.clone(),
            values: self.deltas.clone(),
            total: self.raw_totals.clone(),
            last_raw_value: self.last_raw_value,
            last_timestamp: self.last_timestamp,
        };
        match points {
            Some(points) => full.compacted(points),
            None => full,
        }
    }
}

// ----------------------------------------------------------------------------
// 7.2 Series Payload - Output Shape Of One Metric
// ----------------------------------------------------------------------------

/// `{times, avgs, values, total}` as written into output documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPayload {
    pub times: Vec<i64>,
    /// Rates
    pub avgs: Vec<f64>,
    /// Deltas. In roll-ups these are summed across entities for every
    /// strategy except `Static`.
    pub values: Vec<f64>,
    /// Raw totals
    pub total: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_raw_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<i64>,
}

impl SeriesPayload {
    /// Build from grid-aligned maps. `avgs` decides the time axis; the other
    /// fields read 0 where they have no point.
    pub fn from_grid(avgs: &Normalized, values: &Normalized, total: &Normalized) -> Self {
        let times: Vec<i64> = avgs.keys().copied().collect();
        Self {
            avgs: avgs.values().copied().collect(),
            values: times.iter().map(|t| values.get(t).copied().unwrap_or(0.0)).collect(),
            total: times.iter().map(|t| total.get(t).copied().unwrap_or(0.0)).collect(),
            times,
            last_raw_value: None,
            last_timestamp: None,
        }
    }

    /// Build from parallel time-ordered sample lists of the three fields.
    pub fn from_samples(avgs: &[(i64, f64)], values: &[(i64, f64)], total: &[(i64, f64)]) -> Self {
        Self {
            times: avgs.iter().map(|(t, _)| *t).collect(),
            avgs: avgs.iter().map(|(_, v)| *v).collect(),
            values: values.iter().map(|(_, v)| *v).collect(),
            total: total.iter().map(|(_, v)| *v).collect(),
            last_raw_value: None,
            last_timestamp: None,
        }
    }

    /// Thumbnail form: times and totals keep the first sample of each block,
    /// rates and deltas are block-averaged. The cursor is dropped.
    pub fn compacted(&self, points: usize) -> Self {
        Self {
            times: compress_first(&self.times, points),
            avgs: compress_average(&self.avgs, points),
            values: compress_average(&self.values, points),
            total: compress_first(&self.total, points),
            last_raw_value: None,
            last_timestamp: None,
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

// ============================================================================
// SECTION 8: COMPACTOR
// ============================================================================
// Fixed-size downsampling for thumbnails. Both variants partition the input
// identically so parallel arrays stay parallel.
// ============================================================================

/// Block length used to bring `len` values down to at most `target`, or
/// `None` when no compaction is needed.
#[inline]
fn compaction_block(len: usize, target: usize) -> Option<usize> {
    if target == 0 || len <= target {
        None
    } else {
        Some((len + target - 1) / target)
    }
}

/// Replace each block of `ceil(len / target)` values with its mean.
pub fn compress_average(values: &[f64], target: usize) -> Vec<f64> {
    match compaction_block(values.len(), target) {
        None => values.to_vec(),
        Some(block) => values
            .chunks(block)
            .map(|chunk| chunk.iter().sum::<f64>() / chunk.len() as f64)
            .collect(),
    }
}

/// Keep the first value of each block of `ceil(len / target)` values.
pub fn compress_first<T: Copy>(values: &[T], target: usize) -> Vec<T> {
    match compaction_block(values.len(), target) {
        None => values.to_vec(),
        Some(block) => values.chunks(block).map(|chunk| chunk[0]).collect(),
    }
}

// ============================================================================
// SECTION 9: TIME NORMALIZER
// ============================================================================

/// Grid-aligned timestamp → interpolated value.
pub type Normalized = BTreeMap<i64, f64>;

/// Resample an irregular series onto multiples of `step_secs`.
///
/// Every grid point inside `[t_i, t_{i+1})` is linearly interpolated between
/// the bracketing samples. Nothing is produced before the first sample or at
/// and after the last one, so series with fewer than two samples normalize to
/// an empty map. Pairs with equal timestamps are skipped.
pub fn normalize(times: &[i64], values: &[f64], step_secs: i64) -> Normalized {
    let mut out = Normalized::new();
    if step_secs <= 0 {
        return out;
    }

    let len = times.len().min(values.len());
    for i in 1..len {
        let (prev_ts, next_ts) = (times[i - 1], times[i]);
        if next_ts <= prev_ts {
            continue;
        }
        let (prev, next) = (values[i - 1], values[i]);
        let span = next_ts as f64 - prev_ts as f64;

        let mut t = Timestamp::from_secs(prev_ts).ceil_to_interval(step_secs).as_secs();
        while t < next_ts {
            let factor = (t as f64 - prev_ts as f64) / span;
            out.insert(t, prev + factor * (next - prev));
            match t.checked_add(step_secs) {
                Some(next_t) => t = next_t,
                None => break,
            }
        }
    }

    out
}

// ============================================================================
// SECTION 10: CROSS-ENTITY MERGER
// ============================================================================

/// Sum normalized series. Each grid point sums the inputs that define it.
pub fn merge_sum(inputs: &[Normalized]) -> Normalized {
    let mut out = Normalized::new();
    for input in inputs {
        for (&t, &v) in input {
            *out.entry(t).or_insert(0.0) += v;
        }
    }
    out
}

/// Divisor-weighted average: `Σ(p_i · d_i) / Σ d_i` per grid point.
///
/// `primary[i]` and `divisor[i]` belong to the same entity. An entity only
/// contributes where both of its series define the point. A zero weight sum
/// yields 0.
pub fn merge_weighted_average(primary: &[Normalized], divisor: &[Normalized]) -> Normalized {
    let mut acc: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for (p, d) in primary.iter().zip(divisor) {
        for (t, &pv) in p {
            if let Some(&dv) = d.get(t) {
                let slot = acc.entry(*t).or_insert((0.0, 0.0));
                slot.0 += pv * dv;
                slot.1 += dv;
            }
        }
    }
    acc.into_iter()
        .map(|(t, (num, den))| (t, if den == 0.0 { 0.0 } else { num / den }))
        .collect()
}

/// Concatenate gauge samples from several entities, stably sorted by time.
pub fn merge_static(inputs: &[&[(i64, f64)]]) -> Vec<(i64, f64)> {
    let mut out: Vec<(i64, f64)> = inputs.iter().flat_map(|s| s.iter().copied()).collect();
    out.sort_by_key(|(t, _)| *t);
    out
}

// ----------------------------------------------------------------------------
// 10.1 Merge Strategy & Roll-Up Rules
// ----------------------------------------------------------------------------

/// How one metric is combined across entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Additive metrics such as IOPS or throughput
    Sum,
    /// Averages weighted by another metric of the same entity
    WeightedAverage { divisor: String },
    /// Gauges that are not additive across entities
    Static,
}

/// Declares one cluster-level document built from a group of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupRule {
    /// Group whose entries are merged
    pub source_group: String,

    /// Only entries whose identity fields equal these values take part
    #[serde(default)]
    pub match_identity: BTreeMap<String, String>,

    /// Output group of the roll-up document
    #[serde(default = "default_rollup_group")]
    pub group: String,

    /// Output file stem of the roll-up document
    pub file: String,

    /// Metric name → merge strategy. Metrics not listed are left out.
    pub metrics: BTreeMap<String, MergeStrategy>,
}

fn default_rollup_group() -> String {
    ROLLUP_GROUP.into()
}

impl RollupRule {
    pub fn new(source_group: &str, file: &str) -> Self {
        Self {
            source_group: source_group.into(),
            match_identity: BTreeMap::new(),
            group: default_rollup_group(),
            file: file.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn matching(mut self, field: &str, value: &str) -> Self {
        self.match_identity.insert(field.into(), value.into());
        self
    }

    pub fn metric(mut self, name: &str, strategy: MergeStrategy) -> Self {
        self.metrics.insert(name.into(), strategy);
        self
    }

    pub fn sum(self, names: &[&str]) -> Self {
        names.iter().fold(self, |rule, name| rule.metric(name, MergeStrategy::Sum))
    }

    pub fn weighted(self, name: &str, divisor: &str) -> Self {
        self.metric(
            name,
            MergeStrategy::WeightedAverage {
                divisor: divisor.into(),
            },
        )
    }

    /// Whether an entry with this metadata takes part in the roll-up.
    pub fn matches(&self, meta: &KeyMetadata) -> bool {
        meta.group == self.source_group
            && self.match_identity.iter().all(|(field, expected)| {
                meta.identity
                    .get(field)
                    .and_then(JsonValue::as_str)
                    .map_or(false, |v| v == expected)
            })
    }
}

/// Cluster totals for every I/O family plus network and capacity.
pub fn default_rollup_rules() -> Vec<RollupRule> {
    let mut rules: Vec<RollupRule> = DomRole::ALL
        .iter()
        .map(|role| {
            RollupRule::new(DOM_GROUP, &format!("dom-{}", role.as_str()))
                .matching("role", role.as_str())
                .sum(&[
                    "iopsRead",
                    "iopsWrite",
                    "tputRead",
                    "tputWrite",
                    "iopsRecoveryWrite",
                    "tputRecoveryWrite",
                    "oio",
                ])
                .weighted("latencyRead", "iopsRead")
                .weighted("latencyWrite", "iopsWrite")
                .metric("congestion", MergeStrategy::Static)
        })
        .collect();

    rules.push(
        RollupRule::new(LSOM_GROUP, "lsom")
            .sum(&["iopsRead", "iopsWrite", "tputRead", "tputWrite"])
            .weighted("latencyRead", "iopsRead")
            .weighted("latencyWrite", "iopsWrite"),
    );
    rules.push(RollupRule::new(NETWORK_GROUP, "network").sum(&[
        "rxBytes",
        "txBytes",
        "rxPackets",
        "txPackets",
        "rxErrors",
        "txErrors",
    ]));
    rules.push(
        RollupRule::new(CAPACITY_GROUP, "capacity")
            .sum(&["capacity", "capacityUsed", "capacityReserved"])
            .metric("usedPct", MergeStrategy::Static),
    );

    rules
}

// ============================================================================
// SECTION 11: METRIC REGISTRY (STATS DB)
// ============================================================================
// Keyed store of metric series:
// - Identity tuple → metadata + named series, held in one entry
// - Reverse index from (group, file) to key
// - Idempotent registration with lazily built metadata
// - Shard merge and buffer trimming
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Key Metadata
// ----------------------------------------------------------------------------

/// Descriptive data attached to a key on first registration. Only used when
/// documents are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Display group, also the output sub-directory
    pub group: CompactString,
    /// Output file stem
    pub file: CompactString,
    /// Fields copied to the top level of every document
    pub identity: JsonMap<String, JsonValue>,
    /// Metric name → axis label
    pub axes: BTreeMap<String, String>,
    /// Metrics kept in thumbnails (empty = all)
    pub thumbnail_fields: Vec<String>,
}

impl KeyMetadata {
    pub fn new(group: &str, file: &str) -> Self {
        Self {
            group: sanitize_file_stem(group),
            file: sanitize_file_stem(file),
            ..Default::default()
        }
    }

    pub fn identity(mut self, field: &str, value: impl Into<JsonValue>) -> Self {
        self.identity.insert(field.to_string(), value.into());
        self
    }

    pub fn axis(mut self, metric: &str, label: &str) -> Self {
        self.axes.insert(metric.to_string(), label.to_string());
        self
    }

    pub fn axes(self, pairs: &[(&str, &str)]) -> Self {
        pairs
            .iter()
            .fold(self, |meta, (metric, label)| meta.axis(metric, label))
    }

    pub fn thumbnail(mut self, fields: &[&str]) -> Self {
        self.thumbnail_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Whether `metric` belongs in the thumbnail document.
    pub fn in_thumbnail(&self, metric: &str) -> bool {
        self.thumbnail_fields.is_empty() || self.thumbnail_fields.iter().any(|f| f == metric)
    }
}

// ----------------------------------------------------------------------------
// 11.2 Stats Entry & Document
// ----------------------------------------------------------------------------

/// One registered entity: its metadata and its named series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsEntry {
    pub metadata: KeyMetadata,
    pub metrics: BTreeMap<CompactString, MetricSeries>,
}

/// Output document: identity fields at the top level, plus `axes` and `stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDocument {
    #[serde(flatten)]
    pub identity: JsonMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub axes: BTreeMap<String, String>,
    pub stats: BTreeMap<String, SeriesPayload>,
}

/// Options for [`StatsDb::package`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackageOptions {
    /// Compact every series to at most this many points (thumbnail form)
    pub points: Option<usize>,
}

impl PackageOptions {
    pub fn full() -> Self {
        Self { points: None }
    }

    pub fn thumbnail(points: usize) -> Self {
        Self {
            points: Some(points),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.3 Stats DB
// ----------------------------------------------------------------------------

/// Registry of all series accumulated during one analysis run.
#[derive(Debug, Clone, Default)]
pub struct StatsDb {
    entries: AHashMap<StatsKey, StatsEntry>,
    files: AHashMap<(CompactString, CompactString), StatsKey>,
}

impl StatsDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key`, building its metadata only the first time it is seen.
    ///
    /// A file name already used by another key in the same group gets a
    /// numeric suffix so no two entries share an output file.
    pub fn register_key<F>(&mut self, key: StatsKey, build: F) -> StatsKey
    where
        F: FnOnce(&StatsKey) -> KeyMetadata,
    {
        if self.entries.contains_key(&key) {
            return key;
        }
        let metadata = build(&key);
        self.insert_entry(key.clone(), metadata, BTreeMap::new());
        key
    }

    fn insert_entry(
        &mut self,
        key: StatsKey,
        mut metadata: KeyMetadata,
        metrics: BTreeMap<CompactString, MetricSeries>,
    ) {
        let base = metadata.file.clone();
        let mut suffix = 2usize;
        while self
            .files
            .get(&(metadata.group.clone(), metadata.file.clone()))
            .map_or(false, |owner| *owner != key)
        {
            metadata.file = format_compact!("{}-{}", base, suffix);
            suffix += 1;
        }
        if metadata.file != base {
            debug!(
                target: "observer::registry",
                key = %key,
                group = %metadata.group,
                file = %metadata.file,
                "Output file name taken, using suffixed name"
            );
        }

        self.files
            .insert((metadata.group.clone(), metadata.file.clone()), key.clone());
        self.entries.insert(key, StatsEntry { metadata, metrics });
    }

    /// Mutable metric map of a registered key.
    pub fn get(&mut self, key: &StatsKey) -> Option<&mut BTreeMap<CompactString, MetricSeries>> {
        self.entries.get_mut(key).map(|entry| &mut entry.metrics)
    }

    /// Series `metric` of `key`, created empty on first access.
    pub fn series_mut(&mut self, key: &StatsKey, metric: &str) -> Option<&mut MetricSeries> {
        self.get(key)
            .map(|metrics| metrics.entry(CompactString::from(metric)).or_default())
    }

    pub fn series(&self, key: &StatsKey, metric: &str) -> Option<&MetricSeries> {
        self.entries.get(key).and_then(|entry| entry.metrics.get(metric))
    }

    pub fn metrics(&self, key: &StatsKey) -> Option<&BTreeMap<CompactString, MetricSeries>> {
        self.entries.get(key).map(|entry| &entry.metrics)
    }

    pub fn metadata(&self, key: &StatsKey) -> Option<&KeyMetadata> {
        self.entries.get(key).map(|entry| &entry.metadata)
    }

    pub fn entry(&self, key: &StatsKey) -> Option<&StatsEntry> {
        self.entries.get(key)
    }

    /// Key whose document is written as `<group>/<file>.json`.
    pub fn find_by_file(&self, group: &str, file: &str) -> Option<&StatsKey> {
        self.files
            .get(&(CompactString::from(group), CompactString::from(file)))
    }

    pub fn contains(&self, key: &StatsKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &StatsKey> {
        self.entries.keys()
    }

    /// Keys in a stable order, for deterministic output.
    pub fn sorted_keys(&self) -> Vec<&StatsKey> {
        let mut keys: Vec<&StatsKey> = self.entries.keys().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of one display group, ordered by key.
    pub fn entries_in_group(&self, group: &str) -> Vec<(&StatsKey, &StatsEntry)> {
        let mut out: Vec<(&StatsKey, &StatsEntry)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.metadata.group == group)
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }

    /// Build the output document of `key`.
    pub fn package(&self, key: &StatsKey, opts: PackageOptions) -> Option<StatsDocument> {
        let entry = self.entries.get(key)?;
        let meta = &entry.metadata;

        let stats = entry
            .metrics
            .iter()
            .filter(|(name, _)| opts.points.is_none() || meta.in_thumbnail(name))
            .map(|(name, series)| (name.to_string(), series.to_series(opts.points)))
            .collect();

        Some(StatsDocument {
            identity: meta.identity.clone(),
            axes: meta.axes.clone(),
            stats,
        })
    }

    /// Fold another registry into this one.
    ///
    /// Metadata already present here wins. Series with the same metric name
    /// are replaced by the incoming ones. With a filter, only listed keys are
    /// merged.
    pub fn merge(&mut self, other: StatsDb, filter_keys: Option<&AHashSet<StatsKey>>) {
        let mut incoming: Vec<(StatsKey, StatsEntry)> = other.entries.into_iter().collect();
        incoming.sort_by(|a, b| a.0.cmp(&b.0));

        let mut merged = 0usize;
        for (key, entry) in incoming {
            if filter_keys.map_or(false, |filter| !filter.contains(&key)) {
                continue;
            }
            merged += 1;
            match self.entries.get_mut(&key) {
                Some(existing) => existing.metrics.extend(entry.metrics),
                None => self.insert_entry(key, entry.metadata, entry.metrics),
            }
        }

        trace!(target: "observer::registry", merged, total = self.entries.len(), "Registry merged");
    }

    /// Drop every series buffer while keeping keys, metadata and cursors.
    pub fn trim(&mut self) {
        for entry in self.entries.values_mut() {
            for series in entry.metrics.values_mut() {
                series.trim();
            }
        }
    }

    /// Total number of retained samples across all series.
    pub fn sample_count(&self) -> usize {
        self.entries
            .values()
            .flat_map(|entry| entry.metrics.values())
            .map(MetricSeries::len)
            .sum()
    }
}

// ============================================================================
// SECTION 12: SNAPSHOT DECODING
// ============================================================================
// Snapshot records are decoded once at the ingestion boundary into a closed
// set of tagged sections. Anything that does not fit a known shape becomes a
// warning instead of an error.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Snapshot Record
// ----------------------------------------------------------------------------

/// One timestamped batch of raw data collected from the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub timestamp: i64,
    #[serde(default)]
    pub snapshot: SnapshotBody,
}

/// Sections are kept as loose JSON so one bad section cannot reject the
/// whole record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBody {
    /// Host name → counter groups and their `-taken` timestamps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsi: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmmds: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcinfo: Option<JsonValue>,
}

impl SnapshotBody {
    /// Per-host counter groups, when `vsi` is a well-formed object.
    pub fn host_groups(&self) -> Option<&JsonMap<String, JsonValue>> {
        self.vsi.as_ref().and_then(JsonValue::as_object)
    }

    /// Set the counter groups of `host`, replacing a missing or malformed
    /// `vsi` section with an empty one first.
    pub fn insert_host(&mut self, host: impl Into<String>, groups: JsonValue) {
        if !matches!(self.vsi, Some(JsonValue::Object(_))) {
            self.vsi = Some(JsonValue::Object(JsonMap::new()));
        }
        if let Some(JsonValue::Object(hosts)) = &mut self.vsi {
            hosts.insert(host.into(), groups);
        }
    }
}

impl SnapshotRecord {
    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(json).map_err(DecodeError::Record)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.snapshot
            .host_groups()
            .into_iter()
            .flat_map(|hosts| hosts.keys().map(String::as_str))
    }

    /// Whether the record carries any cluster-wide section.
    pub fn has_cluster_sections(&self) -> bool {
        self.snapshot.cmmds.is_some() || self.snapshot.inventory.is_some() || self.snapshot.vcinfo.is_some()
    }

    /// Split into one record per host plus one record holding the
    /// cluster-wide sections, each with the original timestamp. A malformed
    /// `vsi` section travels with the cluster-wide record.
    pub fn split_by_host(self) -> (Vec<(String, SnapshotRecord)>, Option<SnapshotRecord>) {
        let SnapshotRecord { timestamp, snapshot } = self;
        let SnapshotBody {
            vsi,
            cmmds,
            inventory,
            vcinfo,
        } = snapshot;

        let (hosts, malformed_vsi) = match vsi {
            Some(JsonValue::Object(hosts)) => (hosts, None),
            other => (JsonMap::new(), other),
        };

        let per_host = hosts
            .into_iter()
            .map(|(host, groups)| {
                let mut body = SnapshotBody::default();
                body.insert_host(host.clone(), groups);
                (host, SnapshotRecord { timestamp, snapshot: body })
            })
            .collect();

        let cluster = if malformed_vsi.is_some() || cmmds.is_some() || inventory.is_some() || vcinfo.is_some() {
            Some(SnapshotRecord {
                timestamp,
                snapshot: SnapshotBody {
                    vsi: malformed_vsi,
                    cmmds,
                    inventory,
                    vcinfo,
                },
            })
        } else {
            None
        };

        (per_host, cluster)
    }
}

// ----------------------------------------------------------------------------
// 12.2 Counter Group Payloads
// ----------------------------------------------------------------------------

/// Role of a DOM layer counter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomRole {
    Client,
    Owner,
    CompMgr,
}

impl DomRole {
    pub const ALL: [DomRole; 3] = [DomRole::Client, DomRole::Owner, DomRole::CompMgr];

    pub fn as_str(&self) -> &'static str {
        match self {
            DomRole::Client => "client",
            DomRole::Owner => "owner",
            DomRole::CompMgr => "compmgr",
        }
    }
}

/// DOM client/owner/component-manager counters of one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomIoCounters {
    pub read_count: Option<f64>,
    pub write_count: Option<f64>,
    pub read_bytes: Option<f64>,
    pub write_bytes: Option<f64>,
    pub read_latency_sum_us: Option<f64>,
    pub write_latency_sum_us: Option<f64>,
    pub recovery_write_count: Option<f64>,
    pub recovery_write_bytes: Option<f64>,
    pub oio: Option<f64>,
    pub congestion: Option<f64>,
}

/// LSOM counters of one disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LsomDiskCounters {
    pub read_ios: Option<f64>,
    pub write_ios: Option<f64>,
    pub read_bytes: Option<f64>,
    pub write_bytes: Option<f64>,
    pub read_latency_sum_us: Option<f64>,
    pub write_latency_sum_us: Option<f64>,
}

/// Busy and idle time of one physical CPU, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcpuCounters {
    pub used: Option<f64>,
    pub idle: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldletCounters {
    pub run_time: Option<f64>,
    pub wakeups: Option<f64>,
    pub ready_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PnicCounters {
    pub rx_bytes: Option<f64>,
    pub tx_bytes: Option<f64>,
    pub rx_packets: Option<f64>,
    pub tx_packets: Option<f64>,
    pub rx_errors: Option<f64>,
    pub tx_errors: Option<f64>,
}

/// Capacity gauges of one disk, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityGauges {
    pub capacity: Option<f64>,
    pub capacity_used: Option<f64>,
    pub capacity_reserved: Option<f64>,
}

impl CapacityGauges {
    pub fn used_pct(&self) -> Option<f64> {
        match (self.capacity, self.capacity_used) {
            (Some(cap), Some(used)) if cap > 0.0 => Some(used * 100.0 / cap),
            _ => None,
        }
    }
}

/// Coarse family a counter group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricFamily {
    IoLayer,
    Cpu,
    Network,
    Capacity,
    Membership,
    Unknown,
}

impl MetricFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::IoLayer => "io",
            MetricFamily::Cpu => "cpu",
            MetricFamily::Network => "network",
            MetricFamily::Capacity => "capacity",
            MetricFamily::Membership => "membership",
            MetricFamily::Unknown => "unknown",
        }
    }
}

/// One decoded per-host counter group.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterGroup {
    DomIo { role: DomRole, stats: DomIoCounters },
    LsomDisks(BTreeMap<String, LsomDiskCounters>),
    Pcpus(BTreeMap<String, PcpuCounters>),
    Worldlets(BTreeMap<String, WorldletCounters>),
    Pnics(BTreeMap<String, PnicCounters>),
    Capacity(BTreeMap<String, CapacityGauges>),
    Unknown { name: String },
}

impl CounterGroup {
    /// Decode the group named `name` reported by `host`.
    pub fn decode(host: &str, name: &str, value: &JsonValue) -> Result<Self, DecodeError> {
        let group = match name {
            "dom.client" => CounterGroup::DomIo {
                role: DomRole::Client,
                stats: decode_payload(host, name, value)?,
            },
            "dom.owner" => CounterGroup::DomIo {
                role: DomRole::Owner,
                stats: decode_payload(host, name, value)?,
            },
            "dom.compmgr" => CounterGroup::DomIo {
                role: DomRole::CompMgr,
                stats: decode_payload(host, name, value)?,
            },
            "lsom.disks" => CounterGroup::LsomDisks(decode_payload(host, name, value)?),
            "pcpus" => CounterGroup::Pcpus(decode_payload(host, name, value)?),
            "worldlets" => CounterGroup::Worldlets(decode_payload(host, name, value)?),
            "pnics" => CounterGroup::Pnics(decode_payload(host, name, value)?),
            "lsom.capacity" => CounterGroup::Capacity(decode_payload(host, name, value)?),
            other => CounterGroup::Unknown { name: other.to_string() },
        };
        Ok(group)
    }

    pub fn family(&self) -> MetricFamily {
        match self {
            CounterGroup::DomIo { .. } | CounterGroup::LsomDisks(_) => MetricFamily::IoLayer,
            CounterGroup::Pcpus(_) | CounterGroup::Worldlets(_) => MetricFamily::Cpu,
            CounterGroup::Pnics(_) => MetricFamily::Network,
            CounterGroup::Capacity(_) => MetricFamily::Capacity,
            CounterGroup::Unknown { .. } => MetricFamily::Unknown,
        }
    }
}

fn decode_payload<T: DeserializeOwned>(entity: &str, section: &str, value: &JsonValue) -> Result<T, DecodeError> {
    T::deserialize(value).map_err(|e| DecodeError::MalformedSection {
        entity: entity.to_string(),
        section: section.to_string(),
        message: e.to_string(),
    })
}

// ----------------------------------------------------------------------------
// 12.3 Cluster-Wide Payloads
// ----------------------------------------------------------------------------

/// One entry of a CMMDS directory partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmmdsEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub uuid: String,
    #[serde(default)]
    pub content: JsonValue,
    #[serde(default)]
    pub md5sum: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Cluster membership as seen by one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    #[serde(default)]
    pub member_count: Option<f64>,
}

/// Object counts from the inventory section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySummary {
    pub vm_count: Option<usize>,
    pub host_count: Option<usize>,
}

impl InventorySummary {
    fn from_value(value: &JsonValue) -> Result<Self, DecodeError> {
        let obj = value.as_object().ok_or_else(|| DecodeError::MalformedSection {
            entity: "inventory".into(),
            section: "inventory".into(),
            message: "expected an object".into(),
        })?;
        Ok(Self {
            vm_count: obj.get("vms").and_then(collection_len),
            host_count: obj.get("hosts").and_then(collection_len),
        })
    }
}

fn collection_len(value: &JsonValue) -> Option<usize> {
    match value {
        JsonValue::Object(map) => Some(map.len()),
        JsonValue::Array(items) => Some(items.len()),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// 12.4 Decoded Sections
// ----------------------------------------------------------------------------

/// One routable unit of a snapshot record.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotSection {
    Host {
        host: String,
        /// Collection time of the group (`<group>-taken`, else the record time)
        taken: i64,
        group: CounterGroup,
    },
    ClusterDirs {
        partition: String,
        entries: Vec<CmmdsEntry>,
    },
    ClusterInfo {
        host: String,
        info: ClusterInfo,
    },
    Inventory(InventorySummary),
}

impl SnapshotSection {
    pub fn family(&self) -> MetricFamily {
        match self {
            SnapshotSection::Host { group, .. } => group.family(),
            SnapshotSection::ClusterDirs { .. }
            | SnapshotSection::ClusterInfo { .. }
            | SnapshotSection::Inventory(_) => MetricFamily::Membership,
        }
    }
}

/// Decode every section of `record`. Sections that cannot be decoded are
/// reported as warnings and left out.
pub fn decode_sections(record: &SnapshotRecord) -> (Vec<SnapshotSection>, Vec<IngestWarning>) {
    let mut sections = Vec::new();
    let mut warnings = Vec::new();

    let hosts = match &record.snapshot.vsi {
        None => None,
        Some(JsonValue::Object(hosts)) => Some(hosts),
        Some(_) => {
            warnings.push(IngestWarning::new(
                WarningKind::MalformedSection,
                "record",
                "vsi",
                "expected an object of hosts",
            ));
            None
        }
    };

    for (host, groups) in hosts.into_iter().flatten() {
        let Some(groups) = groups.as_object() else {
            warnings.push(IngestWarning::new(
                WarningKind::MalformedSection,
                host,
                "vsi",
                "expected an object of counter groups",
            ));
            continue;
        };

        for (name, value) in groups {
            if name.ends_with(TAKEN_SUFFIX) {
                continue;
            }
            let taken = match taken_timestamp(groups.get(&format!("{}{}", name, TAKEN_SUFFIX)), record.timestamp) {
                Ok(taken) => taken,
                Err(message) => {
                    warnings.push(IngestWarning::new(WarningKind::MalformedSection, host, name, message));
                    continue;
                }
            };

            match CounterGroup::decode(host, name, value) {
                Ok(CounterGroup::Unknown { name }) => {
                    warnings.push(IngestWarning::new(
                        WarningKind::UnknownSection,
                        host,
                        &name,
                        "unsupported counter group",
                    ));
                }
                Ok(group) => sections.push(SnapshotSection::Host {
                    host: host.clone(),
                    taken,
                    group,
                }),
                Err(e) => warnings.push(IngestWarning::from_decode(&e)),
            }
        }
    }

    if let Some(cmmds) = &record.snapshot.cmmds {
        decode_cmmds(cmmds, &mut sections, &mut warnings);
    }

    if let Some(inventory) = &record.snapshot.inventory {
        match InventorySummary::from_value(inventory) {
            Ok(summary) => sections.push(SnapshotSection::Inventory(summary)),
            Err(e) => warnings.push(IngestWarning::from_decode(&e)),
        }
    }

    (sections, warnings)
}

/// Collection time of a counter group. Falls back to the record timestamp
/// when the group carries no `-taken` field.
fn taken_timestamp(value: Option<&JsonValue>, record_ts: i64) -> Result<i64, String> {
    let Some(value) = value else {
        return Ok(record_ts);
    };
    let taken = value
        .as_i64()
        .ok_or_else(|| format!("collection time {} is not an integer epoch", value))?;
    if !(0..=MAX_TIMESTAMP_SECS).contains(&taken) {
        return Err(format!("collection time {} is out of range", taken));
    }
    if taken.abs_diff(record_ts) > MAX_TAKEN_SKEW_SECS as u64 {
        return Err(format!(
            "collection time {} is more than {}s away from the record at {}",
            taken, MAX_TAKEN_SKEW_SECS, record_ts
        ));
    }
    Ok(taken)
}

fn decode_cmmds(cmmds: &JsonValue, sections: &mut Vec<SnapshotSection>, warnings: &mut Vec<IngestWarning>) {
    let Some(cmmds) = cmmds.as_object() else {
        warnings.push(IngestWarning::new(
            WarningKind::MalformedSection,
            "cmmds",
            "cmmds",
            "expected an object",
        ));
        return;
    };

    for (name, value) in cmmds {
        match name.as_str() {
            "clusterDirs" => match value.as_object() {
                Some(partitions) => {
                    for (partition, entries) in partitions {
                        match decode_payload::<Vec<CmmdsEntry>>(partition, "clusterDirs", entries) {
                            Ok(entries) => sections.push(SnapshotSection::ClusterDirs {
                                partition: partition.clone(),
                                entries,
                            }),
                            Err(e) => warnings.push(IngestWarning::from_decode(&e)),
                        }
                    }
                }
                None => warnings.push(IngestWarning::new(
                    WarningKind::MalformedSection,
                    "cmmds",
                    "clusterDirs",
                    "expected an object of partitions",
                )),
            },
            "clusterInfos" => match value.as_object() {
                Some(hosts) => {
                    for (host, info) in hosts {
                        match decode_payload::<ClusterInfo>(host, "clusterInfos", info) {
                            Ok(info) => sections.push(SnapshotSection::ClusterInfo {
                                host: host.clone(),
                                info,
                            }),
                            Err(e) => warnings.push(IngestWarning::from_decode(&e)),
                        }
                    }
                }
                None => warnings.push(IngestWarning::new(
                    WarningKind::MalformedSection,
                    "cmmds",
                    "clusterInfos",
                    "expected an object of hosts",
                )),
            },
            other => warnings.push(IngestWarning::new(
                WarningKind::UnknownSection,
                "cmmds",
                other,
                "unsupported cmmds section",
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// 12.5 Ingest Warnings & Report
// ----------------------------------------------------------------------------

/// Category of a data-quality problem found while ingesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    MalformedSection,
    UnknownSection,
    OutOfOrderSample,
    InvalidValue,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::MalformedSection => "malformed_section",
            WarningKind::UnknownSection => "unknown_section",
            WarningKind::OutOfOrderSample => "out_of_order_sample",
            WarningKind::InvalidValue => "invalid_value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestWarning {
    pub kind: WarningKind,
    /// Host, partition or other entity the problem belongs to
    pub entity: String,
    /// Section or metric name
    pub section: String,
    pub message: String,
}

impl IngestWarning {
    pub fn new(kind: WarningKind, entity: &str, section: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.to_string(),
            section: section.to_string(),
            message: message.into(),
        }
    }

    pub fn from_decode(err: &DecodeError) -> Self {
        match err {
            DecodeError::MalformedSection {
                entity,
                section,
                message,
            } => Self::new(WarningKind::MalformedSection, entity, section, message.clone()),
            DecodeError::Record(e) => Self::new(WarningKind::MalformedSection, "record", "snapshot", e.to_string()),
        }
    }

    pub fn from_series(err: &SeriesError, entity: &StatsKey, metric: &str) -> Self {
        Self::new(err.warning_kind(), &entity.to_string(), metric, err.to_string())
    }
}

impl Display for IngestWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}/{}: {}", self.kind.as_str(), self.entity, self.section, self.message)
    }
}

/// Outcome of ingesting one snapshot record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub timestamp: i64,
    /// Sections routed to the registry
    pub sections: usize,
    /// Samples accepted into series
    pub samples: usize,
    pub warnings: Vec<IngestWarning>,
}

impl IngestReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn absorb(&mut self, other: IngestReport) {
        self.timestamp = self.timestamp.max(other.timestamp);
        self.sections += other.sections;
        self.samples += other.samples;
        self.warnings.extend(other.warnings);
    }
}

// ============================================================================
// SECTION 13: SNAPSHOT PROCESSOR (STATS ENGINE)
// ============================================================================
// Owns the registry for one analysis run and routes every decoded section to
// the series of its entity:
// - I/O layer counters with latency averaged per operation
// - CPU and worldlet run times
// - Network counters and capacity gauges
// - CMMDS membership and inventory counts
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Engine State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Nothing ingested yet
    Init,
    /// Accepting snapshot records
    Accumulating,
    /// Writing documents
    Dumping,
}

// ----------------------------------------------------------------------------
// 13.2 Sample Sink - Records Samples For One Key
// ----------------------------------------------------------------------------

/// Writes samples of one key at one timestamp, turning rejected samples into
/// report warnings.
struct SampleSink<'a> {
    db: &'a mut StatsDb,
    key: StatsKey,
    ts: i64,
    report: &'a mut IngestReport,
}

impl SampleSink<'_> {
    fn record<F>(&mut self, metric: &str, apply: F) -> Option<SamplePoint>
    where
        F: FnOnce(&mut MetricSeries) -> SeriesResult<SamplePoint>,
    {
        let series = self.db.series_mut(&self.key, metric)?;
        match apply(series) {
            Ok(point) => {
                self.report.samples += 1;
                Some(point)
            }
            Err(e) => {
                self.report
                    .warnings
                    .push(IngestWarning::from_series(&e, &self.key, metric));
                None
            }
        }
    }

    /// Cumulative counter, rate per second.
    fn counter(&mut self, metric: &str, value: Option<f64>) -> Option<SamplePoint> {
        let value = value?;
        let ts = self.ts;
        self.record(metric, |series| series.add(ts, value, None))
    }

    /// Point-in-time gauge.
    fn gauge(&mut self, metric: &str, value: Option<f64>) -> Option<SamplePoint> {
        let value = value?;
        let ts = self.ts;
        self.record(metric, |series| series.add_static(ts, value))
    }

    /// Latency sum averaged over the operations counted by `count_metric` in
    /// the same tick. A count not sampled at this tick divides by zero, which
    /// yields a zero rate.
    fn latency(&mut self, metric: &str, sum: Option<f64>, count_metric: &str) -> Option<SamplePoint> {
        let sum = sum?;
        let ts = self.ts;
        let divisor = self
            .db
            .series(&self.key, count_metric)
            .filter(|count| count.last_timestamp() == Some(ts))
            .and_then(MetricSeries::last_value)
            .map_or(0.0, |point| point.delta);
        self.record(metric, |series| series.add(ts, sum, Some(divisor)))
    }
}

// ----------------------------------------------------------------------------
// 13.3 Stats Engine
// ----------------------------------------------------------------------------

const DOM_AXES: &[(&str, &str)] = &[
    ("iopsRead", "IOPS"),
    ("iopsWrite", "IOPS"),
    ("tputRead", "Bytes/s"),
    ("tputWrite", "Bytes/s"),
    ("latencyRead", "us"),
    ("latencyWrite", "us"),
    ("iopsRecoveryWrite", "IOPS"),
    ("tputRecoveryWrite", "Bytes/s"),
    ("oio", "Outstanding IO"),
    ("congestion", "Congestion"),
];

const IO_THUMBNAIL: &[&str] = &[
    "iopsRead",
    "iopsWrite",
    "tputRead",
    "tputWrite",
    "latencyRead",
    "latencyWrite",
];

const NETWORK_AXES: &[(&str, &str)] = &[
    ("rxBytes", "Bytes/s"),
    ("txBytes", "Bytes/s"),
    ("rxPackets", "Packets/s"),
    ("txPackets", "Packets/s"),
    ("rxErrors", "Errors/s"),
    ("txErrors", "Errors/s"),
];

/// Accumulates snapshot records into a [`StatsDb`] and writes them out.
#[derive(Debug)]
pub struct StatsEngine {
    config: StatsConfig,
    db: StatsDb,
    state: EngineState,
    timerange: TimeRange,
    records: u64,
    warning_counts: BTreeMap<WarningKind, u64>,
    reported: AHashSet<(WarningKind, CompactString)>,
}

impl StatsEngine {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            db: StatsDb::new(),
            state: EngineState::Init,
            timerange: TimeRange::default(),
            records: 0,
            warning_counts: BTreeMap::new(),
            reported: AHashSet::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(StatsConfig::default())
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn registry(&self) -> &StatsDb {
        &self.db
    }

    pub fn registry_mut(&mut self) -> &mut StatsDb {
        &mut self.db
    }

    pub fn into_registry(self) -> StatsDb {
        self.db
    }

    pub fn timerange(&self) -> TimeRange {
        self.timerange
    }

    pub fn records_ingested(&self) -> u64 {
        self.records
    }

    /// Warnings seen since the engine was created, by kind.
    pub fn warning_counts(&self) -> &BTreeMap<WarningKind, u64> {
        &self.warning_counts
    }

    /// Decode a JSON snapshot record and ingest it.
    pub fn ingest_json(&mut self, json: &str) -> EngineResult<IngestReport> {
        let record = SnapshotRecord::from_json(json)?;
        Ok(self.ingest(&record))
    }

    /// Route every section of `record` into the registry.
    ///
    /// Never fails: undecodable sections and rejected samples are returned
    /// as warnings in the report.
    pub fn ingest(&mut self, record: &SnapshotRecord) -> IngestReport {
        self.state = EngineState::Accumulating;
        self.records += 1;
        self.timerange.observe(record.timestamp);

        let mut report = IngestReport {
            timestamp: record.timestamp,
            ..Default::default()
        };

        let (sections, warnings) = decode_sections(record);
        report.warnings.extend(warnings);

        for section in sections {
            trace!(target: "observer::engine", family = section.family().as_str(), "Routing section");
            self.route(section, record.timestamp, &mut report);
            report.sections += 1;
        }

        self.log_warnings(&report.warnings);
        trace!(
            target: "observer::engine",
            timestamp = record.timestamp,
            sections = report.sections,
            samples = report.samples,
            warnings = report.warnings.len(),
            "Snapshot ingested"
        );

        report
    }

    fn log_warnings(&mut self, warnings: &[IngestWarning]) {
        for warning in warnings {
            *self.warning_counts.entry(warning.kind).or_insert(0) += 1;
            let first = self
                .reported
                .insert((warning.kind, CompactString::from(warning.section.as_str())));
            if first {
                warn!(
                    target: "observer::engine",
                    kind = warning.kind.as_str(),
                    entity = %warning.entity,
                    section = %warning.section,
                    "{}", warning.message
                );
            } else {
                debug!(
                    target: "observer::engine",
                    kind = warning.kind.as_str(),
                    entity = %warning.entity,
                    section = %warning.section,
                    "{}", warning.message
                );
            }
        }
    }

    fn sink<'a>(&'a mut self, key: StatsKey, ts: i64, report: &'a mut IngestReport) -> SampleSink<'a> {
        SampleSink {
            db: &mut self.db,
            key,
            ts,
            report,
        }
    }

    fn route(&mut self, section: SnapshotSection, record_ts: i64, report: &mut IngestReport) {
        match section {
            SnapshotSection::Host { host, taken, group } => {
                self.timerange.observe(taken);
                match group {
                    CounterGroup::DomIo { role, stats } => self.route_dom(&host, role, &stats, taken, report),
                    CounterGroup::LsomDisks(disks) => self.route_lsom(&host, &disks, taken, report),
                    CounterGroup::Pcpus(cpus) => self.route_pcpus(&host, &cpus, taken, report),
                    CounterGroup::Worldlets(worldlets) => self.route_worldlets(&host, &worldlets, taken, report),
                    CounterGroup::Pnics(nics) => self.route_pnics(&host, &nics, taken, report),
                    CounterGroup::Capacity(disks) => self.route_capacity(&host, &disks, taken, report),
                    CounterGroup::Unknown { name } => report.warnings.push(IngestWarning::new(
                        WarningKind::UnknownSection,
                        &host,
                        &name,
                        "unsupported counter group",
                    )),
                }
            }
            SnapshotSection::ClusterDirs { partition, entries } => {
                self.route_cluster_dirs(&partition, &entries, record_ts, report)
            }
            SnapshotSection::ClusterInfo { host, info } => {
                let key = self.db.register_key(StatsKey::new([CMMDS_GROUP, "info", host.as_str()]), |_| {
                    KeyMetadata::new(CMMDS_GROUP, &format!("info-{}", host))
                        .identity("host", host.as_str())
                        .axis("memberCount", "Members")
                });
                self.sink(key, record_ts, report).gauge("memberCount", info.member_count);
            }
            SnapshotSection::Inventory(summary) => {
                let key = self.db.register_key(StatsKey::new([INVENTORY_GROUP, "cluster"]), |_| {
                    KeyMetadata::new(INVENTORY_GROUP, "cluster")
                        .identity("scope", "cluster")
                        .axes(&[("vmCount", "VMs"), ("hostCount", "Hosts")])
                });
                let mut sink = self.sink(key, record_ts, report);
                sink.gauge("vmCount", summary.vm_count.map(|n| n as f64));
                sink.gauge("hostCount", summary.host_count.map(|n| n as f64));
            }
        }
    }

    fn route_dom(&mut self, host: &str, role: DomRole, stats: &DomIoCounters, ts: i64, report: &mut IngestReport) {
        let key = self
            .db
            .register_key(StatsKey::new([host, DOM_GROUP, role.as_str()]), |_| {
                KeyMetadata::new(DOM_GROUP, &format!("{}-{}", host, role.as_str()))
                    .identity("host", host)
                    .identity("role", role.as_str())
                    .axes(DOM_AXES)
                    .thumbnail(IO_THUMBNAIL)
            });

        let mut sink = self.sink(key, ts, report);
        sink.counter("iopsRead", stats.read_count);
        sink.counter("iopsWrite", stats.write_count);
        sink.counter("tputRead", stats.read_bytes);
        sink.counter("tputWrite", stats.write_bytes);
        sink.latency("latencyRead", stats.read_latency_sum_us, "iopsRead");
        sink.latency("latencyWrite", stats.write_latency_sum_us, "iopsWrite");
        sink.counter("iopsRecoveryWrite", stats.recovery_write_count);
        sink.counter("tputRecoveryWrite", stats.recovery_write_bytes);
        sink.gauge("oio", stats.oio);
        sink.gauge("congestion", stats.congestion);
    }

    fn route_lsom(
        &mut self,
        host: &str,
        disks: &BTreeMap<String, LsomDiskCounters>,
        ts: i64,
        report: &mut IngestReport,
    ) {
        for (disk, stats) in disks {
            let key = self
                .db
                .register_key(StatsKey::new([host, LSOM_GROUP, disk.as_str()]), |_| {
                    KeyMetadata::new(LSOM_GROUP, &format!("{}-{}", host, disk))
                        .identity("host", host)
                        .identity("disk", disk.as_str())
                        .axes(&DOM_AXES[..6])
                        .thumbnail(IO_THUMBNAIL)
                });

            let mut sink = self.sink(key, ts, report);
            sink.counter("iopsRead", stats.read_ios);
            sink.counter("iopsWrite", stats.write_ios);
            sink.counter("tputRead", stats.read_bytes);
            sink.counter("tputWrite", stats.write_bytes);
            sink.latency("latencyRead", stats.read_latency_sum_us, "iopsRead");
            sink.latency("latencyWrite", stats.write_latency_sum_us, "iopsWrite");
        }
    }

    fn route_pcpus(
        &mut self,
        host: &str,
        cpus: &BTreeMap<String, PcpuCounters>,
        ts: i64,
        report: &mut IngestReport,
    ) {
        let key = self.db.register_key(StatsKey::new([host, CPU_GROUP, "pcpu"]), |_| {
            KeyMetadata::new(CPU_GROUP, &format!("{}-pcpu", host))
                .identity("host", host)
                .axis("usedPct", "%")
                .thumbnail(&["usedPct"])
        });

        let mut sink = self.sink(key, ts, report);
        let (mut busy, mut total) = (0.0, 0.0);
        for (cpu, stats) in cpus {
            let id = cpu.trim_start_matches("cpu");
            let used = sink.counter(&format!("cpu{}.used", id), stats.used);
            let idle = sink.counter(&format!("cpu{}.idle", id), stats.idle);
            if let (Some(used), Some(idle)) = (used, idle) {
                busy += used.delta;
                total += used.delta + idle.delta;
            }
        }

        if total > 0.0 {
            sink.gauge("usedPct", Some(busy * 100.0 / total));
        }
    }

    fn route_worldlets(
        &mut self,
        host: &str,
        worldlets: &BTreeMap<String, WorldletCounters>,
        ts: i64,
        report: &mut IngestReport,
    ) {
        for (name, stats) in worldlets {
            let key = self
                .db
                .register_key(StatsKey::new([host, WORLDLET_GROUP, name.as_str()]), |_| {
                    KeyMetadata::new(WORLDLET_GROUP, &format!("{}-{}", host, name))
                        .identity("host", host)
                        .identity("worldlet", name.as_str())
                        .axes(&[("runTime", "us/s"), ("wakeups", "Wakeups/s"), ("readyTime", "us/s")])
            });

            let mut sink = self.sink(key, ts, report);
            sink.counter("runTime", stats.run_time);
            sink.counter("wakeups", stats.wakeups);
            sink.counter("readyTime", stats.ready_time);
        }
    }

    fn route_pnics(
        &mut self,
        host: &str,
        nics: &BTreeMap<String, PnicCounters>,
        ts: i64,
        report: &mut IngestReport,
    ) {
        for (nic, stats) in nics {
            let key = self
                .db
                .register_key(StatsKey::new([host, NETWORK_GROUP, nic.as_str()]), |_| {
                    KeyMetadata::new(NETWORK_GROUP, &format!("{}-{}", host, nic))
                        .identity("host", host)
                        .identity("nic", nic.as_str())
                        .axes(NETWORK_AXES)
                        .thumbnail(&["rxBytes", "txBytes"])
                });

            let mut sink = self.sink(key, ts, report);
            sink.counter("rxBytes", stats.rx_bytes);
            sink.counter("txBytes", stats.tx_bytes);
            sink.counter("rxPackets", stats.rx_packets);
            sink.counter("txPackets", stats.tx_packets);
            sink.counter("rxErrors", stats.rx_errors);
            sink.counter("txErrors", stats.tx_errors);
        }
    }

    fn route_capacity(
        &mut self,
        host: &str,
        disks: &BTreeMap<String, CapacityGauges>,
        ts: i64,
        report: &mut IngestReport,
    ) {
        for (disk, gauges) in disks {
            let key = self
                .db
                .register_key(StatsKey::new([host, CAPACITY_GROUP, disk.as_str()]), |_| {
                    KeyMetadata::new(CAPACITY_GROUP, &format!("{}-{}", host, disk))
                        .identity("host", host)
                        .identity("disk", disk.as_str())
                        .axes(&[
                            ("capacity", "Bytes"),
                            ("capacityUsed", "Bytes"),
                            ("capacityReserved", "Bytes"),
                            ("usedPct", "%"),
                        ])
                });

            let mut sink = self.sink(key, ts, report);
            sink.gauge("capacity", gauges.capacity);
            sink.gauge("capacityUsed", gauges.capacity_used);
            sink.gauge("capacityReserved", gauges.capacity_reserved);
            sink.gauge("usedPct", gauges.used_pct());
        }
    }

    /// Entry counts per type and component counts per owner. Counts that
    /// were seen before but are absent now drop to zero.
    fn route_cluster_dirs(&mut self, partition: &str, entries: &[CmmdsEntry], ts: i64, report: &mut IngestReport) {
        let key = self
            .db
            .register_key(StatsKey::new([CMMDS_GROUP, "dirs", partition]), |_| {
                KeyMetadata::new(CMMDS_GROUP, &format!("dirs-{}", partition)).identity("partition", partition)
            });

        let mut counts: BTreeMap<String, f64> = BTreeMap::new();
        for entry in entries {
            *counts.entry(format!("entries.{}", entry.entry_type)).or_insert(0.0) += 1.0;
            if entry.entry_type == LSOM_OBJECT_TYPE {
                if let Some(owner) = &entry.owner {
                    *counts.entry(format!("components.{}", owner)).or_insert(0.0) += 1.0;
                }
            }
        }

        if let Some(metrics) = self.db.metrics(&key) {
            for name in metrics.keys() {
                counts.entry(name.to_string()).or_insert(0.0);
            }
        }

        let mut sink = self.sink(key, ts, report);
        for (metric, count) in counts {
            sink.gauge(&metric, Some(count));
        }
    }

    /// Write every document below `out_dir`.
    pub fn dump<P: AsRef<Path>>(&mut self, out_dir: P, options: &DumpOptions) -> EngineResult<DumpReport> {
        let previous = self.state;
        self.state = EngineState::Dumping;

        let rules: &[RollupRule] = if options.rollups {
            &self.config.rollups
        } else {
            &[]
        };
        let result = StatsDumper::new(
            &self.db,
            out_dir.as_ref().join(&self.config.output_root),
            self.config.grid_interval_secs,
            rules,
            options,
        )
        .run(self.timerange);

        self.state = match previous {
            EngineState::Init => EngineState::Init,
            _ => EngineState::Accumulating,
        };

        let report = result?;
        if options.trim {
            self.db.trim();
            debug!(target: "observer::engine", "Series buffers trimmed after dump");
        }
        Ok(report)
    }

    /// Fold another engine (typically a shard) into this one.
    pub fn absorb(&mut self, other: StatsEngine) {
        if other.state != EngineState::Init {
            self.state = EngineState::Accumulating;
        }
        self.records += other.records;
        self.timerange.merge(&other.timerange);
        for (kind, count) in other.warning_counts {
            *self.warning_counts.entry(kind).or_insert(0) += count;
        }
        self.reported.extend(other.reported);
        self.db.merge(other.db, None);
    }
}

// ============================================================================
// SECTION 14: CLUSTER ROLL-UPS
// ============================================================================

/// Build the cluster-level document described by `rule`, or `None` when no
/// entry of the source group matches.
pub fn build_rollup(db: &StatsDb, rule: &RollupRule, step_secs: i64) -> Option<StatsDocument> {
    let entries: Vec<&StatsEntry> = db
        .entries_in_group(&rule.source_group)
        .into_iter()
        .map(|(_, entry)| entry)
        .filter(|entry| rule.matches(&entry.metadata))
        .collect();
    if entries.is_empty() {
        return None;
    }

    let mut stats = BTreeMap::new();
    for (metric, strategy) in &rule.metrics {
        let payload = match strategy {
            MergeStrategy::Sum => {
                let sum = |field| {
                    let inputs: Vec<Normalized> = entries
                        .iter()
                        .filter_map(|entry| entry.metrics.get(metric.as_str()))
                        .map(|series| series.normalized(field, step_secs))
                        .collect();
                    merge_sum(&inputs)
                };
                SeriesPayload::from_grid(
                    &sum(SeriesField::Rates),
                    &sum(SeriesField::Deltas),
                    &sum(SeriesField::RawTotals),
                )
            }
            MergeStrategy::WeightedAverage { divisor } => {
                let pairs: Vec<(&MetricSeries, &MetricSeries)> = entries
                    .iter()
                    .filter_map(|entry| {
                        Some((
                            entry.metrics.get(metric.as_str())?,
                            entry.metrics.get(divisor.as_str())?,
                        ))
                    })
                    .collect();
                let primary = |field: SeriesField| -> Vec<Normalized> {
                    pairs.iter().map(|(p, _)| p.normalized(field, step_secs)).collect()
                };
                let weights: Vec<Normalized> = pairs
                    .iter()
                    .map(|(_, d)| d.normalized(SeriesField::Rates, step_secs))
                    .collect();
                // Only rates are averaged; deltas and totals add up across entities.
                SeriesPayload::from_grid(
                    &merge_weighted_average(&primary(SeriesField::Rates), &weights),
                    &merge_sum(&primary(SeriesField::Deltas)),
                    &merge_sum(&primary(SeriesField::RawTotals)),
                )
            }
            MergeStrategy::Static => {
                let concat = |field| {
                    let samples: Vec<Vec<(i64, f64)>> = entries
                        .iter()
                        .filter_map(|entry| entry.metrics.get(metric.as_str()))
                        .map(|series| series.samples(field))
                        .collect();
                    let slices: Vec<&[(i64, f64)]> = samples.iter().map(Vec::as_slice).collect();
                    merge_static(&slices)
                };
                SeriesPayload::from_samples(
                    &concat(SeriesField::Rates),
                    &concat(SeriesField::Deltas),
                    &concat(SeriesField::RawTotals),
                )
            }
        };

        if !payload.is_empty() {
            stats.insert(metric.clone(), payload);
        }
    }

    let mut identity = JsonMap::new();
    identity.insert("scope".into(), JsonValue::from("cluster"));
    identity.insert("source".into(), JsonValue::from(rule.source_group.as_str()));
    identity.insert("entities".into(), JsonValue::from(entries.len()));
    for (field, value) in &rule.match_identity {
        identity.insert(field.clone(), JsonValue::from(value.as_str()));
    }

    let axes = entries
        .iter()
        .flat_map(|entry| entry.metadata.axes.iter())
        .filter(|(metric, _)| rule.metrics.contains_key(metric.as_str()))
        .map(|(metric, label)| (metric.clone(), label.clone()))
        .collect();

    Some(StatsDocument { identity, axes, stats })
}

// ============================================================================
// SECTION 15: SERIALIZER / DUMPER
// ============================================================================
// Writes the registry as a directory of JSON documents:
// - <root>/<group>/<file>.json and <file>_thumb.json per entry
// - <root>/cluster/<rule>.json roll-ups
// - <root>/timerange.json
// Every file goes through a temporary sibling and an atomic rename.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Dump Options & Cancellation
// ----------------------------------------------------------------------------

/// Cancels a dump in progress. Checked before every file.
#[derive(Debug, Clone, Default)]
pub struct DumpCancel(Arc<AtomicBool>);

impl DumpCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// Points per series in thumbnail documents
    pub thumbnail_points: usize,
    /// Write cluster roll-up documents
    pub rollups: bool,
    /// Trim series buffers after a successful dump
    pub trim: bool,
    pub cancel: DumpCancel,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self::from_config(&StatsConfig::default())
    }
}

impl DumpOptions {
    pub fn from_config(config: &StatsConfig) -> Self {
        Self {
            thumbnail_points: config.thumbnail_points,
            rollups: config.rollups_enabled,
            trim: config.trim_after_dump,
            cancel: DumpCancel::new(),
        }
    }

    pub fn with_thumbnail_points(mut self, points: usize) -> Self {
        self.thumbnail_points = points;
        self
    }

    pub fn with_rollups(mut self, enabled: bool) -> Self {
        self.rollups = enabled;
        self
    }

    pub fn with_trim(mut self, trim: bool) -> Self {
        self.trim = trim;
        self
    }

    pub fn with_cancel(mut self, cancel: DumpCancel) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Summary of a finished dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DumpReport {
    /// Entry documents written (each as full and thumbnail file)
    pub documents: usize,
    /// Roll-up documents written
    pub rollups: usize,
    pub files_written: usize,
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
    pub output_root: PathBuf,
}

// ----------------------------------------------------------------------------
// 15.2 Stats Dumper
// ----------------------------------------------------------------------------

/// Read-only pass over a registry that writes its documents.
pub struct StatsDumper<'a> {
    db: &'a StatsDb,
    root: PathBuf,
    step_secs: i64,
    rules: &'a [RollupRule],
    options: &'a DumpOptions,
    files_written: usize,
}

impl Debug for StatsDumper<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsDumper")
            .field("root", &self.root)
            .field("entries", &self.db.len())
            .field("rules", &self.rules.len())
            .field("files_written", &self.files_written)
            .finish()
    }
}

impl<'a> StatsDumper<'a> {
    pub fn new(
        db: &'a StatsDb,
        root: PathBuf,
        step_secs: i64,
        rules: &'a [RollupRule],
        options: &'a DumpOptions,
    ) -> Self {
        Self {
            db,
            root,
            step_secs,
            rules,
            options,
            files_written: 0,
        }
    }

    pub fn run(mut self, timerange: TimeRange) -> DumpResult<DumpReport> {
        info!(
            target: "observer::dump",
            root = %self.root.display(),
            entries = self.db.len(),
            rollups = self.rules.len(),
            "Dump started"
        );

        create_dir(&self.root)?;

        let mut documents = 0usize;
        let db = self.db;
        for key in db.sorted_keys() {
            let Some(meta) = db.metadata(key) else {
                continue;
            };
            let dir = self.root.join(meta.group.as_str());
            create_dir(&dir)?;

            if let Some(doc) = db.package(key, PackageOptions::full()) {
                self.write_json(&dir.join(format!("{}.json", meta.file)), &doc)?;
            }
            if let Some(doc) = db.package(key, PackageOptions::thumbnail(self.options.thumbnail_points)) {
                self.write_json(&dir.join(format!("{}{}.json", meta.file, THUMBNAIL_SUFFIX)), &doc)?;
            }
            documents += 1;
        }

        let mut rollups = 0usize;
        let rules = self.rules;
        for rule in rules {
            let Some(doc) = build_rollup(db, rule, self.step_secs) else {
                trace!(target: "observer::dump", file = %rule.file, "Roll-up has no matching entries");
                continue;
            };
            let dir = self.root.join(sanitize_file_stem(&rule.group).as_str());
            create_dir(&dir)?;
            let file = sanitize_file_stem(&rule.file);

            let thumb = StatsDocument {
                identity: doc.identity.clone(),
                axes: doc.axes.clone(),
                stats: doc
                    .stats
                    .iter()
                    .map(|(name, payload)| (name.clone(), payload.compacted(self.options.thumbnail_points)))
                    .collect(),
            };
            self.write_json(&dir.join(format!("{}.json", file)), &doc)?;
            self.write_json(&dir.join(format!("{}{}.json", file, THUMBNAIL_SUFFIX)), &thumb)?;
            rollups += 1;
        }

        let timerange_path = self.root.join(TIMERANGE_FILE);
        self.write_json(&timerange_path, &timerange)?;

        let report = DumpReport {
            documents,
            rollups,
            files_written: self.files_written,
            first_ts: timerange.first_ts,
            last_ts: timerange.last_ts,
            output_root: self.root.clone(),
        };

        info!(
            target: "observer::dump",
            documents = report.documents,
            rollups = report.rollups,
            files = report.files_written,
            first = %timerange.first_ts.map(|t| Timestamp::from_secs(t).to_string()).unwrap_or_default(),
            last = %timerange.last_ts.map(|t| Timestamp::from_secs(t).to_string()).unwrap_or_default(),
            "Dump finished"
        );

        Ok(report)
    }

    /// Serialize `value` to a temporary file next to `path`, then rename it
    /// into place.
    fn write_json<T: Serialize>(&mut self, path: &Path, value: &T) -> DumpResult<()> {
        if self.options.cancel.is_cancelled() {
            warn!(
                target: "observer::dump",
                files_written = self.files_written,
                "Dump cancelled"
            );
            return Err(DumpError::Cancelled {
                files_written: self.files_written,
            });
        }

        let io_err = |source: io::Error| DumpError::Io {
            path: path.to_path_buf(),
            source,
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, value).map_err(|source| DumpError::Serialize {
                path: path.to_path_buf(),
                source,
            })?;
            writer.flush().map_err(io_err)?;
        }
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        self.files_written += 1;
        trace!(target: "observer::dump", path = %path.display(), "File written");
        Ok(())
    }
}

fn create_dir(path: &Path) -> DumpResult<()> {
    fs::create_dir_all(path).map_err(|source| DumpError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// SECTION 16: SHARDED INGESTION
// ============================================================================
// Hosts are spread across worker threads, each owning an independent engine.
// Cluster-wide sections always go to shard 0. `finish` is the barrier: it
// closes every channel, joins every worker and merges the shard registries.
// ============================================================================

type ShardOutput = (StatsEngine, IngestReport);

/// Parallel front end to [`StatsEngine`] for many hosts.
#[derive(Debug)]
pub struct ShardedIngestor {
    config: StatsConfig,
    senders: Vec<FlumeSender<SnapshotRecord>>,
    workers: Vec<JoinHandle<ShardOutput>>,
    submitted: u64,
}

impl ShardedIngestor {
    pub fn new(config: StatsConfig) -> EngineResult<Self> {
        let shards = config.effective_shards().max(1);
        let capacity = config.shard_channel_capacity.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);

        for shard in 0..shards {
            let (tx, rx) = flume::bounded::<SnapshotRecord>(capacity);
            let shard_config = config.clone();
            let handle = thread::Builder::new()
                .name(format!("observer-shard-{}", shard))
                .spawn(move || {
                    let mut engine = StatsEngine::new(shard_config);
                    let mut report = IngestReport::default();
                    for record in rx.iter() {
                        report.absorb(engine.ingest(&record));
                    }
                    debug!(
                        target: "observer::shard",
                        shard,
                        records = engine.records_ingested(),
                        keys = engine.registry().len(),
                        "Shard drained"
                    );
                    (engine, report)
                })?;
            senders.push(tx);
            workers.push(handle);
        }

        info!(target: "observer::shard", shards, capacity, "Sharded ingestion started");

        Ok(Self {
            config,
            senders,
            workers,
            submitted: 0,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    /// Shard owning every section of `host`.
    pub fn shard_for(&self, host: &str) -> usize {
        (xxh3_64(host.as_bytes()) % self.senders.len() as u64) as usize
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Split `record` by host and queue the parts. Blocks while a shard's
    /// channel is full.
    pub fn submit(&mut self, record: SnapshotRecord) -> EngineResult<()> {
        self.submitted += 1;

        if record.hosts().next().is_none() && !record.has_cluster_sections() {
            return self.send(0, record);
        }

        let (per_host, cluster) = record.split_by_host();
        for (host, part) in per_host {
            let shard = self.shard_for(&host);
            self.send(shard, part)?;
        }
        if let Some(cluster) = cluster {
            self.send(0, cluster)?;
        }
        Ok(())
    }

    fn send(&self, shard: usize, record: SnapshotRecord) -> EngineResult<()> {
        self.senders[shard]
            .send(record)
            .map_err(|_| EngineError::Shard(ShardError::ChannelClosed { shard }))
    }

    /// Wait for every shard and merge them into one engine.
    pub fn finish(self) -> EngineResult<(StatsEngine, IngestReport)> {
        let ShardedIngestor {
            config,
            senders,
            workers,
            submitted,
        } = self;
        drop(senders);

        let mut merged = StatsEngine::new(config);
        let mut report = IngestReport::default();
        let mut failed = None;

        for (shard, handle) in workers.into_iter().enumerate() {
            match handle.join() {
                Ok((engine, shard_report)) => {
                    merged.absorb(engine);
                    report.absorb(shard_report);
                }
                Err(_) => {
                    warn!(target: "observer::shard", shard, "Shard worker panicked");
                    if failed.is_none() {
                        failed = Some(shard);
                    }
                }
            }
        }

        if let Some(shard) = failed {
            return Err(ShardError::WorkerPanicked { shard }.into());
        }

        info!(
            target: "observer::shard",
            submitted,
            keys = merged.registry().len(),
            warnings = report.warnings.len(),
            "Shards merged"
        );

        Ok((merged, report))
    }
}

// ============================================================================
// SECTION 17: CORE TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_counter_rates_end_to_end() {
        let mut series = MetricSeries::new();
        for (ts, raw) in [(0, 100.0), (60, 150.0), (120, 225.0)] {
            series.add(ts, raw, None).unwrap();
        }

        assert_eq!(series.times(), &[0, 60, 120]);
        assert_eq!(series.deltas(), &[0.0, 50.0, 75.0]);
        assert_eq!(series.raw_totals(), &[100.0, 150.0, 225.0]);
        let rates = series.rates();
        assert!(approx(rates[0], 0.0));
        assert!(approx(rates[1], 50.0 / 60.0));
        assert!(approx(rates[2], 75.0 / 60.0));
    }

    #[test]
    fn test_counter_regression_is_reset() {
        let mut series = MetricSeries::new();
        series.add(0, 100.0, None).unwrap();
        let point = series.add(60, 80.0, None).unwrap();
        assert_eq!(point, SamplePoint { delta: 0.0, rate: 0.0 });

        let point = series.add(120, 110.0, None).unwrap();
        assert_eq!(point.delta, 30.0);
        assert!(approx(point.rate, 0.5));
    }

    #[test]
    fn test_divisor_rate() {
        let mut series = MetricSeries::new();
        series.add(0, 1000.0, Some(0.0)).unwrap();
        let point = series.add(60, 1600.0, Some(3.0)).unwrap();
        assert_eq!(point.delta, 600.0);
        assert_eq!(point.rate, 200.0);

        let point = series.add(120, 1700.0, Some(0.0)).unwrap();
        assert_eq!(point.delta, 100.0);
        assert_eq!(point.rate, 0.0);
    }

    #[test]
    fn test_repeated_timestamp_uses_epsilon() {
        let mut series = MetricSeries::new();
        series.add(60, 10.0, None).unwrap();
        let point = series.add(60, 20.0, None).unwrap();
        assert_eq!(point.rate, 10.0 / RATE_EPSILON_SECS);
    }

    #[test]
    fn test_out_of_order_leaves_state_unchanged() {
        let mut series = MetricSeries::new();
        series.add(60, 10.0, None).unwrap();
        series.add(120, 20.0, None).unwrap();
        let before = series.clone();

        let err = series.add(90, 30.0, None).unwrap_err();
        assert_eq!(
            err,
            SeriesError::OutOfOrder {
                timestamp: 90,
                last_timestamp: 120
            }
        );
        assert_eq!(series, before);

        assert!(series.add_static(30, 1.0).is_err());
        assert_eq!(series, before);
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut series = MetricSeries::new();
        assert!(matches!(
            series.add(0, f64::NAN, None),
            Err(SeriesError::NonFinite { timestamp: 0, .. })
        ));
        assert!(series.add(0, 1.0, Some(f64::INFINITY)).is_err());
        assert!(series.is_empty());
        assert_eq!(series.last_timestamp(), None);
    }

    #[test]
    fn test_add_static_and_last_value() {
        let mut series = MetricSeries::new();
        assert_eq!(series.last_value(), None);

        series.add_static(0, 42.0).unwrap();
        series.add_static(60, 17.0).unwrap();
        assert_eq!(series.raw_totals(), &[42.0, 17.0]);
        assert_eq!(series.deltas(), &[42.0, 17.0]);
        assert_eq!(series.rates(), &[42.0, 17.0]);
        assert_eq!(series.last_value(), Some(SamplePoint { delta: 17.0, rate: 17.0 }));
    }

    #[test]
    fn test_trim_keeps_cursor() {
        let mut series = MetricSeries::new();
        series.add(0, 100.0, None).unwrap();
        series.add(60, 160.0, None).unwrap();
        series.trim();

        assert!(series.is_empty());
        assert_eq!(series.last_raw_value(), Some(160.0));
        assert_eq!(series.last_timestamp(), Some(60));
        assert_eq!(series.last_value(), Some(SamplePoint { delta: 60.0, rate: 1.0 }));

        let point = series.add(120, 220.0, None).unwrap();
        assert_eq!(point.delta, 60.0);
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_to_series_full_and_compacted() {
        let mut series = MetricSeries::new();
        for i in 0..121 {
            series.add(i * 60, (i * 10) as f64, None).unwrap();
        }

        let full = series.to_series(None);
        assert_eq!(full.len(), 121);
        assert_eq!(full.last_timestamp, Some(7200));
        assert_eq!(full.last_raw_value, Some(1200.0));

        let thumb = series.to_series(Some(60));
        assert_eq!(thumb.times.len(), 41);
        assert_eq!(thumb.avgs.len(), 41);
        assert_eq!(thumb.values.len(), 41);
        assert_eq!(thumb.total.len(), 41);
        assert_eq!(thumb.times[1], 180);
        assert_eq!(thumb.last_timestamp, None);

        let json = serde_json::to_value(&thumb).unwrap();
        assert!(json.get("lastTimestamp").is_none());
        assert!(json.get("avgs").is_some());
    }

    #[rstest]
    #[case(10, 3, 3)]
    #[case(10, 10, 10)]
    #[case(5, 60, 5)]
    #[case(121, 60, 41)]
    #[case(120, 60, 60)]
    #[case(10, 0, 10)]
    fn test_compaction_lengths(#[case] len: usize, #[case] target: usize, #[case] expected: usize) {
        let values: Vec<f64> = (0..len).map(|v| v as f64).collect();
        let times: Vec<i64> = (0..len as i64).collect();
        assert_eq!(compress_average(&values, target).len(), expected);
        assert_eq!(compress_first(&times, target).len(), expected);
    }

    #[test]
    fn test_compaction_values() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        assert_eq!(compress_average(&values, 3), vec![2.0, 5.0, 7.0]);
        assert_eq!(compress_first(&values, 3), vec![1.0, 4.0, 7.0]);
        assert_eq!(compress_average(&values, 7), values.to_vec());
    }

    #[test]
    fn test_normalize_two_points() {
        let grid = normalize(&[0, 120], &[0.0, 120.0], 60);
        assert_eq!(grid.get(&60), Some(&60.0));
        assert_eq!(grid.get(&0), Some(&0.0));
        assert_eq!(grid.get(&120), None);
    }

    #[test]
    fn test_normalize_unaligned_samples() {
        let grid = normalize(&[30, 150, 200], &[0.0, 120.0, 170.0], 60);
        let expected: Normalized = [(60, 30.0), (120, 90.0), (180, 150.0)].into_iter().collect();
        assert_eq!(grid, expected);
    }

    #[test]
    fn test_normalize_degenerate_inputs() {
        assert!(normalize(&[], &[], 60).is_empty());
        assert!(normalize(&[60], &[5.0], 60).is_empty());
        assert!(normalize(&[0, 120], &[0.0, 1.0], 0).is_empty());

        let grid = normalize(&[0, 0, 120], &[5.0, 0.0, 120.0], 60);
        assert_eq!(grid.get(&0), Some(&0.0));
        assert_eq!(grid.get(&60), Some(&60.0));
    }

    #[test]
    fn test_merge_sum_constant_series() {
        let a: Normalized = (0..5).map(|i| (i * 60, 5.0)).collect();
        let b = a.clone();
        let merged = merge_sum(&[a, b]);
        assert_eq!(merged.len(), 5);
        assert!(merged.values().all(|v| *v == 10.0));
    }

    #[test]
    fn test_merge_sum_union_of_timestamps() {
        let a: Normalized = [(0, 1.0), (60, 1.0)].into_iter().collect();
        let b: Normalized = [(60, 2.0), (120, 2.0)].into_iter().collect();
        let merged = merge_sum(&[a, b]);
        let expected: Normalized = [(0, 1.0), (60, 3.0), (120, 2.0)].into_iter().collect();
        assert_eq!(merged, expected);
    }

    #[rstest]
    #[case(2.0, 2.0, 15.0)]
    #[case(1.0, 3.0, 17.5)]
    #[case(0.0, 0.0, 0.0)]
    fn test_merge_weighted_average(#[case] d1: f64, #[case] d2: f64, #[case] expected: f64) {
        let primary = vec![
            Normalized::from([(60, 10.0)]),
            Normalized::from([(60, 20.0)]),
        ];
        let divisor = vec![Normalized::from([(60, d1)]), Normalized::from([(60, d2)])];
        let merged = merge_weighted_average(&primary, &divisor);
        assert_eq!(merged.get(&60), Some(&expected));
    }

    #[test]
    fn test_weighted_average_needs_both_series() {
        let primary = vec![
            Normalized::from([(0, 10.0), (60, 10.0)]),
            Normalized::from([(0, 30.0), (60, 30.0)]),
        ];
        let divisor = vec![
            Normalized::from([(0, 1.0), (60, 1.0)]),
            Normalized::from([(60, 1.0)]),
        ];
        let merged = merge_weighted_average(&primary, &divisor);
        assert_eq!(merged.get(&0), Some(&10.0));
        assert_eq!(merged.get(&60), Some(&20.0));
    }

    #[test]
    fn test_merge_static_stable_sort() {
        let a = [(0, 1.0), (120, 3.0)];
        let b = [(0, 2.0), (60, 4.0)];
        let merged = merge_static(&[&a, &b]);
        assert_eq!(merged, vec![(0, 1.0), (0, 2.0), (60, 4.0), (120, 3.0)]);
    }

    #[test]
    fn test_timestamp_intervals() {
        let ts = Timestamp::from_secs(130);
        assert_eq!(ts.floor_to_interval(60).as_secs(), 120);
        assert_eq!(ts.ceil_to_interval(60).as_secs(), 180);
        assert_eq!(Timestamp::from_secs(120).ceil_to_interval(60).as_secs(), 120);
        assert_eq!(Timestamp::from_secs(-30).floor_to_interval(60).as_secs(), -60);
        assert_eq!(Timestamp::from_secs(-30).ceil_to_interval(60).as_secs(), 0);
        assert_eq!(Timestamp::from_secs(0).to_string(), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_timerange() {
        let mut range = TimeRange::default();
        assert!(range.is_empty());
        range.observe(120);
        range.observe(60);
        range.observe(180);
        assert_eq!(range.first_ts, Some(60));
        assert_eq!(range.last_ts, Some(180));

        let json = serde_json::to_value(range).unwrap();
        assert_eq!(json, serde_json::json!({"firstTS": 60, "lastTS": 180}));
    }

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(sanitize_file_stem("host-01.lab"), "host-01.lab");
        assert_eq!(sanitize_file_stem("a/b c"), "a_b_c");
        assert_eq!(sanitize_file_stem(".."), "_");
        assert_eq!(sanitize_file_stem(""), "_");
    }

    #[test]
    fn test_error_classification() {
        let err = EngineError::from(DumpError::Cancelled { files_written: 3 });
        assert_eq!(err.category(), "dump");
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryDump);

        let err = EngineError::from(ConfigError::invalid_value("stats.shards", "too many"));
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);

        let err = EngineError::from(SeriesError::OutOfOrder {
            timestamp: 1,
            last_timestamp: 2,
        });
        assert_eq!(err.recovery_hint(), RecoveryHint::Skip);
    }

    proptest! {
        #[test]
        fn prop_deltas_never_negative(
            steps in proptest::collection::vec((0i64..600, 0.0f64..1e12), 1..200)
        ) {
            let mut series = MetricSeries::new();
            let mut ts = 0i64;
            for (gap, raw) in steps {
                ts += gap;
                series.add(ts, raw, None).unwrap();
            }
            prop_assert!(series.deltas().iter().all(|d| *d >= 0.0));
            prop_assert!(series.rates().iter().all(|r| *r >= 0.0));
            prop_assert_eq!(series.times().len(), series.deltas().len());
            prop_assert_eq!(series.times().len(), series.raw_totals().len());
        }

        #[test]
        fn prop_compaction_lengths_match(
            values in proptest::collection::vec(-1e6f64..1e6, 0..500),
            target in 0usize..100
        ) {
            let times: Vec<i64> = (0..values.len() as i64).collect();
            let averaged = compress_average(&values, target);
            let firsts = compress_first(&times, target);
            prop_assert_eq!(averaged.len(), firsts.len());
            if target == 0 || values.len() <= target {
                prop_assert_eq!(averaged, values);
            } else {
                prop_assert!(firsts.len() <= target);
            }
        }
    }
}

// ============================================================================
// SECTION 18: REGISTRY & ENGINE TESTS
// ============================================================================

#[cfg(test)]
mod engine_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::cell::Cell;

    fn record(ts: i64, hosts: Vec<(&str, JsonValue)>) -> SnapshotRecord {
        let mut record = SnapshotRecord {
            timestamp: ts,
            snapshot: SnapshotBody::default(),
        };
        for (host, groups) in hosts {
            record.snapshot.insert_host(host, groups);
        }
        record
    }

    fn dom_key(host: &str) -> StatsKey {
        StatsKey::new([host, DOM_GROUP, "client"])
    }

    fn rates(engine: &StatsEngine, key: &StatsKey, metric: &str) -> Vec<f64> {
        engine
            .registry()
            .series(key, metric)
            .map(|s| s.rates().to_vec())
            .unwrap_or_default()
    }

    #[test]
    fn test_register_key_builds_metadata_once() {
        let mut db = StatsDb::new();
        let calls = Cell::new(0);
        let build = |_: &StatsKey| {
            calls.set(calls.get() + 1);
            KeyMetadata::new("dom", "host-01-client").identity("host", "host-01")
        };

        let first = db.register_key(StatsKey::new(["host-01", "dom"]), build);
        let second = db.register_key(StatsKey::new(["host-01", "dom"]), build);

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        assert_eq!(db.len(), 1);
        assert_eq!(db.find_by_file("dom", "host-01-client"), Some(&first));
    }

    #[test]
    fn test_file_name_collision_gets_suffix() {
        let mut db = StatsDb::new();
        let a = db.register_key(StatsKey::new(["a"]), |_| KeyMetadata::new("g", "same"));
        let b = db.register_key(StatsKey::new(["b"]), |_| KeyMetadata::new("g", "same"));

        assert_eq!(db.metadata(&a).unwrap().file, "same");
        assert_eq!(db.metadata(&b).unwrap().file, "same-2");
        assert_eq!(db.find_by_file("g", "same-2"), Some(&b));
    }

    #[test]
    fn test_series_access_requires_registration() {
        let mut db = StatsDb::new();
        let key = StatsKey::new(["host-01", "pnic", "vmnic0"]);
        assert!(db.get(&key).is_none());
        assert!(db.series_mut(&key, "rxBytes").is_none());

        db.register_key(key.clone(), |_| KeyMetadata::new("network", "host-01-vmnic0"));
        db.series_mut(&key, "rxBytes").unwrap().add(0, 1.0, None).unwrap();
        assert_eq!(db.get(&key).unwrap().len(), 1);
        assert_eq!(db.sample_count(), 1);
    }

    #[test]
    fn test_package_honors_thumbnail_fields() {
        let mut db = StatsDb::new();
        let key = db.register_key(StatsKey::new(["h", "dom"]), |_| {
            KeyMetadata::new("dom", "h")
                .identity("host", "h")
                .axis("iopsRead", "IOPS")
                .thumbnail(&["iopsRead"])
        });
        for metric in ["iopsRead", "oio"] {
            db.series_mut(&key, metric).unwrap().add_static(0, 1.0).unwrap();
        }

        let full = db.package(&key, PackageOptions::full()).unwrap();
        assert_eq!(full.stats.keys().cloned().collect::<Vec<_>>(), vec!["iopsRead", "oio"]);

        let thumb = db.package(&key, PackageOptions::thumbnail(60)).unwrap();
        assert_eq!(thumb.stats.keys().cloned().collect::<Vec<_>>(), vec!["iopsRead"]);

        let json = serde_json::to_value(&full).unwrap();
        assert_eq!(json["host"], json!("h"));
        assert_eq!(json["axes"]["iopsRead"], json!("IOPS"));
        assert_eq!(json["stats"]["oio"]["total"], json!([1.0]));
        assert_eq!(json["stats"]["oio"]["times"], json!([0]));
    }

    #[test]
    fn test_merge_first_metadata_wins() {
        let key = StatsKey::new(["h", "dom"]);

        let mut left = StatsDb::new();
        left.register_key(key.clone(), |_| KeyMetadata::new("dom", "left"));
        left.series_mut(&key, "iopsRead").unwrap().add_static(0, 1.0).unwrap();
        left.series_mut(&key, "oio").unwrap().add_static(0, 1.0).unwrap();

        let mut right = StatsDb::new();
        right.register_key(key.clone(), |_| KeyMetadata::new("dom", "right"));
        right.series_mut(&key, "iopsRead").unwrap().add_static(60, 2.0).unwrap();
        let other = StatsKey::new(["h2", "dom"]);
        right.register_key(other.clone(), |_| KeyMetadata::new("dom", "other"));

        left.merge(right, None);

        assert_eq!(left.metadata(&key).unwrap().file, "left");
        assert_eq!(left.series(&key, "iopsRead").unwrap().times(), &[60]);
        assert_eq!(left.series(&key, "oio").unwrap().times(), &[0]);
        assert!(left.contains(&other));
        assert_eq!(left.find_by_file("dom", "other"), Some(&other));
    }

    #[test]
    fn test_merge_with_filter() {
        let mut left = StatsDb::new();
        let mut right = StatsDb::new();
        let keep = right.register_key(StatsKey::new(["keep"]), |_| KeyMetadata::new("g", "keep"));
        right.register_key(StatsKey::new(["skip"]), |_| KeyMetadata::new("g", "skip"));

        let filter: AHashSet<StatsKey> = [keep.clone()].into_iter().collect();
        left.merge(right, Some(&filter));

        assert_eq!(left.sorted_keys(), vec![&keep]);
    }

    #[test]
    fn test_trim_keeps_keys_and_metadata() {
        let mut db = StatsDb::new();
        let key = db.register_key(StatsKey::new(["h"]), |_| KeyMetadata::new("g", "h"));
        let series = db.series_mut(&key, "m").unwrap();
        series.add(0, 10.0, None).unwrap();
        series.add(60, 20.0, None).unwrap();

        db.trim();

        assert_eq!(db.len(), 1);
        assert_eq!(db.sample_count(), 0);
        assert_eq!(db.metadata(&key).unwrap().file, "h");
        assert_eq!(db.series(&key, "m").unwrap().last_raw_value(), Some(20.0));
    }

    #[test]
    fn test_engine_read_counter_end_to_end() {
        let mut engine = StatsEngine::with_defaults();
        assert_eq!(engine.state(), EngineState::Init);

        for (ts, count) in [(0, 100.0), (60, 150.0), (120, 225.0)] {
            let report = engine.ingest(&record(ts, vec![("host-01", json!({"dom.client": {"readCount": count}}))]));
            assert!(report.is_clean(), "{:?}", report.warnings);
        }

        assert_eq!(engine.state(), EngineState::Accumulating);
        let series = engine.registry().series(&dom_key("host-01"), "iopsRead").unwrap();
        assert_eq!(series.deltas(), &[0.0, 50.0, 75.0]);
        assert!(approx_all(series.rates(), &[0.0, 50.0 / 60.0, 75.0 / 60.0]));
        assert_eq!(engine.timerange().first_ts, Some(0));
        assert_eq!(engine.timerange().last_ts, Some(120));
        assert_eq!(engine.records_ingested(), 3);
    }

    fn approx_all(actual: &[f64], expected: &[f64]) -> bool {
        actual.len() == expected.len() && actual.iter().zip(expected).all(|(a, b)| (a - b).abs() < 1e-9)
    }

    #[test]
    fn test_engine_latency_per_operation() {
        let mut engine = StatsEngine::with_defaults();
        engine.ingest(&record(0, vec![("h", json!({"dom.client": {"readCount": 0, "readLatencySumUs": 0}}))]));
        engine.ingest(&record(60, vec![("h", json!({"dom.client": {"readCount": 10, "readLatencySumUs": 500}}))]));
        // Latency sum moved without a matching count sample
        engine.ingest(&record(120, vec![("h", json!({"dom.client": {"readLatencySumUs": 900}}))]));

        assert_eq!(rates(&engine, &dom_key("h"), "latencyRead"), vec![0.0, 50.0, 0.0]);
        assert_eq!(rates(&engine, &dom_key("h"), "iopsRead").len(), 2);
    }

    #[test]
    fn test_engine_uses_taken_timestamp() {
        let mut engine = StatsEngine::with_defaults();
        engine.ingest(&record(
            100,
            vec![("h", json!({"pnics": {"vmnic0": {"rxBytes": 1}}, "pnics-taken": 90}))],
        ));

        let key = StatsKey::new(["h", NETWORK_GROUP, "vmnic0"]);
        assert_eq!(engine.registry().series(&key, "rxBytes").unwrap().times(), &[90]);
        assert_eq!(engine.timerange().first_ts, Some(90));
        assert_eq!(engine.timerange().last_ts, Some(100));
    }

    #[test]
    fn test_engine_rejects_bad_taken_timestamp() {
        let mut engine = StatsEngine::with_defaults();
        let report = engine.ingest(&record(
            0,
            vec![(
                "h",
                json!({
                    "pnics": {"vmnic0": {"rxBytes": 1}},
                    "pnics-taken": -1e300,
                    "pcpus": {"0": {"used": 1, "idle": 1}},
                    "pcpus-taken": "yesterday",
                    "worldlets": {"vmkworld": {"runTime": 1}},
                    "worldlets-taken": MAX_TAKEN_SKEW_SECS + 1
                }),
            )],
        ));

        let mut flagged: Vec<_> = report
            .warnings
            .iter()
            .filter(|w| w.kind == WarningKind::MalformedSection)
            .map(|w| w.section.as_str())
            .collect();
        flagged.sort_unstable();
        assert_eq!(flagged, vec!["pcpus", "pnics", "worldlets"]);
        assert_eq!(engine.registry().len(), 0);

        // the next snapshot starts the series cleanly
        let report = engine.ingest(&record(60, vec![("h", json!({"pnics": {"vmnic0": {"rxBytes": 61}}}))]));
        assert!(report.warnings.is_empty());
        let key = StatsKey::new(["h", NETWORK_GROUP, "vmnic0"]);
        assert_eq!(engine.registry().series(&key, "rxBytes").unwrap().times(), &[60]);
    }

    #[test]
    fn test_engine_survives_extreme_record_timestamps() {
        let mut engine = StatsEngine::with_defaults();
        engine.ingest(&record(i64::MIN, vec![("h", json!({"pnics": {"vmnic0": {"rxBytes": 1}}}))]));
        engine.ingest(&record(i64::MAX, vec![("h", json!({"pnics": {"vmnic0": {"rxBytes": 2}}}))]));

        let key = StatsKey::new(["h", NETWORK_GROUP, "vmnic0"]);
        let series = engine.registry().series(&key, "rxBytes").unwrap();
        assert!(series.last_value().unwrap().rate.is_finite());
    }

    #[test]
    fn test_garbled_vsi_keeps_other_sections() {
        let mut engine = StatsEngine::with_defaults();
        let report = engine
            .ingest_json(r#"{"timestamp": 60, "snapshot": {"vsi": "garbled", "inventory": {"vms": {"vm-1": {}}}}}"#)
            .unwrap();

        assert!(report
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::MalformedSection && w.section == "vsi"));
        let inv = StatsKey::new([INVENTORY_GROUP, "cluster"]);
        assert_eq!(engine.registry().series(&inv, "vmCount").unwrap().raw_totals(), &[1.0]);

        let report = engine
            .ingest_json(r#"{"timestamp": 120, "snapshot": {"vsi": null, "inventory": {"vms": {"vm-1": {}}}}}"#)
            .unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(report.sections, 1);
    }

    #[test]
    fn test_engine_unknown_and_malformed_sections() {
        let mut engine = StatsEngine::with_defaults();
        let report = engine.ingest(&record(
            0,
            vec![(
                "h",
                json!({
                    "memory": {"free": 1},
                    "dom.client": {"readCount": "lots"},
                    "pnics": {"vmnic0": {"rxBytes": 5}}
                }),
            )],
        ));

        let kinds: Vec<WarningKind> = report.warnings.iter().map(|w| w.kind).collect();
        assert!(kinds.contains(&WarningKind::UnknownSection));
        assert!(kinds.contains(&WarningKind::MalformedSection));
        assert_eq!(report.sections, 1);
        assert_eq!(report.samples, 1);
        assert!(!engine.registry().contains(&dom_key("h")));
        assert_eq!(engine.warning_counts().get(&WarningKind::UnknownSection), Some(&1));
    }

    #[test]
    fn test_engine_out_of_order_record_is_warning() {
        let mut engine = StatsEngine::with_defaults();
        engine.ingest(&record(120, vec![("h", json!({"dom.client": {"readCount": 10}}))]));
        let report = engine.ingest(&record(60, vec![("h", json!({"dom.client": {"readCount": 5}}))]));

        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, WarningKind::OutOfOrderSample);
        assert_eq!(report.warnings[0].section, "iopsRead");
        let series = engine.registry().series(&dom_key("h"), "iopsRead").unwrap();
        assert_eq!(series.times(), &[120]);
        assert_eq!(series.last_raw_value(), Some(10.0));
    }

    #[test]
    fn test_engine_pcpu_used_pct() {
        let mut engine = StatsEngine::with_defaults();
        engine.ingest(&record(
            0,
            vec![("h", json!({"pcpus": {"0": {"used": 0, "idle": 0}, "1": {"used": 0, "idle": 0}}}))],
        ));
        engine.ingest(&record(
            60,
            vec![(
                "h",
                json!({"pcpus": {"0": {"used": 30e6, "idle": 30e6}, "1": {"used": 10e6, "idle": 50e6}}}),
            )],
        ));

        let key = StatsKey::new(["h", CPU_GROUP, "pcpu"]);
        let used = engine.registry().series(&key, "usedPct").unwrap();
        assert_eq!(used.times(), &[60]);
        assert!((used.rates()[0] - 100.0 / 3.0).abs() < 1e-9);
        assert!(engine.registry().series(&key, "cpu1.idle").is_some());
    }

    #[test]
    fn test_engine_cmmds_counts_drop_to_zero() {
        let mut engine = StatsEngine::with_defaults();
        let mut first = record(0, vec![]);
        first.snapshot.cmmds = Some(json!({
            "clusterDirs": {"p1": [
                {"type": "DOM_OBJECT", "uuid": "a", "content": {}, "md5sum": "x"},
                {"type": "LSOM_OBJECT", "uuid": "b", "content": {}, "md5sum": "y", "owner": "h1"},
                {"type": "LSOM_OBJECT", "uuid": "c", "content": {}, "md5sum": "z", "owner": "h2"}
            ]},
            "clusterInfos": {"h1": {"memberCount": 3}}
        }));
        let mut second = record(60, vec![]);
        second.snapshot.cmmds = Some(json!({
            "clusterDirs": {"p1": [
                {"type": "LSOM_OBJECT", "uuid": "b", "content": {}, "md5sum": "y", "owner": "h1"}
            ]}
        }));

        assert!(engine.ingest(&first).is_clean());
        assert!(engine.ingest(&second).is_clean());

        let key = StatsKey::new([CMMDS_GROUP, "dirs", "p1"]);
        let db = engine.registry();
        assert_eq!(db.series(&key, "entries.LSOM_OBJECT").unwrap().raw_totals(), &[2.0, 1.0]);
        assert_eq!(db.series(&key, "entries.DOM_OBJECT").unwrap().raw_totals(), &[1.0, 0.0]);
        assert_eq!(db.series(&key, "components.h2").unwrap().raw_totals(), &[1.0, 0.0]);

        let info = StatsKey::new([CMMDS_GROUP, "info", "h1"]);
        assert_eq!(db.series(&info, "memberCount").unwrap().raw_totals(), &[3.0]);
    }

    #[test]
    fn test_engine_inventory_and_capacity() {
        let mut engine = StatsEngine::with_defaults();
        let mut rec = record(
            0,
            vec![(
                "h",
                json!({"lsom.capacity": {"disk-1": {"capacity": 1000, "capacityUsed": 250}}}),
            )],
        );
        rec.snapshot.inventory = Some(json!({"vms": {"vm-1": {}, "vm-2": {}}, "hosts": ["h"]}));
        rec.snapshot.vcinfo = Some(json!({"version": "8.0"}));
        assert!(engine.ingest(&rec).is_clean());

        let db = engine.registry();
        let inv = StatsKey::new([INVENTORY_GROUP, "cluster"]);
        assert_eq!(db.series(&inv, "vmCount").unwrap().raw_totals(), &[2.0]);
        assert_eq!(db.series(&inv, "hostCount").unwrap().raw_totals(), &[1.0]);

        let cap = StatsKey::new(["h", CAPACITY_GROUP, "disk-1"]);
        assert_eq!(db.series(&cap, "usedPct").unwrap().raw_totals(), &[25.0]);
        assert!(db.series(&cap, "capacityReserved").is_none());
    }

    #[test]
    fn test_ingest_json_rejects_bad_envelope() {
        let mut engine = StatsEngine::with_defaults();
        let err = engine.ingest_json("{\"snapshot\": {}}").unwrap_err();
        assert!(matches!(err, EngineError::Decode(DecodeError::Record(_))));
        assert_eq!(engine.state(), EngineState::Init);

        let report = engine
            .ingest_json(r#"{"timestamp": 5, "snapshot": {"vsi": {"h": {"worldlets": {"vmkworld": {"runTime": 1}}}}}}"#)
            .unwrap();
        assert_eq!(report.samples, 1);
    }

    #[test]
    fn test_split_by_host() {
        let mut rec = record(
            0,
            vec![("a", json!({"pcpus": {}})), ("b", json!({"pcpus": {}}))],
        );
        rec.snapshot.inventory = Some(json!({"vms": {}}));

        let (hosts, cluster) = rec.split_by_host();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].0, "a");
        assert_eq!(hosts[0].1.snapshot.host_groups().unwrap().len(), 1);
        let cluster = cluster.unwrap();
        assert!(cluster.snapshot.vsi.is_none());
        assert!(cluster.snapshot.inventory.is_some());
    }

    fn latency_record(ts: i64, hosts: &[(&str, f64, f64)]) -> SnapshotRecord {
        record(
            ts,
            hosts
                .iter()
                .map(|(host, count, latency)| {
                    (
                        *host,
                        json!({"dom.client": {"readCount": count, "readLatencySumUs": latency}}),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_rollup_weights_latency_by_iops() {
        let mut engine = StatsEngine::with_defaults();
        // a: 1 IOPS at 10us, b: 3 IOPS at 20us
        for step in 0..3i64 {
            let n = step as f64;
            engine.ingest(&latency_record(
                step * 60,
                &[("a", 60.0 * n, 600.0 * n), ("b", 180.0 * n, 3600.0 * n)],
            ));
        }

        let rules = default_rollup_rules();
        let rule = rules.iter().find(|r| r.file == "dom-client").unwrap();
        let doc = build_rollup(engine.registry(), rule, 60).unwrap();

        let latency = &doc.stats["latencyRead"];
        assert_eq!(latency.times, vec![0, 60]);
        assert_eq!(latency.avgs, vec![0.0, 17.5]);
        // cluster-wide latency-sum increase per interval
        assert_eq!(latency.values, vec![0.0, 4200.0]);

        let iops = &doc.stats["iopsRead"];
        assert_eq!(iops.avgs, vec![0.0, 4.0]);
        assert_eq!(doc.identity["entities"], json!(2));
        assert_eq!(doc.identity["role"], json!("client"));

        let owner = rules.iter().find(|r| r.file == "dom-owner").unwrap();
        assert!(build_rollup(engine.registry(), owner, 60).is_none());
    }

    #[test]
    fn test_rollup_static_concatenates() {
        let mut engine = StatsEngine::with_defaults();
        for (ts, used) in [(0, 100.0), (60, 200.0)] {
            engine.ingest(&record(
                ts,
                vec![
                    ("a", json!({"lsom.capacity": {"d1": {"capacity": 1000, "capacityUsed": used}}})),
                    ("b", json!({"lsom.capacity": {"d2": {"capacity": 1000, "capacityUsed": used * 2.0}}})),
                ],
            ));
        }

        let rule = RollupRule::new(CAPACITY_GROUP, "capacity")
            .sum(&["capacityUsed"])
            .metric("usedPct", MergeStrategy::Static);
        let doc = build_rollup(engine.registry(), &rule, 60).unwrap();

        assert_eq!(doc.stats["usedPct"].times, vec![0, 0, 60, 60]);
        assert_eq!(doc.stats["usedPct"].total, vec![10.0, 20.0, 20.0, 40.0]);
        assert_eq!(doc.stats["capacityUsed"].times, vec![0]);
        assert_eq!(doc.stats["capacityUsed"].total, vec![300.0]);
    }

    fn mixed_record(ts: i64) -> SnapshotRecord {
        let n = (ts / 60) as f64;
        let hosts = ["esx-01", "esx-02", "esx-03", "esx-04", "esx-05"];
        let mut rec = record(
            ts,
            hosts
                .iter()
                .enumerate()
                .map(|(i, host)| {
                    let k = (i + 1) as f64;
                    (
                        *host,
                        json!({
                            "dom.client": {"readCount": 100.0 * k * n, "readLatencySumUs": 900.0 * k * n},
                            "pnics": {"vmnic0": {"rxBytes": 1e6 * k * n, "txBytes": 5e5 * n}},
                            "pnics-taken": ts - i as i64,
                        }),
                    )
                })
                .collect(),
        );
        rec.snapshot.inventory = Some(json!({"vms": {"vm-1": {}}, "hosts": hosts}));
        rec
    }

    #[test]
    fn test_sharded_matches_sequential() {
        let config = StatsConfig {
            shards: 3,
            shard_channel_capacity: 2,
            ..Default::default()
        };

        let mut sequential = StatsEngine::new(config.clone());
        let mut sharded = ShardedIngestor::new(config).unwrap();
        assert_eq!(sharded.shard_count(), 3);

        for step in 0..6 {
            let rec = mixed_record(step * 60);
            sequential.ingest(&rec);
            sharded.submit(rec).unwrap();
        }
        assert_eq!(sharded.submitted(), 6);

        let (merged, report) = sharded.finish().unwrap();
        assert!(report.is_clean());

        let seq_db = sequential.registry();
        let merged_db = merged.registry();
        assert_eq!(merged_db.sorted_keys(), seq_db.sorted_keys());
        for key in seq_db.sorted_keys() {
            assert_eq!(merged_db.entry(key), seq_db.entry(key), "entry {}", key);
        }
        assert_eq!(merged.timerange(), sequential.timerange());
        assert!(merged_db.contains(&StatsKey::new([INVENTORY_GROUP, "cluster"])));
    }

    #[test]
    fn test_sharded_routes_hostless_records_to_first_shard() {
        let config = StatsConfig {
            shards: 2,
            ..Default::default()
        };
        let mut sharded = ShardedIngestor::new(config).unwrap();
        sharded
            .submit(SnapshotRecord::from_json(r#"{"timestamp": 60, "snapshot": {"vsi": "garbled"}}"#).unwrap())
            .unwrap();
        sharded
            .submit(SnapshotRecord::from_json(r#"{"timestamp": 120, "snapshot": {"vsi": {}}}"#).unwrap())
            .unwrap();

        let (merged, report) = sharded.finish().unwrap();
        assert!(report
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::MalformedSection && w.section == "vsi"));
        assert_eq!(merged.timerange().first_ts, Some(60));
        assert_eq!(merged.timerange().last_ts, Some(120));
    }

    #[test]
    fn test_shard_assignment_is_stable() {
        let config = StatsConfig {
            shards: 4,
            ..Default::default()
        };
        let ingestor = ShardedIngestor::new(config).unwrap();
        let shard = ingestor.shard_for("esx-01");
        assert!(shard < 4);
        assert_eq!(ingestor.shard_for("esx-01"), shard);
        let (engine, _) = ingestor.finish().unwrap();
        assert!(engine.registry().is_empty());
        assert_eq!(engine.state(), EngineState::Init);
    }
}

// ============================================================================
// SECTION 19: DUMP & CONFIGURATION TESTS
// ============================================================================
