//! # CPU Trend Engine
//!
//! Ingestion, classification and aggregation of per-VM CPU performance exports.
//! Turns the CSV files produced by network-element performance exports into a
//! normalized record set, recovers each virtual machine's logical name and type
//! from free-form descriptor text, and produces time-bucketed trend series with
//! a deterministic color for every legend group.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           CPU TREND ENGINE                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  RAW FILE → LOADER (schema, classify, coerce) → FILTER → AGGREGATOR → COLORS │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Two export schemas**: header detection behind banner lines, old and new CPU columns
//! - **Descriptor grammars**: `VM Name=` and `Virtual machine name=` descriptors
//! - **Ordered type rules**: first-match-wins VM type table
//! - **Stable colors**: hue families per NE, shades per VM type
//! - **Per-file cache**: content-addressed, parse once per file
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use once_cell::sync::Lazy;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize, Serializer};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{bail, Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, trace, warn, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt as tracing_fmt,
    fmt::format::{DefaultFields, Format},
    layer::SubscriberExt,
    registry::LookupSpan,
    EnvFilter,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

// ----------------------------------------------------------------------------
// Statistics & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format as FigmentFormat, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Args, Parser, Subcommand, ValueEnum};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "cpu-trend-engine";
pub const ENGINE_FULL_NAME: &str = "CPU Trend Engine";

// ----------------------------------------------------------------------------
// Header Detection
// ----------------------------------------------------------------------------

/// Number of leading lines searched for the header row
pub const DEFAULT_HEADER_SCAN_LINES: usize = 50;

/// Upper bound accepted for `loader.header_scan_lines`
pub const MAX_HEADER_SCAN_LINES: usize = 1000;

/// Both tokens must appear on the header line
pub const HEADER_MARKERS: [&str; 2] = ["Start Time", "NE Name"];

// ----------------------------------------------------------------------------
// Column Names
// ----------------------------------------------------------------------------

pub const COLUMN_START_TIME: &str = "Start Time";
pub const COLUMN_NE_NAME: &str = "NE Name";
pub const COLUMN_VM: &str = "VM";

/// Columns every export must carry regardless of schema version
pub const BASE_COLUMNS: [&str; 3] = [COLUMN_START_TIME, COLUMN_NE_NAME, COLUMN_VM];

pub const NEW_SCHEMA_MARKER: &str = "Maximum CPU Load (%)";
pub const NEW_SCHEMA_USAGE: &str = "Mean CPU Load (%)";
pub const OLD_SCHEMA_MARKER: &str = "CPU max usage (%)";
pub const OLD_SCHEMA_USAGE: &str = "CPU average usage (%)";

// ----------------------------------------------------------------------------
// Descriptor Grammar
// ----------------------------------------------------------------------------

/// Presence of this substring selects the new descriptor grammar
pub const NEW_GRAMMAR_TRIGGER: &str = "Virtual machine name=";

/// VM type used when no rule or leading-letter fallback applies
pub const UNKNOWN_VM_TYPE: &str = "UNKNOWN";

/// VM type used when new-grammar extraction fails
pub const ERROR_VM_TYPE: &str = "ERROR";

// ----------------------------------------------------------------------------
// Aggregation
// ----------------------------------------------------------------------------

/// Default trend bucket width (2 hours)
pub const DEFAULT_BUCKET_SECS: u64 = 2 * 3600;

const NANOS_PER_SEC: i64 = 1_000_000_000;

// ----------------------------------------------------------------------------
// Colors
// ----------------------------------------------------------------------------

/// Ten hues evenly spaced around the color wheel
pub const HUE_PALETTE: [f64; 10] = [0.00, 0.10, 0.20, 0.30, 0.40, 0.50, 0.60, 0.70, 0.80, 0.90];

pub const FAMILY_SATURATION_BASE: f64 = 0.70;
pub const FAMILY_SATURATION_SPAN: f64 = 0.30;
pub const FAMILY_LIGHTNESS_BASE: f64 = 0.70;
pub const FAMILY_LIGHTNESS_SPAN: f64 = 0.20;

pub const SINGLE_SATURATION: f64 = 0.85;
pub const SINGLE_LIGHTNESS: f64 = 0.60;

// ----------------------------------------------------------------------------
// Reporting
// ----------------------------------------------------------------------------

pub const DEFAULT_TOP_N: usize = 10;
pub const MAX_TOP_N: usize = 50;
pub const DEFAULT_CPU_THRESHOLD: f64 = 80.0;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The records that flow through the pipeline. Everything here is immutable
// once built by the loader.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp
// ----------------------------------------------------------------------------

/// Sample instant in nanoseconds since the Unix epoch.
/// Export times carry no zone and are kept as UTC wall-clock values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(NANOS_PER_SEC))
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0.div_euclid(NANOS_PER_SEC)
    }

    /// Round down to the start of the enclosing interval, aligned to the epoch.
    #[inline]
    pub fn floor_to_interval(&self, interval_secs: u64) -> Self {
        let interval_nanos = (interval_secs as i64).saturating_mul(NANOS_PER_SEC);
        if interval_nanos <= 0 {
            return *self;
        }
        Self(self.0.div_euclid(interval_nanos) * interval_nanos)
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(NANOS_PER_SEC);
        let nanos = self.0.rem_euclid(NANOS_PER_SEC) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>; `None` outside the representable range
    pub fn from_datetime(dt: DateTime<Utc>) -> Option<Self> {
        dt.timestamp_nanos_opt().map(Self)
    }

    /// Create from a zone-less wall-clock time
    pub fn from_naive(naive: NaiveDateTime) -> Option<Self> {
        Self::from_datetime(naive.and_utc())
    }

    /// Calendar date of this instant
    pub fn date(&self) -> NaiveDate {
        self.to_datetime().date_naive()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S"))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.to_datetime().format("%Y-%m-%dT%H:%M:%S%.f"))
    }
}

// ----------------------------------------------------------------------------
// 3.2 File Identity
// ----------------------------------------------------------------------------

/// Content-derived identity of an uploaded file.
/// Two uploads with the same bytes share one identity and one parsed dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
pub struct FileIdentity(u64);

impl FileIdentity {
    /// Hash the raw file content
    #[inline]
    pub fn of(content: &[u8]) -> Self {
        Self(xxh3_64(content))
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for FileIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Schema Variant
// ----------------------------------------------------------------------------

/// Export schema generation, detected from the CPU columns present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVariant {
    /// `CPU max usage (%)` / `CPU average usage (%)`
    Old,
    /// `Maximum CPU Load (%)` / `Mean CPU Load (%)`
    New,
}

impl SchemaVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVariant::Old => "old",
            SchemaVariant::New => "new",
        }
    }
}

impl Display for SchemaVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.4 VM Identity
// ----------------------------------------------------------------------------

/// Logical name and type recovered from a VM descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VmIdentity {
    pub vm_name: CompactString,
    pub vm_type: CompactString,
}

impl VmIdentity {
    pub fn new(vm_name: impl Into<CompactString>, vm_type: impl Into<CompactString>) -> Self {
        Self {
            vm_name: vm_name.into(),
            vm_type: vm_type.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.5 Normalized Record
// ----------------------------------------------------------------------------

/// One valid CPU sample after loading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub timestamp: Timestamp,
    /// Verbatim from the export
    pub ne_name: CompactString,
    pub vm_name: CompactString,
    pub vm_type: CompactString,
    /// Percentage; out-of-range values are kept as exported
    pub cpu_usage: f64,
}

// ----------------------------------------------------------------------------
// 3.6 Dataset
// ----------------------------------------------------------------------------

/// Parsed content of one export file.
#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    pub identity: FileIdentity,
    pub schema: SchemaVariant,
    /// Zero-based line index of the header row
    pub header_offset: usize,
    /// Trimmed column names as found in the header
    pub columns: Vec<String>,
    /// Data rows seen after the header
    pub rows_read: usize,
    /// Rows discarded during coercion
    pub rows_dropped: usize,
    pub records: Vec<NormalizedRecord>,
}

impl Dataset {
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    /// Selectable values for the presentation layer; `None` for an empty dataset.
    pub fn filter_options(&self) -> Option<FilterOptions> {
        let first = self.records.first()?;
        let mut min_date = first.timestamp.date();
        let mut max_date = min_date;
        let mut ne_names = BTreeSet::new();
        let mut vm_types = BTreeSet::new();

        for record in &self.records {
            let date = record.timestamp.date();
            min_date = min_date.min(date);
            max_date = max_date.max(date);
            ne_names.insert(record.ne_name.clone());
            vm_types.insert(record.vm_type.clone());
        }

        Some(FilterOptions {
            min_date,
            max_date,
            ne_names: ne_names.into_iter().collect(),
            vm_types: vm_types.into_iter().collect(),
        })
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// File-level problems are reported per file and never abort a batch.
// Row-level problems are counted, not raised.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum TrendError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrendError {
    /// Check if processing of other files can continue after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            TrendError::Config(_) => false,
            TrendError::Load(e) => e.is_file_level(),
            TrendError::Output(_) => false,
            TrendError::Io(_) => true,
            TrendError::Internal(_) => false,
        }
    }

    /// Get the error category for logging/reporting
    pub fn category(&self) -> &'static str {
        match self {
            TrendError::Config(_) => "config",
            TrendError::Load(e) => e.category(),
            TrendError::Output(_) => "output",
            TrendError::Io(_) => "io",
            TrendError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
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
// 4.3 Load Errors
// ----------------------------------------------------------------------------

/// File-level ingestion failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error(
        "Unrecognized file format: no line containing 'Start Time' and 'NE Name' \
         within the first {scan_window} lines"
    )]
    SchemaNotFound { scan_window: usize },

    #[error("Missing required columns: {}", .missing.join(", "))]
    MissingColumns { missing: Vec<String> },

    #[error(
        "Unknown CPU columns: expected '{}' or '{}', found {columns:?}",
        NEW_SCHEMA_MARKER,
        OLD_SCHEMA_MARKER
    )]
    UnknownCpuColumn { columns: Vec<String> },

    #[error("Malformed header row: {message}")]
    MalformedHeader { message: String },
}

impl LoadError {
    pub fn missing_columns<I, S>(missing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LoadError::MissingColumns {
            missing: missing.into_iter().map(Into::into).collect(),
        }
    }

    /// Every load error concerns a single file; the batch goes on.
    pub fn is_file_level(&self) -> bool {
        true
    }

    pub fn category(&self) -> &'static str {
        match self {
            LoadError::SchemaNotFound { .. } => "schema_not_found",
            LoadError::MissingColumns { .. } => "missing_columns",
            LoadError::UnknownCpuColumn { .. } => "unknown_cpu_column",
            LoadError::MalformedHeader { .. } => "malformed_header",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Descriptor Errors
// ----------------------------------------------------------------------------

/// New-grammar extraction failure; recovered inside the classifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorParseError {
    #[error("descriptor has no '{trigger}' marker")]
    MissingTrigger { trigger: &'static str },
}

// ----------------------------------------------------------------------------
// 4.5 Output Errors
// ----------------------------------------------------------------------------

/// Errors from report rendering and writing
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Serialization failed: {message}")]
    SerializationFailed { message: String },

    #[error("Failed to write '{path}': {message}")]
    WriteFailed { path: PathBuf, message: String },
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type TrendResult<T> = Result<T, TrendError>;

/// Result type for loading operations
pub type LoadResult<T> = Result<T, LoadError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration: TOML file, then `CPUTREND_` environment overrides.
// Every field has a default so an empty file is a valid configuration.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration structure for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Header detection and row coercion
    pub loader: LoaderConfig,

    /// Trend bucketing
    pub aggregation: AggregationConfig,

    /// Legend color assignment
    pub colors: ColorConfig,

    /// Report content and format
    pub report: ReportConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

// ----------------------------------------------------------------------------
// 5.2 Loader Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Lines searched for the header row
    pub header_scan_lines: usize,

    /// Naive timestamp formats tried after RFC 3339, in order
    pub timestamp_formats: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            header_scan_lines: DEFAULT_HEADER_SCAN_LINES,
            timestamp_formats: default_timestamp_formats(),
        }
    }
}

fn default_timestamp_formats() -> Vec<String> {
    [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y/%m/%d %H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M",
        "%Y-%m-%dT%H:%M:%S",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ----------------------------------------------------------------------------
// 5.3 Aggregation Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Bucket width in seconds, aligned to the Unix epoch
    pub bucket_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            bucket_secs: DEFAULT_BUCKET_SECS,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.4 Color Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub mode: ColorMode,
}

// ----------------------------------------------------------------------------
// 5.5 Report Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// VMs listed in the top-N ranking
    pub top_n: usize,

    /// CPU percentage above which a sample counts as high
    pub cpu_threshold: f64,

    pub format: OutputFormat,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_TOP_N,
            cpu_threshold: DEFAULT_CPU_THRESHOLD,
            format: OutputFormat::default(),
        }
    }
}

/// Rendering of CLI reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, compact, json)
    pub format: String,

    /// Additional plain-text log file
    pub file: Option<PathBuf>,

    /// ANSI colors on the console
    pub colors: bool,

    /// Include file/line in events
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

// ----------------------------------------------------------------------------
// 5.7 Configuration Loading
// ----------------------------------------------------------------------------

impl TrendConfig {
    /// Load configuration from a TOML file merged with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: TrendConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CPUTREND_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TrendConfig = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scan = self.loader.header_scan_lines;
        if !(1..=MAX_HEADER_SCAN_LINES).contains(&scan) {
            return Err(ConfigError::invalid_value(
                "loader.header_scan_lines",
                format!("must be between 1 and {}, got {}", MAX_HEADER_SCAN_LINES, scan),
            ));
        }

        if self.loader.timestamp_formats.iter().any(|f| f.trim().is_empty()) {
            return Err(ConfigError::invalid_value(
                "loader.timestamp_formats",
                "formats must not be empty",
            ));
        }

        if self.aggregation.bucket_secs == 0 {
            return Err(ConfigError::invalid_value(
                "aggregation.bucket_secs",
                "must be greater than 0",
            ));
        }

        if !(1..=MAX_TOP_N).contains(&self.report.top_n) {
            return Err(ConfigError::invalid_value(
                "report.top_n",
                format!("must be between 1 and {}, got {}", MAX_TOP_N, self.report.top_n),
            ));
        }

        let threshold = self.report.cpu_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::invalid_value(
                "report.cpu_threshold",
                format!("must be between 0 and 100, got {}", threshold),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("must be one of {:?}", LOG_LEVELS),
            ));
        }

        if !LOG_FORMATS.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("must be one of {:?}", LOG_FORMATS),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&TrendConfig::default()).unwrap_or_default()
    }
}

// ============================================================================
// SECTION 6: LOGGING & OBSERVABILITY
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logging Initialization
// ----------------------------------------------------------------------------

/// Keeps the background log-file writer alive; drop it last.
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Initialize the global tracing subscriber
pub fn init_logging(config: &LoggingConfig) -> TrendResult<LoggingGuard> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let (file_writer, file_guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(log_file_appender(path)?);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let result = match config.format.to_lowercase().as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_fmt::layer()
                        .json()
                        .with_target(true)
                        .with_file(config.source_location)
                        .with_line_number(config.source_location),
                )
                .with(file_layer(file_writer));
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_fmt::layer()
                        .compact()
                        .with_ansi(config.colors)
                        .with_target(true),
                )
                .with(file_layer(file_writer));
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_fmt::layer()
                        .pretty()
                        .with_ansi(config.colors)
                        .with_target(true)
                        .with_file(config.source_location)
                        .with_line_number(config.source_location),
                )
                .with(file_layer(file_writer));
            tracing::subscriber::set_global_default(subscriber)
        }
    };

    result.map_err(|e| TrendError::Internal(format!("Failed to set subscriber: {}", e)))?;

    info!(
        target: "cputrend::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(LoggingGuard { _file: file_guard })
}

fn log_file_appender(path: &Path) -> TrendResult<tracing_appender::rolling::RollingFileAppender> {
    let file_name = path.file_name().ok_or_else(|| {
        ConfigError::invalid_value("logging.file", format!("'{}' does not name a file", path.display()))
    })?;
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(directory)?;
    Ok(tracing_appender::rolling::never(directory, file_name))
}

/// Plain-text layer for the optional log file
fn file_layer<S>(
    writer: Option<NonBlocking>,
) -> Option<tracing_fmt::Layer<S, DefaultFields, Format, NonBlocking>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    writer.map(|w| tracing_fmt::layer().with_writer(w).with_ansi(false))
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timing
// ----------------------------------------------------------------------------

/// Timer for pipeline steps; warns when a step exceeds its threshold.
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log the duration
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        match self.threshold_ms {
            Some(threshold) if elapsed_ms > threshold => {
                warn!(
                    target: "cputrend::perf",
                    operation = self.name,
                    elapsed_ms,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
            _ => {
                trace!(
                    target: "cputrend::perf",
                    operation = self.name,
                    elapsed_us = elapsed.as_micros() as u64,
                    "Operation completed"
                );
            }
        }

        elapsed
    }
}

// ============================================================================
// SECTION 7: DESCRIPTOR PARSER & VM TYPE CLASSIFIER
// ============================================================================
// Two descriptor grammars share one entry point:
//
//   new:    "... Virtual machine name=<SITE>_<NAME...>_<INDEX>"
//   legacy: "nodeName=..., VM Name=<NAME>, ..." or the bare name
//
// Legacy names are typed through an ordered rule table. The first matching
// rule wins, so more specific tokens must precede their prefixes.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Type Rule Table
// ----------------------------------------------------------------------------

/// One entry of the VM type table: a substring tested against the uppercased
/// VM name and the type it yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRule {
    pub pattern: Cow<'static, str>,
    pub vm_type: Cow<'static, str>,
}

impl TypeRule {
    /// Rule whose type label equals its matched token
    pub const fn token(token: &'static str) -> Self {
        Self {
            pattern: Cow::Borrowed(token),
            vm_type: Cow::Borrowed(token),
        }
    }

    pub fn new(pattern: impl Into<String>, vm_type: impl Into<String>) -> Self {
        Self {
            pattern: Cow::Owned(pattern.into().to_uppercase()),
            vm_type: Cow::Owned(vm_type.into()),
        }
    }

    #[inline]
    pub fn matches(&self, upper_name: &str) -> bool {
        upper_name.contains(self.pattern.as_ref())
    }
}

/// Built-in VM type rules in priority order
pub static VM_TYPE_RULES: [TypeRule; 19] = [
    TypeRule::token("IPU_A"),
    TypeRule::token("IPU_B_ARM"),
    TypeRule::token("IPU_B"),
    TypeRule::token("ISU_ARM"),
    TypeRule::token("ISU_C48"),
    TypeRule::token("SDU_A_ARM"),
    TypeRule::token("SDU_A"),
    TypeRule::token("SPU_CGW"),
    TypeRule::token("SPU_B"),
    TypeRule::token("SPU_C"),
    TypeRule::token("SPU_K1"),
    TypeRule::token("SPU_O"),
    TypeRule::token("SPU_P"),
    TypeRule::token("SPU_J_ARM"),
    TypeRule::token("SPU_J"),
    TypeRule::token("SPU_M_ARM"),
    TypeRule::token("SPU_M"),
    TypeRule::token("SPU_G"),
    TypeRule::token("OMU"),
];

static LEGACY_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"VM Name=([^,"]+)"#).expect("legacy VM name pattern is valid")
});

// ----------------------------------------------------------------------------
// 7.2 Descriptor Parser
// ----------------------------------------------------------------------------

/// Recovers (vm_name, vm_type) from VM descriptor text.
#[derive(Debug, Clone)]
pub struct DescriptorParser {
    rules: Vec<TypeRule>,
}

impl Default for DescriptorParser {
    fn default() -> Self {
        Self::with_rules(VM_TYPE_RULES.to_vec())
    }
}

impl DescriptorParser {
    pub fn with_rules(rules: Vec<TypeRule>) -> Self {
        Self { rules }
    }

    /// Append a rule at the lowest priority
    pub fn push_rule(&mut self, rule: TypeRule) {
        self.rules.push(rule);
    }

    /// Insert a rule ahead of all existing ones
    pub fn prepend_rule(&mut self, rule: TypeRule) {
        self.rules.insert(0, rule);
    }

    pub fn rules(&self) -> &[TypeRule] {
        &self.rules
    }

    /// Classify a descriptor. A missing descriptor yields no identity.
    pub fn classify(&self, descriptor: Option<&str>) -> Option<VmIdentity> {
        let descriptor = descriptor?;

        if descriptor.contains(NEW_GRAMMAR_TRIGGER) {
            return Some(classify_new_grammar(descriptor));
        }

        let vm_name = LEGACY_NAME_PATTERN
            .captures(descriptor)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .unwrap_or_else(|| descriptor.trim());

        Some(VmIdentity::new(vm_name, self.classify_type(vm_name)))
    }

    /// Type of a legacy VM name: first matching rule, then the leading
    /// uppercase run, then `UNKNOWN`.
    pub fn classify_type(&self, vm_name: &str) -> CompactString {
        let upper = vm_name.to_uppercase();
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(&upper)) {
            return CompactString::from(rule.vm_type.as_ref());
        }

        let prefix_len = vm_name
            .bytes()
            .take_while(|b| b.is_ascii_uppercase())
            .count();
        if prefix_len > 0 {
            CompactString::from(&vm_name[..prefix_len])
        } else {
            CompactString::from(UNKNOWN_VM_TYPE)
        }
    }
}

/// Extract identity from a new-grammar descriptor.
///
/// The text after the trigger is split on `_`. The first token is the site
/// and is dropped from the name; the last token is the instance index and
/// is dropped from the type.
pub fn parse_new_grammar(descriptor: &str) -> Result<VmIdentity, DescriptorParseError> {
    let (_, rest) = descriptor
        .split_once(NEW_GRAMMAR_TRIGGER)
        .ok_or(DescriptorParseError::MissingTrigger {
            trigger: NEW_GRAMMAR_TRIGGER,
        })?;

    let full_name = rest.trim();
    let tokens: SmallVec<[&str; 8]> = full_name.split('_').collect();
    let count = tokens.len();

    if count <= 1 {
        return Ok(VmIdentity::new(full_name, UNKNOWN_VM_TYPE));
    }

    let vm_name = CompactString::from(tokens[1..].join("_"));
    let vm_type = if count > 2 {
        CompactString::from(tokens[1..count - 1].join("_"))
    } else {
        vm_name.clone()
    };

    Ok(VmIdentity { vm_name, vm_type })
}

/// New-grammar identity; a descriptor that cannot be extracted is kept
/// verbatim with type `ERROR`.
pub fn classify_new_grammar(descriptor: &str) -> VmIdentity {
    parse_new_grammar(descriptor).unwrap_or_else(|error| {
        debug!(
            target: "cputrend::classifier",
            %error,
            descriptor,
            "Descriptor extraction failed"
        );
        VmIdentity::new(descriptor, ERROR_VM_TYPE)
    })
}

static DEFAULT_PARSER: Lazy<DescriptorParser> = Lazy::new(DescriptorParser::default);

/// Classify with the built-in rule table
pub fn classify(descriptor: Option<&str>) -> Option<VmIdentity> {
    DEFAULT_PARSER.classify(descriptor)
}

// ============================================================================
// SECTION 8: CLASSIFIER TESTS
// ============================================================================

#[cfg(test)]
mod classifier_tests {
    use super::*;
    use test_case::test_case;

    fn identity(descriptor: &str) -> (String, String) {
        let id = classify(Some(descriptor)).expect("descriptor present");
        (id.vm_name.to_string(), id.vm_type.to_string())
    }

    #[test_case("nodeName=VNFP01, VM Name=IPU_B_ARM_3, id=7", "IPU_B_ARM_3", "IPU_B_ARM" ; "arm variant before plain ipu_b")]
    #[test_case("nodeName=VNFP01, VM Name=SPU_CGW_0080", "SPU_CGW_0080", "SPU_CGW" ; "cgw")]
    #[test_case("\"nodeName=X, VM Name= SDU_A_ARM_2 \"", "SDU_A_ARM_2", "SDU_A_ARM" ; "quoted and padded")]
    #[test_case("VM Name=IPU_A_1", "IPU_A_1", "IPU_A" ; "ipu_a")]
    #[test_case("VM Name=spu_m_arm_4", "spu_m_arm_4", "SPU_M_ARM" ; "rules match case insensitively")]
    #[test_case("VM Name=OMU1", "OMU1", "OMU" ; "omu")]
    #[test_case("XYZ_9", "XYZ_9", "XYZ" ; "bare name falls back to leading capitals")]
    #[test_case("  abc_1 ", "abc_1", "UNKNOWN" ; "lowercase fallback is unknown")]
    #[test_case("", "", "UNKNOWN" ; "empty descriptor")]
    fn legacy_grammar(descriptor: &str, name: &str, vm_type: &str) {
        assert_eq!(identity(descriptor), (name.to_string(), vm_type.to_string()));
    }

    #[test_case("Virtual machine name=ARQ_SBCOMU02_OMUSBIG2_1", "SBCOMU02_OMUSBIG2_1", "SBCOMU02_OMUSBIG2" ; "site and index stripped")]
    #[test_case("Virtual machine name=SITE_ONLY", "ONLY", "ONLY" ; "two tokens share name and type")]
    #[test_case("Virtual machine name=LONELY", "LONELY", "UNKNOWN" ; "single token")]
    #[test_case("Host=h1, Virtual machine name= ARQ_VNF_7 ", "VNF_7", "VNF" ; "trigger inside descriptor")]
    fn new_grammar(descriptor: &str, name: &str, vm_type: &str) {
        assert_eq!(identity(descriptor), (name.to_string(), vm_type.to_string()));
    }

    #[test]
    fn two_token_name_equals_type() {
        let id = classify(Some("Virtual machine name=SITE_ONLY")).unwrap();
        assert_eq!(id.vm_type, id.vm_name);
    }

    #[test]
    fn null_descriptor_has_no_identity() {
        assert_eq!(classify(None), None);
    }

    #[test]
    fn new_grammar_without_trigger_is_an_error() {
        assert_eq!(
            parse_new_grammar("VM Name=OMU_1"),
            Err(DescriptorParseError::MissingTrigger {
                trigger: NEW_GRAMMAR_TRIGGER
            })
        );
    }

    #[test]
    fn failed_extraction_keeps_descriptor_as_error() {
        assert_eq!(
            classify_new_grammar("nodeName=N1, VM Name=OMU_1"),
            VmIdentity::new("nodeName=N1, VM Name=OMU_1", ERROR_VM_TYPE)
        );
        assert_eq!(
            classify_new_grammar("Virtual machine name=ARQ_VNF_7"),
            VmIdentity::new("VNF_7", "VNF")
        );
    }

    #[test]
    fn rule_table_order_is_first_match_wins() {
        let position = |token: &str| {
            VM_TYPE_RULES
                .iter()
                .position(|r| r.pattern == token)
                .unwrap()
        };
        assert!(position("IPU_B_ARM") < position("IPU_B"));
        assert!(position("SDU_A_ARM") < position("SDU_A"));
        assert!(position("SPU_J_ARM") < position("SPU_J"));
        assert!(position("SPU_M_ARM") < position("SPU_M"));
        assert_eq!(VM_TYPE_RULES.len(), 19);
    }

    #[test]
    fn custom_rules_extend_the_table() {
        let mut parser = DescriptorParser::default();
        parser.push_rule(TypeRule::new("xyz", "CUSTOM"));
        assert_eq!(parser.classify_type("XYZ_9"), "CUSTOM");

        parser.prepend_rule(TypeRule::new("spu", "ANY_SPU"));
        assert_eq!(parser.classify_type("SPU_CGW_1"), "ANY_SPU");
    }
}

// ============================================================================
// SECTION 9: SCHEMA DETECTION & LOADER
// ============================================================================
// Export files may carry banner lines above the header. The loader locates
// the header, maps the schema's CPU column, classifies every descriptor and
// drops rows that fail coercion. Parsed datasets are cached by content.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Timestamp Parsing
// ----------------------------------------------------------------------------

const DATE_ONLY_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

/// Offset-bearing forms outside RFC 3339
const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f %:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
];

/// Permissive parser for the `Start Time` column.
#[derive(Debug, Clone)]
pub struct TimestampParser {
    formats: Vec<String>,
}

impl Default for TimestampParser {
    fn default() -> Self {
        Self::new(default_timestamp_formats())
    }
}

impl TimestampParser {
    pub fn new(formats: Vec<String>) -> Self {
        Self { formats }
    }

    /// Parse a cell; `None` when no format applies.
    ///
    /// A trailing UTC offset is accepted but not applied: the export's own
    /// wall clock decides the bucket and the calendar date.
    pub fn parse(&self, raw: &str) -> Option<Timestamp> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let with_offset = DateTime::parse_from_rfc3339(raw).ok().or_else(|| {
            OFFSET_FORMATS
                .iter()
                .find_map(|format| DateTime::parse_from_str(raw, format).ok())
        });
        if let Some(dt) = with_offset {
            return Timestamp::from_naive(dt.naive_local());
        }

        for format in &self.formats {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Timestamp::from_naive(naive);
            }
        }

        DATE_ONLY_FORMATS
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .and_then(Timestamp::from_naive)
    }
}

/// Numeric coercion of a CPU cell; empty, unparsable and NaN become `None`.
pub fn coerce_cpu(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| !v.is_nan())
}

// ----------------------------------------------------------------------------
// 9.2 Header Location
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLocation {
    /// Zero-based line index
    pub line: usize,
    /// Byte offset of the line start
    pub byte_offset: usize,
}

/// First line within `scan_lines` containing every header marker.
pub fn locate_header(content: &str, scan_lines: usize) -> Option<HeaderLocation> {
    let mut byte_offset = 0;
    for (line, text) in content.split('\n').take(scan_lines).enumerate() {
        if HEADER_MARKERS.iter().all(|marker| text.contains(marker)) {
            return Some(HeaderLocation { line, byte_offset });
        }
        byte_offset += text.len() + 1;
    }
    None
}

// ----------------------------------------------------------------------------
// 9.3 Schema Descriptors
// ----------------------------------------------------------------------------

/// Column mapping of one export generation.
///
/// The marker column only identifies the generation. CPU usage is read from
/// the usage column, which holds the mean rather than the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub variant: SchemaVariant,
    pub marker_column: &'static str,
    pub usage_column: &'static str,
}

/// Checked in order; the first descriptor whose marker is present wins.
pub static SCHEMA_DESCRIPTORS: [SchemaDescriptor; 2] = [
    SchemaDescriptor {
        variant: SchemaVariant::New,
        marker_column: NEW_SCHEMA_MARKER,
        usage_column: NEW_SCHEMA_USAGE,
    },
    SchemaDescriptor {
        variant: SchemaVariant::Old,
        marker_column: OLD_SCHEMA_MARKER,
        usage_column: OLD_SCHEMA_USAGE,
    },
];

impl SchemaDescriptor {
    /// Select the descriptor for a header
    pub fn detect(columns: &ColumnIndex) -> LoadResult<&'static SchemaDescriptor> {
        SCHEMA_DESCRIPTORS
            .iter()
            .find(|schema| columns.contains(schema.marker_column))
            .ok_or_else(|| LoadError::UnknownCpuColumn {
                columns: columns.names().to_vec(),
            })
    }
}

/// Trimmed header names with first-occurrence positions.
#[derive(Debug, Clone, Default)]
pub struct ColumnIndex {
    names: Vec<String>,
    positions: AHashMap<String, usize>,
}

impl ColumnIndex {
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut index = ColumnIndex::default();
        for (position, raw) in headers.into_iter().enumerate() {
            let name = raw.trim().to_string();
            index.positions.entry(name.clone()).or_insert(position);
            index.names.push(name);
        }
        index
    }

    #[inline]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Resolved column positions for row extraction
#[derive(Debug, Clone, Copy)]
struct RowLayout {
    start_time: usize,
    ne_name: usize,
    vm: usize,
    usage: usize,
}

impl RowLayout {
    fn resolve(columns: &ColumnIndex) -> LoadResult<(Self, &'static SchemaDescriptor)> {
        let missing: Vec<&str> = BASE_COLUMNS
            .iter()
            .copied()
            .filter(|name| !columns.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(LoadError::missing_columns(missing));
        }

        let schema = SchemaDescriptor::detect(columns)?;
        let usage = columns
            .position(schema.usage_column)
            .ok_or_else(|| LoadError::missing_columns([schema.usage_column]))?;

        let layout = RowLayout {
            start_time: columns.position(COLUMN_START_TIME).unwrap_or_default(),
            ne_name: columns.position(COLUMN_NE_NAME).unwrap_or_default(),
            vm: columns.position(COLUMN_VM).unwrap_or_default(),
            usage,
        };
        Ok((layout, schema))
    }
}

// ----------------------------------------------------------------------------
// 9.4 Dataset Cache
// ----------------------------------------------------------------------------

/// Cache statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Parsed datasets keyed by content identity. Lives for the process;
/// failed loads are not cached.
#[derive(Debug, Default)]
pub struct DatasetCache {
    entries: DashMap<FileIdentity, Arc<Dataset>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached dataset or compute and store it
    pub fn get_or_compute<F, E>(&self, identity: FileIdentity, compute: F) -> Result<Arc<Dataset>, E>
    where
        F: FnOnce() -> Result<Dataset, E>,
    {
        if let Some(entry) = self.entries.get(&identity) {
            self.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(Arc::clone(entry.value()));
        }

        self.misses.fetch_add(1, AtomicOrdering::Relaxed);
        let dataset = Arc::new(compute()?);
        let stored = self
            .entries
            .entry(identity)
            .or_insert_with(|| Arc::clone(&dataset));
        Ok(Arc::clone(stored.value()))
    }

    pub fn get(&self, identity: FileIdentity) -> Option<Arc<Dataset>> {
        self.entries.get(&identity).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(AtomicOrdering::Relaxed),
            misses: self.misses.load(AtomicOrdering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.5 Loader
// ----------------------------------------------------------------------------

/// Result of one file in a batch
#[derive(Debug)]
pub struct FileOutcome {
    pub filename: String,
    pub result: LoadResult<Arc<Dataset>>,
}

impl FileOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Turns raw export bytes into cached datasets.
#[derive(Debug)]
pub struct Loader {
    parser: DescriptorParser,
    timestamps: TimestampParser,
    header_scan_lines: usize,
    cache: DatasetCache,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new(&LoaderConfig::default())
    }
}

impl Loader {
    pub fn new(config: &LoaderConfig) -> Self {
        Self::with_parser(config, DescriptorParser::default())
    }

    pub fn with_parser(config: &LoaderConfig, parser: DescriptorParser) -> Self {
        Self {
            parser,
            timestamps: TimestampParser::new(config.timestamp_formats.clone()),
            header_scan_lines: config.header_scan_lines,
            cache: DatasetCache::new(),
        }
    }

    pub fn cache(&self) -> &DatasetCache {
        &self.cache
    }

    /// Load one file, reusing the cached dataset for identical content.
    pub fn load(&self, bytes: &[u8], filename: &str) -> LoadResult<Arc<Dataset>> {
        let identity = FileIdentity::of(bytes);
        self.cache
            .get_or_compute(identity, || self.parse(identity, bytes, filename))
    }

    /// Load several files; a failing file never stops the others.
    pub fn load_batch<'a, I>(&self, files: I) -> Vec<FileOutcome>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        files
            .into_iter()
            .map(|(filename, bytes)| {
                let result = self.load(bytes, filename);
                if let Err(error) = &result {
                    warn!(
                        target: "cputrend::loader",
                        file = filename,
                        category = error.category(),
                        %error,
                        "Skipping file"
                    );
                }
                FileOutcome {
                    filename: filename.to_string(),
                    result,
                }
            })
            .collect()
    }

    /// Parse without consulting the cache
    pub fn parse(&self, identity: FileIdentity, bytes: &[u8], filename: &str) -> LoadResult<Dataset> {
        let timer = PerfTimer::with_threshold("loader.parse", 500);

        let decoded = String::from_utf8_lossy(bytes);
        let content = decoded.strip_prefix('\u{feff}').unwrap_or(decoded.as_ref());

        let header = locate_header(content, self.header_scan_lines).ok_or(LoadError::SchemaNotFound {
            scan_window: self.header_scan_lines,
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(content[header.byte_offset..].as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| LoadError::MalformedHeader {
                message: e.to_string(),
            })?
            .clone();
        let columns = ColumnIndex::from_headers(headers.iter());
        let (layout, schema) = RowLayout::resolve(&columns)?;

        let mut records = Vec::new();
        let mut rows_read = 0usize;
        let mut rows_dropped = 0usize;

        for row in reader.records() {
            rows_read += 1;
            let normalized = match row {
                Ok(row) => self.normalize_row(&row, &layout),
                Err(error) => {
                    trace!(target: "cputrend::loader", file = filename, %error, "Malformed row");
                    None
                }
            };
            match normalized {
                Some(record) => records.push(record),
                None => rows_dropped += 1,
            }
        }

        let elapsed = timer.stop();
        info!(
            target: "cputrend::loader",
            file = filename,
            identity = %identity,
            schema = %schema.variant,
            header_line = header.line,
            rows_read,
            rows_dropped,
            elapsed_ms = elapsed.as_millis() as u64,
            "File loaded"
        );

        Ok(Dataset {
            identity,
            schema: schema.variant,
            header_offset: header.line,
            columns: columns.names().to_vec(),
            rows_read,
            rows_dropped,
            records,
        })
    }

    fn normalize_row(&self, row: &csv::StringRecord, layout: &RowLayout) -> Option<NormalizedRecord> {
        let timestamp = self.timestamps.parse(row.get(layout.start_time)?)?;
        let descriptor = row.get(layout.vm).filter(|cell| !cell.trim().is_empty());
        let identity = self.parser.classify(descriptor)?;
        if identity.vm_name.is_empty() {
            return None;
        }
        let cpu_usage = row.get(layout.usage).and_then(coerce_cpu)?;

        Some(NormalizedRecord {
            timestamp,
            ne_name: CompactString::from(row.get(layout.ne_name).unwrap_or_default()),
            vm_name: identity.vm_name,
            vm_type: identity.vm_type,
            cpu_usage,
        })
    }
}

// ============================================================================
// SECTION 10: LOADER TESTS
// ============================================================================


// ============================================================================
// SECTION 11: FILTERING
// ============================================================================

/// Selectable values offered for a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterOptions {
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    /// Sorted, distinct
    pub ne_names: Vec<CompactString>,
    /// Sorted, distinct
    pub vm_types: Vec<CompactString>,
}

impl FilterOptions {
    /// Everything selected: the full date span and every NE and type
    pub fn default_selection(&self) -> FilterSelection {
        FilterSelection {
            date_range: Some((self.min_date, self.max_date)),
            ne_names: Some(self.ne_names.iter().cloned().collect()),
            vm_types: Some(self.vm_types.iter().cloned().collect()),
        }
    }
}

/// Restriction applied before aggregation. `None` means unrestricted;
/// an empty set selects nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSelection {
    /// Inclusive calendar-date range
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub ne_names: Option<BTreeSet<CompactString>>,
    pub vm_types: Option<BTreeSet<CompactString>>,
}

impl FilterSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_date_range(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.date_range = Some((from, to));
        self
    }

    pub fn with_ne_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ne_names = Some(names.into_iter().map(|s| CompactString::from(s.as_ref())).collect());
        self
    }

    pub fn with_vm_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.vm_types = Some(types.into_iter().map(|s| CompactString::from(s.as_ref())).collect());
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.date_range.is_none() && self.ne_names.is_none() && self.vm_types.is_none()
    }

    pub fn matches(&self, record: &NormalizedRecord) -> bool {
        if let Some((from, to)) = self.date_range {
            let date = record.timestamp.date();
            if date < from || date > to {
                return false;
            }
        }
        if let Some(names) = &self.ne_names {
            if !names.contains(record.ne_name.as_str()) {
                return false;
            }
        }
        if let Some(types) = &self.vm_types {
            if !types.contains(record.vm_type.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Records of `dataset` matching `selection`, in dataset order
pub fn filter(dataset: &Dataset, selection: &FilterSelection) -> Vec<NormalizedRecord> {
    dataset
        .records
        .iter()
        .filter(|record| selection.matches(record))
        .cloned()
        .collect()
}

// ============================================================================
// SECTION 12: TREND AGGREGATION
// ============================================================================
// Records are grouped by (vm_name, bucket, ne_name, vm_type); the BTreeMap key
// order is also the output order.
// ============================================================================

/// Mean CPU of one VM within one time bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendBucket {
    pub bucket_start: Timestamp,
    pub ne_name: CompactString,
    pub vm_name: CompactString,
    pub vm_type: CompactString,
    pub cpu_usage: f64,
    pub samples: u64,
}

impl TrendBucket {
    pub fn legend_key(&self, keying: LegendKeying) -> CompactString {
        keying.key(&self.ne_name, &self.vm_type)
    }
}

/// Running sum for one bucket
#[derive(Debug, Clone, Copy, Default)]
struct BucketAccumulator {
    sum: f64,
    count: u64,
}

impl BucketAccumulator {
    #[inline]
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    #[inline]
    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

type BucketKey = (CompactString, Timestamp, CompactString, CompactString);

/// Groups records into epoch-aligned buckets of fixed width.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    bucket_secs: u64,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            bucket_secs: DEFAULT_BUCKET_SECS,
        }
    }
}

impl Aggregator {
    /// Widths under one second are raised to one second
    pub fn new(bucket: Duration) -> Self {
        Self {
            bucket_secs: bucket.as_secs().max(1),
        }
    }

    pub fn from_config(config: &AggregationConfig) -> Self {
        Self::new(Duration::from_secs(config.bucket_secs))
    }

    pub fn bucket_secs(&self) -> u64 {
        self.bucket_secs
    }

    pub fn aggregate<'a, I>(&self, records: I) -> Vec<TrendBucket>
    where
        I: IntoIterator<Item = &'a NormalizedRecord>,
    {
        let timer = PerfTimer::with_threshold("aggregator.aggregate", 200);
        let mut groups: BTreeMap<BucketKey, BucketAccumulator> = BTreeMap::new();
        let mut input = 0usize;

        for record in records {
            input += 1;
            let key = (
                record.vm_name.clone(),
                record.timestamp.floor_to_interval(self.bucket_secs),
                record.ne_name.clone(),
                record.vm_type.clone(),
            );
            groups.entry(key).or_default().add(record.cpu_usage);
        }

        let buckets: Vec<TrendBucket> = groups
            .into_iter()
            .map(|((vm_name, bucket_start, ne_name, vm_type), acc)| TrendBucket {
                bucket_start,
                ne_name,
                vm_name,
                vm_type,
                cpu_usage: acc.average(),
                samples: acc.count,
            })
            .collect();

        debug!(
            target: "cputrend::aggregator",
            records = input,
            buckets = buckets.len(),
            bucket_secs = self.bucket_secs,
            elapsed_us = timer.stop().as_micros() as u64,
            "Trend aggregated"
        );

        buckets
    }
}

/// Aggregate `records` into buckets of width `bucket`
pub fn aggregate(records: &[NormalizedRecord], bucket: Duration) -> Vec<TrendBucket> {
    Aggregator::new(bucket).aggregate(records)
}

// ============================================================================
// SECTION 13: COLOR ASSIGNMENT
// ============================================================================
// Parents (NEs) take a hue from a fixed ten-hue palette; their children
// (VM types) become progressively more saturated and darker shades of it.
// The assignment depends only on the sorted key set.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Color Modes & Legend Keys
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    /// One hue per NE, legend `"{ne} - {type}"`
    #[default]
    Grouped,
    /// Hue families per NE, legend `"{type}"`
    ByType,
    /// One palette hue per VM type
    Single,
}

impl ColorMode {
    pub fn keying(&self) -> LegendKeying {
        match self {
            ColorMode::Grouped => LegendKeying::ParentAndChild,
            ColorMode::ByType | ColorMode::Single => LegendKeying::ChildOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegendKeying {
    ParentAndChild,
    ChildOnly,
}

impl LegendKeying {
    pub fn key(&self, parent: &str, child: &str) -> CompactString {
        match self {
            LegendKeying::ParentAndChild => CompactString::from(format!("{} - {}", parent, child)),
            LegendKeying::ChildOnly => CompactString::from(child),
        }
    }
}

/// Anything carrying an (NE, VM type) pair
pub trait LegendSource {
    fn parent_key(&self) -> &str;
    fn child_key(&self) -> &str;
}

impl LegendSource for NormalizedRecord {
    fn parent_key(&self) -> &str {
        &self.ne_name
    }

    fn child_key(&self) -> &str {
        &self.vm_type
    }
}

impl LegendSource for TrendBucket {
    fn parent_key(&self) -> &str {
        &self.ne_name
    }

    fn child_key(&self) -> &str {
        &self.vm_type
    }
}

/// Parent → sorted children
pub type GroupedKeys = BTreeMap<CompactString, BTreeSet<CompactString>>;

pub fn group_keys<'a, I, T>(items: I) -> GroupedKeys
where
    I: IntoIterator<Item = &'a T>,
    T: LegendSource + 'a,
{
    let mut groups = GroupedKeys::new();
    for item in items {
        groups
            .entry(CompactString::from(item.parent_key()))
            .or_default()
            .insert(CompactString::from(item.child_key()));
    }
    groups
}

// ----------------------------------------------------------------------------
// 13.2 RGB & HLS Conversion
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Convert from hue, lightness, saturation, each in [0, 1]
    pub fn from_hls(hue: f64, lightness: f64, saturation: f64) -> Self {
        let (r, g, b) = hls_to_rgb(hue, lightness, saturation);
        Self {
            r: to_channel(r),
            g: to_channel(g),
            b: to_channel(b),
        }
    }
}

impl Display for Rgb {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Serialize for Rgb {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[inline]
fn to_channel(component: f64) -> u8 {
    (component * 255.0).round().clamp(0.0, 255.0) as u8
}

const ONE_THIRD: f64 = 1.0 / 3.0;
const ONE_SIXTH: f64 = 1.0 / 6.0;
const TWO_THIRD: f64 = 2.0 / 3.0;

/// HLS → RGB with the conventional two-intermediate formulation
pub fn hls_to_rgb(h: f64, l: f64, s: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (l, l, l);
    }
    let m2 = if l <= 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let m1 = 2.0 * l - m2;
    (
        hue_component(m1, m2, h + ONE_THIRD),
        hue_component(m1, m2, h),
        hue_component(m1, m2, h - ONE_THIRD),
    )
}

fn hue_component(m1: f64, m2: f64, hue: f64) -> f64 {
    let hue = hue.rem_euclid(1.0);
    if hue < ONE_SIXTH {
        m1 + (m2 - m1) * hue * 6.0
    } else if hue < 0.5 {
        m2
    } else if hue < TWO_THIRD {
        m1 + (m2 - m1) * (TWO_THIRD - hue) * 6.0
    } else {
        m1
    }
}

// ----------------------------------------------------------------------------
// 13.3 Assignment
// ----------------------------------------------------------------------------

/// Legend key → color
pub type ColorMap = BTreeMap<CompactString, Rgb>;

/// Saturation and lightness of child `index` among `count` siblings
pub fn family_shade(index: usize, count: usize) -> (f64, f64) {
    let step = index as f64 / count.saturating_sub(1).max(1) as f64;
    (
        FAMILY_SATURATION_BASE + step * FAMILY_SATURATION_SPAN,
        FAMILY_LIGHTNESS_BASE - step * FAMILY_LIGHTNESS_SPAN,
    )
}

/// Hue families per parent. With `ChildOnly` keying, a child label shared by
/// several parents keeps the color of the first parent in sorted order.
pub fn assign_colors(groups: &GroupedKeys, keying: LegendKeying) -> ColorMap {
    let mut colors = ColorMap::new();
    for (i, (parent, children)) in groups.iter().enumerate() {
        let hue = HUE_PALETTE[i % HUE_PALETTE.len()];
        let count = children.len();
        for (j, child) in children.iter().enumerate() {
            let (saturation, lightness) = family_shade(j, count);
            colors
                .entry(keying.key(parent, child))
                .or_insert_with(|| Rgb::from_hls(hue, lightness, saturation));
        }
    }
    colors
}

/// One palette hue per distinct child label
pub fn assign_colors_single<I, S>(children: I) -> ColorMap
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let sorted: BTreeSet<CompactString> = children
        .into_iter()
        .map(|c| CompactString::from(c.as_ref()))
        .collect();
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, child)| {
            let hue = HUE_PALETTE[i % HUE_PALETTE.len()];
            (child, Rgb::from_hls(hue, SINGLE_LIGHTNESS, SINGLE_SATURATION))
        })
        .collect()
}

/// Color map for `groups` under `mode`
pub fn colors(groups: &GroupedKeys, mode: ColorMode) -> ColorMap {
    match mode {
        ColorMode::Grouped | ColorMode::ByType => assign_colors(groups, mode.keying()),
        ColorMode::Single => assign_colors_single(groups.values().flatten()),
    }
}

// ============================================================================
// SECTION 14: FILTER, AGGREGATION & COLOR TESTS
// ============================================================================

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn at(hour: u32, minute: u32) -> Timestamp {
        Timestamp::from_naive(
            NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(hour, minute, 0)
                .unwrap(),
        )
        .unwrap()
    }

    fn record(ts: Timestamp, ne: &str, vm: &str, vm_type: &str, cpu: f64) -> NormalizedRecord {
        NormalizedRecord {
            timestamp: ts,
            ne_name: ne.into(),
            vm_name: vm.into(),
            vm_type: vm_type.into(),
            cpu_usage: cpu,
        }
    }

    fn dataset(records: Vec<NormalizedRecord>) -> Dataset {
        Dataset {
            identity: FileIdentity::of(b"fixture"),
            schema: SchemaVariant::Old,
            header_offset: 0,
            columns: Vec::new(),
            rows_read: records.len(),
            rows_dropped: 0,
            records,
        }
    }

    fn groups(pairs: &[(&str, &str)]) -> GroupedKeys {
        let mut groups = GroupedKeys::new();
        for (parent, child) in pairs {
            groups
                .entry(CompactString::from(*parent))
                .or_default()
                .insert(CompactString::from(*child));
        }
        groups
    }

    // ------------------------------------------------------------------------
    // Filtering
    // ------------------------------------------------------------------------

    #[test]
    fn filter_is_inclusive_on_dates() {
        let day = |d| NaiveDate::from_ymd_opt(2024, 5, d).unwrap();
        let ts = |d| Timestamp::from_naive(day(d).and_hms_opt(23, 59, 0).unwrap()).unwrap();
        let data = dataset(vec![
            record(ts(1), "NE1", "A_1", "A", 1.0),
            record(ts(2), "NE1", "A_1", "A", 2.0),
            record(ts(3), "NE1", "A_1", "A", 3.0),
        ]);

        let kept = filter(&data, &FilterSelection::all().with_date_range(day(2), day(3)));
        let usage: Vec<f64> = kept.iter().map(|r| r.cpu_usage).collect();
        assert_eq!(usage, vec![2.0, 3.0]);
    }

    #[test]
    fn filter_by_ne_and_type() {
        let data = dataset(vec![
            record(at(0, 0), "NE1", "A_1", "A", 1.0),
            record(at(0, 0), "NE2", "A_2", "A", 2.0),
            record(at(0, 0), "NE1", "B_1", "B", 3.0),
        ]);

        let selection = FilterSelection::all().with_ne_names(["NE1"]).with_vm_types(["B"]);
        let kept = filter(&data, &selection);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].vm_name, "B_1");

        let nothing = FilterSelection::all().with_ne_names(Vec::<&str>::new());
        assert!(filter(&data, &nothing).is_empty());
        assert_eq!(filter(&data, &FilterSelection::all()).len(), 3);
    }

    #[test]
    fn default_selection_keeps_everything() {
        let data = dataset(vec![
            record(at(0, 0), "NE2", "A_2", "A", 2.0),
            record(at(5, 0), "NE1", "B_1", "B", 3.0),
        ]);
        let options = data.filter_options().unwrap();
        assert_eq!(options.ne_names, vec!["NE1", "NE2"]);
        assert_eq!(filter(&data, &options.default_selection()), data.records);
        assert!(dataset(Vec::new()).filter_options().is_none());
    }

    // ------------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------------

    #[test]
    fn buckets_floor_to_two_hours() {
        let records = vec![
            record(at(0, 10), "NE", "A_1", "A", 10.0),
            record(at(2, 0), "NE", "A_1", "A", 50.0),
            record(at(1, 50), "NE", "A_1", "A", 30.0),
        ];
        let buckets = aggregate(&records, Duration::from_secs(DEFAULT_BUCKET_SECS));
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, at(0, 0));
        assert_eq!(buckets[0].cpu_usage, 20.0);
        assert_eq!(buckets[0].samples, 2);
        assert_eq!(buckets[1].bucket_start, at(2, 0));
        assert_eq!(buckets[1].cpu_usage, 50.0);
    }

    #[test]
    fn single_record_per_key_is_unchanged() {
        let records = vec![
            record(at(0, 0), "NE1", "B_1", "B", 12.5),
            record(at(4, 0), "NE2", "A_1", "A", 99.0),
        ];
        let buckets = Aggregator::default().aggregate(&records);
        assert_eq!(buckets.len(), 2);
        assert_eq!((buckets[0].vm_name.as_str(), buckets[0].cpu_usage), ("A_1", 99.0));
        assert_eq!((buckets[1].vm_name.as_str(), buckets[1].cpu_usage), ("B_1", 12.5));
    }

    #[test]
    fn pre_epoch_times_floor_downwards() {
        let ts = Timestamp::from_secs(-1);
        assert_eq!(ts.floor_to_interval(7200), Timestamp::from_secs(-7200));
        assert_eq!(Timestamp::from_secs(7199).floor_to_interval(7200), Timestamp::from_secs(0));
    }

    #[test]
    fn bucket_width_is_configurable() {
        let aggregator = Aggregator::from_config(&AggregationConfig { bucket_secs: 3600 });
        let records = vec![
            record(at(0, 10), "NE", "A_1", "A", 10.0),
            record(at(1, 10), "NE", "A_1", "A", 30.0),
        ];
        assert_eq!(aggregator.aggregate(&records).len(), 2);
    }

    // ------------------------------------------------------------------------
    // Colors
    // ------------------------------------------------------------------------

    #[test]
    fn single_child_uses_base_shade() {
        assert_eq!(family_shade(0, 1), (0.70, 0.70));
        let colors = assign_colors(&groups(&[("NE1", "OMU")]), LegendKeying::ParentAndChild);
        assert_eq!(colors["NE1 - OMU"].to_string(), "#e87d7d");
    }

    #[test]
    fn children_shade_within_family() {
        let colors = assign_colors(
            &groups(&[("NE1", "OMU"), ("NE1", "IPU_A"), ("NE2", "SPU_B")]),
            LegendKeying::ParentAndChild,
        );
        // NE1 children sorted: IPU_A (lightest), OMU (full saturation, l = 0.5)
        assert_eq!(colors["NE1 - IPU_A"].to_string(), "#e87d7d");
        assert_eq!(colors["NE1 - OMU"].to_string(), "#ff0000");
        assert_eq!(colors["NE2 - SPU_B"].to_string(), "#e8bd7d");
    }

    #[test]
    fn child_keyed_collision_keeps_first_parent() {
        let colors = assign_colors(
            &groups(&[("NE2", "OMU"), ("NE1", "OMU")]),
            LegendKeying::ChildOnly,
        );
        assert_eq!(colors.len(), 1);
        assert_eq!(colors["OMU"].to_string(), "#e87d7d");
    }

    #[test]
    fn single_mode_uses_one_hue_per_child() {
        let colors = colors(&groups(&[("NE1", "OMU"), ("NE2", "IPU_A"), ("NE2", "OMU")]), ColorMode::Single);
        assert_eq!(colors.len(), 2);
        assert_eq!(colors["IPU_A"].to_string(), "#f04242");
    }

    #[test]
    fn palette_wraps_after_ten_parents() {
        let pairs: Vec<(String, String)> = (0..11).map(|i| (format!("NE{:02}", i), "OMU".to_string())).collect();
        let pairs: Vec<(&str, &str)> = pairs.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        let colors = assign_colors(&groups(&pairs), LegendKeying::ParentAndChild);
        assert_eq!(colors["NE00 - OMU"], colors["NE10 - OMU"]);
        assert_ne!(colors["NE00 - OMU"], colors["NE01 - OMU"]);
    }

    #[test]
    fn hls_matches_reference_values() {
        assert_eq!(Rgb::from_hls(0.0, 0.5, 0.0).to_string(), "#808080");
        assert_eq!(Rgb::from_hls(ONE_THIRD, 0.5, 1.0).to_string(), "#00ff00");
        assert_eq!(Rgb::from_hls(TWO_THIRD, 0.5, 1.0).to_string(), "#0000ff");
    }

    #[test]
    fn group_keys_from_records() {
        let records = vec![
            record(at(0, 0), "NE2", "A_1", "A", 1.0),
            record(at(0, 0), "NE1", "B_1", "B", 1.0),
            record(at(1, 0), "NE1", "B_2", "B", 1.0),
        ];
        let grouped = group_keys(&records);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["NE1"].len(), 1);
    }

    proptest! {
        #[test]
        fn colors_ignore_insertion_order(
            pairs in prop::collection::vec(("[A-C]{1,2}", "[X-Z]{1,3}"), 1..20)
        ) {
            let forward: Vec<(&str, &str)> = pairs.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
            let mut reversed = forward.clone();
            reversed.reverse();

            for mode in [ColorMode::Grouped, ColorMode::ByType, ColorMode::Single] {
                prop_assert_eq!(colors(&groups(&forward), mode), colors(&groups(&reversed), mode));
            }
        }

        #[test]
        fn per_vm_buckets_are_time_ordered(
            samples in prop::collection::vec((0u8..3, 0i64..86_400 * 3, 0.0f64..100.0), 1..60)
        ) {
            let records: Vec<NormalizedRecord> = samples
                .iter()
                .map(|(vm, secs, cpu)| {
                    let name = format!("VM_{}", vm);
                    record(Timestamp::from_secs(*secs), "NE", &name, "VM", *cpu)
                })
                .collect();

            let buckets = aggregate(&records, Duration::from_secs(DEFAULT_BUCKET_SECS));
            for pair in buckets.windows(2) {
                if pair[0].vm_name == pair[1].vm_name {
                    prop_assert!(pair[0].bucket_start < pair[1].bucket_start);
                } else {
                    prop_assert!(pair[0].vm_name < pair[1].vm_name);
                }
            }
            let total: u64 = buckets.iter().map(|b| b.samples).sum();
            prop_assert_eq!(total as usize, records.len());
        }
    }
}

// ============================================================================
// SECTION 15: REPORTING
// ============================================================================
// A report is built per file from the filtered records: headline KPIs, the
// bucketed trend with legend keys and colors, and three rankings.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Summary Types
// ----------------------------------------------------------------------------

pub const NO_DATA_MESSAGE: &str = "No data available for the selected filters";

/// Headline figures over the selected records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kpis {
    pub distinct_nes: usize,
    pub distinct_vms: usize,
    pub mean_cpu: f64,
    pub max_cpu: f64,
    pub samples: usize,
    pub cpu_threshold: f64,
    pub samples_above_threshold: usize,
}

impl Kpis {
    /// `None` when there is nothing to summarize
    pub fn compute(records: &[NormalizedRecord], cpu_threshold: f64) -> Option<Self> {
        if records.is_empty() {
            return None;
        }

        let mut nes = AHashSet::new();
        let mut vms = AHashSet::new();
        let mut stats = UsageStats::default();
        let mut above = 0;

        for record in records {
            nes.insert(record.ne_name.as_str());
            vms.insert(record.vm_name.as_str());
            stats.add(record.cpu_usage);
            if record.cpu_usage > cpu_threshold {
                above += 1;
            }
        }

        Some(Self {
            distinct_nes: nes.len(),
            distinct_vms: vms.len(),
            mean_cpu: stats.mean(),
            max_cpu: stats.max,
            samples: records.len(),
            cpu_threshold,
            samples_above_threshold: above,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmLoad {
    pub vm_name: CompactString,
    pub vm_type: CompactString,
    pub ne_name: CompactString,
    pub mean_cpu: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeLoad {
    pub ne_name: CompactString,
    pub mean_cpu: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeLoad {
    pub vm_type: CompactString,
    pub mean_cpu: f64,
    pub max_cpu: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, Copy)]
struct UsageStats {
    sum: f64,
    count: u64,
    max: f64,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            max: f64::NEG_INFINITY,
        }
    }
}

impl UsageStats {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.max = self.max.max(value);
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

fn group_stats<'a, K, F>(records: &'a [NormalizedRecord], key: F) -> Vec<(K, UsageStats)>
where
    K: std::hash::Hash + Eq + Ord,
    F: Fn(&'a NormalizedRecord) -> K,
{
    let mut groups: AHashMap<K, UsageStats> = AHashMap::new();
    for record in records {
        groups.entry(key(record)).or_default().add(record.cpu_usage);
    }
    let mut groups: Vec<(K, UsageStats)> = groups.into_iter().collect();
    groups.sort_by(|(ka, a), (kb, b)| {
        OrderedFloat(b.mean())
            .cmp(&OrderedFloat(a.mean()))
            .then_with(|| ka.cmp(kb))
    });
    groups
}

/// Busiest VMs by mean CPU, highest first
pub fn top_vms(records: &[NormalizedRecord], n: usize) -> Vec<VmLoad> {
    group_stats(records, |r| (r.vm_name.as_str(), r.vm_type.as_str(), r.ne_name.as_str()))
        .into_iter()
        .take(n)
        .map(|((vm_name, vm_type, ne_name), stats)| VmLoad {
            vm_name: vm_name.into(),
            vm_type: vm_type.into(),
            ne_name: ne_name.into(),
            mean_cpu: stats.mean(),
            samples: stats.count,
        })
        .collect()
}

/// NEs by mean CPU, highest first
pub fn ne_ranking(records: &[NormalizedRecord]) -> Vec<NeLoad> {
    group_stats(records, |r| r.ne_name.as_str())
        .into_iter()
        .map(|(ne_name, stats)| NeLoad {
            ne_name: ne_name.into(),
            mean_cpu: stats.mean(),
            samples: stats.count,
        })
        .collect()
}

/// Mean and peak CPU per VM type, highest mean first
pub fn type_comparison(records: &[NormalizedRecord]) -> Vec<TypeLoad> {
    group_stats(records, |r| r.vm_type.as_str())
        .into_iter()
        .map(|(vm_type, stats)| TypeLoad {
            vm_type: vm_type.into(),
            mean_cpu: stats.mean(),
            max_cpu: stats.max,
            samples: stats.count,
        })
        .collect()
}

// ----------------------------------------------------------------------------
// 15.2 Report Structures
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendRow {
    #[serde(flatten)]
    pub bucket: TrendBucket,
    pub legend: CompactString,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub filename: String,
    pub identity: FileIdentity,
    pub schema: SchemaVariant,
    pub rows_read: usize,
    pub rows_dropped: usize,
    pub rows_selected: usize,
    pub bucket_secs: u64,
    pub color_mode: ColorMode,
    pub kpis: Kpis,
    pub trend: Vec<TrendRow>,
    pub colors: ColorMap,
    pub top_vms: Vec<VmLoad>,
    pub ne_ranking: Vec<NeLoad>,
    pub type_comparison: Vec<TypeLoad>,
}

/// Per-file outcome of a report run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileReport {
    Ready(TrendReport),
    NoData { filename: String, message: String },
    Failed {
        filename: String,
        category: String,
        message: String,
    },
}

impl FileReport {
    pub fn failed(filename: &str, error: &TrendError) -> Self {
        FileReport::Failed {
            filename: filename.to_string(),
            category: error.category().to_string(),
            message: error.to_string(),
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            FileReport::Ready(report) => &report.filename,
            FileReport::NoData { filename, .. } | FileReport::Failed { filename, .. } => filename,
        }
    }
}

// ----------------------------------------------------------------------------
// 15.3 Report Builder
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReportBuilder {
    aggregator: Aggregator,
    color_mode: ColorMode,
    top_n: usize,
    cpu_threshold: f64,
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::from_config(&TrendConfig::default())
    }
}

impl ReportBuilder {
    pub fn from_config(config: &TrendConfig) -> Self {
        Self {
            aggregator: Aggregator::from_config(&config.aggregation),
            color_mode: config.colors.mode,
            top_n: config.report.top_n,
            cpu_threshold: config.report.cpu_threshold,
        }
    }

    pub fn with_color_mode(mut self, mode: ColorMode) -> Self {
        self.color_mode = mode;
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn build(&self, filename: &str, dataset: &Dataset, selection: &FilterSelection) -> FileReport {
        let selected = filter(dataset, selection);
        let Some(kpis) = Kpis::compute(&selected, self.cpu_threshold) else {
            info!(
                target: "cputrend::report",
                file = filename,
                rows = dataset.len(),
                "No records match the selection"
            );
            return FileReport::NoData {
                filename: filename.to_string(),
                message: NO_DATA_MESSAGE.to_string(),
            };
        };

        let buckets = self.aggregator.aggregate(&selected);
        let colors = colors(&group_keys(&buckets), self.color_mode);
        let keying = self.color_mode.keying();
        let trend = buckets
            .into_iter()
            .map(|bucket| TrendRow {
                legend: bucket.legend_key(keying),
                bucket,
            })
            .collect();

        debug!(
            target: "cputrend::report",
            file = filename,
            selected = selected.len(),
            legends = colors.len(),
            "Report built"
        );

        FileReport::Ready(TrendReport {
            filename: filename.to_string(),
            identity: dataset.identity,
            schema: dataset.schema,
            rows_read: dataset.rows_read,
            rows_dropped: dataset.rows_dropped,
            rows_selected: selected.len(),
            bucket_secs: self.aggregator.bucket_secs(),
            color_mode: self.color_mode,
            kpis,
            trend,
            colors,
            top_vms: top_vms(&selected, self.top_n),
            ne_ranking: ne_ranking(&selected),
            type_comparison: type_comparison(&selected),
        })
    }
}

// ----------------------------------------------------------------------------
// 15.4 Rendering
// ----------------------------------------------------------------------------

impl Display for TrendReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {} [{} schema, {}] ==", self.filename, self.schema, self.identity)?;
        writeln!(
            f,
            "rows: {} read, {} dropped, {} selected",
            self.rows_read, self.rows_dropped, self.rows_selected
        )?;
        writeln!(
            f,
            "NEs: {}  VMs: {}  mean CPU: {:.2}%  max CPU: {:.2}%  samples > {:.0}%: {}",
            self.kpis.distinct_nes,
            self.kpis.distinct_vms,
            self.kpis.mean_cpu,
            self.kpis.max_cpu,
            self.kpis.cpu_threshold,
            self.kpis.samples_above_threshold
        )?;

        writeln!(f, "\nTrend ({}s buckets)", self.bucket_secs)?;
        for row in &self.trend {
            let color = self
                .colors
                .get(&row.legend)
                .map(|c| c.to_string())
                .unwrap_or_default();
            writeln!(
                f,
                "  {}  {:<28} {:<28} {:>7.2}%  n={:<4} {}",
                row.bucket.bucket_start,
                row.legend.as_str(),
                row.bucket.vm_name.as_str(),
                row.bucket.cpu_usage,
                row.bucket.samples,
                color
            )?;
        }

        writeln!(f, "\nTop {} VMs by mean CPU", self.top_vms.len())?;
        for (rank, vm) in self.top_vms.iter().enumerate() {
            writeln!(
                f,
                "  {:>2}. {:<28} {:<16} {:<16} {:>7.2}%",
                rank + 1,
                vm.vm_name.as_str(),
                vm.vm_type.as_str(),
                vm.ne_name.as_str(),
                vm.mean_cpu
            )?;
        }

        writeln!(f, "\nNE ranking")?;
        for ne in &self.ne_ranking {
            writeln!(f, "  {:<28} {:>7.2}%", ne.ne_name.as_str(), ne.mean_cpu)?;
        }

        writeln!(f, "\nVM types")?;
        for t in &self.type_comparison {
            writeln!(
                f,
                "  {:<20} mean {:>7.2}%  max {:>7.2}%",
                t.vm_type.as_str(),
                t.mean_cpu,
                t.max_cpu
            )?;
        }
        Ok(())
    }
}

impl Display for FileReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FileReport::Ready(report) => Display::fmt(report, f),
            FileReport::NoData { filename, message } => {
                writeln!(f, "== {} ==", filename)?;
                writeln!(f, "{}", message)
            }
            FileReport::Failed {
                filename,
                category,
                message,
            } => {
                writeln!(f, "== {} ==", filename)?;
                writeln!(f, "error [{}]: {}", category, message)
            }
        }
    }
}

pub fn render_text(reports: &[FileReport]) -> String {
    reports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_json(reports: &[FileReport]) -> Result<String, OutputError> {
    serde_json::to_string_pretty(reports).map_err(|e| OutputError::SerializationFailed {
        message: e.to_string(),
    })
}

// ============================================================================
// SECTION 16: CLI INTERFACE
// ============================================================================

/// CPU Trend Engine - VM CPU trend reports from performance exports
#[derive(Parser, Debug)]
#[command(name = "cputrend")]
#[command(author = "AIOps Team")]
#[command(version = ENGINE_VERSION)]
#[command(about = "CPU trend reports for per-VM performance exports", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "cputrend.toml", env = "CPUTREND_CONFIG")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "CPUTREND_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, default_value = "false")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build trend reports for one or more export files
    Report(ReportArgs),

    /// Show how a file is detected and parsed
    Inspect {
        /// Export file
        file: PathBuf,
    },

    /// Classify VM descriptors
    Classify {
        /// Descriptor text, e.g. "nodeName=X, VM Name=SPU_CGW_0080"
        #[arg(required = true)]
        descriptors: Vec<String>,
    },

    /// Validate configuration file
    Validate {
        /// Show the effective settings
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Export files to load
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// First day to include (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// Last day to include (YYYY-MM-DD)
    #[arg(long)]
    pub to: Option<NaiveDate>,

    /// Only these NEs (repeatable)
    #[arg(long = "ne", value_name = "NE")]
    pub ne_names: Vec<String>,

    /// Only these VM types (repeatable)
    #[arg(long = "vm-type", value_name = "TYPE")]
    pub vm_types: Vec<String>,

    /// Output format
    #[arg(short = 'o', long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Legend coloring
    #[arg(long, value_enum)]
    pub color_mode: Option<ColorMode>,

    /// Number of VMs in the top ranking
    #[arg(long)]
    pub top_n: Option<usize>,

    /// Write the report to a file instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl ReportArgs {
    /// `--top-n` checked against the same bounds as `report.top_n`
    pub fn top_n(&self) -> AnyhowResult<Option<usize>> {
        match self.top_n {
            Some(top_n) if !(1..=MAX_TOP_N).contains(&top_n) => {
                bail!("--top-n must be between 1 and {}, got {}", MAX_TOP_N, top_n);
            }
            other => Ok(other),
        }
    }

    /// Filter selection from the command-line restrictions
    pub fn selection(&self) -> AnyhowResult<FilterSelection> {
        let mut selection = FilterSelection::all();

        match (self.from, self.to) {
            (Some(from), Some(to)) if from > to => {
                bail!("--from {} is after --to {}", from, to);
            }
            (None, None) => {}
            (from, to) => {
                selection = selection.with_date_range(
                    from.unwrap_or(NaiveDate::MIN),
                    to.unwrap_or(NaiveDate::MAX),
                );
            }
        }

        if !self.ne_names.is_empty() {
            selection = selection.with_ne_names(&self.ne_names);
        }
        if !self.vm_types.is_empty() {
            selection = selection.with_vm_types(&self.vm_types);
        }
        Ok(selection)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ----------------------------------------------------------------------------
// 16.1 Command Handlers
// ----------------------------------------------------------------------------

async fn handle_report(config: &TrendConfig, args: ReportArgs) -> AnyhowResult<()> {
    let selection = args.selection()?;
    let top_n = args.top_n()?;

    let mut builder = ReportBuilder::from_config(config);
    if let Some(mode) = args.color_mode {
        builder = builder.with_color_mode(mode);
    }
    if let Some(top_n) = top_n {
        builder = builder.with_top_n(top_n);
    }

    let loader = Loader::new(&config.loader);
    let mut reports = Vec::with_capacity(args.files.len());

    for path in &args.files {
        let filename = display_name(path);
        let loaded = match tokio::fs::read(path).await {
            Ok(bytes) => loader.load(&bytes, &filename).map_err(TrendError::from),
            Err(error) => Err(TrendError::from(error)),
        };

        let report = match loaded {
            Ok(dataset) => builder.build(&filename, &dataset, &selection),
            Err(error) => {
                warn!(
                    target: "cputrend::report",
                    file = %path.display(),
                    category = error.category(),
                    %error,
                    "File skipped"
                );
                FileReport::failed(&filename, &error)
            }
        };
        reports.push(report);
    }

    let rendered = match args.format.unwrap_or(config.report.format) {
        OutputFormat::Json => render_json(&reports)?,
        OutputFormat::Text => render_text(&reports),
    };

    match &args.output {
        Some(path) => {
            tokio::fs::write(path, rendered)
                .await
                .map_err(|e| OutputError::WriteFailed {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            println!("✅ Report written to: {}", path.display());
        }
        None => println!("{}", rendered),
    }

    let failed = reports
        .iter()
        .filter(|r| matches!(r, FileReport::Failed { .. }))
        .count();
    info!(
        target: "cputrend::report",
        files = reports.len(),
        failed,
        "Report complete"
    );
    Ok(())
}

async fn handle_inspect(config: &TrendConfig, path: &Path) -> AnyhowResult<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = display_name(path);
    let dataset = Loader::new(&config.loader)
        .load(&bytes, &filename)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    println!("📄 File: {}", filename);
    println!("   Identity:     {}", dataset.identity);
    println!("   Schema:       {}", dataset.schema);
    println!("   Header line:  {}", dataset.header_offset + 1);
    println!("   Columns:      {}", dataset.columns.join(", "));
    println!("   Rows read:    {}", dataset.rows_read);
    println!("   Rows kept:    {}", dataset.len());
    println!("   Rows dropped: {}", dataset.rows_dropped);

    match dataset.filter_options() {
        Some(options) => {
            println!("   Dates:        {} → {}", options.min_date, options.max_date);
            println!("   NEs ({}):      {}", options.ne_names.len(), options.ne_names.join(", "));
            println!("   VM types ({}): {}", options.vm_types.len(), options.vm_types.join(", "));
        }
        None => println!("⚠️  No valid rows"),
    }
    Ok(())
}

fn handle_classify(descriptors: &[String]) {
    for descriptor in descriptors {
        match classify(Some(descriptor.as_str())) {
            Some(id) => println!("{}\n   → name: {}  type: {}", descriptor, id.vm_name, id.vm_type),
            None => println!("{}\n   → (no identity)", descriptor),
        }
    }
}

fn handle_validate(path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("🔍 Validating configuration: {}", path.display());

    let config = TrendConfig::load(path)
        .with_context(|| format!("Configuration {} is invalid", path.display()))?;
    println!("✅ Configuration is valid");

    if verbose {
        println!("\n📋 Configuration summary:");
        println!("   Header scan lines: {}", config.loader.header_scan_lines);
        println!("   Timestamp formats: {}", config.loader.timestamp_formats.len());
        println!("   Bucket width:      {}s", config.aggregation.bucket_secs);
        println!("   Color mode:        {:?}", config.colors.mode);
        println!("   Top N:             {}", config.report.top_n);
        println!("   CPU threshold:     {}%", config.report.cpu_threshold);
        println!("   Output format:     {:?}", config.report.format);
        println!("   Log level:         {}", config.logging.level);
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config = TrendConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Configuration written to: {}", path.display());
        }
        None => println!("{}", config),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!("  Package: {}", ENGINE_NAME);
    println!("  Schemas: old ({}), new ({})", OLD_SCHEMA_MARKER, NEW_SCHEMA_MARKER);
    println!("  VM type rules: {}", VM_TYPE_RULES.len());
}

// ============================================================================
// SECTION 17: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => return handle_generate_config(output.as_deref()),
        Commands::Validate { verbose } => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let config_found = cli.config.exists();
    let mut config = if config_found {
        TrendConfig::load(&cli.config)
            .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?
    } else {
        TrendConfig::default()
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    }

    let _log_guard = init_logging(&config.logging).context("Failed to initialize logging")?;

    if !config_found {
        debug!(
            target: "cputrend::init",
            path = %cli.config.display(),
            "Config file not found, using defaults"
        );
    }

    match cli.command {
        Commands::Report(args) => handle_report(&config, args).await,
        Commands::Inspect { file } => handle_inspect(&config, &file).await,
        Commands::Classify { descriptors } => {
            handle_classify(&descriptors);
            Ok(())
        }
        Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. } => Ok(()),
    }
}

// ============================================================================
// SECTION 18: CONFIGURATION, REPORT & CLI TESTS
// ============================================================================


#[cfg(test)]
mod report_tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    const EXPORT: &str = "Report generated 2024-05-02\n\
Start Time,NE Name,VM,CPU max usage (%),CPU average usage (%)\n\
2024-05-01 00:00:00,NE_A,\"nodeName=N1, VM Name=SPU_CGW_0080\",70,40\n\
2024-05-01 01:00:00,NE_A,\"nodeName=N1, VM Name=SPU_CGW_0080\",75,50\n\
2024-05-01 00:30:00,NE_B,\"nodeName=N2, VM Name=OMU_1\",95,90\n\
2024-05-01 03:00:00,NE_B,\"nodeName=N2, VM Name=OMU_2\",85,70\n\
bad,NE_B,\"nodeName=N2, VM Name=OMU_2\",85,70\n";

    fn ready(report: FileReport) -> TrendReport {
        match report {
            FileReport::Ready(report) => report,
            other => panic!("expected a ready report, got {other:?}"),
        }
    }

    fn build(selection: &FilterSelection) -> FileReport {
        let dataset = Loader::default().load(EXPORT.as_bytes(), "export.csv").unwrap();
        ReportBuilder::default().build("export.csv", &dataset, selection)
    }

    #[test]
    fn kpis_over_selected_records() {
        let report = ready(build(&FilterSelection::all()));
        assert_eq!(
            report.kpis,
            Kpis {
                distinct_nes: 2,
                distinct_vms: 3,
                mean_cpu: 62.5,
                max_cpu: 90.0,
                samples: 4,
                cpu_threshold: 80.0,
                samples_above_threshold: 1,
            }
        );
        assert_eq!(report.rows_read, 5);
        assert_eq!(report.rows_dropped, 1);
        assert_eq!(report.schema, SchemaVariant::Old);
    }

    #[test]
    fn trend_rows_carry_legend_and_color() {
        let report = ready(build(&FilterSelection::all()));
        let rows: Vec<(String, String, f64)> = report
            .trend
            .iter()
            .map(|r| (r.bucket.vm_name.to_string(), r.legend.to_string(), r.bucket.cpu_usage))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("OMU_1".to_string(), "NE_B - OMU".to_string(), 90.0),
                ("OMU_2".to_string(), "NE_B - OMU".to_string(), 70.0),
                ("SPU_CGW_0080".to_string(), "NE_A - SPU_CGW".to_string(), 45.0),
            ]
        );
        assert_eq!(report.colors["NE_A - SPU_CGW"].to_string(), "#e87d7d");
        assert_eq!(report.colors["NE_B - OMU"].to_string(), "#e8bd7d");
    }

    #[test]
    fn rankings_are_descending() {
        let report = ready(build(&FilterSelection::all()));

        let vms: Vec<&str> = report.top_vms.iter().map(|v| v.vm_name.as_str()).collect();
        assert_eq!(vms, vec!["OMU_1", "OMU_2", "SPU_CGW_0080"]);

        let nes: Vec<(&str, f64)> = report
            .ne_ranking
            .iter()
            .map(|n| (n.ne_name.as_str(), n.mean_cpu))
            .collect();
        assert_eq!(nes, vec![("NE_B", 80.0), ("NE_A", 45.0)]);

        let types: Vec<(&str, f64, f64)> = report
            .type_comparison
            .iter()
            .map(|t| (t.vm_type.as_str(), t.mean_cpu, t.max_cpu))
            .collect();
        assert_eq!(types, vec![("OMU", 80.0, 90.0), ("SPU_CGW", 45.0, 50.0)]);
    }

    #[test]
    fn top_n_limits_ranking() {
        let dataset = Loader::default().load(EXPORT.as_bytes(), "export.csv").unwrap();
        let report = ready(
            ReportBuilder::default()
                .with_top_n(1)
                .build("export.csv", &dataset, &FilterSelection::all()),
        );
        assert_eq!(report.top_vms.len(), 1);
    }

    #[test]
    fn empty_selection_is_no_data_not_failure() {
        match build(&FilterSelection::all().with_ne_names(["NE_Z"])) {
            FileReport::NoData { filename, message } => {
                assert_eq!(filename, "export.csv");
                assert_eq!(message, NO_DATA_MESSAGE);
            }
            other => panic!("expected no-data outcome, got {other:?}"),
        }
    }

    #[test]
    fn by_type_mode_keys_legend_by_type() {
        let dataset = Loader::default().load(EXPORT.as_bytes(), "export.csv").unwrap();
        let report = ready(
            ReportBuilder::default()
                .with_color_mode(ColorMode::ByType)
                .build("export.csv", &dataset, &FilterSelection::all()),
        );
        assert!(report.colors.contains_key("OMU"));
        assert_eq!(report.trend[0].legend, "OMU");
    }

    #[test]
    fn json_rendering_tags_status() {
        let failed = FileReport::failed(
            "bad.csv",
            &TrendError::from(LoadError::SchemaNotFound { scan_window: 50 }),
        );
        let rendered = render_json(&[build(&FilterSelection::all()), failed]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();

        assert_eq!(value[0]["status"], "ready");
        assert_eq!(value[0]["kpis"]["distinct_nes"], 2);
        assert_eq!(value[0]["trend"][0]["legend"], "NE_B - OMU");
        assert_eq!(value[0]["trend"][0]["bucket_start"], "2024-05-01T00:00:00");
        assert_eq!(value[0]["colors"]["NE_A - SPU_CGW"], "#e87d7d");
        assert_eq!(value[1]["status"], "failed");
        assert_eq!(value[1]["category"], "schema_not_found");
    }

    #[test]
    fn text_rendering_lists_sections() {
        let text = render_text(&[build(&FilterSelection::all())]);
        assert!(text.contains("== export.csv [old schema"));
        assert!(text.contains("NE_A - SPU_CGW"));
        assert!(text.contains("#e87d7d"));
        assert!(text.contains("NE ranking"));
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn report_arguments_build_selection() {
        let cli = Cli::try_parse_from([
            "cputrend", "report", "a.csv", "b.csv", "--from", "2024-05-01", "--ne", "NE1", "--ne",
            "NE2", "-o", "text",
        ])
        .unwrap();

        let Commands::Report(args) = cli.command else {
            panic!("expected report command");
        };
        assert_eq!(args.files.len(), 2);
        assert_eq!(args.format, Some(OutputFormat::Text));

        let selection = args.selection().unwrap();
        let from = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(selection.date_range, Some((from, NaiveDate::MAX)));
        assert_eq!(selection.ne_names.map(|s| s.len()), Some(2));
        assert_eq!(selection.vm_types, None);
    }

    #[test]
    fn top_n_outside_bounds_is_rejected() {
        let parse = |value: &str| {
            let cli = Cli::try_parse_from(["cputrend", "report", "a.csv", "--top-n", value]).unwrap();
            let Commands::Report(args) = cli.command else {
                panic!("expected report command");
            };
            args.top_n()
        };
        assert!(parse("500").is_err());
        assert!(parse("0").is_err());
        assert_eq!(parse("50").unwrap(), Some(MAX_TOP_N));
    }

    #[test]
    fn inverted_date_range_is_rejected() {
        let cli = Cli::try_parse_from([
            "cputrend", "report", "a.csv", "--from", "2024-05-02", "--to", "2024-05-01",
        ])
        .unwrap();
        let Commands::Report(args) = cli.command else {
            panic!("expected report command");
        };
        assert!(args.selection().is_err());
    }
}
