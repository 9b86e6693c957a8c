//! # Engine Exporter
//!
//! Fans in the hierarchical, path-named telemetry published by one or more
//! storage-engine processes and re-exposes it as a flat, labeled Prometheus
//! catalog.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              ENGINE EXPORTER                              │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ENGINE SOURCES → FAN-IN CHANNEL → PATH DECOMPOSER → VECTOR MAPS → FLUSH  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Every engine process is wrapped in an [`EngineSource`] that tags each
//!   metric with the engine's rank.
//! - One scrape spawns a producer per source; all producers write to a single
//!   rendezvous channel drained by the aggregation loop.
//! - Paths such as `io_3_/fetch_latency_1KB` are decomposed into labels
//!   (`target="3"`) and a stable series name.
//! - Per-size latency statistics are folded into [`EngineHistogramVec`], which
//!   accepts already-bucketed samples and emits cumulative buckets.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{btree_map, BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Channels & Cancellation
// ----------------------------------------------------------------------------
use crossbeam::channel::{bounded, Sender};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String, Hashing & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;
use smallvec::SmallVec;
use xxhash_rust::xxh3::Xxh3;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::{NoExpand, Regex};

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// HTTP
// ----------------------------------------------------------------------------
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::core::{Collector as PromCollector, Desc};
use prometheus::proto::{
    Bucket, Histogram as ProtoHistogram, LabelPair, Metric as ProtoMetric, MetricFamily,
    MetricType,
};
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "engine-exporter";

// ----------------------------------------------------------------------------
// Metric Naming
// ----------------------------------------------------------------------------

/// Namespace prepended to every series exported from engine telemetry
pub const METRIC_NAMESPACE: &str = "engine";

/// Subsystem for the exporter's own series
pub const EXPORTER_SUBSYSTEM: &str = "exporter";

pub const RANK_LABEL: &str = "rank";
pub const TARGET_LABEL: &str = "target";
pub const CONTEXT_LABEL: &str = "context";

/// Per-instance identifiers; removed from the path, never promoted to labels
const ID_SEGMENT_PATTERN: &str = r"ID_+(\d+)_?";

/// I/O target segments; the digits become the `target` label
const IO_SEGMENT_PATTERN: &str = r"io_+(\d+)_?";

/// Network context segments; the digit groups become `rank` and `context`
const NET_SEGMENT_PATTERN: &str = r"net_+(\d+)_+(\d+)_?";

/// Families of per-size latency statistics folded into histograms.
/// Group 1 is the histogram name, group 2 the size-class token.
const LATENCY_HISTOGRAM_PATTERNS: [&str; 2] = [
    r"(engine_io_fetch_latency)_(\w+)",
    r"(engine_io_update_latency)_(\w+)",
];

// ----------------------------------------------------------------------------
// Network & Files
// ----------------------------------------------------------------------------

/// Default listen address for the `/metrics` endpoint
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9191";

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "engine-exporter.toml";

/// Prefix for environment overrides (`ENGINE_EXPORTER_EXPORTER__LISTEN_ADDR`)
pub const ENV_PREFIX: &str = "ENGINE_EXPORTER_";

const COLLECTOR_LOG_TARGET: &str = "engine_exporter::collector";
const SOURCE_LOG_TARGET: &str = "engine_exporter::source";
const HTTP_LOG_TARGET: &str = "engine_exporter::http";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The records consumed from an engine's telemetry tree and the label sets
// derived from them.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Metric Statistics
// ----------------------------------------------------------------------------

/// Summary statistics carried by statistics-bearing metrics.
///
/// `sample_count == 0` means the engine has not recorded anything yet and no
/// derived series should be emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub sum: f64,
    pub sample_count: u64,
}

impl MetricStats {
    /// Stats with a mean, sum and sample count; min/max/stddev left at zero
    pub fn with_mean(mean: f64, sum: f64, sample_count: u64) -> Self {
        Self {
            mean,
            sum,
            sample_count,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// 3.2 Metric Values
// ----------------------------------------------------------------------------

/// Closed set of metric kinds an engine can publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricValue {
    /// A value that can go up and down
    Gauge { value: f64 },

    /// A gauge that also tracks statistics over its samples
    StatsGauge { value: f64, stats: MetricStats },

    /// A monotonically increasing counter, already cumulative upstream
    Counter { value: u64 },

    /// A duration with statistics; only consumed through the latency families
    Duration { value: f64, stats: MetricStats },

    /// A point in time (seconds since the epoch)
    Timestamp { value: f64 },
}

impl MetricValue {
    /// Current scalar value as a float
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Gauge { value }
            | MetricValue::StatsGauge { value, .. }
            | MetricValue::Duration { value, .. }
            | MetricValue::Timestamp { value } => *value,
            MetricValue::Counter { value } => *value as f64,
        }
    }

    /// Statistics, for the kinds that carry them
    pub fn stats(&self) -> Option<&MetricStats> {
        match self {
            MetricValue::StatsGauge { stats, .. } | MetricValue::Duration { stats, .. } => {
                Some(stats)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge { .. } => MetricKind::Gauge,
            MetricValue::StatsGauge { .. } => MetricKind::StatsGauge,
            MetricValue::Counter { .. } => MetricKind::Counter,
            MetricValue::Duration { .. } => MetricKind::Duration,
            MetricValue::Timestamp { .. } => MetricKind::Timestamp,
        }
    }
}

/// Tag of a [`MetricValue`], used for logging and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    StatsGauge,
    Counter,
    Duration,
    Timestamp,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::StatsGauge => write!(f, "stats_gauge"),
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Duration => write!(f, "duration"),
            MetricKind::Timestamp => write!(f, "timestamp"),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric - One Record from an Engine's Telemetry Tree
// ----------------------------------------------------------------------------

/// A metric as read from an engine: slash-delimited directory `path`, leaf
/// `name`, human description and typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default)]
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(flatten)]
    pub value: MetricValue,
}

impl Metric {
    pub fn new(path: impl Into<String>, name: impl Into<String>, value: MetricValue) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            desc: String::new(),
            value,
        }
    }

    pub fn gauge(path: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self::new(path, name, MetricValue::Gauge { value })
    }

    pub fn stats_gauge(
        path: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        stats: MetricStats,
    ) -> Self {
        Self::new(path, name, MetricValue::StatsGauge { value, stats })
    }

    pub fn counter(path: impl Into<String>, name: impl Into<String>, value: u64) -> Self {
        Self::new(path, name, MetricValue::Counter { value })
    }

    pub fn duration(
        path: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        stats: MetricStats,
    ) -> Self {
        Self::new(path, name, MetricValue::Duration { value, stats })
    }

    pub fn timestamp(path: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self::new(path, name, MetricValue::Timestamp { value })
    }

    /// Attach a description
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}

/// A metric paired with the rank of the engine that produced it.
/// Lives only between fan-in and aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct RankMetric {
    pub rank: u32,
    pub metric: Metric,
}

// ----------------------------------------------------------------------------
// 3.4 Labels
// ----------------------------------------------------------------------------

/// Label values in key order. Most series carry three labels or fewer.
pub type LabelValues = SmallVec<[String; 4]>;

/// Key/value dimensions of one series, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a label
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Label keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// Label values ordered by their keys
    pub fn values(&self) -> LabelValues {
        self.0.values().cloned().collect()
    }

    /// Borrowed view in the shape the prometheus vectors expect
    pub fn as_map(&self) -> HashMap<&str, &str> {
        self.iter().collect()
    }

    /// Signature of the label set; equal sets always hash equal.
    pub fn signature(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for (key, value) in self.iter() {
            hasher.update(key.as_bytes());
            hasher.update(&[0xff]);
            hasher.update(value.as_bytes());
            hasher.update(&[0xff]);
        }
        hasher.digest()
    }

    fn to_label_pairs(&self) -> Vec<LabelPair> {
        self.iter()
            .map(|(key, value)| {
                let mut pair = LabelPair::default();
                pair.set_name(key.to_string());
                pair.set_value(value.to_string());
                pair
            })
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Display for LabelSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", key, value)?;
        }
        write!(f, "}}")
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Configuration errors are fatal at construction. Reader errors are contained
// to one source for one scrape, collector errors to one metric.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Errors
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Whether a later attempt could succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Reader(_) => true,
            ExporterError::Collector(e) => e.is_recoverable(),
            ExporterError::Prometheus(_) => false,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Reader(_) => "reader",
            ExporterError::Collector(_) => "collector",
            ExporterError::Prometheus(_) => "prometheus",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

/// Result type for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors detected while building the exporter; never raised mid-scrape.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to compile {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Collector must have > 0 sources")]
    NoSources,
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
// 4.3 Reader Errors
// ----------------------------------------------------------------------------

/// Failures of an engine's telemetry traversal.
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("failed to read telemetry at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed telemetry snapshot {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("telemetry traversal failed: {message}")]
    Traversal { message: String },

    #[error("metric channel disconnected")]
    Disconnected,

    #[error("telemetry traversal panicked")]
    Panicked,
}

// ----------------------------------------------------------------------------
// 4.4 Collector Errors
// ----------------------------------------------------------------------------

/// Per-metric failures during aggregation. The metric is skipped.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("{token:?} not found in bucket map")]
    BucketNotFound { token: String },

    #[error("metric type {kind} not supported")]
    UnsupportedType { kind: MetricKind },

    #[error("inconsistent labels for {name}: expected {expected:?}, got {found:?}")]
    InconsistentLabels {
        name: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("failed to build series: {0}")]
    Prometheus(#[from] prometheus::Error),
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CollectorError::InconsistentLabels { .. })
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file merged with `ENGINE_EXPORTER_` environment overrides.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the exporter binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Collector and endpoint settings
    #[serde(default)]
    pub exporter: ExporterSettings,

    /// Engine processes to scrape
    #[serde(default)]
    pub engines: Vec<EngineConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string (no environment overrides)
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engines.is_empty() {
            return Err(ConfigError::NoSources);
        }

        self.listen_addr()?;

        let mut ranks = HashSet::new();
        for engine in &self.engines {
            if !ranks.insert(engine.rank) {
                return Err(ConfigError::invalid_value(
                    "engines.rank",
                    format!("rank {} is configured more than once", engine.rank),
                ));
            }
        }

        PatternSet::compile(&self.exporter.ignored_metrics)?;
        Ok(())
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.exporter
            .listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                ConfigError::invalid_value("exporter.listen_addr", e.to_string())
            })
    }

    /// Options for [`Collector::new`]
    pub fn collector_opts(&self) -> CollectorOpts {
        CollectorOpts {
            ignores: self.exporter.ignored_metrics.clone(),
            bucket_map: self.exporter.buckets.clone(),
        }
    }

    /// A starter configuration with a single engine
    pub fn sample() -> Self {
        Self {
            engines: vec![EngineConfig {
                index: 0,
                rank: 0,
                snapshot: PathBuf::from("/var/run/engine/telemetry-0.json"),
            }],
            ..Self::default()
        }
    }

    /// Render [`ExporterConfig::sample`] as TOML
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::sample()).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 5.2 Exporter Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterSettings {
    /// Address the `/metrics` endpoint binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Regexes matched against fully-qualified names; matching gauges and
    /// counters are not exported
    #[serde(default)]
    pub ignored_metrics: Vec<String>,

    /// Size-class table override; the built-in table is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<BucketMap>,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            ignored_metrics: Vec::new(),
            buckets: None,
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.into()
}

// ----------------------------------------------------------------------------
// 5.3 Engine Sources
// ----------------------------------------------------------------------------

/// One engine process to scrape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine index on this host
    pub index: u32,
    /// Rank exported as the `rank` label
    pub rank: u32,
    /// JSON telemetry snapshot written by the engine
    pub snapshot: PathBuf,
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the global subscriber from configuration.
/// `RUST_LOG` directives take precedence over `level`.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_fmt::layer().json().with_target(true)),
        ),
        "compact" => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            ),
        ),
        _ => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_thread_names(true),
            ),
        ),
    };
    installed.map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "engine_exporter::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: BUCKET TABLE
// ============================================================================
// Size-class tokens found in latency metric names ("4KB") and the histogram
// upper bound each one stands for.
// ============================================================================

/// Immutable token → upper bound table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketMap(HashMap<String, f64>);

impl BucketMap {
    /// Exact-match lookup of a size-class token
    pub fn get(&self, token: &str) -> Result<f64, CollectorError> {
        self.0
            .get(token)
            .copied()
            .ok_or_else(|| CollectorError::BucketNotFound {
                token: token.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for BucketMap {
    /// 256B through 4MB in powers of two, plus `_4MB` for anything larger
    fn default() -> Self {
        const KB: f64 = 1024.0;
        const MB: f64 = 1024.0 * KB;
        [
            ("256B", 256.0),
            ("512B", 512.0),
            ("1KB", KB),
            ("2KB", 2.0 * KB),
            ("4KB", 4.0 * KB),
            ("8KB", 8.0 * KB),
            ("16KB", 16.0 * KB),
            ("32KB", 32.0 * KB),
            ("64KB", 64.0 * KB),
            ("128KB", 128.0 * KB),
            ("256KB", 256.0 * KB),
            ("512KB", 512.0 * KB),
            ("1MB", MB),
            ("2MB", 2.0 * MB),
            ("4MB", 4.0 * MB),
            ("_4MB", f64::INFINITY),
        ]
        .into_iter()
        .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for BucketMap {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

// ============================================================================
// SECTION 8: PATH DECOMPOSER
// ============================================================================
// Engine paths embed instance identifiers (`ID_12_`), I/O targets (`io_3_`)
// and network contexts (`net_2_5_`). The first is dropped, the others become
// labels, so per-target series share one name.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Name Sanitizing
// ----------------------------------------------------------------------------

/// Strip one leading `/` and map every character outside `[A-Za-z0-9]` to `_`.
pub fn sanitize_metric_name(raw: &str) -> String {
    raw.strip_prefix('/')
        .unwrap_or(raw)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Join namespace, cleaned path and leaf name with `_`.
///
/// Separators left at the edges of the path by the decomposer are trimmed so
/// `io_` + `fetch_latency` yields `io_fetch_latency`. An empty leaf name yields
/// an empty result.
pub fn build_fq_name(namespace: &str, path: &str, name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    [namespace, path.trim_matches('_'), name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// `io_3_` collapses to `io_`, `io_3` to `io`
fn collapse_token(token: &str, matched: &str) -> String {
    if matched.ends_with('_') {
        format!("{}_", token)
    } else {
        token.to_string()
    }
}

// ----------------------------------------------------------------------------
// 8.2 Path Decomposer
// ----------------------------------------------------------------------------

/// Fixed rule table turning engine paths into labels and a cleaned path.
/// A new identifier convention means a new rule here.
#[derive(Debug, Clone)]
pub struct PathDecomposer {
    id_re: Regex,
    io_re: Regex,
    net_re: Regex,
}

impl PathDecomposer {
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            id_re: compile_pattern(ID_SEGMENT_PATTERN)?,
            io_re: compile_pattern(IO_SEGMENT_PATTERN)?,
            net_re: compile_pattern(NET_SEGMENT_PATTERN)?,
        })
    }

    /// Sanitize `raw`, drop `ID_<n>_` segments, then promote the first
    /// `io_<n>_` match to `target` and the first `net_<r>_<c>_` match to
    /// `rank`/`context`. Rules apply in that order.
    pub fn fix_path(&self, raw: &str) -> (LabelSet, String) {
        let mut labels = LabelSet::new();
        let sanitized = sanitize_metric_name(raw);
        let mut name = self.id_re.replace_all(&sanitized, "").into_owned();

        let io_match = self
            .io_re
            .captures(&name)
            .map(|caps| (caps[1].to_string(), collapse_token("io", &caps[0])));
        if let Some((target, replacement)) = io_match {
            labels.insert(TARGET_LABEL, target);
            name = self
                .io_re
                .replace_all(&name, NoExpand(replacement.as_str()))
                .into_owned();
        }

        let net_match = self.net_re.captures(&name).map(|caps| {
            (
                caps[1].to_string(),
                caps[2].to_string(),
                collapse_token("net", &caps[0]),
            )
        });
        if let Some((rank, context, replacement)) = net_match {
            labels.insert(RANK_LABEL, rank);
            labels.insert(CONTEXT_LABEL, context);
            name = self
                .net_re
                .replace_all(&name, NoExpand(replacement.as_str()))
                .into_owned();
        }

        (labels, name)
    }
}

// ----------------------------------------------------------------------------
// 8.3 Pattern Sets
// ----------------------------------------------------------------------------

/// Ordered list of compiled patterns; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct PatternSet(Vec<Regex>);

impl PatternSet {
    pub fn compile<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        patterns
            .into_iter()
            .map(|pattern| compile_pattern(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn is_match(&self, input: &str) -> bool {
        self.0.iter().any(|re| re.is_match(input))
    }

    /// Capture groups 1 and 2 of the first pattern that matches
    pub fn captures(&self, input: &str) -> Option<(String, String)> {
        self.0.iter().find_map(|re| {
            let caps = re.captures(input)?;
            Some((
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str().to_string(),
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 8.4 Tests
// ----------------------------------------------------------------------------


// ============================================================================
// SECTION 9: PRE-BUCKETED HISTOGRAMS
// ============================================================================
// Engines publish one summary per size class rather than raw observations.
// `EngineHistogram` stores those disjoint per-class values and derives the
// cumulative "less than or equal" view only when it is read.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Engine Histogram - One Label Set
// ----------------------------------------------------------------------------

/// Histogram for a single label set, fed with already-bucketed samples.
#[derive(Debug, Clone, Default)]
pub struct EngineHistogram {
    labels: LabelSet,
    buckets: BTreeMap<OrderedFloat<f64>, f64>,
    sum: f64,
    count: u64,
}

impl EngineHistogram {
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            ..Self::default()
        }
    }

    /// Record the value of one size class. A class seen twice keeps the
    /// latest value; sum and count always accumulate.
    pub fn add_bucket_value(&mut self, bucket: f64, value: f64, sum: f64, samples: u64) {
        self.buckets.insert(OrderedFloat(bucket), value);
        self.sum += sum;
        self.count += samples;
    }

    /// Per-class values, ascending by upper bound
    pub fn bucket_values(&self) -> Vec<(f64, f64)> {
        self.buckets.iter().map(|(k, v)| (k.0, *v)).collect()
    }

    /// Running totals ascending by upper bound; never decreasing
    pub fn sum_buckets(&self) -> Vec<(f64, f64)> {
        let mut running = 0.0;
        self.buckets
            .iter()
            .map(|(upper, value)| {
                running += value;
                (upper.0, running)
            })
            .collect()
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Wire form. Counts are integral on the wire and the encoder adds the
    /// `+Inf` bucket itself, so an infinite bound is not written.
    fn to_proto(&self) -> ProtoMetric {
        let buckets: Vec<Bucket> = self
            .sum_buckets()
            .into_iter()
            .filter(|(upper, _)| upper.is_finite())
            .map(|(upper, cumulative)| {
                let mut bucket = Bucket::default();
                bucket.set_upper_bound(upper);
                bucket.set_cumulative_count(cumulative as u64);
                bucket
            })
            .collect();

        let mut histogram = ProtoHistogram::default();
        histogram.set_sample_count(self.count);
        histogram.set_sample_sum(self.sum);
        histogram.set_bucket(buckets.into());

        let mut metric = ProtoMetric::default();
        metric.set_label(self.labels.to_label_pairs().into());
        metric.set_histogram(histogram);
        metric
    }
}

// ----------------------------------------------------------------------------
// 9.2 Engine Histogram Vector
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct HashedHistogram {
    label_values: LabelValues,
    histogram: EngineHistogram,
}

/// Named collection of [`EngineHistogram`]s, one per label set.
///
/// Instances are found by label signature; signatures that collide keep a
/// short list compared by exact label values. Not designed for concurrent
/// use or currying: a scrape owns its vectors exclusively.
#[derive(Debug, Clone)]
pub struct EngineHistogramVec {
    name: String,
    help: String,
    label_keys: Vec<String>,
    histograms: HashMap<u64, SmallVec<[HashedHistogram; 1]>>,
}

impl EngineHistogramVec {
    pub fn new(name: impl Into<String>, help: impl Into<String>, label_keys: &[&str]) -> Self {
        let mut label_keys: Vec<String> = label_keys.iter().map(|k| k.to_string()).collect();
        label_keys.sort();
        Self {
            name: name.into(),
            help: help.into(),
            label_keys,
            histograms: HashMap::new(),
        }
    }

    /// Number of label sets seen so far
    pub fn len(&self) -> usize {
        self.histograms.values().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Histogram for `labels`, created on first use.
    pub fn get_with(&mut self, labels: &LabelSet) -> Result<&mut EngineHistogram, CollectorError> {
        self.get_with_signature(labels.signature(), labels)
    }

    fn get_with_signature(
        &mut self,
        signature: u64,
        labels: &LabelSet,
    ) -> Result<&mut EngineHistogram, CollectorError> {
        if !labels.keys().iter().copied().eq(self.label_keys.iter().map(String::as_str)) {
            return Err(CollectorError::InconsistentLabels {
                name: self.name.clone(),
                expected: self.label_keys.clone(),
                found: labels.keys().iter().map(|k| k.to_string()).collect(),
            });
        }

        let label_values = labels.values();
        let candidates = self.histograms.entry(signature).or_default();
        let position = match candidates
            .iter()
            .position(|h| h.label_values == label_values)
        {
            Some(position) => position,
            None => {
                candidates.push(HashedHistogram {
                    label_values,
                    histogram: EngineHistogram::new(labels.clone()),
                });
                candidates.len() - 1
            }
        };
        Ok(&mut candidates[position].histogram)
    }

    /// Existing histogram for `labels`, if any
    pub fn get(&self, labels: &LabelSet) -> Option<&EngineHistogram> {
        let label_values = labels.values();
        self.histograms
            .get(&labels.signature())?
            .iter()
            .find(|h| h.label_values == label_values)
            .map(|h| &h.histogram)
    }

    /// All instances as one `HISTOGRAM` family, ordered by label values
    pub fn collect(&self) -> MetricFamily {
        let mut instances: Vec<&HashedHistogram> =
            self.histograms.values().flat_map(|bucket| bucket.iter()).collect();
        instances.sort_by(|a, b| a.label_values.cmp(&b.label_values));

        let metrics: Vec<ProtoMetric> = instances
            .into_iter()
            .map(|h| h.histogram.to_proto())
            .collect();

        let mut family = MetricFamily::default();
        family.set_name(self.name.clone());
        family.set_help(self.help.clone());
        family.set_field_type(MetricType::HISTOGRAM);
        family.set_metric(metrics.into());
        family
    }
}

// ----------------------------------------------------------------------------
// 9.3 Tests
// ----------------------------------------------------------------------------


// ============================================================================
// SECTION 10: TYPED VECTOR MAPS
// ============================================================================
// Name-keyed vectors created lazily during one scrape. The label schema of a
// name is fixed by the first metric seen under it.
// ============================================================================

fn help_or_name<'a>(help: &'a str, name: &'a str) -> &'a str {
    if help.is_empty() {
        name
    } else {
        help
    }
}

/// Gauges by fully-qualified name; absolute `set` semantics
#[derive(Default)]
pub struct GaugeVecMap(BTreeMap<String, GaugeVec>);

impl GaugeVecMap {
    pub fn add(
        &mut self,
        name: &str,
        help: &str,
        value: f64,
        labels: &LabelSet,
    ) -> Result<(), CollectorError> {
        let gauges = match self.0.entry(name.to_string()) {
            btree_map::Entry::Occupied(entry) => entry.into_mut(),
            btree_map::Entry::Vacant(entry) => entry.insert(GaugeVec::new(
                Opts::new(name, help_or_name(help, name)),
                &labels.keys(),
            )?),
        };
        gauges.get_metric_with(&labels.as_map())?.set(value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.values().flat_map(|gauges| gauges.collect()).collect()
    }
}

/// Counters by fully-qualified name; upstream values are already cumulative
/// and are added once per scrape
#[derive(Default)]
pub struct CounterVecMap(BTreeMap<String, CounterVec>);

impl CounterVecMap {
    pub fn add(
        &mut self,
        name: &str,
        help: &str,
        value: f64,
        labels: &LabelSet,
    ) -> Result<(), CollectorError> {
        let counters = match self.0.entry(name.to_string()) {
            btree_map::Entry::Occupied(entry) => entry.into_mut(),
            btree_map::Entry::Vacant(entry) => entry.insert(CounterVec::new(
                Opts::new(name, help_or_name(help, name)),
                &labels.keys(),
            )?),
        };
        counters.get_metric_with(&labels.as_map())?.inc_by(value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.values().flat_map(|counters| counters.collect()).collect()
    }
}

/// Pre-bucketed histograms by fully-qualified name
#[derive(Debug, Default)]
pub struct HistogramVecMap(BTreeMap<String, EngineHistogramVec>);

impl HistogramVecMap {
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        name: &str,
        help: &str,
        bucket: f64,
        value: f64,
        sum: f64,
        samples: u64,
        labels: &LabelSet,
    ) -> Result<(), CollectorError> {
        self.0
            .entry(name.to_string())
            .or_insert_with(|| {
                EngineHistogramVec::new(name, help_or_name(help, name), &labels.keys())
            })
            .get_with(labels)?
            .add_bucket_value(bucket, value, sum, samples);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.values().map(EngineHistogramVec::collect).collect()
    }
}

/// Everything one scrape builds; dropped when the scrape ends
#[derive(Default)]
struct ScrapeState {
    gauges: GaugeVecMap,
    counters: CounterVecMap,
    histograms: HistogramVecMap,
}

impl ScrapeState {
    fn flush(self) -> Vec<MetricFamily> {
        let mut families = self.gauges.collect();
        families.extend(self.counters.collect());
        families.extend(self.histograms.collect());
        families
    }
}

// ============================================================================
// SECTION 11: METRIC READERS
// ============================================================================
// The boundary to an engine's telemetry tree. A reader pushes every metric it
// finds into the channel and returns once the traversal is done.
// ============================================================================

/// Traversal of one engine's metrics tree.
///
/// Implementations must return (typically with [`ReaderError::Disconnected`])
/// as soon as a send fails: the receiver is dropped when the scrape no longer
/// wants this source's metrics.
pub trait MetricReader: Send + Sync + Debug {
    fn read_metrics(&self, out: &Sender<Metric>) -> Result<(), ReaderError>;
}

// ----------------------------------------------------------------------------
// 11.1 In-Memory Tree
// ----------------------------------------------------------------------------

/// Metrics held in memory; contents can be swapped between scrapes.
#[derive(Debug, Default)]
pub struct StaticMetricTree {
    metrics: RwLock<Vec<Metric>>,
}

impl StaticMetricTree {
    pub fn new(metrics: Vec<Metric>) -> Self {
        Self {
            metrics: RwLock::new(metrics),
        }
    }

    /// Replace the whole tree
    pub fn replace(&self, metrics: Vec<Metric>) {
        *self.metrics.write() = metrics;
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }
}

impl MetricReader for StaticMetricTree {
    fn read_metrics(&self, out: &Sender<Metric>) -> Result<(), ReaderError> {
        // Sends block until the scrape takes the metric; never hold the lock there.
        let snapshot = self.metrics.read().clone();
        for metric in snapshot {
            out.send(metric).map_err(|_| ReaderError::Disconnected)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 11.2 JSON Snapshot Reader
// ----------------------------------------------------------------------------

/// Reads a JSON array of metric records, re-read on every scrape.
///
/// ```json
/// [{"path": "/io_4_", "name": "fetch_latency_1KB", "kind": "stats_gauge",
///   "value": 120.5, "stats": {"mean": 120.5, "sum": 361.5, "sample_count": 3}}]
/// ```
#[derive(Debug, Clone)]
pub struct JsonSnapshotReader {
    path: PathBuf,
}

impl JsonSnapshotReader {
    /// Fails if the snapshot does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ReaderError> {
        let path = path.into();
        fs::metadata(&path).map_err(|source| ReaderError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<Metric>, ReaderError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| ReaderError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|e| ReaderError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}

impl MetricReader for JsonSnapshotReader {
    fn read_metrics(&self, out: &Sender<Metric>) -> Result<(), ReaderError> {
        for metric in self.load()? {
            out.send(metric).map_err(|_| ReaderError::Disconnected)?;
        }
        Ok(())
    }
}


// ============================================================================
// SECTION 12: ENGINE SOURCE
// ============================================================================

/// Result of one source's part in a scrape
#[derive(Debug)]
pub struct SourceOutcome {
    pub rank: u32,
    /// Metrics handed to the aggregation loop
    pub forwarded: u64,
    pub elapsed: Duration,
    /// Traversal failure, already logged
    pub error: Option<ReaderError>,
    /// The source's token was cancelled during the scrape
    pub cancelled: bool,
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }

    /// Value of the `result` label on the scrape duration histogram
    pub fn result_label(&self) -> &'static str {
        if self.error.is_some() {
            "failure"
        } else if self.cancelled {
            "cancelled"
        } else {
            "success"
        }
    }
}

/// One engine process: its telemetry reader plus identity.
#[derive(Debug)]
pub struct EngineSource {
    reader: Arc<dyn MetricReader>,
    cancel: CancellationToken,
    index: u32,
    rank: u32,
}

impl EngineSource {
    /// The source stops emitting once `parent` (or its own token) is cancelled.
    pub fn new(
        parent: &CancellationToken,
        index: u32,
        rank: u32,
        reader: Arc<dyn MetricReader>,
    ) -> Self {
        Self {
            reader,
            cancel: parent.child_token(),
            index,
            rank,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Traverse the engine's tree and forward each metric, tagged with this
    /// source's rank, onto `out`.
    ///
    /// Traversal errors are logged here and end this source's contribution;
    /// `out` is never closed by a source.
    pub fn collect(&self, out: &Sender<RankMetric>) -> SourceOutcome {
        let started = Instant::now();
        let (tx, rx) = bounded::<Metric>(0);
        let reader = Arc::clone(&self.reader);

        let (forwarded, traversal) = thread::scope(|scope| {
            let traversal = scope.spawn(move || reader.read_metrics(&tx));

            let mut forwarded = 0u64;
            for metric in rx.iter() {
                if self.cancel.is_cancelled() {
                    break;
                }
                let rank_metric = RankMetric {
                    rank: self.rank,
                    metric,
                };
                if out.send(rank_metric).is_err() {
                    break;
                }
                forwarded += 1;
            }
            // Unblocks a traversal still waiting to send.
            drop(rx);

            (forwarded, traversal.join())
        });

        let cancelled = self.cancel.is_cancelled();
        let error = match traversal {
            Ok(Ok(())) => None,
            Ok(Err(_)) if cancelled => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(ReaderError::Panicked),
        };

        if let Some(err) = &error {
            error!(
                target: SOURCE_LOG_TARGET,
                rank = self.rank,
                index = self.index,
                error = %err,
                "failed to collect metrics for engine"
            );
        } else if cancelled {
            debug!(
                target: SOURCE_LOG_TARGET,
                rank = self.rank,
                index = self.index,
                forwarded,
                "engine source cancelled mid-scrape"
            );
        }

        SourceOutcome {
            rank: self.rank,
            forwarded,
            elapsed: started.elapsed(),
            error,
            cancelled,
        }
    }
}

// ============================================================================
// SECTION 13: COLLECTOR
// ============================================================================
// One scrape: fan in every source, decompose and classify each metric, route
// it into the scrape's vector maps, then flush them as metric families.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Options
// ----------------------------------------------------------------------------

/// Options recognized by [`Collector::new`]
#[derive(Debug, Clone, Default)]
pub struct CollectorOpts {
    /// Regexes for gauges and counters that should not be exported
    pub ignores: Vec<String>,
    /// Size-class table; defaults to [`BucketMap::default`]
    pub bucket_map: Option<BucketMap>,
}

// ----------------------------------------------------------------------------
// 13.2 Derived Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct DerivedStat {
    name: String,
    help: String,
    value: f64,
    is_counter: bool,
}

/// `_min`, `_max`, `_mean`, `_stddev` gauges and a `_samples` counter; empty
/// until the metric has samples
fn derived_stats(base_name: &str, desc: &str, stats: Option<&MetricStats>) -> Vec<DerivedStat> {
    let Some(stats) = stats.filter(|stats| stats.sample_count > 0) else {
        return Vec::new();
    };

    [
        ("min", " (min value)", stats.min, false),
        ("max", " (max value)", stats.max, false),
        ("mean", " (mean)", stats.mean, false),
        ("stddev", " (std dev)", stats.stddev, false),
        ("samples", " (samples)", stats.sample_count as f64, true),
    ]
    .into_iter()
    .map(|(suffix, help_suffix, value, is_counter)| DerivedStat {
        name: format!("{}_{}", base_name, suffix),
        help: format!("{}{}", desc, help_suffix),
        value,
        is_counter,
    })
    .collect()
}

// ----------------------------------------------------------------------------
// 13.3 Collector
// ----------------------------------------------------------------------------

/// Scrape orchestrator; register it with a [`Registry`] to expose engines.
pub struct Collector {
    sources: Vec<EngineSource>,
    buckets: BucketMap,
    ignored_metrics: PatternSet,
    latency_histograms: PatternSet,
    decomposer: PathDecomposer,
    scrape_duration: HistogramVec,
}

impl Collector {
    /// Fails on an empty source list or an ignore pattern that does not compile.
    pub fn new(opts: CollectorOpts, sources: Vec<EngineSource>) -> ExporterResult<Self> {
        if sources.is_empty() {
            return Err(ConfigError::NoSources.into());
        }

        let scrape_duration = HistogramVec::new(
            HistogramOpts::new(
                "scrape_duration_seconds",
                "engine_exporter: Duration of a scrape job.",
            )
            .namespace(METRIC_NAMESPACE)
            .subsystem(EXPORTER_SUBSYSTEM),
            &["source", "result"],
        )?;

        Ok(Self {
            sources,
            buckets: opts.bucket_map.unwrap_or_default(),
            ignored_metrics: PatternSet::compile(&opts.ignores)?,
            latency_histograms: PatternSet::compile(LATENCY_HISTOGRAM_PATTERNS)?,
            decomposer: PathDecomposer::new()?,
            scrape_duration,
        })
    }

    pub fn sources(&self) -> &[EngineSource] {
        &self.sources
    }

    pub fn buckets(&self) -> &BucketMap {
        &self.buckets
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored_metrics.is_match(name)
    }

    /// Run one full scrape and return every series it produced.
    pub fn scrape(&self) -> Vec<MetricFamily> {
        let started = Instant::now();
        let (tx, rx) = bounded::<RankMetric>(0);
        let mut state = ScrapeState::default();
        let mut received = 0u64;

        thread::scope(|scope| {
            let producers: Vec<_> = self
                .sources
                .iter()
                .map(|source| {
                    let tx = tx.clone();
                    scope.spawn(move || {
                        let outcome = source.collect(&tx);
                        self.observe_source(&outcome);
                    })
                })
                .collect();

            // The aggregation loop ends only once this sender is dropped,
            // which happens after every producer has finished.
            scope.spawn(move || {
                for producer in producers {
                    if producer.join().is_err() {
                        error!(
                            target: COLLECTOR_LOG_TARGET,
                            "engine source collection thread panicked"
                        );
                    }
                }
                drop(tx);
            });

            for rank_metric in rx.iter() {
                received += 1;
                if let Err(err) = self.aggregate(&mut state, &rank_metric) {
                    error!(
                        target: COLLECTOR_LOG_TARGET,
                        rank = rank_metric.rank,
                        path = %rank_metric.metric.path,
                        metric = %rank_metric.metric.name,
                        error = %err,
                        "skipping metric"
                    );
                }
            }
        });

        debug!(
            target: COLLECTOR_LOG_TARGET,
            sources = self.sources.len(),
            received,
            gauges = state.gauges.len(),
            counters = state.counters.len(),
            histograms = state.histograms.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scrape complete"
        );

        let mut families = state.flush();
        families.extend(self.scrape_duration.collect());
        families
    }

    fn observe_source(&self, outcome: &SourceOutcome) {
        self.scrape_duration
            .with_label_values(&[&outcome.rank.to_string(), outcome.result_label()])
            .observe(outcome.elapsed.as_secs_f64());
    }

    /// Route one metric into the scrape's vector maps.
    fn aggregate(
        &self,
        state: &mut ScrapeState,
        rank_metric: &RankMetric,
    ) -> Result<(), CollectorError> {
        let metric = &rank_metric.metric;
        let (mut labels, path) = self.decomposer.fix_path(&metric.path);
        labels.insert(RANK_LABEL, rank_metric.rank.to_string());

        let name = sanitize_metric_name(&metric.name);
        let base_name = build_fq_name(METRIC_NAMESPACE, &path, &name);
        let desc = metric.desc.as_str();

        // Latency families only ever feed histograms; without samples there is nothing yet.
        if let Some((family, token)) = self.latency_histograms.captures(&base_name) {
            if let Some(stats) = metric.value.stats().filter(|s| s.sample_count > 0) {
                let upper_bound = self.buckets.get(&token)?;

                state.histograms.add(
                    &family,
                    desc,
                    upper_bound,
                    stats.mean,
                    stats.sum,
                    stats.sample_count,
                    &labels,
                )?;

                let size_family = family.replace("latency", "sizes");
                state.histograms.add(
                    &size_family,
                    desc,
                    upper_bound,
                    stats.sample_count as f64,
                    stats.sum,
                    stats.sample_count,
                    &labels,
                )?;
            }
            return Ok(());
        }

        match &metric.value {
            MetricValue::Gauge { value } | MetricValue::StatsGauge { value, .. } => {
                if self.is_ignored(&base_name) {
                    return Ok(());
                }

                state.gauges.add(&base_name, desc, *value, &labels)?;
                for stat in derived_stats(&base_name, desc, metric.value.stats()) {
                    if stat.is_counter {
                        state.counters.add(&stat.name, &stat.help, stat.value, &labels)?;
                    } else {
                        state.gauges.add(&stat.name, &stat.help, stat.value, &labels)?;
                    }
                }
                Ok(())
            }
            MetricValue::Counter { value } => {
                if self.is_ignored(&base_name) {
                    return Ok(());
                }
                state.counters.add(&base_name, desc, *value as f64, &labels)
            }
            other @ (MetricValue::Duration { .. } | MetricValue::Timestamp { .. }) => {
                Err(CollectorError::UnsupportedType { kind: other.kind() })
            }
        }
    }
}

impl Debug for Collector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("sources", &self.sources)
            .field("buckets", &self.buckets.len())
            .field("ignored_metrics", &self.ignored_metrics.len())
            .finish_non_exhaustive()
    }
}

impl PromCollector for Collector {
    fn desc(&self) -> Vec<&Desc> {
        self.scrape_duration.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.scrape()
    }
}

/// Build a collector over the JSON snapshots listed in `config`.
pub fn build_collector(
    config: &ExporterConfig,
    parent: &CancellationToken,
) -> ExporterResult<Collector> {
    let sources = config
        .engines
        .iter()
        .map(|engine| -> ExporterResult<EngineSource> {
            let reader = JsonSnapshotReader::open(&engine.snapshot)?;
            Ok(EngineSource::new(
                parent,
                engine.index,
                engine.rank,
                Arc::new(reader),
            ))
        })
        .collect::<ExporterResult<Vec<_>>>()?;

    Collector::new(config.collector_opts(), sources)
}

// ----------------------------------------------------------------------------
// 13.4 Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod collector_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn source(rank: u32, metrics: Vec<Metric>) -> EngineSource {
        EngineSource::new(
            &CancellationToken::new(),
            rank,
            rank,
            Arc::new(StaticMetricTree::new(metrics)),
        )
    }

    fn collector(sources: Vec<EngineSource>) -> Collector {
        Collector::new(CollectorOpts::default(), sources).unwrap()
    }

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> Option<&'a MetricFamily> {
        families.iter().find(|f| f.get_name() == name)
    }

    fn label<'a>(metric: &'a ProtoMetric, key: &str) -> Option<&'a str> {
        metric
            .get_label()
            .iter()
            .find(|pair| pair.get_name() == key)
            .map(|pair| pair.get_value())
    }

    /// Sends its metrics, then fails the traversal.
    #[derive(Debug)]
    struct FailingReader(Vec<Metric>);

    impl MetricReader for FailingReader {
        fn read_metrics(&self, out: &Sender<Metric>) -> Result<(), ReaderError> {
            for metric in self.0.clone() {
                out.send(metric).map_err(|_| ReaderError::Disconnected)?;
            }
            Err(ReaderError::Traversal {
                message: "shared memory segment vanished".into(),
            })
        }
    }

    /// Sends `before`, then a marker that yields no series, cancels `token`,
    /// then tries to send `after`.
    #[derive(Debug)]
    struct CancellingReader {
        token: CancellationToken,
        before: Vec<Metric>,
        after: Vec<Metric>,
    }

    impl MetricReader for CancellingReader {
        fn read_metrics(&self, out: &Sender<Metric>) -> Result<(), ReaderError> {
            for metric in self.before.clone() {
                out.send(metric).map_err(|_| ReaderError::Disconnected)?;
            }
            // Once the marker is taken, everything in `before` has been forwarded.
            let marker =
                Metric::stats_gauge("/io_0_", "fetch_latency_1KB", 0.0, MetricStats::default());
            out.send(marker).map_err(|_| ReaderError::Disconnected)?;
            self.token.cancel();
            for metric in self.after.clone() {
                out.send(metric).map_err(|_| ReaderError::Disconnected)?;
            }
            Ok(())
        }
    }

    #[test]
    fn construction_requires_sources() {
        let err = Collector::new(CollectorOpts::default(), Vec::new()).unwrap_err();
        assert!(matches!(err, ExporterError::Config(ConfigError::NoSources)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn construction_rejects_bad_ignore_pattern() {
        let opts = CollectorOpts {
            ignores: vec!["engine_[".into()],
            ..CollectorOpts::default()
        };
        let err = Collector::new(opts, vec![source(0, Vec::new())]).unwrap_err();
        assert!(matches!(
            err,
            ExporterError::Config(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn latency_stats_become_latency_and_size_histograms() {
        let metric = Metric::stats_gauge(
            "/io_4_",
            "fetch_latency_1KB",
            120.5,
            MetricStats::with_mean(120.5, 361.5, 3),
        )
        .with_desc("fetch latency");
        let families = collector(vec![source(1, vec![metric])]).scrape();

        let latency = family(&families, "engine_io_fetch_latency").unwrap();
        assert_eq!(latency.get_field_type(), MetricType::HISTOGRAM);
        assert_eq!(latency.get_metric().len(), 1);
        let series = &latency.get_metric()[0];
        assert_eq!(label(series, RANK_LABEL), Some("1"));
        assert_eq!(label(series, TARGET_LABEL), Some("4"));
        let histogram = series.get_histogram();
        assert_eq!(histogram.get_sample_count(), 3);
        assert_eq!(histogram.get_sample_sum(), 361.5);
        assert_eq!(histogram.get_bucket().len(), 1);
        assert_eq!(histogram.get_bucket()[0].get_upper_bound(), 1024.0);
        assert_eq!(histogram.get_bucket()[0].get_cumulative_count(), 120);

        let sizes = family(&families, "engine_io_fetch_sizes").unwrap();
        let series = &sizes.get_metric()[0];
        assert_eq!(label(series, TARGET_LABEL), Some("4"));
        let histogram = series.get_histogram();
        assert_eq!(histogram.get_bucket()[0].get_upper_bound(), 1024.0);
        assert_eq!(histogram.get_bucket()[0].get_cumulative_count(), 3);
        assert_eq!(histogram.get_sample_count(), 3);

        // Consumed entirely by the histograms.
        assert!(family(&families, "engine_io_fetch_latency_1KB").is_none());
    }

    #[test]
    fn latency_buckets_accumulate_across_size_classes() {
        let metrics = vec![
            Metric::stats_gauge(
                "/io_0_",
                "update_latency_4KB",
                0.0,
                MetricStats::with_mean(40.0, 80.0, 2),
            ),
            Metric::stats_gauge(
                "/io_0_",
                "update_latency_256B",
                0.0,
                MetricStats::with_mean(10.0, 50.0, 5),
            ),
        ];
        let families = collector(vec![source(0, metrics)]).scrape();

        let sizes = family(&families, "engine_io_update_sizes").unwrap();
        let histogram = sizes.get_metric()[0].get_histogram();
        let buckets: Vec<(f64, u64)> = histogram
            .get_bucket()
            .iter()
            .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
            .collect();
        assert_eq!(buckets, vec![(256.0, 5), (4096.0, 7)]);
        assert_eq!(histogram.get_sample_count(), 7);
        assert_eq!(histogram.get_sample_sum(), 130.0);
    }

    #[test]
    fn unknown_size_class_skips_only_that_metric() {
        let metrics = vec![
            Metric::stats_gauge(
                "/io_0_",
                "fetch_latency_3KB",
                0.0,
                MetricStats::with_mean(1.0, 1.0, 1),
            ),
            Metric::gauge("/", "pool_space", 5.0),
        ];
        let families = collector(vec![source(0, metrics)]).scrape();
        assert!(family(&families, "engine_io_fetch_latency").is_none());
        assert!(family(&families, "engine_pool_space").is_some());
    }

    #[test]
    fn gauges_from_two_ranks_stay_distinct() {
        let families = collector(vec![
            source(1, vec![Metric::gauge("/", "pool_space", 100.0)]),
            source(2, vec![Metric::gauge("/", "pool_space", 200.0)]),
        ])
        .scrape();

        let gauges = family(&families, "engine_pool_space").unwrap();
        assert_eq!(gauges.get_field_type(), MetricType::GAUGE);
        let mut values: Vec<(String, f64)> = gauges
            .get_metric()
            .iter()
            .map(|m| {
                assert_eq!(m.get_label().len(), 1);
                (label(m, RANK_LABEL).unwrap().to_string(), m.get_gauge().get_value())
            })
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            values,
            vec![("1".to_string(), 100.0), ("2".to_string(), 200.0)]
        );
    }

    #[test]
    fn stats_gauge_without_samples_emits_only_the_base_gauge() {
        let metric = Metric::stats_gauge("/", "queue_depth", 4.0, MetricStats::default());
        let families = collector(vec![source(0, vec![metric])]).scrape();

        assert_eq!(
            family(&families, "engine_queue_depth").unwrap().get_metric()[0]
                .get_gauge()
                .get_value(),
            4.0
        );
        for suffix in ["min", "max", "mean", "stddev", "samples"] {
            let name = format!("engine_queue_depth_{}", suffix);
            assert!(family(&families, &name).is_none(), "{} emitted", name);
        }
    }

    #[test]
    fn stats_gauge_with_samples_emits_derived_series() {
        let stats = MetricStats {
            min: 1.0,
            max: 9.0,
            mean: 4.0,
            stddev: 2.5,
            sum: 20.0,
            sample_count: 5,
        };
        let metric = Metric::stats_gauge("/", "queue_depth", 4.0, stats).with_desc("depth");
        let families = collector(vec![source(0, vec![metric])]).scrape();

        let gauge = |name: &str| {
            family(&families, name).unwrap().get_metric()[0]
                .get_gauge()
                .get_value()
        };
        assert_eq!(gauge("engine_queue_depth_min"), 1.0);
        assert_eq!(gauge("engine_queue_depth_max"), 9.0);
        assert_eq!(gauge("engine_queue_depth_mean"), 4.0);
        assert_eq!(gauge("engine_queue_depth_stddev"), 2.5);

        let samples = family(&families, "engine_queue_depth_samples").unwrap();
        assert_eq!(samples.get_field_type(), MetricType::COUNTER);
        assert_eq!(samples.get_help(), "depth (samples)");
        assert_eq!(samples.get_metric()[0].get_counter().get_value(), 5.0);
    }

    #[test]
    fn counters_export_their_raw_value() {
        let families =
            collector(vec![source(3, vec![Metric::counter("/net_1_2_", "sent", 42)])]).scrape();
        let counters = family(&families, "engine_net_sent").unwrap();
        let series = &counters.get_metric()[0];
        assert_eq!(series.get_counter().get_value(), 42.0);
        assert_eq!(label(series, RANK_LABEL), Some("3"));
        assert_eq!(label(series, CONTEXT_LABEL), Some("2"));
    }

    #[test]
    fn ignored_gauges_and_counters_are_excluded() {
        let opts = CollectorOpts {
            ignores: vec!["^engine_pool_.*".into()],
            ..CollectorOpts::default()
        };
        let metrics = vec![
            Metric::gauge("/", "pool_space", 1.0),
            Metric::counter("/", "pool_ops", 2),
            Metric::gauge("/", "queue_depth", 3.0),
        ];
        let families = Collector::new(opts, vec![source(0, metrics)])
            .unwrap()
            .scrape();

        assert!(family(&families, "engine_pool_space").is_none());
        assert!(family(&families, "engine_pool_ops").is_none());
        assert!(family(&families, "engine_queue_depth").is_some());
    }

    #[test]
    fn unsupported_kinds_are_skipped() {
        let metrics = vec![
            Metric::timestamp("/", "started_at", 1_700_000_000.0),
            Metric::duration("/", "rebuild_time", 3.0, MetricStats::with_mean(3.0, 3.0, 1)),
            Metric::gauge("/", "pool_space", 1.0),
        ];
        let families = collector(vec![source(0, metrics)]).scrape();
        assert!(family(&families, "engine_started_at").is_none());
        assert!(family(&families, "engine_rebuild_time").is_none());
        assert!(family(&families, "engine_pool_space").is_some());
    }

    #[test]
    fn failing_source_does_not_affect_others() {
        let failing = EngineSource::new(
            &CancellationToken::new(),
            0,
            7,
            Arc::new(FailingReader(vec![Metric::gauge("/", "pool_space", 7.0)])),
        );
        let healthy = source(8, vec![Metric::gauge("/", "pool_space", 8.0)]);
        let families = collector(vec![failing, healthy]).scrape();

        let gauges = family(&families, "engine_pool_space").unwrap();
        assert_eq!(gauges.get_metric().len(), 2);

        let durations = family(&families, "engine_exporter_scrape_duration_seconds").unwrap();
        let results: Vec<(&str, &str)> = durations
            .get_metric()
            .iter()
            .map(|m| (label(m, "source").unwrap(), label(m, "result").unwrap()))
            .collect();
        assert!(results.contains(&("7", "failure")));
        assert!(results.contains(&("8", "success")));
    }

    #[test]
    fn latency_metrics_without_samples_emit_nothing() {
        let metrics = vec![
            Metric::stats_gauge("/io_4_", "fetch_latency_1KB", 0.0, MetricStats::default()),
            Metric::duration("/io_4_", "update_latency_4KB", 0.0, MetricStats::default()),
            Metric::gauge("/", "pool_space", 1.0),
        ];
        let families = collector(vec![source(1, metrics)]).scrape();

        let exported: Vec<&str> = families
            .iter()
            .map(|f| f.get_name())
            .filter(|name| {
                name.starts_with("engine_io_fetch_latency")
                    || name.starts_with("engine_io_update_latency")
                    || name.starts_with("engine_io_fetch_sizes")
                    || name.starts_with("engine_io_update_sizes")
            })
            .collect();
        assert!(exported.is_empty(), "unexpected series: {:?}", exported);
        assert!(family(&families, "engine_pool_space").is_some());
    }

    #[test]
    fn source_cancelled_mid_scrape_keeps_forwarded_metrics() {
        let parent = CancellationToken::new();
        let reader = CancellingReader {
            token: parent.clone(),
            before: vec![Metric::gauge("/", "a", 1.0), Metric::gauge("/", "b", 2.0)],
            after: vec![Metric::gauge("/", "c", 3.0), Metric::gauge("/", "d", 4.0)],
        };
        let cancelling = EngineSource::new(&parent, 0, 1, Arc::new(reader));
        let healthy = source(2, vec![Metric::gauge("/", "c", 30.0)]);

        let families = collector(vec![cancelling, healthy]).scrape();

        for (name, value) in [("engine_a", 1.0), ("engine_b", 2.0)] {
            let gauges = family(&families, name).unwrap();
            assert_eq!(gauges.get_metric().len(), 1);
            assert_eq!(label(&gauges.get_metric()[0], RANK_LABEL), Some("1"));
            assert_eq!(gauges.get_metric()[0].get_gauge().get_value(), value);
        }

        let after = family(&families, "engine_c").unwrap();
        assert_eq!(after.get_metric().len(), 1);
        assert_eq!(label(&after.get_metric()[0], RANK_LABEL), Some("2"));
        assert!(family(&families, "engine_d").is_none());

        let durations = family(&families, "engine_exporter_scrape_duration_seconds").unwrap();
        let results: Vec<(&str, &str)> = durations
            .get_metric()
            .iter()
            .map(|m| (label(m, "source").unwrap(), label(m, "result").unwrap()))
            .collect();
        assert!(results.contains(&("1", "cancelled")));
        assert!(results.contains(&("2", "success")));
    }

    #[test]
    fn cancelled_source_contributes_nothing() {
        let parent = CancellationToken::new();
        let cancelled = EngineSource::new(
            &parent,
            0,
            1,
            Arc::new(StaticMetricTree::new(vec![Metric::gauge("/", "a", 1.0)])),
        );
        parent.cancel();
        let healthy = source(2, vec![Metric::gauge("/", "a", 2.0)]);

        let families = collector(vec![cancelled, healthy]).scrape();
        let gauges = family(&families, "engine_a").unwrap();
        assert_eq!(gauges.get_metric().len(), 1);
        assert_eq!(label(&gauges.get_metric()[0], RANK_LABEL), Some("2"));
    }

    #[test]
    fn source_outcome_reports_cancellation() {
        let parent = CancellationToken::new();
        let source = EngineSource::new(
            &parent,
            0,
            1,
            Arc::new(StaticMetricTree::new(vec![
                Metric::gauge("/", "a", 1.0),
                Metric::gauge("/", "b", 2.0),
            ])),
        );
        parent.cancel();

        let (tx, rx) = bounded(16);
        let outcome = source.collect(&tx);
        drop(tx);
        assert_eq!(outcome.forwarded, 0);
        assert!(outcome.cancelled);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.result_label(), "cancelled");
        assert_eq!(rx.iter().count(), 0);
    }

    #[test]
    fn scrapes_do_not_share_state() {
        let tree = Arc::new(StaticMetricTree::new(vec![Metric::counter("/", "ops", 5)]));
        let collector = collector(vec![EngineSource::new(
            &CancellationToken::new(),
            0,
            0,
            tree.clone(),
        )]);

        let first = collector.scrape();
        tree.replace(vec![Metric::counter("/", "ops", 6)]);
        let second = collector.scrape();

        let value = |families: &[MetricFamily]| {
            family(families, "engine_ops").unwrap().get_metric()[0]
                .get_counter()
                .get_value()
        };
        assert_eq!(value(&first), 5.0);
        assert_eq!(value(&second), 6.0);
    }

    #[test]
    fn registers_with_a_prometheus_registry() {
        let registry = Registry::new();
        registry
            .register(Box::new(collector(vec![source(
                1,
                vec![Metric::gauge("/", "pool_space", 100.0)],
            )])))
            .unwrap();

        let families = registry.gather();
        assert!(family(&families, "engine_pool_space").is_some());
    }
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================

/// Engine exporter CLI
#[derive(Parser, Debug)]
#[command(
    name = "engine-exporter",
    version,
    about = "Prometheus exporter for storage-engine telemetry"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "ENGINE_EXPORTER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "ENGINE_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Listen address override
    #[arg(long)]
    pub listen: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve `/metrics` (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a starter configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Scrape once and print the text exposition
    Dump,
}

// ============================================================================
// SECTION 15: EXPOSITION ENDPOINT
// ============================================================================

/// Gather `registry` and render it in the Prometheus text format
pub fn render_metrics(registry: &Registry) -> ExporterResult<String> {
    let families = registry.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| ExporterError::Internal(e.to_string()))
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    // Scrapes block on the fan-in; keep them off the async workers.
    match tokio::task::spawn_blocking(move || render_metrics(&registry)).await {
        Ok(Ok(body)) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Ok(Err(err)) => {
            error!(target: HTTP_LOG_TARGET, error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        Err(err) => {
            error!(target: HTTP_LOG_TARGET, error = %err, "scrape task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "scrape task failed").into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

/// `/metrics` and `/health` routes over `registry`
pub fn metrics_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
}

/// Serve `registry` on `addr` until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> ExporterResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: HTTP_LOG_TARGET, %addr, "serving metrics");

    axum::serve(listener, metrics_router(registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!(target: HTTP_LOG_TARGET, "metrics endpoint stopped");
    Ok(())
}

#[cfg(test)]
mod exposition_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::io::Write;
    use tower::ServiceExt;

    fn registry_with(metrics: Vec<Metric>) -> Arc<Registry> {
        let source = EngineSource::new(
            &CancellationToken::new(),
            0,
            1,
            Arc::new(StaticMetricTree::new(metrics)),
        );
        let registry = Registry::new();
        registry
            .register(Box::new(
                Collector::new(CollectorOpts::default(), vec![source]).unwrap(),
            ))
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_collected_series() {
        let registry = registry_with(vec![Metric::gauge("/", "pool_space", 100.0)]);
        let response = metrics_router(registry)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("engine_pool_space{rank=\"1\"} 100"), "{}", text);
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let response = metrics_router(registry_with(Vec::new()))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn config_parses_and_validates() {
        let config = ExporterConfig::from_toml(
            r#"
            [exporter]
            listen_addr = "127.0.0.1:9191"
            ignored_metrics = ["^engine_pool_.*"]

            [exporter.buckets]
            "1KB" = 1024.0

            [[engines]]
            index = 0
            rank = 4
            snapshot = "/tmp/engine-0.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.engines.len(), 1);
        assert_eq!(config.engines[0].rank, 4);
        assert_eq!(config.logging.level, "info");
        let opts = config.collector_opts();
        assert_eq!(opts.ignores, vec!["^engine_pool_.*".to_string()]);
        assert_eq!(opts.bucket_map.unwrap().get("1KB").unwrap(), 1024.0);
    }

    #[test]
    fn config_without_engines_is_rejected() {
        assert!(matches!(
            ExporterConfig::from_toml("[exporter]\n"),
            Err(ConfigError::NoSources)
        ));
    }

    #[test]
    fn config_with_duplicate_ranks_is_rejected() {
        let err = ExporterConfig::from_toml(
            r#"
            [[engines]]
            index = 0
            rank = 1
            snapshot = "a.json"

            [[engines]]
            index = 1
            rank = 1
            snapshot = "b.json"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn generated_config_round_trips() {
        let rendered = ExporterConfig::generate_default_config().unwrap();
        let config = ExporterConfig::from_toml(&rendered).unwrap();
        assert_eq!(config.exporter.listen_addr, DEFAULT_LISTEN_ADDR);
    }

    #[test]
    fn collector_builds_from_config_file() {
        let mut snapshot = tempfile::NamedTempFile::new().unwrap();
        write!(
            snapshot,
            r#"[{{"path": "/", "name": "pool_space", "kind": "gauge", "value": 9.0}}]"#
        )
        .unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[[engines]]\nindex = 0\nrank = 2\nsnapshot = {:?}\n",
            snapshot.path().display().to_string()
        )
        .unwrap();

        let config = ExporterConfig::load(file.path()).unwrap();
        let collector = build_collector(&config, &CancellationToken::new()).unwrap();
        let families = collector.scrape();
        let gauge = families
            .iter()
            .find(|f| f.get_name() == "engine_pool_space")
            .unwrap();
        assert_eq!(gauge.get_metric()[0].get_gauge().get_value(), 9.0);
    }
}
