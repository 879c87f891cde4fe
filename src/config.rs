//! Engine configuration: raw (serde) form, validation/clamping, defaults.
//!
//! The raw form accepts whatever a host application or config file hands us;
//! `EngineConfig::from_raw` clamps out-of-range values and reports every
//! adjustment as a `ConfigWarning` instead of failing construction.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Bounds and defaults, public so tests can assert exact clamping.
pub const MIN_CONCURRENT: i64 = 1;
pub const MAX_CONCURRENT: i64 = 20;
pub const DEFAULT_CONCURRENT: usize = 3;
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_RETRIES_CAP: u32 = 10;
pub const DEFAULT_RETRIES: u32 = 3;
pub const MIN_BASE_DELAY_MS: u64 = 100;
pub const MAX_BASE_DELAY_MS: u64 = 30_000;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 600;

/// Untrusted configuration as supplied by the host (all fields optional).
///
/// Signed integer fields are deliberate: a host passing `-1` for a count is
/// a configuration error to clamp and report, not a crash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEngineConfig {
    pub max_concurrent_uploads: Option<i64>,
    pub chunk_size: Option<i64>,
    pub max_retries: Option<i64>,
    pub base_retry_delay_ms: Option<i64>,
    pub max_retry_delay_ms: Option<i64>,
    pub auto_start: Option<bool>,
    pub smart_scheduling: Option<bool>,
    /// Bandwidth cap in bytes/sec; absent or non-positive = uncapped.
    pub bandwidth_limit: Option<i64>,
    pub memory_batch_size: Option<i64>,
    pub stuck_threshold_secs: Option<i64>,
    pub verify_chunks: Option<bool>,
    pub adaptive_bandwidth: Option<bool>,
}

/// One clamped or rejected raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub message: String,
}

/// Validated engine tuning, immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_concurrent_uploads: usize,
    pub chunk_size: u64,
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub base_retry_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_retry_delay: Duration,
    pub auto_start: bool,
    pub smart_scheduling: bool,
    pub bandwidth_limit: Option<u64>,
    pub memory_batch_size: usize,
    #[serde(with = "duration_ms")]
    pub stuck_threshold: Duration,
    pub verify_chunks: bool,
    pub adaptive_bandwidth: bool,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: DEFAULT_CONCURRENT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_RETRIES,
            base_retry_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_retry_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            auto_start: true,
            smart_scheduling: true,
            bandwidth_limit: None,
            memory_batch_size: DEFAULT_BATCH_SIZE,
            stuck_threshold: Duration::from_secs(DEFAULT_STUCK_THRESHOLD_SECS),
            verify_chunks: true,
            adaptive_bandwidth: false,
        }
    }
}

fn clamp_i64(
    raw: Option<i64>,
    field: &'static str,
    min: i64,
    max: i64,
    default: i64,
    warnings: &mut Vec<ConfigWarning>,
) -> i64 {
    match raw {
        None => default,
        Some(v) if v >= min && v <= max => v,
        Some(v) => {
            let clamped = v.clamp(min, max);
            warnings.push(ConfigWarning {
                field,
                message: format!("{} out of range [{}, {}], clamped to {}", v, min, max, clamped),
            });
            clamped
        }
    }
}

impl EngineConfig {
    /// Validate and clamp a raw config. Always succeeds; every adjustment is
    /// reported in the returned warning list and logged.
    pub fn from_raw(raw: RawEngineConfig) -> (Self, Vec<ConfigWarning>) {
        let mut warnings = Vec::new();

        let max_concurrent = clamp_i64(
            raw.max_concurrent_uploads,
            "max_concurrent_uploads",
            MIN_CONCURRENT,
            MAX_CONCURRENT,
            DEFAULT_CONCURRENT as i64,
            &mut warnings,
        ) as usize;
        let chunk_size = clamp_i64(
            raw.chunk_size,
            "chunk_size",
            MIN_CHUNK_SIZE as i64,
            MAX_CHUNK_SIZE as i64,
            DEFAULT_CHUNK_SIZE as i64,
            &mut warnings,
        ) as u64;
        let max_retries = clamp_i64(
            raw.max_retries,
            "max_retries",
            0,
            MAX_RETRIES_CAP as i64,
            DEFAULT_RETRIES as i64,
            &mut warnings,
        ) as u32;
        let base_ms = clamp_i64(
            raw.base_retry_delay_ms,
            "base_retry_delay_ms",
            MIN_BASE_DELAY_MS as i64,
            MAX_BASE_DELAY_MS as i64,
            DEFAULT_BASE_DELAY_MS as i64,
            &mut warnings,
        ) as u64;
        let mut max_ms = clamp_i64(
            raw.max_retry_delay_ms,
            "max_retry_delay_ms",
            MIN_BASE_DELAY_MS as i64,
            i64::MAX,
            DEFAULT_MAX_DELAY_MS as i64,
            &mut warnings,
        ) as u64;
        if max_ms < base_ms {
            warnings.push(ConfigWarning {
                field: "max_retry_delay_ms",
                message: format!("{} below base delay {}, raised to match", max_ms, base_ms),
            });
            max_ms = base_ms;
        }
        let bandwidth_limit = match raw.bandwidth_limit {
            None => None,
            Some(v) if v > 0 => Some(v as u64),
            Some(v) => {
                warnings.push(ConfigWarning {
                    field: "bandwidth_limit",
                    message: format!("{} is not a positive rate, cap disabled", v),
                });
                None
            }
        };
        let memory_batch_size = clamp_i64(
            raw.memory_batch_size,
            "memory_batch_size",
            1,
            i64::MAX,
            DEFAULT_BATCH_SIZE as i64,
            &mut warnings,
        ) as usize;
        let stuck_secs = clamp_i64(
            raw.stuck_threshold_secs,
            "stuck_threshold_secs",
            1,
            i64::MAX,
            DEFAULT_STUCK_THRESHOLD_SECS as i64,
            &mut warnings,
        ) as u64;

        for w in &warnings {
            tracing::warn!(field = w.field, "{}", w.message);
        }

        let cfg = Self {
            max_concurrent_uploads: max_concurrent,
            chunk_size,
            max_retries,
            base_retry_delay: Duration::from_millis(base_ms),
            max_retry_delay: Duration::from_millis(max_ms),
            auto_start: raw.auto_start.unwrap_or(true),
            smart_scheduling: raw.smart_scheduling.unwrap_or(true),
            bandwidth_limit,
            memory_batch_size,
            stuck_threshold: Duration::from_secs(stuck_secs),
            verify_chunks: raw.verify_chunks.unwrap_or(true),
            adaptive_bandwidth: raw.adaptive_bandwidth.unwrap_or(false),
        };
        (cfg, warnings)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("blobup")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
/// Returns the validated config plus any clamping warnings.
pub fn load_or_init() -> Result<(EngineConfig, Vec<ConfigWarning>)> {
    let path = config_path()?;
    if !path.exists() {
        let raw = RawEngineConfig::default();
        let toml = toml::to_string_pretty(&raw)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(EngineConfig::from_raw(raw));
    }

    let data = fs::read_to_string(&path)?;
    let raw: RawEngineConfig = toml::from_str(&data)?;
    Ok(EngineConfig::from_raw(raw))
}
