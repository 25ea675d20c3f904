//! Configuration for the scheduling core.
//!
//! Every knob of the memory monitor, processing queue, chunk coordinator and
//! upload manager lives in [`SchedulerConfig`], built via its
//! [`SchedulerConfigBuilder`] or loaded from JSON. Durations are stored as
//! integer milliseconds so a config file reads the same as the struct.

use crate::error::JobError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for a [`crate::service::ConversionService`].
///
/// # Example
/// ```rust
/// use edgequake_jobs::SchedulerConfig;
///
/// let config = SchedulerConfig::builder()
///     .baseline_concurrency(2)
///     .max_attempts(5)
///     .failure_tolerance(0.2)
///     .build()
///     .unwrap();
/// assert_eq!(config.baseline_concurrency, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    // ── Memory monitor ───────────────────────────────────────────────────
    /// Utilisation ratio at which the band becomes Warning. Default: 0.60.
    pub warning_threshold: f64,
    /// Utilisation ratio at which the band becomes Critical. Default: 0.75.
    pub critical_threshold: f64,
    /// Utilisation ratio at which the band becomes Emergency. Default: 0.85.
    pub emergency_threshold: f64,
    /// Memory sampling period. Default: 1000 ms.
    pub sample_interval_ms: u64,
    /// How long utilisation must stay below a threshold before the band
    /// steps down. Default: 10 000 ms.
    ///
    /// Escalation is immediate; only de-escalation waits.
    pub band_cooldown_ms: u64,
    /// Memory limit of the host runtime in bytes. When `None`, process RSS is
    /// compared against total host memory.
    pub memory_limit_bytes: Option<u64>,

    // ── Processing queue ─────────────────────────────────────────────────
    /// Initial `maxConcurrency`. Default: 4.
    pub baseline_concurrency: usize,
    /// Upper bound for adaptive growth. Default: 16.
    pub max_concurrency_cap: usize,
    /// Aggregate estimated memory that active jobs may reserve. Default: 1 GiB.
    pub memory_budget_bytes: u64,
    /// Admission tick period. Default: 250 ms.
    pub tick_interval_ms: u64,
    /// Attempts per job before a retryable failure becomes terminal. Default: 3.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt. Default: 500 ms.
    pub retry_base_delay_ms: u64,
    /// Retry delay ceiling. Default: 30 000 ms.
    pub retry_max_delay_ms: u64,
    /// Requeues caused by resource exhaustion before the job fails. Default: 8.
    ///
    /// These requeues do not consume `max_attempts`.
    pub max_resource_requeues: u32,

    // ── Chunk coordinator ────────────────────────────────────────────────
    /// Inputs larger than this are chunked. Default: 20 MiB.
    pub chunk_size_threshold_bytes: u64,
    /// Target formats whose multiplier exceeds this are chunked. Default: 2.0.
    pub complexity_threshold: f64,
    /// Per-target-format cost multiplier; unknown formats use 1.0.
    pub complexity_multipliers: BTreeMap<String, f64>,
    /// Peak memory per input byte for a multiplier of 1.0. Default: 4.0.
    pub memory_amplification: f64,
    /// Per-chunk resource estimate ceiling. Default: 128 MiB.
    pub chunk_memory_ceiling_bytes: u64,
    /// Head-room factor applied when sizing chunks so they still fit the
    /// ceiling under Warning-band conditions. Default: 1.5.
    pub warning_safety_factor: f64,
    /// Hard cap on pages per chunk. Default: 50.
    pub max_pages_per_chunk: u32,
    /// Highest failed-chunk ratio that still yields a Degraded result.
    /// Default: 0.25.
    pub failure_tolerance: f64,
    /// Inserted between chunk outputs when combining.
    pub chunk_separator: ChunkSeparator,

    // ── Durable uploads ──────────────────────────────────────────────────
    /// Concurrent transfers, independent of conversion concurrency. Default: 4.
    pub upload_concurrency: usize,
    /// Attempts against the durable store before falling back. Default: 4.
    pub upload_max_attempts: u32,
    /// First upload retry delay. Default: 200 ms.
    pub upload_base_delay_ms: u64,
    /// Upload retry delay ceiling. Default: 5 000 ms.
    pub upload_max_delay_ms: u64,
    /// Timeout of the first upload attempt; doubles per attempt. Default: 2 000 ms.
    pub upload_attempt_timeout_ms: u64,
    /// Per-attempt timeout ceiling. Default: 16 000 ms.
    pub upload_max_attempt_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.60,
            critical_threshold: 0.75,
            emergency_threshold: 0.85,
            sample_interval_ms: 1_000,
            band_cooldown_ms: 10_000,
            memory_limit_bytes: None,
            baseline_concurrency: 4,
            max_concurrency_cap: 16,
            memory_budget_bytes: 1 << 30,
            tick_interval_ms: 250,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            max_resource_requeues: 8,
            chunk_size_threshold_bytes: 20 << 20,
            complexity_threshold: 2.0,
            complexity_multipliers: default_complexity_multipliers(),
            memory_amplification: 4.0,
            chunk_memory_ceiling_bytes: 128 << 20,
            warning_safety_factor: 1.5,
            max_pages_per_chunk: 50,
            failure_tolerance: 0.25,
            chunk_separator: ChunkSeparator::default(),
            upload_concurrency: 4,
            upload_max_attempts: 4,
            upload_base_delay_ms: 200,
            upload_max_delay_ms: 5_000,
            upload_attempt_timeout_ms: 2_000,
            upload_max_attempt_timeout_ms: 16_000,
        }
    }
}

fn default_complexity_multipliers() -> BTreeMap<String, f64> {
    [
        ("png", 2.5),
        ("jpeg", 2.0),
        ("docx", 1.5),
        ("html", 1.2),
        ("md", 1.0),
        ("txt", 0.5),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl SchedulerConfig {
    /// Create a new builder for `SchedulerConfig`.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parse and validate a JSON document; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, JobError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| JobError::InvalidConfig(format!("JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Cost multiplier for a target format (case-insensitive, default 1.0).
    pub fn complexity_of(&self, target_format: &str) -> f64 {
        self.complexity_multipliers
            .get(&target_format.to_ascii_lowercase())
            .copied()
            .unwrap_or(1.0)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn band_cooldown(&self) -> Duration {
        Duration::from_millis(self.band_cooldown_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), JobError> {
        let (w, c, e) = (
            self.warning_threshold,
            self.critical_threshold,
            self.emergency_threshold,
        );
        if !(0.0 < w && w < c && c < e && e <= 1.0) {
            return Err(JobError::InvalidConfig(format!(
                "thresholds must satisfy 0 < warning < critical < emergency <= 1, got {w}/{c}/{e}"
            )));
        }
        if self.baseline_concurrency == 0 {
            return Err(JobError::InvalidConfig(
                "baseline_concurrency must be ≥ 1".into(),
            ));
        }
        if self.baseline_concurrency > self.max_concurrency_cap {
            return Err(JobError::InvalidConfig(format!(
                "baseline_concurrency {} exceeds max_concurrency_cap {}",
                self.baseline_concurrency, self.max_concurrency_cap
            )));
        }
        if self.max_attempts == 0 {
            return Err(JobError::InvalidConfig("max_attempts must be ≥ 1".into()));
        }
        if self.upload_concurrency == 0 || self.upload_max_attempts == 0 {
            return Err(JobError::InvalidConfig(
                "upload_concurrency and upload_max_attempts must be ≥ 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_tolerance) {
            return Err(JobError::InvalidConfig(format!(
                "failure_tolerance must be within 0–1, got {}",
                self.failure_tolerance
            )));
        }
        if self.tick_interval_ms == 0 || self.sample_interval_ms == 0 {
            return Err(JobError::InvalidConfig(
                "tick and sample intervals must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Debug)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn thresholds(mut self, warning: f64, critical: f64, emergency: f64) -> Self {
        self.config.warning_threshold = warning;
        self.config.critical_threshold = critical;
        self.config.emergency_threshold = emergency;
        self
    }

    pub fn sample_interval_ms(mut self, ms: u64) -> Self {
        self.config.sample_interval_ms = ms.max(1);
        self
    }

    pub fn band_cooldown_ms(mut self, ms: u64) -> Self {
        self.config.band_cooldown_ms = ms;
        self
    }

    pub fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.config.memory_limit_bytes = Some(bytes.max(1));
        self
    }

    pub fn baseline_concurrency(mut self, n: usize) -> Self {
        self.config.baseline_concurrency = n.max(1);
        self
    }

    pub fn max_concurrency_cap(mut self, n: usize) -> Self {
        self.config.max_concurrency_cap = n.max(1);
        self
    }

    pub fn memory_budget_bytes(mut self, bytes: u64) -> Self {
        self.config.memory_budget_bytes = bytes;
        self
    }

    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.tick_interval_ms = ms.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.config.retry_base_delay_ms = base;
        self.config.retry_max_delay_ms = max.max(base);
        self
    }

    pub fn max_resource_requeues(mut self, n: u32) -> Self {
        self.config.max_resource_requeues = n;
        self
    }

    pub fn chunk_size_threshold_bytes(mut self, bytes: u64) -> Self {
        self.config.chunk_size_threshold_bytes = bytes;
        self
    }

    pub fn complexity_threshold(mut self, t: f64) -> Self {
        self.config.complexity_threshold = t;
        self
    }

    pub fn complexity_multiplier(mut self, format: impl Into<String>, m: f64) -> Self {
        self.config
            .complexity_multipliers
            .insert(format.into().to_ascii_lowercase(), m.max(0.0));
        self
    }

    pub fn memory_amplification(mut self, factor: f64) -> Self {
        self.config.memory_amplification = factor.max(0.0);
        self
    }

    pub fn chunk_memory_ceiling_bytes(mut self, bytes: u64) -> Self {
        self.config.chunk_memory_ceiling_bytes = bytes.max(1);
        self
    }

    pub fn warning_safety_factor(mut self, factor: f64) -> Self {
        self.config.warning_safety_factor = factor.max(1.0);
        self
    }

    pub fn max_pages_per_chunk(mut self, pages: u32) -> Self {
        self.config.max_pages_per_chunk = pages.max(1);
        self
    }

    pub fn failure_tolerance(mut self, ratio: f64) -> Self {
        self.config.failure_tolerance = ratio;
        self
    }

    pub fn chunk_separator(mut self, sep: ChunkSeparator) -> Self {
        self.config.chunk_separator = sep;
        self
    }

    pub fn upload_concurrency(mut self, n: usize) -> Self {
        self.config.upload_concurrency = n.max(1);
        self
    }

    pub fn upload_max_attempts(mut self, n: u32) -> Self {
        self.config.upload_max_attempts = n.max(1);
        self
    }

    pub fn upload_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.config.upload_base_delay_ms = base;
        self.config.upload_max_delay_ms = max.max(base);
        self
    }

    pub fn upload_attempt_timeouts_ms(mut self, first: u64, max: u64) -> Self {
        self.config.upload_attempt_timeout_ms = first.max(1);
        self.config.upload_max_attempt_timeout_ms = max.max(first.max(1));
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<SchedulerConfig, JobError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// What goes between chunk outputs in a combined result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkSeparator {
    /// Outputs are concatenated byte for byte. (default)
    #[default]
    None,
    /// A blank line: "\n\n".
    BlankLine,
    /// HTML comment naming the chunk: "\n\n<!-- chunk N -->\n\n".
    Comment,
    /// Custom string inserted between chunks.
    Custom(String),
}

impl ChunkSeparator {
    /// Render the separator placed before chunk `index` (0-based).
    pub fn render(&self, index: u32) -> String {
        match self {
            ChunkSeparator::None => String::new(),
            ChunkSeparator::BlankLine => "\n\n".to_string(),
            ChunkSeparator::Comment => format!("\n\n<!-- chunk {} -->\n\n", index),
            ChunkSeparator::Custom(s) => s.clone(),
        }
    }
}
