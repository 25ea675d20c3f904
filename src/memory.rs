//! Memory monitor: sample utilisation, classify it into bands, notify on change.
//!
//! The monitor is the leaf every admission decision hangs off. It reads a
//! utilisation ratio from a [`MemoryProbe`], maps it onto a [`MemoryBand`]
//! and applies hysteresis:
//!
//! * moving to a **higher** band is immediate;
//! * moving to a **lower** band requires the raw reading to stay below the
//!   current band for `band_cooldown` first.
//!
//! At Critical and above the monitor asks every registered [`Reclaimer`] to
//! release what it can, then re-samples once before deciding.
//!
//! Subscribers are called synchronously, only on confirmed transitions.

use crate::config::SchedulerConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Discrete memory-utilisation classification, ordered by severity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBand {
    #[default]
    Normal,
    Warning,
    Critical,
    Emergency,
}

/// Ratios at which each band starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandThresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            warning: 0.60,
            critical: 0.75,
            emergency: 0.85,
        }
    }
}

impl BandThresholds {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            warning: config.warning_threshold,
            critical: config.critical_threshold,
            emergency: config.emergency_threshold,
        }
    }

    pub fn band_for_ratio(self, ratio: f64) -> MemoryBand {
        if ratio >= self.emergency {
            MemoryBand::Emergency
        } else if ratio >= self.critical {
            MemoryBand::Critical
        } else if ratio >= self.warning {
            MemoryBand::Warning
        } else {
            MemoryBand::Normal
        }
    }
}

/// A confirmed band change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandTransition {
    pub previous: MemoryBand,
    pub current: MemoryBand,
    pub ratio: f64,
}

type TransitionListener = Arc<dyn Fn(BandTransition) + Send + Sync>;

// ── Probes ───────────────────────────────────────────────────────────────

/// Source of utilisation readings.
pub trait MemoryProbe: Send + Sync {
    /// Current utilisation as a ratio (0.0–1.0+), or `None` when unavailable.
    fn utilization(&self) -> Option<f64>;
}

/// Host probe backed by `sysinfo`.
///
/// With a `limit_bytes` the ratio is process RSS over that limit (the shape
/// of a memory-capped container or serverless host); without one it is
/// used host memory over total host memory.
pub struct SystemMemoryProbe {
    system: Mutex<sysinfo::System>,
    pid: Option<sysinfo::Pid>,
    limit_bytes: Option<u64>,
}

impl SystemMemoryProbe {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!("sysinfo cannot resolve current pid: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(sysinfo::System::new()),
            pid,
            limit_bytes,
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn utilization(&self) -> Option<f64> {
        let mut sys = self.system.lock();
        match self.limit_bytes {
            Some(limit) => {
                let pid = self.pid?;
                if !sys.refresh_process(pid) {
                    return None;
                }
                let rss = sys.process(pid)?.memory();
                Some(rss as f64 / limit.max(1) as f64)
            }
            None => {
                sys.refresh_memory();
                let total = sys.total_memory();
                if total == 0 {
                    return None;
                }
                Some(sys.used_memory() as f64 / total as f64)
            }
        }
    }
}

/// Probe whose reading is set by hand; for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualMemoryProbe {
    bits: AtomicU64,
}

impl ManualMemoryProbe {
    pub fn new(ratio: f64) -> Self {
        Self {
            bits: AtomicU64::new(ratio.to_bits()),
        }
    }

    pub fn set(&self, ratio: f64) {
        self.bits.store(ratio.to_bits(), Ordering::SeqCst);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn utilization(&self) -> Option<f64> {
        Some(self.get())
    }
}

/// Something that can give memory back when asked (caches, buffers).
pub trait Reclaimer: Send + Sync {
    fn name(&self) -> &str;

    /// Release what can be released; returns an estimate of bytes freed.
    fn reclaim(&self) -> u64;
}

// ── Monitor ──────────────────────────────────────────────────────────────

struct MonitorState {
    band: MemoryBand,
    last_ratio: f64,
    /// When the raw reading first dropped below the current band.
    below_since: Option<Instant>,
}

pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    thresholds: BandThresholds,
    cooldown: Duration,
    state: Mutex<MonitorState>,
    listeners: Mutex<Vec<TransitionListener>>,
    reclaimers: Mutex<Vec<Arc<dyn Reclaimer>>>,
    band_tx: watch::Sender<MemoryBand>,
}

impl MemoryMonitor {
    pub fn new(probe: Arc<dyn MemoryProbe>, thresholds: BandThresholds, cooldown: Duration) -> Self {
        let (band_tx, _) = watch::channel(MemoryBand::Normal);
        Self {
            probe,
            thresholds,
            cooldown,
            state: Mutex::new(MonitorState {
                band: MemoryBand::Normal,
                last_ratio: 0.0,
                below_since: None,
            }),
            listeners: Mutex::new(Vec::new()),
            reclaimers: Mutex::new(Vec::new()),
            band_tx,
        }
    }

    pub fn from_config(probe: Arc<dyn MemoryProbe>, config: &SchedulerConfig) -> Self {
        Self::new(probe, BandThresholds::from_config(config), config.band_cooldown())
    }

    /// Register a callback fired on every confirmed transition.
    pub fn subscribe(&self, listener: impl Fn(BandTransition) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    pub fn register_reclaimer(&self, reclaimer: Arc<dyn Reclaimer>) {
        self.reclaimers.lock().push(reclaimer);
    }

    /// Last confirmed band (no sampling).
    pub fn current_band(&self) -> MemoryBand {
        self.state.lock().band
    }

    pub fn last_ratio(&self) -> f64 {
        self.state.lock().last_ratio
    }

    /// Receiver that observes every confirmed band.
    pub fn band_receiver(&self) -> watch::Receiver<MemoryBand> {
        self.band_tx.subscribe()
    }

    /// Take one sample and return the confirmed band.
    pub fn sample(&self) -> MemoryBand {
        self.sample_at(Instant::now())
    }

    /// Sample as if the clock read `now`; lets hysteresis be driven
    /// deterministically.
    pub fn sample_at(&self, now: Instant) -> MemoryBand {
        let Some(mut ratio) = self.probe.utilization() else {
            debug!("memory probe returned no reading; keeping current band");
            return self.current_band();
        };

        if self.thresholds.band_for_ratio(ratio) >= MemoryBand::Critical {
            if self.reclaim() {
                if let Some(after) = self.probe.utilization() {
                    debug!("re-sampled after reclamation: {:.3} -> {:.3}", ratio, after);
                    ratio = after;
                }
            }
        }

        let raw = self.thresholds.band_for_ratio(ratio);
        let transition = {
            let mut state = self.state.lock();
            state.last_ratio = ratio;
            let current = state.band;
            let next = if raw > current {
                state.below_since = None;
                Some(raw)
            } else if raw < current {
                let since = *state.below_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.cooldown {
                    state.below_since = None;
                    Some(raw)
                } else {
                    None
                }
            } else {
                state.below_since = None;
                None
            };

            next.map(|band| {
                state.band = band;
                BandTransition {
                    previous: current,
                    current: band,
                    ratio,
                }
            })
        };

        match transition {
            Some(t) => {
                if t.current > t.previous {
                    warn!(
                        "memory band {:?} -> {:?} (utilisation {:.1}%)",
                        t.previous,
                        t.current,
                        t.ratio * 100.0
                    );
                } else {
                    info!(
                        "memory band {:?} -> {:?} (utilisation {:.1}%)",
                        t.previous,
                        t.current,
                        t.ratio * 100.0
                    );
                }
                self.band_tx.send_replace(t.current);
                let listeners = self.listeners.lock().clone();
                for listener in listeners {
                    listener(t);
                }
                t.current
            }
            None => self.current_band(),
        }
    }

    /// Ask every reclaimer to release memory; `true` if any was registered.
    fn reclaim(&self) -> bool {
        let reclaimers = self.reclaimers.lock().clone();
        if reclaimers.is_empty() {
            return false;
        }
        for r in reclaimers {
            let freed = r.reclaim();
            debug!("reclaimer '{}' released ~{} bytes", r.name(), freed);
        }
        true
    }
}
