//! Load simulator for edgequake-jobs.
//!
//! Drives a [`ConversionService`] with a synthetic processor so the
//! scheduler can be watched under load: how concurrency adapts to the memory
//! band, which operations degrade and how long the backlog takes to drain.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use edgequake_jobs::{
    ConversionError, ConversionRequest, ConversionService, ConvertTask, JobProcessor,
    ManualMemoryProbe, MemoryObjectStore, ObjectRef, OperationId, OperationObserver,
    OperationStatus, SchedulerConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── Synthetic processor ──────────────────────────────────────────────────────

/// Sleeps in proportion to the work it is given and fails a stable,
/// configurable share of units.
struct SimProcessor {
    scratch: Arc<MemoryObjectStore>,
    per_unit: Duration,
    failure_rate: f64,
    transient_rate: f64,
}

impl SimProcessor {
    /// Deterministic value in `[0, 1)` for one (operation, unit, salt).
    fn roll(task: &ConvertTask, salt: u32) -> f64 {
        let mut hasher = DefaultHasher::new();
        task.operation_id.hash(&mut hasher);
        task.segment.map(|s| s.to_string()).hash(&mut hasher);
        salt.hash(&mut hasher);
        (hasher.finish() % 10_000) as f64 / 10_000.0
    }
}

#[async_trait]
impl JobProcessor for SimProcessor {
    async fn convert(
        &self,
        _input: &ObjectRef,
        task: &ConvertTask,
    ) -> Result<ObjectRef, ConversionError> {
        let units = task.segment.map_or(1, |s| s.units().min(1_000)) as u32;
        tokio::time::sleep(self.per_unit * units.max(1)).await;

        // Transient failures depend on the attempt, so retries can recover.
        if Self::roll(task, task.attempt) < self.transient_rate {
            return Err(ConversionError::TransientIo("simulated connection reset".into()));
        }
        if task.segment.is_some() && Self::roll(task, 0) < self.failure_rate {
            return Err(ConversionError::UnrecoverableInput("simulated corrupt page".into()));
        }

        let label = task
            .segment
            .map_or_else(|| "whole document".to_string(), |s| s.to_string());
        let body = format!("## {} ({})\n\n", task.correlation_id, label);
        Ok(self.scratch.insert(body.into_bytes()))
    }
}

// ── Progress observer ────────────────────────────────────────────────────────

/// Renders one progress bar over all operations and a line per outcome.
struct CliObserver {
    bar: ProgressBar,
    verbose: bool,
    chunk_errors: AtomicUsize,
}

impl CliObserver {
    fn new(operations: usize, hidden: bool, verbose: bool) -> Arc<Self> {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(operations as u64)
        };
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} operations  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        bar.set_style(style);
        bar.set_prefix("Simulating");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            verbose,
            chunk_errors: AtomicUsize::new(0),
        })
    }
}

impl OperationObserver for CliObserver {
    fn on_operation_start(&self, operation: OperationId, total_units: usize) {
        if self.verbose && total_units > 1 {
            self.bar
                .println(dim(&format!("  {operation}: {total_units} chunks")));
        }
    }

    fn on_chunk_error(&self, operation: OperationId, index: u32, error: &ConversionError) {
        self.chunk_errors.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            self.bar.println(format!(
                "  {} {} chunk {:<4} {}",
                red("✗"),
                operation,
                index,
                dim(&error.to_string())
            ));
        }
    }

    fn on_operation_finished(&self, operation: OperationId, status: OperationStatus) {
        let mark = match status {
            OperationStatus::Completed => green("✓"),
            OperationStatus::Degraded => yellow("◐"),
            _ => red("✗"),
        };
        self.bar.println(format!("  {mark} {operation}  {status:?}"));
        self.bar.inc(1);
    }
}

// ── CLI ──────────────────────────────────────────────────────────────────────

/// Simulate a conversion workload against the memory-aware scheduler.
#[derive(Parser, Debug)]
#[command(
    name = "jobsim",
    version,
    about = "Simulate a conversion workload against the memory-aware scheduler",
    color = clap::ColorChoice::Auto
)]
struct Cli {
    /// Number of operations to submit.
    #[arg(short = 'n', long, env = "JOBSIM_OPERATIONS", default_value_t = 20)]
    operations: usize,

    /// Pages per document.
    #[arg(long, env = "JOBSIM_PAGES", default_value_t = 120)]
    pages: u32,

    /// Estimated input size per document, in KiB.
    #[arg(long, env = "JOBSIM_SIZE_KIB", default_value_t = 32 * 1024)]
    size_kib: u64,

    /// Share of chunks that fail as unrecoverable (0.0–1.0).
    #[arg(long, env = "JOBSIM_FAILURE_RATE", default_value_t = 0.05)]
    failure_rate: f64,

    /// Share of attempts that fail transiently (0.0–1.0).
    #[arg(long, env = "JOBSIM_TRANSIENT_RATE", default_value_t = 0.05)]
    transient_rate: f64,

    /// Simulated conversion time per page, in milliseconds.
    #[arg(long, env = "JOBSIM_PAGE_MS", default_value_t = 2)]
    page_ms: u64,

    /// Pin memory utilisation to this ratio instead of sampling the host.
    #[arg(long, env = "JOBSIM_MEMORY_RATIO")]
    memory_ratio: Option<f64>,

    /// Initial max concurrency.
    #[arg(short, long, env = "JOBSIM_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Scheduler configuration as JSON; flags override it.
    #[arg(long, env = "JOBSIM_CONFIG")]
    config: Option<PathBuf>,

    /// Give up waiting for an operation after this many seconds.
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,

    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Log level: -v info, -vv debug.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Serialize)]
struct Summary {
    operations: usize,
    elapsed_ms: u128,
    statuses: BTreeMap<String, usize>,
    chunk_errors: usize,
    peak_active_jobs: usize,
    final_max_concurrency: usize,
    uploads: usize,
    deduplicated_uploads: u64,
    fallback_uploads: u64,
}

fn load_config(cli: &Cli) -> Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            SchedulerConfig::from_json_str(&json)
                .with_context(|| format!("Invalid config in {}", path.display()))?
        }
        None => SchedulerConfig::default(),
    };
    if let Some(n) = cli.concurrency {
        config.baseline_concurrency = n;
        config.max_concurrency_cap = config.max_concurrency_cap.max(n);
    }
    config.validate().context("Invalid scheduler configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build service ────────────────────────────────────────────────────
    let config = load_config(&cli)?;
    let scratch = Arc::new(MemoryObjectStore::new("scratch"));
    let durable = Arc::new(MemoryObjectStore::new("durable"));
    let observer = CliObserver::new(cli.operations, cli.no_progress || cli.json, cli.verbose > 0);
    let processor = Arc::new(SimProcessor {
        scratch: scratch.clone(),
        per_unit: Duration::from_millis(cli.page_ms),
        failure_rate: cli.failure_rate.clamp(0.0, 1.0),
        transient_rate: cli.transient_rate.clamp(0.0, 1.0),
    });

    let mut builder = ConversionService::builder(config)
        .processor(processor)
        .scratch_store(scratch)
        .durable_store(durable.clone())
        .with_observer(observer.clone());
    if let Some(ratio) = cli.memory_ratio {
        builder = builder.memory_probe(Arc::new(ManualMemoryProbe::new(ratio)));
    }
    let service = builder.build().context("Failed to build service")?;
    service.start().context("Failed to start service")?;

    // ── Submit workload ──────────────────────────────────────────────────
    let started = Instant::now();
    let mut ids = Vec::with_capacity(cli.operations);
    for i in 0..cli.operations {
        let request = ConversionRequest::new(
            ObjectRef::new(format!("sim://documents/{i}.pdf")),
            "pdf",
            "md",
        )
        .estimated_input_bytes(cli.size_kib * 1024)
        .page_count(cli.pages)
        .priority((i % 3) as i32)
        .correlation_id(format!("doc-{i}"));
        ids.push(service.create_operation(request)?);
    }

    // ── Wait ─────────────────────────────────────────────────────────────
    let mut statuses: BTreeMap<String, usize> = BTreeMap::new();
    for id in &ids {
        let report = service
            .wait_for_terminal(*id, Duration::from_secs(cli.timeout_secs))
            .await
            .with_context(|| format!("Operation {id} did not finish"))?;
        *statuses.entry(format!("{:?}", report.status)).or_default() += 1;
    }
    observer.bar.finish_and_clear();

    let queue = service.get_queue_stats();
    let uploads = service.upload_stats();
    service.shutdown().await;

    let summary = Summary {
        operations: ids.len(),
        elapsed_ms: started.elapsed().as_millis(),
        statuses,
        chunk_errors: observer.chunk_errors.load(Ordering::Relaxed),
        peak_active_jobs: queue.peak_active_jobs,
        final_max_concurrency: queue.max_concurrency,
        uploads: durable.len(),
        deduplicated_uploads: uploads.deduplicated,
        fallback_uploads: uploads.fallbacks,
    };

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
        );
        return Ok(());
    }

    println!();
    println!(
        "{} {} operations in {:.2}s",
        bold("Done:"),
        summary.operations,
        summary.elapsed_ms as f64 / 1000.0
    );
    for (status, count) in &summary.statuses {
        println!("  {:<12} {}", status, count);
    }
    println!("  {:<12} {}", "chunk errors", summary.chunk_errors);
    println!(
        "{}",
        dim(&format!(
            "peak active {} · final max concurrency {} · {} artifacts stored, {} deduplicated, {} in fallback",
            summary.peak_active_jobs,
            summary.final_max_concurrency,
            summary.uploads,
            summary.deduplicated_uploads,
            summary.fallback_uploads
        ))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_flag_reaches_the_observer() {
        let cli = Cli::try_parse_from(["jobsim", "-v", "--no-progress"]).unwrap();
        let observer = CliObserver::new(cli.operations, cli.no_progress, cli.verbose > 0);
        assert!(observer.verbose);

        let cli = Cli::try_parse_from(["jobsim", "--json"]).unwrap();
        let observer = CliObserver::new(cli.operations, cli.json, cli.verbose > 0);
        assert!(!observer.verbose);
    }

    #[test]
    fn chunk_errors_are_counted_even_when_quiet() {
        let observer = CliObserver::new(1, true, false);
        let operation = OperationId::new();
        let err = ConversionError::UnrecoverableInput("corrupt page".into());
        observer.on_chunk_error(operation, 2, &err);
        observer.on_chunk_error(operation, 5, &err);
        assert_eq!(observer.chunk_errors.load(Ordering::Relaxed), 2);
    }
}
