//! Benchmark run.
//!
//! Exports every asset of the configured catalogue with a fixed pool size and
//! times each file. The total wall time is the node's performance index: lower
//! is faster, and the performance-biased strategy weights nodes by it.

use super::handler::BatchCoordinator;
use super::state::{BatchReport, Outcome, Phase};
use crate::catalogue::types::Catalogue;

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;

/// Pool size for benchmark runs, independent of the local core count so
/// indices stay comparable between nodes.
pub const BENCHMARK_WORKERS: usize = 4;

pub const COSTS_FILE: &str = "costs.json";

#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    /// Total seconds for the whole catalogue.
    pub performance_index: f64,
    /// Seconds per source file name.
    pub costs: BTreeMap<String, f64>,
    pub report: BatchReport,
}

/// Seconds rounded to two decimals.
pub fn round_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

pub fn save_costs(path: &Path, costs: &BTreeMap<String, f64>) -> Result<()> {
    let json = serde_json::to_string_pretty(costs)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

impl BatchCoordinator {
    /// Runs the benchmark and writes the per-file timings to `costs_path`.
    pub async fn run_benchmark(&mut self, costs_path: &Path) -> Result<BenchmarkResult> {
        let started = Instant::now();
        self.state.advance(Phase::Dispatching)?;

        let catalogue = Catalogue::load(&self.settings.catalogue_path);
        let root = self.settings.asset_root();
        let assets: BTreeSet<&str> = catalogue.entries().map(|(_, path, _)| path).collect();

        let tasks = assets
            .iter()
            .map(|asset| self.local_task(Catalogue::source_path(&root, asset)))
            .collect::<Vec<_>>();

        info!("Benchmarking {} source files with {} workers", tasks.len(), BENCHMARK_WORKERS);
        let pool_report = self.pool.run(tasks, BENCHMARK_WORKERS).await;
        let elapsed = started.elapsed();

        self.state.advance(Phase::Finishing)?;

        let costs: BTreeMap<String, f64> = pool_report
            .timings
            .iter()
            .map(|(source, time)| (file_label(source), round_seconds(*time)))
            .collect();
        for (file, seconds) in &costs {
            info!("{} {}", file, seconds);
        }
        save_costs(costs_path, &costs)?;

        let performance_index = round_seconds(elapsed);
        info!(
            "{} full catalogue export in {} seconds",
            assets.len(),
            performance_index
        );

        let outcome = if assets.is_empty() {
            Outcome::NoChanges
        } else {
            Outcome::Completed
        };
        let mut report = BatchReport::new("benchmark", outcome);
        report.processed = pool_report.completed;
        report.errors = pool_report.failures;

        self.state.advance(Phase::Idle)?;
        report.elapsed = elapsed;

        Ok(BenchmarkResult {
            performance_index,
            costs,
            report,
        })
    }
}

fn file_label(source: &Path) -> String {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.display().to_string())
}
