//! Local Multiprocessing Engine
//!
//! Executes a batch of tasks with at most `worker_count` tool processes alive
//! at a time. Each task spawns its own process (no reuse), a failed task is
//! recorded and never stops its siblings, and `run` returns only when the
//! whole batch has drained.
//!
//! Progress is published on a `watch` channel as a percentage of completed
//! tasks; completion order may differ from submission order.

use super::invocation;
use super::types::{PoolReport, TaskDescriptor};
use crate::error::BatchError;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

/// Runs one task and returns the source file if it failed.
pub type InvokeFn =
    Arc<dyn Fn(TaskDescriptor) -> Pin<Box<dyn Future<Output = Option<PathBuf>> + Send>> + Send + Sync>;

pub struct LocalPool {
    invoker: InvokeFn,
    progress: watch::Sender<u8>,
}

impl LocalPool {
    /// Pool that launches the external tool for every task.
    pub fn new() -> Self {
        Self::with_invoker(invocation::invoke)
    }

    /// Pool with a custom task runner.
    pub fn with_invoker<F, Fut>(invoker: F) -> Self
    where
        F: Fn(TaskDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<PathBuf>> + Send + 'static,
    {
        let invoker: InvokeFn = Arc::new(move |task: TaskDescriptor| {
            Box::pin(invoker(task)) as Pin<Box<dyn Future<Output = Option<PathBuf>> + Send>>
        });
        let (progress, _) = watch::channel(0);

        Self { invoker, progress }
    }

    /// Receives the completion percentage of the running batch.
    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }

    /// Runs every task and waits for all of them.
    pub async fn run(&self, tasks: Vec<TaskDescriptor>, worker_count: usize) -> PoolReport {
        let total = tasks.len();
        let mut report = PoolReport::default();
        self.progress.send_replace(0);

        if total == 0 {
            return report;
        }

        let worker_count = worker_count.max(1);
        tracing::info!("Spawning up to {} workers for {} tasks", worker_count, total);

        let permits = Arc::new(Semaphore::new(worker_count));
        let mut running = JoinSet::new();

        for task in tasks {
            let permits = permits.clone();
            let invoker = self.invoker.clone();

            running.spawn(async move {
                let source = task.source_file.clone();
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (source.clone(), Some(source), Duration::ZERO),
                };

                let started = Instant::now();
                // Inner spawn so a panicking runner is contained to its task.
                let outcome = match tokio::spawn(invoker(task)).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!("Worker for {} aborted: {}", source.display(), e);
                        Some(source.clone())
                    }
                };

                (source, outcome, started.elapsed())
            });
        }

        while let Some(joined) = running.join_next().await {
            let (source, failure, elapsed) = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Worker slot lost: {}", e);
                    continue;
                }
            };

            report.completed += 1;
            report.timings.push((source, elapsed));
            if let Some(failed) = failure {
                report.failures.push(failed);
            }

            let percent = progress_percent(report.completed, total);
            self.progress.send_replace(percent);
            tracing::debug!("Progress {}% ({}/{})", percent, report.completed, total);
        }

        if report.has_failures() {
            tracing::error!("Errors in {} of {} files:", report.failures.len(), total);
            for file in &report.failures {
                tracing::error!("  {}", BatchError::Worker(file.clone()));
            }
        }

        report
    }
}

impl Default for LocalPool {
    fn default() -> Self {
        Self::new()
    }
}

/// `round(completed / total * 100)`, clamped to 100.
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (completed as f64 / total as f64 * 100.0).round();
    percent.min(100.0) as u8
}
