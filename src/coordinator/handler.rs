use super::state::{BatchReport, CoordinatorState, Outcome, Phase, Role};
use crate::catalogue::query::CatalogueQuery;
use crate::catalogue::types::{Catalogue, Resolution, ResolvedAsset, Selection};
use crate::config::Settings;
use crate::discovery::roster::NodeRoster;
use crate::discovery::service::DiscoveryService;
use crate::scheduler::strategy::Scheduler;
use crate::transfer::sender::TransferClient;
use crate::transfer::tracker::DispatchTracker;
use crate::transfer::types::{
    Descriptor, FailureReport, OutgoingFile, RemoteBatch, RemoteTask, ResultDescriptor,
};
use crate::worker::pool::LocalPool;
use crate::worker::types::{ALL_THREADS, TaskDescriptor};

use anyhow::Result;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Period of the master's completion check.
const COMPLETION_TICK: Duration = Duration::from_secs(1);

/// One asset of a dispatch leg: the staged name, its local source and its
/// catalogue path.
struct LegEntry {
    name: String,
    source: PathBuf,
    asset: String,
}

/// Drives one role through its phases: resolving the selection, running the
/// local pool, dispatching to nodes and collecting what comes back.
pub struct BatchCoordinator {
    pub(super) settings: Settings,
    pub(super) state: CoordinatorState,
    pub(super) pool: LocalPool,
    client: TransferClient,
}

impl BatchCoordinator {
    pub fn new(settings: Settings, role: Role) -> Self {
        let client = TransferClient::new(&settings.network);
        Self {
            settings,
            state: CoordinatorState::new(role),
            pool: LocalPool::new(),
            client,
        }
    }

    pub fn with_pool(mut self, pool: LocalPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_client(mut self, client: TransferClient) -> Self {
        self.client = client;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn pool(&self) -> &LocalPool {
        &self.pool
    }

    fn open_query(&self) -> Result<CatalogueQuery> {
        CatalogueQuery::open(&self.settings.catalogue_path, &self.settings.export_path)
    }

    /// Source files the selection resolves to, most expensive first.
    pub fn list(&self, selections: &[Selection]) -> Result<Vec<PathBuf>> {
        let query = self.open_query()?;
        let objects = query.catalogue().objects_for(selections);
        let root = self.settings.asset_root();

        Ok(query
            .resolve(&objects, self.settings.revision_export)
            .into_assets()
            .iter()
            .map(|asset| Catalogue::source_path(&root, &asset.path))
            .collect())
    }

    pub(super) fn local_task(&self, source_file: PathBuf) -> TaskDescriptor {
        TaskDescriptor {
            source_file,
            tool_path: self.settings.tool_path.clone(),
            script_path: self.settings.script_path.clone(),
            export_dir: self.settings.export_path.clone(),
            library_dir: self.settings.library_path.clone(),
            overrides: self.settings.overrides.clone(),
            threads: ALL_THREADS.to_string(),
        }
    }

    /// Finishing phase of every local/master run: back to idle with the
    /// report stamped.
    fn finish(&mut self, mut report: BatchReport, started: Instant) -> Result<BatchReport> {
        if self.state.phase() != Phase::Finishing {
            self.state.advance(Phase::Finishing)?;
        }
        self.state.advance(Phase::Idle)?;
        report.elapsed = started.elapsed();
        info!("{}", report);
        Ok(report)
    }

    // ============================================================
    // LOCAL
    // ============================================================

    /// Exports the selection on this machine with every core.
    pub async fn run_local(&mut self, selections: &[Selection]) -> Result<BatchReport> {
        let started = Instant::now();
        self.state.advance(Phase::Dispatching)?;

        let mut query = self.open_query()?;
        let objects = query.catalogue().objects_for(selections);
        let assets = match query.resolve(&objects, self.settings.revision_export) {
            Resolution::NoChanges => {
                return self.finish(BatchReport::new("local", Outcome::NoChanges), started);
            }
            Resolution::Assets(assets) => assets,
        };

        let root = self.settings.asset_root();
        let tasks: Vec<TaskDescriptor> = assets
            .iter()
            .map(|asset| self.local_task(Catalogue::source_path(&root, &asset.path)))
            .collect();

        info!("Source files: {}", tasks.len());
        let pool_report = self.pool.run(tasks, num_cpus::get()).await;

        self.state.advance(Phase::Finishing)?;
        let exported: BTreeSet<String> = assets
            .into_iter()
            .filter(|asset| !pool_report.failures.contains(&Catalogue::source_path(&root, &asset.path)))
            .map(|asset| asset.path)
            .collect();
        query.record_assets(&exported)?;

        let mut report = BatchReport::new("local", Outcome::Completed);
        report.processed = pool_report.completed;
        report.errors = pool_report.failures;
        self.finish(report, started)
    }

    // ============================================================
    // MASTER
    // ============================================================

    /// Partitions the selection over the roster, pushes every partition to
    /// its node and waits until each tasked node has sent its results back.
    pub async fn run_master(
        &mut self,
        selections: &[Selection],
        roster: &NodeRoster,
        tracker: &Arc<DispatchTracker>,
        cancel: CancellationToken,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        self.state.advance(Phase::Dispatching)?;

        let mut query = self.open_query()?;
        let objects = query.catalogue().objects_for(selections);
        let assets = match query.resolve(&objects, self.settings.revision_export) {
            Resolution::NoChanges => {
                return self.finish(BatchReport::new("master", Outcome::NoChanges), started);
            }
            Resolution::Assets(assets) => assets,
        };

        let nodes = roster.snapshot();
        if nodes.is_empty() {
            tracing::warn!("No nodes available for dispatch");
            return self.finish(BatchReport::new("master", Outcome::Reset), started);
        }

        let items: Vec<(ResolvedAsset, u64)> = assets
            .into_iter()
            .map(|asset| {
                let cost = asset.cost;
                (asset, cost)
            })
            .collect();
        let total = items.len();
        let assignments = Scheduler::new(self.settings.strategy).partition(&nodes, items);

        let batch_id = Uuid::new_v4();
        tracker.arm(assignments.iter().map(|assignment| assignment.node)).await;

        let root = self.settings.asset_root();
        let master = self.settings.network.local_address();
        let mut errors = Vec::new();
        let mut legs = JoinSet::new();

        for assignment in assignments {
            // Staged files are keyed by file name on the node.
            let mut names = HashSet::new();
            let mut entries = Vec::with_capacity(assignment.items.len());
            for asset in &assignment.items {
                let source = Catalogue::source_path(&root, &asset.path);
                let name = source
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| asset.path.clone());

                if !names.insert(name.clone()) {
                    tracing::warn!(
                        node = %assignment.node,
                        "Skipping {}: another asset named {} is in the same batch",
                        asset.path,
                        name
                    );
                    errors.push(source);
                    continue;
                }
                entries.push(LegEntry {
                    name,
                    source,
                    asset: asset.path.clone(),
                });
            }

            let batch_size = entries.len();
            let files: Vec<OutgoingFile> = entries
                .iter()
                .map(|entry| OutgoingFile {
                    path: entry.source.clone(),
                    descriptor: Descriptor::Task(RemoteTask {
                        magic: self.settings.network.magic_task.clone(),
                        master,
                        asset: entry.name.clone(),
                        overrides: self.settings.overrides.clone(),
                        batch_size,
                        batch_id,
                    }),
                })
                .collect();

            let client = self.client.clone();
            let peer = self.settings.network.transfer_addr(assignment.node);
            let node = assignment.node;

            legs.spawn(async move {
                info!(node = %node, "Sending {} tasks", entries.len());
                let result = client.send(peer, files).await;
                (node, entries, result)
            });
        }

        let mut delivered: HashMap<IpAddr, Vec<LegEntry>> = HashMap::new();
        while let Some(joined) = legs.join_next().await {
            let (node, entries, result) = match joined {
                Ok(leg) => leg,
                Err(e) => {
                    tracing::error!("Dispatch task failed: {}", e);
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    delivered.insert(node, entries);
                }
                Err(e) => {
                    tracing::error!(node = %node, "Dispatch failed: {}", e);
                    tracker.abandon(node).await;
                    errors.extend(entries.into_iter().map(|entry| entry.source));
                }
            }
        }

        if delivered.is_empty() {
            tracker.disarm().await;
            let mut report = BatchReport::new("master", Outcome::Reset);
            report.errors = errors;
            return self.finish(report, started);
        }

        self.state.advance(Phase::AwaitingResults)?;
        if !self.await_results(tracker, &cancel).await {
            tracker.disarm().await;
            let mut report = BatchReport::new("master", Outcome::Cancelled);
            report.errors = errors;
            self.state.advance(Phase::Finishing)?;
            return self.finish(report, started);
        }

        self.state.advance(Phase::Finishing)?;
        let mut failures = tracker.take_failures().await;
        let mut exported = BTreeSet::new();
        for (node, entries) in delivered {
            let failed: HashSet<String> = failures.remove(&node).unwrap_or_default().into_iter().collect();
            for entry in entries {
                if failed.contains(&entry.name) {
                    errors.push(entry.source);
                } else {
                    exported.insert(entry.asset);
                }
            }
        }
        query.record_assets(&exported)?;

        let mut report = BatchReport::new("master", Outcome::Completed);
        report.processed = total - errors.len();
        report.errors = errors;
        self.finish(report, started)
    }

    /// Returns `false` when cancelled before every node reported.
    async fn await_results(&self, tracker: &DispatchTracker, cancel: &CancellationToken) -> bool {
        let mut tick = tokio::time::interval(COMPLETION_TICK);

        loop {
            if tracker.is_complete().await {
                return true;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!("Cancelled while waiting for {:?}", tracker.pending().await);
                    return false;
                }
                _ = tracker.completed() => {}
                _ = tick.tick() => {
                    tracing::debug!("Waiting for {} nodes", tracker.pending().await.len());
                }
            }
        }
    }

    // ============================================================
    // WORKER
    // ============================================================

    /// Processes complete remote batches as they arrive until cancelled.
    pub async fn run_worker(
        &mut self,
        mut batches: mpsc::UnboundedReceiver<RemoteBatch>,
        discovery: Option<Arc<DiscoveryService>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.state.advance(Phase::Listening)?;
        info!("Waiting for work");

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let report = self.process_remote_batch(batch, discovery.as_deref()).await?;
            info!("{}", report);
        }

        self.state.advance(Phase::Idle)?;
        Ok(())
    }

    /// Runs one remote batch from the staging area and ships the exports back
    /// to its master.
    pub async fn process_remote_batch(
        &mut self,
        batch: RemoteBatch,
        discovery: Option<&DiscoveryService>,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        if self.state.phase() == Phase::Idle {
            self.state.advance(Phase::Listening)?;
        }
        if let Some(discovery) = discovery {
            discovery.set_busy(true);
        }
        self.state.advance(Phase::Processing)?;

        let cores = self.settings.effective_shared_cores();
        let threads = if cores < num_cpus::get() { "1" } else { ALL_THREADS };

        let staged: Vec<PathBuf> = batch
            .tasks
            .iter()
            .map(|task| self.settings.staging_dir.join(&task.asset))
            .collect();

        let tasks: Vec<TaskDescriptor> = batch
            .tasks
            .iter()
            .zip(&staged)
            .map(|(task, source)| TaskDescriptor {
                source_file: source.clone(),
                tool_path: self.settings.tool_path.clone(),
                script_path: self.settings.script_path.clone(),
                export_dir: self.settings.results_dir.clone(),
                library_dir: self.settings.library_path.clone(),
                overrides: task.overrides.clone(),
                threads: threads.to_string(),
            })
            .collect();

        info!("Processing batch {} of {} tasks for {}", batch.batch_id, tasks.len(), batch.master);
        let pool_report = self.pool.run(tasks, cores).await;

        self.state.advance(Phase::Transferring)?;
        let results = collect_results(&self.settings.results_dir).unwrap_or_else(|e| {
            tracing::error!("Could not scan {}: {}", self.settings.results_dir.display(), e);
            Vec::new()
        });
        let outgoing: Vec<OutgoingFile> = results
            .iter()
            .map(|(path, subdir)| OutgoingFile {
                path: path.clone(),
                descriptor: Descriptor::Result(ResultDescriptor {
                    magic: self.settings.network.magic_result.clone(),
                    file: path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    subdir: subdir.clone(),
                }),
            })
            .collect();

        let master = self.settings.network.transfer_addr(batch.master);
        let mut report = BatchReport::new(format!("batch {}", batch.batch_id), Outcome::Completed);
        report.processed = pool_report.completed;

        let failures = FailureReport {
            magic: self.settings.network.magic_result.clone(),
            failed: pool_report
                .failures
                .iter()
                .filter_map(|path| path.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
        };
        report.errors = pool_report.failures;

        match self.client.send_report(master, outgoing, Some(failures)).await {
            Ok(()) => {
                for (path, _) in &results {
                    if let Err(e) = std::fs::remove_file(path) {
                        tracing::warn!("Could not remove {}: {}", path.display(), e);
                    }
                }
            }
            Err(e) => {
                tracing::error!("Results could not be returned to {}: {}", batch.master, e);
                report.outcome = Outcome::Reset;
            }
        }

        for source in &staged {
            if let Err(e) = std::fs::remove_file(source) {
                tracing::debug!("Could not remove {}: {}", source.display(), e);
            }
        }

        if let Some(discovery) = discovery {
            discovery.set_busy(false);
        }
        self.state.advance(Phase::Listening)?;

        report.elapsed = started.elapsed();
        Ok(report)
    }
}

/// Every file below `root` with its parent directory relative to `root`,
/// `/`-joined. Top-level files have an empty sub-directory.
pub fn collect_results(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut results = Vec::new();
    if !root.is_dir() {
        return Ok(results);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }

            let subdir = path
                .parent()
                .and_then(|parent| parent.strip_prefix(root).ok())
                .map(|relative| {
                    relative
                        .components()
                        .map(|part| part.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/")
                })
                .unwrap_or_default();
            results.push((path, subdir));
        }
    }

    results.sort();
    Ok(results)
}
