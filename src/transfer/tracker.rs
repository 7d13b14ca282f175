use super::types::{RemoteBatch, RemoteTask};

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc};
use uuid::Uuid;

#[derive(Debug, Default)]
struct DispatchState {
    /// Nodes that still owe results for the current dispatch.
    tasked: HashSet<IpAddr>,
    armed: bool,
    /// Source files each tasked node reported as failed.
    failures: HashMap<IpAddr, Vec<String>>,
    /// Tasks received as a worker, waiting for the rest of their batch.
    remote: Vec<RemoteTask>,
    remote_batch: Option<Uuid>,
}

/// Shared bookkeeping between the transfer receiver and the coordinator.
///
/// As a master it tracks which tasked nodes have reported back and signals
/// completion exactly once per dispatch. As a worker it buffers incoming
/// tasks and emits a `RemoteBatch` once a batch is complete.
pub struct DispatchTracker {
    state: Mutex<DispatchState>,
    done: Notify,
    batches: mpsc::UnboundedSender<RemoteBatch>,
}

impl DispatchTracker {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteBatch>) {
        let (batches, receiver) = mpsc::unbounded_channel();
        let tracker = Arc::new(Self {
            state: Mutex::new(DispatchState::default()),
            done: Notify::new(),
            batches,
        });
        (tracker, receiver)
    }

    /// Starts waiting for results from `nodes`. Arming with no nodes leaves the
    /// tracker idle.
    pub async fn arm(&self, nodes: impl IntoIterator<Item = IpAddr>) {
        let mut state = self.state.lock().await;
        state.tasked = nodes.into_iter().collect();
        state.armed = !state.tasked.is_empty();
        state.failures.clear();
        tracing::debug!("Awaiting results from {} nodes", state.tasked.len());
    }

    /// Records that `from` delivered its results. Returns `true` for the
    /// report that completes the dispatch, and only for that one.
    pub async fn record_results(&self, from: IpAddr) -> bool {
        self.settle(from, "reported").await
    }

    /// Keeps the failed source files `from` reported alongside its results.
    /// Reports from nodes outside the armed dispatch are dropped.
    pub async fn record_failures(&self, from: IpAddr, failed: Vec<String>) {
        let mut state = self.state.lock().await;
        if !state.armed || !state.tasked.contains(&from) {
            tracing::debug!(node = %from, "Ignoring failure report outside the dispatch");
            return;
        }
        if !failed.is_empty() {
            tracing::warn!(node = %from, "{} files failed remotely", failed.len());
        }
        state.failures.entry(from).or_default().extend(failed);
    }

    /// Hands over the failure reports gathered for the last dispatch.
    pub async fn take_failures(&self) -> HashMap<IpAddr, Vec<String>> {
        std::mem::take(&mut self.state.lock().await.failures)
    }

    /// Gives up on a node whose leg could not be delivered.
    pub async fn abandon(&self, node: IpAddr) -> bool {
        self.settle(node, "abandoned").await
    }

    async fn settle(&self, node: IpAddr, how: &str) -> bool {
        let mut state = self.state.lock().await;
        if !state.armed || !state.tasked.remove(&node) {
            tracing::debug!(node = %node, "Ignoring {} node outside the dispatch", how);
            return false;
        }

        tracing::info!(node = %node, "Node {}, {} still pending", how, state.tasked.len());
        if state.tasked.is_empty() {
            state.armed = false;
            self.done.notify_one();
            return true;
        }
        false
    }

    /// Drops the current dispatch without completing it.
    pub async fn disarm(&self) {
        let mut state = self.state.lock().await;
        state.tasked.clear();
        state.armed = false;
    }

    pub async fn is_complete(&self) -> bool {
        !self.state.lock().await.armed
    }

    pub async fn pending(&self) -> Vec<IpAddr> {
        let state = self.state.lock().await;
        let mut nodes: Vec<IpAddr> = state.tasked.iter().copied().collect();
        nodes.sort();
        nodes
    }

    /// Wakes once the armed dispatch completes.
    pub async fn completed(&self) {
        self.done.notified().await;
    }

    /// Buffers tasks received from `master`. When the buffer holds the full
    /// batch it is handed off on the batch channel.
    pub async fn record_tasks(&self, master: IpAddr, tasks: Vec<RemoteTask>) {
        let mut state = self.state.lock().await;

        for task in tasks {
            if state.remote_batch != Some(task.batch_id) {
                if !state.remote.is_empty() {
                    tracing::warn!(
                        "Discarding {} tasks of an unfinished batch",
                        state.remote.len()
                    );
                }
                state.remote.clear();
                state.remote_batch = Some(task.batch_id);
            }

            let batch_size = task.batch_size;
            state.remote.push(task);

            if state.remote.len() >= batch_size {
                let tasks = std::mem::take(&mut state.remote);
                let batch = RemoteBatch {
                    master,
                    batch_id: tasks[0].batch_id,
                    tasks,
                };
                state.remote_batch = None;

                tracing::info!("Received complete batch of {} tasks from {}", batch.tasks.len(), master);
                if self.batches.send(batch).is_err() {
                    tracing::warn!("No worker is processing remote batches");
                }
            }
        }
    }

    pub async fn buffered_tasks(&self) -> usize {
        self.state.lock().await.remote.len()
    }
}
