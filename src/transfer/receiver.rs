use super::protocol::{ACK, MAX_MANIFEST_BYTES, decode_manifest, sanitize_subdir};
use super::tracker::DispatchTracker;
use super::types::{Descriptor, Magic, Manifest, ManifestKind, RemoteTask};
use crate::config::Settings;
use crate::error::{BatchError, BatchResult};

use anyhow::Result;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Connections from other peers tolerated while waiting for the phase-2
/// connection of the current sender.
pub const MAX_FOREIGN_ACCEPTS: usize = 8;

/// Accepts two-phase transfers and writes the files where they belong.
///
/// One exchange is handled at a time. Task files go to the staging directory
/// and feed the tracker's remote buffer; result files go below the export
/// root and count as that node's report.
pub struct TransferReceiver {
    listener: TcpListener,
    magic: Magic,
    staging_dir: PathBuf,
    export_dir: PathBuf,
    buffer_size: usize,
    receive_timeout: Duration,
    accept_tasks: bool,
    tracker: Arc<DispatchTracker>,
}

impl TransferReceiver {
    pub async fn bind(addr: SocketAddr, settings: &Settings, tracker: Arc<DispatchTracker>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Transfer listener on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            magic: Magic::from_settings(&settings.network),
            staging_dir: settings.staging_dir.clone(),
            export_dir: settings.export_path.clone(),
            buffer_size: settings.network.buffer_size.max(512),
            receive_timeout: Duration::from_secs(settings.network.receive_timeout_secs.max(1)),
            accept_tasks: settings.share_cpus,
            tracker,
        })
    }

    /// Whether task manifests are taken in. Nodes that do not share their CPUs
    /// refuse them.
    pub fn with_accept_tasks(mut self, accept_tasks: bool) -> Self {
        self.accept_tasks = accept_tasks;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    pub async fn run(self, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.staging_dir).await {
            tracing::warn!("Could not create {}: {}", self.staging_dir.display(), e);
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = tokio::time::timeout(self.receive_timeout, self.listener.accept()) => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
                // Idle.
                Err(_) => continue,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.handle_exchange(stream, peer) => {
                    if let Err(e) = result {
                        tracing::error!("Transfer from {} failed: {}", peer, e);
                    }
                }
            }
        }

        info!("Transfer listener stopped");
    }

    async fn handle_exchange(&self, mut stream: TcpStream, peer: SocketAddr) -> BatchResult<()> {
        info!("Got connection from {}", peer);

        let mut raw = Vec::new();
        let mut limited = (&mut stream).take(MAX_MANIFEST_BYTES);
        match tokio::time::timeout(self.receive_timeout, limited.read_to_end(&mut raw)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => return Err(BatchError::transfer(peer, "manifest timed out")),
        }

        let manifest = decode_manifest(&raw, &self.magic)?;
        let kind = manifest.kind();

        if kind == ManifestKind::Tasks && !self.accept_tasks {
            return Err(BatchError::protocol("not sharing CPUs, tasks refused"));
        }

        stream.write_all(&[ACK]).await?;
        drop(stream);

        let data = self.accept_same_peer(peer.ip()).await?;
        let written = self.receive_files(data, &manifest, peer).await?;
        info!("{} files received from {}", written.len(), peer);

        match kind {
            ManifestKind::Results => {
                if let Some(report) = manifest.failures {
                    self.tracker.record_failures(peer.ip(), report.failed).await;
                }
                if self.tracker.record_results(peer.ip()).await {
                    info!("All tasked nodes reported, batch complete");
                }
            }
            ManifestKind::Tasks => {
                let tasks: Vec<RemoteTask> = manifest
                    .descriptors
                    .into_iter()
                    .filter_map(|descriptor| match descriptor {
                        Descriptor::Task(task) => Some(task),
                        Descriptor::Result(_) => None,
                    })
                    .collect();
                let master = tasks.first().map(|task| task.master).unwrap_or(peer.ip());
                self.tracker.record_tasks(master, tasks).await;
            }
        }

        Ok(())
    }

    /// Waits for the phase-2 connection from `expected`, dropping up to
    /// `MAX_FOREIGN_ACCEPTS` connections from anyone else.
    async fn accept_same_peer(&self, expected: IpAddr) -> BatchResult<TcpStream> {
        for _ in 0..=MAX_FOREIGN_ACCEPTS {
            let (stream, peer) = match tokio::time::timeout(self.receive_timeout, self.listener.accept()).await {
                Ok(accepted) => accepted?,
                Err(_) => return Err(BatchError::transfer(expected, "data connection timed out")),
            };

            if peer.ip() == expected {
                return Ok(stream);
            }
            tracing::warn!("Dropped connection from {} while waiting for {}", peer, expected);
        }

        Err(BatchError::transfer(expected, "too many foreign connections"))
    }

    async fn receive_files(&self, stream: TcpStream, manifest: &Manifest, peer: SocketAddr) -> BatchResult<Vec<PathBuf>> {
        let mut reader = BufReader::with_capacity(self.buffer_size, stream);
        let mut written = Vec::with_capacity(manifest.files.len());

        for (entry, descriptor) in manifest.files.iter().zip(&manifest.descriptors) {
            let target_dir = match descriptor {
                Descriptor::Task(_) => self.staging_dir.clone(),
                Descriptor::Result(result) => self.export_dir.join(sanitize_subdir(&result.subdir)),
            };
            tokio::fs::create_dir_all(&target_dir).await?;
            let target = target_dir.join(entry.name());

            let copied = {
                let mut file = File::create(&target).await?;
                let mut limited = (&mut reader).take(entry.size());
                let read = tokio::io::copy(&mut limited, &mut file);
                let copied = match tokio::time::timeout(self.receive_timeout, read).await {
                    Ok(copied) => copied?,
                    Err(_) => 0,
                };
                file.flush().await?;
                copied
            };

            if copied != entry.size() {
                remove_partial(&target).await;
                return Err(BatchError::transfer(
                    peer,
                    format!("{} truncated at {} of {} bytes", entry.name(), copied, entry.size()),
                ));
            }

            tracing::debug!("Wrote {} ({} bytes)", target.display(), copied);
            written.push(target);
        }

        reader.get_mut().write_all(&[ACK]).await?;
        Ok(written)
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!("Could not remove partial {}: {}", path.display(), e);
    }
}
