use super::protocol::{ACK, encode_manifest};
use super::types::{FailureReport, FileEntry, Manifest, OutgoingFile};
use crate::config::NetworkSettings;
use crate::error::{BatchError, BatchResult};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const INITIAL_RETRY_DELAY_MS: u64 = 150;
const MAX_RETRY_DELAY_MS: u64 = 1200;

/// Pushes files plus their descriptors to a peer's transfer listener.
#[derive(Debug, Clone)]
pub struct TransferClient {
    connect_timeout: Duration,
    ack_timeout: Duration,
    budget: Duration,
    buffer_size: usize,
}

impl TransferClient {
    pub fn new(settings: &NetworkSettings) -> Self {
        Self {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            ack_timeout: Duration::from_secs(settings.receive_timeout_secs),
            budget: settings.transfer_budget(),
            buffer_size: settings.buffer_size.max(512),
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Sends `files` to `peer`, retrying the whole two-phase exchange until it
    /// is acknowledged or the retry budget is spent.
    ///
    /// An empty list still performs the exchange; masters read it as a node
    /// reporting that it has nothing to return.
    pub async fn send(&self, peer: SocketAddr, files: Vec<OutgoingFile>) -> BatchResult<()> {
        self.send_report(peer, files, None).await
    }

    /// Like [`send`](Self::send), closing the manifest with the report of
    /// files that failed to export.
    pub async fn send_report(
        &self,
        peer: SocketAddr,
        files: Vec<OutgoingFile>,
        failures: Option<FailureReport>,
    ) -> BatchResult<()> {
        let mut manifest = Manifest {
            failures,
            ..Manifest::default()
        };
        let mut paths = Vec::with_capacity(files.len());

        for outgoing in files {
            let size = tokio::fs::metadata(&outgoing.path).await?.len();
            let name = outgoing
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    BatchError::protocol(format!("{} has no file name", outgoing.path.display()))
                })?;

            manifest.files.push(FileEntry(name, size));
            manifest.descriptors.push(outgoing.descriptor);
            paths.push(outgoing.path);
        }

        let encoded = encode_manifest(&manifest)?;
        let deadline = Instant::now() + self.budget;
        let mut delay_ms = INITIAL_RETRY_DELAY_MS;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.exchange(peer, &encoded, &manifest.files, &paths).await {
                Ok(()) => {
                    tracing::info!(
                        "Sent {} files ({} bytes) to {} on attempt {}",
                        paths.len(),
                        manifest.total_bytes(),
                        peer,
                        attempt
                    );
                    return Ok(());
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        tracing::error!("Transfer to {} reset after {} attempts: {}", peer, attempt, e);
                        return Err(BatchError::transfer(peer, e));
                    }

                    tracing::warn!("Transfer attempt {} to {} failed: {}", attempt, peer, e);
                    let jitter = rand::random::<u64>() % 50;
                    let pause = Duration::from_millis(delay_ms + jitter)
                        .min(deadline.saturating_duration_since(Instant::now()));
                    tokio::time::sleep(pause).await;
                    delay_ms = (delay_ms * 2).min(MAX_RETRY_DELAY_MS);
                }
            }
        }
    }

    async fn exchange(
        &self,
        peer: SocketAddr,
        manifest: &[u8],
        files: &[FileEntry],
        paths: &[PathBuf],
    ) -> BatchResult<()> {
        let mut stream = self.connect(peer).await?;
        stream.write_all(manifest).await?;
        self.finish_phase(&mut stream, peer).await?;
        tracing::debug!("Manifest with {} entries accepted by {}", files.len(), peer);

        let mut stream = self.connect(peer).await?;
        for (entry, path) in files.iter().zip(paths) {
            let file = File::open(path).await?;
            let mut limited = BufReader::with_capacity(self.buffer_size, file).take(entry.size());

            let copied = tokio::io::copy(&mut limited, &mut stream).await?;
            if copied != entry.size() {
                return Err(BatchError::transfer(
                    peer,
                    format!("{} shrank to {} of {} bytes", path.display(), copied, entry.size()),
                ));
            }
            tracing::debug!("Streamed {} ({} bytes) to {}", entry.name(), copied, peer);
        }
        self.finish_phase(&mut stream, peer).await
    }

    async fn connect(&self, peer: SocketAddr) -> BatchResult<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(BatchError::transfer(peer, "connect timed out")),
        }
    }

    /// Half-closes the stream and waits for the receiver's acknowledgement.
    async fn finish_phase(&self, stream: &mut TcpStream, peer: SocketAddr) -> BatchResult<()> {
        stream.shutdown().await?;

        let mut reply = [0u8; 1];
        let read = match tokio::time::timeout(self.ack_timeout, stream.read(&mut reply)).await {
            Ok(read) => read?,
            Err(_) => return Err(BatchError::transfer(peer, "acknowledgement timed out")),
        };

        match read {
            1 if reply[0] == ACK => Ok(()),
            _ => Err(BatchError::transfer(peer, "not acknowledged")),
        }
    }
}
