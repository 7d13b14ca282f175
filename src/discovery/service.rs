use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::roster::NodeRoster;
use super::types::{Announcement, NodeRecord, NodeStatus};
use crate::config::NetworkSettings;

const MULTICAST_TTL: u32 = 2;

pub struct DiscoveryService {
    pub local_node: NodeRecord,
    pub roster: Arc<NodeRoster>,
    settings: NetworkSettings,
    busy: AtomicBool,
    listen_addr: SocketAddr,
    announce_target: SocketAddr,
}

impl DiscoveryService {
    /// Service announcing `cores` shared cores from this host on the configured
    /// multicast group.
    pub fn new(settings: &NetworkSettings, cores: usize, performance_index: Option<f64>) -> Self {
        let local_node = NodeRecord {
            address: settings.local_address(),
            host: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            system: sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            cores,
            status: NodeStatus::Idle,
            performance_index,
            last_seen: None,
        };

        Self {
            local_node,
            roster: Arc::new(NodeRoster::new()),
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.discovery_port),
            announce_target: SocketAddr::new(IpAddr::V4(settings.group), settings.discovery_port),
            settings: settings.clone(),
            busy: AtomicBool::new(false),
        }
    }

    /// Overrides where the listener binds and where announcements go.
    pub fn with_endpoints(mut self, listen_addr: SocketAddr, announce_target: SocketAddr) -> Self {
        self.listen_addr = listen_addr;
        self.announce_target = announce_target;
        self
    }

    pub fn with_roster(mut self, roster: Arc<NodeRoster>) -> Self {
        self.roster = roster;
        self
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// The announcement as it would be sent right now.
    pub fn announcement(&self) -> Announcement {
        let mut node = self.local_node.clone();
        node.status = NodeStatus::from_busy(self.is_busy());
        Announcement::new(&self.settings.magic, &node)
    }

    /// Announces this node every interval until cancelled.
    pub fn start_broadcaster(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.broadcast_loop(cancel).await {
                tracing::error!("Broadcaster stopped: {}", e);
            }
        })
    }

    /// Binds the discovery socket and listens for announcements until
    /// cancelled. Bind errors are returned to the caller.
    pub async fn start_listener(self: Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let socket = self.bind_listener().await?;
        Ok(self.spawn_listener(socket, cancel))
    }

    /// Binds the listen address and joins the multicast group when the
    /// announce target is one.
    pub async fn bind_listener(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(self.listen_addr).await?;

        if let IpAddr::V4(group) = self.announce_target.ip()
            && group.is_multicast()
        {
            socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        }

        Ok(socket)
    }

    pub fn spawn_listener(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) -> JoinHandle<()> {
        if let Ok(addr) = socket.local_addr() {
            info!("Listening for nodes on {}", addr);
        }

        tokio::spawn(async move {
            self.listen_loop(socket, cancel).await;
        })
    }

    /// Removes silent nodes every sweep interval until cancelled.
    pub fn start_expiry(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.expiry_loop(cancel).await;
        })
    }

    async fn broadcast_loop(&self, cancel: CancellationToken) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        if let Err(e) = socket.set_multicast_ttl_v4(MULTICAST_TTL) {
            tracing::warn!("Could not set multicast TTL: {}", e);
        }

        let mut interval = tokio::time::interval(self.settings.announce_interval());
        info!(
            "Announcing {} cores from {} to {}",
            self.local_node.cores, self.local_node.address, self.announce_target
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let encoded = serde_json::to_vec(&self.announcement())?;
            match socket.send_to(&encoded, self.announce_target).await {
                Ok(_) => tracing::debug!("Announced to {}", self.announce_target),
                Err(e) => tracing::warn!("Failed to announce to {}: {}", self.announce_target, e),
            }
        }

        info!("Broadcaster stopped");
        Ok(())
    }

    async fn listen_loop(&self, socket: UdpSocket, cancel: CancellationToken) {
        let mut buf = vec![0u8; self.settings.buffer_size.max(512)];
        let timeout = Duration::from_secs(self.settings.discovery_timeout_secs.max(1));

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(timeout, socket.recv_from(&mut buf)) => received,
            };

            match received {
                Ok(Ok((len, src))) => {
                    if self.handle_datagram(&buf[..len], Instant::now()).is_none() {
                        tracing::debug!("Dropped datagram from {}", src);
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!("Discovery receive failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                // Quiet network.
                Err(_) => {}
            }
        }

        info!("Discovery listener stopped");
    }

    /// Parses and applies one announcement. Returns the announcing address, or
    /// `None` when the datagram was not a valid announcement.
    pub fn handle_datagram(&self, bytes: &[u8], now: Instant) -> Option<IpAddr> {
        let announcement: Announcement = serde_json::from_slice(bytes).ok()?;
        let record = announcement.into_record(&self.settings.magic, now)?;
        let address = record.address;
        let cores = record.cores;

        if self.roster.upsert(record) {
            info!(node = %address, "Discovered node with {} cores", cores);
            info!("Roster size now: {}", self.roster.len());
        }

        Some(address)
    }

    async fn expiry_loop(&self, cancel: CancellationToken) {
        let sweep = Duration::from_secs(self.settings.sweep_interval_secs.max(1));
        let mut interval = tokio::time::interval(sweep);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            for address in self.roster.expire(Instant::now(), self.settings.stale_after()) {
                tracing::warn!(node = %address, "Node went silent, removed from roster");
            }
        }
    }
}
