//! Runtime configuration.
//!
//! Settings are read from a JSON file (`batcher.json` by default, or the file
//! named by `BATCHER_CONFIG`) and then overridden from the command line. Every
//! field has a default so a partial or missing file still yields a usable
//! `Settings`; `validate` is what decides whether a run may start.
//!
//! Paths in the file may use `//` as a platform-neutral separator.

use crate::coordinator::state::Role;
use crate::error::{BatchError, BatchResult};
use crate::scheduler::strategy::Strategy;
use crate::worker::types::ExportOverrides;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "batcher.json";
pub const CONFIG_ENV_VAR: &str = "BATCHER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// External content tool executable.
    pub tool_path: PathBuf,
    pub catalogue_path: PathBuf,
    /// Export root; also holds the revision ledger.
    pub export_path: PathBuf,
    /// Resource library handed to the worker script with `-l`.
    pub library_path: PathBuf,
    /// Script the external tool runs for each source file.
    pub script_path: PathBuf,
    /// Incoming source files from a master node.
    pub staging_dir: PathBuf,
    /// Local exports waiting to be sent back to a master node.
    pub results_dir: PathBuf,
    pub overrides: ExportOverrides,
    /// Only export assets whose revision moved past the ledger.
    pub revision_export: bool,
    pub share_cpus: bool,
    /// Cores offered to other nodes; 0 means all local cores.
    pub shared_cores: usize,
    pub use_nodes: bool,
    pub strategy: Strategy,
    /// Seconds for the standard benchmark job, if measured.
    pub performance_index: Option<f64>,
    pub network: NetworkSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::new(),
            catalogue_path: PathBuf::new(),
            export_path: PathBuf::new(),
            library_path: PathBuf::new(),
            script_path: PathBuf::from("batch_export.py"),
            staging_dir: PathBuf::from("batch_submissions"),
            results_dir: PathBuf::from("batch_results"),
            overrides: ExportOverrides::default(),
            revision_export: false,
            share_cpus: false,
            shared_cores: 0,
            use_nodes: false,
            strategy: Strategy::CostProportional,
            performance_index: None,
            network: NetworkSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub group: Ipv4Addr,
    pub discovery_port: u16,
    pub transfer_port: u16,
    /// Address announced to other nodes. Detected when absent.
    pub address: Option<IpAddr>,
    pub magic: String,
    pub magic_task: String,
    pub magic_result: String,
    pub buffer_size: usize,
    pub announce_interval_secs: u64,
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub discovery_timeout_secs: u64,
    pub receive_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub transfer_budget_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 1, 1, 1),
            discovery_port: 50000,
            transfer_port: 50001,
            address: None,
            magic: "fna349fn".to_string(),
            magic_task: "snaf68yh".to_string(),
            magic_result: "ankdf89d".to_string(),
            buffer_size: 4096,
            announce_interval_secs: 3,
            stale_after_secs: 15,
            sweep_interval_secs: 1,
            discovery_timeout_secs: 10,
            receive_timeout_secs: 60,
            connect_timeout_secs: 20,
            transfer_budget_secs: 30,
        }
    }
}

impl NetworkSettings {
    pub fn local_address(&self) -> IpAddr {
        self.address.unwrap_or_else(detect_local_ip)
    }

    pub fn transfer_addr(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.transfer_port)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn transfer_budget(&self) -> Duration {
        Duration::from_secs(self.transfer_budget_secs)
    }
}

impl Settings {
    /// Loads settings from `path`. A missing or unreadable file is not fatal:
    /// the defaults are used and a warning is logged.
    pub fn load(path: &Path) -> Settings {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Config {} not loaded ({}), using defaults", path.display(), e);
                return Settings::default();
            }
        };

        match serde_json::from_str::<Settings>(&raw) {
            Ok(settings) => settings.normalized(),
            Err(e) => {
                tracing::warn!("Config {} is invalid ({}), using defaults", path.display(), e);
                Settings::default()
            }
        }
    }

    /// Resolves the config file: explicit flag, then `BATCHER_CONFIG`, then
    /// `batcher.json` in the working directory.
    pub fn locate(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    fn normalized(mut self) -> Self {
        for path in [
            &mut self.tool_path,
            &mut self.catalogue_path,
            &mut self.export_path,
            &mut self.library_path,
            &mut self.script_path,
            &mut self.staging_dir,
            &mut self.results_dir,
        ] {
            *path = native_path(&path.to_string_lossy());
        }
        self
    }

    /// Directory that catalogue asset paths are relative to.
    pub fn asset_root(&self) -> PathBuf {
        self.catalogue_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Worker count for remote batches.
    pub fn effective_shared_cores(&self) -> usize {
        let all = num_cpus::get();
        if self.shared_cores == 0 {
            all
        } else {
            self.shared_cores.min(all)
        }
    }

    /// Checks that the paths the given role depends on exist.
    pub fn validate(&self, role: Role) -> BatchResult<()> {
        let needs_tool = matches!(role, Role::Local | Role::Worker | Role::Benchmark);
        let needs_catalogue = !matches!(role, Role::Worker);

        if needs_tool && !self.tool_path.is_file() {
            return Err(BatchError::Configuration(format!(
                "tool executable not found: {}",
                self.tool_path.display()
            )));
        }

        if needs_catalogue && !self.catalogue_path.is_file() {
            return Err(BatchError::Configuration(format!(
                "catalogue not found: {}",
                self.catalogue_path.display()
            )));
        }

        if !self.export_path.is_dir() {
            return Err(BatchError::Configuration(format!(
                "export directory not found: {}",
                self.export_path.display()
            )));
        }

        if needs_tool && !self.library_path.is_dir() {
            tracing::warn!(
                "Library path {} is not a directory",
                self.library_path.display()
            );
        }

        Ok(())
    }
}

/// Translates a `//`-separated path into the local separator.
pub fn native_path(raw: &str) -> PathBuf {
    PathBuf::from(raw.replace("//", std::path::MAIN_SEPARATOR_STR))
}

/// Address of the interface used for outbound traffic. Connecting a UDP
/// socket sends nothing; it only selects a route.
pub fn detect_local_ip() -> IpAddr {
    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).and_then(|socket| {
        socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
        socket.local_addr()
    });

    match routed {
        Ok(addr) => addr.ip(),
        Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
