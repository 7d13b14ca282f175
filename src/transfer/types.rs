use crate::config::NetworkSettings;
use crate::worker::types::ExportOverrides;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// One source file a master hands to a worker node.
///
/// All tasks of one dispatch leg share `batch_id` and `batch_size`; the worker
/// starts once it holds `batch_size` tasks of the same batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RemoteTask {
    pub magic: String,
    pub master: IpAddr,
    /// File name of the staged source, without directories.
    pub asset: String,
    #[serde(default)]
    pub overrides: ExportOverrides,
    pub batch_size: usize,
    pub batch_id: Uuid,
}

/// An exported file a worker sends back, and the export sub-directory it
/// belongs in on the master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResultDescriptor {
    pub magic: String,
    pub file: String,
    #[serde(default)]
    pub subdir: String,
}

/// Source files a worker could not export, closing its results manifest.
/// Carries the result magic and is told apart from result descriptors by its
/// `failed` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FailureReport {
    pub magic: String,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Task(RemoteTask),
    Result(ResultDescriptor),
}

impl Descriptor {
    pub fn is_task(&self) -> bool {
        matches!(self, Descriptor::Task(_))
    }
}

/// `(file name, size in bytes)`, written as a two-element JSON array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry(pub String, pub u64);

impl FileEntry {
    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn size(&self) -> u64 {
        self.1
    }
}

/// Phase-1 message: the size map followed by one descriptor per file, in the
/// order the bytes will follow in phase 2.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub files: Vec<FileEntry>,
    pub descriptors: Vec<Descriptor>,
    /// Trailing failure report; only valid in a results manifest.
    pub failures: Option<FailureReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Tasks,
    /// Exported files going back to a master. An empty manifest is a results
    /// report from a node that produced nothing.
    Results,
}

impl Manifest {
    pub fn kind(&self) -> ManifestKind {
        match self.descriptors.first() {
            Some(Descriptor::Task(_)) => ManifestKind::Tasks,
            _ => ManifestKind::Results,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(FileEntry::size).sum()
    }
}

/// Discriminators telling task descriptors from result descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magic {
    pub task: String,
    pub result: String,
}

impl Magic {
    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self {
            task: settings.magic_task.clone(),
            result: settings.magic_result.clone(),
        }
    }
}

/// A file to send and the descriptor announcing it.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub path: PathBuf,
    pub descriptor: Descriptor,
}

/// A complete set of tasks from one master, ready for the local pool.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteBatch {
    pub master: IpAddr,
    pub batch_id: Uuid,
    pub tasks: Vec<RemoteTask>,
}
