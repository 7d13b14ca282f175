use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// File format the worker script exports to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Fbx,
    Gltf,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Fbx => "fbx",
            ExportFormat::Gltf => "gltf",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "fbx" => Ok(ExportFormat::Fbx),
            "gltf" => Ok(ExportFormat::Gltf),
            other => Err(format!("unknown export format: {other}")),
        }
    }
}

/// Per-batch settings forwarded to the worker script.
///
/// `None`/`false` means "leave the tool's own default alone"; the matching
/// flag is then omitted from the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExportOverrides {
    pub format: Option<ExportFormat>,
    pub subdivision: Option<u32>,
    pub palette: Option<String>,
    pub static_vertex_colors: bool,
    pub collider_offset: Option<f32>,
    pub debug: bool,
}

/// Everything one tool invocation needs. Built by the coordinator and handed
/// to the pool, which owns it until the process exits.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub source_file: PathBuf,
    pub tool_path: PathBuf,
    pub script_path: PathBuf,
    pub export_dir: PathBuf,
    pub library_dir: PathBuf,
    pub overrides: ExportOverrides,
    /// Thread count passed to the tool; "0" lets it use every core.
    pub threads: String,
}

pub const ALL_THREADS: &str = "0";

/// Result of a finished pool run.
#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    /// Source files that crashed the tool or produced an error line.
    pub failures: Vec<PathBuf>,
    pub completed: usize,
    /// Wall time per source file, in completion order.
    pub timings: Vec<(PathBuf, std::time::Duration)>,
}

impl PoolReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}
