//! Transfer Wire Protocol
//!
//! Phase 1 carries a JSON array: the size map `[[name, size], ...]` followed by
//! one descriptor object per file. Phase 2 carries the raw bytes of every file,
//! back to back, in size-map order.
//!
//! Both phases end with the sender half-closing its side and the receiver
//! answering with a single `ACK` byte once it has taken everything in. A
//! connection that is dropped without the byte was rejected.

use super::types::*;
use crate::error::{BatchError, BatchResult};

use serde_json::Value;
use std::path::{Component, Path, PathBuf};

/// Receiver's acknowledgement at the end of each phase.
pub const ACK: u8 = 0x06;

/// Upper bound on the phase-1 message.
pub const MAX_MANIFEST_BYTES: u64 = 16 * 1024 * 1024;

pub fn encode_manifest(manifest: &Manifest) -> BatchResult<Vec<u8>> {
    if manifest.files.len() != manifest.descriptors.len() {
        return Err(BatchError::protocol(format!(
            "{} files but {} descriptors",
            manifest.files.len(),
            manifest.descriptors.len()
        )));
    }

    if manifest.failures.is_some() && manifest.kind() == ManifestKind::Tasks {
        return Err(BatchError::protocol("failure report in a task manifest"));
    }

    let mut message = Vec::with_capacity(manifest.descriptors.len() + 2);
    message.push(serde_json::to_value(&manifest.files)?);
    for descriptor in &manifest.descriptors {
        let value = match descriptor {
            Descriptor::Task(task) => serde_json::to_value(task)?,
            Descriptor::Result(result) => serde_json::to_value(result)?,
        };
        message.push(value);
    }
    if let Some(report) = &manifest.failures {
        message.push(serde_json::to_value(report)?);
    }

    Ok(serde_json::to_vec(&message)?)
}

/// Parses and validates a phase-1 message.
///
/// Every descriptor must carry one of the two known magics, tasks and results
/// may not be mixed, there is exactly one descriptor per file, and file names
/// are bare names without any directory part. A results manifest may end with
/// one failure report, which does not count as a descriptor.
pub fn decode_manifest(bytes: &[u8], magic: &Magic) -> BatchResult<Manifest> {
    let mut message: Vec<Value> = serde_json::from_slice(bytes)?;
    if message.is_empty() {
        return Err(BatchError::protocol("empty manifest"));
    }

    let files: Vec<FileEntry> = serde_json::from_value(message.remove(0))?;
    for entry in &files {
        check_file_name(entry.name())?;
    }

    let mut descriptors = Vec::with_capacity(message.len());
    let mut failures: Option<FailureReport> = None;
    for value in message {
        let tag = value
            .get("magic")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_default();

        if failures.is_some() {
            return Err(BatchError::protocol("descriptor after failure report"));
        }

        let descriptor = if tag == magic.task {
            Descriptor::Task(serde_json::from_value(value)?)
        } else if tag == magic.result && value.get("failed").is_some() {
            failures = Some(serde_json::from_value(value)?);
            continue;
        } else if tag == magic.result {
            Descriptor::Result(serde_json::from_value(value)?)
        } else {
            return Err(BatchError::protocol(format!("unknown descriptor magic {tag:?}")));
        };
        descriptors.push(descriptor);
    }

    if descriptors.len() != files.len() {
        return Err(BatchError::protocol(format!(
            "{} files but {} descriptors",
            files.len(),
            descriptors.len()
        )));
    }

    let tasks = descriptors.iter().filter(|d| d.is_task()).count();
    if tasks != 0 && (tasks != descriptors.len() || failures.is_some()) {
        return Err(BatchError::protocol("manifest mixes tasks and results"));
    }

    for (entry, descriptor) in files.iter().zip(&descriptors) {
        match descriptor {
            Descriptor::Task(task) if task.batch_size == 0 => {
                return Err(BatchError::protocol(format!("task {} has batch size 0", task.asset)));
            }
            Descriptor::Result(result) if result.file != entry.name() => {
                return Err(BatchError::protocol(format!(
                    "result descriptor names {} for file {}",
                    result.file,
                    entry.name()
                )));
            }
            _ => {}
        }
    }

    Ok(Manifest {
        files,
        descriptors,
        failures,
    })
}

/// Rejects anything but a plain file name.
pub fn check_file_name(name: &str) -> BatchResult<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(()),
        _ => Err(BatchError::protocol(format!("illegal file name {name:?}"))),
    }
}

/// Keeps only the normal components of a declared sub-directory, so results
/// always land below the export root.
pub fn sanitize_subdir(subdir: &str) -> PathBuf {
    Path::new(subdir)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}
