//! Worker Invocation Adapter
//!
//! Builds the tool command line for one task, runs it to completion and
//! decides from the captured output whether the export failed.

use super::types::TaskDescriptor;

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Substring marking a failed export in the tool's output.
pub const ERROR_SENTINEL: &str = "Error";

/// Lines after the sentinel reported alongside it.
pub const ERROR_CONTEXT_LINES: usize = 10;

/// Full argument list (without the executable) for `task`.
///
/// Override flags appear only when set.
pub fn command_args(task: &TaskDescriptor) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--background".into(),
        "--factory-startup".into(),
        "--threads".into(),
        task.threads.clone().into(),
        "-noaudio".into(),
        task.source_file.clone().into(),
        "--python".into(),
        task.script_path.clone().into(),
    ];

    if task.overrides.debug {
        args.push("--debug".into());
    }

    args.push("--".into());
    args.push("-x".into());
    args.push(task.export_dir.clone().into());
    args.push("-l".into());
    args.push(task.library_dir.clone().into());

    let overrides = &task.overrides;
    if let Some(format) = overrides.format {
        args.push("-f".into());
        args.push(format.as_str().into());
    }
    if let Some(level) = overrides.subdivision {
        args.push("-sd".into());
        args.push(level.to_string().into());
    }
    if let Some(palette) = &overrides.palette {
        args.push("-sp".into());
        args.push(palette.into());
    }
    if overrides.static_vertex_colors {
        args.push("-st".into());
    }
    if let Some(offset) = overrides.collider_offset {
        args.push("-co".into());
        args.push(offset.to_string().into());
    }

    args
}

pub fn build_command(task: &TaskDescriptor) -> Command {
    let mut command = Command::new(&task.tool_path);
    command
        .args(command_args(task))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Returns the first error line and up to `ERROR_CONTEXT_LINES` lines after
/// it, or `None` when the output is clean.
pub fn find_error(output: &str) -> Option<Vec<&str>> {
    let mut lines = output.lines();
    let first = lines.by_ref().find(|line| line.contains(ERROR_SENTINEL))?;

    let mut report = vec![first];
    report.extend(lines.take(ERROR_CONTEXT_LINES));
    Some(report)
}

/// Runs one task. Returns the source file when the export failed.
pub async fn invoke(task: TaskDescriptor) -> Option<PathBuf> {
    let source = task.source_file.clone();
    tracing::debug!("Invoking {} on {}", task.tool_path.display(), source.display());

    let output = match build_command(&task).output().await {
        Ok(output) => output,
        Err(e) => {
            tracing::error!("Failed to start tool for {}: {}", source.display(), e);
            return Some(source);
        }
    };

    if !output.status.success() {
        tracing::error!(
            "Tool process crashed on {} (exit {})",
            source.display(),
            output.status.code().unwrap_or(-1)
        );
        return Some(source);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);

    if task.overrides.debug {
        for line in stdout.lines() {
            tracing::debug!(file = %source.display(), "{}", line);
        }
    }

    match find_error(&stdout) {
        Some(report) => {
            for line in report {
                tracing::error!(file = %source.display(), "{}", line);
            }
            Some(source)
        }
        None => None,
    }
}
