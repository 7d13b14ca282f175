//! Local Worker Module
//!
//! Runs the external content tool headless, once per source file, on a bounded
//! number of concurrent processes.
//!
//! ## Lifecycle
//! Every task gets a freshly spawned tool process which exits when the file is
//! done. The tool is assumed to leak memory and global state across jobs, so
//! processes are never reused.
//!
//! ## Submodules
//! - **`types`**: task descriptors and export overrides.
//! - **`invocation`**: command-line construction and output scanning for one task.
//! - **`pool`**: the bounded pool, progress reporting and failure aggregation.

pub mod invocation;
pub mod pool;
pub mod types;
