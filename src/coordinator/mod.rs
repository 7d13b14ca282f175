//! Batch Coordinator Module
//!
//! Owns a run from selection to summary and ties the other subsystems
//! together: the catalogue decides what to export, the scheduler decides
//! where, the worker pool does the exporting and the transfer layer moves
//! sources out and results back.
//!
//! ## Core Concepts
//! - **Roles**: `Local` exports on this machine, `Master` dispatches to discovered nodes,
//!   `Worker` processes what a master pushes, `Benchmark` times a full catalogue export.
//! - **Phases**: every role walks an explicit phase machine; an illegal transition is an
//!   error rather than a silent state change.
//! - **Reports**: each run ends in a `BatchReport` with elapsed time and the source files
//!   that failed.
//!
//! ## Submodules
//! - **state**: roles, phases and the run report.
//! - **handler**: local, master and worker flows.
//! - **benchmark**: performance index measurement.

pub mod benchmark;
pub mod handler;
pub mod state;
