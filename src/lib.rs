//! Distributed Asset Batch Exporter Library
//!
//! This library crate defines the modules behind the `asset-batcher` binary
//! (`main.rs`). It exports source assets through an external content tool,
//! either on the local machine or spread over the nodes of a LAN.
//!
//! ## Architecture Modules
//!
//! - **`catalogue`**: Reads the asset catalogue, resolves object selections to source files
//!   sorted by cost, and keeps the revision ledger for incremental runs.
//! - **`worker`**: Local multiprocessing engine. Launches one external tool process per
//!   source file with a bounded number alive at a time.
//! - **`discovery`**: Multicast announcements of every node's address, cores, benchmark
//!   index and busy state, plus the roster that expires silent nodes.
//! - **`transfer`**: Two-phase TCP protocol that pushes source files with task descriptors
//!   to nodes and result files back to the master.
//! - **`scheduler`**: Partitions the cost-sorted asset list over the roster.
//! - **`coordinator`**: Local, master, worker and benchmark flows built on the above.
//!
//! `config` and `error` hold the settings shared by all of them and the error taxonomy.

pub mod catalogue;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod scheduler;
pub mod transfer;
pub mod worker;
