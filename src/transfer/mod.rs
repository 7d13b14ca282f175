//! File & Task Transfer Module
//!
//! Moves source files from a master to worker nodes and exported files back,
//! over plain TCP on port 50001.
//!
//! ## Core Concepts
//! - **Two phases**: a JSON manifest (size map plus one descriptor per file) on one
//!   connection, then the raw bytes of all files on a second connection from the same peer.
//! - **Descriptors**: task descriptors (task magic) land in the staging area; result
//!   descriptors land in `export_path/<subdir>`.
//! - **Completion**: the tracker removes a node from the tasked set when its results
//!   arrive and signals the coordinator once the set is empty.
//! - **Retry**: a failed exchange is retried with backoff inside a bounded budget;
//!   exhausting it fails only that leg.
//!
//! ## Submodules
//! - **`types`**: wire structs and the manifest.
//! - **`protocol`**: manifest encoding and validation.
//! - **`sender`**: the retrying client.
//! - **`receiver`**: the listener that writes incoming files.
//! - **`tracker`**: tasked-node bookkeeping and the remote task buffer.

pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod tests;
