//! Catalogue Query Module
//!
//! Reads the asset catalogue and turns a selection of object names into the
//! list of source files a batch has to export.
//!
//! ## Core Concepts
//! - **Catalogue**: `category -> asset path -> {objects, tags, revision, cost}`, owned by the
//!   authoring tool and read-only here. A broken catalogue behaves like an empty one.
//! - **Resolution**: requested objects map to a deduplicated asset list sorted by cost,
//!   most expensive first, so partitioning hands out heavy work early.
//! - **Revision Ledger**: `file_revisions.json` in the export root remembers the last exported
//!   revision of every asset and drives incremental ("changed only") runs.

pub mod ledger;
pub mod query;
pub mod types;
