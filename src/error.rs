//! Error taxonomy for batch runs.
//!
//! Service plumbing uses `anyhow::Result`; the variants here are the failures
//! callers need to tell apart (a bad configuration aborts the run, a worker
//! failure is aggregated, a transfer failure resets one dispatch leg).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    /// A required path is missing or invalid. Raised before any work starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The catalogue could not be read or parsed.
    #[error("catalogue {path} unusable: {reason}")]
    Catalogue { path: PathBuf, reason: String },

    /// The external tool crashed or reported an error for this source file.
    #[error("worker failed on {}", .0.display())]
    Worker(PathBuf),

    /// A transfer leg could not be completed within its retry budget.
    #[error("transfer to {peer} failed: {reason}")]
    Transfer { peer: String, reason: String },

    /// A peer sent a manifest or descriptor that does not match the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type BatchResult<T> = std::result::Result<T, BatchError>;

impl BatchError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub fn transfer(peer: impl ToString, reason: impl ToString) -> Self {
        Self::Transfer {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }
}
