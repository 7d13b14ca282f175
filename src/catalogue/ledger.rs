//! Revision Ledger
//!
//! Persisted `asset path -> revision` map recording what has already been
//! exported. Lives at `<export root>/file_revisions.json`.

use super::types::{Catalogue, Revision};

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const LEDGER_FILE: &str = "file_revisions.json";

#[derive(Debug, Clone)]
pub struct RevisionLedger {
    path: PathBuf,
    revisions: BTreeMap<String, Revision>,
}

impl RevisionLedger {
    /// Opens the ledger in `export_root`.
    ///
    /// When the file does not exist yet it is created from the catalogue's
    /// current revisions, so the first incremental run exports nothing that
    /// is already up to date. An unreadable ledger counts as empty.
    pub fn open(export_root: &Path, catalogue: &Catalogue) -> Result<Self> {
        let path = export_root.join(LEDGER_FILE);

        if !path.is_file() {
            tracing::warn!("{} not found, creating a new one", path.display());
            let ledger = Self {
                path,
                revisions: catalogue.all_revisions(),
            };
            ledger.save()?;
            return Ok(ledger);
        }

        let revisions = match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
        {
            Ok(revisions) => revisions,
            Err(e) => {
                tracing::error!("Ledger {} unreadable: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        Ok(Self { path, revisions })
    }

    /// In-memory ledger, never written to disk.
    pub fn detached(revisions: BTreeMap<String, Revision>) -> Self {
        Self {
            path: PathBuf::new(),
            revisions,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, asset: &str) -> Option<Revision> {
        self.revisions.get(asset).copied()
    }

    /// True when `asset` has never been exported or its recorded revision is
    /// strictly older than `current`.
    pub fn is_behind(&self, asset: &str, current: Revision) -> bool {
        match self.revisions.get(asset) {
            None => true,
            Some(recorded) => *recorded < current,
        }
    }

    /// Merges `updates` over the recorded revisions.
    pub fn merge(&mut self, updates: BTreeMap<String, Revision>) {
        self.revisions.extend(updates);
    }

    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }

        let encoded = serde_json::to_string_pretty(&self.revisions)?;
        std::fs::write(&self.path, encoded)
            .with_context(|| format!("writing {}", self.path.display()))?;

        tracing::debug!("Saved {} revisions to {}", self.revisions.len(), self.path.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}
