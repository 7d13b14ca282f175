//! Catalogue Query Layer
//!
//! Answers the two questions the coordinator asks of the catalogue: which
//! source files cover a set of objects, and which revisions to record once
//! they have been exported.

use super::ledger::RevisionLedger;
use super::types::*;

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

pub struct CatalogueQuery {
    catalogue: Catalogue,
    ledger: RevisionLedger,
}

impl CatalogueQuery {
    pub fn new(catalogue: Catalogue, ledger: RevisionLedger) -> Self {
        Self { catalogue, ledger }
    }

    /// Loads the catalogue and the ledger kept in `export_root`.
    pub fn open(catalogue_path: &Path, export_root: &Path) -> Result<Self> {
        let catalogue = Catalogue::load(catalogue_path);
        let ledger = RevisionLedger::open(export_root, &catalogue)?;
        Ok(Self::new(catalogue, ledger))
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    pub fn ledger(&self) -> &RevisionLedger {
        &self.ledger
    }

    /// Resolves object names to the assets that contain them.
    ///
    /// Each asset appears once even when several requested objects live in
    /// it. With `incremental`, assets whose ledger revision is not strictly
    /// behind the catalogue are skipped. The result is sorted by cost,
    /// highest first.
    pub fn resolve(&self, objects: &BTreeSet<String>, incremental: bool) -> Resolution {
        let mut selected: HashMap<&str, u64> = HashMap::new();

        for (_, path, entry) in self.catalogue.entries() {
            if !entry.objects.iter().any(|object| objects.contains(object)) {
                continue;
            }

            if incremental && !self.ledger.is_behind(path, entry.revision) {
                continue;
            }

            selected.entry(path).or_insert(entry.cost);
        }

        if selected.is_empty() {
            if incremental {
                tracing::info!("No revision changes in selected assets");
            } else {
                tracing::info!("No matching assets in catalogue");
            }
            return Resolution::NoChanges;
        }

        if incremental {
            tracing::info!("Revision changed in {} assets", selected.len());
            for path in selected.keys() {
                tracing::debug!("  {}", path);
            }
        }

        let mut assets: Vec<ResolvedAsset> = selected
            .into_iter()
            .map(|(path, cost)| ResolvedAsset {
                path: path.to_string(),
                cost,
            })
            .collect();

        assets.sort_by(|a, b| b.cost.cmp(&a.cost).then_with(|| a.path.cmp(&b.path)));

        Resolution::Assets(assets)
    }

    /// Catalogue revisions of every asset containing one of `objects`.
    pub fn revisions_for(&self, objects: &BTreeSet<String>) -> BTreeMap<String, Revision> {
        self.catalogue
            .entries()
            .filter(|(_, _, entry)| entry.objects.iter().any(|object| objects.contains(object)))
            .map(|(_, path, entry)| (path.to_string(), entry.revision))
            .collect()
    }

    /// Records the exported revisions of `objects` and writes the ledger.
    pub fn record_batch(&mut self, objects: &BTreeSet<String>) -> Result<()> {
        let revisions = self.revisions_for(objects);
        self.record(revisions)
    }

    /// Records the current revisions of exactly the given asset paths. Used
    /// when only part of a selection was exported.
    pub fn record_assets(&mut self, assets: &BTreeSet<String>) -> Result<()> {
        let revisions: BTreeMap<String, Revision> = self
            .catalogue
            .entries()
            .filter(|(_, path, _)| assets.contains(*path))
            .map(|(_, path, entry)| (path.to_string(), entry.revision))
            .collect();
        self.record(revisions)
    }

    fn record(&mut self, revisions: BTreeMap<String, Revision>) -> Result<()> {
        tracing::debug!("Recording {} revisions", revisions.len());
        self.ledger.merge(revisions);
        self.ledger.save()
    }
}
