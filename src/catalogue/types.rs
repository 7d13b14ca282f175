use crate::config::native_path;
use crate::error::{BatchError, BatchResult};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Per-asset version counter.
///
/// Stored as a decimal string on disk (`"revision": "3"`), but plain integers
/// are accepted as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub u64);

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        int_string::deserialize(deserializer).map(Revision)
    }
}

/// Serde helpers for integers written as strings.
pub mod int_string {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(u64),
        Str(String),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match IntOrString::deserialize(deserializer)? {
            IntOrString::Int(value) => Ok(value),
            IntOrString::Str(raw) => raw
                .trim()
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("not an integer: {raw:?}"))),
        }
    }
}

/// One asset file as recorded by the authoring tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssetEntry {
    #[serde(default)]
    pub objects: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub revision: Revision,
    /// Processing weight, e.g. triangle count.
    #[serde(default, with = "int_string")]
    pub cost: u64,
}

/// The asset index: `category -> asset path -> entry`.
///
/// Asset paths are kept in their platform-neutral `//` form, which is also the
/// key used by the revision ledger; `source_path` maps them onto the file system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalogue {
    pub categories: BTreeMap<String, BTreeMap<String, AssetEntry>>,
}

impl Catalogue {
    /// Reads the catalogue at `path`. Missing or malformed files yield an
    /// empty catalogue and a warning; an empty catalogue is a normal outcome.
    pub fn load(path: &Path) -> Catalogue {
        match Self::try_load(path) {
            Ok(catalogue) => catalogue,
            Err(e) => {
                tracing::warn!("{}", e);
                Catalogue::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> BatchResult<Catalogue> {
        let unusable = |reason: String| BatchError::Catalogue {
            path: path.to_path_buf(),
            reason,
        };

        let raw = std::fs::read_to_string(path).map_err(|e| unusable(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| unusable(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.categories.values().all(BTreeMap::is_empty)
    }

    /// Iterates `(category, asset path, entry)` over every category.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &AssetEntry)> {
        self.categories.iter().flat_map(|(category, assets)| {
            assets
                .iter()
                .map(move |(path, entry)| (category.as_str(), path.as_str(), entry))
        })
    }

    /// Expands selection criteria into the set of object names they cover.
    pub fn objects_for(&self, selection: &[Selection]) -> BTreeSet<String> {
        let mut objects = BTreeSet::new();

        for criterion in selection {
            for (category, path, entry) in self.entries() {
                let matched = match criterion {
                    Selection::All => true,
                    Selection::Category(name) => category == name,
                    Selection::Tag(tag) => entry.tags.contains(tag),
                    Selection::Filename(fragment) => path.contains(fragment.as_str()),
                    Selection::Objects(names) => {
                        objects.extend(
                            entry
                                .objects
                                .iter()
                                .filter(|object| names.contains(object))
                                .cloned(),
                        );
                        false
                    }
                };

                if matched {
                    objects.extend(entry.objects.iter().cloned());
                }
            }
        }

        objects
    }

    /// Current revision of every asset in the catalogue.
    pub fn all_revisions(&self) -> BTreeMap<String, Revision> {
        self.entries()
            .map(|(_, path, entry)| (path.to_string(), entry.revision))
            .collect()
    }

    /// File-system location of `asset` below `asset_root`.
    pub fn source_path(asset_root: &Path, asset: &str) -> PathBuf {
        asset_root.join(native_path(asset))
    }
}

/// Criteria for choosing which objects to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every object in the catalogue.
    All,
    Category(String),
    Tag(String),
    /// Assets whose path contains the fragment.
    Filename(String),
    Objects(Vec<String>),
}

/// An asset chosen for export, with its scheduling weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedAsset {
    pub path: String,
    pub cost: u64,
}

/// Outcome of resolving a set of object names.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Assets to export, most expensive first.
    Assets(Vec<ResolvedAsset>),
    /// Nothing matched, or nothing changed since the last export.
    NoChanges,
}

impl Resolution {
    pub fn assets(&self) -> &[ResolvedAsset] {
        match self {
            Resolution::Assets(assets) => assets,
            Resolution::NoChanges => &[],
        }
    }

    pub fn into_assets(self) -> Vec<ResolvedAsset> {
        match self {
            Resolution::Assets(assets) => assets,
            Resolution::NoChanges => Vec::new(),
        }
    }

    pub fn is_no_changes(&self) -> bool {
        matches!(self, Resolution::NoChanges)
    }
}
