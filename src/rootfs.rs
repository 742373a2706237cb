//! Whiteout-aware bookkeeping for materializing layered filesystems.
//!
//! Layers record deletions with whiteout members: `.wh.<name>` deletes one
//! path, and a `.wh..wh..opq` member makes its directory opaque, hiding
//! entries contributed by layers below the one carrying the marker. The
//! [`BundleMap`] accumulates the per-path version history as layers stream
//! past and can then extract the merged view.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use futures::StreamExt;
use snafu::ResultExt;
use tokio_tar::{Archive, EntryType};

use crate::element::Blob;
use crate::{error, Result};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// What a whiteout member means, if the member is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Whiteout {
    /// Hide everything this directory gained from lower layers.
    Opaque { dir: String },
    /// Delete a single path.
    Single { path: String },
}

/// Classify a tar member path as a whiteout.
pub fn whiteout_of(member_path: &str) -> Option<Whiteout> {
    let (dirname, filename) = match member_path.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", member_path),
    };
    if filename == OPAQUE_MARKER {
        return Some(Whiteout::Opaque {
            dir: dirname.to_string(),
        });
    }
    if let Some(target) = filename.strip_prefix(WHITEOUT_PREFIX) {
        let path = if dirname.is_empty() {
            target.to_string()
        } else {
            format!("{dirname}/{target}")
        };
        return Some(Whiteout::Single { path });
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Directory,
    Deleted,
    Other,
}

#[derive(Debug, Clone)]
pub(crate) struct BundleEntry {
    /// Relative layer archive path (`<hex>/layer.tar`) that contributed this
    /// version.
    pub layer: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Per-path version history across the layers seen so far.
#[derive(Debug, Default)]
pub struct BundleMap {
    entries: BTreeMap<String, Vec<BundleEntry>>,
    layer_order: Vec<String>,
}

impl BundleMap {
    /// Fold one layer into the map. `layer` is the archive-relative path of
    /// the layer tar, used to attribute versions to layers.
    pub async fn record_layer(&mut self, layer: &str, blob: &Blob) -> Result<()> {
        self.layer_order.push(layer.to_string());
        let reader = blob.reader().await?;
        let mut archive = Archive::new(reader);
        let mut entries = archive.entries().context(error::ArchiveSnafu)?;
        while let Some(entry) = entries.next().await {
            let entry = entry.context(error::ArchiveSnafu)?;
            let header = entry.header();
            let path = entry
                .path()
                .context(error::ArchiveSnafu)?
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();

            match whiteout_of(path.as_str()) {
                Some(Whiteout::Opaque { dir }) => {
                    let prefix = format!("{dir}/");
                    let mut hidden = Vec::new();
                    for (existing, versions) in &self.entries {
                        if !existing.starts_with(prefix.as_str()) {
                            continue;
                        }
                        // Entries this same layer contributed stay visible.
                        if versions
                            .last()
                            .map(|version| version.layer != layer)
                            .unwrap_or(false)
                        {
                            hidden.push(existing.clone());
                        }
                    }
                    for existing in hidden {
                        self.push_entry(existing, layer, EntryKind::Deleted, 0);
                    }
                }
                Some(Whiteout::Single { path: target }) => {
                    let subtree_deleted = self
                        .entries
                        .get(target.as_str())
                        .and_then(|versions| versions.last())
                        .map(|version| version.kind == EntryKind::Directory)
                        .unwrap_or(false);
                    if subtree_deleted {
                        let prefix = format!("{target}/");
                        let hidden: Vec<String> = self
                            .entries
                            .keys()
                            .filter(|existing| existing.starts_with(prefix.as_str()))
                            .cloned()
                            .collect();
                        for existing in hidden {
                            self.push_entry(existing, layer, EntryKind::Deleted, 0);
                        }
                    }
                    self.push_entry(target, layer, EntryKind::Deleted, 0);
                }
                None => {
                    let kind = match header.entry_type() {
                        EntryType::Directory => EntryKind::Directory,
                        _ => EntryKind::Other,
                    };
                    let size = header.entry_size().unwrap_or(0);
                    self.push_entry(path, layer, kind, size);
                }
            }
        }
        Ok(())
    }

    fn push_entry(&mut self, path: String, layer: &str, kind: EntryKind, size: u64) {
        self.entries.entry(path).or_default().push(BundleEntry {
            layer: layer.to_string(),
            kind,
            size,
        });
    }

    /// The surviving version of every path, deletions excluded.
    fn survivors(&self) -> impl Iterator<Item = (&String, &BundleEntry)> {
        self.entries.iter().filter_map(|(path, versions)| {
            versions.last().and_then(|version| {
                (version.kind != EntryKind::Deleted).then_some((path, version))
            })
        })
    }

    /// Whether `path` survives the merge.
    pub fn is_present(&self, path: &str) -> bool {
        self.entries
            .get(path)
            .and_then(|versions| versions.last())
            .map(|version| version.kind != EntryKind::Deleted)
            .unwrap_or(false)
    }

    /// Log how much space shadowed and deleted versions waste.
    pub fn log_savings(&self) {
        let mut savings = 0u64;
        for (path, versions) in &self.entries {
            if versions.len() < 2 {
                continue;
            }
            let shadowed: u64 = versions[..versions.len() - 1]
                .iter()
                .map(|version| version.size)
                .sum();
            info!("bundle path \"{path}\" has {} versions", versions.len());
            if versions.last().map(|version| version.kind) == Some(EntryKind::Deleted) {
                info!(
                    "bundle path \"{path}\" final version is a deletion, \
                     which wasted {shadowed} bytes"
                );
            }
            savings += shadowed;
        }
        info!("flattening image would save {savings} bytes");
    }

    /// Extract the merged filesystem into `dest`. Layer archives are looked
    /// up under `layers_root` by their recorded relative paths. Directories
    /// are extracted after everything else so restrictive directory modes
    /// cannot block the files beneath them.
    pub async fn extract_merged(&self, layers_root: &Path, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest)
            .await
            .context(error::DirectorySnafu)?;

        let mut files_by_layer: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut dirs_by_layer: HashMap<&str, Vec<&str>> = HashMap::new();
        for (path, entry) in self.survivors() {
            let bucket = if entry.kind == EntryKind::Directory {
                &mut dirs_by_layer
            } else {
                &mut files_by_layer
            };
            bucket
                .entry(entry.layer.as_str())
                .or_default()
                .push(path.as_str());
        }

        for wanted in [&files_by_layer, &dirs_by_layer] {
            for layer in &self.layer_order {
                let Some(paths) = wanted.get(layer.as_str()) else {
                    continue;
                };
                let paths: std::collections::HashSet<&str> = paths.iter().copied().collect();
                let file = tokio::fs::File::open(layers_root.join(layer.as_str()))
                    .await
                    .context(error::FileSnafu)?;
                let mut archive = Archive::new(file);
                let mut entries = archive.entries().context(error::ArchiveSnafu)?;
                while let Some(entry) = entries.next().await {
                    let mut entry = entry.context(error::ArchiveSnafu)?;
                    let member = entry
                        .path()
                        .context(error::ArchiveSnafu)?
                        .to_string_lossy()
                        .trim_end_matches('/')
                        .to_string();
                    if paths.contains(member.as_str()) {
                        entry
                            .unpack_in(dest)
                            .await
                            .context(error::ArchiveSnafu)?;
                    }
                }
            }
        }
        Ok(())
    }
}
