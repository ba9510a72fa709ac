//! Correlates parsed layer trees with image config history.

use std::sync::Arc;

use super::archive::{ImageArchive, LayerKey};
use super::manifest::{HistoryEntry, ImageManifest};
use super::{Layer, ResolvedImage};
use crate::error::Result;
use crate::filetree::FileTree;

/// Pair each tree with the next history entry that produced filesystem
/// content.
///
/// Config history and trees are both oldest-first, so they are walked in
/// the same direction; `empty_layer` entries (ENV, LABEL, ...) are skipped.
/// History is optional metadata: once it runs out, remaining layers get a
/// `(missing)` placeholder. Each attributed entry's `size` is set to the
/// tree's aggregate size.
pub fn correlate(history: &[HistoryEntry], trees: Vec<(LayerKey, Arc<FileTree>)>) -> Vec<Layer> {
    let mut remaining = history.iter().filter(|h| !h.empty_layer);

    trees
        .into_iter()
        .enumerate()
        .map(|(index, (key, tree))| {
            let mut entry = remaining.next().cloned().unwrap_or_else(HistoryEntry::missing);
            entry.size = tree.file_size;
            Layer {
                index,
                key,
                history: entry,
                tree,
            }
        })
        .collect()
}

impl ImageArchive {
    /// Convert the parsed archive into the ordered layer list.
    pub fn into_image(self) -> Result<ResolvedImage> {
        let ordered = self.ordered_trees()?;
        let trees = ordered.iter().map(|(_, t)| Arc::clone(t)).collect();
        let layers = correlate(&self.config.history, ordered);

        let (repo_tags, media_type) = match self.manifest {
            ImageManifest::Legacy(m) => (m.repo_tags, None),
            ImageManifest::Oci(m) => (Vec::new(), Some(m.media_type).filter(|t| !t.is_empty())),
        };

        Ok(ResolvedImage {
            trees,
            layers,
            repo_tags,
            media_type,
            manifest_digest: self.manifest_digest,
        })
    }
}
