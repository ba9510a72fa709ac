pub mod archive;
pub mod docker_archive;
pub mod engine;
pub mod history;
pub mod layer;
pub mod manifest;
pub mod relay;
pub mod sniff;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::filetree::FileTree;
use archive::LayerKey;
use manifest::HistoryEntry;

/// One filesystem layer with its build-history attribution.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Position in build order, oldest first.
    pub index: usize,
    /// Key the tree was stored under (diff ID or archive entry name).
    pub key: LayerKey,
    pub history: HistoryEntry,
    pub tree: Arc<FileTree>,
}

impl Layer {
    /// Best identifier for display: the computed diff ID when available.
    pub fn id(&self) -> &str {
        self.tree.diff_id.as_deref().unwrap_or(self.key.as_str())
    }
}

/// Final output of resolution. `trees[i]` and `layers[i].tree` are the same
/// tree, in build order.
#[derive(Debug, Clone, Default)]
pub struct ResolvedImage {
    pub trees: Vec<Arc<FileTree>>,
    pub layers: Vec<Layer>,
    /// Tags recorded in a legacy archive manifest.
    pub repo_tags: Vec<String>,
    /// Media type declared by the OCI manifest, when there was one.
    pub media_type: Option<String>,
    /// Digest of the OCI manifest, when the image came through the relay.
    pub manifest_digest: Option<String>,
}

impl ResolvedImage {
    pub fn total_size(&self) -> u64 {
        self.trees.iter().map(|t| t.file_size).sum()
    }

    pub fn summary(&self) -> ImageSummary {
        ImageSummary {
            repo_tags: self.repo_tags.clone(),
            media_type: self.media_type.clone(),
            manifest_digest: self.manifest_digest.clone(),
            total_size: self.total_size(),
            layers: self
                .layers
                .iter()
                .map(|l| LayerSummary {
                    index: l.index,
                    id: l.id().to_string(),
                    history: l.history.clone(),
                    entries: l.tree.len(),
                })
                .collect(),
        }
    }
}

/// Serializable view of a [`ResolvedImage`] for `--json` output.
#[derive(Debug, Serialize)]
pub struct ImageSummary {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repo_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
    pub total_size: u64,
    pub layers: Vec<LayerSummary>,
}

#[derive(Debug, Serialize)]
pub struct LayerSummary {
    pub index: usize,
    pub id: String,
    pub history: HistoryEntry,
    pub entries: usize,
}

/// Common interface for turning an image identifier into parsed layers.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn fetch(&self, image: &str) -> Result<ResolvedImage>;
}
