//! Hierarchical per-layer file tree.
//!
//! Each parsed layer becomes one [`FileTree`]. Paths are inserted with
//! [`FileTree::add_path`], which creates intermediate directories on demand
//! and keeps the aggregate [`FileTree::file_size`] up to date.

use std::collections::BTreeMap;
use std::io::Read;

use serde::Serialize;

use crate::error::{Error, Result};

/// Kind of a tar entry, reduced to what a layer viewer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Hardlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Other,
}

impl From<tar::EntryType> for EntryKind {
    fn from(t: tar::EntryType) -> Self {
        match t {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::File,
            tar::EntryType::Directory => EntryKind::Dir,
            tar::EntryType::Symlink => EntryKind::Symlink,
            tar::EntryType::Link => EntryKind::Hardlink,
            tar::EntryType::Char => EntryKind::CharDevice,
            tar::EntryType::Block => EntryKind::BlockDevice,
            tar::EntryType::Fifo => EntryKind::Fifo,
            _ => EntryKind::Other,
        }
    }
}

/// Metadata for one path in a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    /// Target of a symlink or hardlink.
    pub link_name: Option<String>,
}

impl FileInfo {
    /// Build metadata from a tar entry. `path` is the already-cleaned name.
    pub fn from_entry<R: Read>(entry: &tar::Entry<'_, R>, path: String) -> Self {
        let header = entry.header();
        let link_name = entry
            .link_name()
            .ok()
            .flatten()
            .map(|p| p.to_string_lossy().into_owned());

        Self {
            path,
            kind: header.entry_type().into(),
            size: entry.size(),
            mode: header.mode().unwrap_or(0),
            uid: header.uid().unwrap_or(0),
            gid: header.gid().unwrap_or(0),
            link_name,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// A node in the tree. Intermediate directories that never had their own
/// tar entry carry no [`FileInfo`].
#[derive(Debug, Default, Clone)]
pub struct FileNode {
    pub info: Option<FileInfo>,
    pub children: BTreeMap<String, FileNode>,
}

/// The file tree for a single layer.
#[derive(Debug, Default, Clone)]
pub struct FileTree {
    /// Name of the archive entry or blob the tree was built from.
    pub name: String,
    /// Sum of the sizes of every inserted entry.
    pub file_size: u64,
    /// `sha256:` digest of the decompressed layer stream, when known.
    pub diff_id: Option<String>,
    root: FileNode,
    entries: usize,
}

impl FileTree {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Insert `info` at `path`, creating any missing parent directories.
    pub fn add_path(&mut self, path: &str, info: FileInfo) -> Result<&FileNode> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
        if parts.is_empty() {
            return Err(Error::Tree {
                path: path.to_string(),
                reason: "path has no components".into(),
            });
        }
        if parts.contains(&"..") {
            return Err(Error::Tree {
                path: path.to_string(),
                reason: "path escapes the layer root".into(),
            });
        }

        self.file_size += info.size;
        self.entries += 1;

        let mut node = &mut self.root;
        for part in parts {
            node = node
                .children
                .entry(part.to_string())
                .or_default();
        }
        node.info = Some(info);
        Ok(&*node)
    }

    /// Look up a node by slash-separated path. An empty path is the root.
    pub fn get(&self, path: &str) -> Option<&FileNode> {
        let mut node = &self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.children.get(part)?;
        }
        Some(node)
    }

    /// Number of entries inserted into the tree.
    pub fn len(&self) -> usize {
        self.entries
    }
}
