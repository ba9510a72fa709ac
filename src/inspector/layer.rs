//! Turns one decompressed layer tar into a [`FileTree`].

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, IoContext, Result};
use crate::filetree::{FileInfo, FileTree};

/// Shared flag telling in-flight layer workers to stop early.
///
/// Checked between tar entries, so a worker stops after at most one more
/// entry once a sibling has failed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Computes the SHA-256 of everything read through it.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Lexical path normalisation: collapses `//`, drops `.` elements and
/// resolves `..` against preceding elements. Empty input becomes `.`.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            _ => parts.push(part),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Build the file tree for one layer.
///
/// `name` becomes the tree name. The whole stream is consumed (including
/// the padding after the end-of-archive marker) so the recorded diff ID
/// covers exactly the decompressed layer.
pub fn process_layer<R: Read>(name: &str, reader: R, cancel: &CancelToken) -> Result<FileTree> {
    let mut hashing = HashingReader::new(reader);
    let mut tree = FileTree::new(name);

    {
        let mut archive = tar::Archive::new(&mut hashing);
        let entries = archive
            .entries()
            .io_context(|| format!("failed to read tar entries of {name}"))?;

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let entry = entry.io_context(|| format!("failed to read tar entry of {name}"))?;

            let raw = entry
                .path()
                .io_context(|| format!("invalid entry path in {name}"))?;
            let path = clean_path(&raw.to_string_lossy());
            if path == "." || path == "/" {
                continue;
            }

            match entry.header().entry_type() {
                tar::EntryType::XGlobalHeader => {
                    return Err(Error::ExtendedHeader {
                        kind: "XGlobalHeader",
                        name: path,
                    });
                }
                tar::EntryType::XHeader => {
                    return Err(Error::ExtendedHeader {
                        kind: "XHeader",
                        name: path,
                    });
                }
                _ => {}
            }

            let info = FileInfo::from_entry(&entry, path.clone());
            tree.add_path(&path, info)?;
        }
    }

    io::copy(&mut hashing, &mut io::sink())
        .io_context(|| format!("failed to drain layer {name}"))?;
    tree.diff_id = Some(hashing.finish());

    debug!(
        layer = name,
        entries = tree.len(),
        size = tree.file_size,
        "parsed layer"
    );
    Ok(tree)
}
