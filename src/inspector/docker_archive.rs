use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::archive::ImageArchive;
use super::sniff::{self, SNIFF_LEN};
use super::{ResolvedImage, Resolver};
use crate::error::{Error, IoContext, Result};

/// Whether `image` names an archive file rather than an engine reference.
pub fn looks_like_archive(image: &str) -> bool {
    let lower = image.to_ascii_lowercase();
    [".tar", ".tar.gz", ".tgz", ".tar.zst"]
        .iter()
        .any(|ext| lower.ends_with(ext))
        && Path::new(image).is_file()
}

/// Reads an image from a `save`-style tar on disk (optionally gzip or zstd
/// compressed as a whole). The engine is never consulted.
pub struct ArchiveResolver {
    path: PathBuf,
}

impl ArchiveResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(path: &Path) -> Result<ResolvedImage> {
        let file = File::open(path)
            .io_context(|| format!("failed to open archive {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let prefix = sniff::read_prefix(&mut reader, SNIFF_LEN)
            .io_context(|| format!("failed to read archive {}", path.display()))?;

        let format = sniff::sniff(&prefix);
        debug!(path = %path.display(), ?format, "sniffed archive");
        let compression = format.layer_compression().ok_or_else(|| {
            Error::io(
                format!("failed to read archive {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidData, "not a tar archive"),
            )
        })?;

        let stream = compression
            .decoder(sniff::replay(prefix, reader))
            .io_context(|| format!("failed to decompress archive {}", path.display()))?;
        ImageArchive::from_tar(stream)?.into_image()
    }
}

#[async_trait]
impl Resolver for ArchiveResolver {
    async fn fetch(&self, _image: &str) -> Result<ResolvedImage> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::read(&path))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }
}
