//! Archive format detection and reading.
//!
//! Two shapes are accepted:
//!
//! - a single tar stream as produced by `docker save` (legacy
//!   `manifest.json` + per-layer tars, or the OCI-flavoured variant with
//!   `blobs/sha256/*` entries written by newer engines), and
//! - a directory of content-addressed blobs plus an OCI manifest, as left
//!   behind by the registry relay.
//!
//! Either way the result is an [`ImageArchive`]: manifest, config, and one
//! [`FileTree`] per layer keyed by a [`LayerKey`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::layer::{self, CancelToken};
use super::manifest::{
    Descriptor, ImageConfig, ImageManifest, LegacyManifest, OciIndex, OciManifest,
};
use super::sniff::{self, Compression, Format};
use crate::error::{Error, IoContext, Result};
use crate::filetree::FileTree;

/// Identity of a parsed layer.
///
/// OCI blob stores identify layers by diff ID; legacy archives by the tar
/// entry name the manifest lists. The two never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LayerKey {
    ByDigest(String),
    ByName(String),
}

impl LayerKey {
    pub fn as_str(&self) -> &str {
        match self {
            LayerKey::ByDigest(s) | LayerKey::ByName(s) => s,
        }
    }
}

impl std::fmt::Display for LayerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed image: metadata plus one tree per layer.
#[derive(Debug)]
pub struct ImageArchive {
    pub manifest: ImageManifest,
    pub config: ImageConfig,
    /// `sha256:` digest of the raw manifest bytes, when a raw OCI manifest
    /// was supplied.
    pub manifest_digest: Option<String>,
    layers: HashMap<LayerKey, Arc<FileTree>>,
    /// Keys in build order, oldest first.
    order: Vec<LayerKey>,
    /// Symlinked entries of a legacy archive, name -> target name.
    aliases: HashMap<String, String>,
}

/// What a `blobs/` entry turned out to be.
#[derive(Debug)]
pub(crate) enum Blob {
    Layer(FileTree),
    Json(Vec<u8>),
    Ignored,
}

const MAX_ALIAS_HOPS: usize = 8;
const MAX_INDEX_DEPTH: usize = 4;

impl ImageArchive {
    /// Read an image from a single, non-seekable tar stream.
    pub fn from_tar<R: Read>(reader: R) -> Result<Self> {
        let cancel = CancelToken::new();
        let mut archive = tar::Archive::new(reader);

        let mut layers: HashMap<LayerKey, Arc<FileTree>> = HashMap::new();
        let mut json_files: HashMap<String, Vec<u8>> = HashMap::new();
        let mut aliases: HashMap<String, String> = HashMap::new();

        let entries = archive
            .entries()
            .io_context(|| "failed to read image archive")?;
        for entry in entries {
            let mut entry = entry.io_context(|| "failed to read image archive entry")?;
            let name = entry
                .path()
                .io_context(|| "invalid entry path in image archive")?
                .to_string_lossy()
                .into_owned();

            let entry_type = entry.header().entry_type();
            if entry_type.is_symlink() {
                // Some layer tars are relative symlinks to other layer tars.
                if let Some(target) = entry.link_name().ok().flatten() {
                    let target = resolve_link(&name, &target.to_string_lossy());
                    debug!(entry = %name, %target, "archive entry is a symlink");
                    aliases.insert(name, target);
                }
                continue;
            }
            if !entry_type.is_file() {
                continue;
            }

            if let Some(compression) = Compression::from_entry_name(&name) {
                let tree = compression
                    .decoder(&mut entry)
                    .io_context(|| format!("failed to open layer {name}"))
                    .and_then(|r| layer::process_layer(&name, r, &cancel))
                    .map_err(|e| Error::layer(&name, e))?;
                layers.insert(LayerKey::ByName(name), Arc::new(tree));
            } else if name.ends_with(".json") || name.starts_with("sha256:") {
                let mut data = Vec::new();
                entry
                    .read_to_end(&mut data)
                    .io_context(|| format!("failed to read {name}"))?;
                json_files.insert(name, data);
            } else if name.starts_with("blobs/") {
                match classify_blob(&name, &mut entry, &cancel)? {
                    Blob::Layer(tree) => {
                        layers.insert(LayerKey::ByName(name), Arc::new(tree));
                    }
                    Blob::Json(data) => {
                        json_files.insert(name, data);
                    }
                    Blob::Ignored => {}
                }
            }
        }

        let lookup = |name: &str| json_files.get(follow_aliases(&aliases, name).as_str());

        let (manifest, config_name, order) = match json_files.get("manifest.json") {
            Some(data) => {
                let manifest = LegacyManifest::parse_first(data)?;
                let order: Vec<LayerKey> = manifest
                    .layer_paths
                    .iter()
                    .map(|p| LayerKey::ByName(p.clone()))
                    .collect();
                let config_name = manifest.config_path.clone();
                (ImageManifest::Legacy(manifest), config_name, order)
            }
            None => {
                // OCI-layout tar without the Docker compatibility manifest.
                let index = json_files.get("index.json").ok_or(Error::NoManifest)?;
                let manifest = manifest_from_index(index, |d| lookup(&blob_entry_name(d)))?;
                let order: Vec<LayerKey> = manifest
                    .layers
                    .iter()
                    .map(|d| LayerKey::ByName(blob_entry_name(&d.digest)))
                    .collect();
                let config_name = blob_entry_name(&manifest.config.digest);
                (ImageManifest::Oci(manifest), config_name, order)
            }
        };

        let config_data = lookup(&config_name).ok_or_else(|| Error::NoConfig(config_name.clone()))?;
        let config = ImageConfig::parse(config_data)?;

        if config.rootfs.diff_ids.len() != order.len() {
            warn!(
                layers = order.len(),
                diff_ids = config.rootfs.diff_ids.len(),
                "manifest and config disagree on layer count"
            );
        }
        info!(layers = layers.len(), "read image archive");

        Ok(Self {
            manifest,
            config,
            manifest_digest: None,
            layers,
            order,
            aliases,
        })
    }

    /// Read an image from an on-disk blob store (`<dir>/<hex-digest>`).
    ///
    /// Layers are decompressed concurrently, at most `max_parallel` at a
    /// time. The first failure cancels the remaining work; every worker is
    /// joined before this returns.
    pub async fn from_oci_dir(
        dir: &Path,
        manifest: OciManifest,
        raw_manifest: &[u8],
        max_parallel: usize,
    ) -> Result<Self> {
        let config_path = dir.join(manifest.config.encoded()?);
        let config_data = tokio::fs::read(&config_path)
            .await
            .io_context(|| format!("failed to read config blob {}", manifest.config.digest))?;
        let config = ImageConfig::parse(&config_data)?;

        let diff_ids = &config.rootfs.diff_ids;
        if diff_ids.len() != manifest.layers.len() {
            return Err(Error::LayerCountMismatch {
                layers: manifest.layers.len(),
                diff_ids: diff_ids.len(),
            });
        }

        let layers = read_blob_layers(dir, &manifest.layers, diff_ids, max_parallel).await?;
        let order: Vec<LayerKey> = diff_ids.iter().cloned().map(LayerKey::ByDigest).collect();
        let manifest_digest = format!("sha256:{}", hex::encode(Sha256::digest(raw_manifest)));

        Ok(Self {
            manifest: ImageManifest::Oci(manifest),
            config,
            manifest_digest: Some(manifest_digest),
            layers,
            order,
            aliases: HashMap::new(),
        })
    }

    /// Look up a parsed layer, following legacy symlink aliases.
    pub fn layer(&self, key: &LayerKey) -> Option<&Arc<FileTree>> {
        match key {
            LayerKey::ByDigest(_) => self.layers.get(key),
            LayerKey::ByName(name) => self
                .layers
                .get(&LayerKey::ByName(follow_aliases(&self.aliases, name))),
        }
    }

    /// Trees in build order. Every key must resolve.
    pub fn ordered_trees(&self) -> Result<Vec<(LayerKey, Arc<FileTree>)>> {
        self.order
            .iter()
            .map(|key| {
                self.layer(key)
                    .map(|tree| (key.clone(), Arc::clone(tree)))
                    .ok_or_else(|| Error::MissingLayer(key.to_string()))
            })
            .collect()
    }
}

/// Classify a `blobs/` entry by sniffing its first bytes.
///
/// Archive-looking content that fails to parse, and content that is
/// neither archive nor JSON, is ignored rather than failing the parse.
pub(crate) fn classify_blob<R: Read>(
    name: &str,
    reader: &mut R,
    cancel: &CancelToken,
) -> Result<Blob> {
    let prefix = sniff::read_prefix(reader, sniff::SNIFF_LEN)
        .io_context(|| format!("failed to read blob {name}"))?;
    let format = sniff::sniff(&prefix);

    if let Some(compression) = format.layer_compression() {
        let stream = sniff::replay(prefix, reader);
        let parsed = compression
            .decoder(stream)
            .io_context(|| format!("failed to open blob {name}"))
            .and_then(|r| layer::process_layer(name, r, cancel));
        return Ok(match parsed {
            Ok(tree) => Blob::Layer(tree),
            Err(e) => {
                debug!(blob = name, ?format, error = %e, "blob is not a layer, ignoring");
                Blob::Ignored
            }
        });
    }

    if format == Format::Json {
        let mut data = prefix;
        reader
            .read_to_end(&mut data)
            .io_context(|| format!("failed to read blob {name}"))?;
        return Ok(Blob::Json(data));
    }

    debug!(blob = name, "unrecognised blob, ignoring");
    Ok(Blob::Ignored)
}

/// Walk `index.json` (and any nested indexes) down to the first image
/// manifest. `blob` fetches a buffered blob by digest.
fn manifest_from_index<'a>(
    index: &[u8],
    blob: impl Fn(&str) -> Option<&'a Vec<u8>>,
) -> Result<OciManifest> {
    let mut index = OciIndex::parse(index)?;
    for _ in 0..MAX_INDEX_DEPTH {
        let first = index.manifests.first().ok_or(Error::EmptyManifest)?;
        let data = blob(&first.digest).ok_or(Error::NoManifest)?;
        if OciIndex::is_index_media_type(&first.media_type) {
            index = OciIndex::parse(data)?;
            continue;
        }
        return OciManifest::parse(data);
    }
    Err(Error::NoManifest)
}

/// Entry name of a blob inside an OCI-layout tar.
fn blob_entry_name(digest: &str) -> String {
    format!("blobs/{}", digest.replacen(':', "/", 1))
}

/// Resolve a symlink target relative to the directory holding `name`.
fn resolve_link(name: &str, target: &str) -> String {
    let joined = match (target.starts_with('/'), name.rsplit_once('/')) {
        (true, _) | (false, None) => target.to_string(),
        (false, Some((parent, _))) => format!("{parent}/{target}"),
    };
    layer::clean_path(&joined).trim_start_matches('/').to_string()
}

fn follow_aliases(aliases: &HashMap<String, String>, name: &str) -> String {
    let mut current = name;
    for _ in 0..MAX_ALIAS_HOPS {
        match aliases.get(current) {
            Some(next) => current = next,
            None => break,
        }
    }
    current.to_string()
}

/// Decompress and parse every declared layer blob concurrently.
async fn read_blob_layers(
    dir: &Path,
    descriptors: &[Descriptor],
    diff_ids: &[String],
    max_parallel: usize,
) -> Result<HashMap<LayerKey, Arc<FileTree>>> {
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let cancel = CancelToken::new();
    let paths = descriptors
        .iter()
        .map(|desc| desc.encoded().map(|hex| dir.join(hex)))
        .collect::<Result<Vec<_>>>()?;
    let mut tasks = JoinSet::new();

    for ((desc, diff_id), path) in descriptors.iter().zip(diff_ids).zip(paths) {
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let desc = desc.clone();
        let diff_id = diff_id.clone();

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| Error::Task(e.to_string()))?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let tree = tokio::task::spawn_blocking(move || read_blob_layer(&path, &desc, &cancel))
                .await
                .map_err(|e| Error::Task(e.to_string()))??;
            Ok::<_, Error>((diff_id, tree))
        });
    }

    let mut layers = HashMap::new();
    let mut first_err: Option<Error> = None;

    // Drain every task, even after a failure, so no worker outlives us.
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| Error::Task(e.to_string())).and_then(|r| r);
        match result {
            Ok((diff_id, tree)) if first_err.is_none() => {
                if tree.diff_id.as_deref() != Some(diff_id.as_str()) {
                    warn!(
                        expected = %diff_id,
                        actual = tree.diff_id.as_deref().unwrap_or("-"),
                        layer = %tree.name,
                        "layer content does not match its diff ID"
                    );
                }
                debug!(layer = %tree.name, %diff_id, "got layer");
                layers.insert(LayerKey::ByDigest(diff_id), Arc::new(tree));
            }
            Ok(_) => {}
            Err(e) => {
                cancel.cancel();
                if first_err.as_ref().is_none_or(|f| matches!(f, Error::Cancelled)) {
                    first_err = Some(e);
                }
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(layers),
    }
}

fn read_blob_layer(path: &Path, desc: &Descriptor, cancel: &CancelToken) -> Result<FileTree> {
    let compression =
        Compression::from_media_type(&desc.media_type).ok_or_else(|| Error::UnknownMediaType {
            digest: desc.digest.clone(),
            media_type: desc.media_type.clone(),
        })?;

    let parse = || -> Result<FileTree> {
        let file = File::open(path).io_context(|| format!("failed to open {}", path.display()))?;
        let reader = compression
            .decoder(BufReader::new(file))
            .io_context(|| format!("failed to open decompressor for {}", desc.digest))?;
        layer::process_layer(&desc.digest, reader, cancel)
    };
    parse().map_err(|e| Error::layer(&desc.digest, e))
}
