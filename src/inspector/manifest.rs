use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Treat an explicit JSON `null` like a missing field. Engines write
/// `"RepoTags": null` for untagged images and `"history": null` is legal.
fn nullable<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Option::unwrap_or_default)
}

// ---- OCI descriptor ----

/// A content-addressed reference to a blob. Equality and hashing use the
/// digest only.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub size: i64,
    pub digest: String,
}

impl Descriptor {
    /// The digest without its `<algorithm>:` prefix, i.e. the blob file name.
    /// Anything but lowercase hex is rejected.
    pub fn encoded(&self) -> Result<&str> {
        let hex = self
            .digest
            .split_once(':')
            .map(|(_, hex)| hex)
            .unwrap_or(&self.digest);
        if hex.is_empty() || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidDigest(self.digest.clone()));
        }
        Ok(hex)
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Descriptor {}

impl Hash for Descriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

// ---- Manifests ----

/// One image entry of a legacy `manifest.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyManifest {
    #[serde(rename = "Config")]
    pub config_path: String,
    #[serde(rename = "RepoTags", default, deserialize_with = "nullable")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers", default, deserialize_with = "nullable")]
    pub layer_paths: Vec<String>,
}

impl LegacyManifest {
    /// Decode a `manifest.json` array and select the image to inspect.
    ///
    /// Multi-image archives are resolved with a first-match policy: the
    /// first entry is used and the tags of the rest are logged.
    pub fn parse_first(data: &[u8]) -> Result<Self> {
        let entries: Vec<LegacyManifest> =
            serde_json::from_slice(data).map_err(|e| Error::json("manifest.json", e))?;

        let mut entries = entries.into_iter();
        let first = entries.next().ok_or(Error::EmptyManifest)?;

        let ignored: Vec<String> = entries.flat_map(|m| m.repo_tags).collect();
        if !ignored.is_empty() {
            warn!(
                selected = ?first.repo_tags,
                ?ignored,
                "archive holds several images, using the first"
            );
        }
        Ok(first)
    }
}

/// An OCI image manifest (`application/vnd.oci.image.manifest.v1+json`).
#[derive(Debug, Clone, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default, deserialize_with = "nullable")]
    pub layers: Vec<Descriptor>,
}

impl OciManifest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::json("OCI manifest", e))
    }
}

/// An OCI image index (`index.json`), as found at the root of OCI-layout
/// archives.
#[derive(Debug, Clone, Deserialize)]
pub struct OciIndex {
    #[serde(default, deserialize_with = "nullable")]
    pub manifests: Vec<Descriptor>,
}

impl OciIndex {
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::json("OCI index", e))
    }

    /// Whether a descriptor points at another index rather than a manifest.
    pub fn is_index_media_type(media_type: &str) -> bool {
        media_type.ends_with("image.index.v1+json")
            || media_type.ends_with("manifest.list.v2+json")
    }
}

/// Either manifest shape, depending on which archive format was read.
#[derive(Debug, Clone)]
pub enum ImageManifest {
    Legacy(LegacyManifest),
    Oci(OciManifest),
}

// ---- Image config ----

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RootFs {
    #[serde(default, deserialize_with = "nullable")]
    pub diff_ids: Vec<String>,
}

/// One build step from the image config history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub empty_layer: bool,
    /// Aggregate size of the correlated layer tree; never read from input.
    #[serde(skip_deserializing)]
    pub size: u64,
}

impl HistoryEntry {
    /// Placeholder attribution for a layer with no matching history.
    pub fn missing() -> Self {
        Self {
            created_by: "(missing)".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, deserialize_with = "nullable")]
    pub history: Vec<HistoryEntry>,
}

impl ImageConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::json("image config", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_manifest_uses_first_entry() {
        let data = br#"[
            {"Config":"a.json","RepoTags":["a:1"],"Layers":["l1/layer.tar"]},
            {"Config":"b.json","RepoTags":["b:1"],"Layers":[]}
        ]"#;
        let m = LegacyManifest::parse_first(data).unwrap();
        assert_eq!(m.config_path, "a.json");
        assert_eq!(m.repo_tags, vec!["a:1"]);
        assert_eq!(m.layer_paths, vec!["l1/layer.tar"]);
    }

    #[test]
    fn test_legacy_manifest_null_tags() {
        let data = br#"[{"Config":"c.json","RepoTags":null,"Layers":["x.tar"]}]"#;
        let m = LegacyManifest::parse_first(data).unwrap();
        assert!(m.repo_tags.is_empty());
    }

    #[test]
    fn test_legacy_manifest_empty_array_is_typed_error() {
        let err = LegacyManifest::parse_first(b"[]").unwrap_err();
        assert!(matches!(err, Error::EmptyManifest));
    }

    #[test]
    fn test_legacy_manifest_malformed() {
        let err = LegacyManifest::parse_first(b"{\"Config\":1}").unwrap_err();
        assert!(matches!(err, Error::Json { .. }));
    }

    #[test]
    fn test_oci_manifest_ignores_unknown_fields() {
        let data = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType":"application/vnd.oci.image.config.v1+json","size":10,"digest":"sha256:c0ffee"},
            "layers": [
                {"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","size":20,"digest":"sha256:l1","annotations":{"x":"y"}}
            ],
            "annotations": {"org.opencontainers.image.created": "now"}
        }"#;
        let m = OciManifest::parse(data).unwrap();
        assert_eq!(m.media_type, "application/vnd.oci.image.manifest.v1+json");
        assert_eq!(m.config.encoded().unwrap(), "c0ffee");
        assert_eq!(m.layers.len(), 1);
        assert_eq!(m.layers[0].size, 20);
    }

    #[test]
    fn test_descriptor_identity_is_digest() {
        let a = Descriptor {
            media_type: "a".into(),
            size: 1,
            digest: "sha256:abc".into(),
        };
        let b = Descriptor {
            media_type: "b".into(),
            size: 2,
            digest: "sha256:abc".into(),
        };
        assert_eq!(a, b);
        assert_eq!(a.encoded().unwrap(), "abc");
    }

    #[test]
    fn test_encoded_rejects_non_hex() {
        for digest in ["sha256:../../etc/passwd", "sha256:ABC", "sha256:", "sha256:ab/cd"] {
            let d = Descriptor {
                media_type: String::new(),
                size: 0,
                digest: digest.into(),
            };
            assert!(matches!(d.encoded(), Err(Error::InvalidDigest(_))), "{digest}");
        }
    }

    #[test]
    fn test_config_history() {
        let data = br#"{
            "architecture": "amd64",
            "rootfs": {"type":"layers","diff_ids":["sha256:d1","sha256:d2"]},
            "history": [
                {"created_by":"ADD file:abc in /","created":"2024-01-01T00:00:00Z"},
                {"created_by":"ENV A=b","empty_layer":true},
                {"created_by":"RUN make","comment":"buildkit"}
            ]
        }"#;
        let c = ImageConfig::parse(data).unwrap();
        assert_eq!(c.rootfs.diff_ids, vec!["sha256:d1", "sha256:d2"]);
        assert_eq!(c.history.len(), 3);
        assert!(c.history[1].empty_layer);
        assert_eq!(c.history[2].comment.as_deref(), Some("buildkit"));
        assert_eq!(c.history[0].size, 0);
    }

    #[test]
    fn test_config_without_history() {
        let c = ImageConfig::parse(br#"{"rootfs":{"diff_ids":["sha256:d1"]},"history":null}"#)
            .unwrap();
        assert!(c.history.is_empty());
    }
}
