//! Error types for image resolution and archive parsing.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for resolution and parsing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between an image reference and a
/// [`ResolvedImage`](crate::inspector::ResolvedImage).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    /// The legacy archive has no `manifest.json`.
    #[error("could not find image manifest")]
    NoManifest,

    /// The config named by the manifest is not in the archive.
    #[error("could not find image config '{0}'")]
    NoConfig(String),

    /// `manifest.json` decoded to an empty array.
    #[error("image manifest lists no images")]
    EmptyManifest,

    /// An OCI layer declared a media type we have no decompressor for.
    #[error("unknown media type '{media_type}' for layer {digest}")]
    UnknownMediaType { digest: String, media_type: String },

    /// A metadata document failed to decode.
    #[error("failed to parse {what}: {source}")]
    Json {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// A layer referenced by the manifest or config was never parsed.
    #[error("could not find '{0}' in parsed layers")]
    MissingLayer(String),

    /// A descriptor digest is not `<algorithm>:<lowercase hex>`.
    #[error("invalid digest '{0}'")]
    InvalidDigest(String),

    /// The manifest layer list and the config diff ID list disagree in length.
    #[error("manifest declares {layers} layers but config declares {diff_ids} diff IDs")]
    LayerCountMismatch { layers: usize, diff_ids: usize },

    /// Layer tars must not carry PAX extended headers as standalone entries.
    #[error("unexpected tar file ({kind}): name={name}")]
    ExtendedHeader { kind: &'static str, name: String },

    /// A file tree insertion failed.
    #[error("cannot add path '{path}': {reason}")]
    Tree { path: String, reason: String },

    /// Processing a single layer failed.
    #[error("failed to parse layer {name}: {source}")]
    Layer {
        name: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Subprocess Errors
    // =========================================================================
    /// The registry tool could not be launched.
    #[error("failed to start registry tool '{tool}': {source}")]
    RelaySpawn {
        tool: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry never reported the port it bound.
    #[error("registry did not report readiness within {0:?}")]
    RelayTimeout(Duration),

    /// The registry exited before it became ready.
    #[error("registry exited before becoming ready")]
    RelayExited,

    /// Fetching the manifest from the relay failed.
    #[error("failed to fetch manifest from {url}: {source}")]
    ManifestFetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// An engine command failed; `message` is the engine's own output.
    #[error("{message}")]
    Engine { command: String, message: String },

    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    /// Work was abandoned because a sibling task failed.
    #[error("layer processing cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted.
    #[error("layer task failed: {0}")]
    Task(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// I/O failure with a description of what was being attempted.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn layer(name: impl Into<String>, source: Error) -> Self {
        match source {
            // Keep cancellation recognisable so the first real error wins.
            Error::Cancelled => Error::Cancelled,
            other => Self::Layer {
                name: name.into(),
                source: Box::new(other),
            },
        }
    }
}

/// Attach context to `std::io::Result` values, mirroring anyhow's `Context`.
pub(crate) trait IoContext<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|e| Error::io(context(), e))
    }
}
