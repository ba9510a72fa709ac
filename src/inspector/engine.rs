//! Container engine boundary and the engine-backed resolver.

use std::io::{self, Read};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::archive::ImageArchive;
use super::relay::{self, RelayConfig};
use super::{ResolvedImage, Resolver};
use crate::error::{Error, IoContext, Result};

/// Operations this tool needs from a container engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Succeeds when the image exists locally.
    async fn inspect(&self, image: &str) -> Result<()>;

    /// Pull the image, letting the engine report progress to the operator.
    async fn pull(&self, image: &str) -> Result<()>;

    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    /// Remove a tag created with [`Engine::tag`]. The image itself stays.
    async fn untag(&self, reference: &str) -> Result<()>;

    async fn push(&self, reference: &str) -> Result<()>;

    /// Start streaming a `save` archive. Blocking; call from a blocking
    /// context.
    fn save(&self, image: &str) -> Result<SaveStream>;
}

/// A readable `save` archive plus the process producing it.
pub struct SaveStream {
    reader: Option<Box<dyn Read + Send>>,
    child: Option<Child>,
    /// Collects the engine's stderr so a chatty engine never blocks on it.
    stderr: Option<JoinHandle<String>>,
    command: String,
}

impl SaveStream {
    /// Wrap a plain reader with no process behind it.
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Some(Box::new(reader)),
            child: None,
            stderr: None,
            command: String::new(),
        }
    }

    /// Drain what the parser left unread and check the exit status.
    pub fn finish(mut self) -> Result<()> {
        if let Some(mut reader) = self.reader.take() {
            io::copy(&mut reader, &mut io::sink())
                .io_context(|| format!("failed to read output of '{}'", self.command))?;
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let status = child
            .wait()
            .io_context(|| format!("failed to wait for '{}'", self.command))?;
        let stderr = self.join_stderr();
        if status.success() {
            return Ok(());
        }
        Err(Error::Engine {
            command: self.command.clone(),
            message: stderr.trim().to_string(),
        })
    }

    fn join_stderr(&mut self) -> String {
        match self.stderr.take().map(JoinHandle::join) {
            Some(Ok(text)) => text,
            Some(Err(_)) => {
                debug!(command = %self.command, "stderr reader panicked");
                String::new()
            }
            None => String::new(),
        }
    }
}

impl Read for SaveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(r) => r.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for SaveStream {
    fn drop(&mut self) {
        self.reader.take();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, command = %self.command, "save process already exited");
            }
            if let Err(e) = child.wait() {
                debug!(error = %e, command = %self.command, "failed to reap save process");
            }
        }
        self.join_stderr();
    }
}

/// Read a child's stderr to the end on its own thread.
fn collect_stderr(mut pipe: ChildStderr, command: String) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Err(e) = pipe.read_to_string(&mut text) {
            debug!(error = %e, %command, "failed to read engine stderr");
        }
        text
    })
}

/// Drives an engine through its CLI (`docker`, `podman`, ...).
pub struct CliEngine {
    binary: String,
}

impl CliEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    /// Run with captured output; on failure, the engine's stderr is the error.
    async fn run_captured(&self, args: &[&str]) -> Result<()> {
        let command = self.describe(args);
        debug!(%command, "running engine command");
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .io_context(|| format!("failed to run '{command}'"))?;

        if output.status.success() {
            return Ok(());
        }
        Err(Error::Engine {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            command,
        })
    }

    /// Run with stdout/stderr passed through to the operator.
    async fn run_inherited(&self, args: &[&str]) -> Result<()> {
        let command = self.describe(args);
        debug!(%command, "running engine command");
        let status = tokio::process::Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .await
            .io_context(|| format!("failed to run '{command}'"))?;

        if status.success() {
            return Ok(());
        }
        Err(Error::Engine {
            message: format!("'{command}' failed ({status})"),
            command,
        })
    }
}

#[async_trait]
impl Engine for CliEngine {
    async fn inspect(&self, image: &str) -> Result<()> {
        self.run_captured(&["image", "inspect", "--format", "{{.Id}}", image])
            .await
    }

    async fn pull(&self, image: &str) -> Result<()> {
        // The CLI reports pull failures far better than the API does.
        self.run_inherited(&["pull", image]).await
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.run_captured(&["tag", source, target]).await
    }

    async fn untag(&self, reference: &str) -> Result<()> {
        self.run_captured(&["image", "rm", reference]).await
    }

    async fn push(&self, reference: &str) -> Result<()> {
        self.run_inherited(&["push", reference]).await
    }

    fn save(&self, image: &str) -> Result<SaveStream> {
        let command = self.describe(&["save", image]);
        let mut child = Command::new(&self.binary)
            .args(["save", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .io_context(|| format!("failed to run '{command}'"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::io(format!("'{command}'"), io::Error::other("no stdout pipe")))?;

        let stderr = child
            .stderr
            .take()
            .map(|pipe| collect_stderr(pipe, command.clone()));

        Ok(SaveStream {
            reader: Some(Box::new(stdout)),
            child: Some(child),
            stderr,
            command,
        })
    }
}

/// How the resolver obtains the archive from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Stream `save` output straight into the archive parser.
    #[default]
    Save,
    /// Push through an ephemeral local registry to get an OCI layout.
    Relay,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "save" => Ok(Strategy::Save),
            "relay" => Ok(Strategy::Relay),
            other => Err(format!("unknown strategy '{other}' (expected 'save' or 'relay')")),
        }
    }
}

/// Resolves images held by a running engine.
pub struct EngineResolver {
    engine: Arc<dyn Engine>,
    strategy: Strategy,
    relay: RelayConfig,
    max_parallel: usize,
}

impl EngineResolver {
    pub fn new(
        engine: Arc<dyn Engine>,
        strategy: Strategy,
        relay: RelayConfig,
        max_parallel: usize,
    ) -> Self {
        Self {
            engine,
            strategy,
            relay,
            max_parallel,
        }
    }

    /// Make sure the image is available locally, pulling it if not.
    async fn ensure_local(&self, image: &str) -> Result<()> {
        if let Err(e) = self.engine.inspect(image).await {
            debug!(image, error = %e, "image inspect failed");
            info!(image, "image not available locally, pulling");
            self.engine.pull(image).await?;
        }
        Ok(())
    }

    async fn fetch_saved(&self, image: &str) -> Result<ResolvedImage> {
        let engine = Arc::clone(&self.engine);
        let image = image.to_string();

        tokio::task::spawn_blocking(move || {
            let mut stream = engine.save(&image)?;
            let parsed = ImageArchive::from_tar(&mut stream);
            // An engine failure explains a parse failure better than the
            // parse error does.
            stream.finish()?;
            parsed?.into_image()
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?
    }

    async fn fetch_relayed(&self, image: &str) -> Result<ResolvedImage> {
        let export = relay::export(self.engine.as_ref(), image, &self.relay).await?;
        let archive = ImageArchive::from_oci_dir(
            &export.blob_dir(),
            export.manifest.clone(),
            &export.raw_manifest,
            self.max_parallel,
        )
        .await?;
        archive.into_image()
    }
}

#[async_trait]
impl Resolver for EngineResolver {
    async fn fetch(&self, image: &str) -> Result<ResolvedImage> {
        self.ensure_local(image).await?;
        let resolved = match self.strategy {
            Strategy::Save => self.fetch_saved(image).await,
            Strategy::Relay => self.fetch_relayed(image).await,
        };
        if let Err(e) = &resolved {
            warn!(image, error = %e, "resolution failed");
        }
        resolved
    }
}
