//! Registry relay: re-serialise a local image as an OCI layout by pushing
//! it through an ephemeral disk-backed registry.
//!
//! The registry runs as `<tool> registry serve --insecure --disk <dir>`.
//! Once the engine has pushed into it, `<dir>/sha256/` is a
//! content-addressed blob store that [`ImageArchive::from_oci_dir`] reads
//! directly.
//!
//! [`ImageArchive::from_oci_dir`]: super::archive::ImageArchive::from_oci_dir

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::engine::Engine;
use super::manifest::OciManifest;
use crate::error::{Error, IoContext, Result};

const READY_MARKER: &str = "serving on port";
const RELAY_REPOSITORY: &str = "image";
const RELAY_TAG: &str = "latest";
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
                               application/vnd.docker.distribution.manifest.v2+json";

/// Settings for the registry subprocess.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Registry tool binary; must support `registry serve`.
    pub tool: PathBuf,
    /// Upper bound on waiting for the readiness line.
    pub ready_timeout: Duration,
    /// Parent for the registry's storage directory; system temp when unset.
    pub temp_root: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("crane"),
            ready_timeout: Duration::from_secs(30),
            temp_root: None,
        }
    }
}

/// Extract the port from a `... serving on port <N>` log line.
pub fn parse_ready_line(line: &str) -> Option<u16> {
    if !line.contains(READY_MARKER) {
        return None;
    }
    line.split_whitespace().last()?.parse().ok()
}

/// A running registry subprocess and the directory backing it.
///
/// Dropping the relay kills the process and removes the directory.
pub struct RegistryRelay {
    child: Child,
    dir: TempDir,
    port: u16,
    drain: JoinHandle<()>,
}

impl RegistryRelay {
    /// Launch the registry and wait, bounded by `ready_timeout`, for it to
    /// report its port.
    pub async fn start(cfg: &RelayConfig) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("layerpeek-registry-");
        let dir = match &cfg.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .io_context(|| "failed to create registry storage directory")?;

        let mut child = serve_command(&cfg.tool, dir.path())
            .spawn()
            .map_err(|source| Error::RelaySpawn {
                tool: cfg.tool.clone(),
                source,
            })?;

        let Some(stderr) = child.stderr.take() else {
            stop(&mut child).await;
            return Err(Error::RelayExited);
        };
        let mut lines = BufReader::new(stderr).lines();

        let port = match tokio::time::timeout(cfg.ready_timeout, wait_for_port(&mut lines)).await
        {
            Ok(Ok(Some(port))) => port,
            Ok(Ok(None)) => {
                stop(&mut child).await;
                return Err(Error::RelayExited);
            }
            Ok(Err(e)) => {
                stop(&mut child).await;
                return Err(Error::io("failed to read registry output", e));
            }
            Err(_) => {
                stop(&mut child).await;
                return Err(Error::RelayTimeout(cfg.ready_timeout));
            }
        };
        info!(port, dir = %dir.path().display(), "registry relay ready");

        // Keep the pipe empty so the registry never blocks on a log write.
        let drain = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(target: "layerpeek::registry", "{line}");
            }
        });

        Ok(Self {
            child,
            dir,
            port,
            drain,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the registry and hand over its storage directory.
    pub async fn shutdown(mut self) -> TempDir {
        stop(&mut self.child).await;
        self.drain.abort();
        self.dir
    }
}

/// `<tool> registry serve` on an OS-assigned port. The tool honours `$PORT`
/// when set, so it is cleared.
fn serve_command(tool: &Path, dir: &Path) -> Command {
    let mut cmd = Command::new(tool);
    cmd.args(["registry", "serve", "--insecure", "--disk"])
        .arg(dir)
        .env_remove("PORT")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

async fn wait_for_port<R>(lines: &mut Lines<R>) -> std::io::Result<Option<u16>>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        trace!(target: "layerpeek::registry", "{line}");
        if let Some(port) = parse_ready_line(&line) {
            return Ok(Some(port));
        }
    }
    Ok(None)
}

async fn stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "registry already exited");
    }
    if let Err(e) = child.wait().await {
        debug!(error = %e, "failed to reap registry process");
    }
}

/// Result of a relay export. The blobs live as long as this value.
pub struct RelayExport {
    dir: TempDir,
    pub manifest: OciManifest,
    pub raw_manifest: Vec<u8>,
}

impl RelayExport {
    /// Directory of blobs named by their hex digest.
    pub fn blob_dir(&self) -> PathBuf {
        self.dir.path().join("sha256")
    }
}

/// Push `image` through a fresh registry and collect its OCI manifest.
///
/// The registry process is stopped before this returns, on every path;
/// the storage directory is removed unless the export succeeded.
pub async fn export(engine: &dyn Engine, image: &str, cfg: &RelayConfig) -> Result<RelayExport> {
    let relay = RegistryRelay::start(cfg).await?;
    let fetched = push_and_fetch(engine, image, relay.port()).await;
    let dir = relay.shutdown().await;

    let (manifest, raw_manifest) = fetched?;
    debug!(
        layers = manifest.layers.len(),
        config = %manifest.config.digest,
        "fetched relay manifest"
    );
    Ok(RelayExport {
        dir,
        manifest,
        raw_manifest,
    })
}

async fn push_and_fetch(engine: &dyn Engine, image: &str, port: u16) -> Result<(OciManifest, Vec<u8>)> {
    let reference = format!("localhost:{port}/{RELAY_REPOSITORY}:{RELAY_TAG}");
    engine.tag(image, &reference).await?;

    let pushed = engine.push(&reference).await;
    if let Err(e) = engine.untag(&reference).await {
        debug!(%reference, error = %e, "failed to remove relay tag");
    }
    pushed?;

    fetch_manifest(port).await
}

async fn fetch_manifest(port: u16) -> Result<(OciManifest, Vec<u8>)> {
    let url = format!("http://localhost:{port}/v2/{RELAY_REPOSITORY}/manifests/{RELAY_TAG}");
    let fetch_error = |source| Error::ManifestFetch {
        url: url.clone(),
        source,
    };

    let client = reqwest::Client::builder()
        .no_proxy()
        .build()
        .map_err(fetch_error)?;
    let response = client
        .get(&url)
        .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(fetch_error)?;
    let raw = response.bytes().await.map_err(fetch_error)?.to_vec();

    let manifest = OciManifest::parse(&raw)?;
    Ok((manifest, raw))
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::inspector::engine::tests::FakeEngine;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("registry-tool");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(tool: PathBuf, temp_root: &Path, timeout_ms: u64) -> RelayConfig {
        RelayConfig {
            tool,
            ready_timeout: Duration::from_millis(timeout_ms),
            temp_root: Some(temp_root.to_path_buf()),
        }
    }

    /// Spawning a freshly written script can race with other test threads
    /// still holding the write handle across fork (ETXTBSY).
    async fn start(cfg: &RelayConfig) -> Result<RegistryRelay> {
        for _ in 0..20 {
            match RegistryRelay::start(cfg).await {
                Err(Error::RelaySpawn { source, .. }) if source.raw_os_error() == Some(26) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                other => return other,
            }
        }
        RegistryRelay::start(cfg).await
    }

    fn is_empty_dir(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn test_parse_ready_line() {
        assert_eq!(
            parse_ready_line("2024/05/01 10:00:00 serving on port 41235"),
            Some(41235)
        );
        assert_eq!(parse_ready_line("serving on port 80"), Some(80));
        assert_eq!(parse_ready_line("listening on port 80"), None);
        assert_eq!(parse_ready_line("serving on port soon"), None);
        assert_eq!(parse_ready_line("serving on port 99999"), None);
    }

    #[test]
    fn test_serve_command_clears_port() {
        let cmd = serve_command(Path::new("crane"), Path::new("/tmp/store"));
        let std_cmd = cmd.as_std();
        assert!(
            std_cmd
                .get_envs()
                .any(|(key, value)| key == "PORT" && value.is_none())
        );
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, ["registry", "serve", "--insecure", "--disk", "/tmp/store"]);
    }

    #[tokio::test]
    async fn test_start_reports_port_and_args() {
        let bin = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let args_file = bin.path().join("args");
        let tool = script(
            bin.path(),
            &format!(
                "echo \"$@\" > {}\necho 'log noise' >&2\necho '2024/05/01 serving on port 5123' >&2\nexec sleep 30",
                args_file.display()
            ),
        );

        let relay = start(&config(tool, root.path(), 5000)).await.unwrap();
        assert_eq!(relay.port(), 5123);

        let dir = relay.shutdown().await;
        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            args.trim(),
            format!("registry serve --insecure --disk {}", dir.path().display())
        );
        assert!(dir.path().starts_with(root.path()));

        drop(dir);
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_timeout_releases_process_and_dir() {
        let bin = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let pid_file = bin.path().join("pid");
        let tool = script(
            bin.path(),
            &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
        );

        let err = start(&config(tool, root.path(), 500)).await.err().unwrap();
        assert!(matches!(err, Error::RelayTimeout(_)));
        assert!(is_empty_dir(root.path()));

        if Path::new("/proc/self").exists() {
            let pid = std::fs::read_to_string(&pid_file).unwrap();
            assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
        }
    }

    #[tokio::test]
    async fn test_early_exit() {
        let bin = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let tool = script(bin.path(), "echo 'bind: address already in use' >&2\nexit 1");

        let err = start(&config(tool, root.path(), 5000)).await.err().unwrap();
        assert!(matches!(err, Error::RelayExited));
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let root = TempDir::new().unwrap();
        let cfg = config(PathBuf::from("/nonexistent/registry-tool"), root.path(), 100);
        let err = RegistryRelay::start(&cfg).await.err().unwrap();
        assert!(matches!(err, Error::RelaySpawn { .. }));
        assert!(is_empty_dir(root.path()));
    }

    /// Serve a single manifest response, returning the request head.
    async fn serve_manifest(listener: TcpListener, body: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/vnd.oci.image.manifest.v1+json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
        String::from_utf8_lossy(&request).into_owned()
    }

    #[tokio::test]
    async fn test_export_tags_pushes_and_fetches() {
        const MANIFEST: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","size":2,"digest":"sha256:c0"},"layers":[{"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","size":3,"digest":"sha256:l0"}]}"#;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_manifest(listener, MANIFEST));

        let bin = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let tool = script(
            bin.path(),
            &format!("echo 'serving on port {port}' >&2\nexec sleep 30"),
        );
        let cfg = config(tool, root.path(), 5000);
        let engine = Arc::new(FakeEngine::default());

        let mut attempt = export(engine.as_ref(), "demo:1", &cfg).await;
        for _ in 0..20 {
            let busy = matches!(
                &attempt,
                Err(Error::RelaySpawn { source, .. }) if source.raw_os_error() == Some(26)
            );
            if !busy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            attempt = export(engine.as_ref(), "demo:1", &cfg).await;
        }
        let export = attempt.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /v2/image/manifests/latest HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("application/vnd.oci.image.manifest.v1+json"));

        assert_eq!(export.raw_manifest, MANIFEST.as_bytes());
        assert_eq!(export.manifest.layers[0].digest, "sha256:l0");
        assert!(export.blob_dir().starts_with(root.path()));
        assert!(export.blob_dir().ends_with("sha256"));

        let reference = format!("localhost:{port}/image:latest");
        assert_eq!(
            engine.calls(),
            [
                format!("tag demo:1 {reference}"),
                format!("push {reference}"),
                format!("untag {reference}"),
            ]
        );

        drop(export);
        assert!(is_empty_dir(root.path()));
    }

    /// Script that records its pid, reports `port` and then idles.
    fn idle_registry(bin: &Path, port: u16) -> (PathBuf, PathBuf) {
        let pid_file = bin.join("pid");
        let tool = script(
            bin,
            &format!(
                "echo $$ > {}\necho 'serving on port {port}' >&2\nexec sleep 30",
                pid_file.display()
            ),
        );
        (tool, pid_file)
    }

    async fn export_retrying(engine: &FakeEngine, cfg: &RelayConfig) -> Result<RelayExport> {
        let mut attempt = export(engine, "demo:1", cfg).await;
        for _ in 0..20 {
            let busy = matches!(
                &attempt,
                Err(Error::RelaySpawn { source, .. }) if source.raw_os_error() == Some(26)
            );
            if !busy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            attempt = export(engine, "demo:1", cfg).await;
        }
        attempt
    }

    fn assert_released(root: &Path, pid_file: &Path) {
        assert!(is_empty_dir(root));
        let pid = std::fs::read_to_string(pid_file).unwrap();
        if Path::new("/proc/self").exists() {
            assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
        }
    }

    #[tokio::test]
    async fn test_push_failure_releases_registry() {
        let bin = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let (tool, pid_file) = idle_registry(bin.path(), 5999);
        let engine = FakeEngine {
            fail_push: true,
            ..Default::default()
        };

        let err = export_retrying(&engine, &config(tool, root.path(), 5000))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "connection refused");
        assert_released(root.path(), &pid_file);

        // The relay tag is removed even though the push failed.
        let calls = engine.calls();
        assert_eq!(calls.last().unwrap(), "untag localhost:5999/image:latest");
    }

    #[tokio::test]
    async fn test_bad_manifest_releases_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_manifest(listener, "<html>not a manifest</html>"));

        let bin = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let (tool, pid_file) = idle_registry(bin.path(), port);
        let engine = FakeEngine::default();

        let err = export_retrying(&engine, &config(tool, root.path(), 5000))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Json { .. }));
        server.await.unwrap();
        assert_released(root.path(), &pid_file);
    }
}
