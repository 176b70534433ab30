//! `docker-daemon:` transport: images held by a local Docker engine.
//!
//! Images travel in `docker save` format over the engine API:
//! `GET /images/{name}/get` for sources and `POST /images/load` for
//! destinations. The API is spoken with a `hyper` HTTP/1 connection over a
//! Unix or TCP socket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream;
use hyper::body::{Bytes, HttpBody as _};
use hyper::client::conn::SendRequest;
use hyper::{Body, Method, Request, Response, StatusCode};
use skiff_core::error::{CopyError, Result};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::docker_archive::{repo_tags, tagged_reference, ArchiveSource, ArchiveWriter};
use super::{ImageDestination, ImageReference, ImageSource, Transport};
use crate::compression::LayerCompression;
use crate::context::SystemContext;
use crate::digest::Digest;
use crate::manifest::{BlobInfo, DOCKER_V2_SCHEMA2_MEDIA_TYPE};
use crate::reference::DockerReference;

const DEFAULT_HOST: &str = "unix:///var/run/docker.sock";
const UPLOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DaemonReference {
    docker_ref: Option<DockerReference>,
    id: Option<Digest>,
}

impl DaemonReference {
    pub fn parse(reference: &str) -> Result<Self> {
        if let Ok(id) = Digest::parse(reference) {
            if id.algorithm() != crate::digest::Algorithm::Sha256 {
                return Err(CopyError::ReferenceError(format!(
                    "docker-daemon: image ID {reference} is not using the sha256 algorithm"
                )));
            }
            return Ok(Self {
                docker_ref: None,
                id: Some(id),
            });
        }
        if reference.len() == 64 && reference.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CopyError::ReferenceError(
                "docker-daemon: image IDs must be prefixed with \"sha256:\"".to_string(),
            ));
        }
        Ok(Self {
            docker_ref: Some(tagged_reference("docker-daemon", reference)?),
            id: None,
        })
    }

    /// Name used in engine API paths.
    fn api_name(&self) -> String {
        match (&self.id, &self.docker_ref) {
            (Some(id), _) => id.to_string(),
            (None, Some(r)) => r.to_string(),
            (None, None) => String::new(),
        }
    }
}

#[async_trait]
impl ImageReference for DaemonReference {
    fn transport(&self) -> Transport {
        Transport::DockerDaemon
    }

    fn string_within_transport(&self) -> String {
        self.api_name()
    }

    fn docker_reference(&self) -> Option<&DockerReference> {
        self.docker_ref.as_ref()
    }

    fn policy_configuration_identity(&self) -> String {
        String::new()
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        Vec::new()
    }

    async fn new_image_source(&self, ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        let client = DaemonClient::new(ctx)?;
        let tmp = NamedTempFile::new()?;
        client.save(&self.api_name(), tmp.path()).await?;
        let inner = ArchiveSource::open(
            Box::new(self.clone()),
            tmp.path().to_path_buf(),
            self.docker_ref.clone(),
        )
        .await?;
        Ok(Box::new(DaemonSource { inner, _tmp: tmp }))
    }

    async fn new_image_destination(&self, ctx: &SystemContext) -> Result<Box<dyn ImageDestination>> {
        let Some(docker_ref) = &self.docker_ref else {
            return Err(CopyError::ReferenceError(
                "docker-daemon: a destination must be a name:tag, not an image ID".to_string(),
            ));
        };
        let client = DaemonClient::new(ctx)?;
        let tmp = NamedTempFile::new()?;
        let writer = ArchiveWriter::new(tmp.reopen()?, repo_tags(&[docker_ref]));
        Ok(Box::new(DaemonDestination {
            reference: self.clone(),
            client,
            writer,
            tmp,
        }))
    }
}

/// Where the engine API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DaemonHost {
    Unix(PathBuf),
    Tcp(String),
}

impl DaemonHost {
    fn parse(host: &str) -> Result<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            return Ok(DaemonHost::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
        {
            return Ok(DaemonHost::Tcp(addr.trim_end_matches('/').to_string()));
        }
        Err(CopyError::DaemonError(format!(
            "unsupported docker daemon host \"{host}\""
        )))
    }
}

struct DaemonClient {
    host: DaemonHost,
}

impl DaemonClient {
    /// `--*-daemon-host`, then `$DOCKER_HOST`, then the default socket.
    fn new(ctx: &SystemContext) -> Result<Self> {
        let host = ctx
            .docker_daemon_host
            .clone()
            .or_else(|| std::env::var("DOCKER_HOST").ok())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let host = DaemonHost::parse(&host)?;
        if matches!(host, DaemonHost::Tcp(_)) && ctx.docker_daemon_cert_path.is_some() {
            return Err(CopyError::DaemonError(
                "TLS connections to the docker daemon are not supported".to_string(),
            ));
        }
        Ok(Self { host })
    }

    async fn connect(&self) -> Result<SendRequest<Body>> {
        match &self.host {
            DaemonHost::Unix(path) => {
                let io = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                    CopyError::DaemonError(format!("connecting to {}: {}", path.display(), e))
                })?;
                handshake(io).await
            }
            DaemonHost::Tcp(addr) => {
                let io = tokio::net::TcpStream::connect(addr).await.map_err(|e| {
                    CopyError::DaemonError(format!("connecting to {addr}: {e}"))
                })?;
                handshake(io).await
            }
        }
    }

    async fn send(&self, request: Request<Body>) -> Result<Response<Body>> {
        let mut sender = self.connect().await?;
        sender
            .send_request(request)
            .await
            .map_err(|e| CopyError::DaemonError(format!("request failed: {e}")))
    }

    /// Export `name` into a `docker save` archive at `target`.
    async fn save(&self, name: &str, target: &Path) -> Result<()> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("/images/{name}/get"))
            .header(hyper::header::HOST, "docker")
            .body(Body::empty())
            .map_err(|e| CopyError::DaemonError(e.to_string()))?;
        let response = self.send(request).await?;
        let status = response.status();
        let mut body = response.into_body();
        if status != StatusCode::OK {
            let message = read_body(&mut body).await.unwrap_or_default();
            return Err(CopyError::DaemonError(format!(
                "Error fetching image {name}: {status} {}",
                message.trim()
            )));
        }

        let mut file = tokio::fs::File::create(target).await?;
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| CopyError::DaemonError(format!("reading image: {e}")))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        tracing::debug!(name, "Exported image from docker daemon");
        Ok(())
    }

    /// Load the archive at `source` into the engine.
    async fn load(&self, source: &Path) -> Result<()> {
        let file = tokio::fs::File::open(source).await?;
        let chunks = stream::unfold(file, |mut file| async move {
            let mut buf = vec![0u8; UPLOAD_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok::<_, std::io::Error>(Bytes::from(buf)), file))
                }
                Err(e) => Some((Err(e), file)),
            }
        });
        let request = Request::builder()
            .method(Method::POST)
            .uri("/images/load?quiet=1")
            .header(hyper::header::HOST, "docker")
            .header(hyper::header::CONTENT_TYPE, "application/x-tar")
            .body(Body::wrap_stream(chunks))
            .map_err(|e| CopyError::DaemonError(e.to_string()))?;
        let response = self.send(request).await?;
        let status = response.status();
        let message = read_body(&mut response.into_body()).await?;
        if !status.is_success() {
            return Err(CopyError::DaemonError(format!(
                "Error loading image: {status} {}",
                message.trim()
            )));
        }
        check_load_output(&message)
    }
}

async fn handshake<T>(io: T) -> Result<SendRequest<Body>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = hyper::client::conn::handshake(io)
        .await
        .map_err(|e| CopyError::DaemonError(format!("handshake failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Docker daemon connection closed");
        }
    });
    Ok(sender)
}

async fn read_body(body: &mut Body) -> Result<String> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| CopyError::DaemonError(format!("reading response: {e}")))?;
        out.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&out).to_string())
}

/// `/images/load` reports failures as JSON lines with an `error` field.
fn check_load_output(output: &str) -> Result<()> {
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
                return Err(CopyError::DaemonError(format!("Error loading image: {error}")));
            }
        }
    }
    Ok(())
}

pub struct DaemonSource {
    inner: ArchiveSource,
    _tmp: NamedTempFile,
}

#[async_trait]
impl ImageSource for DaemonSource {
    fn reference(&self) -> &dyn ImageReference {
        self.inner.reference()
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        self.inner.get_manifest(instance).await
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        self.inner.get_blob(info, writer).await
    }

    async fn get_signatures(&self, _instance: Option<&Digest>) -> Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}

pub struct DaemonDestination {
    reference: DaemonReference,
    client: DaemonClient,
    writer: ArchiveWriter,
    tmp: NamedTempFile,
}

#[async_trait]
impl ImageDestination for DaemonDestination {
    fn reference(&self) -> &dyn ImageReference {
        &self.reference
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        vec![DOCKER_V2_SCHEMA2_MEDIA_TYPE.to_string()]
    }

    fn signature_support(&self) -> Result<()> {
        Err(CopyError::DaemonError(
            "Storing signatures for docker-daemon: destinations is not supported".to_string(),
        ))
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        LayerCompression::Decompress
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        false
    }

    async fn try_reuse_blob(&self, info: &BlobInfo) -> Result<Option<BlobInfo>> {
        Ok(self.writer.try_reuse_blob(info))
    }

    async fn put_blob(&self, path: &Path, info: &BlobInfo, is_config: bool) -> Result<BlobInfo> {
        self.writer.put_blob(path, info, is_config).await
    }

    async fn put_manifest(&self, manifest: &[u8], mime_type: &str) -> Result<()> {
        self.writer.put_manifest(manifest, mime_type)
    }

    async fn put_signatures(&self, signatures: &[Vec<u8>]) -> Result<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        self.signature_support()
    }

    async fn commit(&mut self) -> Result<()> {
        self.writer.finish().await?;
        self.client.load(self.tmp.path()).await?;
        tracing::debug!(reference = %self.reference.api_name(), "Loaded image into docker daemon");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Descriptor, Schema2, DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE};
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    #[test]
    fn test_parse_reference() {
        let r = DaemonReference::parse("busybox").unwrap();
        assert_eq!(r.string_within_transport(), "docker.io/library/busybox:latest");
        assert_eq!(r.policy_configuration_identity(), "");

        let id = "sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0";
        let r = DaemonReference::parse(id).unwrap();
        assert!(r.docker_reference().is_none());
        assert_eq!(r.string_within_transport(), id);

        assert!(DaemonReference::parse(&format!("busybox@{id}")).is_err());
        assert!(DaemonReference::parse(&id[7..]).is_err());
    }

    #[tokio::test]
    async fn test_id_is_not_a_destination() {
        let r = DaemonReference::parse(
            "sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0",
        )
        .unwrap();
        assert!(r.new_image_destination(&SystemContext::default()).await.is_err());
    }

    #[test]
    fn test_daemon_host() {
        assert_eq!(
            DaemonHost::parse("unix:///run/docker.sock").unwrap(),
            DaemonHost::Unix(PathBuf::from("/run/docker.sock"))
        );
        assert_eq!(
            DaemonHost::parse("tcp://127.0.0.1:2375").unwrap(),
            DaemonHost::Tcp("127.0.0.1:2375".to_string())
        );
        assert!(DaemonHost::parse("ssh://host").is_err());
    }

    #[test]
    fn test_check_load_output() {
        assert!(check_load_output("{\"stream\":\"Loaded image: busybox:latest\\n\"}\n").is_ok());
        assert!(check_load_output("{\"errorDetail\":{},\"error\":\"bad archive\"}").is_err());
    }

    /// Serve one canned HTTP response on a Unix socket.
    async fn serve_once(socket: PathBuf, body: Vec<u8>) {
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/x-tar\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
            stream.shutdown().await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_source_from_daemon() {
        let dir = TempDir::new().unwrap();

        // Build a docker save archive to serve
        let archive = dir.path().join("saved.tar");
        let writer = ArchiveWriter::new(
            std::fs::File::create(&archive).unwrap(),
            vec!["docker.io/library/busybox:latest".to_string()],
        );
        let config_path = dir.path().join("config");
        std::fs::write(&config_path, b"{}").unwrap();
        let config = BlobInfo::new(Digest::from_bytes(b"{}"), 2, DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE);
        writer.put_blob(&config_path, &config, true).await.unwrap();
        let manifest = Schema2::new(Descriptor::from_blob_info(&config), Vec::new());
        writer
            .put_manifest(&serde_json::to_vec(&manifest).unwrap(), DOCKER_V2_SCHEMA2_MEDIA_TYPE)
            .unwrap();
        writer.finish().await.unwrap();

        let socket = dir.path().join("docker.sock");
        serve_once(socket.clone(), std::fs::read(&archive).unwrap()).await;

        let ctx = SystemContext {
            docker_daemon_host: Some(format!("unix://{}", socket.display())),
            ..Default::default()
        };
        let r = DaemonReference::parse("busybox").unwrap();
        let src = r.new_image_source(&ctx).await.unwrap();
        let (data, mime) = src.get_manifest(None).await.unwrap();
        assert_eq!(mime, DOCKER_V2_SCHEMA2_MEDIA_TYPE);
        assert_eq!(Schema2::from_blob(&data).unwrap().config.digest, config.digest);
    }
}
