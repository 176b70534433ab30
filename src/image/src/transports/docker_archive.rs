//! `docker-archive:` transport: `docker save` tarballs.
//!
//! ```text
//! manifest.json     [{"Config": "<hex>.json", "RepoTags": [...], "Layers": ["<hex>.tar", ...]}]
//! <hex>.json        image config
//! <hex>.tar         uncompressed layers
//! ```
//!
//! The reader and writer are shared with the `docker-daemon:` transport,
//! which moves images to and from the daemon in this format.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skiff_core::error::{CopyError, Result};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite};

use super::{resolve_path, ImageDestination, ImageReference, ImageSource, Transport};
use crate::compression::{self, LayerCompression};
use crate::context::SystemContext;
use crate::digest::{Digest, Digester};
use crate::manifest::{
    self, BlobInfo, Descriptor, Schema2, DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE,
    DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE, DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE,
    DOCKER_V2_SCHEMA2_MEDIA_TYPE,
};
use crate::reference::{DockerReference, DEFAULT_TAG};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone)]
pub struct ArchiveReference {
    path: String,
    resolved: PathBuf,
    docker_ref: Option<DockerReference>,
}

impl ArchiveReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let (path, name) = match reference.split_once(':') {
            Some((p, n)) => (p, Some(n)),
            None => (reference, None),
        };
        if path.is_empty() {
            return Err(CopyError::transport(
                "docker-archive",
                format!("docker-archive reference {reference} does not include a path"),
            ));
        }
        let docker_ref = match name.filter(|n| !n.is_empty()) {
            Some(name) => Some(tagged_reference("docker-archive", name)?),
            None => None,
        };
        Ok(Self {
            path: path.to_string(),
            resolved: resolve_path(Path::new(path))?,
            docker_ref,
        })
    }
}

/// Parse a tag-or-name reference; digests are refused and `latest` is the
/// default tag.
pub(crate) fn tagged_reference(transport: &str, name: &str) -> Result<DockerReference> {
    let r = DockerReference::parse_normalized_named(name)?;
    if r.digest.is_some() {
        return Err(CopyError::transport(
            transport,
            format!("{transport} doesn't support digest references"),
        ));
    }
    Ok(r.with_default_tag())
}

#[async_trait]
impl ImageReference for ArchiveReference {
    fn transport(&self) -> Transport {
        Transport::DockerArchive
    }

    fn string_within_transport(&self) -> String {
        match &self.docker_ref {
            Some(r) => format!("{}:{}", self.path, r),
            None => self.path.clone(),
        }
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

    async fn new_image_source(&self, _ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        let source = ArchiveSource::open(
            Box::new(self.clone()),
            self.resolved.clone(),
            self.docker_ref.clone(),
        )
        .await?;
        Ok(Box::new(source))
    }

    async fn new_image_destination(&self, ctx: &SystemContext) -> Result<Box<dyn ImageDestination>> {
        if let Ok(meta) = std::fs::metadata(&self.resolved) {
            if meta.len() > 0 {
                return Err(CopyError::transport(
                    "docker-archive",
                    "docker-archive doesn't support modifying existing images",
                ));
            }
        }
        let file = std::fs::File::create(&self.resolved).map_err(|e| {
            CopyError::transport(
                "docker-archive",
                format!("creating {}: {}", self.resolved.display(), e),
            )
        })?;
        let mut tags: Vec<&DockerReference> = self.docker_ref.iter().collect();
        tags.extend(ctx.docker_archive_additional_tags.iter());
        Ok(Box::new(ArchiveDestination {
            reference: self.clone(),
            writer: ArchiveWriter::new(file, repo_tags(&tags)),
        }))
    }
}

/// `RepoTags` strings for `references`, `latest` when untagged.
pub(crate) fn repo_tags(references: &[&DockerReference]) -> Vec<String> {
    references
        .iter()
        .map(|r| format!("{}:{}", r.name(), r.tag.as_deref().unwrap_or(DEFAULT_TAG)))
        .collect()
}

/// One image in `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ManifestItem {
    pub config: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    pub layers: Vec<String>,
}

/// Random access to the members of a (possibly compressed) tar archive.
pub(crate) struct ArchiveReader {
    path: PathBuf,
    _decompressed: Option<NamedTempFile>,
    /// member name -> (offset of data, size)
    entries: HashMap<String, (u64, u64)>,
    links: HashMap<String, String>,
    items: Vec<ManifestItem>,
}

impl ArchiveReader {
    /// Index the archive at `path`. Blocking.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let (tar_path, decompressed) = match compression::detect_file(path).map_err(|e| {
            CopyError::transport("docker-archive", format!("opening {}: {}", path.display(), e))
        })? {
            Some(algorithm) => {
                tracing::debug!(algorithm = algorithm.name(), "Decompressing archive to a temporary file");
                let mut tmp = NamedTempFile::new()?;
                let input = std::fs::File::open(path)?;
                let mut reader = compression::decompressor(algorithm, input)?;
                std::io::copy(&mut reader, tmp.as_file_mut())?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
            None => (path.to_path_buf(), None),
        };

        let mut entries = HashMap::new();
        let mut links = HashMap::new();
        let mut archive = tar::Archive::new(std::fs::File::open(&tar_path)?);
        for entry in archive.entries()? {
            let entry = entry?;
            let name = normalize_member(&entry.path()?.to_string_lossy());
            let kind = entry.header().entry_type();
            if kind.is_symlink() {
                if let Some(target) = entry.link_name()? {
                    let target = resolve_link(&name, &target.to_string_lossy());
                    links.insert(name, target);
                }
            } else if kind.is_file() {
                entries.insert(name, (entry.raw_file_position(), entry.size()));
            }
        }

        let mut reader = Self {
            path: tar_path,
            _decompressed: decompressed,
            entries,
            links,
            items: Vec::new(),
        };
        let manifest = reader.read_member(MANIFEST_FILE)?;
        reader.items = serde_json::from_slice(&manifest).map_err(|e| {
            CopyError::transport("docker-archive", format!("invalid {MANIFEST_FILE}: {e}"))
        })?;
        Ok(reader)
    }

    fn member(&self, name: &str) -> Result<(u64, u64)> {
        let name = normalize_member(name);
        let name = self.links.get(&name).cloned().unwrap_or(name);
        self.entries.get(&name).copied().ok_or_else(|| {
            CopyError::transport("docker-archive", format!("file \"{name}\" not found in archive"))
        })
    }

    fn read_member(&self, name: &str) -> Result<Vec<u8>> {
        let (offset, size) = self.member(name)?;
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity(size as usize);
        file.take(size).read_to_end(&mut data)?;
        Ok(data)
    }

    /// Digest, size and compression of a member.
    fn inspect_member(&self, name: &str) -> Result<(Digest, u64, Option<compression::Algorithm>)> {
        let (offset, size) = self.member(name)?;
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = file.take(size);
        let mut header = [0u8; 8];
        let mut filled = 0;
        while filled < header.len() {
            let n = reader.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let mut digester = Digester::new(crate::digest::Algorithm::Sha256);
        digester.update(&header[..filled]);
        std::io::copy(&mut reader, &mut digester)?;
        Ok((digester.finish(), size, compression::detect(&header[..filled])))
    }

    /// The image named `reference`, or the only image when `None`.
    pub(crate) fn select(&self, reference: Option<&DockerReference>) -> Result<&ManifestItem> {
        match reference {
            Some(wanted) => self
                .items
                .iter()
                .find(|item| {
                    item.repo_tags.iter().flatten().any(|tag| {
                        DockerReference::parse_normalized_named(tag)
                            .map(|t| t.with_default_tag() == *wanted)
                            .unwrap_or(false)
                    })
                })
                .ok_or_else(|| {
                    CopyError::transport(
                        "docker-archive",
                        format!("Tag \"{wanted}\" not found"),
                    )
                }),
            None => match self.items.as_slice() {
                [only] => Ok(only),
                items => Err(CopyError::transport(
                    "docker-archive",
                    format!(
                        "archive contains {} images, a reference is required to choose one",
                        items.len()
                    ),
                )),
            },
        }
    }

    /// Build a schema 2 manifest for `item`, returning it with the archive
    /// member backing each blob digest.
    pub(crate) fn synthesize(&self, item: &ManifestItem) -> Result<(Vec<u8>, HashMap<Digest, String>)> {
        let mut members = HashMap::new();

        let config = self.read_member(&item.config)?;
        let config_digest = Digest::from_bytes(&config);
        members.insert(config_digest.clone(), item.config.clone());
        let config_info = BlobInfo::new(
            config_digest,
            config.len() as i64,
            DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE,
        );

        let mut layers = Vec::with_capacity(item.layers.len());
        for name in &item.layers {
            let (digest, size, algorithm) = self.inspect_member(name)?;
            let media_type = match algorithm {
                Some(compression::Algorithm::Gzip) => DOCKER_V2_SCHEMA2_LAYER_MEDIA_TYPE,
                _ => DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE,
            };
            members.insert(digest.clone(), name.clone());
            layers.push(Descriptor::from_blob_info(&BlobInfo::new(digest, size as i64, media_type)));
        }

        let manifest = Schema2::new(Descriptor::from_blob_info(&config_info), layers);
        Ok((serde_json::to_vec(&manifest)?, members))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn member_range(&self, name: &str) -> Result<(u64, u64)> {
        self.member(name)
    }
}

fn normalize_member(name: &str) -> String {
    name.trim_start_matches("./").to_string()
}

/// Resolve a symlink target relative to the directory of `name`.
fn resolve_link(name: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = name.split('/').collect();
    parts.pop();
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.join("/")
}

/// Image source over an indexed archive; shared with `docker-daemon:`.
pub(crate) struct ArchiveSource {
    reference: Box<dyn ImageReference>,
    reader: Arc<ArchiveReader>,
    manifest: Vec<u8>,
    members: HashMap<Digest, String>,
}

impl ArchiveSource {
    pub(crate) async fn open(
        reference: Box<dyn ImageReference>,
        path: PathBuf,
        docker_ref: Option<DockerReference>,
    ) -> Result<Self> {
        let (reader, manifest, members) = tokio::task::spawn_blocking(move || {
            let reader = ArchiveReader::open(&path)?;
            let item = reader.select(docker_ref.as_ref())?.clone();
            let (manifest, members) = reader.synthesize(&item)?;
            Ok::<_, CopyError>((reader, manifest, members))
        })
        .await
        .map_err(|e| CopyError::Other(format!("archive task failed: {e}")))??;
        Ok(Self {
            reference,
            reader: Arc::new(reader),
            manifest,
            members,
        })
    }
}

#[async_trait]
impl ImageSource for ArchiveSource {
    fn reference(&self) -> &dyn ImageReference {
        self.reference.as_ref()
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        if instance.is_some() {
            return Err(CopyError::transport(
                "docker-archive",
                "manifest lists are not supported by docker archives",
            ));
        }
        Ok((self.manifest.clone(), DOCKER_V2_SCHEMA2_MEDIA_TYPE.to_string()))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let name = self.members.get(&info.digest).ok_or_else(|| {
            CopyError::transport("docker-archive", format!("unknown blob {}", info.digest))
        })?;
        let (offset, size) = self.reader.member_range(name)?;
        let mut file = tokio::fs::File::open(self.reader.path()).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut member = file.take(size);
        Ok(tokio::io::copy(&mut member, writer).await?)
    }

    async fn get_signatures(&self, _instance: Option<&Digest>) -> Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}

/// Streams blobs into a `docker save` tarball; shared with `docker-daemon:`.
pub(crate) struct ArchiveWriter {
    builder: Arc<Mutex<Option<tar::Builder<std::fs::File>>>>,
    written: Mutex<HashSet<Digest>>,
    repo_tags: Vec<String>,
    manifest: Mutex<Option<Vec<u8>>>,
}

impl ArchiveWriter {
    pub(crate) fn new(file: std::fs::File, repo_tags: Vec<String>) -> Self {
        Self {
            builder: Arc::new(Mutex::new(Some(tar::Builder::new(file)))),
            written: Mutex::new(HashSet::new()),
            repo_tags,
            manifest: Mutex::new(None),
        }
    }

    async fn append_file(&self, source: PathBuf, name: String) -> Result<()> {
        let builder = Arc::clone(&self.builder);
        tokio::task::spawn_blocking(move || {
            let mut guard = builder.lock();
            let builder = guard
                .as_mut()
                .ok_or_else(|| CopyError::Other("archive already finished".to_string()))?;
            builder.append_path_with_name(&source, &name)?;
            Ok::<_, CopyError>(())
        })
        .await
        .map_err(|e| CopyError::Other(format!("archive task failed: {e}")))?
    }

    pub(crate) fn try_reuse_blob(&self, info: &BlobInfo) -> Option<BlobInfo> {
        self.written.lock().contains(&info.digest).then(|| info.clone())
    }

    pub(crate) async fn put_blob(&self, path: &Path, info: &BlobInfo, is_config: bool) -> Result<BlobInfo> {
        if !self.written.lock().insert(info.digest.clone()) {
            return Ok(info.clone());
        }
        let name = member_name(&info.digest, is_config);
        self.append_file(path.to_path_buf(), name).await?;
        Ok(info.clone())
    }

    pub(crate) fn put_manifest(&self, manifest: &[u8], mime_type: &str) -> Result<()> {
        let mime_type = manifest::normalize_mime_type(mime_type, manifest);
        if mime_type != DOCKER_V2_SCHEMA2_MEDIA_TYPE {
            return Err(CopyError::ManifestTypeRejected {
                mime_type,
                reason: "docker archives only store Docker schema 2 manifests".to_string(),
            });
        }
        let parsed = Schema2::from_blob(manifest)?;
        let item = ManifestItem {
            config: member_name(&parsed.config.digest, true),
            repo_tags: Some(self.repo_tags.clone()),
            layers: parsed
                .layers
                .iter()
                .map(|l| member_name(&l.digest, false))
                .collect(),
        };
        *self.manifest.lock() = Some(serde_json::to_vec(&[item])?);
        Ok(())
    }

    /// Write `manifest.json` and close the tarball.
    pub(crate) async fn finish(&self) -> Result<()> {
        let manifest = self
            .manifest
            .lock()
            .take()
            .ok_or_else(|| CopyError::Other("no manifest was written to the archive".to_string()))?;
        let builder = Arc::clone(&self.builder);
        tokio::task::spawn_blocking(move || {
            let mut builder = builder
                .lock()
                .take()
                .ok_or_else(|| CopyError::Other("archive already finished".to_string()))?;
            let mut header = tar::Header::new_gnu();
            header.set_size(manifest.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, MANIFEST_FILE, manifest.as_slice())?;
            builder.into_inner()?.sync_all()?;
            Ok::<_, CopyError>(())
        })
        .await
        .map_err(|e| CopyError::Other(format!("archive task failed: {e}")))?
    }
}

fn member_name(digest: &Digest, is_config: bool) -> String {
    if is_config {
        format!("{}.json", digest.hex())
    } else {
        format!("{}.tar", digest.hex())
    }
}

pub struct ArchiveDestination {
    reference: ArchiveReference,
    writer: ArchiveWriter,
}

#[async_trait]
impl ImageDestination for ArchiveDestination {
    fn reference(&self) -> &dyn ImageReference {
        &self.reference
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        vec![DOCKER_V2_SCHEMA2_MEDIA_TYPE.to_string()]
    }

    fn signature_support(&self) -> Result<()> {
        Err(CopyError::transport(
            "docker-archive",
            "Storing signatures for docker tar files is not supported",
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
        self.writer.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_archive(dir: &Path, reference: &str, ctx: &SystemContext) -> (BlobInfo, BlobInfo) {
        let r = ArchiveReference::parse(reference).unwrap();
        let mut dest = r.new_image_destination(ctx).await.unwrap();

        let config_path = dir.join("config");
        std::fs::write(&config_path, b"{}").unwrap();
        let config = BlobInfo::new(Digest::from_bytes(b"{}"), 2, DOCKER_V2_SCHEMA2_CONFIG_MEDIA_TYPE);
        dest.put_blob(&config_path, &config, true).await.unwrap();

        let layer_path = dir.join("layer");
        std::fs::write(&layer_path, b"layer-data").unwrap();
        let layer = BlobInfo::new(
            Digest::from_bytes(b"layer-data"),
            10,
            DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE,
        );
        dest.put_blob(&layer_path, &layer, false).await.unwrap();
        assert!(dest.try_reuse_blob(&layer).await.unwrap().is_some());

        let manifest = Schema2::new(
            Descriptor::from_blob_info(&config),
            vec![Descriptor::from_blob_info(&layer)],
        );
        dest.put_manifest(&serde_json::to_vec(&manifest).unwrap(), DOCKER_V2_SCHEMA2_MEDIA_TYPE)
            .await
            .unwrap();
        dest.commit().await.unwrap();
        (config, layer)
    }

    #[test]
    fn test_parse_reference() {
        let r = ArchiveReference::parse("/tmp/a.tar:busybox").unwrap();
        assert_eq!(
            r.docker_reference().unwrap().to_string(),
            "docker.io/library/busybox:latest"
        );
        assert_eq!(
            r.string_within_transport(),
            "/tmp/a.tar:docker.io/library/busybox:latest"
        );
        assert_eq!(r.policy_configuration_identity(), "");
        assert!(ArchiveReference::parse(":busybox").is_err());
        assert!(ArchiveReference::parse(
            "/tmp/a.tar:busybox@sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0"
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("image.tar");
        let ctx = SystemContext {
            docker_archive_additional_tags: vec![
                DockerReference::parse_normalized_named("example.com/extra:v2").unwrap(),
            ],
            ..Default::default()
        };
        let (config, layer) =
            write_archive(dir.path(), &format!("{}:busybox:1", archive.display()), &ctx).await;

        let reader = ArchiveReader::open(&archive).unwrap();
        let item = reader.select(None).unwrap();
        assert_eq!(
            item.repo_tags.clone().unwrap(),
            vec!["docker.io/library/busybox:1", "example.com/extra:v2"]
        );
        assert_eq!(item.config, format!("{}.json", config.digest.hex()));

        let r = ArchiveReference::parse(&format!("{}:example.com/extra:v2", archive.display())).unwrap();
        let src = r.new_image_source(&SystemContext::default()).await.unwrap();
        let (data, mime) = src.get_manifest(None).await.unwrap();
        assert_eq!(mime, DOCKER_V2_SCHEMA2_MEDIA_TYPE);
        let parsed = Schema2::from_blob(&data).unwrap();
        assert_eq!(parsed.config.digest, config.digest);
        assert_eq!(parsed.layers[0].digest, layer.digest);
        assert_eq!(parsed.layers[0].media_type, DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED_MEDIA_TYPE);

        let mut out = Vec::new();
        src.get_blob(&layer, &mut out).await.unwrap();
        assert_eq!(out, b"layer-data");
    }

    #[tokio::test]
    async fn test_select_missing_tag() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("image.tar");
        write_archive(dir.path(), archive.to_str().unwrap(), &SystemContext::default()).await;
        let r = ArchiveReference::parse(&format!("{}:other:1", archive.display())).unwrap();
        assert!(r.new_image_source(&SystemContext::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_gzipped_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("image.tar");
        write_archive(dir.path(), archive.to_str().unwrap(), &SystemContext::default()).await;

        let gz = dir.path().join("image.tar.gz");
        let out = std::fs::File::create(&gz).unwrap();
        compression::gzip(std::fs::File::open(&archive).unwrap(), out).unwrap();

        let r = ArchiveReference::parse(gz.to_str().unwrap()).unwrap();
        let src = r.new_image_source(&SystemContext::default()).await.unwrap();
        assert!(src.get_manifest(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_destination_restrictions() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("image.tar");
        let r = ArchiveReference::parse(archive.to_str().unwrap()).unwrap();
        let dest = r.new_image_destination(&SystemContext::default()).await.unwrap();
        assert!(dest.signature_support().is_err());
        assert_eq!(dest.desired_layer_compression(), LayerCompression::Decompress);
        let err = dest
            .put_manifest(b"{}", manifest::OCI_MANIFEST_MEDIA_TYPE)
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::ManifestTypeRejected { .. }));

        std::fs::write(&archive, b"existing").unwrap();
        assert!(r.new_image_destination(&SystemContext::default()).await.is_err());
    }

    #[test]
    fn test_resolve_link() {
        assert_eq!(resolve_link("abc/layer.tar", "../def/layer.tar"), "def/layer.tar");
        assert_eq!(resolve_link("layer.tar", "/x.tar"), "x.tar");
    }
}
