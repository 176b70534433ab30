//! `oci-archive:` transport: an OCI layout packed in a tar file.
//!
//! Sources are unpacked into a temporary directory; destinations are built
//! as a layout in a temporary directory and packed on commit.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use skiff_core::error::{CopyError, Result};
use tempfile::TempDir;
use tokio::io::AsyncWrite;

use super::layout::{path_identity, path_identity_namespaces, Layout, LayoutDestination, LayoutSource};
use super::{resolve_path, split_path_and_image, ImageDestination, ImageReference, ImageSource, Transport};
use crate::compression::LayerCompression;
use crate::context::SystemContext;
use crate::digest::Digest;
use crate::manifest::BlobInfo;
use crate::reference::DockerReference;

#[derive(Debug, Clone)]
pub struct OciArchiveReference {
    path: String,
    resolved: PathBuf,
    image: Option<String>,
}

impl OciArchiveReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let (path, image) = split_path_and_image("oci-archive", reference)?;
        Ok(Self {
            resolved: resolve_path(Path::new(&path))?,
            path,
            image,
        })
    }

    fn temp_dir() -> Result<TempDir> {
        Ok(tempfile::Builder::new().prefix("oci").tempdir()?)
    }
}

#[async_trait]
impl ImageReference for OciArchiveReference {
    fn transport(&self) -> Transport {
        Transport::OciArchive
    }

    fn string_within_transport(&self) -> String {
        match &self.image {
            Some(image) => format!("{}:{}", self.path, image),
            None => self.path.clone(),
        }
    }

    fn docker_reference(&self) -> Option<&DockerReference> {
        None
    }

    fn policy_configuration_identity(&self) -> String {
        path_identity(&self.resolved, self.image.as_deref())
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        path_identity_namespaces(&self.resolved, self.image.as_deref())
    }

    async fn new_image_source(&self, ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        let tmp = Self::temp_dir()?;
        let archive = self.resolved.clone();
        let target = tmp.path().to_path_buf();
        tokio::task::spawn_blocking(move || unpack(&archive, &target))
            .await
            .map_err(|e| CopyError::Other(format!("unpack task failed: {e}")))??;

        let layout = Layout::new(tmp.path().to_path_buf(), self.image.clone(), ctx);
        let inner = LayoutSource::open(Box::new(self.clone()), layout).await?;
        Ok(Box::new(OciArchiveSource { inner, _tmp: tmp }))
    }

    async fn new_image_destination(&self, ctx: &SystemContext) -> Result<Box<dyn ImageDestination>> {
        let tmp = Self::temp_dir()?;
        let layout = Layout::new(tmp.path().to_path_buf(), self.image.clone(), ctx);
        let inner = LayoutDestination::create(Box::new(self.clone()), layout).await?;
        Ok(Box::new(OciArchiveDestination {
            inner,
            archive: self.resolved.clone(),
            tmp,
        }))
    }
}

fn unpack(archive: &Path, target: &Path) -> Result<()> {
    let file = std::fs::File::open(archive).map_err(|e| {
        CopyError::transport("oci-archive", format!("opening {}: {}", archive.display(), e))
    })?;
    tar::Archive::new(file).unpack(target).map_err(|e| {
        CopyError::transport("oci-archive", format!("unpacking {}: {}", archive.display(), e))
    })
}

/// Tar the contents of `dir` (not `dir` itself) into `archive`.
fn pack(dir: &Path, archive: &Path) -> Result<()> {
    let file = std::fs::File::create(archive).map_err(|e| {
        CopyError::transport("oci-archive", format!("creating {}: {}", archive.display(), e))
    })?;
    let mut builder = tar::Builder::new(file);
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        if entry.file_type()?.is_dir() {
            builder.append_dir_all(&name, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }
    builder.into_inner()?.sync_all()?;
    Ok(())
}

pub struct OciArchiveSource {
    inner: LayoutSource,
    _tmp: TempDir,
}

#[async_trait]
impl ImageSource for OciArchiveSource {
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

    async fn get_signatures(&self, instance: Option<&Digest>) -> Result<Vec<Vec<u8>>> {
        self.inner.get_signatures(instance).await
    }
}

pub struct OciArchiveDestination {
    inner: LayoutDestination,
    archive: PathBuf,
    tmp: TempDir,
}

#[async_trait]
impl ImageDestination for OciArchiveDestination {
    fn reference(&self) -> &dyn ImageReference {
        self.inner.reference()
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        self.inner.supported_manifest_mime_types()
    }

    fn signature_support(&self) -> Result<()> {
        self.inner.signature_support()
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        self.inner.desired_layer_compression()
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        self.inner.accepts_foreign_layer_urls()
    }

    async fn try_reuse_blob(&self, info: &BlobInfo) -> Result<Option<BlobInfo>> {
        self.inner.try_reuse_blob(info).await
    }

    async fn put_blob(&self, path: &Path, info: &BlobInfo, is_config: bool) -> Result<BlobInfo> {
        self.inner.put_blob(path, info, is_config).await
    }

    async fn put_manifest(&self, manifest: &[u8], mime_type: &str) -> Result<()> {
        self.inner.put_manifest(manifest, mime_type).await
    }

    async fn put_signatures(&self, signatures: &[Vec<u8>]) -> Result<()> {
        self.inner.put_signatures(signatures).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await?;
        let dir = self.tmp.path().to_path_buf();
        let archive = self.archive.clone();
        tokio::task::spawn_blocking(move || pack(&dir, &archive))
            .await
            .map_err(|e| CopyError::Other(format!("pack task failed: {e}")))??;
        tracing::debug!(archive = %self.archive.display(), "Wrote OCI archive");
        Ok(())
    }
}
