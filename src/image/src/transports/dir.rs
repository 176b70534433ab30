//! `dir:` transport: an image as plain files in a directory.
//!
//! ```text
//! path/
//!   version            "Directory Transport Version: 1.1\n"
//!   manifest.json
//!   <hex>              one file per blob, named by digest
//!   signature-1 ...    optional signatures
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use skiff_core::error::{CopyError, Result};
use tokio::io::AsyncWrite;

use super::{path_namespaces, resolve_path, ImageDestination, ImageReference, ImageSource, Transport};
use crate::compression::LayerCompression;
use crate::context::SystemContext;
use crate::digest::Digest;
use crate::manifest::{self, BlobInfo};
use crate::reference::DockerReference;

pub const VERSION: &str = "Directory Transport Version: 1.1\n";
const VERSION_1_0: &str = "Directory Transport Version: 1.0\n";

#[derive(Debug, Clone)]
pub struct DirReference {
    path: String,
    resolved: PathBuf,
}

impl DirReference {
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(CopyError::transport("dir", "path can not be empty"));
        }
        Ok(Self {
            path: reference.to_string(),
            resolved: resolve_path(Path::new(reference))?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.resolved
    }

    fn manifest_path(&self, instance: Option<&Digest>) -> PathBuf {
        match instance {
            Some(d) => self.resolved.join(format!("{}.manifest.json", d.hex())),
            None => self.resolved.join("manifest.json"),
        }
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.resolved.join(digest.hex())
    }

    fn signature_path(&self, instance: Option<&Digest>, index: usize) -> PathBuf {
        match instance {
            Some(d) => self.resolved.join(format!("{}.signature-{}", d.hex(), index)),
            None => self.resolved.join(format!("signature-{index}")),
        }
    }

    fn version_path(&self) -> PathBuf {
        self.resolved.join("version")
    }
}

#[async_trait]
impl ImageReference for DirReference {
    fn transport(&self) -> Transport {
        Transport::Dir
    }

    fn string_within_transport(&self) -> String {
        self.path.clone()
    }

    fn docker_reference(&self) -> Option<&DockerReference> {
        None
    }

    fn policy_configuration_identity(&self) -> String {
        self.resolved.to_string_lossy().to_string()
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        path_namespaces(&self.policy_configuration_identity())
    }

    async fn new_image_source(&self, _ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        Ok(Box::new(DirSource {
            reference: self.clone(),
        }))
    }

    async fn new_image_destination(&self, ctx: &SystemContext) -> Result<Box<dyn ImageDestination>> {
        Ok(Box::new(DirDestination::create(self.clone(), ctx.dir_force_compress).await?))
    }
}

pub struct DirSource {
    reference: DirReference,
}

#[async_trait]
impl ImageSource for DirSource {
    fn reference(&self) -> &dyn ImageReference {
        &self.reference
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        let path = self.reference.manifest_path(instance);
        let data = tokio::fs::read(&path).await.map_err(|e| {
            CopyError::transport("dir", format!("reading {}: {}", path.display(), e))
        })?;
        let mime_type = manifest::guess_mime_type(&data);
        Ok((data, mime_type))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let path = self.reference.blob_path(&info.digest);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            CopyError::transport("dir", format!("opening blob {}: {}", path.display(), e))
        })?;
        Ok(tokio::io::copy(&mut file, writer).await?)
    }

    async fn get_signatures(&self, instance: Option<&Digest>) -> Result<Vec<Vec<u8>>> {
        let mut signatures = Vec::new();
        for index in 1.. {
            match tokio::fs::read(self.reference.signature_path(instance, index)).await {
                Ok(data) => signatures.push(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(signatures)
    }
}

pub struct DirDestination {
    reference: DirReference,
    compress: bool,
}

impl DirDestination {
    /// Prepare the directory: create it, or clear a previous `dir:` image.
    /// A non-empty directory that is not a `dir:` image is refused.
    async fn create(reference: DirReference, compress: bool) -> Result<Self> {
        let dir = reference.path().to_path_buf();
        if dir.exists() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            let non_empty = entries.next_entry().await?.is_some();
            if non_empty {
                let version = tokio::fs::read_to_string(reference.version_path()).await.ok();
                match version.as_deref() {
                    Some(VERSION) | Some(VERSION_1_0) => {
                        tracing::debug!(path = %dir.display(), "Replacing previous dir: image");
                        remove_dir_contents(&dir).await?;
                    }
                    _ => {
                        return Err(CopyError::transport(
                            "dir",
                            format!(
                                "non-empty directory \"{}\" does not contain an image written by this transport",
                                dir.display()
                            ),
                        ))
                    }
                }
            }
        } else {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                CopyError::transport("dir", format!("creating {}: {}", dir.display(), e))
            })?;
        }
        tokio::fs::write(reference.version_path(), VERSION).await?;
        Ok(Self {
            reference,
            compress,
        })
    }
}

async fn remove_dir_contents(dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

/// Copy `src` to `dest` through a temporary file in the same directory.
pub(crate) async fn copy_atomic(src: &Path, dest: &Path) -> Result<()> {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dest.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::copy(src, &tmp).await?;
    tokio::fs::rename(&tmp, dest).await?;
    Ok(())
}

#[async_trait]
impl ImageDestination for DirDestination {
    fn reference(&self) -> &dyn ImageReference {
        &self.reference
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        Vec::new()
    }

    fn signature_support(&self) -> Result<()> {
        Ok(())
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        if self.compress {
            LayerCompression::Compress
        } else {
            LayerCompression::Preserve
        }
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        false
    }

    async fn try_reuse_blob(&self, info: &BlobInfo) -> Result<Option<BlobInfo>> {
        let path = self.reference.blob_path(&info.digest);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let mut found = info.clone();
                found.size = meta.len() as i64;
                Ok(Some(found))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_blob(&self, path: &Path, info: &BlobInfo, _is_config: bool) -> Result<BlobInfo> {
        copy_atomic(path, &self.reference.blob_path(&info.digest)).await?;
        Ok(info.clone())
    }

    async fn put_manifest(&self, manifest: &[u8], _mime_type: &str) -> Result<()> {
        tokio::fs::write(self.reference.manifest_path(None), manifest).await?;
        Ok(())
    }

    async fn put_signatures(&self, signatures: &[Vec<u8>]) -> Result<()> {
        for (i, sig) in signatures.iter().enumerate() {
            tokio::fs::write(self.reference.signature_path(None, i + 1), sig).await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reference_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        let r = DirReference::parse(path.to_str().unwrap()).unwrap();
        let resolved = dir.path().canonicalize().unwrap().join("img");
        assert_eq!(r.policy_configuration_identity(), resolved.to_string_lossy());
        assert_eq!(
            r.policy_configuration_namespaces()[0],
            dir.path().canonicalize().unwrap().to_string_lossy()
        );
        assert!(r.docker_reference().is_none());
        assert!(DirReference::parse("").is_err());
    }

    #[tokio::test]
    async fn test_destination_writes_layout() {
        let dir = TempDir::new().unwrap();
        let r = DirReference::parse(dir.path().join("img").to_str().unwrap()).unwrap();
        let mut dest = r.new_image_destination(&SystemContext::default()).await.unwrap();

        let blob = dir.path().join("spool");
        std::fs::write(&blob, b"layer").unwrap();
        let info = BlobInfo::new(Digest::from_bytes(b"layer"), 5, "");
        assert!(dest.try_reuse_blob(&info).await.unwrap().is_none());
        dest.put_blob(&blob, &info, false).await.unwrap();
        assert!(dest.try_reuse_blob(&info).await.unwrap().is_some());

        dest.put_manifest(b"{\"schemaVersion\":2}", "").await.unwrap();
        dest.put_signatures(&[b"sig".to_vec()]).await.unwrap();
        dest.commit().await.unwrap();

        let root = r.path();
        assert_eq!(std::fs::read_to_string(root.join("version")).unwrap(), VERSION);
        assert_eq!(std::fs::read(root.join(info.digest.hex())).unwrap(), b"layer");
        assert_eq!(std::fs::read(root.join("signature-1")).unwrap(), b"sig");

        let src = r.new_image_source(&SystemContext::default()).await.unwrap();
        let (manifest, _) = src.get_manifest(None).await.unwrap();
        assert_eq!(manifest, b"{\"schemaVersion\":2}");
        let mut out = Vec::new();
        assert_eq!(src.get_blob(&info, &mut out).await.unwrap(), 5);
        assert_eq!(out, b"layer");
        assert_eq!(src.get_signatures(None).await.unwrap(), vec![b"sig".to_vec()]);
    }

    #[tokio::test]
    async fn test_destination_refuses_foreign_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();
        let r = DirReference::parse(dir.path().to_str().unwrap()).unwrap();
        assert!(r.new_image_destination(&SystemContext::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_destination_replaces_previous_image() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("version"), VERSION).unwrap();
        std::fs::write(dir.path().join("stale"), b"x").unwrap();
        let r = DirReference::parse(dir.path().to_str().unwrap()).unwrap();
        r.new_image_destination(&SystemContext::default()).await.unwrap();
        assert!(!dir.path().join("stale").exists());
        assert!(dir.path().join("version").exists());
    }

    #[tokio::test]
    async fn test_force_compress() {
        let dir = TempDir::new().unwrap();
        let r = DirReference::parse(dir.path().join("img").to_str().unwrap()).unwrap();
        let ctx = SystemContext {
            dir_force_compress: true,
            ..Default::default()
        };
        let dest = r.new_image_destination(&ctx).await.unwrap();
        assert_eq!(dest.desired_layer_compression(), LayerCompression::Compress);
    }
}
