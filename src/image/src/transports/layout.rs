//! `oci:` transport: an OCI image layout directory.
//!
//! Images are located through `index.json`; an optional `path:name`
//! suffix selects the entry annotated with `org.opencontainers.image.ref.name`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use skiff_core::error::{CopyError, Result};
use tokio::io::AsyncWrite;

use super::dir::copy_atomic;
use super::{
    path_namespaces, resolve_path, split_path_and_image, ImageDestination, ImageReference,
    ImageSource, Transport,
};
use crate::compression::LayerCompression;
use crate::context::SystemContext;
use crate::digest::Digest;
use crate::manifest::{
    self, BlobInfo, Descriptor, ManifestList, OCI_MANIFEST_MEDIA_TYPE, OCI_REF_NAME_ANNOTATION,
};
use crate::reference::DockerReference;

const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
pub struct LayoutReference {
    path: String,
    resolved: PathBuf,
    image: Option<String>,
}

impl LayoutReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let (path, image) = split_path_and_image("oci", reference)?;
        Ok(Self {
            resolved: resolve_path(Path::new(&path))?,
            path,
            image,
        })
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }
}

/// Identity of a path-based reference: `resolved[:image]`.
pub(crate) fn path_identity(resolved: &Path, image: Option<&str>) -> String {
    let dir = resolved.to_string_lossy();
    match image {
        Some(image) => format!("{dir}:{image}"),
        None => dir.to_string(),
    }
}

/// Namespaces of a path-based reference: the bare path when an image name
/// is present, then the parent directories.
pub(crate) fn path_identity_namespaces(resolved: &Path, image: Option<&str>) -> Vec<String> {
    let dir = resolved.to_string_lossy().to_string();
    let mut namespaces = Vec::new();
    if image.is_some() {
        namespaces.push(dir.clone());
    }
    namespaces.extend(path_namespaces(&dir));
    namespaces
}

#[async_trait]
impl ImageReference for LayoutReference {
    fn transport(&self) -> Transport {
        Transport::Oci
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
        path_identity(&self.resolved, self.image())
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        path_identity_namespaces(&self.resolved, self.image())
    }

    async fn new_image_source(&self, ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        let layout = Layout::new(self.resolved.clone(), self.image.clone(), ctx);
        Ok(Box::new(
            LayoutSource::open(Box::new(self.clone()), layout).await?,
        ))
    }

    async fn new_image_destination(&self, ctx: &SystemContext) -> Result<Box<dyn ImageDestination>> {
        let layout = Layout::new(self.resolved.clone(), self.image.clone(), ctx);
        Ok(Box::new(
            LayoutDestination::create(Box::new(self.clone()), layout).await?,
        ))
    }
}

/// File locations within one layout directory.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    dir: PathBuf,
    image: Option<String>,
    shared_blobs: Option<PathBuf>,
}

impl Layout {
    pub(crate) fn new(dir: PathBuf, image: Option<String>, ctx: &SystemContext) -> Self {
        Self {
            dir,
            image,
            shared_blobs: ctx.oci_shared_blob_dir.clone(),
        }
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let base = match &self.shared_blobs {
            Some(shared) => shared.clone(),
            None => self.dir.join("blobs"),
        };
        base.join(digest.algorithm().as_str()).join(digest.hex())
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    async fn read_index(&self) -> Result<ManifestList> {
        let path = self.index_path();
        let data = tokio::fs::read(&path).await.map_err(|e| {
            CopyError::transport("oci", format!("reading {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// The index entry selected by the image name, or the only entry.
    fn select(&self, index: &ManifestList) -> Result<Descriptor> {
        match &self.image {
            Some(name) => index
                .manifests
                .iter()
                .find(|d| {
                    d.annotations
                        .as_ref()
                        .and_then(|a| a.get(OCI_REF_NAME_ANNOTATION))
                        .is_some_and(|n| n == name)
                })
                .cloned()
                .ok_or_else(|| {
                    CopyError::transport("oci", format!("no descriptor found for reference \"{name}\""))
                }),
            None => match index.manifests.as_slice() {
                [only] => Ok(only.clone()),
                [] => Err(CopyError::transport("oci", "no images in the layout index")),
                _ => Err(CopyError::transport(
                    "oci",
                    "more than one image in the layout index, choose an image",
                )),
            },
        }
    }
}

pub struct LayoutSource {
    reference: Box<dyn ImageReference>,
    layout: Layout,
    descriptor: Descriptor,
}

impl LayoutSource {
    pub(crate) async fn open(reference: Box<dyn ImageReference>, layout: Layout) -> Result<Self> {
        let index = layout.read_index().await?;
        let descriptor = layout.select(&index)?;
        Ok(Self {
            reference,
            layout,
            descriptor,
        })
    }
}

#[async_trait]
impl ImageSource for LayoutSource {
    fn reference(&self) -> &dyn ImageReference {
        self.reference.as_ref()
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        let digest = instance.unwrap_or(&self.descriptor.digest);
        let data = tokio::fs::read(self.layout.blob_path(digest)).await?;
        let mime_type = match instance {
            None if !self.descriptor.media_type.is_empty() => self.descriptor.media_type.clone(),
            _ => manifest::guess_mime_type(&data),
        };
        Ok((data, mime_type))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let path = self.layout.blob_path(&info.digest);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            CopyError::transport("oci", format!("opening blob {}: {}", path.display(), e))
        })?;
        Ok(tokio::io::copy(&mut file, writer).await?)
    }

    async fn get_signatures(&self, _instance: Option<&Digest>) -> Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}

pub struct LayoutDestination {
    reference: Box<dyn ImageReference>,
    layout: Layout,
    pending: Mutex<Option<Descriptor>>,
}

impl LayoutDestination {
    pub(crate) async fn create(reference: Box<dyn ImageReference>, layout: Layout) -> Result<Self> {
        tokio::fs::create_dir_all(&layout.dir).await.map_err(|e| {
            CopyError::transport("oci", format!("creating {}: {}", layout.dir.display(), e))
        })?;
        let marker = serde_json::to_vec(&json!({ "imageLayoutVersion": LAYOUT_VERSION }))?;
        tokio::fs::write(layout.dir.join("oci-layout"), marker).await?;
        Ok(Self {
            reference,
            layout,
            pending: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ImageDestination for LayoutDestination {
    fn reference(&self) -> &dyn ImageReference {
        self.reference.as_ref()
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        vec![OCI_MANIFEST_MEDIA_TYPE.to_string()]
    }

    fn signature_support(&self) -> Result<()> {
        Err(CopyError::transport(
            "oci",
            "Pushing signatures for OCI images is not supported",
        ))
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        LayerCompression::Preserve
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        true
    }

    async fn try_reuse_blob(&self, info: &BlobInfo) -> Result<Option<BlobInfo>> {
        match tokio::fs::metadata(self.layout.blob_path(&info.digest)).await {
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
        let dest = self.layout.blob_path(&info.digest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        copy_atomic(path, &dest).await?;
        Ok(info.clone())
    }

    async fn put_manifest(&self, manifest: &[u8], mime_type: &str) -> Result<()> {
        let mime_type = manifest::normalize_mime_type(mime_type, manifest);
        if mime_type != OCI_MANIFEST_MEDIA_TYPE {
            return Err(CopyError::ManifestTypeRejected {
                mime_type,
                reason: "OCI layouts only store OCI image manifests".to_string(),
            });
        }
        let digest = Digest::from_bytes(manifest);
        let path = self.layout.blob_path(&digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, manifest).await?;

        let mut info = BlobInfo::new(digest, manifest.len() as i64, mime_type);
        if let Some(name) = &self.layout.image {
            info.annotations
                .insert(OCI_REF_NAME_ANNOTATION.to_string(), name.clone());
        }
        *self.pending.lock() = Some(Descriptor::from_blob_info(&info));
        Ok(())
    }

    async fn put_signatures(&self, signatures: &[Vec<u8>]) -> Result<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        self.signature_support()
    }

    async fn commit(&mut self) -> Result<()> {
        let Some(descriptor) = self.pending.lock().take() else {
            return Err(CopyError::transport("oci", "no manifest was written"));
        };
        let mut index = if self.layout.index_path().exists() {
            self.layout.read_index().await?
        } else {
            ManifestList::new_oci_index()
        };
        if let Some(name) = &self.layout.image {
            index.manifests.retain(|d| {
                d.annotations
                    .as_ref()
                    .and_then(|a| a.get(OCI_REF_NAME_ANNOTATION))
                    != Some(name)
            });
        }
        index.manifests.push(descriptor);

        let data = serde_json::to_vec(&index)?;
        let path = self.layout.index_path();
        let tmp = path.with_file_name(".index.json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %self.layout.dir.display(), "Wrote OCI layout index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &[u8] = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","size":2,"digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"},"layers":[]}"#;

    async fn write_image(root: &Path, name: Option<&str>) {
        let reference = match name {
            Some(n) => format!("{}:{}", root.display(), n),
            None => root.display().to_string(),
        };
        let r = LayoutReference::parse(&reference).unwrap();
        let mut dest = r.new_image_destination(&SystemContext::default()).await.unwrap();
        dest.put_manifest(MANIFEST, OCI_MANIFEST_MEDIA_TYPE).await.unwrap();
        dest.commit().await.unwrap();
    }

    #[test]
    fn test_reference_identity() {
        let r = LayoutReference::parse("/tmp/skiff-layout-test:v1").unwrap();
        assert_eq!(r.string_within_transport(), "/tmp/skiff-layout-test:v1");
        assert!(r.policy_configuration_identity().ends_with("skiff-layout-test:v1"));
        let ns = r.policy_configuration_namespaces();
        assert!(ns[0].ends_with("skiff-layout-test"));
        assert!(LayoutReference::parse(":v1").is_err());
    }

    #[tokio::test]
    async fn test_write_and_select_by_name() {
        let dir = TempDir::new().unwrap();
        write_image(dir.path(), Some("v1")).await;
        write_image(dir.path(), Some("v2")).await;
        write_image(dir.path(), Some("v1")).await;

        let index: ManifestList =
            serde_json::from_slice(&std::fs::read(dir.path().join("index.json")).unwrap()).unwrap();
        assert_eq!(index.manifests.len(), 2);
        assert!(dir.path().join("oci-layout").exists());

        let r = LayoutReference::parse(&format!("{}:v2", dir.path().display())).unwrap();
        let src = r.new_image_source(&SystemContext::default()).await.unwrap();
        let (data, mime) = src.get_manifest(None).await.unwrap();
        assert_eq!(data, MANIFEST);
        assert_eq!(mime, OCI_MANIFEST_MEDIA_TYPE);

        let r = LayoutReference::parse(&format!("{}:missing", dir.path().display())).unwrap();
        assert!(r.new_image_source(&SystemContext::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_unnamed_source_needs_single_image() {
        let dir = TempDir::new().unwrap();
        write_image(dir.path(), Some("v1")).await;
        let r = LayoutReference::parse(dir.path().to_str().unwrap()).unwrap();
        assert!(r.new_image_source(&SystemContext::default()).await.is_ok());

        write_image(dir.path(), Some("v2")).await;
        let err = r.new_image_source(&SystemContext::default()).await.err().unwrap();
        assert!(err.to_string().contains("more than one image"));
    }

    #[tokio::test]
    async fn test_rejects_docker_manifest_and_signatures() {
        let dir = TempDir::new().unwrap();
        let r = LayoutReference::parse(dir.path().to_str().unwrap()).unwrap();
        let dest = r.new_image_destination(&SystemContext::default()).await.unwrap();
        let err = dest
            .put_manifest(b"{}", manifest::DOCKER_V2_SCHEMA2_MEDIA_TYPE)
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::ManifestTypeRejected { .. }));
        assert!(dest.signature_support().is_err());
    }

    #[tokio::test]
    async fn test_shared_blob_dir() {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("shared");
        let ctx = SystemContext {
            oci_shared_blob_dir: Some(shared.clone()),
            ..Default::default()
        };
        let r = LayoutReference::parse(dir.path().join("l").to_str().unwrap()).unwrap();
        let dest = r.new_image_destination(&ctx).await.unwrap();
        let spool = dir.path().join("spool");
        std::fs::write(&spool, b"data").unwrap();
        let info = BlobInfo::new(Digest::from_bytes(b"data"), 4, "");
        dest.put_blob(&spool, &info, false).await.unwrap();
        assert!(shared.join("sha256").join(info.digest.hex()).exists());
    }
}
