//! Image transports: where images are read from and written to.
//!
//! An image name is `transport:details`. Each transport parses `details`
//! into an [`ImageReference`], which can open an [`ImageSource`] or an
//! [`ImageDestination`].

pub mod daemon;
pub mod dir;
pub mod docker_archive;
pub mod layout;
pub mod oci_archive;
pub mod registry;

use std::fmt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use skiff_core::error::{CopyError, Result};
use tokio::io::AsyncWrite;

use crate::compression::LayerCompression;
use crate::context::SystemContext;
use crate::digest::Digest;
use crate::manifest::BlobInfo;
use crate::reference::DockerReference;

/// Supported transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Dir,
    Docker,
    DockerArchive,
    DockerDaemon,
    Oci,
    OciArchive,
}

impl Transport {
    pub const ALL: [Transport; 6] = [
        Transport::Dir,
        Transport::Docker,
        Transport::DockerArchive,
        Transport::DockerDaemon,
        Transport::Oci,
        Transport::OciArchive,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Dir => "dir",
            Transport::Docker => "docker",
            Transport::DockerArchive => "docker-archive",
            Transport::DockerDaemon => "docker-daemon",
            Transport::Oci => "oci",
            Transport::OciArchive => "oci-archive",
        }
    }

    /// Parse the part of an image name after `transport:`.
    pub fn parse_reference(&self, reference: &str) -> Result<Box<dyn ImageReference>> {
        match self {
            Transport::Dir => Ok(Box::new(dir::DirReference::parse(reference)?)),
            Transport::Docker => Ok(Box::new(registry::RegistryReference::parse(reference)?)),
            Transport::DockerArchive => {
                Ok(Box::new(docker_archive::ArchiveReference::parse(reference)?))
            }
            Transport::DockerDaemon => Ok(Box::new(daemon::DaemonReference::parse(reference)?)),
            Transport::Oci => Ok(Box::new(layout::LayoutReference::parse(reference)?)),
            Transport::OciArchive => {
                Ok(Box::new(oci_archive::OciArchiveReference::parse(reference)?))
            }
        }
    }

    /// Check a policy scope for this transport (`""` is always valid).
    pub fn validate_policy_scope(&self, scope: &str) -> Result<()> {
        if scope.is_empty() {
            return Ok(());
        }
        match self {
            Transport::Docker => registry::validate_policy_scope(scope),
            Transport::Dir | Transport::Oci | Transport::OciArchive => {
                validate_path_scope(self.name(), scope)
            }
            Transport::DockerArchive | Transport::DockerDaemon => Err(CopyError::PolicyError(format!(
                "{}: does not support any scopes except the default \"\" one",
                self.name()
            ))),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<&str> for Transport {
    type Error = CopyError;

    fn try_from(name: &str) -> Result<Self> {
        Transport::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| CopyError::ReferenceError(format!("unknown transport \"{name}\"")))
    }
}

/// Names of all supported transports, sorted.
pub fn list_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Transport::ALL.iter().map(Transport::name).collect();
    names.sort_unstable();
    names
}

/// Parse `transport:details` into a reference.
pub fn parse_image_name(name: &str) -> Result<Box<dyn ImageReference>> {
    let (transport, details) = name.split_once(':').ok_or_else(|| CopyError::InvalidImageName {
        name: name.to_string(),
        reason: "expected colon-separated transport:reference".to_string(),
    })?;
    let transport = Transport::try_from(transport).map_err(|_| CopyError::InvalidImageName {
        name: name.to_string(),
        reason: format!("unknown transport \"{transport}\""),
    })?;
    transport.parse_reference(details)
}

/// Full `transport:reference` name of an image.
pub fn image_name(reference: &dyn ImageReference) -> String {
    format!(
        "{}:{}",
        reference.transport(),
        reference.string_within_transport()
    )
}

/// A parsed reference to an image within one transport.
#[async_trait]
pub trait ImageReference: Send + Sync + fmt::Debug {
    fn transport(&self) -> Transport;

    /// The reference without the `transport:` prefix; parsing it again
    /// yields an equivalent reference.
    fn string_within_transport(&self) -> String;

    /// The docker reference the image is known by, if any.
    fn docker_reference(&self) -> Option<&DockerReference>;

    /// Scope identifying this exact image in a trust policy. Empty when the
    /// transport has no scopes.
    fn policy_configuration_identity(&self) -> String;

    /// Less specific scopes, most specific first.
    fn policy_configuration_namespaces(&self) -> Vec<String>;

    async fn new_image_source(&self, ctx: &SystemContext) -> Result<Box<dyn ImageSource>>;

    async fn new_image_destination(&self, ctx: &SystemContext) -> Result<Box<dyn ImageDestination>>;
}

/// Read side of a transport.
#[async_trait]
pub trait ImageSource: Send + Sync {
    fn reference(&self) -> &dyn ImageReference;

    /// The manifest and its media type. `instance` selects an entry of a
    /// manifest list; `None` returns the top-level manifest.
    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)>;

    /// Stream a blob into `writer`, returning the number of bytes written.
    async fn get_blob(
        &self,
        info: &BlobInfo,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;

    /// Signatures of the manifest (or of `instance`).
    async fn get_signatures(&self, instance: Option<&Digest>) -> Result<Vec<Vec<u8>>>;
}

/// Write side of a transport. Blobs may be written concurrently.
#[async_trait]
pub trait ImageDestination: Send + Sync {
    fn reference(&self) -> &dyn ImageReference;

    /// Manifest types accepted, most preferred first. Empty means any.
    fn supported_manifest_mime_types(&self) -> Vec<String>;

    /// `Ok` if signatures can be stored, otherwise the reason they cannot.
    fn signature_support(&self) -> Result<()>;

    fn desired_layer_compression(&self) -> LayerCompression;

    /// Whether layers with `urls` may be left in place instead of copied.
    fn accepts_foreign_layer_urls(&self) -> bool;

    /// If the destination already holds `info`, its stored form.
    async fn try_reuse_blob(&self, info: &BlobInfo) -> Result<Option<BlobInfo>>;

    /// Store the verified blob at `path`, returning what was stored.
    async fn put_blob(&self, path: &Path, info: &BlobInfo, is_config: bool) -> Result<BlobInfo>;

    /// Store the manifest. Fails with `ManifestTypeRejected` when the type
    /// is refused and another type may succeed.
    async fn put_manifest(&self, manifest: &[u8], mime_type: &str) -> Result<()>;

    async fn put_signatures(&self, signatures: &[Vec<u8>]) -> Result<()>;

    /// Finish writing; nothing is guaranteed to be visible before this.
    async fn commit(&mut self) -> Result<()>;
}

/// Make `path` absolute and lexically clean, resolving symlinks in the
/// longest existing prefix.
pub(crate) fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let clean = clean_path(&absolute);

    let mut existing = clean.as_path();
    let mut rest = Vec::new();
    loop {
        if existing.exists() {
            let mut resolved = existing.canonicalize()?;
            for part in rest.iter().rev() {
                resolved.push(part);
            }
            return Ok(resolved);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(clean),
        }
    }
}

fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Parent directories of an absolute path, longest first, excluding `/`.
pub(crate) fn path_namespaces(path: &str) -> Vec<String> {
    let mut namespaces = Vec::new();
    let mut current = path;
    while let Some(idx) = current.rfind('/') {
        if idx == 0 {
            break;
        }
        current = &current[..idx];
        namespaces.push(current.to_string());
    }
    namespaces
}

fn validate_path_scope(transport: &str, scope: &str) -> Result<()> {
    let path = scope.split(':').next().unwrap_or(scope);
    if !path.starts_with('/') {
        return Err(CopyError::PolicyError(format!(
            "{transport}: invalid scope \"{scope}\": must be an absolute path"
        )));
    }
    if path == "/" {
        return Err(CopyError::PolicyError(format!(
            "{transport}: invalid scope \"{scope}\": use the default \"\" scope instead of \"/\""
        )));
    }
    if clean_path(Path::new(path)).to_string_lossy() != path {
        return Err(CopyError::PolicyError(format!(
            "{transport}: invalid scope \"{scope}\": uses non-canonical format"
        )));
    }
    Ok(())
}

/// Split `path[:image]` at the first colon; the image part must be valid.
pub(crate) fn split_path_and_image(transport: &str, reference: &str) -> Result<(String, Option<String>)> {
    let (path, image) = match reference.split_once(':') {
        Some((p, i)) => (p, Some(i)),
        None => (reference, None),
    };
    if path.is_empty() {
        return Err(CopyError::transport(transport, "path can not be empty"));
    }
    if let Some(image) = image {
        if !is_valid_oci_ref_name(image) {
            return Err(CopyError::transport(
                transport,
                format!("Invalid image name \"{image}\""),
            ));
        }
    }
    Ok((path.to_string(), image.filter(|i| !i.is_empty()).map(str::to_string)))
}

/// `[A-Za-z0-9._-]+` components separated by one of `:/@`.
fn is_valid_oci_ref_name(name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    name.split(|c| c == ':' || c == '/' || c == '@').all(|part| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    })
}
