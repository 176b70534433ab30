//! `docker://` transport: container registries.
//!
//! Uses the `oci-distribution` crate to talk to registries (Docker Hub,
//! Quay, GHCR, ...). Manifests are moved in raw form so their digests are
//! preserved; signatures live in lookaside storage configured by
//! `registries.d`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use oci_distribution::client::{
    Certificate, CertificateEncoding, ClientConfig, ClientProtocol,
};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use parking_lot::Mutex;
use skiff_core::error::{CopyError, Result};
use tokio::io::AsyncWrite;

use super::{ImageDestination, ImageReference, ImageSource, Transport};
use crate::auth;
use crate::compression::LayerCompression;
use crate::context::SystemContext;
use crate::digest::{Algorithm, Digest, DigestingWriter};
use crate::lookaside::{RegistryConfiguration, SignatureStorage};
use crate::manifest::{self, BlobInfo};
use crate::reference::DockerReference;

/// System directories searched for per-registry certificates.
const CERT_DIRS: &[&str] = &["/etc/containers/certs.d", "/etc/docker/certs.d"];

#[derive(Debug, Clone)]
pub struct RegistryReference {
    docker_ref: DockerReference,
}

impl RegistryReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let name = reference.strip_prefix("//").ok_or_else(|| {
            CopyError::ReferenceError(format!(
                "docker: image reference {reference} does not start with \"//\""
            ))
        })?;
        let docker_ref = DockerReference::parse_normalized_named(name)?;
        if docker_ref.tag.is_some() && docker_ref.digest.is_some() {
            return Err(CopyError::ReferenceError(
                "Docker references with both a tag and digest are currently not supported".to_string(),
            ));
        }
        Ok(Self {
            docker_ref: docker_ref.with_default_tag(),
        })
    }

    fn to_oci_reference(&self) -> Reference {
        let r = &self.docker_ref;
        match (&r.digest, &r.tag) {
            (Some(digest), _) => {
                Reference::with_digest(r.domain.clone(), r.path.clone(), digest.to_string())
            }
            (None, tag) => Reference::with_tag(
                r.domain.clone(),
                r.path.clone(),
                tag.clone().unwrap_or_else(|| "latest".to_string()),
            ),
        }
    }

    fn digest_reference(&self, digest: &Digest) -> Reference {
        Reference::with_digest(
            self.docker_ref.domain.clone(),
            self.docker_ref.path.clone(),
            digest.to_string(),
        )
    }

    fn registry_error(&self, message: impl Into<String>) -> CopyError {
        CopyError::RegistryError {
            registry: self.docker_ref.domain.clone(),
            message: message.into(),
        }
    }
}

/// Check a `docker` policy scope: a hostname, a `*.domain` wildcard, or a
/// canonical repository or reference.
pub fn validate_policy_scope(scope: &str) -> Result<()> {
    let invalid = |reason: &str| {
        CopyError::PolicyError(format!("docker: invalid scope \"{scope}\": {reason}"))
    };
    if let Some(domain) = scope.strip_prefix("*.") {
        if domain.is_empty() || !is_hostname(domain) {
            return Err(invalid("invalid wildcard domain"));
        }
        return Ok(());
    }
    if !scope.contains('/') {
        return if is_hostname(scope) {
            Ok(())
        } else {
            Err(invalid("invalid hostname"))
        };
    }
    let parsed = DockerReference::parse_normalized_named(scope).map_err(|e| invalid(&e.to_string()))?;
    let canonical = if parsed.is_name_only() {
        parsed.name()
    } else {
        parsed.to_string()
    };
    if canonical != scope {
        return Err(invalid(&format!("non-canonical form, use \"{canonical}\"")));
    }
    Ok(())
}

fn is_hostname(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == ':')
}

#[async_trait]
impl ImageReference for RegistryReference {
    fn transport(&self) -> Transport {
        Transport::Docker
    }

    fn string_within_transport(&self) -> String {
        format!("//{}", self.docker_ref)
    }

    fn docker_reference(&self) -> Option<&DockerReference> {
        Some(&self.docker_ref)
    }

    fn policy_configuration_identity(&self) -> String {
        self.docker_ref.to_string()
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        self.docker_ref.policy_namespaces()
    }

    async fn new_image_source(&self, ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        let session = RegistrySession::new(self, ctx)?;
        let lookaside = RegistryConfiguration::load(ctx)?.signature_storage(&self.docker_ref, false)?;
        Ok(Box::new(RegistrySource {
            reference: self.clone(),
            session,
            lookaside,
            manifest_digest: Mutex::new(None),
        }))
    }

    async fn new_image_destination(&self, ctx: &SystemContext) -> Result<Box<dyn ImageDestination>> {
        let session = RegistrySession::new(self, ctx)?;
        session
            .client
            .auth(&self.to_oci_reference(), &session.auth, RegistryOperation::Push)
            .await
            .map_err(|e| self.registry_error(format!("Failed to authenticate: {e}")))?;
        let lookaside = RegistryConfiguration::load(ctx)?.signature_storage(&self.docker_ref, true)?;
        Ok(Box::new(RegistryDestination {
            reference: self.clone(),
            session,
            lookaside,
            manifest_digest: Mutex::new(None),
        }))
    }
}

/// A configured client plus credentials for one registry.
struct RegistrySession {
    client: Client,
    auth: OciRegistryAuth,
}

impl RegistrySession {
    fn new(reference: &RegistryReference, ctx: &SystemContext) -> Result<Self> {
        let domain = &reference.docker_ref.domain;
        let auth = match auth::credentials_for(ctx, domain)? {
            Some(creds) => OciRegistryAuth::Basic(creds.username, creds.password),
            None => OciRegistryAuth::Anonymous,
        };

        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            accept_invalid_certificates: ctx.docker_insecure_skip_tls_verify,
            extra_root_certificates: load_certificates(cert_dir(ctx, domain).as_deref())?,
            ..Default::default()
        };
        Ok(Self {
            client: Client::new(config),
            auth,
        })
    }
}

/// The certificate directory for `domain`: the explicit `--cert-dir`, or
/// the first system directory that exists.
fn cert_dir(ctx: &SystemContext, domain: &str) -> Option<PathBuf> {
    if let Some(dir) = &ctx.docker_cert_path {
        return Some(dir.clone());
    }
    CERT_DIRS
        .iter()
        .map(|base| Path::new(base).join(domain))
        .find(|p| p.is_dir())
}

/// Load `*.crt` CA certificates. Client key pairs are not supported and
/// are reported.
fn load_certificates(dir: Option<&Path>) -> Result<Vec<Certificate>> {
    let Some(dir) = dir else {
        return Ok(Vec::new());
    };
    let entries = std::fs::read_dir(dir).map_err(|e| {
        CopyError::ConfigError(format!("Failed to read certificate directory {}: {}", dir.display(), e))
    })?;
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();

    let mut certificates = Vec::new();
    for path in paths {
        match path.extension().and_then(|e| e.to_str()) {
            Some("crt") => {
                let data = std::fs::read(&path).map_err(|e| {
                    CopyError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
                })?;
                tracing::debug!(path = %path.display(), "Using CA certificate");
                certificates.push(Certificate {
                    encoding: CertificateEncoding::Pem,
                    data,
                });
            }
            Some("cert") | Some("key") => {
                tracing::warn!(
                    path = %path.display(),
                    "Client certificates are not supported, ignoring"
                );
            }
            _ => {}
        }
    }
    Ok(certificates)
}

pub struct RegistrySource {
    reference: RegistryReference,
    session: RegistrySession,
    lookaside: Option<SignatureStorage>,
    manifest_digest: Mutex<Option<Digest>>,
}

impl RegistrySource {
    async fn pull_manifest(&self, oci_ref: &Reference) -> Result<Vec<u8>> {
        let (data, _) = self
            .session
            .client
            .pull_manifest_raw(oci_ref, &self.session.auth, manifest::DEFAULT_MANIFEST_TYPES)
            .await
            .map_err(|e| self.reference.registry_error(format!("Failed to pull manifest: {e}")))?;
        Ok(data)
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn reference(&self) -> &dyn ImageReference {
        &self.reference
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        let (oci_ref, expected) = match instance {
            Some(d) => (self.reference.digest_reference(d), Some(d.clone())),
            None => (
                self.reference.to_oci_reference(),
                self.reference.docker_ref.digest.clone(),
            ),
        };
        let data = self.pull_manifest(&oci_ref).await?;
        let digest = manifest::manifest_digest(&data)?;
        if let Some(expected) = expected {
            if digest != expected {
                return Err(CopyError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }
        if instance.is_none() {
            *self.manifest_digest.lock() = Some(digest);
        }
        tracing::debug!(reference = %self.reference.docker_ref, "Pulled manifest");
        let mime_type = manifest::guess_mime_type(&data);
        Ok((data, mime_type))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let descriptor = OciDescriptor {
            media_type: info.media_type.clone(),
            digest: info.digest.to_string(),
            size: info.size,
            urls: (!info.urls.is_empty()).then(|| info.urls.clone()),
            ..Default::default()
        };
        let mut counting = DigestingWriter::new(writer, Algorithm::Sha256);
        self.session
            .client
            .pull_blob(&self.reference.to_oci_reference(), &descriptor, &mut counting)
            .await
            .map_err(|e| {
                self.reference
                    .registry_error(format!("Failed to pull blob {}: {}", info.digest, e))
            })?;
        Ok(counting.written())
    }

    async fn get_signatures(&self, instance: Option<&Digest>) -> Result<Vec<Vec<u8>>> {
        let Some(storage) = &self.lookaside else {
            return Ok(Vec::new());
        };
        let digest = match instance {
            Some(d) => d.clone(),
            None => {
                let cached = self.manifest_digest.lock().clone();
                match cached {
                    Some(d) => d,
                    None => {
                        let (data, _) = self.get_manifest(None).await?;
                        manifest::manifest_digest(&data)?
                    }
                }
            }
        };
        storage.read_signatures(&self.reference.docker_ref, &digest).await
    }
}

pub struct RegistryDestination {
    reference: RegistryReference,
    session: RegistrySession,
    lookaside: Option<SignatureStorage>,
    manifest_digest: Mutex<Option<Digest>>,
}

/// Whether a registry error means the manifest type itself was refused.
fn is_manifest_type_rejection(message: &str) -> bool {
    let m = message.to_lowercase();
    ["manifest invalid", "manifestinvalid", "manifest_invalid", "unsupported", "415"]
        .iter()
        .any(|needle| m.contains(needle))
}

#[async_trait]
impl ImageDestination for RegistryDestination {
    fn reference(&self) -> &dyn ImageReference {
        &self.reference
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        [
            manifest::OCI_MANIFEST_MEDIA_TYPE,
            manifest::DOCKER_V2_SCHEMA2_MEDIA_TYPE,
            manifest::DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE,
            manifest::DOCKER_V2_SCHEMA1_MEDIA_TYPE,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn signature_support(&self) -> Result<()> {
        if self.lookaside.is_some() {
            Ok(())
        } else {
            Err(CopyError::SignatureError(
                "Pushing signatures to a Docker Registry is not supported, and there is no applicable signature storage configured"
                    .to_string(),
            ))
        }
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        LayerCompression::Compress
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        true
    }

    async fn try_reuse_blob(&self, _info: &BlobInfo) -> Result<Option<BlobInfo>> {
        Ok(None)
    }

    async fn put_blob(&self, path: &Path, info: &BlobInfo, _is_config: bool) -> Result<BlobInfo> {
        // oci-distribution only pushes from a byte slice, so the whole blob
        // is held in memory for the upload. Layers larger than available
        // memory cannot be pushed.
        let data = tokio::fs::read(path).await?;
        let url = self
            .session
            .client
            .push_blob(&self.reference.to_oci_reference(), &data, info.digest.as_str())
            .await
            .map_err(|e| {
                self.reference
                    .registry_error(format!("Failed to push blob {}: {}", info.digest, e))
            })?;
        tracing::debug!(digest = %info.digest, %url, "Pushed blob");
        Ok(info.clone())
    }

    async fn put_manifest(&self, manifest: &[u8], mime_type: &str) -> Result<()> {
        let mime_type = manifest::normalize_mime_type(mime_type, manifest);
        let content_type = match mime_type.parse() {
            Ok(value) => value,
            Err(_) => {
                return Err(CopyError::ManifestError(format!(
                    "invalid manifest media type \"{mime_type}\""
                )))
            }
        };
        let result = self
            .session
            .client
            .push_manifest_raw(&self.reference.to_oci_reference(), manifest.to_vec(), content_type)
            .await;
        if let Err(e) = result {
            let message = e.to_string();
            if is_manifest_type_rejection(&message) {
                return Err(CopyError::ManifestTypeRejected {
                    mime_type,
                    reason: message,
                });
            }
            return Err(self
                .reference
                .registry_error(format!("Failed to push manifest: {message}")));
        }
        *self.manifest_digest.lock() = Some(manifest::manifest_digest(manifest)?);
        Ok(())
    }

    async fn put_signatures(&self, signatures: &[Vec<u8>]) -> Result<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        let Some(storage) = &self.lookaside else {
            return self.signature_support();
        };
        let digest = self.manifest_digest.lock().clone().ok_or_else(|| {
            CopyError::SignatureError("Unknown manifest digest, can't add signatures".to_string())
        })?;
        storage
            .write_signatures(&self.reference.docker_ref, &digest, signatures)
            .await
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
    fn test_parse_reference() {
        let r = RegistryReference::parse("//busybox").unwrap();
        assert_eq!(r.string_within_transport(), "//docker.io/library/busybox:latest");
        assert_eq!(r.policy_configuration_identity(), "docker.io/library/busybox:latest");
        assert_eq!(r.policy_configuration_namespaces()[0], "docker.io/library/busybox");

        assert!(RegistryReference::parse("busybox").is_err());
        assert!(RegistryReference::parse(
            "//busybox:1@sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0"
        )
        .is_err());

        let digested = RegistryReference::parse(
            "//quay.io/a/b@sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0",
        )
        .unwrap();
        assert!(digested.docker_reference().unwrap().tag.is_none());
    }

    #[test]
    fn test_validate_policy_scope() {
        assert!(validate_policy_scope("quay.io").is_ok());
        assert!(validate_policy_scope("localhost:5000").is_ok());
        assert!(validate_policy_scope("*.example.com").is_ok());
        assert!(validate_policy_scope("quay.io/ns").is_ok());
        assert!(validate_policy_scope("quay.io/ns/app:1").is_ok());
        assert!(validate_policy_scope("docker.io/library/busybox").is_ok());
        assert!(validate_policy_scope("*.").is_err());
        assert!(validate_policy_scope("library/busybox").is_err());
        assert!(validate_policy_scope("quay.io/NS/app").is_err());
    }

    #[test]
    fn test_manifest_rejection_detection() {
        assert!(is_manifest_type_rejection("MANIFEST_INVALID: manifest invalid"));
        assert!(is_manifest_type_rejection("Server error: 415 Unsupported Media Type"));
        assert!(!is_manifest_type_rejection("401 Unauthorized"));
    }

    #[test]
    fn test_load_certificates() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ca.crt"), b"-----BEGIN CERTIFICATE-----\n").unwrap();
        std::fs::write(dir.path().join("client.cert"), b"x").unwrap();
        std::fs::write(dir.path().join("client.key"), b"x").unwrap();
        let certs = load_certificates(Some(dir.path())).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(load_certificates(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_source_without_lookaside_has_no_signatures() {
        let dir = TempDir::new().unwrap();
        let r = RegistryReference::parse("//localhost:5000/a/b:1").unwrap();
        let ctx = SystemContext {
            registries_dir_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let source = r.new_image_source(&ctx).await.unwrap();
        assert!(source.get_signatures(Some(&Digest::from_bytes(b"m"))).await.unwrap().is_empty());
    }
}
