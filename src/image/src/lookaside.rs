//! Lookaside signature storage for registry images.
//!
//! Registries do not store simple-signing signatures themselves; they live
//! in a separate web server or directory configured per repository scope in
//! `registries.d/*.yaml`:
//!
//! ```yaml
//! default-docker:
//!   sigstore: https://sigstore.example.com
//! docker:
//!   registry.example.com/team:
//!     sigstore: https://sigstore.example.com
//!     sigstore-staging: file:///mnt/sigstore
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::Deserialize;
use skiff_core::error::{CopyError, Result};

use crate::context::SystemContext;
use crate::digest::Digest;
use crate::reference::DockerReference;

const SYSTEM_REGISTRIES_DIR: &str = "/etc/containers/registries.d";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryNamespace {
    /// Where signatures are read from
    #[serde(default)]
    pub sigstore: Option<String>,
    /// Where signatures are written to, defaulting to `sigstore`
    #[serde(default)]
    pub sigstore_staging: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RegistryFile {
    #[serde(default)]
    default_docker: Option<RegistryNamespace>,
    #[serde(default)]
    docker: HashMap<String, RegistryNamespace>,
}

/// Merged contents of a `registries.d` directory.
#[derive(Debug, Default)]
pub struct RegistryConfiguration {
    default_docker: Option<RegistryNamespace>,
    docker: HashMap<String, RegistryNamespace>,
}

impl RegistryConfiguration {
    /// Load the directory selected by `ctx` (`--registries.d`), falling back to
    /// the per-user and then the system directory.
    pub fn load(ctx: &SystemContext) -> Result<Self> {
        let dir = match &ctx.registries_dir_path {
            Some(dir) => dir.clone(),
            None => dirs::config_dir()
                .map(|d| d.join("containers").join("registries.d"))
                .filter(|d| d.exists())
                .unwrap_or_else(|| PathBuf::from(SYSTEM_REGISTRIES_DIR)),
        };
        Self::load_dir(&dir)
    }

    /// Load every `*.yaml` file in `dir`. A missing directory is empty.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut config = Self::default();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(config),
            Err(e) => {
                return Err(CopyError::ConfigError(format!(
                    "Failed to read {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "yaml"))
            .collect();
        paths.sort();

        let mut default_source: Option<PathBuf> = None;
        let mut scope_sources: HashMap<String, PathBuf> = HashMap::new();
        for path in paths {
            let data = std::fs::read_to_string(&path)?;
            let file: RegistryFile = serde_yaml::from_str(&data).map_err(|e| {
                CopyError::ConfigError(format!("Error parsing {}: {}", path.display(), e))
            })?;

            if let Some(ns) = file.default_docker {
                if let Some(previous) = &default_source {
                    return Err(CopyError::ConfigError(format!(
                        "Error parsing signature storage configuration: \"default-docker\" defined both in \"{}\" and \"{}\"",
                        previous.display(),
                        path.display()
                    )));
                }
                config.default_docker = Some(ns);
                default_source = Some(path.clone());
            }
            for (scope, ns) in file.docker {
                if let Some(previous) = scope_sources.get(&scope) {
                    return Err(CopyError::ConfigError(format!(
                        "Error parsing signature storage configuration: \"docker\" namespace \"{}\" defined both in \"{}\" and \"{}\"",
                        scope,
                        previous.display(),
                        path.display()
                    )));
                }
                scope_sources.insert(scope.clone(), path.clone());
                config.docker.insert(scope, ns);
            }
        }
        Ok(config)
    }

    /// The most specific namespace entry for `reference`.
    fn namespace_for(&self, reference: &DockerReference) -> Option<&RegistryNamespace> {
        std::iter::once(reference.to_string())
            .chain(reference.policy_namespaces())
            .find_map(|scope| self.docker.get(&scope))
            .or(self.default_docker.as_ref())
    }

    /// Signature storage for `reference`; `write` selects `sigstore-staging`.
    pub fn signature_storage(
        &self,
        reference: &DockerReference,
        write: bool,
    ) -> Result<Option<SignatureStorage>> {
        let Some(ns) = self.namespace_for(reference) else {
            return Ok(None);
        };
        let base = if write {
            ns.sigstore_staging.as_ref().or(ns.sigstore.as_ref())
        } else {
            ns.sigstore.as_ref()
        };
        base.map(|b| SignatureStorage::new(b)).transpose()
    }
}

/// A lookaside base URL.
#[derive(Debug, Clone)]
pub struct SignatureStorage {
    base: Url,
}

impl SignatureStorage {
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| CopyError::ConfigError(format!("Invalid signature storage URL {base}: {e}")))?;
        Ok(Self { base })
    }

    /// `<base>/<repo>@<algo>=<hex>/signature-<index>`, `index` starting at 1.
    pub fn signature_url(&self, reference: &DockerReference, digest: &Digest, index: usize) -> Result<Url> {
        let path = format!(
            "{}/{}@{}={}/signature-{}",
            self.base.path().trim_end_matches('/'),
            reference.repository_path(),
            digest.algorithm().as_str(),
            digest.hex(),
            index
        );
        let mut url = self.base.clone();
        url.set_path(&path);
        Ok(url)
    }

    fn file_path(url: &Url) -> Result<PathBuf> {
        url.to_file_path()
            .map_err(|_| CopyError::SignatureError(format!("Invalid file URL {url}")))
    }

    /// Read signatures until the first missing index.
    pub async fn read_signatures(
        &self,
        reference: &DockerReference,
        digest: &Digest,
    ) -> Result<Vec<Vec<u8>>> {
        let mut signatures = Vec::new();
        let client = match self.base.scheme() {
            "http" | "https" => Some(reqwest::Client::new()),
            "file" => None,
            other => {
                return Err(CopyError::SignatureError(format!(
                    "Unsupported scheme when reading signatures from {}: {other}",
                    self.base
                )))
            }
        };

        for index in 1.. {
            let url = self.signature_url(reference, digest, index)?;
            let data = match &client {
                None => match tokio::fs::read(Self::file_path(&url)?).await {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                    Err(e) => return Err(e.into()),
                },
                Some(client) => {
                    let response = client.get(url.clone()).send().await.map_err(|e| {
                        CopyError::SignatureError(format!("Error reading signature from {url}: {e}"))
                    })?;
                    if response.status() == reqwest::StatusCode::NOT_FOUND {
                        break;
                    }
                    if !response.status().is_success() {
                        return Err(CopyError::SignatureError(format!(
                            "Error reading signature from {url}: status {}",
                            response.status()
                        )));
                    }
                    response
                        .bytes()
                        .await
                        .map_err(|e| {
                            CopyError::SignatureError(format!("Error reading signature from {url}: {e}"))
                        })?
                        .to_vec()
                }
            };
            tracing::debug!(%url, "Read signature");
            signatures.push(data);
        }
        Ok(signatures)
    }

    /// Replace the stored signatures; only `file://` storage is writable.
    pub async fn write_signatures(
        &self,
        reference: &DockerReference,
        digest: &Digest,
        signatures: &[Vec<u8>],
    ) -> Result<()> {
        if self.base.scheme() != "file" {
            return Err(CopyError::SignatureError(format!(
                "Writing signatures to {} is not supported",
                self.base
            )));
        }
        for (i, signature) in signatures.iter().enumerate() {
            let path = Self::file_path(&self.signature_url(reference, digest, i + 1)?)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, signature).await?;
            tracing::debug!(path = %path.display(), "Wrote signature");
        }
        // Remove stale signatures beyond the new set.
        for index in signatures.len() + 1.. {
            let path = Self::file_path(&self.signature_url(reference, digest, index)?)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reference(s: &str) -> DockerReference {
        DockerReference::parse_normalized_named(s).unwrap()
    }

    fn digest() -> Digest {
        Digest::from_bytes(b"manifest")
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfiguration::load_dir(&dir.path().join("none")).unwrap();
        assert!(config
            .signature_storage(&reference("busybox:latest"), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_scope_precedence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("default.yaml"),
            "default-docker:\n  sigstore: file:///default\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("example.yaml"),
            "docker:\n  registry.example.com/team:\n    sigstore: https://sigs.example.com/store\n    sigstore-staging: file:///staging\n",
        )
        .unwrap();
        let config = RegistryConfiguration::load_dir(dir.path()).unwrap();

        let team = reference("registry.example.com/team/app:v1");
        let read = config.signature_storage(&team, false).unwrap().unwrap();
        assert_eq!(read.base.as_str(), "https://sigs.example.com/store");
        let write = config.signature_storage(&team, true).unwrap().unwrap();
        assert_eq!(write.base.as_str(), "file:///staging");

        let other = reference("quay.io/x/y:1");
        let read = config.signature_storage(&other, false).unwrap().unwrap();
        assert_eq!(read.base.as_str(), "file:///default");
    }

    #[test]
    fn test_duplicate_scope_rejected() {
        let dir = TempDir::new().unwrap();
        let body = "docker:\n  quay.io:\n    sigstore: file:///a\n";
        std::fs::write(dir.path().join("a.yaml"), body).unwrap();
        std::fs::write(dir.path().join("b.yaml"), body).unwrap();
        let err = RegistryConfiguration::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("defined both in"));
    }

    #[test]
    fn test_signature_url() {
        let storage = SignatureStorage::new("https://sigs.example.com/store/").unwrap();
        let url = storage
            .signature_url(&reference("quay.io/ns/app:1"), &digest(), 2)
            .unwrap();
        assert_eq!(
            url.as_str(),
            format!(
                "https://sigs.example.com/store/ns/app@sha256={}/signature-2",
                digest().hex()
            )
        );
    }

    #[tokio::test]
    async fn test_file_write_then_read() {
        let dir = TempDir::new().unwrap();
        let base = Url::from_directory_path(dir.path()).unwrap();
        let storage = SignatureStorage::new(base.as_str()).unwrap();
        let r = reference("quay.io/ns/app:1");

        storage
            .write_signatures(&r, &digest(), &[b"one".to_vec(), b"two".to_vec()])
            .await
            .unwrap();
        let read = storage.read_signatures(&r, &digest()).await.unwrap();
        assert_eq!(read, vec![b"one".to_vec(), b"two".to_vec()]);

        storage
            .write_signatures(&r, &digest(), &[b"only".to_vec()])
            .await
            .unwrap();
        let read = storage.read_signatures(&r, &digest()).await.unwrap();
        assert_eq!(read, vec![b"only".to_vec()]);
    }

    #[tokio::test]
    async fn test_http_write_rejected() {
        let storage = SignatureStorage::new("https://sigs.example.com").unwrap();
        let err = storage
            .write_signatures(&reference("quay.io/ns/app:1"), &digest(), &[b"x".to_vec()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
