//! Docker image reference parsing.
//!
//! Parses references like `quay.io/org/image:v1` into structured components,
//! normalizing Docker Hub shorthand (`busybox` → `docker.io/library/busybox`).

use skiff_core::error::{CopyError, Result};

use crate::digest::Digest;

/// Default registry when none is specified.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Legacy Docker Hub hostname, normalized to [`DEFAULT_DOMAIN`].
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";

/// Namespace for single-component Docker Hub repositories.
const OFFICIAL_REPO_PREFIX: &str = "library/";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

const MAX_NAME_LEN: usize = 255;

/// Parsed, normalized Docker reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DockerReference {
    /// Registry hostname, optionally with port (e.g., "docker.io", "localhost:5000")
    pub domain: String,
    /// Repository path (e.g., "library/nginx", "org/sub/image")
    pub path: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<Digest>,
}

impl DockerReference {
    /// Parse a reference, normalizing it to fully-qualified form.
    ///
    /// No tag is added to name-only references; see [`Self::with_default_tag`].
    ///
    /// - `busybox` → docker.io/library/busybox
    /// - `busybox:1.36` → docker.io/library/busybox:1.36
    /// - `myuser/myimage` → docker.io/myuser/myimage
    /// - `quay.io/org/image@sha256:…` → quay.io/org/image@sha256:…
    pub fn parse_normalized_named(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(CopyError::ReferenceError(
                "repository name must have at least one component".to_string(),
            ));
        }
        if reference.trim() != reference {
            return Err(CopyError::ReferenceError(format!(
                "invalid reference format \"{reference}\": surrounding whitespace"
            )));
        }

        // Digest first (@ separator)
        let (name_tag, digest) = match reference.split_once('@') {
            Some((name_tag, digest)) => (name_tag, Some(Digest::parse(digest)?)),
            None => (reference, None),
        };

        // Tag is after the last colon, but only if that colon follows the last slash
        let last_slash = name_tag.rfind('/');
        let (name, tag) = match name_tag.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            _ => (name_tag, None),
        };

        if let Some(ref tag) = tag {
            validate_tag(tag)?;
        }

        let (domain, path) = split_domain(name);
        validate_domain(&domain, reference)?;
        validate_path(&path, reference)?;

        if domain.len() + 1 + path.len() > MAX_NAME_LEN {
            return Err(CopyError::ReferenceError(format!(
                "repository name must not be more than {MAX_NAME_LEN} characters"
            )));
        }

        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    /// Return a copy with `latest` added if neither tag nor digest is present.
    pub fn with_default_tag(mut self) -> Self {
        if self.is_name_only() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }

    /// True if the reference has neither tag nor digest.
    pub fn is_name_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// Repository name including domain (`docker.io/library/busybox`).
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// Scopes used for trust policy and lookaside lookups, most specific first.
    ///
    /// For `quay.io/ns/repo` this is `quay.io/ns/repo`, `quay.io/ns`,
    /// `quay.io`, `*.io`. Wildcards only cover strict parent domains.
    pub fn policy_namespaces(&self) -> Vec<String> {
        let mut namespaces = Vec::new();
        let name = self.name();
        let mut current = name.as_str();
        namespaces.push(current.to_string());
        while let Some(idx) = current.rfind('/') {
            current = &current[..idx];
            namespaces.push(current.to_string());
        }

        // Wildcard scopes for the host (without port), parents only
        let host = self.domain.split(':').next().unwrap_or(&self.domain);
        let mut rest = host;
        while let Some(idx) = rest.find('.') {
            rest = &rest[idx + 1..];
            if !rest.is_empty() {
                namespaces.push(format!("*.{rest}"));
            }
        }
        namespaces
    }

    /// Path without the domain, as embedded in schema 1 manifests.
    pub fn repository_path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Display for DockerReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Split a name into domain and repository path, applying Docker Hub defaults.
fn split_domain(name: &str) -> (String, String) {
    let (mut domain, mut path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    if domain == LEGACY_DEFAULT_DOMAIN {
        domain = DEFAULT_DOMAIN.to_string();
    }
    if domain == DEFAULT_DOMAIN && !path.contains('/') {
        path = format!("{OFFICIAL_REPO_PREFIX}{path}");
    }
    (domain, path)
}

fn validate_domain(domain: &str, reference: &str) -> Result<()> {
    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (domain, None),
    };
    let host_ok = !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    let port_ok = port.map_or(true, |p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !host_ok || !port_ok {
        return Err(CopyError::ReferenceError(format!(
            "invalid reference format \"{reference}\": bad registry \"{domain}\""
        )));
    }
    Ok(())
}

fn validate_path(path: &str, reference: &str) -> Result<()> {
    if path.is_empty() {
        return Err(CopyError::ReferenceError(format!(
            "invalid reference format \"{reference}\": empty repository"
        )));
    }
    if path.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(CopyError::ReferenceError(format!(
            "invalid reference format \"{reference}\": repository name must be lowercase"
        )));
    }
    for component in path.split('/') {
        if !is_valid_path_component(component) {
            return Err(CopyError::ReferenceError(format!(
                "invalid reference format \"{reference}\": bad path component \"{component}\""
            )));
        }
    }
    Ok(())
}

/// `[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*`
fn is_valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        // Separator run
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let sep = &component[start..i];
        let ok = sep == "." || sep == "_" || sep == "__" || sep.bytes().all(|b| b == b'-');
        if !ok {
            return false;
        }
    }
    true
}

fn validate_tag(tag: &str) -> Result<()> {
    let bytes = tag.as_bytes();
    let first_ok = bytes
        .first()
        .map_or(false, |b| b.is_ascii_alphanumeric() || *b == b'_');
    let rest_ok = bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if !first_ok || !rest_ok || bytes.len() > 128 {
        return Err(CopyError::ReferenceError(format!(
            "invalid tag format \"{tag}\""
        )));
    }
    Ok(())
}
