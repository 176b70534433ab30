//! Registry credentials from `auth.json` style files.
//!
//! Files hold `{"auths": {"<registry>": {"auth": base64("user:pass")}}}`;
//! keys may also be full URLs such as `https://index.docker.io/v1/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use serde::Deserialize;
use skiff_core::error::{CopyError, Result};

use crate::context::{DockerAuthConfig, SystemContext};

#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct AuthFileContents {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// A credential file on disk.
pub struct AuthFile {
    path: PathBuf,
}

impl AuthFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Locate the credential file for a context.
    ///
    /// An explicit `--authfile` is used even if it does not exist yet;
    /// otherwise `$REGISTRY_AUTH_FILE`, `$XDG_RUNTIME_DIR/containers/auth.json`
    /// and `~/.docker/config.json` are tried in order.
    pub fn resolve(ctx: &SystemContext) -> Option<Self> {
        if let Some(path) = &ctx.auth_file_path {
            return Some(Self::new(path.clone()));
        }
        let mut candidates = Vec::new();
        if let Some(p) = std::env::var_os("REGISTRY_AUTH_FILE") {
            candidates.push(PathBuf::from(p));
        }
        if let Some(runtime) = dirs::runtime_dir() {
            candidates.push(runtime.join("containers").join("auth.json"));
        }
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".docker").join("config.json"));
        }
        candidates.into_iter().find(|p| p.exists()).map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Credentials for `registry`, if the file has any.
    pub fn get(&self, registry: &str) -> Result<Option<DockerAuthConfig>> {
        let contents = self.load()?;
        let wanted = normalize_registry(registry);
        let entry = contents
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .map(|(_, e)| e);
        match entry {
            Some(e) => decode_entry(e).map(Some),
            None => Ok(None),
        }
    }

    fn load(&self) -> Result<AuthFileContents> {
        if !self.path.exists() {
            return Ok(AuthFileContents::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            CopyError::ConfigError(format!(
                "Failed to read auth file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            CopyError::ConfigError(format!(
                "Failed to parse auth file {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

fn decode_entry(entry: &AuthEntry) -> Result<DockerAuthConfig> {
    if entry.auth.is_empty() {
        return Ok(DockerAuthConfig {
            username: entry.username.clone(),
            password: entry.password.clone(),
        });
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(entry.auth.trim())
        .map_err(|e| CopyError::ConfigError(format!("invalid auth entry: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| CopyError::ConfigError(format!("invalid auth entry: {e}")))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| CopyError::ConfigError("invalid auth entry: missing ':'".to_string()))?;
    Ok(DockerAuthConfig {
        username: username.to_string(),
        password: password.trim_end_matches('\n').to_string(),
    })
}

/// Credentials for a registry: explicit `--*-creds` first, then the auth file.
pub fn credentials_for(ctx: &SystemContext, registry: &str) -> Result<Option<DockerAuthConfig>> {
    if let Some(creds) = &ctx.docker_auth_config {
        return Ok(Some(creds.clone()));
    }
    match AuthFile::resolve(ctx) {
        Some(file) => {
            let creds = file.get(registry)?;
            if creds.is_some() {
                tracing::debug!(registry, path = %file.path().display(), "Using credentials from auth file");
            }
            Ok(creds)
        }
        None => Ok(None),
    }
}

/// Normalize registry keys: strip URL scheme and path, fold Docker Hub aliases.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(&r);
    let host = r.split('/').next().unwrap_or(r);
    match host {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => "docker.io".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_auth(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("auth.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn encoded(user: &str, pass: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
    }

    #[test]
    fn test_get_decodes_auth() {
        let dir = TempDir::new().unwrap();
        let path = write_auth(
            &dir,
            &format!(r#"{{"auths":{{"quay.io":{{"auth":"{}"}}}}}}"#, encoded("u", "p:w")),
        );
        let creds = AuthFile::new(path).get("quay.io").unwrap().unwrap();
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p:w");
    }

    #[test]
    fn test_get_missing_registry() {
        let dir = TempDir::new().unwrap();
        let path = write_auth(&dir, r#"{"auths":{}}"#);
        assert!(AuthFile::new(path).get("ghcr.io").unwrap().is_none());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let file = AuthFile::new(dir.path().join("nope.json"));
        assert!(file.get("ghcr.io").unwrap().is_none());
    }

    #[test]
    fn test_docker_hub_aliases() {
        let dir = TempDir::new().unwrap();
        let path = write_auth(
            &dir,
            &format!(
                r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{}"}}}}}}"#,
                encoded("hub", "secret")
            ),
        );
        let file = AuthFile::new(path);
        assert_eq!(file.get("docker.io").unwrap().unwrap().username, "hub");
        assert_eq!(file.get("registry-1.docker.io").unwrap().unwrap().username, "hub");
    }

    #[test]
    fn test_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = write_auth(&dir, "not json");
        assert!(AuthFile::new(path).get("quay.io").is_err());
    }

    #[test]
    fn test_explicit_credentials_win() {
        let dir = TempDir::new().unwrap();
        let path = write_auth(
            &dir,
            &format!(r#"{{"auths":{{"quay.io":{{"auth":"{}"}}}}}}"#, encoded("file", "x")),
        );
        let ctx = SystemContext {
            auth_file_path: Some(path.clone()),
            docker_auth_config: Some(DockerAuthConfig {
                username: "flag".to_string(),
                password: "y".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(credentials_for(&ctx, "quay.io").unwrap().unwrap().username, "flag");

        let ctx = SystemContext {
            auth_file_path: Some(path),
            ..Default::default()
        };
        assert_eq!(credentials_for(&ctx, "quay.io").unwrap().unwrap().username, "file");
    }
}
