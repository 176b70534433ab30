//! Signing mechanisms.
//!
//! The only implementation drives the `gpg` binary. Verification reads the
//! machine-readable status lines (`--status-fd`) rather than the human
//! output.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use skiff_core::error::{CopyError, Result};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Produces and checks opaque signature blobs.
#[async_trait]
pub trait SigningMechanism: Send + Sync {
    /// Sign `input` with the key identified by `key_identity`.
    async fn sign(&self, input: &[u8], key_identity: &str) -> Result<Vec<u8>>;

    /// Verify `signature`, returning the signed contents and the signing
    /// key fingerprint. The fingerprint is not yet trusted by the caller.
    async fn verify(&self, signature: &[u8]) -> Result<(Vec<u8>, String)>;
}

/// Creates verifiers that trust only a given set of public keys.
#[async_trait]
pub trait EphemeralKeyring: Send + Sync {
    /// Import `keys` (armored or binary OpenPGP public keys) into a fresh
    /// keyring; returns a mechanism using it and the imported fingerprints.
    async fn import(&self, keys: &[Vec<u8>]) -> Result<(Box<dyn SigningMechanism>, Vec<String>)>;
}

/// `gpg` with either the user's keyring or a private temporary home.
pub struct GpgMechanism {
    home: Option<PathBuf>,
    _ephemeral: Option<TempDir>,
}

impl GpgMechanism {
    /// Use the default keyring (`$GNUPGHOME` or `~/.gnupg`).
    pub fn new() -> Self {
        Self {
            home: None,
            _ephemeral: None,
        }
    }

    /// Use the keyring in `home`.
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home: Some(home),
            _ephemeral: None,
        }
    }

    /// A temporary keyring holding only `keys`.
    pub async fn ephemeral(keys: &[Vec<u8>]) -> Result<(Self, Vec<String>)> {
        let dir = tempfile::Builder::new()
            .prefix("skiff-gpg")
            .tempdir()
            .map_err(|e| CopyError::SignatureError(format!("creating temporary GPG home: {e}")))?;
        let mut mech = Self {
            home: Some(dir.path().to_path_buf()),
            _ephemeral: None,
        };
        let mut fingerprints = Vec::new();
        for key in keys {
            let output = mech
                .run(&["--batch", "--status-fd", "1", "--import"], key)
                .await?;
            if !output.status.success() {
                return Err(CopyError::SignatureError(format!(
                    "gpg --import failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            fingerprints.extend(parse_import_ok(&String::from_utf8_lossy(&output.stdout)));
        }
        mech._ephemeral = Some(dir);
        Ok((mech, fingerprints))
    }

    async fn run(&self, args: &[&str], input: &[u8]) -> Result<std::process::Output> {
        let mut cmd = Command::new("gpg");
        cmd.args(args);
        if let Some(home) = &self.home {
            cmd.env("GNUPGHOME", home);
        }
        communicate(cmd, input)
            .await
            .map_err(|e| CopyError::SignatureError(format!("running gpg: {e}")))
    }
}

/// Feed `input` to the child's stdin while collecting its output.
///
/// Writing and reading run together so a child that fills its stdout pipe
/// before draining stdin cannot stall either side.
async fn communicate(mut cmd: Command, input: &[u8]) -> std::io::Result<std::process::Output> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take();
    let write = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (written, output) = tokio::join!(write, child.wait_with_output());
    let output = output?;
    match written {
        // The exit status reports why the child stopped reading.
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
        other => other?,
    }
    Ok(output)
}

impl Default for GpgMechanism {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SigningMechanism for GpgMechanism {
    async fn sign(&self, input: &[u8], key_identity: &str) -> Result<Vec<u8>> {
        let output = self
            .run(
                &["--batch", "--no-tty", "--local-user", key_identity, "--output", "-", "--sign"],
                input,
            )
            .await?;
        if !output.status.success() {
            return Err(CopyError::SignatureError(format!(
                "Error creating signature with key {key_identity}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn verify(&self, signature: &[u8]) -> Result<(Vec<u8>, String)> {
        let output = self
            .run(
                &["--batch", "--no-tty", "--status-fd", "2", "--output", "-", "--decrypt"],
                signature,
            )
            .await?;
        let status = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(CopyError::SignatureError(format!(
                "Invalid GPG signature: {}",
                status.trim()
            )));
        }
        let fingerprint = parse_validsig(&status).ok_or_else(|| {
            CopyError::SignatureError("Invalid GPG signature: no VALIDSIG status".to_string())
        })?;
        Ok((output.stdout, fingerprint))
    }
}

/// Keyring factory backed by temporary `gpg` homes.
pub struct GpgKeyring;

#[async_trait]
impl EphemeralKeyring for GpgKeyring {
    async fn import(&self, keys: &[Vec<u8>]) -> Result<(Box<dyn SigningMechanism>, Vec<String>)> {
        let (mech, fingerprints) = GpgMechanism::ephemeral(keys).await?;
        Ok((Box::new(mech), fingerprints))
    }
}

/// Fingerprint from the first `[GNUPG:] VALIDSIG` status line.
fn parse_validsig(status: &str) -> Option<String> {
    status.lines().find_map(|line| {
        let mut fields = line.strip_prefix("[GNUPG:] VALIDSIG ")?.split_whitespace();
        fields.next().map(str::to_string)
    })
}

/// Fingerprints from `[GNUPG:] IMPORT_OK <reasons> <fingerprint>` lines.
fn parse_import_ok(status: &str) -> Vec<String> {
    status
        .lines()
        .filter_map(|line| {
            let mut fields = line.strip_prefix("[GNUPG:] IMPORT_OK ")?.split_whitespace();
            fields.nth(1).map(str::to_string)
        })
        .collect()
}
