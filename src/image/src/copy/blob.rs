//! Blob transfer: spooling, verification, (de)compression and retries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use skiff_core::error::{CopyError, Result};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use super::progress::{format_bytes, Reporter};
use crate::compression::{self, LayerCompression};
use crate::digest::{Algorithm, Digest, Digester, DigestingWriter};
use crate::manifest::{self, BlobInfo, LayerInfo};
use crate::transports::{ImageDestination, ImageSource};

/// Attempts per blob, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// A layer after transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedLayer {
    /// What the destination stores
    pub info: BlobInfo,
    /// Digest of the uncompressed layer, when requested
    pub diff_id: Option<Digest>,
}

/// Copies blobs from one source to one destination.
pub struct BlobCopier<'a> {
    pub(crate) source: &'a dyn ImageSource,
    pub(crate) destination: &'a dyn ImageDestination,
    pub(crate) reporter: &'a Reporter,
    pub(crate) compression: LayerCompression,
    pub(crate) compute_diff_ids: bool,
    pub(crate) spool_dir: PathBuf,
    pub(crate) retry_delay: Duration,
}

impl<'a> BlobCopier<'a> {
    pub fn new(
        source: &'a dyn ImageSource,
        destination: &'a dyn ImageDestination,
        reporter: &'a Reporter,
        spool_dir: &Path,
    ) -> Self {
        Self {
            source,
            destination,
            reporter,
            compression: LayerCompression::Preserve,
            compute_diff_ids: false,
            spool_dir: spool_dir.to_path_buf(),
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Copy the config blob unchanged, returning its contents.
    pub async fn copy_config(&self, info: &BlobInfo) -> Result<(BlobInfo, Vec<u8>)> {
        self.reporter.line(&format!("Copying config {}", info.digest));
        let spooled = self.fetch(info).await?;
        let data = tokio::fs::read(spooled.file.path()).await?;
        let stored = match self.destination.try_reuse_blob(&spooled.info).await? {
            Some(existing) => existing,
            None => {
                self.destination
                    .put_blob(spooled.file.path(), &spooled.info, true)
                    .await?
            }
        };
        Ok((stored, data))
    }

    /// Copy all layers, at most `max_parallel` at a time. Results keep the
    /// input order; repeated digests are transferred once.
    pub async fn copy_layers(&self, layers: &[LayerInfo], max_parallel: usize) -> Result<Vec<CopiedLayer>> {
        let mut unique: Vec<&BlobInfo> = Vec::new();
        for layer in layers {
            if !unique.iter().any(|u| u.digest == layer.info.digest) {
                unique.push(&layer.info);
            }
        }

        let copied: Vec<(Digest, CopiedLayer)> = futures::stream::iter(unique)
            .map(|info| async move {
                let copied = self.copy_layer(info).await?;
                Ok::<_, CopyError>((info.digest.clone(), copied))
            })
            .buffered(max_parallel.max(1))
            .try_collect()
            .await?;
        let by_digest: HashMap<Digest, CopiedLayer> = copied.into_iter().collect();

        layers
            .iter()
            .map(|layer| {
                by_digest.get(&layer.info.digest).cloned().ok_or_else(|| {
                    CopyError::BlobError(format!("layer {} was not copied", layer.info.digest))
                })
            })
            .collect()
    }

    async fn copy_layer(&self, info: &BlobInfo) -> Result<CopiedLayer> {
        if !info.urls.is_empty() && self.destination.accepts_foreign_layer_urls() {
            tracing::debug!(digest = %info.digest, "Leaving foreign layer in place");
            self.reporter
                .line(&format!("Skipping foreign layer {}", info.digest));
            return Ok(CopiedLayer {
                info: info.clone(),
                diff_id: None,
            });
        }

        if !self.compute_diff_ids {
            if let Some(existing) = self.destination.try_reuse_blob(info).await? {
                self.reporter
                    .line(&format!("Skipping blob {} (already present)", info.digest));
                return Ok(CopiedLayer {
                    info: existing,
                    diff_id: None,
                });
            }
        }

        self.reporter.line(&format!(
            "Copying blob {}{}",
            info.digest,
            if info.size >= 0 {
                format!(" ({})", format_bytes(info.size as u64))
            } else {
                String::new()
            }
        ));
        let spooled = self.fetch(info).await?;
        let detected = detect(spooled.file.path()).await?;

        let (file, mut stored) = match (self.compression, detected) {
            (LayerCompression::Compress, None) => {
                let file = self.transform(spooled.file.path(), None).await?;
                let info = self
                    .rehash(&file, &spooled.info, Some(compression::Algorithm::Gzip))
                    .await?;
                (file, info)
            }
            (LayerCompression::Decompress, Some(algorithm)) => {
                let file = self.transform(spooled.file.path(), Some(algorithm)).await?;
                let info = self.rehash(&file, &spooled.info, None).await?;
                (file, info)
            }
            _ => (spooled.file, spooled.info),
        };

        let diff_id = if self.compute_diff_ids {
            Some(uncompressed_digest(file.path(), detected_after(self.compression, detected)).await?)
        } else {
            None
        };

        if stored.digest != info.digest {
            tracing::debug!(from = %info.digest, to = %stored.digest, "Layer recompressed");
        }
        stored = self.destination.put_blob(file.path(), &stored, false).await?;
        Ok(CopiedLayer {
            info: stored,
            diff_id,
        })
    }

    /// Download `info` into a spool file, retrying transient failures.
    async fn fetch(&self, info: &BlobInfo) -> Result<Spooled> {
        let mut attempt = 1;
        loop {
            match self.fetch_once(info).await {
                Ok(spooled) => return Ok(spooled),
                Err(e) if attempt < MAX_ATTEMPTS && is_retryable(&e) => {
                    let delay = self.retry_delay * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        digest = %info.digest,
                        attempt,
                        error = %e,
                        "Blob transfer failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, info: &BlobInfo) -> Result<Spooled> {
        let file = NamedTempFile::new_in(&self.spool_dir)?;
        let target = tokio::fs::File::from_std(file.reopen()?);
        let mut writer = DigestingWriter::new(target, info.digest.algorithm());
        self.source.get_blob(info, &mut writer).await?;
        writer.flush().await?;
        let (_, digest, size) = writer.finish();

        if digest != info.digest {
            return Err(CopyError::DigestMismatch {
                expected: info.digest.to_string(),
                actual: digest.to_string(),
            });
        }
        if info.size >= 0 && size != info.size as u64 {
            return Err(CopyError::BlobError(format!(
                "blob {} size mismatch, expected {}, got {}",
                info.digest, info.size, size
            )));
        }
        let mut verified = info.clone();
        verified.size = size as i64;
        Ok(Spooled {
            file,
            info: verified,
        })
    }

    /// Gzip (`decompress == None`) or decompress `path` into a new spool file.
    async fn transform(
        &self,
        path: &Path,
        decompress: Option<compression::Algorithm>,
    ) -> Result<NamedTempFile> {
        let input = path.to_path_buf();
        let spool_dir = self.spool_dir.clone();
        run_blocking(move || {
            let mut output = NamedTempFile::new_in(&spool_dir)?;
            let reader = std::fs::File::open(&input)?;
            match decompress {
                None => {
                    compression::gzip(reader, output.as_file_mut())?;
                }
                Some(algorithm) => {
                    let mut decoder = compression::decompressor(algorithm, reader)?;
                    std::io::copy(&mut decoder, output.as_file_mut())?;
                }
            }
            Ok(output)
        })
        .await
    }

    /// Digest and size of a transformed blob with its new media type.
    async fn rehash(
        &self,
        file: &NamedTempFile,
        original: &BlobInfo,
        compression: Option<compression::Algorithm>,
    ) -> Result<BlobInfo> {
        let path = file.path().to_path_buf();
        let (digest, size) = run_blocking(move || hash_file(&path, None)).await?;
        let media_type = if original.media_type.is_empty() {
            String::new()
        } else {
            manifest::layer_media_type_for(&original.media_type, compression)?
        };
        let mut info = original.clone();
        info.digest = digest;
        info.size = size as i64;
        info.media_type = media_type;
        Ok(info)
    }
}

struct Spooled {
    file: NamedTempFile,
    info: BlobInfo,
}

fn is_retryable(error: &CopyError) -> bool {
    error.is_transient() || matches!(error, CopyError::DigestMismatch { .. })
}

/// Compression of a layer after the requested transformation.
fn detected_after(
    requested: LayerCompression,
    detected: Option<compression::Algorithm>,
) -> Option<compression::Algorithm> {
    match (requested, detected) {
        (LayerCompression::Compress, None) => Some(compression::Algorithm::Gzip),
        (LayerCompression::Decompress, Some(_)) => None,
        (_, detected) => detected,
    }
}

async fn detect(path: &Path) -> Result<Option<compression::Algorithm>> {
    let path = path.to_path_buf();
    run_blocking(move || compression::detect_file(&path)).await
}

async fn uncompressed_digest(path: &Path, algorithm: Option<compression::Algorithm>) -> Result<Digest> {
    let path = path.to_path_buf();
    run_blocking(move || hash_file(&path, algorithm).map(|(d, _)| d)).await
}

/// Hash a file, decompressing it first when `algorithm` is set.
fn hash_file(path: &Path, algorithm: Option<compression::Algorithm>) -> Result<(Digest, u64)> {
    let file = std::fs::File::open(path)?;
    let mut reader: Box<dyn std::io::Read + Send> = match algorithm {
        Some(algorithm) => compression::decompressor(algorithm, file)?,
        None => Box::new(file),
    };
    let mut digester = Digester::new(Algorithm::Sha256);
    let size = std::io::copy(&mut reader, &mut digester)?;
    Ok((digester.finish(), size))
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CopyError::Other(format!("blocking task failed: {e}")))?
}
