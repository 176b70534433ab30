//! Layer compression detection and (de)compression streams.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use skiff_core::error::{CopyError, Result};

/// Compression formats recognized in layer blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Gzip => "gzip",
            Algorithm::Bzip2 => "bzip2",
            Algorithm::Xz => "xz",
            Algorithm::Zstd => "zstd",
        }
    }
}

/// What a destination wants done to layer blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    /// Store layers as they come from the source
    Preserve,
    /// Gzip layers that are not already compressed
    Compress,
    /// Store layers uncompressed
    Decompress,
}

/// Detect the compression format from the leading bytes of a blob.
pub fn detect(header: &[u8]) -> Option<Algorithm> {
    if header.starts_with(&[0x1f, 0x8b, 0x08]) {
        Some(Algorithm::Gzip)
    } else if header.starts_with(b"BZh") {
        Some(Algorithm::Bzip2)
    } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Some(Algorithm::Xz)
    } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Some(Algorithm::Zstd)
    } else {
        None
    }
}

/// Wrap `reader` in a decompressor for `algorithm`.
pub fn decompressor<'a, R: Read + Send + 'a>(
    algorithm: Algorithm,
    reader: R,
) -> Result<Box<dyn Read + Send + 'a>> {
    match algorithm {
        Algorithm::Gzip => Ok(Box::new(GzDecoder::new(reader))),
        Algorithm::Bzip2 => Ok(Box::new(bzip2::read::BzDecoder::new(reader))),
        Algorithm::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        Algorithm::Zstd => Err(CopyError::BlobError(
            "zstd decompression is not supported".to_string(),
        )),
    }
}

/// Gzip everything from `reader` into `writer`.
pub fn gzip<R: Read, W: Write>(mut reader: R, writer: W) -> Result<W> {
    let mut encoder = GzEncoder::new(writer, Compression::default());
    std::io::copy(&mut reader, &mut encoder)?;
    Ok(encoder.finish()?)
}

/// Detect compression of a file by reading its first bytes.
pub fn detect_file(path: &std::path::Path) -> Result<Option<Algorithm>> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(detect(&header[..filled]))
}
