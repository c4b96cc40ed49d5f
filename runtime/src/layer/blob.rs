//! Opaque, re-openable compressed layer blobs.

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cainject_core::error::{InjectError, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

/// Media type of an OCI gzip-compressed layer.
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Media type of an OCI uncompressed layer.
pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Media type of a Docker v2 gzip-compressed layer.
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether a layer media type declares gzip compression.
pub fn is_gzip_media_type(media_type: &str) -> bool {
    media_type == DOCKER_LAYER_GZIP || media_type.ends_with("+gzip")
}

/// Compute the `sha256:<hex>` digest of raw bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Decompress a raw layer stream into its tar stream.
///
/// Gzip is used when the media type declares it or the content starts
/// with the gzip magic; anything else is read as plain tar.
pub fn tar_stream<R: Read + Send + 'static>(
    raw: R,
    media_type: &str,
) -> Result<Box<dyn Read + Send>> {
    if media_type.contains("zstd") {
        return Err(InjectError::DecodeError(format!(
            "Unsupported layer compression: {}",
            media_type
        )));
    }

    let mut reader = BufReader::new(raw);
    let starts_with_magic = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip_media_type(media_type) || starts_with_magic {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

#[derive(Debug, Clone)]
enum BlobSource {
    Memory(Arc<Vec<u8>>),
    File {
        path: PathBuf,
        // Keeps the staging directory alive while any blob refers into it.
        _staging: Option<Arc<TempDir>>,
    },
}

/// A layer as stored in an image: compressed bytes plus descriptor data.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    source: BlobSource,
    media_type: String,
    digest: String,
    size: u64,
}

impl LayerBlob {
    /// Wrap in-memory layer bytes. The digest is computed from `data`.
    pub fn from_bytes(data: Vec<u8>, media_type: impl Into<String>) -> Self {
        let digest = sha256_digest(&data);
        let size = data.len() as u64;
        Self {
            source: BlobSource::Memory(Arc::new(data)),
            media_type: media_type.into(),
            digest,
            size,
        }
    }

    /// Refer to a layer stored on disk. `staging` keeps a temporary
    /// directory holding the file alive for as long as the blob exists.
    pub fn from_file(
        path: impl Into<PathBuf>,
        media_type: impl Into<String>,
        digest: impl Into<String>,
        size: u64,
        staging: Option<Arc<TempDir>>,
    ) -> Self {
        Self {
            source: BlobSource::File {
                path: path.into(),
                _staging: staging,
            },
            media_type: media_type.into(),
            digest: digest.into(),
            size,
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Digest of the compressed bytes (`sha256:<hex>`).
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Size of the compressed bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// On-disk location, for file-backed blobs.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            BlobSource::File { path, .. } => Some(path),
            BlobSource::Memory(_) => None,
        }
    }

    /// Open the raw (possibly compressed) blob bytes.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match &self.source {
            BlobSource::Memory(data) => Ok(Box::new(Cursor::new(SharedBytes(data.clone())))),
            BlobSource::File { path, .. } => {
                let file = File::open(path).map_err(|e| {
                    InjectError::OciImageError(format!(
                        "Failed to open layer {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Box::new(BufReader::new(file)))
            }
        }
    }

    /// Open the uncompressed tar stream of this layer.
    pub fn open_tar(&self) -> Result<Box<dyn Read + Send>> {
        tar_stream(self.open()?, &self.media_type)
    }

    /// Read the whole compressed blob into memory.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        match &self.source {
            BlobSource::Memory(data) => Ok(data.as_ref().clone()),
            BlobSource::File { .. } => {
                let mut data = Vec::with_capacity(self.size as usize);
                self.open()?.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}
