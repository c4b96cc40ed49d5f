//! Trust-store handlers.
//!
//! Each handler looks for one kind of trust store in an image snapshot and
//! produces replacement content with the new CA added:
//! - [`PemBundleHandler`]: appends the CA to well-known PEM bundles
//! - [`JavaKeyStoreHandler`]: adds a trusted entry to Java `cacerts`
//!   (JKS, or PKCS#12 as a fallback)
//! - [`CustomLocationHandler`]: drops the CA into a distribution's anchor
//!   directory
//!
//! Absence of a store is never an error. Decode failures of a store a
//! handler matched are.

pub mod custom;
pub mod java;
pub mod jks;
pub mod pem;
pub mod pkcs12;

use std::path::Path;

use cainject_core::error::{InjectError, Result};

use crate::layer::LayerPatch;
use crate::snapshot::ImageSnapshot;

pub use custom::CustomLocationHandler;
pub use java::JavaKeyStoreHandler;
pub use pem::PemBundleHandler;

/// Trust-store format a patch was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrustStoreFormat {
    PemBundle,
    JavaKeyStore,
    Pkcs12,
    CustomLocation,
}

impl std::fmt::Display for TrustStoreFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PemBundle => write!(f, "pem-bundle"),
            Self::JavaKeyStore => write!(f, "jks"),
            Self::Pkcs12 => write!(f, "pkcs12"),
            Self::CustomLocation => write!(f, "custom-location"),
        }
    }
}

/// A layer patch tagged with the format of the store it updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePatch {
    pub format: TrustStoreFormat,
    pub patch: LayerPatch,
}

impl StorePatch {
    pub fn new(format: TrustStoreFormat, patch: LayerPatch) -> Self {
        Self { format, patch }
    }
}

/// The CA to inject, as raw PEM bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaCertificate {
    pem: Vec<u8>,
}

impl CaCertificate {
    /// Wrap PEM bytes. The content is not validated.
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Self {
        Self { pem: pem.into() }
    }

    /// Read a PEM file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| {
            InjectError::ConfigError(format!("Failed to read CA {}: {}", path.display(), e))
        })?;
        Ok(Self::from_pem(pem))
    }

    /// Raw PEM bytes, exactly as supplied.
    pub fn pem(&self) -> &[u8] {
        &self.pem
    }

    /// DER encoding of the first `CERTIFICATE` block.
    pub fn der(&self) -> Result<Vec<u8>> {
        pem::certificate_der(&self.pem)
    }

    /// OpenSSL subject hash of the certificate.
    pub fn subject_hash(&self) -> Result<String> {
        crate::openssl::subject_hash(&self.pem)
    }
}

/// A source of trust-store patches.
pub trait TrustStoreHandler: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Produce patches for every store of this kind found in `snapshot`.
    fn patches(&self, snapshot: &ImageSnapshot, ca: &CaCertificate) -> Result<Vec<StorePatch>>;
}
