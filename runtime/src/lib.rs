//! cainject runtime - CA injection into container images.
//!
//! Builds a random-access view of an image's layers, finds the trust stores
//! inside it (PEM bundles, Java keystores, distribution anchor directories)
//! and appends one small layer per patched file, leaving the original
//! layers untouched.

#![allow(clippy::result_large_err)]

pub mod compose;
pub mod inject;
pub mod layer;
pub mod oci;
pub mod openssl;
pub mod osinfo;
pub mod snapshot;
pub mod truststore;

// Re-export common types
pub use compose::{compose, PatchComposer};
pub use inject::{default_handlers, run, scan, InjectReport, ScanReport};
pub use layer::{FileMetadata, LayerBlob, LayerPatch, LayerSynthesizer, SynthesizedLayer};
pub use oci::{ImageLocation, ImageReference, ImageSink, ImageSource, RegistryAuth, StagedImage, Transport};
pub use openssl::subject_hash;
pub use osinfo::{OsDetector, OsInfo};
pub use snapshot::{ImageSnapshot, ResolvedFile};
pub use truststore::{CaCertificate, StorePatch, TrustStoreFormat, TrustStoreHandler};

/// cainject runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
