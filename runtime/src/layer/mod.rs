//! Tar layer handling.
//!
//! Provides:
//! - Sequential decoding of (gzip-compressed) tar layers
//! - Re-openable layer blobs with compression detection
//! - Synthesis of single-file patch layers
//! - A pass-through reader that logs layer entries on the side

pub mod blob;
pub mod intercept;
pub mod reader;
pub mod synth;

pub use blob::{
    is_gzip_media_type, sha256_digest, LayerBlob, DOCKER_LAYER_GZIP, OCI_LAYER_GZIP,
    OCI_LAYER_TAR,
};
pub use intercept::{EntryCallback, InterceptingReader};
pub use reader::{
    normalize_path, validate_entry_path, EntryKind, FileMetadata, LayerEntries, LayerEntry,
    LayerReader,
};
pub use synth::{LayerPatch, LayerSynthesizer, SynthesizedLayer};
