//! Single-file layer synthesis.

use chrono::{DateTime, Utc};

use cainject_core::error::{InjectError, Result};

use super::blob::sha256_digest;
use super::reader::FileMetadata;

/// Replacement content for one path in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPatch {
    /// Absolute path the content is written to
    pub path: String,
    /// New content
    pub content: Vec<u8>,
    /// Metadata of the file being replaced; `None` for newly created files
    pub original: Option<FileMetadata>,
}

impl LayerPatch {
    /// Patch replacing an existing file.
    pub fn replace(original: FileMetadata, content: Vec<u8>) -> Self {
        Self {
            path: original.path.clone(),
            content,
            original: Some(original),
        }
    }

    /// Patch introducing a new file.
    pub fn create(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content,
            original: None,
        }
    }

    pub fn is_new_file(&self) -> bool {
        self.original.is_none()
    }
}

/// An uncompressed single-entry tar layer.
#[derive(Debug, Clone)]
pub struct SynthesizedLayer {
    /// Path of the entry inside the layer
    pub path: String,
    /// Uncompressed tar bytes
    pub tar: Vec<u8>,
}

impl SynthesizedLayer {
    /// Digest of the uncompressed tar (`rootfs.diff_ids` entry).
    pub fn diff_id(&self) -> String {
        sha256_digest(&self.tar)
    }
}

/// Wraps layer patches into single-file tar layers.
#[derive(Debug, Clone, Copy)]
pub struct LayerSynthesizer {
    mtime: u64,
}

impl LayerSynthesizer {
    /// Synthesizer stamping entries with `patch_time`.
    pub fn new(patch_time: DateTime<Utc>) -> Self {
        Self {
            mtime: patch_time.timestamp().max(0) as u64,
        }
    }

    /// Synthesizer stamping entries with the current time.
    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    /// Build a tar archive holding exactly the patched file.
    ///
    /// Existing files keep their mode and ownership; size and modification
    /// time are updated. New files get a root-owned 0644 header.
    pub fn synthesize(&self, patch: &LayerPatch) -> Result<SynthesizedLayer> {
        let size = patch.content.len() as u64;
        let metadata = match &patch.original {
            Some(original) => FileMetadata {
                path: patch.path.clone(),
                size,
                mtime: self.mtime,
                kind: super::EntryKind::Regular,
                link_target: None,
                ..original.clone()
            },
            None => FileMetadata::new_file(&patch.path, size, self.mtime),
        };

        let tar_error = |e: std::io::Error| {
            InjectError::Other(format!("Failed to build layer for {}: {}", patch.path, e))
        };

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(metadata.size);
        header.set_mode(metadata.mode);
        header.set_uid(metadata.uid);
        header.set_gid(metadata.gid);
        header.set_mtime(metadata.mtime);
        if let Some(username) = &metadata.username {
            header.set_username(username).map_err(tar_error)?;
        }
        if let Some(groupname) = &metadata.groupname {
            header.set_groupname(groupname).map_err(tar_error)?;
        }

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_data(&mut header, metadata.archive_name(), patch.content.as_slice())
            .map_err(tar_error)?;
        let tar = builder.into_inner().map_err(tar_error)?;

        tracing::debug!(path = %patch.path, size, "Synthesized layer");

        Ok(SynthesizedLayer {
            path: patch.path.clone(),
            tar,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{EntryKind, LayerReader};
    use chrono::TimeZone;

    fn read_back(layer: &SynthesizedLayer) -> Vec<(FileMetadata, Vec<u8>)> {
        let mut reader = LayerReader::new(layer.tar.as_slice());
        reader
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let content = e.read_content().unwrap();
                (e.metadata.clone(), content)
            })
            .collect()
    }

    fn patch_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_synthesize_replacement_keeps_metadata() {
        let original = FileMetadata {
            path: "/etc/ssl/certs/ca-certificates.crt".to_string(),
            kind: EntryKind::Regular,
            link_target: None,
            size: 100,
            mode: 0o640,
            uid: 0,
            gid: 101,
            username: Some("root".to_string()),
            groupname: Some("ssl-cert".to_string()),
            mtime: 1_600_000_000,
        };
        let patch = LayerPatch::replace(original, vec![b'x'; 300]);
        let synth = LayerSynthesizer::new(patch_time());

        let layer = synth.synthesize(&patch).unwrap();
        let entries = read_back(&layer);

        assert_eq!(entries.len(), 1);
        let (meta, content) = &entries[0];
        assert_eq!(meta.path, "/etc/ssl/certs/ca-certificates.crt");
        assert_eq!(meta.size, 300);
        assert_eq!(meta.mode, 0o640);
        assert_eq!(meta.gid, 101);
        assert_eq!(meta.groupname.as_deref(), Some("ssl-cert"));
        assert_eq!(meta.mtime, synth.mtime());
        assert_eq!(content.len(), 300);
    }

    #[test]
    fn test_synthesize_new_file() {
        let patch = LayerPatch::create("/usr/local/share/ca-certificates/myca.crt", b"PEM".to_vec());
        assert!(patch.is_new_file());

        let layer = LayerSynthesizer::new(patch_time()).synthesize(&patch).unwrap();
        let entries = read_back(&layer);

        assert_eq!(entries.len(), 1);
        let (meta, content) = &entries[0];
        assert_eq!(meta.path, "/usr/local/share/ca-certificates/myca.crt");
        assert_eq!(meta.mode, 0o644);
        assert_eq!(meta.uid, 0);
        assert_eq!(meta.gid, 0);
        assert_eq!(meta.mtime, patch_time().timestamp() as u64);
        assert_eq!(content, b"PEM");
    }

    #[test]
    fn test_synthesize_long_path() {
        let dir = "a".repeat(120);
        let path = format!("/opt/{}/lib/security/cacerts", dir);
        let patch = LayerPatch::create(&path, vec![1, 2, 3]);

        let layer = LayerSynthesizer::now().synthesize(&patch).unwrap();
        let entries = read_back(&layer);
        assert_eq!(entries[0].0.path, path);
    }

    #[test]
    fn test_diff_id_is_tar_digest() {
        let patch = LayerPatch::create("/etc/x", b"x".to_vec());
        let layer = LayerSynthesizer::new(patch_time()).synthesize(&patch).unwrap();
        assert_eq!(layer.diff_id(), sha256_digest(&layer.tar));
        assert!(layer.diff_id().starts_with("sha256:"));
    }
}
