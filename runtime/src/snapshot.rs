//! Random-access view of an image's merged filesystem.
//!
//! The snapshot replays the image layers base-to-top into a flat
//! `path -> FileMetadata` index (the last writer of a path wins) and
//! remembers which layer entry owns each path, so file content can be
//! streamed on demand by re-scanning just that layer.
//!
//! Whiteout entries are not interpreted: `.wh.*` markers are indexed like
//! any other file.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use cainject_core::error::{InjectError, Result};

use crate::layer::{normalize_path, FileMetadata, LayerBlob, LayerReader};

/// Where the most recent entry for a path lives.
#[derive(Debug, Clone)]
struct IndexEntry {
    metadata: FileMetadata,
    /// Index of the owning layer
    layer: usize,
    /// Position of the entry within that layer
    position: usize,
}

/// Outcome of resolving a path through symlinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    /// Path as requested (normalized)
    pub requested: String,
    /// Metadata of the terminal entry; never a symlink
    pub metadata: FileMetadata,
    /// Number of symlinks followed
    pub hops: usize,
}

impl ResolvedFile {
    /// Resolved path of the terminal entry.
    pub fn path(&self) -> &str {
        &self.metadata.path
    }
}

/// Merged, read-only view over the layers of an image.
#[derive(Debug)]
pub struct ImageSnapshot {
    layers: Vec<LayerBlob>,
    index: BTreeMap<String, IndexEntry>,
}

impl ImageSnapshot {
    /// Index every layer, base first.
    ///
    /// Fails if any layer cannot be decoded.
    pub fn build(layers: Vec<LayerBlob>) -> Result<Self> {
        let mut index = BTreeMap::new();

        for (layer_index, blob) in layers.iter().enumerate() {
            let mut reader = LayerReader::new(blob.open_tar()?);
            let mut count = 0usize;
            for (position, entry) in reader.entries()?.enumerate() {
                let entry = entry.map_err(|e| match e {
                    InjectError::DecodeError(message) => InjectError::DecodeError(format!(
                        "layer {} ({}): {}",
                        layer_index,
                        blob.digest(),
                        message
                    )),
                    other => other,
                })?;
                let metadata = entry.metadata.clone();
                index.insert(
                    metadata.path.clone(),
                    IndexEntry {
                        metadata,
                        layer: layer_index,
                        position,
                    },
                );
                count += 1;
            }
            tracing::debug!(
                layer = layer_index,
                digest = %blob.digest(),
                entries = count,
                "Indexed layer"
            );
        }

        tracing::debug!(layers = layers.len(), paths = index.len(), "Built image snapshot");

        Ok(Self { layers, index })
    }

    /// Layers of the image, base first.
    pub fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    /// Number of distinct paths in the index.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// All known paths, sorted.
    pub fn list_paths(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Metadata of the most recent entry for a path (symlinks not followed).
    pub fn metadata(&self, path: &str) -> Result<&FileMetadata> {
        let path = normalize_path(path);
        self.index
            .get(&path)
            .map(|entry| &entry.metadata)
            .ok_or_else(|| InjectError::not_found(path))
    }

    /// Resolve a path through symlinks, in the final component and in any
    /// parent directory.
    ///
    /// Absolute link targets are resolved from the image root, relative ones
    /// from the directory containing the link. Missing intermediate
    /// directories are treated as plain directories; the final component
    /// must exist. Gives up with `NotFound` after more hops than there are
    /// paths in the index, which covers link cycles.
    pub fn resolve(&self, path: &str) -> Result<ResolvedFile> {
        let requested = normalize_path(path);
        let max_hops = self.index.len();
        let mut current = requested.clone();
        let mut hops = 0usize;

        'restart: loop {
            let components: Vec<&str> = current.split('/').filter(|c| !c.is_empty()).collect();

            if components.is_empty() {
                return match self.index.get("/") {
                    Some(entry) => Ok(ResolvedFile {
                        requested,
                        metadata: entry.metadata.clone(),
                        hops,
                    }),
                    None => Err(InjectError::not_found(requested)),
                };
            }

            let mut prefix = String::new();
            for (i, component) in components.iter().enumerate() {
                prefix.push('/');
                prefix.push_str(component);
                let is_last = i + 1 == components.len();

                let Some(entry) = self.index.get(&prefix) else {
                    if is_last {
                        return Err(InjectError::not_found(requested));
                    }
                    continue;
                };

                if entry.metadata.is_symlink() {
                    hops += 1;
                    if hops > max_hops {
                        tracing::debug!(path = %requested, hops, "Symlink chain does not terminate");
                        return Err(InjectError::not_found(requested));
                    }

                    let target = entry.metadata.link_target.as_deref().unwrap_or_default();
                    let base = if target.starts_with('/') {
                        target.to_string()
                    } else {
                        format!("{}/{}", parent_dir(&prefix), target)
                    };
                    let rest = components[i + 1..].join("/");
                    let next = normalize_path(&format!("{}/{}", base, rest));

                    tracing::debug!(link = %prefix, target = %target, next = %next, "Following symlink");
                    current = next;
                    continue 'restart;
                }

                if is_last {
                    return Ok(ResolvedFile {
                        requested,
                        metadata: entry.metadata.clone(),
                        hops,
                    });
                }

                if !entry.metadata.is_dir() {
                    // A regular file used as a directory
                    return Err(InjectError::not_found(requested));
                }
            }

            return Err(InjectError::not_found(requested));
        }
    }

    /// Whether a path resolves to a directory.
    pub fn is_dir(&self, path: &str) -> bool {
        self.resolve(path)
            .map(|resolved| resolved.metadata.is_dir())
            .unwrap_or(false)
    }

    /// Open the content of a path, following symlinks.
    ///
    /// Fails if the path does not resolve to a regular file.
    pub fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let resolved = self.resolve(path)?;
        self.open_resolved(&resolved)
    }

    /// Open the content of an already resolved file.
    pub fn open_resolved(&self, resolved: &ResolvedFile) -> Result<Box<dyn Read + Send>> {
        let content = self.read_entry(resolved.path())?;
        Ok(Box::new(Cursor::new(content)))
    }

    /// Read the whole content of a path, following symlinks.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = self.resolve(path)?;
        self.read_entry(resolved.path())
    }

    fn read_entry(&self, path: &str) -> Result<Vec<u8>> {
        let entry = self
            .index
            .get(path)
            .ok_or_else(|| InjectError::not_found(path))?;

        if !entry.metadata.is_regular() {
            return Err(InjectError::UnsupportedEntry {
                path: path.to_string(),
                kind: entry.metadata.kind.to_string(),
            });
        }

        let blob = self.layers.get(entry.layer).ok_or_else(|| {
            InjectError::Other(format!("Layer {} missing for {}", entry.layer, path))
        })?;

        let mut reader = LayerReader::new(blob.open_tar()?);
        for (position, layer_entry) in reader.entries()?.enumerate() {
            let mut layer_entry = layer_entry?;
            if position < entry.position {
                continue;
            }
            if layer_entry.metadata.path != path {
                return Err(InjectError::DecodeError(format!(
                    "Layer {} changed since indexing: expected {} at entry {}, found {}",
                    blob.digest(),
                    path,
                    position,
                    layer_entry.metadata.path
                )));
            }
            return layer_entry.read_content();
        }

        Err(InjectError::DecodeError(format!(
            "Layer {} ended before entry {} ({})",
            blob.digest(),
            entry.position,
            path
        )))
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "",
        Some(idx) => &path[..idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::reader::test_support::{gzip_layer, TestEntry};
    use crate::layer::OCI_LAYER_GZIP;

    fn blob(entries: &[TestEntry<'_>]) -> LayerBlob {
        LayerBlob::from_bytes(gzip_layer(entries), OCI_LAYER_GZIP)
    }

    fn snapshot(layers: Vec<Vec<TestEntry<'_>>>) -> ImageSnapshot {
        ImageSnapshot::build(layers.iter().map(|l| blob(l)).collect()).unwrap()
    }

    #[test]
    fn test_later_layer_wins() {
        let snap = snapshot(vec![
            vec![
                TestEntry::Dir("etc/"),
                TestEntry::File("etc/motd", b"base"),
                TestEntry::File("etc/hostname", b"base-host"),
            ],
            vec![TestEntry::File("etc/motd", b"upper layer")],
        ]);

        assert_eq!(snap.metadata("/etc/motd").unwrap().size, 11);
        assert_eq!(snap.read("/etc/motd").unwrap(), b"upper layer");
        assert_eq!(snap.read("/etc/hostname").unwrap(), b"base-host");
        assert_eq!(snap.layers().len(), 2);
    }

    #[test]
    fn test_duplicate_entry_in_same_layer() {
        let snap = snapshot(vec![vec![
            TestEntry::File("etc/motd", b"first"),
            TestEntry::File("etc/motd", b"second"),
        ]]);
        assert_eq!(snap.read("/etc/motd").unwrap(), b"second");
    }

    #[test]
    fn test_list_paths_sorted() {
        let snap = snapshot(vec![vec![
            TestEntry::File("usr/bin/env", b""),
            TestEntry::Dir("etc/"),
            TestEntry::File("etc/passwd", b""),
        ]]);
        let paths: Vec<&str> = snap.list_paths().collect();
        assert_eq!(paths, vec!["/etc", "/etc/passwd", "/usr/bin/env"]);
        assert_eq!(snap.len(), 3);
    }

    #[test]
    fn test_metadata_not_found() {
        let snap = snapshot(vec![vec![TestEntry::File("etc/passwd", b"")]]);
        assert!(snap.metadata("/etc/shadow").unwrap_err().is_not_found());
        // Input paths are normalized
        assert!(snap.metadata("etc//passwd/").is_ok());
    }

    #[test]
    fn test_resolve_absolute_symlink() {
        let snap = snapshot(vec![vec![
            TestEntry::File("etc/pki/tls/certs/ca-bundle.crt", b"bundle"),
            TestEntry::Symlink("etc/ssl/cert.pem", "/etc/pki/tls/certs/ca-bundle.crt"),
        ]]);

        let resolved = snap.resolve("/etc/ssl/cert.pem").unwrap();
        assert_eq!(resolved.path(), "/etc/pki/tls/certs/ca-bundle.crt");
        assert_eq!(resolved.requested, "/etc/ssl/cert.pem");
        assert_eq!(resolved.hops, 1);
        assert_eq!(snap.read("/etc/ssl/cert.pem").unwrap(), b"bundle");
    }

    #[test]
    fn test_resolve_relative_symlink_chain() {
        let snap = snapshot(vec![vec![
            TestEntry::File("usr/share/ca/bundle.pem", b"x"),
            TestEntry::Symlink("etc/ssl/certs/bundle.crt", "../bundle.pem"),
            TestEntry::Symlink("etc/ssl/bundle.pem", "../../usr/share/ca/bundle.pem"),
        ]]);

        let resolved = snap.resolve("/etc/ssl/certs/bundle.crt").unwrap();
        assert_eq!(resolved.path(), "/usr/share/ca/bundle.pem");
        assert_eq!(resolved.hops, 2);
    }

    #[test]
    fn test_resolve_through_symlinked_directory() {
        let snap = snapshot(vec![vec![
            TestEntry::Dir("etc/pki/tls/certs/"),
            TestEntry::File("etc/pki/tls/certs/ca-bundle.crt", b"x"),
            TestEntry::Symlink("etc/ssl/certs", "../pki/tls/certs"),
        ]]);

        let resolved = snap.resolve("/etc/ssl/certs/ca-bundle.crt").unwrap();
        assert_eq!(resolved.path(), "/etc/pki/tls/certs/ca-bundle.crt");
        assert!(snap.is_dir("/etc/ssl/certs"));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let snap = snapshot(vec![vec![
            TestEntry::File("opt/jdk/lib/security/cacerts", b"x"),
            TestEntry::Symlink("etc/java/cacerts", "/opt/jdk/lib/security/cacerts"),
        ]]);

        let once = snap.resolve("/etc/java/cacerts").unwrap();
        let twice = snap.resolve(once.path()).unwrap();
        assert_eq!(twice.path(), once.path());
        assert_eq!(twice.hops, 0);
        assert_eq!(twice.metadata, once.metadata);
    }

    #[test]
    fn test_resolve_cycle_is_not_found() {
        let snap = snapshot(vec![vec![
            TestEntry::Symlink("a", "b"),
            TestEntry::Symlink("b", "/c"),
            TestEntry::Symlink("c", "a"),
        ]]);
        assert!(snap.resolve("/a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_resolve_self_loop_directory() {
        let snap = snapshot(vec![vec![TestEntry::Symlink("loop", ".")]]);
        // "/loop/x" -> "/x" which does not exist
        assert!(snap.resolve("/loop/x").unwrap_err().is_not_found());
        let snap = snapshot(vec![vec![TestEntry::Symlink("loop", "loop")]]);
        assert!(snap.resolve("/loop").unwrap_err().is_not_found());
    }

    #[test]
    fn test_resolve_dangling_symlink() {
        let snap = snapshot(vec![vec![TestEntry::Symlink("etc/ssl/cert.pem", "/missing")]]);
        assert!(snap.resolve("/etc/ssl/cert.pem").unwrap_err().is_not_found());
    }

    #[test]
    fn test_resolve_missing_intermediate_directory() {
        // Layers often omit directory entries
        let snap = snapshot(vec![vec![TestEntry::File("a/b/c/file", b"x")]]);
        assert_eq!(snap.resolve("/a/b/c/file").unwrap().path(), "/a/b/c/file");
        assert!(snap.resolve("/a/b").unwrap_err().is_not_found());
    }

    #[test]
    fn test_resolve_file_as_directory() {
        let snap = snapshot(vec![vec![
            TestEntry::File("etc/passwd", b""),
            TestEntry::File("etc/passwd/x", b""),
        ]]);
        assert!(snap.resolve("/etc/passwd/x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_open_directory_fails() {
        let snap = snapshot(vec![vec![TestEntry::Dir("etc/")]]);
        assert!(matches!(
            snap.open("/etc"),
            Err(InjectError::UnsupportedEntry { .. })
        ));
        assert!(matches!(snap.open("/missing"), Err(ref e) if e.is_not_found()));
    }

    #[test]
    fn test_build_with_hard_links() {
        let snap = snapshot(vec![vec![
            TestEntry::File("usr/bin/perl", b"#!perl"),
            TestEntry::HardLink("usr/bin/perl5.36.0", "usr/bin/perl"),
            TestEntry::File("etc/ssl/certs/ca-certificates.crt", b"bundle"),
        ]]);

        assert_eq!(snap.read("/etc/ssl/certs/ca-certificates.crt").unwrap(), b"bundle");
        assert_eq!(snap.read("/usr/bin/perl").unwrap(), b"#!perl");
        assert!(snap.metadata("/usr/bin/perl5.36.0").unwrap_err().is_not_found());
    }

    #[test]
    fn test_open_streams_content() {
        let content = vec![9u8; 70_000];
        let snap = snapshot(vec![vec![
            TestEntry::File("big", &content),
            TestEntry::File("small", b"s"),
        ]]);

        let mut data = Vec::new();
        snap.open("/big").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, content);
    }

    #[test]
    fn test_build_fails_on_corrupt_layer() {
        let layers = vec![
            blob(&[TestEntry::File("ok", b"")]),
            LayerBlob::from_bytes(vec![0x1f, 0x8b, 0, 1, 2, 3], OCI_LAYER_GZIP),
        ];
        assert!(ImageSnapshot::build(layers).is_err());
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/etc/ssl/certs"), "/etc/ssl");
        assert_eq!(parent_dir("/etc"), "");
    }
}
