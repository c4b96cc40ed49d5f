//! Sequential tar layer decoding.
//!
//! Turns an uncompressed (or gzip-compressed) tar stream into a sequence of
//! `(FileMetadata, content)` pairs. Entries must be consumed in order: the
//! reader for entry *n* is only valid until entry *n + 1* is requested.

use std::io::Read;

use cainject_core::error::{InjectError, Result};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

/// Kind of an indexed filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regular => write!(f, "regular file"),
            Self::Directory => write!(f, "directory"),
            Self::Symlink => write!(f, "symlink"),
        }
    }
}

/// Metadata of one path in an image, taken from its most recent tar header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Absolute, normalized path (e.g. `/etc/ssl/cert.pem`)
    pub path: String,
    /// Entry kind
    pub kind: EntryKind,
    /// Link target as stored in the archive (symlinks only)
    pub link_target: Option<String>,
    /// Content size in bytes
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    /// Owner id
    pub uid: u64,
    /// Group id
    pub gid: u64,
    /// Owner name, if recorded
    pub username: Option<String>,
    /// Group name, if recorded
    pub groupname: Option<String>,
    /// Modification time (seconds since epoch)
    pub mtime: u64,
}

impl FileMetadata {
    /// Fresh metadata for a new root-owned regular file with mode 0644.
    pub fn new_file(path: impl AsRef<str>, size: u64, mtime: u64) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            kind: EntryKind::Regular,
            link_target: None,
            size,
            mode: 0o644,
            uid: 0,
            gid: 0,
            username: None,
            groupname: None,
            mtime,
        }
    }

    pub fn is_regular(&self) -> bool {
        self.kind == EntryKind::Regular
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    /// Path as written into a tar archive (relative to the image root).
    pub fn archive_name(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}

/// Normalize a path to absolute POSIX form without `.`/`..` segments or a
/// trailing slash. `..` at the root stays at the root.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Validate a raw archive entry name and return its normalized absolute path.
///
/// Names must be relative, free of `..` segments and backslashes so the
/// entry stays within the image root.
pub fn validate_entry_path(name: &str) -> Result<String> {
    let invalid = name.is_empty()
        || name.contains('\\')
        || name.starts_with('/')
        || name.split('/').any(|segment| segment == "..");
    if invalid {
        return Err(InjectError::PathValidation {
            path: name.to_string(),
        });
    }
    Ok(normalize_path(name))
}

/// Reader over the entries of a single tar layer.
pub struct LayerReader<R: Read> {
    archive: Archive<R>,
}

impl<R: Read> LayerReader<GzDecoder<R>> {
    /// Read a gzip-compressed tar stream.
    pub fn gzip(compressed: R) -> Self {
        LayerReader::new(GzDecoder::new(compressed))
    }
}

impl<R: Read> LayerReader<R> {
    /// Read an uncompressed tar stream.
    pub fn new(tar: R) -> Self {
        Self {
            archive: Archive::new(tar),
        }
    }

    /// Iterate over the entries in archive order.
    pub fn entries(&mut self) -> Result<LayerEntries<'_, R>> {
        let inner = self
            .archive
            .entries()
            .map_err(|e| InjectError::DecodeError(format!("Failed to read tar stream: {}", e)))?;
        Ok(LayerEntries { inner })
    }
}

/// Iterator over validated layer entries.
pub struct LayerEntries<'a, R: 'a + Read> {
    inner: tar::Entries<'a, R>,
}

impl<'a, R: Read> Iterator for LayerEntries<'a, R> {
    type Item = Result<LayerEntry<'a, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    return Some(Err(InjectError::DecodeError(format!(
                        "Failed to read tar entry: {}",
                        e
                    ))))
                }
            };

            match entry_metadata(&entry) {
                Ok(Some(metadata)) => return Some(Ok(LayerEntry { metadata, entry })),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// One entry of a layer: its metadata plus a reader over its content.
pub struct LayerEntry<'a, R: 'a + Read> {
    pub metadata: FileMetadata,
    entry: tar::Entry<'a, R>,
}

impl<'a, R: Read> LayerEntry<'a, R> {
    /// Read the remaining content of this entry.
    pub fn read_content(&mut self) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.entry.read_to_end(&mut content).map_err(|e| {
            InjectError::DecodeError(format!(
                "Failed to read content of {}: {}",
                self.metadata.path, e
            ))
        })?;
        Ok(content)
    }
}

impl<'a, R: Read> Read for LayerEntry<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.entry.read(buf)
    }
}

/// Build metadata for an entry. Returns `None` for ignorable markers.
fn entry_metadata<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Option<FileMetadata>> {
    let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    let header = entry.header();
    let entry_type = header.entry_type();

    let kind = match entry_type {
        EntryType::Regular => EntryKind::Regular,
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink,
        // git archive and some image builders emit these
        EntryType::XGlobalHeader => return Ok(None),
        // Debian-family layers ship these (e.g. perl-base); they are never trust stores
        EntryType::Link => {
            tracing::debug!(path = %raw_name, "Skipping hard link");
            return Ok(None);
        }
        other => {
            return Err(InjectError::UnsupportedEntry {
                path: raw_name,
                kind: format!("{:?}", other),
            })
        }
    };

    let path = validate_entry_path(&raw_name)?;

    let link_target = if kind == EntryKind::Symlink {
        let target = entry.link_name_bytes().ok_or_else(|| {
            InjectError::DecodeError(format!("Symlink {} has no target", raw_name))
        })?;
        Some(String::from_utf8_lossy(&target).into_owned())
    } else {
        None
    };

    let field_error =
        |field: &str, e: std::io::Error| InjectError::DecodeError(format!("Invalid {} for {}: {}", field, raw_name, e));

    Ok(Some(FileMetadata {
        path,
        kind,
        link_target,
        size: entry.size(),
        mode: header.mode().map_err(|e| field_error("mode", e))?,
        uid: header.uid().map_err(|e| field_error("uid", e))?,
        gid: header.gid().map_err(|e| field_error("gid", e))?,
        username: header.username().ok().flatten().map(str::to_string),
        groupname: header.groupname().ok().flatten().map(str::to_string),
        mtime: header.mtime().map_err(|e| field_error("mtime", e))?,
    }))
}
