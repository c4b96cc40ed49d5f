//! `oci-archive:` transport: an OCI layout packed in a tar file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use cainject_core::error::{InjectError, Result};

use super::layout::{
    blob_path, index_json, open_traced, read_layout, StagedImage, BLOBS_DIR, INDEX_FILE,
    OCI_LAYOUT_CONTENT, OCI_LAYOUT_FILE,
};

/// Unpack an archive into a staging directory and read its image.
pub fn read_archive(path: &Path) -> Result<StagedImage> {
    let file = File::open(path).map_err(|e| {
        InjectError::OciImageError(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let staging = Arc::new(TempDir::new()?);

    tracing::debug!(
        archive = %path.display(),
        staging = %staging.path().display(),
        "Unpacking OCI archive"
    );
    tar::Archive::new(BufReader::new(file))
        .unpack(staging.path())
        .map_err(|e| {
            InjectError::OciImageError(format!("Failed to unpack {}: {}", path.display(), e))
        })?;

    read_layout(staging.path(), Some(staging.clone()))
}

/// Stream `image` into a new tar archive at `path`.
///
/// Blobs are written straight from their sources; nothing is staged on
/// disk first.
pub fn write_archive(path: &Path, image: &StagedImage, trace_layers: bool) -> Result<()> {
    let file = File::create(path).map_err(|e| {
        InjectError::OciImageError(format!("Failed to create {}: {}", path.display(), e))
    })?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    let root = Path::new("");

    append_file(&mut builder, OCI_LAYOUT_FILE, OCI_LAYOUT_CONTENT.as_bytes())?;
    append_file(&mut builder, INDEX_FILE, &index_json(image)?)?;
    append_dir(&mut builder, BLOBS_DIR)?;
    append_dir(&mut builder, &format!("{}/sha256", BLOBS_DIR))?;

    for layer in image.layers() {
        let name = blob_path(root, layer.digest())?;
        let mut header = file_header(layer.size());
        builder.append_data(&mut header, &name, open_traced(layer, trace_layers)?)?;
    }

    let config_name = blob_path(root, image.manifest().config().digest())?;
    append_file(&mut builder, &config_name, image.config())?;
    let manifest_name = blob_path(root, &image.digest())?;
    append_file(&mut builder, &manifest_name, image.manifest_bytes())?;

    let mut writer = builder.into_inner()?;
    writer.flush()?;

    tracing::info!(
        archive = %path.display(),
        digest = %image.digest(),
        layers = image.layers().len(),
        "Wrote OCI archive"
    );
    Ok(())
}

fn file_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: impl AsRef<Path>,
    data: &[u8],
) -> Result<()> {
    let mut header = file_header(data.len() as u64);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    builder.append_data(&mut header, name, std::io::empty())?;
    Ok(())
}
