//! OCI image layouts and the staged image every transport exchanges.
//!
//! ```text
//! image/
//! ├── oci-layout      {"imageLayoutVersion":"1.0.0"}
//! ├── index.json      image index, one manifest descriptor
//! └── blobs/
//!     └── sha256/
//!         ├── <manifest>
//!         ├── <config>
//!         └── <layers>
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempDir};

use cainject_core::error::{InjectError, Result};

use crate::layer::{
    sha256_digest, EntryCallback, FileMetadata, InterceptingReader, LayerBlob, SynthesizedLayer,
    DOCKER_LAYER_GZIP, OCI_LAYER_GZIP,
};

pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const INDEX_FILE: &str = "index.json";
pub const BLOBS_DIR: &str = "blobs";

pub(crate) const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

pub const ANNOTATION_BASE_DIGEST: &str = "org.opencontainers.image.base.digest";
pub const ANNOTATION_BASE_NAME: &str = "org.opencontainers.image.base.name";
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const DOCKER_CONFIG_PREFIX: &str = "application/vnd.docker.";

/// Nested indexes followed before giving up.
const MAX_INDEX_DEPTH: usize = 4;

/// Where an image came from, recorded on the patched manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub base_digest: String,
    pub base_name: String,
}

/// A single-platform image held between source and sink.
#[derive(Debug, Clone)]
pub struct StagedImage {
    manifest: ImageManifest,
    manifest_bytes: Vec<u8>,
    config: Vec<u8>,
    layers: Vec<LayerBlob>,
    ref_name: Option<String>,
    base_digest: Option<String>,
}

impl StagedImage {
    /// Assemble an image from its raw manifest, raw config and layer blobs.
    /// The blobs must match the manifest's layer descriptors in order.
    pub fn new(manifest_bytes: Vec<u8>, config: Vec<u8>, layers: Vec<LayerBlob>) -> Result<Self> {
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| InjectError::OciImageError(format!("Failed to parse manifest: {}", e)))?;

        if manifest.layers().len() != layers.len() {
            return Err(InjectError::OciImageError(format!(
                "Manifest lists {} layers but {} blobs were provided",
                manifest.layers().len(),
                layers.len()
            )));
        }
        for (descriptor, blob) in manifest.layers().iter().zip(&layers) {
            if descriptor.digest() != blob.digest() {
                return Err(InjectError::OciImageError(format!(
                    "Layer blob {} does not match descriptor {}",
                    blob.digest(),
                    descriptor.digest()
                )));
            }
        }

        Ok(Self {
            manifest,
            manifest_bytes,
            config,
            layers,
            ref_name: None,
            base_digest: None,
        })
    }

    /// Name written as `org.opencontainers.image.ref.name` in `index.json`.
    pub fn with_ref_name(mut self, ref_name: Option<String>) -> Self {
        self.ref_name = ref_name;
        self
    }

    /// Digest identifying the source image when it differs from the
    /// digest of the staged manifest bytes (e.g. a re-serialized pull).
    pub fn with_base_digest(mut self, digest: impl Into<String>) -> Self {
        self.base_digest = Some(digest.into());
        self
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    /// Raw image configuration JSON.
    pub fn config(&self) -> &[u8] {
        &self.config
    }

    /// Layer blobs, bottom to top.
    pub fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.ref_name.as_deref()
    }

    /// Digest of the manifest bytes.
    pub fn digest(&self) -> String {
        sha256_digest(&self.manifest_bytes)
    }

    /// Digest identifying the image this one was read from.
    pub fn base_digest(&self) -> String {
        self.base_digest.clone().unwrap_or_else(|| self.digest())
    }

    /// Whether the manifest is a Docker v2 schema 2 manifest.
    pub fn is_docker(&self) -> bool {
        match self.manifest.media_type() {
            Some(media_type) => media_type.to_string() == DOCKER_MANIFEST,
            None => self
                .manifest
                .config()
                .media_type()
                .to_string()
                .starts_with(DOCKER_CONFIG_PREFIX),
        }
    }

    pub fn manifest_media_type(&self) -> &'static str {
        if self.is_docker() {
            DOCKER_MANIFEST
        } else {
            OCI_MANIFEST
        }
    }

    /// Media type for layers appended to this image.
    pub fn layer_media_type(&self) -> &'static str {
        if self.is_docker() {
            DOCKER_LAYER_GZIP
        } else {
            OCI_LAYER_GZIP
        }
    }

    /// New image with `layers` appended on top.
    ///
    /// Each layer is gzip-compressed and added to the manifest, its
    /// uncompressed digest is appended to `rootfs.diff_ids` and a history
    /// entry is recorded. OCI manifests also get the base image
    /// annotations.
    pub fn append_layers(
        &self,
        layers: &[SynthesizedLayer],
        provenance: &Provenance,
        created: DateTime<Utc>,
    ) -> Result<StagedImage> {
        let media_type = self.layer_media_type();
        let mut blobs = self.layers.clone();
        let mut descriptors = self.manifest.layers().clone();

        for layer in layers {
            let blob = LayerBlob::from_bytes(gzip(&layer.tar)?, media_type);
            tracing::debug!(
                path = %layer.path,
                digest = %blob.digest(),
                size = blob.size(),
                "Appending layer"
            );
            descriptors.push(Descriptor::new(
                MediaType::from(media_type),
                blob.size() as i64,
                blob.digest(),
            ));
            blobs.push(blob);
        }

        let config = extend_config(&self.config, layers, created)?;
        let mut config_descriptor = self.manifest.config().clone();
        config_descriptor.set_size(config.len() as i64);
        config_descriptor.set_digest(sha256_digest(&config));

        let mut manifest = self.manifest.clone();
        manifest.set_layers(descriptors);
        manifest.set_config(config_descriptor);
        if self.is_docker() {
            tracing::debug!("Docker manifest, skipping base image annotations");
        } else {
            let mut annotations: HashMap<String, String> =
                manifest.annotations().clone().unwrap_or_default();
            annotations.insert(ANNOTATION_BASE_DIGEST.to_string(), provenance.base_digest.clone());
            annotations.insert(ANNOTATION_BASE_NAME.to_string(), provenance.base_name.clone());
            manifest.set_annotations(Some(annotations));
        }

        let manifest_bytes = serde_json::to_vec(&manifest)?;
        Ok(StagedImage {
            manifest,
            manifest_bytes,
            config,
            layers: blobs,
            ref_name: self.ref_name.clone(),
            base_digest: None,
        })
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn extend_config(
    config: &[u8],
    layers: &[SynthesizedLayer],
    created: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(config)
        .map_err(|e| InjectError::OciImageError(format!("Failed to parse image config: {}", e)))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| InjectError::OciImageError("Image config is not an object".to_string()))?;

    {
        let rootfs = object
            .entry("rootfs")
            .or_insert_with(|| json!({ "type": "layers", "diff_ids": [] }));
        let diff_ids = rootfs
            .as_object_mut()
            .and_then(|rootfs| rootfs.entry("diff_ids").or_insert_with(|| json!([])).as_array_mut())
            .ok_or_else(|| InjectError::OciImageError("Malformed rootfs in image config".to_string()))?;
        diff_ids.extend(layers.iter().map(|layer| Value::String(layer.diff_id())));
    }

    let created = created.to_rfc3339_opts(SecondsFormat::Secs, true);
    let history = object
        .entry("history")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| InjectError::OciImageError("Malformed history in image config".to_string()))?;
    history.extend(layers.iter().map(|layer| {
        json!({
            "created": created,
            "created_by": format!("cainject: add {}", layer.path),
            "comment": "CA certificate injection",
        })
    }));

    Ok(serde_json::to_vec(&value)?)
}

/// Path of a blob inside a layout. Only `algorithm:hex` digests are
/// accepted, so a digest cannot name a path outside `blobs/`.
pub fn blob_path(root: &Path, digest: &str) -> Result<PathBuf> {
    let (algorithm, hash) = digest
        .split_once(':')
        .ok_or_else(|| InjectError::OciImageError(format!("Invalid digest: {}", digest)))?;

    let valid = !algorithm.is_empty()
        && algorithm.chars().all(|c| c.is_ascii_alphanumeric())
        && !hash.is_empty()
        && hash.chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(InjectError::OciImageError(format!("Invalid digest: {}", digest)));
    }

    Ok(root.join(BLOBS_DIR).join(algorithm).join(hash))
}

fn read_blob(root: &Path, digest: &str) -> Result<Vec<u8>> {
    let path = blob_path(root, digest)?;
    std::fs::read(&path).map_err(|e| {
        InjectError::OciImageError(format!("Failed to read blob {}: {}", path.display(), e))
    })
}

fn write_blob(root: &Path, digest: &str, data: &[u8]) -> Result<()> {
    let path = blob_path(root, digest)?;
    if blob_is_intact(&path, digest)? {
        return Ok(());
    }
    persist_blob(&path, |writer| writer.write_all(data))
}

/// Whether a blob file exists with content matching its digest. Only
/// sha256 content is checked; other algorithms are trusted when present.
fn blob_is_intact(path: &Path, digest: &str) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    if !digest.starts_with("sha256:") {
        return Ok(true);
    }

    let mut hasher = Sha256::new();
    std::io::copy(&mut File::open(path)?, &mut hasher)?;
    let intact = format!("sha256:{}", hex::encode(hasher.finalize())) == digest;
    if !intact {
        tracing::warn!(path = %path.display(), "Replacing blob whose content does not match its digest");
    }
    Ok(intact)
}

/// Write a blob through a temporary file next to it, renamed into place
/// once complete. A failed write leaves nothing under the digest.
fn persist_blob(
    path: &Path,
    write: impl FnOnce(&mut dyn Write) -> std::io::Result<()>,
) -> Result<()> {
    let blob_error = |e: std::io::Error| {
        InjectError::OciImageError(format!("Failed to write blob {}: {}", path.display(), e))
    };
    let dir = path
        .parent()
        .ok_or_else(|| InjectError::OciImageError(format!("Invalid blob path {}", path.display())))?;

    let mut staged = NamedTempFile::new_in(dir).map_err(blob_error)?;
    {
        let mut writer = BufWriter::new(staged.as_file_mut());
        write(&mut writer).map_err(blob_error)?;
        writer.flush().map_err(blob_error)?;
    }
    staged.persist(path).map_err(|e| blob_error(e.error))?;
    Ok(())
}

/// Open a layer's compressed bytes, logging every entry on the side when
/// `trace_layers` is set.
pub fn open_traced(layer: &LayerBlob, trace_layers: bool) -> Result<Box<dyn Read + Send>> {
    let raw = layer.open()?;
    if !trace_layers {
        return Ok(raw);
    }

    let digest = layer.digest().to_string();
    let callback: EntryCallback = Box::new(move |entry: &FileMetadata| {
        tracing::info!(
            layer = %digest,
            path = %entry.path,
            kind = %entry.kind,
            size = entry.size,
            "Layer entry"
        );
    });
    Ok(Box::new(InterceptingReader::new(raw, layer.media_type(), callback)))
}

/// `index.json` pointing at the image's manifest.
pub(crate) fn index_json(image: &StagedImage) -> Result<Vec<u8>> {
    let mut descriptor = json!({
        "mediaType": image.manifest_media_type(),
        "digest": image.digest(),
        "size": image.manifest_bytes().len(),
    });
    if let Some(ref_name) = image.ref_name() {
        descriptor["annotations"] = json!({ ANNOTATION_REF_NAME: ref_name });
    }

    let index = json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [descriptor],
    });
    Ok(serde_json::to_vec_pretty(&index)?)
}

/// Read the image of an OCI layout directory.
///
/// Layer blobs stay on disk; `staging` keeps a temporary layout alive for
/// as long as the returned blobs exist. Indexes listing several platforms
/// resolve to the linux image for the host architecture.
pub fn read_layout(root: &Path, staging: Option<Arc<TempDir>>) -> Result<StagedImage> {
    for required in [OCI_LAYOUT_FILE, INDEX_FILE] {
        if !root.join(required).is_file() {
            return Err(InjectError::OciImageError(format!(
                "Not an OCI layout: missing {} in {}",
                required,
                root.display()
            )));
        }
    }

    let index_data = std::fs::read(root.join(INDEX_FILE))?;
    let index: ImageIndex = serde_json::from_slice(&index_data)
        .map_err(|e| InjectError::OciImageError(format!("Failed to parse index.json: {}", e)))?;
    let ref_name = index
        .manifests()
        .first()
        .and_then(|d| d.annotations().as_ref())
        .and_then(|a| a.get(ANNOTATION_REF_NAME))
        .cloned();

    let descriptor = select_manifest(root, index.manifests(), 0)?;
    let manifest_bytes = read_blob(root, descriptor.digest())?;
    let actual = sha256_digest(&manifest_bytes);
    if &actual != descriptor.digest() {
        return Err(InjectError::OciImageError(format!(
            "Manifest digest mismatch: expected {}, found {}",
            descriptor.digest(),
            actual
        )));
    }

    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| InjectError::OciImageError(format!("Failed to parse manifest: {}", e)))?;
    let config = read_blob(root, manifest.config().digest())?;

    let layers = manifest
        .layers()
        .iter()
        .map(|layer| {
            let path = blob_path(root, layer.digest())?;
            if !path.is_file() {
                return Err(InjectError::OciImageError(format!(
                    "Missing layer blob {}",
                    layer.digest()
                )));
            }
            Ok(LayerBlob::from_file(
                path,
                layer.media_type().to_string(),
                layer.digest().as_str(),
                layer.size().max(0) as u64,
                staging.clone(),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(
        layout = %root.display(),
        manifest = %descriptor.digest(),
        layers = layers.len(),
        "Read OCI layout"
    );

    Ok(StagedImage::new(manifest_bytes, config, layers)?.with_ref_name(ref_name))
}

fn select_manifest(root: &Path, descriptors: &[Descriptor], depth: usize) -> Result<Descriptor> {
    if depth > MAX_INDEX_DEPTH {
        return Err(InjectError::OciImageError("Image indexes nested too deeply".to_string()));
    }

    let descriptor = descriptors
        .iter()
        .find(|d| matches_host_platform(d))
        .or_else(|| descriptors.first())
        .ok_or_else(|| InjectError::OciImageError("No manifests in image index".to_string()))?;

    let media_type = descriptor.media_type().to_string();
    if media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST {
        let nested: ImageIndex = serde_json::from_slice(&read_blob(root, descriptor.digest())?)
            .map_err(|e| InjectError::OciImageError(format!("Failed to parse image index: {}", e)))?;
        return select_manifest(root, nested.manifests(), depth + 1);
    }
    Ok(descriptor.clone())
}

/// OCI name of the host CPU architecture.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn matches_host_platform(descriptor: &Descriptor) -> bool {
    descriptor.platform().as_ref().map_or(false, |p| {
        p.os().to_string() == "linux" && p.architecture().to_string() == host_architecture()
    })
}

/// Write `image` as an OCI layout under `root`. Blobs already present are
/// kept, so writing back into the source layout only adds new blobs.
pub fn write_layout(root: &Path, image: &StagedImage, trace_layers: bool) -> Result<()> {
    let blobs_dir = root.join(BLOBS_DIR).join("sha256");
    std::fs::create_dir_all(&blobs_dir).map_err(|e| {
        InjectError::OciImageError(format!(
            "Failed to create {}: {}",
            blobs_dir.display(),
            e
        ))
    })?;

    for layer in image.layers() {
        let path = blob_path(root, layer.digest())?;
        if blob_is_intact(&path, layer.digest())? {
            tracing::debug!(digest = %layer.digest(), "Layer blob already present");
            continue;
        }
        let mut reader = open_traced(layer, trace_layers)?;
        persist_blob(&path, |writer| std::io::copy(&mut reader, writer).map(|_| ()))?;
    }

    write_blob(root, image.manifest().config().digest(), image.config())?;
    write_blob(root, &image.digest(), image.manifest_bytes())?;
    std::fs::write(root.join(INDEX_FILE), index_json(image)?)?;
    std::fs::write(root.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)?;

    tracing::info!(
        layout = %root.display(),
        digest = %image.digest(),
        layers = image.layers().len(),
        "Wrote OCI layout"
    );
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::write_test_layout;
    use super::*;
    use crate::layer::reader::test_support::{gzip_layer, TestEntry};
    use crate::layer::LayerSynthesizer;
    use crate::layer::LayerPatch;

    fn base_layer() -> Vec<u8> {
        gzip_layer(&[TestEntry::File("etc/ssl/cert.pem", b"bundle")])
    }

    fn synthesized(path: &str) -> SynthesizedLayer {
        LayerSynthesizer::new(Utc::now())
            .synthesize(&LayerPatch::create(path, b"ca".to_vec()))
            .unwrap()
    }

    fn provenance() -> Provenance {
        Provenance {
            base_digest: "sha256:0000".to_string(),
            base_name: "docker.io/library/alpine:3.19".to_string(),
        }
    }

    #[test]
    fn test_read_layout_round_trip() {
        let dir = TempDir::new().unwrap();
        let written = write_test_layout(dir.path(), &[base_layer()], false);

        let image = read_layout(dir.path(), None).unwrap();
        assert_eq!(image.digest(), written.digest());
        assert_eq!(image.base_digest(), written.digest());
        assert_eq!(image.layers().len(), 1);
        assert!(image.layers()[0].path().is_some());
        assert_eq!(image.layers()[0].to_vec().unwrap(), base_layer());
        assert_eq!(image.ref_name(), Some("base"));
        assert!(!image.is_docker());
    }

    #[test]
    fn test_read_layout_rejects_non_layouts() {
        let dir = TempDir::new().unwrap();
        assert!(read_layout(dir.path(), None).is_err());

        std::fs::write(dir.path().join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT).unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), r#"{"schemaVersion":2,"manifests":[]}"#)
            .unwrap();
        assert!(read_layout(dir.path(), None).is_err());
    }

    #[test]
    fn test_read_layout_detects_tampered_manifest() {
        let dir = TempDir::new().unwrap();
        let image = write_test_layout(dir.path(), &[base_layer()], false);
        let path = blob_path(dir.path(), &image.digest()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.push(b' ');
        std::fs::write(&path, bytes).unwrap();

        let err = read_layout(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn test_blob_path_validation() {
        let root = Path::new("/layout");
        assert_eq!(
            blob_path(root, "sha256:ab12").unwrap(),
            PathBuf::from("/layout/blobs/sha256/ab12")
        );
        assert!(blob_path(root, "ab12").is_err());
        assert!(blob_path(root, "sha256:../../etc/passwd").is_err());
        assert!(blob_path(root, "../x:ab").is_err());
        assert!(blob_path(root, "sha256:").is_err());
    }

    #[test]
    fn test_append_layers_updates_manifest_and_config() {
        let dir = TempDir::new().unwrap();
        let base = write_test_layout(dir.path(), &[base_layer()], false);
        let layers = vec![synthesized("/etc/ssl/cert.pem"), synthesized("/usr/local/share/ca-certificates/x.crt")];

        let patched = base.append_layers(&layers, &provenance(), Utc::now()).unwrap();

        assert_eq!(patched.layers().len(), 3);
        assert_eq!(patched.manifest().layers().len(), 3);
        for (blob, layer) in patched.layers()[1..].iter().zip(&layers) {
            assert_eq!(blob.media_type(), OCI_LAYER_GZIP);
            assert_ne!(blob.to_vec().unwrap(), layer.tar);
            let mut tar = Vec::new();
            blob.open_tar().unwrap().read_to_end(&mut tar).unwrap();
            assert_eq!(tar, layer.tar);
        }

        let config: Value = serde_json::from_slice(patched.config()).unwrap();
        let diff_ids = config["rootfs"]["diff_ids"].as_array().unwrap();
        assert_eq!(diff_ids.len(), 2);
        assert_eq!(diff_ids[0], layers[0].diff_id());
        assert_eq!(diff_ids[1], layers[1].diff_id());
        assert_eq!(config["history"].as_array().unwrap().len(), 3);
        assert_eq!(
            patched.manifest().config().digest(),
            &sha256_digest(patched.config())
        );

        let annotations = patched.manifest().annotations().clone().unwrap();
        assert_eq!(annotations[ANNOTATION_BASE_DIGEST], "sha256:0000");
        assert_eq!(annotations[ANNOTATION_BASE_NAME], "docker.io/library/alpine:3.19");
        assert_ne!(patched.digest(), base.digest());

        // The base image is untouched
        assert_eq!(base.layers().len(), 1);
    }

    #[test]
    fn test_append_layers_to_docker_image() {
        let dir = TempDir::new().unwrap();
        let base = write_test_layout(dir.path(), &[base_layer()], true);
        assert!(base.is_docker());

        let patched = base
            .append_layers(&[synthesized("/etc/ssl/cert.pem")], &provenance(), Utc::now())
            .unwrap();
        assert_eq!(patched.layers()[1].media_type(), DOCKER_LAYER_GZIP);
        assert_eq!(
            patched.manifest().layers()[1].media_type().to_string(),
            DOCKER_LAYER_GZIP
        );
        assert!(patched.manifest().annotations().is_none());
        assert_eq!(patched.manifest_media_type(), DOCKER_MANIFEST);
    }

    #[test]
    fn test_write_layout_round_trip_after_append() {
        let source = TempDir::new().unwrap();
        let base = write_test_layout(source.path(), &[base_layer()], false);
        let image = read_layout(source.path(), None).unwrap();
        let patched = image
            .append_layers(&[synthesized("/etc/ssl/cert.pem")], &provenance(), Utc::now())
            .unwrap();

        let dest = TempDir::new().unwrap();
        write_layout(dest.path(), &patched, true).unwrap();

        let reread = read_layout(dest.path(), None).unwrap();
        assert_eq!(reread.digest(), patched.digest());
        assert_eq!(reread.layers().len(), 2);
        assert_eq!(reread.layers()[0].digest(), base.layers()[0].digest());
        assert_eq!(reread.config(), patched.config());
        assert_eq!(reread.ref_name(), Some("base"));
    }

    #[test]
    fn test_write_layout_replaces_truncated_blobs() {
        let source = TempDir::new().unwrap();
        let image = write_test_layout(source.path(), &[base_layer()], false);
        let layer = &image.layers()[0];
        let mut layer_bytes = Vec::new();
        layer.open().unwrap().read_to_end(&mut layer_bytes).unwrap();

        // Leftovers of an interrupted write under the final digests
        let dest = TempDir::new().unwrap();
        write_layout(dest.path(), &image, false).unwrap();
        let layer_path = blob_path(dest.path(), layer.digest()).unwrap();
        std::fs::write(&layer_path, &layer_bytes[..layer_bytes.len() / 2]).unwrap();
        let config_digest = image.manifest().config().digest().to_string();
        let config_path = blob_path(dest.path(), &config_digest).unwrap();
        std::fs::write(&config_path, b"{").unwrap();

        write_layout(dest.path(), &image, false).unwrap();

        assert_eq!(std::fs::read(&layer_path).unwrap(), layer_bytes);
        assert_eq!(std::fs::read(&config_path).unwrap(), image.config());
        let reread = read_layout(dest.path(), None).unwrap();
        assert_eq!(reread.digest(), image.digest());
        let blobs: Vec<_> = std::fs::read_dir(dest.path().join("blobs/sha256"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(blobs.len(), 3, "no staging files left behind: {blobs:?}");
    }

    #[test]
    fn test_blob_is_intact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let digest = sha256_digest(b"layer");
        assert!(!blob_is_intact(&path, &digest).unwrap());
        std::fs::write(&path, b"lay").unwrap();
        assert!(!blob_is_intact(&path, &digest).unwrap());
        std::fs::write(&path, b"layer").unwrap();
        assert!(blob_is_intact(&path, &digest).unwrap());
        assert!(blob_is_intact(&path, "sha512:abcd").unwrap());
    }

    #[test]
    fn test_select_manifest_follows_nested_index() {
        let dir = TempDir::new().unwrap();
        let image = write_test_layout(dir.path(), &[base_layer()], false);

        let nested = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "manifests": [
                {
                    "mediaType": OCI_MANIFEST,
                    "digest": "sha256:ffff",
                    "size": 1,
                    "platform": { "os": "linux", "architecture": "s390x" }
                },
                {
                    "mediaType": OCI_MANIFEST,
                    "digest": image.digest(),
                    "size": image.manifest_bytes().len(),
                    "platform": { "os": "linux", "architecture": host_architecture() }
                }
            ]
        }))
        .unwrap();
        let nested_digest = sha256_digest(&nested);
        std::fs::write(blob_path(dir.path(), &nested_digest).unwrap(), &nested).unwrap();
        std::fs::write(
            dir.path().join(INDEX_FILE),
            serde_json::to_vec(&json!({
                "schemaVersion": 2,
                "manifests": [{ "mediaType": OCI_INDEX, "digest": nested_digest, "size": nested.len() }]
            }))
            .unwrap(),
        )
        .unwrap();

        let reread = read_layout(dir.path(), None).unwrap();
        assert_eq!(reread.digest(), image.digest());
    }

    #[test]
    fn test_staged_image_rejects_mismatched_blobs() {
        let dir = TempDir::new().unwrap();
        let image = write_test_layout(dir.path(), &[base_layer()], false);
        let other = LayerBlob::from_bytes(b"other".to_vec(), OCI_LAYER_GZIP);

        assert!(StagedImage::new(image.manifest_bytes().to_vec(), image.config().to_vec(), vec![]).is_err());
        assert!(StagedImage::new(image.manifest_bytes().to_vec(), image.config().to_vec(), vec![other]).is_err());
    }
}
