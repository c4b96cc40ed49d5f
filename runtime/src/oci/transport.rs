//! Image sources and sinks, selected by a transport prefix.
//!
//! | Prefix | Backend |
//! |--------|---------|
//! | `oci:<dir>` | OCI image layout directory |
//! | `oci-archive:<file>` | tar of an OCI image layout |
//! | `registry://<ref>`, `docker://<ref>` or a bare reference | container registry |

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use cainject_core::error::{InjectError, Result};

use super::archive::{read_archive, write_archive};
use super::layout::{read_layout, write_layout, StagedImage};
use super::reference::ImageReference;
use super::registry::{RegistryAuth, RegistryPuller, RegistryPusher};

const LAYOUT_PREFIX: &str = "oci:";
const ARCHIVE_PREFIX: &str = "oci-archive:";
const REGISTRY_PREFIXES: [&str; 2] = ["registry://", "docker://"];
const DAEMON_PREFIX: &str = "docker-daemon:";

/// Where an image is read from or written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageLocation {
    Layout(PathBuf),
    Archive(PathBuf),
    Registry(ImageReference),
}

impl ImageLocation {
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();

        if let Some(path) = location.strip_prefix(ARCHIVE_PREFIX) {
            return Ok(Self::Archive(non_empty_path(location, path)?));
        }
        if let Some(path) = location.strip_prefix(LAYOUT_PREFIX) {
            return Ok(Self::Layout(non_empty_path(location, path)?));
        }
        if location.starts_with(DAEMON_PREFIX) {
            return Err(InjectError::OciImageError(format!(
                "Container daemon transport is not supported: {}",
                location
            )));
        }

        let reference = REGISTRY_PREFIXES
            .iter()
            .find_map(|prefix| location.strip_prefix(prefix))
            .unwrap_or(location);
        Ok(Self::Registry(ImageReference::parse(reference)?))
    }
}

fn non_empty_path(location: &str, path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(InjectError::OciImageError(format!(
            "Missing path in image location '{}'",
            location
        )));
    }
    Ok(PathBuf::from(path))
}

impl std::fmt::Display for ImageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Layout(path) => write!(f, "{}{}", LAYOUT_PREFIX, path.display()),
            Self::Archive(path) => write!(f, "{}{}", ARCHIVE_PREFIX, path.display()),
            Self::Registry(reference) => write!(f, "{}", reference),
        }
    }
}

/// Yields the image to patch.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Name recorded as the base image of a patched image.
    fn name(&self) -> String;

    async fn fetch(&self) -> Result<StagedImage>;
}

/// Receives the patched image.
#[async_trait]
pub trait ImageSink: Send + Sync {
    fn name(&self) -> String;

    async fn store(&self, image: &StagedImage) -> Result<()>;
}

/// Source and sink for one [`ImageLocation`].
#[derive(Debug, Clone)]
pub struct Transport {
    location: ImageLocation,
    auth: RegistryAuth,
    trace_layers: bool,
}

impl Transport {
    /// Transport using registry credentials from the environment.
    pub fn new(location: ImageLocation) -> Self {
        Self {
            location,
            auth: RegistryAuth::from_env(),
            trace_layers: false,
        }
    }

    pub fn parse(location: &str) -> Result<Self> {
        Ok(Self::new(ImageLocation::parse(location)?))
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Log every entry of the layers written by this sink.
    pub fn with_trace_layers(mut self, trace_layers: bool) -> Self {
        self.trace_layers = trace_layers;
        self
    }

    pub fn location(&self) -> &ImageLocation {
        &self.location
    }
}

#[async_trait]
impl ImageSource for Transport {
    fn name(&self) -> String {
        self.location.to_string()
    }

    async fn fetch(&self) -> Result<StagedImage> {
        tracing::info!(source = %self.location, "Reading image");
        match &self.location {
            ImageLocation::Layout(dir) => {
                let dir = dir.clone();
                blocking(move || read_layout(&dir, None)).await
            }
            ImageLocation::Archive(path) => {
                let path = path.clone();
                blocking(move || read_archive(&path)).await
            }
            ImageLocation::Registry(reference) => {
                let staging = Arc::new(TempDir::new()?);
                let digest = RegistryPuller::new(self.auth.clone())
                    .pull(reference, staging.path())
                    .await?;
                Ok(read_layout(staging.path(), Some(staging.clone()))?.with_base_digest(digest))
            }
        }
    }
}

#[async_trait]
impl ImageSink for Transport {
    fn name(&self) -> String {
        self.location.to_string()
    }

    async fn store(&self, image: &StagedImage) -> Result<()> {
        tracing::info!(destination = %self.location, digest = %image.digest(), "Writing image");
        match &self.location {
            ImageLocation::Layout(dir) => {
                let (dir, image, trace) = (dir.clone(), image.clone(), self.trace_layers);
                blocking(move || write_layout(&dir, &image, trace)).await
            }
            ImageLocation::Archive(path) => {
                let (path, image, trace) = (path.clone(), image.clone(), self.trace_layers);
                blocking(move || write_archive(&path, &image, trace)).await
            }
            ImageLocation::Registry(reference) => {
                RegistryPusher::new(self.auth.clone())
                    .push(reference, image, self.trace_layers)
                    .await?;
                Ok(())
            }
        }
    }
}

/// Run filesystem-bound work off the async runtime.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| InjectError::Other(format!("Blocking task failed: {}", e)))?
}
