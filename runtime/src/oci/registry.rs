//! Container registry transport built on `oci-distribution`.

use std::io::Read;
use std::path::Path;

use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer, PushResponse};
use oci_distribution::manifest::{ImageIndexEntry, OciImageManifest, OCI_IMAGE_MEDIA_TYPE};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use serde_json::json;

use cainject_core::error::{InjectError, Result};

use super::layout::{
    blob_path, host_architecture, open_traced, StagedImage, ANNOTATION_REF_NAME, BLOBS_DIR,
    INDEX_FILE, OCI_LAYOUT_CONTENT, OCI_LAYOUT_FILE,
};
use super::reference::ImageReference;
use crate::layer::sha256_digest;

/// Registry credentials.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Credentials from `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`;
    /// anonymous unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulls single-platform images into OCI layouts.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryPuller {
    pub fn new(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Pull `reference` into an OCI layout at `target_dir` and return the
    /// registry's manifest digest.
    ///
    /// The manifest is stored as re-serialized by the client, so the
    /// layout's own manifest digest can differ from the returned one.
    pub async fn pull(&self, reference: &ImageReference, target_dir: &Path) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        let registry_error = |message: String| InjectError::RegistryError {
            registry: reference.registry.clone(),
            message,
        };

        tracing::info!(reference = %reference, "Pulling image");

        let blobs_dir = target_dir.join(BLOBS_DIR).join("sha256");
        std::fs::create_dir_all(&blobs_dir)?;

        let (manifest, remote_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| registry_error(format!("Failed to pull manifest: {}", e)))?;

        let mut config = Vec::new();
        self.client
            .pull_blob(&oci_ref, &manifest.config, &mut config)
            .await
            .map_err(|e| registry_error(format!("Failed to pull config: {}", e)))?;
        std::fs::write(blob_path(target_dir, &manifest.config.digest)?, &config)?;

        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            let mut data = Vec::new();
            self.client
                .pull_blob(&oci_ref, layer, &mut data)
                .await
                .map_err(|e| registry_error(format!("Failed to pull layer {}: {}", layer.digest, e)))?;
            std::fs::write(blob_path(target_dir, &layer.digest)?, &data)?;
        }

        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_digest = sha256_digest(&manifest_bytes);
        std::fs::write(blob_path(target_dir, &manifest_digest)?, &manifest_bytes)?;

        let media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| OCI_IMAGE_MEDIA_TYPE.to_string());
        let index = serde_json::to_vec_pretty(&json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": media_type,
                "digest": manifest_digest,
                "size": manifest_bytes.len(),
                "annotations": { ANNOTATION_REF_NAME: reference.full_reference() },
            }],
        }))?;
        std::fs::write(target_dir.join(INDEX_FILE), index)?;
        std::fs::write(target_dir.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)?;

        tracing::info!(reference = %reference, digest = %remote_digest, "Image pulled");
        Ok(remote_digest)
    }
}

/// Result of a successful push.
#[derive(Debug, Clone)]
pub struct PushResult {
    pub config_url: String,
    pub manifest_url: String,
}

/// Pushes staged images to a registry.
pub struct RegistryPusher {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryPusher {
    pub fn new(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Push every blob of `image` and then its manifest.
    pub async fn push(
        &self,
        reference: &ImageReference,
        image: &StagedImage,
        trace_layers: bool,
    ) -> Result<PushResult> {
        let reference = reference.for_push();
        let oci_ref = to_oci_reference(&reference)?;

        tracing::info!(reference = %reference, layers = image.layers().len(), "Pushing image");

        let manifest: OciImageManifest = serde_json::from_slice(image.manifest_bytes())?;
        let config = Config::new(
            image.config().to_vec(),
            manifest.config.media_type.clone(),
            None,
        );

        let mut layers = Vec::with_capacity(image.layers().len());
        for layer in image.layers() {
            let mut data = Vec::with_capacity(layer.size() as usize);
            open_traced(layer, trace_layers)?.read_to_end(&mut data)?;
            layers.push(ImageLayer::new(data, layer.media_type().to_string(), None));
        }

        let response: PushResponse = self
            .client
            .push(&oci_ref, &layers, config, &self.auth.to_oci_auth(), Some(manifest))
            .await
            .map_err(|e| InjectError::RegistryError {
                registry: reference.registry.clone(),
                message: format!("Failed to push image: {}", e),
            })?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Image pushed"
        );
        Ok(PushResult {
            config_url: response.config_url,
            manifest_url: response.manifest_url,
        })
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        InjectError::OciImageError(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Selects the linux image for the host architecture from an index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = host_architecture();
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_distribution::manifest::Platform;

    #[test]
    fn test_registry_auth() {
        assert!(RegistryAuth::anonymous().is_anonymous());
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));

        let auth = RegistryAuth::basic("ci", "token");
        assert!(!auth.is_anonymous());
        assert!(matches!(
            auth.to_oci_auth(),
            OciRegistryAuth::Basic(u, p) if u == "ci" && p == "token"
        ));
    }

    #[test]
    fn test_to_oci_reference() {
        let r = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        assert_eq!(to_oci_reference(&r).unwrap().to_string(), "ghcr.io/org/app:v1");

        let r = ImageReference::parse(
            "ghcr.io/org/app@sha256:2d93f9a0a5b3b9e0ff7bfa4bb9e2d8a3bd1c5e0d3e4f5a6b7c8d9e0f1a2b3c4d",
        )
        .unwrap();
        assert!(to_oci_reference(&r).unwrap().to_string().contains("@sha256:"));
        assert_eq!(
            to_oci_reference(&r.for_push()).unwrap().to_string(),
            "ghcr.io/org/app:latest"
        );
    }

    #[test]
    fn test_linux_platform_resolver() {
        let entry = |os: &str, arch: &str, digest: &str| ImageIndexEntry {
            media_type: OCI_IMAGE_MEDIA_TYPE.to_string(),
            digest: digest.to_string(),
            size: 1,
            platform: Some(Platform {
                architecture: arch.to_string(),
                os: os.to_string(),
                os_version: None,
                os_features: None,
                variant: None,
                features: None,
            }),
            annotations: None,
        };

        let manifests = vec![
            entry("windows", host_architecture(), "sha256:win"),
            entry("linux", "s390x", "sha256:s390x"),
            entry("linux", host_architecture(), "sha256:host"),
        ];
        assert_eq!(linux_platform_resolver(&manifests).as_deref(), Some("sha256:host"));
        assert_eq!(linux_platform_resolver(&manifests[..2]), None);
    }
}
