//! Registry image references (`ghcr.io/org/app:1.2`, `nginx`, `repo@sha256:…`).

use cainject_core::error::{InjectError, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const OFFICIAL_NAMESPACE: &str = "library";

/// Parsed registry image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if any
    pub registry: String,
    /// Repository path inside the registry
    pub repository: String,
    pub tag: Option<String>,
    /// Content digest (`algorithm:hex`)
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference, applying Docker Hub defaults.
    ///
    /// `nginx` becomes `docker.io/library/nginx:latest`; a reference that
    /// carries a digest gets no default tag.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(InjectError::OciImageError("Empty image reference".to_string()));
        }

        let (name_tag, digest) = split_digest(reference)?;
        let (name, tag) = split_tag(name_tag);
        let (registry, repository) = split_registry(name)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository[:tag][@digest]`
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Same repository, addressed by tag only.
    ///
    /// Pushing to a digest reference is meaningless once layers are added,
    /// so sinks drop the digest and keep (or default) the tag.
    pub fn for_push(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(self.tag.clone().unwrap_or_else(|| DEFAULT_TAG.to_string())),
            digest: None,
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn split_digest(reference: &str) -> Result<(&str, Option<String>)> {
    match reference.rsplit_once('@') {
        Some((name, digest)) => {
            if !digest.contains(':') {
                return Err(InjectError::OciImageError(format!(
                    "Invalid digest in reference '{}': expected algorithm:hex",
                    reference
                )));
            }
            Ok((name, Some(digest.to_string())))
        }
        None => Ok((reference, None)),
    }
}

/// Split `name[:tag]`. Only a colon in the last path component starts a
/// tag; a bare `host:port` is kept whole.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name_tag[last_start..].rfind(':') {
        Some(colon) => {
            let colon = last_start + colon;
            let tag = &name_tag[colon + 1..];
            let is_port = last_start == 0 && tag.chars().all(|c| c.is_ascii_digit());
            if is_port {
                (name_tag, None)
            } else {
                (&name_tag[..colon], Some(tag))
            }
        }
        None => (name_tag, None),
    }
}

/// A first component with a dot or port, or `localhost`, names a registry.
fn split_registry(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(InjectError::OciImageError(format!(
                    "Empty repository in reference '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("{}/{}", OFFICIAL_NAMESPACE, name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}
