//! Java trust stores (`$JAVA_HOME/lib/security/cacerts`).

use std::collections::BTreeSet;

use chrono::Utc;

use cainject_core::error::{InjectError, Result};

use super::jks::KeyStore;
use super::pkcs12::Pkcs12TrustStore;
use super::{CaCertificate, StorePatch, TrustStoreFormat, TrustStoreHandler};
use crate::layer::LayerPatch;
use crate::snapshot::{ImageSnapshot, ResolvedFile};

/// Add a trusted CA to a Java trust store.
///
/// The store is loaded as JKS with `password` and the CA bytes are stored
/// as given. When the content is not a JKS at all it is read as a
/// passwordless PKCS#12 store instead, the CA is added as DER, and the
/// store is written back in the same format.
pub fn patch_truststore(
    store: &[u8],
    ca: &CaCertificate,
    alias: &str,
    password: &str,
    timestamp_ms: u64,
) -> Result<(Vec<u8>, TrustStoreFormat)> {
    match KeyStore::load(store, password) {
        Ok(mut keystore) => {
            keystore.set_trusted_certificate(alias, ca.pem().to_vec(), timestamp_ms);
            Ok((keystore.store(password)?, TrustStoreFormat::JavaKeyStore))
        }
        Err(e) if e.is_format_mismatch() => {
            tracing::debug!(error = %e, "Not a JKS keystore, trying PKCS#12");
            let mut pkcs12 = Pkcs12TrustStore::load(store)?;
            pkcs12.add_certificate(alias, ca.der()?);
            Ok((pkcs12.encode()?, TrustStoreFormat::Pkcs12))
        }
        Err(e) => Err(e),
    }
}

/// Adds the CA to every Java trust store in the image.
pub struct JavaKeyStoreHandler {
    suffix: String,
    alias: String,
    password: String,
}

impl JavaKeyStoreHandler {
    /// Handler for stores whose path ends in `suffix`, adding the CA under
    /// `alias`.
    pub fn new(
        suffix: impl Into<String>,
        alias: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            suffix: suffix.into(),
            alias: alias.into(),
            password: password.into(),
        }
    }

    /// Resolve every trust store path in `snapshot`, each real file once.
    pub fn locate(&self, snapshot: &ImageSnapshot) -> Result<Vec<ResolvedFile>> {
        if self.suffix.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = BTreeSet::new();
        let mut found = Vec::new();
        let candidates = snapshot
            .list_paths()
            .filter(|path| path.ends_with(&self.suffix));

        for candidate in candidates {
            let resolved = match snapshot.resolve(candidate) {
                Ok(resolved) => resolved,
                Err(e) if e.is_not_found() => {
                    tracing::warn!(path = %candidate, "Skipping Java trust store that does not resolve");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !resolved.metadata.is_regular() {
                tracing::debug!(path = %candidate, kind = %resolved.metadata.kind, "Skipping non-file trust store path");
                continue;
            }
            // JDK layouts link jre/lib/security/cacerts to the system store
            if seen.insert(resolved.path().to_string()) {
                found.push(resolved);
            }
        }

        Ok(found)
    }
}

impl TrustStoreHandler for JavaKeyStoreHandler {
    fn name(&self) -> &'static str {
        "java-keystore"
    }

    fn patches(&self, snapshot: &ImageSnapshot, ca: &CaCertificate) -> Result<Vec<StorePatch>> {
        let stores = self.locate(snapshot)?;
        if stores.is_empty() {
            return Ok(Vec::new());
        }

        let timestamp_ms = Utc::now().timestamp_millis().max(0) as u64;
        let mut patches = Vec::new();

        for resolved in stores {
            let content = snapshot.read(resolved.path())?;
            let (patched, format) =
                patch_truststore(&content, ca, &self.alias, &self.password, timestamp_ms)
                    .map_err(|e| match e {
                        InjectError::DecodeError(message) => {
                            InjectError::DecodeError(format!("{}: {}", resolved.path(), message))
                        }
                        other => other,
                    })?;

            tracing::info!(
                path = %resolved.path(),
                format = %format,
                alias = %self.alias,
                "Patching Java trust store"
            );
            patches.push(StorePatch::new(
                format,
                LayerPatch::replace(resolved.metadata, patched),
            ));
        }

        Ok(patches)
    }
}
