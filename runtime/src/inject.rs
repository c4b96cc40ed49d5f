//! CA injection runs.
//!
//! ```text
//! source ──fetch──▶ StagedImage ──▶ ImageSnapshot ──handlers──▶ patches
//!                                                                 │
//! sink ◀──store── StagedImage + new layers ◀──synthesize──────────┘
//! ```

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;

use cainject_core::config::InjectConfig;
use cainject_core::error::Result;

use crate::compose::PatchComposer;
use crate::layer::LayerSynthesizer;
use crate::oci::transport::blocking;
use crate::oci::{ImageSink, ImageSource, Provenance};
use crate::osinfo::{OsDetector, OsInfo};
use crate::snapshot::{ImageSnapshot, ResolvedFile};
use crate::truststore::{
    CaCertificate, CustomLocationHandler, JavaKeyStoreHandler, PemBundleHandler, StorePatch,
    TrustStoreFormat, TrustStoreHandler,
};

/// The standard handlers, in run order: PEM bundles, Java trust stores,
/// custom anchor directory.
pub fn default_handlers(config: &InjectConfig) -> Vec<Box<dyn TrustStoreHandler>> {
    let tables = &config.tables;
    vec![
        Box::new(PemBundleHandler::new(tables.pem_bundles.iter().cloned())),
        Box::new(JavaKeyStoreHandler::new(
            tables.java_truststore_suffix.as_str(),
            config.ca_name.as_str(),
            config.java_password.as_str(),
        )),
        Box::new(CustomLocationHandler::from_tables(tables, config.ca_name.as_str())),
    ]
}

/// Outcome of an injection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectReport {
    /// Digest of the image that was read
    pub base_digest: String,
    /// Manifest digest of the image that was written
    pub manifest_digest: String,
    /// Layers in the written image
    pub layer_count: usize,
    pub layers_added: usize,
    /// Patched paths, by store format, in patch order
    pub patched: BTreeMap<TrustStoreFormat, Vec<String>>,
}

impl InjectReport {
    fn new(patches: &[StorePatch]) -> Self {
        let mut patched: BTreeMap<TrustStoreFormat, Vec<String>> = BTreeMap::new();
        for store in patches {
            patched
                .entry(store.format)
                .or_default()
                .push(store.patch.path.clone());
        }
        Self {
            base_digest: String::new(),
            manifest_digest: String::new(),
            layer_count: 0,
            layers_added: patches.len(),
            patched,
        }
    }

    pub fn paths(&self, format: TrustStoreFormat) -> &[String] {
        self.patched.get(&format).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total_patched(&self) -> usize {
        self.patched.values().map(Vec::len).sum()
    }
}

/// Patches every trust store of `snapshot` found by the default handlers.
pub fn plan(
    snapshot: &ImageSnapshot,
    config: &InjectConfig,
    ca: &CaCertificate,
) -> Result<Vec<StorePatch>> {
    let composer = PatchComposer::new(default_handlers(config));
    tracing::debug!(handlers = ?composer.handler_names(), "Running trust-store handlers");
    composer.patch(snapshot, ca)
}

/// Inject `ca` into the image of `source` and hand the result to `sink`.
///
/// One layer is appended per patched file. An image without any trust
/// store is stored unchanged.
pub async fn run(
    source: &dyn ImageSource,
    sink: &dyn ImageSink,
    config: &InjectConfig,
    ca: &CaCertificate,
) -> Result<InjectReport> {
    config.validate()?;

    let image = source.fetch().await?;
    let (patches, layers) = {
        let name = source.name();
        let layers = image.layers().to_vec();
        let config = config.clone();
        let ca = ca.clone();
        blocking(move || {
            let snapshot = ImageSnapshot::build(layers)?;
            tracing::info!(
                source = %name,
                layers = snapshot.layers().len(),
                entries = snapshot.len(),
                "Indexed image"
            );

            let patches = plan(&snapshot, &config, &ca)?;
            let synthesizer = LayerSynthesizer::now();
            let layers = patches
                .iter()
                .map(|store| synthesizer.synthesize(&store.patch))
                .collect::<Result<Vec<_>>>()?;
            Ok((patches, layers))
        })
        .await?
    };
    let mut report = InjectReport::new(&patches);
    report.base_digest = image.base_digest();

    let output = if patches.is_empty() {
        tracing::warn!(source = %source.name(), "No trust stores found, image left unchanged");
        image
    } else {
        let provenance = Provenance {
            base_digest: image.base_digest(),
            base_name: source.name(),
        };
        image.append_layers(&layers, &provenance, Utc::now())?
    };

    sink.store(&output).await?;

    report.manifest_digest = output.digest();
    report.layer_count = output.layers().len();
    tracing::info!(
        destination = %sink.name(),
        digest = %report.manifest_digest,
        patched = report.total_patched(),
        "Injection complete"
    );
    Ok(report)
}

/// Trust stores of an image, as found without patching anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub os: Option<OsInfo>,
    pub layers: usize,
    pub entries: usize,
    /// Resolved PEM bundle files
    pub pem_bundles: Vec<String>,
    /// Resolved Java trust store files
    pub java_truststores: Vec<String>,
    /// File the custom-location handler would create
    pub custom_location: Option<String>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.pem_bundles.is_empty()
            && self.java_truststores.is_empty()
            && self.custom_location.is_none()
    }
}

/// Locate the trust stores of `snapshot` the default handlers would patch.
pub fn scan_snapshot(snapshot: &ImageSnapshot, config: &InjectConfig) -> Result<ScanReport> {
    let tables = &config.tables;
    let paths = |found: Vec<ResolvedFile>| {
        found
            .iter()
            .map(|resolved| resolved.path().to_string())
            .collect::<Vec<_>>()
    };

    let pem = PemBundleHandler::new(tables.pem_bundles.iter().cloned());
    let java = JavaKeyStoreHandler::new(
        tables.java_truststore_suffix.as_str(),
        config.ca_name.as_str(),
        config.java_password.as_str(),
    );
    let custom = CustomLocationHandler::from_tables(tables, config.ca_name.as_str());

    Ok(ScanReport {
        os: OsDetector::new()?.detect(snapshot),
        layers: snapshot.layers().len(),
        entries: snapshot.len(),
        pem_bundles: paths(pem.locate(snapshot)?),
        java_truststores: paths(java.locate(snapshot)?),
        custom_location: custom.target_path(snapshot)?,
    })
}

/// Fetch the image of `source` and scan it.
pub async fn scan(source: &dyn ImageSource, config: &InjectConfig) -> Result<ScanReport> {
    let image = source.fetch().await?;
    let layers = image.layers().to_vec();
    let config = config.clone();
    blocking(move || scan_snapshot(&ImageSnapshot::build(layers)?, &config)).await
}
