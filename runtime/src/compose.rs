//! Composition of trust-store handlers into one patch run.

use cainject_core::error::{InjectError, Result};

use crate::snapshot::ImageSnapshot;
use crate::truststore::{CaCertificate, StorePatch, TrustStoreHandler};

/// Runs handlers in order and concatenates their patches.
///
/// The first failing handler aborts the run; its error is wrapped with the
/// handler name.
pub struct PatchComposer {
    handlers: Vec<Box<dyn TrustStoreHandler>>,
}

impl PatchComposer {
    pub fn new(handlers: Vec<Box<dyn TrustStoreHandler>>) -> Self {
        Self { handlers }
    }

    /// Names of the composed handlers, in run order.
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn patch(&self, snapshot: &ImageSnapshot, ca: &CaCertificate) -> Result<Vec<StorePatch>> {
        let mut patches = Vec::new();
        for handler in &self.handlers {
            let produced = handler
                .patches(snapshot, ca)
                .map_err(|e| InjectError::Handler {
                    handler: handler.name().to_string(),
                    source: Box::new(e),
                })?;
            tracing::debug!(handler = handler.name(), patches = produced.len(), "Handler finished");
            patches.extend(produced);
        }
        Ok(patches)
    }
}

/// Compose handlers into a single patch function.
pub fn compose(
    handlers: Vec<Box<dyn TrustStoreHandler>>,
) -> impl Fn(&ImageSnapshot, &CaCertificate) -> Result<Vec<StorePatch>> {
    let composer = PatchComposer::new(handlers);
    move |snapshot, ca| composer.patch(snapshot, ca)
}
