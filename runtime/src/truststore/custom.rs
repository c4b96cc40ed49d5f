//! Distribution anchor directories ("drop a file here" trust stores).

use std::collections::BTreeMap;

use cainject_core::config::{CustomLocation, TrustStoreTables};
use cainject_core::error::Result;

use super::{CaCertificate, StorePatch, TrustStoreFormat, TrustStoreHandler};
use crate::layer::LayerPatch;
use crate::osinfo::OsDetector;
use crate::snapshot::ImageSnapshot;

/// Writes the CA as a new file into a custom anchor directory.
///
/// The first known directory present in the image wins. Without one, the
/// distribution is detected and its registered directory is used, even if
/// the image does not have it yet.
pub struct CustomLocationHandler {
    tables: TrustStoreTables,
    ca_name: String,
}

impl CustomLocationHandler {
    pub fn new(
        locations: Vec<CustomLocation>,
        distro_locations: BTreeMap<String, String>,
        ca_name: impl Into<String>,
    ) -> Self {
        Self {
            tables: TrustStoreTables {
                custom_locations: locations,
                distro_locations,
                ..TrustStoreTables::empty()
            },
            ca_name: ca_name.into(),
        }
    }

    /// Handler using the locations of a trust-store table.
    pub fn from_tables(tables: &TrustStoreTables, ca_name: impl Into<String>) -> Self {
        Self::new(
            tables.custom_locations.clone(),
            tables.distro_locations.clone(),
            ca_name,
        )
    }

    /// Path of the file to create in `snapshot`, if any.
    pub fn target_path(&self, snapshot: &ImageSnapshot) -> Result<Option<String>> {
        for location in &self.tables.custom_locations {
            let resolved = match snapshot.resolve(&location.directory) {
                Ok(resolved) if resolved.metadata.is_dir() => resolved,
                _ => continue,
            };
            // Write into the real directory, not through a symlink
            let directory = CustomLocation::new(resolved.path(), location.file_pattern.as_str());
            tracing::debug!(directory = %location.directory, "Found custom anchor directory");
            return Ok(Some(directory.file_path(&self.ca_name)));
        }

        let Some(os) = OsDetector::new()?.detect(snapshot) else {
            tracing::debug!("No anchor directory and no os-release");
            return Ok(None);
        };

        match self.tables.distro_location(&os.vendor) {
            Some(location) => {
                tracing::debug!(vendor = %os.vendor, directory = %location.directory, "Using distribution anchor directory");
                Ok(Some(location.file_path(&self.ca_name)))
            }
            None => {
                tracing::debug!(vendor = %os.vendor, "No anchor directory registered for distribution");
                Ok(None)
            }
        }
    }
}

impl TrustStoreHandler for CustomLocationHandler {
    fn name(&self) -> &'static str {
        "custom-location"
    }

    fn patches(&self, snapshot: &ImageSnapshot, ca: &CaCertificate) -> Result<Vec<StorePatch>> {
        let Some(path) = self.target_path(snapshot)? else {
            return Ok(Vec::new());
        };

        tracing::info!(path = %path, "Adding CA to custom anchor directory");
        Ok(vec![StorePatch::new(
            TrustStoreFormat::CustomLocation,
            LayerPatch::create(path, ca.pem().to_vec()),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::reader::test_support::{gzip_layer, TestEntry};
    use crate::layer::{LayerBlob, OCI_LAYER_GZIP};

    fn snapshot(entries: &[TestEntry<'_>]) -> ImageSnapshot {
        ImageSnapshot::build(vec![LayerBlob::from_bytes(gzip_layer(entries), OCI_LAYER_GZIP)])
            .unwrap()
    }

    fn handler() -> CustomLocationHandler {
        CustomLocationHandler::from_tables(&TrustStoreTables::default(), "myca")
    }

    #[test]
    fn test_first_existing_directory_wins() {
        let snap = snapshot(&[
            TestEntry::Dir("usr/share/pki/trust/anchors/"),
            TestEntry::Dir("etc/pki/ca-trust/source/anchors/"),
        ]);
        let ca = CaCertificate::from_pem(b"PEM".to_vec());

        let patches = handler().patches(&snap, &ca).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].format, TrustStoreFormat::CustomLocation);
        assert_eq!(patches[0].patch.path, "/etc/pki/ca-trust/source/anchors/myca.pem");
        assert_eq!(patches[0].patch.content, b"PEM");
        assert!(patches[0].patch.is_new_file());
    }

    #[test]
    fn test_symlinked_directory_is_resolved() {
        let snap = snapshot(&[
            TestEntry::Dir("data/anchors/"),
            TestEntry::Symlink("usr/local/share/ca-certificates", "/data/anchors"),
        ]);
        let path = handler().target_path(&snap).unwrap();
        assert_eq!(path.as_deref(), Some("/data/anchors/myca.crt"));
    }

    #[test]
    fn test_falls_back_to_distribution() {
        let snap = snapshot(&[TestEntry::File(
            "etc/os-release",
            b"ID=alpine\nVERSION_ID=3.19.1\n",
        )]);
        let path = handler().target_path(&snap).unwrap();
        assert_eq!(path.as_deref(), Some("/usr/local/share/ca-certificates/myca.crt"));
    }

    #[test]
    fn test_unknown_distribution() {
        let snap = snapshot(&[TestEntry::File("etc/os-release", b"ID=debian\n")]);
        assert!(handler().target_path(&snap).unwrap().is_none());
    }

    #[test]
    fn test_nothing_found() {
        let snap = snapshot(&[TestEntry::File("bin/sh", b"")]);
        let ca = CaCertificate::from_pem(b"PEM".to_vec());
        assert!(handler().patches(&snap, &ca).unwrap().is_empty());
    }

    #[test]
    fn test_regular_file_is_not_a_directory() {
        let snap = snapshot(&[TestEntry::File("usr/local/share/ca-certificates", b"")]);
        assert!(handler().target_path(&snap).unwrap().is_none());
    }

    #[test]
    fn test_alternate_tables() {
        let mut distro = BTreeMap::new();
        distro.insert("wolfi".to_string(), "/etc/anchors".to_string());
        let handler = CustomLocationHandler::new(
            vec![CustomLocation::new("/etc/anchors", "corp-{name}.pem")],
            distro,
            "root",
        );
        let snap = snapshot(&[TestEntry::File("etc/os-release", b"ID=\"wolfi\"\n")]);
        assert_eq!(
            handler.target_path(&snap).unwrap().as_deref(),
            Some("/etc/anchors/corp-root.pem")
        );
    }
}
