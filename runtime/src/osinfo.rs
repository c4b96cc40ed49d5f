//! Linux distribution detection from image content.

use regex::Regex;
use serde::Serialize;

use cainject_core::error::{InjectError, Result};

use crate::snapshot::ImageSnapshot;

/// Distribution details guessed from well-known files in an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OsInfo {
    /// `PRETTY_NAME` from os-release
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// `ID` from os-release (e.g. `alpine`, `debian`)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vendor: String,
    /// `VERSION_ID` from os-release
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Vendor-specific release string
    #[serde(skip_serializing_if = "String::is_empty")]
    pub release: String,
    /// Userland architecture, from the dynamic linker location
    #[serde(skip_serializing_if = "String::is_empty")]
    pub architecture: String,
}

/// Dynamic linker paths probed for the architecture, in order.
const LINKERS: &[(&str, &str)] = &[
    ("/lib64/ld-linux-x86-64.so.2", "amd64"),
    ("/lib/ld-linux.so.2", "i386"),
];

/// Detects the distribution of an image.
pub struct OsDetector {
    pretty_name: Regex,
    id: Regex,
    version_id: Regex,
    ubuntu: Regex,
    centos: Regex,
    redhat: Regex,
}

impl OsDetector {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| InjectError::Other(format!("Invalid pattern {}: {}", pattern, e)))
        };

        Ok(Self {
            pretty_name: compile(r"^PRETTY_NAME=(.*)$")?,
            id: compile(r"^ID=(.*)$")?,
            version_id: compile(r"^VERSION_ID=(.*)$")?,
            ubuntu: compile(r"[( ]([\d.]+)")?,
            centos: compile(r"^CentOS( Linux)? release ([\d.]+)")?,
            redhat: compile(r"[( ]([\d.]+)")?,
        })
    }

    /// Guess the distribution. Returns `None` without a readable
    /// `/etc/os-release`.
    pub fn detect(&self, snapshot: &ImageSnapshot) -> Option<OsInfo> {
        let mut info = OsInfo::default();

        if let Some((_, arch)) = LINKERS.iter().find(|(path, _)| exists(snapshot, path)) {
            info.architecture = arch.to_string();
        }

        let os_release = read_trimmed(snapshot, "/etc/os-release")?;
        for line in os_release.lines() {
            if let Some(value) = capture(&self.pretty_name, line, 1) {
                info.name = unquote(&value);
            } else if let Some(value) = capture(&self.id, line, 1) {
                info.vendor = unquote(&value);
            } else if let Some(value) = capture(&self.version_id, line, 1) {
                info.version = unquote(&value);
            }
        }

        info.release = match info.vendor.as_str() {
            "debian" => read_trimmed(snapshot, "/etc/debian_version").unwrap_or_default(),
            "ubuntu" => capture(&self.ubuntu, &info.name, 1).unwrap_or_default(),
            "centos" => read_trimmed(snapshot, "/etc/centos-release")
                .and_then(|release| capture(&self.centos, &release, 2))
                .unwrap_or_default(),
            "rhel" => read_trimmed(snapshot, "/etc/redhat-release")
                .and_then(|release| capture(&self.redhat, &release, 1))
                .or_else(|| capture(&self.redhat, &info.name, 1))
                .unwrap_or_default(),
            _ => String::new(),
        };

        tracing::debug!(
            vendor = %info.vendor,
            version = %info.version,
            release = %info.release,
            architecture = %info.architecture,
            "Detected operating system"
        );

        Some(info)
    }
}

/// Guess the distribution of an image.
pub fn detect(snapshot: &ImageSnapshot) -> Result<Option<OsInfo>> {
    Ok(OsDetector::new()?.detect(snapshot))
}

fn exists(snapshot: &ImageSnapshot, path: &str) -> bool {
    snapshot.metadata(path).is_ok() || snapshot.resolve(path).is_ok()
}

/// Read a small text file, trimmed. Missing or unreadable files yield
/// `None`, as does an empty one.
fn read_trimmed(snapshot: &ImageSnapshot, path: &str) -> Option<String> {
    match snapshot.read(path) {
        Ok(data) => {
            let text = String::from_utf8_lossy(&data).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        Err(e) => {
            tracing::debug!(path, error = %e, "Cannot read release file");
            None
        }
    }
}

fn capture(re: &Regex, text: &str, group: usize) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(group))
        .map(|m| m.as_str().to_string())
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').to_string()
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

    #[test]
    fn test_detect_alpine() {
        let snap = snapshot(&[TestEntry::File(
            "etc/os-release",
            b"NAME=\"Alpine Linux\"\nID=alpine\nVERSION_ID=3.19.1\nPRETTY_NAME=\"Alpine Linux v3.19\"\n",
        )]);

        let info = detect(&snap).unwrap().unwrap();
        assert_eq!(info.vendor, "alpine");
        assert_eq!(info.version, "3.19.1");
        assert_eq!(info.name, "Alpine Linux v3.19");
        assert_eq!(info.release, "");
        assert_eq!(info.architecture, "");
    }

    #[test]
    fn test_detect_debian_release_and_arch() {
        let snap = snapshot(&[
            TestEntry::File(
                "usr/lib/os-release",
                b"PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\nVERSION_ID=\"12\"\n",
            ),
            TestEntry::Symlink("etc/os-release", "../usr/lib/os-release"),
            TestEntry::File("etc/debian_version", b"12.5\n"),
            TestEntry::Symlink("lib64/ld-linux-x86-64.so.2", "/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2"),
        ]);

        let info = detect(&snap).unwrap().unwrap();
        assert_eq!(info.vendor, "debian");
        assert_eq!(info.version, "12");
        assert_eq!(info.release, "12.5");
        // Dangling linker symlink still counts
        assert_eq!(info.architecture, "amd64");
    }

    #[test]
    fn test_detect_ubuntu_release_from_name() {
        let snap = snapshot(&[TestEntry::File(
            "etc/os-release",
            b"PRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n",
        )]);
        let info = detect(&snap).unwrap().unwrap();
        assert_eq!(info.release, "22.04.4");
    }

    #[test]
    fn test_detect_centos() {
        let snap = snapshot(&[
            TestEntry::File(
                "etc/os-release",
                b"PRETTY_NAME=\"CentOS Linux 7 (Core)\"\nID=\"centos\"\nVERSION_ID=\"7\"\n",
            ),
            TestEntry::File("etc/centos-release", b"CentOS Linux release 7.9.2009 (Core)\n"),
            TestEntry::File("lib/ld-linux.so.2", b""),
        ]);
        let info = detect(&snap).unwrap().unwrap();
        assert_eq!(info.vendor, "centos");
        assert_eq!(info.release, "7.9.2009");
        assert_eq!(info.architecture, "i386");
    }

    #[test]
    fn test_detect_rhel_falls_back_to_name() {
        let snap = snapshot(&[TestEntry::File(
            "etc/os-release",
            b"PRETTY_NAME=\"Red Hat Enterprise Linux 9.3 (Plow)\"\nID=\"rhel\"\n",
        )]);
        let info = detect(&snap).unwrap().unwrap();
        assert_eq!(info.release, "9.3");
    }

    #[test]
    fn test_detect_rhel_release_file() {
        let snap = snapshot(&[
            TestEntry::File("etc/os-release", b"PRETTY_NAME=\"Red Hat Enterprise Linux 8\"\nID=\"rhel\"\n"),
            TestEntry::File(
                "etc/redhat-release",
                b"Red Hat Enterprise Linux release 8.9 (Ootpa)\n",
            ),
        ]);
        let info = detect(&snap).unwrap().unwrap();
        assert_eq!(info.release, "8.9");
    }

    #[test]
    fn test_detect_without_os_release() {
        let snap = snapshot(&[TestEntry::File("lib64/ld-linux-x86-64.so.2", b"")]);
        assert!(detect(&snap).unwrap().is_none());
    }

    #[test]
    fn test_serialize_skips_empty_fields() {
        let info = OsInfo {
            vendor: "alpine".to_string(),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&info).unwrap(), r#"{"vendor":"alpine"}"#);
    }
}
