//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Shorten a `sha256:<hex>` digest to its first 12 hex characters.
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest);
    hex.get(..12).unwrap_or(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table_headers() {
        let mut table = new_table(&["FORMAT", "PATH"]);
        table.add_row(["jks", "/opt/java/lib/security/cacerts"]);
        let rendered = table.to_string();
        assert!(rendered.contains("FORMAT"));
        assert!(rendered.contains("/opt/java/lib/security/cacerts"));
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(
            short_digest("sha256:4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945"),
            "4f53cda18c2b"
        );
        assert_eq!(short_digest("abc"), "abc");
        assert_eq!(short_digest(""), "");
    }
}
