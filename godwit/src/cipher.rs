//! Cipher configuration.
//!
//! The framework carries the configuration plumbing; actual encryption
//! happens only when the linked engine implements the key pragmas. Cipher
//! entries always run at the highest priority so the key is applied before
//! any other statement touches the handle.

/// Supported cipher compatibility versions.
///
/// `Default` means the framework's current recommended settings; explicit
/// versions select legacy compatibility modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherVersion {
    Default,
    V1,
    V2,
    V3,
    V4,
}

impl CipherVersion {
    fn compatibility(self) -> Option<u32> {
        match self {
            CipherVersion::Default => None,
            CipherVersion::V1 => Some(1),
            CipherVersion::V2 => Some(2),
            CipherVersion::V3 => Some(3),
            CipherVersion::V4 => Some(4),
        }
    }
}

/// Default cipher page size in bytes.
pub const DEFAULT_CIPHER_PAGE_SIZE: u32 = 4096;

/// Key material plus page size and compatibility version for one database.
#[derive(Clone)]
pub struct CipherConfig {
    key: Vec<u8>,
    page_size: u32,
    version: CipherVersion,
}

impl CipherConfig {
    pub fn new(key: &[u8], page_size: u32, version: CipherVersion) -> Self {
        Self {
            key: key.to_vec(),
            page_size,
            version,
        }
    }

    /// The pragma batch applying this configuration, optionally scoped to an
    /// attached schema.
    pub(crate) fn pragma_sql(&self, schema: Option<&str>) -> String {
        let scope = match schema {
            Some(schema) => format!("{}.", godwit_sql::parse::quote_identifier(schema)),
            None => String::new(),
        };
        let mut sql = format!(
            "PRAGMA {scope}key = \"x'{}'\";\nPRAGMA {scope}cipher_page_size = {};\n",
            hex(&self.key),
            self.page_size
        );
        if let Some(compatibility) = self.version.compatibility() {
            sql.push_str(&format!("PRAGMA {scope}cipher_compatibility = {compatibility};\n"));
        }
        sql
    }
}

impl std::fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("CipherConfig")
            .field("key_len", &self.key.len())
            .field("page_size", &self.page_size)
            .field("version", &self.version)
            .finish()
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pragmas_carry_key_page_size_and_compatibility() {
        let config = CipherConfig::new(b"\x01\xab", 4096, CipherVersion::V3);
        let sql = config.pragma_sql(None);
        assert!(sql.contains("x'01ab'"), "{sql}");
        assert!(sql.contains("cipher_page_size = 4096"), "{sql}");
        assert!(sql.contains("cipher_compatibility = 3"), "{sql}");
    }

    #[test]
    fn default_version_sets_no_compatibility() {
        let config = CipherConfig::new(b"k", DEFAULT_CIPHER_PAGE_SIZE, CipherVersion::Default);
        assert!(!config.pragma_sql(None).contains("cipher_compatibility"));
    }

    #[test]
    fn schema_scope_prefixes_every_pragma() {
        let config = CipherConfig::new(b"k", 4096, CipherVersion::V4);
        let sql = config.pragma_sql(Some("legacy"));
        assert_eq!(sql.matches("\"legacy\".").count(), 3, "{sql}");
    }

    #[test]
    fn debug_never_prints_key_material() {
        let config = CipherConfig::new(b"super-secret", 4096, CipherVersion::Default);
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
    }
}
