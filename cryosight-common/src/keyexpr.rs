//! Store key hierarchy.
//!
//! Telemetry is addressed as `{table}.{key}.{field}`. On Zenoh each level is a
//! key expression chunk, so the same path is rendered as `{table}/{key}/{field}`.
//! Administrative keys live under the reserved `@` chunk, e.g.
//! `{table}/{key}/@/status`.

use crate::error::{Error, Result};

/// Characters Zenoh reserves inside key expression chunks.
const RESERVED: &[char] = &['/', '*', '$', '?', '#'];

/// A `{table}.{key}` pair owned by this daemon for writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    table: String,
    key: String,
}

impl StoreKey {
    /// Create a store key, rejecting chunks Zenoh would not accept.
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let table = table.into();
        let key = key.into();
        validate_chunk(&table)?;
        validate_chunk(&key)?;
        Ok(Self { table, key })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Key expression for a single field.
    ///
    /// # Example
    /// ```
    /// use cryosight_common::keyexpr::StoreKey;
    ///
    /// let key = StoreKey::new("cryostat", "compressor").unwrap();
    /// assert_eq!(key.field("helium_temp"), "cryostat/compressor/helium_temp");
    /// ```
    pub fn field(&self, field: &str) -> String {
        format!("{}/{}/{}", self.table, self.key, field)
    }

    /// Dotted form used in logs: `table.key.field`.
    pub fn dotted(&self, field: &str) -> String {
        format!("{}.{}.{}", self.table, self.key, field)
    }

    /// Wildcard matching every field under this key.
    ///
    /// # Example
    /// ```
    /// use cryosight_common::keyexpr::StoreKey;
    ///
    /// let key = StoreKey::new("cryostat", "compressor").unwrap();
    /// assert_eq!(key.wildcard(), "cryostat/compressor/**");
    /// ```
    pub fn wildcard(&self) -> String {
        format!("{}/{}/**", self.table, self.key)
    }

    /// Key expression for bridge status.
    ///
    /// # Example
    /// ```
    /// use cryosight_common::keyexpr::StoreKey;
    ///
    /// let key = StoreKey::new("cryostat", "compressor").unwrap();
    /// assert_eq!(key.status_key(), "cryostat/compressor/@/status");
    /// ```
    pub fn status_key(&self) -> String {
        format!("{}/{}/@/status", self.table, self.key)
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.key)
    }
}

fn validate_chunk(chunk: &str) -> Result<()> {
    if chunk.is_empty() {
        return Err(Error::store_key(chunk, "must not be empty"));
    }
    if chunk == "@" || chunk.starts_with('@') {
        return Err(Error::store_key(chunk, "'@' chunks are reserved"));
    }
    if let Some(c) = chunk
        .chars()
        .find(|c| RESERVED.contains(c) || c.is_whitespace())
    {
        return Err(Error::store_key(chunk, format!("contains '{}'", c)));
    }
    Ok(())
}

/// Parsed components of a `{table}/{key}/{field}` key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStoreKey<'a> {
    pub table: &'a str,
    pub key: &'a str,
    pub field: &'a str,
}

/// Parse a key expression into table, key and field.
///
/// Returns `None` for administrative (`@`) keys or anything that is not
/// exactly three chunks.
pub fn parse_store_key(key: &str) -> Option<ParsedStoreKey<'_>> {
    let mut parts = key.split('/');
    let table = parts.next()?;
    let store_key = parts.next()?;
    let field = parts.next()?;

    if parts.next().is_some() || [table, store_key, field].iter().any(|c| c.is_empty()) {
        return None;
    }
    if field.starts_with('@') {
        return None;
    }

    Some(ParsedStoreKey {
        table,
        key: store_key,
        field,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_paths() {
        let key = StoreKey::new("cryostat", "compressor").unwrap();

        assert_eq!(key.field("coldhead_rpm"), "cryostat/compressor/coldhead_rpm");
        assert_eq!(key.dotted("coldhead_rpm"), "cryostat.compressor.coldhead_rpm");
        assert_eq!(key.wildcard(), "cryostat/compressor/**");
        assert_eq!(key.status_key(), "cryostat/compressor/@/status");
        assert_eq!(key.to_string(), "cryostat.compressor");
    }

    #[test]
    fn test_rejects_reserved_chunks() {
        assert!(StoreKey::new("", "compressor").is_err());
        assert!(StoreKey::new("cryo/stat", "compressor").is_err());
        assert!(StoreKey::new("cryostat", "comp*").is_err());
        assert!(StoreKey::new("cryostat", "@").is_err());
        assert!(StoreKey::new("cryostat", "com pressor").is_err());
        assert!(StoreKey::new("wsma:cryostat", "compressor").is_ok());
    }

    #[test]
    fn test_parse_store_key() {
        let parsed = parse_store_key("cryostat/compressor/power_control").unwrap();
        assert_eq!(parsed.table, "cryostat");
        assert_eq!(parsed.key, "compressor");
        assert_eq!(parsed.field, "power_control");
    }

    #[test]
    fn test_parse_invalid_key() {
        assert!(parse_store_key("cryostat/compressor").is_none());
        assert!(parse_store_key("cryostat/compressor/a/b").is_none());
        assert!(parse_store_key("cryostat//field").is_none());
        assert!(parse_store_key("cryostat/compressor/@").is_none());
    }
}
