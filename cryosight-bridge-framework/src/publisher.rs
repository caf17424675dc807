//! Telemetry publisher.

use std::sync::Arc;

use cryosight_common::{FieldMap, Format, StoreKey, TelemetryPoint, encode};

use crate::error::{BridgeError, Result};
use crate::store::{SampleCallback, TelemetryStore};

/// Publisher for sending telemetry under one `{table}/{key}`.
///
/// Wraps a [`TelemetryStore`] and turns field maps into encoded
/// [`TelemetryPoint`] payloads, one per `{table}/{key}/{field}`.
#[derive(Debug)]
pub struct Publisher<S> {
    store: Arc<S>,
    store_key: StoreKey,
    source: String,
    format: Format,
}

impl<S> Clone for Publisher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            store_key: self.store_key.clone(),
            source: self.source.clone(),
            format: self.format,
        }
    }
}

impl<S: TelemetryStore> Publisher<S> {
    /// Create a new publisher.
    pub fn new(
        store: Arc<S>,
        store_key: StoreKey,
        source: impl Into<String>,
        format: Format,
    ) -> Self {
        Self {
            store,
            store_key,
            source: source.into(),
            format,
        }
    }

    pub fn store_key(&self) -> &StoreKey {
        &self.store_key
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the serialization format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Same store and key, different `source` label.
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..self.clone()
        }
    }

    /// Encode a field map into `(key, payload)` pairs.
    ///
    /// Fails on the first field that cannot be encoded, before anything is
    /// written.
    pub fn encode_fields(&self, fields: &FieldMap, timestamp: i64) -> Result<Vec<(String, Vec<u8>)>> {
        fields
            .iter()
            .map(|(name, field)| {
                let mut point = TelemetryPoint::new(&self.source, name, field.value.clone())
                    .at(timestamp);
                if let Some(unit) = &field.unit {
                    point = point.with_label("unit", unit);
                }
                let payload = encode(&point, self.format)
                    .map_err(|e| BridgeError::Serialization(format!("{}: {}", name, e)))?;
                Ok((self.store_key.field(name), payload))
            })
            .collect()
    }

    /// Publish every field in `fields` stamped with `timestamp`.
    ///
    /// All payloads are encoded before the first put. Every put is attempted;
    /// if any fails the first error is returned so the caller can retry the
    /// whole map.
    pub async fn publish_fields(&self, fields: &FieldMap, timestamp: i64) -> Result<PublishStats> {
        let encoded = self.encode_fields(fields, timestamp)?;

        let mut stats = PublishStats::default();
        let mut first_error = None;

        for (key, payload) in encoded {
            match self.store.put(&key, payload).await {
                Ok(()) => stats.success += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(key = %key, error = %e, "Failed to publish field");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Publish a JSON value to an explicit key (status messages, etc.).
    pub async fn publish_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.store.put(key, payload).await
    }

    /// Subscribe to `{table}/{key}/{subkey}`.
    pub async fn subscribe_field(&self, subkey: &str, callback: SampleCallback) -> Result<()> {
        let key = self.store_key.field(subkey);
        self.store.subscribe(&key, callback).await
    }
}

/// Statistics from a field map publish.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublishStats {
    /// Number of successfully published fields.
    pub success: usize,
    /// Number of failed puts.
    pub failed: usize,
}

impl PublishStats {
    /// Total number of attempted puts.
    pub fn total(&self) -> usize {
        self.success + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use cryosight_common::{FieldValue, TelemetryValue};

    fn publisher(store: &MemoryStore) -> Publisher<MemoryStore> {
        Publisher::new(
            Arc::new(store.clone()),
            StoreKey::new("cryostat", "compressor").unwrap(),
            "compressor",
            Format::Json,
        )
    }

    fn fields() -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("helium_temp".into(), FieldValue::with_unit(80.5, "F"));
        fields.insert("state".into(), FieldValue::new("Running"));
        fields
    }

    #[tokio::test]
    async fn test_publish_fields() {
        let store = MemoryStore::new();
        let stats = publisher(&store)
            .publish_fields(&fields(), 1_700_000_000_000)
            .await
            .unwrap();

        assert_eq!(stats.success, 2);
        let point = store.get_point("cryostat/compressor/helium_temp").unwrap();
        assert_eq!(point.value, TelemetryValue::Gauge(80.5));
        assert_eq!(point.unit(), Some("F"));
        assert_eq!(point.source, "compressor");
        assert_eq!(point.timestamp, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let store = MemoryStore::new();
        store.fail_next_puts(1);

        let err = publisher(&store)
            .publish_fields(&fields(), 0)
            .await
            .unwrap_err();
        assert!(err.is_store_error());
        // The remaining field was still attempted.
        assert_eq!(store.put_count(), 1);
    }

    #[test]
    fn test_encode_fields_keys() {
        let store = MemoryStore::new();
        let encoded = publisher(&store).encode_fields(&fields(), 0).unwrap();
        let keys: Vec<_> = encoded.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["cryostat/compressor/helium_temp", "cryostat/compressor/state"]
        );
    }
}
