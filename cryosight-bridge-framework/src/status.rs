//! Bridge status reporting.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::publisher::Publisher;
use crate::store::TelemetryStore;

/// Bridge status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (e.g., "cryocompressor").
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current status ("running", "offline", "error").
    pub status: String,
    /// RFC 3339 time the status was produced.
    pub since: String,
    /// Additional metadata (device identity, polling settings).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeStatus {
    fn with_state(bridge: impl Into<String>, version: impl Into<String>, status: &str) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status: status.to_string(),
            since: chrono::Utc::now().to_rfc3339(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a new status with "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, "running")
    }

    /// Create a status with "offline" state.
    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, "offline")
    }

    /// Create a status with "error" state.
    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_state(bridge, version, "error")
            .with_metadata(serde_json::json!({ "error": error.into() }))
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Publish this status to `{table}/{key}/@/status`.
    pub async fn publish<S: TelemetryStore>(&self, publisher: &Publisher<S>) -> Result<()> {
        let key = publisher.store_key().status_key();
        publisher.publish_json(&key, self).await
    }
}

/// Helper to publish bridge status on startup and shutdown.
pub struct StatusPublisher<S> {
    publisher: Publisher<S>,
    bridge_name: String,
    version: String,
}

impl<S: TelemetryStore> StatusPublisher<S> {
    /// Create a new status publisher.
    pub fn new(
        publisher: Publisher<S>,
        bridge_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            bridge_name: bridge_name.into(),
            version: version.into(),
        }
    }

    /// Publish "running" status with optional metadata.
    pub async fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        let mut status = BridgeStatus::running(&self.bridge_name, &self.version);
        if let Some(meta) = metadata {
            status = status.with_metadata(meta);
        }
        status.publish(&self.publisher).await
    }

    /// Publish "offline" status.
    pub async fn publish_offline(&self) -> Result<()> {
        BridgeStatus::offline(&self.bridge_name, &self.version)
            .publish(&self.publisher)
            .await
    }

    /// Publish "error" status.
    pub async fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        BridgeStatus::error(&self.bridge_name, &self.version, error)
            .publish(&self.publisher)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryStore;
    use cryosight_common::{Format, StoreKey};

    #[test]
    fn test_status_running() {
        let status = BridgeStatus::running("cryocompressor", "0.2.0");
        assert_eq!(status.bridge, "cryocompressor");
        assert_eq!(status.status, "running");
        assert!(chrono::DateTime::parse_from_rfc3339(&status.since).is_ok());
    }

    #[test]
    fn test_status_serialization() {
        let status = BridgeStatus::running("test", "1.0.0")
            .with_metadata(serde_json::json!({ "model": "CPA1110" }));

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"bridge\":\"test\""));
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"model\":\"CPA1110\""));
    }

    #[tokio::test]
    async fn test_status_lands_on_admin_key() {
        let store = MemoryStore::new();
        let publisher = Publisher::new(
            Arc::new(store.clone()),
            StoreKey::new("cryostat", "compressor").unwrap(),
            "compressor",
            Format::Json,
        );
        let status = StatusPublisher::new(publisher, "cryocompressor", "0.2.0");

        status.publish_error("startup failed").await.unwrap();

        let payload = store.get("cryostat/compressor/@/status").unwrap();
        let decoded: BridgeStatus = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded.status, "error");
        assert_eq!(decoded.metadata["error"], "startup failed");
    }
}
