use crate::domain::device::sanitize_endpoint_type;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory map of device id to endpoint type.
///
/// Survives session churn; an entry is cleared only when its device is
/// deleted or its registration expires. The command path uses it to recover
/// the type for reply-topic construction when only the id is on hand.
/// Entries are sanitized on the way in, so a stored type is never empty and
/// never a reserved lifecycle word.
pub struct EndpointTypeRegistry {
    default_type: String,
    types: RwLock<HashMap<String, String>>,
}

impl EndpointTypeRegistry {
    pub fn new(default_type: impl Into<String>) -> Self {
        Self {
            default_type: default_type.into(),
            types: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_type(&self) -> &str {
        &self.default_type
    }

    pub async fn endpoint_type(&self, device_id: &str) -> Option<String> {
        self.types.read().await.get(device_id).cloned()
    }

    /// Record the type for a device, substituting the default for missing
    /// or reserved values.
    pub async fn set_endpoint_type(&self, device_id: &str, endpoint_type: Option<&str>) {
        let sanitized = sanitize_endpoint_type(endpoint_type, &self.default_type);
        debug!(device_id = %device_id, endpoint_type = %sanitized, "recorded endpoint type");
        self.types
            .write()
            .await
            .insert(device_id.to_string(), sanitized);
    }

    pub async fn remove(&self, device_id: &str) {
        self.types.write().await.remove(device_id);
    }

    pub async fn count(&self) -> usize {
        self.types.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_type() {
        let registry = EndpointTypeRegistry::new("default");
        registry.set_endpoint_type("dev1", Some("sensor")).await;
        assert_eq!(registry.endpoint_type("dev1").await.as_deref(), Some("sensor"));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn reserved_types_are_sanitized_on_insert() {
        let registry = EndpointTypeRegistry::new("default");
        registry.set_endpoint_type("a", Some("reg-update")).await;
        registry.set_endpoint_type("b", Some("null")).await;
        registry.set_endpoint_type("c", Some("")).await;
        registry.set_endpoint_type("d", None).await;

        for id in ["a", "b", "c", "d"] {
            assert_eq!(registry.endpoint_type(id).await.as_deref(), Some("default"));
        }
    }

    #[tokio::test]
    async fn remove_clears_entry() {
        let registry = EndpointTypeRegistry::new("default");
        registry.set_endpoint_type("dev1", Some("sensor")).await;
        registry.remove("dev1").await;
        assert!(registry.endpoint_type("dev1").await.is_none());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn missing_device_has_no_type() {
        let registry = EndpointTypeRegistry::new("default");
        assert!(registry.endpoint_type("ghost").await.is_none());
    }
}
