use common::domain::CoapVerb;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Pending async replies are dropped after this long without a response.
pub const DEFAULT_CORRELATION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Everything needed to finish a CoAP command once its deferred reply
/// arrives from upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncCorrelationRecord {
    pub async_id: String,
    pub verb: CoapVerb,
    pub device_id: String,
    pub prefixed_name: String,
    pub uri: String,
    pub inbound_topic: String,
    pub reply_topic: String,
    pub original_message: String,
}

struct PendingEntry {
    record: AsyncCorrelationRecord,
    recorded_at: Instant,
}

/// Table of in-flight async requests, keyed by the upstream async id.
/// A record lives until its response arrives or the TTL sweep removes it,
/// whichever happens first.
pub struct AsyncCorrelationStore {
    pending: RwLock<HashMap<String, PendingEntry>>,
    ttl: Duration,
}

impl AsyncCorrelationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn record(&self, record: AsyncCorrelationRecord) {
        debug!(async_id = %record.async_id, device = %record.device_id, "recorded async correlation");
        self.pending.write().await.insert(
            record.async_id.clone(),
            PendingEntry {
                record,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Claim the record for a response; at most one caller wins.
    pub async fn take(&self, async_id: &str) -> Option<AsyncCorrelationRecord> {
        self.pending
            .write()
            .await
            .remove(async_id)
            .map(|entry| entry.record)
    }

    /// Drop records whose reply never came. Returns how many were removed.
    pub async fn expire_stale(&self) -> usize {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, entry| entry.recorded_at.elapsed() < self.ttl);
        before - pending.len()
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }
}

impl Default for AsyncCorrelationStore {
    fn default() -> Self {
        Self::new(DEFAULT_CORRELATION_TTL)
    }
}

/// Pull the async id out of an upstream command response, if the response
/// was deferred.
pub fn async_response_id(response: &str) -> Option<String> {
    let value: Value = serde_json::from_str(response).ok()?;
    value
        .get("async-response-id")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}
