use crate::mqtt::MqttSession;
use crate::topics::TopicData;
use common::domain::{DomainError, DomainResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One live shadow: the peer-side transport plus what it is subscribed to.
pub struct ShadowSession {
    pub endpoint_type: String,
    pub topics: TopicData,
    pub transport: Arc<MqttSession>,
}

/// Canonical map of prefixed device name to live session.
///
/// Sessions are owned by the table; callers clone the transport handle for
/// the duration of a single operation only. The cap exists because every
/// session burns one ephemeral port.
pub struct ShadowSessionTable {
    sessions: RwLock<HashMap<String, ShadowSession>>,
    max_shadows: usize,
}

impl ShadowSessionTable {
    pub fn new(max_shadows: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_shadows,
        }
    }

    pub fn max_shadows(&self) -> usize {
        self.max_shadows
    }

    pub async fn has_session(&self, prefixed_name: &str) -> bool {
        self.sessions.read().await.contains_key(prefixed_name)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Insert or replace the session for a name. Replacement never grows
    /// the table, so it is always allowed; a brand-new name is refused at
    /// the cap. The caller disposes any replaced session first via
    /// `remove_session`.
    pub async fn add_session(
        &self,
        prefixed_name: &str,
        session: ShadowSession,
    ) -> DomainResult<()> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(prefixed_name) && sessions.len() >= self.max_shadows {
            return Err(DomainError::ShadowCapacityExceeded {
                current: sessions.len(),
                cap: self.max_shadows,
            });
        }
        if sessions.insert(prefixed_name.to_string(), session).is_some() {
            warn!(device = %prefixed_name, "replaced existing shadow session");
        } else {
            debug!(device = %prefixed_name, "added shadow session");
        }
        Ok(())
    }

    /// Tear a session down: best-effort unsubscribe, halt the listener
    /// task, disconnect, drop the entry. Idempotent.
    pub async fn remove_session(&self, prefixed_name: &str) -> bool {
        let removed = self.sessions.write().await.remove(prefixed_name);
        match removed {
            Some(session) => {
                session
                    .transport
                    .unsubscribe(&session.topics.topic_strings())
                    .await;
                session.transport.disconnect(true).await;
                info!(device = %prefixed_name, "removed shadow session");
                true
            }
            None => false,
        }
    }

    /// Transport handle for one operation; the clone must not outlive it.
    pub async fn transport(&self, prefixed_name: &str) -> Option<Arc<MqttSession>> {
        self.sessions
            .read()
            .await
            .get(prefixed_name)
            .map(|s| Arc::clone(&s.transport))
    }

    pub async fn topics(&self, prefixed_name: &str) -> Option<TopicData> {
        self.sessions
            .read()
            .await
            .get(prefixed_name)
            .map(|s| s.topics.clone())
    }

    pub async fn endpoint_type(&self, prefixed_name: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(prefixed_name)
            .map(|s| s.endpoint_type.clone())
    }

    pub async fn is_connected(&self, prefixed_name: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(prefixed_name)
            .map(|s| s.transport.is_connected())
            .unwrap_or(false)
    }

    pub async fn names(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
