use async_trait::async_trait;
use common::domain::{
    DeviceRecord, EndpointTypeRegistry, EventSink, NotificationEvent, PeerAdapter,
    RegistrationCompleter,
};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

/// Single process-wide event router.
///
/// Every decoded upstream event fans out to all registered adapters,
/// concurrently across adapters and sequentially within one (the channel
/// awaits each dispatch before decoding the next body). Adapters are
/// registered only during bridge init; the list is read-only afterwards.
pub struct Orchestrator {
    adapters: Vec<Arc<dyn PeerAdapter>>,
    types: Arc<EndpointTypeRegistry>,
    remove_on_deregistration: bool,
    reset_signal: Notify,
}

impl Orchestrator {
    pub fn new(types: Arc<EndpointTypeRegistry>, remove_on_deregistration: bool) -> Self {
        Self {
            adapters: Vec::new(),
            types,
            remove_on_deregistration,
            reset_signal: Notify::new(),
        }
    }

    /// Register a peer adapter. Init-time only.
    pub fn with_adapter(mut self, adapter: Arc<dyn PeerAdapter>) -> Self {
        info!(adapter = %adapter.name(), "peer adapter registered");
        self.adapters.push(adapter);
        self
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    pub fn endpoint_type_registry(&self) -> &Arc<EndpointTypeRegistry> {
        &self.types
    }

    /// Policy: does upstream de-registration delete the peer-side shadow?
    pub fn device_removed_on_deregistration(&self) -> bool {
        self.remove_on_deregistration
    }

    /// Blocks until some component asks for a full bridge re-init.
    pub async fn wait_for_reset(&self) {
        self.reset_signal.notified().await;
    }

    /// Tear every adapter down. Part of reset and of final shutdown.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!(adapters = self.adapters.len(), "shutting down adapters");
        join_all(self.adapters.iter().map(|adapter| adapter.shutdown())).await;
    }
}

#[async_trait]
impl EventSink for Orchestrator {
    async fn dispatch_event(&self, event: NotificationEvent) {
        debug!(kind = event.kind(), adapters = self.adapters.len(), "fanning out event");
        match &event {
            NotificationEvent::Notification(entries) => {
                join_all(
                    self.adapters
                        .iter()
                        .map(|adapter| adapter.process_notifications(entries)),
                )
                .await;
            }
            NotificationEvent::Registration(entries) => {
                join_all(
                    self.adapters
                        .iter()
                        .map(|adapter| adapter.process_new_registrations(entries)),
                )
                .await;
            }
            NotificationEvent::ReRegistration(entries) => {
                join_all(
                    self.adapters
                        .iter()
                        .map(|adapter| adapter.process_re_registrations(entries)),
                )
                .await;
            }
            NotificationEvent::Deregistration(ids) => {
                join_all(
                    self.adapters
                        .iter()
                        .map(|adapter| adapter.process_deregistrations(ids)),
                )
                .await;
            }
            NotificationEvent::RegistrationsExpired(ids) => {
                join_all(
                    self.adapters
                        .iter()
                        .map(|adapter| adapter.process_registrations_expired(ids)),
                )
                .await;
            }
            NotificationEvent::AsyncResponse(entries) => {
                join_all(
                    self.adapters
                        .iter()
                        .map(|adapter| adapter.process_async_responses(entries)),
                )
                .await;
            }
        }
    }

    fn request_reset(&self) {
        warn!("bridge reset requested");
        self.reset_signal.notify_one();
    }
}

#[async_trait]
impl RegistrationCompleter for Orchestrator {
    /// Bulk discovery completes registrations here; every adapter gets its
    /// own copy of the finished record.
    async fn complete_new_device_registration(&self, record: DeviceRecord) {
        join_all(
            self.adapters
                .iter()
                .map(|adapter| adapter.complete_new_device_registration(record.clone())),
        )
        .await;
    }
}
