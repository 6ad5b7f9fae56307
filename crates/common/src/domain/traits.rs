use crate::domain::api::{ApiRequest, ApiResponse};
use crate::domain::device::{CoapVerb, DeviceRecord};
use crate::domain::event::{
    AsyncResponseEntry, NotificationEvent, RegistrationEntry, TelemetryEntry,
};
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked once a device record is fully assembled (resources and
/// attributes retrieved) and ready for shadow creation on a peer.
///
/// The orchestrator implements this by fanning out to every adapter; an
/// adapter implements it for registrations it triggered itself.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RegistrationCompleter: Send + Sync {
    async fn complete_new_device_registration(&self, record: DeviceRecord);
}

/// Upstream operations a peer adapter needs: relaying CoAP verbs and raw API
/// calls back through the source cloud, and kicking off attribute retrieval.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait UpstreamGateway: Send + Sync {
    /// Relay a CoAP verb to a device through the source cloud's REST
    /// front-end. Returns the raw response body, empty when the cloud
    /// replied without one.
    async fn endpoint_resource_operation<'a>(
        &self,
        verb: CoapVerb,
        device_id: &'a str,
        uri: &'a str,
        value: Option<&'a str>,
        options: Option<&'a str>,
    ) -> DomainResult<String>;

    /// Execute a tunneled API request and wrap the outcome.
    async fn execute_api_request(&self, request: &ApiRequest) -> ApiResponse;

    /// Fetch the configured device attributes (when enabled and the device
    /// exposes them), then hand the finished record to `completer`. At most
    /// one retrieval runs per device; a second request is a no-op.
    async fn retrieve_device_attributes(
        &self,
        record: DeviceRecord,
        completer: Arc<dyn RegistrationCompleter>,
    );

    /// Wait out any in-flight attribute retrieval for a device. Deleting a
    /// shadow joins its retrieval worker before the record is freed.
    async fn join_attribute_retrieval(&self, device_id: &str);
}

/// The contract every peer must satisfy. One instance manages all shadows
/// for its peer; event batches arrive sequentially per adapter.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PeerAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Create the peer-side shadow identity and validate an MQTT session
    /// for it.
    async fn register_new_device(&self, record: &DeviceRecord) -> DomainResult<()>;

    /// Stop the listener, disconnect, remove the shadow from the peer and
    /// clear the device's type from the registry.
    async fn delete_device(&self, device_id: &str) -> DomainResult<()>;

    async fn process_notifications(&self, entries: &[TelemetryEntry]);

    async fn process_new_registrations(&self, entries: &[RegistrationEntry]);

    async fn process_re_registrations(&self, entries: &[RegistrationEntry]);

    async fn process_deregistrations(&self, device_ids: &[String]);

    async fn process_registrations_expired(&self, device_ids: &[String]);

    async fn process_device_deletions(&self, device_ids: &[String]);

    async fn process_async_responses(&self, entries: &[AsyncResponseEntry]);

    /// Finish a registration whose attribute retrieval has completed.
    async fn complete_new_device_registration(&self, record: DeviceRecord);

    /// Tear down every session this adapter owns.
    async fn shutdown(&self);
}

/// Where the notification channel delivers decoded events, and where it
/// escalates when the channel cannot be established.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch_event(&self, event: NotificationEvent);

    /// Ask for a full bridge teardown and re-init.
    fn request_reset(&self);
}
