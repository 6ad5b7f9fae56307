use crate::client::SourceCloudClient;
use common::domain::{
    sanitize_endpoint_type, DeviceRecord, DomainResult, EndpointTypeRegistry,
    RegistrationCompleter, UpstreamGateway,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Bulk shadow-setup parameters.
#[derive(Debug, Clone)]
pub struct ShadowSetupConfig {
    /// Concurrent setup workers draining the discovered-device queue.
    pub max_workers: usize,

    pub default_endpoint_type: String,

    /// Grace period after boot before discovery starts; gives the
    /// notification channel time to settle.
    pub discovery_delay: Duration,
}

impl Default for ShadowSetupConfig {
    fn default() -> Self {
        Self {
            max_workers: 100,
            default_endpoint_type: "default".to_string(),
            discovery_delay: Duration::from_secs(15),
        }
    }
}

/// Discover every registered device upstream and set its shadow up: per
/// device, resource discovery, then attribute retrieval, then shadow
/// creation through the completer. At most `max_workers` devices are in
/// flight at once; the call returns when the queue is drained and all
/// workers are idle.
#[instrument(skip_all)]
pub async fn run_shadow_setup(
    client: Arc<SourceCloudClient>,
    gateway: Arc<dyn UpstreamGateway>,
    types: Arc<EndpointTypeRegistry>,
    completer: Arc<dyn RegistrationCompleter>,
    config: ShadowSetupConfig,
    halt: CancellationToken,
) -> DomainResult<usize> {
    tokio::select! {
        biased;
        _ = halt.cancelled() => return Ok(0),
        _ = tokio::time::sleep(config.discovery_delay) => {}
    }

    let devices = client.discover_registered_devices().await?;
    info!(count = devices.len(), workers = config.max_workers, "starting shadow setup");

    let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
    let mut workers = JoinSet::new();

    for device in devices {
        if halt.is_cancelled() {
            break;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };

        let client = Arc::clone(&client);
        let gateway = Arc::clone(&gateway);
        let types = Arc::clone(&types);
        let completer = Arc::clone(&completer);
        let default_type = config.default_endpoint_type.clone();

        workers.spawn(async move {
            let _permit = permit;
            setup_one_device(client, gateway, types, completer, device, &default_type).await
        });
    }

    let mut completed = 0usize;
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(true) => completed += 1,
            Ok(false) => {}
            Err(e) => warn!(error = %e, "shadow setup worker panicked"),
        }
    }

    info!(completed, "shadow setup finished");
    Ok(completed)
}

async fn setup_one_device(
    client: Arc<SourceCloudClient>,
    gateway: Arc<dyn UpstreamGateway>,
    types: Arc<EndpointTypeRegistry>,
    completer: Arc<dyn RegistrationCompleter>,
    device: common::domain::RegistrationEntry,
    default_type: &str,
) -> bool {
    let endpoint_type = sanitize_endpoint_type(device.ept.as_deref(), default_type);
    let mut record = DeviceRecord::new(&device.ep, &endpoint_type);
    record.etag = device.etag.clone();

    debug!(device_id = %record.device_id, "fetching resources for device");
    match client.discover_device_resources(&record.device_id).await {
        Ok(resources) => {
            info!(
                device_id = %record.device_id,
                resources = resources.len(),
                "resources discovered"
            );
            record.resources = resources;
        }
        Err(e) => {
            // Shadow the device anyway; commands may still work.
            warn!(device_id = %record.device_id, error = %e, "resource discovery failed");
        }
    }

    types
        .set_endpoint_type(&record.device_id, Some(&record.endpoint_type))
        .await;
    gateway.retrieve_device_attributes(record, completer).await;
    true
}
