use crate::client::SourceCloudClient;
use common::domain::{DeviceRecord, RegistrationCompleter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default attribute URIs: manufacturer, model, serial.
pub const DEFAULT_ATTRIBUTE_URIS: [&str; 3] = ["/3/0/0", "/3/0/1", "/3/0/2"];

/// Fetches a device's standard attributes before its shadow is created.
///
/// One worker per device at most; a second dispatch while one is pending is
/// a no-op. Each worker GETs every configured URI, folds the values into the
/// record's metadata, hands the record to the completer, then removes itself.
pub struct AttributeRetrievalDispatcher {
    client: Arc<SourceCloudClient>,
    uris: Vec<String>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl AttributeRetrievalDispatcher {
    pub fn new(client: Arc<SourceCloudClient>, uris: Vec<String>) -> Self {
        let uris = if uris.is_empty() {
            DEFAULT_ATTRIBUTE_URIS.iter().map(|u| u.to_string()).collect()
        } else {
            uris
        };
        Self {
            client,
            uris,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Number of retrievals currently in flight.
    pub async fn pending(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Launch the retrieval worker for a device.
    pub async fn dispatch(
        self: &Arc<Self>,
        record: DeviceRecord,
        completer: Arc<dyn RegistrationCompleter>,
    ) {
        let device_id = record.device_id.clone();
        let mut running = self.running.lock().await;
        if running.contains_key(&device_id) {
            warn!(device_id = %device_id, "attribute retrieval already running, ignoring");
            return;
        }

        let dispatcher = Arc::clone(self);
        let task_device_id = device_id.clone();
        let handle = tokio::spawn(async move {
            let record = dispatcher.retrieve(record).await;
            info!(device_id = %record.device_id, "completing device registration with attributes");
            completer.complete_new_device_registration(record).await;
            dispatcher.running.lock().await.remove(&task_device_id);
        });
        running.insert(device_id, handle);
    }

    /// Wait for a device's in-flight retrieval, if any. Session deletion
    /// joins the worker before freeing the record.
    pub async fn join(&self, device_id: &str) {
        let handle = self.running.lock().await.remove(device_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn retrieve(&self, mut record: DeviceRecord) -> DeviceRecord {
        for uri in &self.uris {
            match self.client.get_endpoint_resource(&record.device_id, uri).await {
                Ok(body) if !body.is_empty() => {
                    apply_attribute(&mut record, uri, &body);
                }
                Ok(_) => {
                    debug!(device_id = %record.device_id, uri = %uri, "empty attribute value (OK)");
                }
                Err(e) => {
                    warn!(device_id = %record.device_id, uri = %uri, error = %e, "attribute fetch failed");
                }
            }
        }
        record
    }
}

/// Map a fetched value onto the record's well-known metadata slot.
fn apply_attribute(record: &mut DeviceRecord, uri: &str, raw: &str) {
    let value = raw.trim().trim_matches('"').to_string();
    if uri.contains("3/0/0") {
        debug!(device_id = %record.device_id, manufacturer = %value, "device manufacturer");
        record.metadata.manufacturer = value;
    } else if uri.contains("3/0/1") {
        debug!(device_id = %record.device_id, model = %value, "device model");
        record.metadata.model = value;
    } else if uri.contains("3/0/2") {
        debug!(device_id = %record.device_id, serial = %value, "device serial");
        record.metadata.serial = value;
    }
}
