use crate::credentials::CredentialService;
use common::domain::{DeviceRecord, DomainError, DomainResult};
use common::transport::{read_response, HttpsClientConfig};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Peer-side shadow identity management over the hub's registry REST API:
/// create and delete device identities and seed their twin documents.
pub struct ShadowRegistry {
    http: reqwest::Client,
    base_url: String,
    api_version_tag: String,
    credentials: Arc<CredentialService>,
}

impl ShadowRegistry {
    /// `base_url` is normally `https://<hub>.azure-devices.net`; tests point
    /// it at a local server. `api_version_tag` is the full query fragment,
    /// e.g. `api-version=2016-11-14`.
    pub fn new(
        base_url: impl Into<String>,
        api_version_tag: impl Into<String>,
        credentials: Arc<CredentialService>,
    ) -> DomainResult<Self> {
        let http = HttpsClientConfig::default()
            .build_client()
            .map_err(DomainError::Transport)?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_version_tag: api_version_tag.into(),
            credentials,
        })
    }

    fn device_url(&self, prefixed_name: &str) -> String {
        format!(
            "{}/devices/{}?{}",
            self.base_url, prefixed_name, self.api_version_tag
        )
    }

    fn twin_url(&self, prefixed_name: &str) -> String {
        format!(
            "{}/twins/{}?{}",
            self.base_url, prefixed_name, self.api_version_tag
        )
    }

    /// Upsert the shadow identity. An identity that already exists counts
    /// as success.
    pub async fn register_device(&self, prefixed_name: &str) -> DomainResult<()> {
        let token = self.credentials.current_token().await;
        let body = json!({ "deviceId": prefixed_name });

        let response = self
            .http
            .put(self.device_url(prefixed_name))
            .header("Authorization", token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!(e)))?;
        let response = read_response(response).await;

        if response.is_ok() || response.status == 409 {
            info!(device = %prefixed_name, "shadow identity registered");
            Ok(())
        } else {
            Err(DomainError::UpstreamStatus {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Remove the shadow identity. A missing identity counts as success.
    pub async fn delete_device(&self, prefixed_name: &str) -> DomainResult<()> {
        let token = self.credentials.current_token().await;

        let response = self
            .http
            .delete(self.device_url(prefixed_name))
            .header("Authorization", token)
            .header("If-Match", "*")
            .send()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!(e)))?;
        let response = read_response(response).await;

        if response.is_ok() || response.status == 404 {
            info!(device = %prefixed_name, "shadow identity deleted");
            Ok(())
        } else {
            Err(DomainError::UpstreamStatus {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Seed the shadow's twin document with the device metadata so the
    /// peer side can see what it is talking to.
    pub async fn establish_twin_properties(
        &self,
        prefixed_name: &str,
        record: &DeviceRecord,
    ) -> DomainResult<()> {
        let token = self.credentials.current_token().await;
        let body = json!({
            "tags": {
                "endpointType": record.endpoint_type,
                "manufacturer": record.metadata.manufacturer,
                "model": record.metadata.model,
                "serial": record.metadata.serial,
            }
        });

        let response = self
            .http
            .patch(self.twin_url(prefixed_name))
            .header("Authorization", token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!(e)))?;
        let response = read_response(response).await;

        if response.is_ok() {
            debug!(device = %prefixed_name, "twin properties established");
            Ok(())
        } else {
            warn!(
                device = %prefixed_name,
                status = response.status,
                "twin property init failed"
            );
            Err(DomainError::UpstreamStatus {
                status: response.status,
                body: response.body,
            })
        }
    }
}
