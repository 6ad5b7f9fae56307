use common::domain::{
    encode_coap_payload, CoapVerb, DeviceResource, DomainError, DomainResult, RegistrationEntry,
};
use common::transport::{read_response, HttpResponse, HttpsClientConfig};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Connection parameters for the source cloud's REST front-end.
#[derive(Debug, Clone)]
pub struct SourceCloudConfig {
    /// `https://<api_host>:<port>`, no trailing slash.
    pub base_url: String,
    pub api_key: String,

    /// Device ids fetched per discovery page.
    pub pagination_limit: usize,

    /// Route CoAP verbs through the queued device-request API instead of
    /// the direct connect endpoints.
    pub enable_device_request_api: bool,

    pub connect_api_version: String,
    pub device_api_version: String,
}

impl Default for SourceCloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.us-east-1.mbedcloud.com:443".to_string(),
            api_key: String::new(),
            pagination_limit: 100,
            enable_device_request_api: false,
            connect_api_version: "2".to_string(),
            device_api_version: "3".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DevicePage {
    #[serde(default)]
    data: Vec<RegistrationEntry>,

    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct WebhookDescriptor {
    url: String,
}

/// Account info from `/accounts/me`.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantInfo {
    pub id: String,

    #[serde(default)]
    pub display_name: Option<String>,
}

/// REST client for the source cloud: discovery, subscriptions, device
/// commands and notification-channel management.
pub struct SourceCloudClient {
    http: reqwest::Client,
    config: SourceCloudConfig,
}

impl SourceCloudClient {
    pub fn new(config: SourceCloudConfig) -> DomainResult<Self> {
        let http = HttpsClientConfig::default()
            .build_client()
            .map_err(DomainError::Transport)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &SourceCloudConfig {
        &self.config
    }

    fn connect_base(&self) -> String {
        format!("{}/v{}", self.config.base_url, self.config.connect_api_version)
    }

    fn device_base(&self) -> String {
        format!("{}/v{}", self.config.base_url, self.config.device_api_version)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.config.api_key)
    }

    async fn get(&self, url: &str) -> DomainResult<HttpResponse> {
        let response = self
            .http
            .get(url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!(e)))?;
        Ok(read_response(response).await)
    }

    async fn delete(&self, url: &str) -> DomainResult<HttpResponse> {
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!(e)))?;
        Ok(read_response(response).await)
    }

    async fn put_json(&self, url: &str, body: &serde_json::Value) -> DomainResult<HttpResponse> {
        let response = self
            .http
            .put(url)
            .header("Authorization", self.bearer())
            .json(body)
            .send()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!(e)))?;
        Ok(read_response(response).await)
    }

    /// Paginated discovery of all registered devices. Pages are followed
    /// while `has_more` holds and concatenated in order.
    #[instrument(skip(self))]
    pub async fn discover_registered_devices(&self) -> DomainResult<Vec<RegistrationEntry>> {
        let base = format!(
            "{}/devices?filter=state%3Dregistered&limit={}&order=ASC",
            self.device_base(),
            self.config.pagination_limit
        );

        let mut devices: Vec<RegistrationEntry> = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let url = match &after {
                Some(last_id) => format!("{base}&after={last_id}"),
                None => base.clone(),
            };
            debug!(url = %url, "device discovery page");

            let response = self.get(&url).await?;
            if !response.is_ok() {
                return Err(DomainError::UpstreamStatus {
                    status: response.status,
                    body: response.body,
                });
            }

            let page: DevicePage = serde_json::from_str(&response.body)
                .map_err(|e| DomainError::UnparsableJson(format!("device page: {e}")))?;

            let has_more = page.has_more;
            after = page.data.last().map(|device| device.ep.clone());
            devices.extend(page.data);

            if !has_more || after.is_none() {
                break;
            }
        }

        info!(count = devices.len(), "registered devices discovered");
        Ok(devices)
    }

    /// Un-paginated per-device resource listing.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn discover_device_resources(
        &self,
        device_id: &str,
    ) -> DomainResult<Vec<DeviceResource>> {
        let url = format!("{}/endpoints/{}", self.connect_base(), device_id);
        let response = self.get(&url).await?;
        if !response.is_ok() {
            return Err(DomainError::UpstreamStatus {
                status: response.status,
                body: response.body,
            });
        }
        serde_json::from_str(&response.body)
            .map_err(|e| DomainError::UnparsableJson(format!("resource list: {e}")))
    }

    /// Wildcard bulk subscription; the cloud acknowledges with 204.
    #[instrument(skip(self))]
    pub async fn bulk_subscribe(&self) -> bool {
        let url = format!("{}/subscriptions", self.connect_base());
        let body = json!([{ "endpoint-name": "*" }]);
        match self.put_json(&url, &body).await {
            Ok(response) if response.status == 204 => {
                info!("bulk subscriptions established");
                true
            }
            Ok(response) => {
                warn!(status = response.status, "bulk subscription setup failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "bulk subscription setup failed");
                false
            }
        }
    }

    /// Account info for the configured API key.
    pub async fn tenant_info(&self) -> DomainResult<TenantInfo> {
        let url = format!("{}/accounts/me", self.device_base());
        let response = self.get(&url).await?;
        if !response.is_ok() {
            return Err(DomainError::UpstreamStatus {
                status: response.status,
                body: response.body,
            });
        }
        serde_json::from_str(&response.body)
            .map_err(|e| DomainError::UnparsableJson(format!("tenant info: {e}")))
    }

    /// Relay a CoAP verb to a device. Direct mode hits the connect API and
    /// returns whatever body came back; queued mode posts a device-request
    /// and synthesizes an `async-response-id` reply.
    pub async fn endpoint_resource_operation(
        &self,
        verb: CoapVerb,
        device_id: &str,
        uri: &str,
        value: Option<&str>,
        options: Option<&str>,
    ) -> DomainResult<String> {
        if self.config.enable_device_request_api {
            self.queued_device_request(verb, device_id, uri, value, options)
                .await
        } else {
            self.direct_device_request(verb, device_id, uri, value, options)
                .await
        }
    }

    async fn direct_device_request(
        &self,
        verb: CoapVerb,
        device_id: &str,
        uri: &str,
        value: Option<&str>,
        options: Option<&str>,
    ) -> DomainResult<String> {
        let mut url = format!("{}/endpoints/{}{}", self.connect_base(), device_id, uri);
        if let Some(options) = options {
            if options.contains('=') {
                url = format!("{url}?{options}");
            }
        }

        let request = match verb {
            CoapVerb::Get => self.http.get(&url),
            CoapVerb::Put => self
                .http
                .put(&url)
                .header("Content-Type", "text/plain")
                .body(value.unwrap_or_default().to_string()),
            CoapVerb::Post => self
                .http
                .post(&url)
                .header("Content-Type", "text/plain")
                .body(value.unwrap_or_default().to_string()),
            CoapVerb::Delete => self.http.delete(&url),
        };

        let response = request
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!(e)))?;
        let response = read_response(response).await;

        if !response.is_ok() {
            // 4xx bodies carry the cloud's structured error; pass them up to
            // the adapter instead of tearing anything down.
            warn!(verb = %verb, device = %device_id, status = response.status, "device command returned an error status");
        } else {
            debug!(verb = %verb, device = %device_id, uri = %uri, "device command dispatched");
        }
        Ok(response.body)
    }

    async fn queued_device_request(
        &self,
        verb: CoapVerb,
        device_id: &str,
        uri: &str,
        value: Option<&str>,
        options: Option<&str>,
    ) -> DomainResult<String> {
        // Time-based ids keep the correlation table naturally ordered.
        let async_id = Uuid::now_v7().to_string();
        let url = format!(
            "{}/device-requests/{}?async-id={}",
            self.connect_base(),
            device_id,
            async_id
        );

        let uri_with_options = match options {
            Some(options) if !options.is_empty() => format!("{uri}?{options}"),
            _ => uri.to_string(),
        };
        let mut body = json!({
            "method": verb.as_method(),
            "uri": uri_with_options,
        });
        if let Some(value) = value {
            if !value.is_empty() {
                body["payload-b64"] = json!(encode_coap_payload(value));
            }
        }

        let response = self
            .http
            .post(&url)
            .header("Authorization", self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!(e)))?;
        let response = read_response(response).await;

        if response.is_ok() {
            info!(device = %device_id, async_id = %async_id, "device-request queued");
            Ok(json!({ "async-response-id": async_id }).to_string())
        } else {
            warn!(device = %device_id, status = response.status, "device-request failed");
            Err(DomainError::UpstreamStatus {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Resource value GET used by attribute retrieval.
    pub async fn get_endpoint_resource(&self, device_id: &str, uri: &str) -> DomainResult<String> {
        self.direct_device_request(CoapVerb::Get, device_id, uri, None, None)
            .await
    }

    /// Raw API call tunneled from a peer. The URI carries its own version
    /// prefix; options are appended verbatim.
    pub async fn api_request(
        &self,
        verb: CoapVerb,
        uri: &str,
        body: Option<&serde_json::Value>,
        options: Option<&str>,
        content_type: Option<&str>,
        api_key: Option<&str>,
    ) -> DomainResult<HttpResponse> {
        let mut url = format!("{}{}", self.config.base_url, uri);
        if let Some(options) = options {
            if !options.is_empty() {
                url.push_str(options);
            }
        }

        let bearer = match api_key {
            Some(key) => format!("Bearer {key}"),
            None => self.bearer(),
        };
        let content_type = content_type.unwrap_or("application/json");
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();

        let request = match verb {
            CoapVerb::Get => self.http.get(&url),
            CoapVerb::Put => self
                .http
                .put(&url)
                .header("Content-Type", content_type)
                .body(body_text),
            CoapVerb::Post => self
                .http
                .post(&url)
                .header("Content-Type", content_type)
                .body(body_text),
            CoapVerb::Delete => self.http.delete(&url),
        };

        let response = request
            .header("Authorization", bearer)
            .send()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!(e)))?;
        Ok(read_response(response).await)
    }

    // ── Notification-channel management ─────────────────────────────────

    fn callback_url(&self) -> String {
        format!("{}/notification/callback", self.connect_base())
    }

    /// Currently installed callback URL, if any.
    pub async fn get_webhook(&self) -> Option<String> {
        let url = self.callback_url();
        match self.get(&url).await {
            Ok(response) if response.is_ok() && !response.body.is_empty() => {
                match serde_json::from_str::<WebhookDescriptor>(&response.body) {
                    Ok(descriptor) => Some(descriptor.url),
                    Err(e) => {
                        warn!(error = %e, "unparsable webhook descriptor");
                        None
                    }
                }
            }
            Ok(response) if response.status == 404 => {
                debug!("no webhook record found (OK)");
                None
            }
            Ok(response) => {
                warn!(status = response.status, "unexpected webhook query response");
                None
            }
            Err(e) => {
                warn!(error = %e, "webhook query failed");
                None
            }
        }
    }

    /// Install the callback descriptor. The caller verifies with
    /// `get_webhook` afterwards.
    pub async fn put_webhook(&self, target_url: &str, auth_hash: &str) -> bool {
        let body = json!({
            "url": target_url,
            "headers": { "Authentication": auth_hash },
        });
        match self.put_json(&self.callback_url(), &body).await {
            Ok(response) if response.is_ok() => true,
            Ok(response) => {
                warn!(status = response.status, "webhook PUT failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "webhook PUT failed");
                false
            }
        }
    }

    pub async fn remove_webhook(&self) {
        if let Err(e) = self.delete(&self.callback_url()).await {
            warn!(error = %e, "webhook delete failed");
        }
    }

    /// Long-poll channels and callbacks are mutually exclusive upstream;
    /// drop any pull channel before installing a callback.
    pub async fn delete_pull_channel(&self) {
        let url = format!("{}/notification/pull", self.connect_base());
        if let Err(e) = self.delete(&url).await {
            warn!(error = %e, "pull channel delete failed");
        }
    }

    /// Enable the web-socket notification channel upstream.
    pub async fn enable_websocket_channel(&self) -> bool {
        let url = format!("{}/notification/websocket", self.connect_base());
        match self.put_json(&url, &json!({})).await {
            Ok(response) if response.is_ok() => {
                info!("web-socket notification channel enabled");
                true
            }
            Ok(response) => {
                warn!(status = response.status, "web-socket channel enable failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "web-socket channel enable failed");
                false
            }
        }
    }

    /// One long-poll round trip; the returned body feeds the common
    /// dispatch path.
    pub async fn pull_notifications(&self, long_poll_uri: &str) -> DomainResult<String> {
        let url = format!("{}/{}", self.connect_base(), long_poll_uri);
        let response = self.get(&url).await?;
        if !response.is_ok() {
            return Err(DomainError::UpstreamStatus {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response.body)
    }
}
