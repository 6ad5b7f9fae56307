// Shared transport configuration for building reqwest::Client instances.
//
// The upstream client and the peer shadow registry share timeout and TLS
// settings through this module instead of duplicating builder logic.

use std::time::Duration;

/// Status plus body of one HTTPS exchange. Callers branch on the status of
/// the call they just made; no hidden last-response state.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Read out a reqwest response into the uniform shape. A body that fails to
/// read is reported as empty rather than as a transport error.
pub async fn read_response(response: reqwest::Response) -> HttpResponse {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    HttpResponse { status, body }
}

/// Shared configuration for building HTTPS clients.
#[derive(Debug, Clone)]
pub struct HttpsClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpsClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "shadow-bridge/0.3".to_string(),
        }
    }
}

impl HttpsClientConfig {
    /// Build a `reqwest::Client` from this config. TLS uses the platform
    /// root store; retries and pooling stay the client's concern.
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTPS client: {e}"))
    }
}
