use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::domain::{DomainError, DomainResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// DNS suffix the hub host carries; stripped to obtain the bare hub name.
const HUB_DNS_SUFFIX: &str = ".azure-devices.net";

/// Signed tokens are minted for one year by default.
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Tokens are re-minted every 360 days, comfortably inside the validity
/// window.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(360 * 24 * 60 * 60);

/// Parsed peer connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub key_name: String,
    pub key: String,
}

impl ConnectionString {
    /// Bare hub name: the host with the well-known DNS suffix stripped.
    pub fn hub_name(&self) -> String {
        self.host_name
            .strip_suffix(HUB_DNS_SUFFIX)
            .unwrap_or(&self.host_name)
            .to_string()
    }
}

/// Parse `HostName=<h>;SharedAccessKeyName=<kn>;SharedAccessKey=<k>`.
///
/// Total over all inputs: well-formed strings produce exactly the three
/// expected elements; anything missing yields `None`. Key values may
/// themselves contain `=` (base64 padding), so each element splits once.
pub fn parse_connection_string(connection_string: &str) -> Option<ConnectionString> {
    let mut host_name = None;
    let mut key_name = None;
    let mut key = None;

    for element in connection_string.split(';') {
        let mut parts = element.splitn(2, '=');
        let (Some(k), Some(v)) = (parts.next(), parts.next()) else {
            continue;
        };
        match k.trim() {
            "HostName" => host_name = Some(v.trim().to_string()),
            "SharedAccessKeyName" => key_name = Some(v.trim().to_string()),
            "SharedAccessKey" => key = Some(v.trim().to_string()),
            _ => {}
        }
    }

    Some(ConnectionString {
        host_name: host_name?,
        key_name: key_name?,
        key: key?,
    })
}

/// Mint a shared-access signature for the hub, valid for `validity` from
/// now: HMAC-SHA256 over the url-encoded resource URI and expiry, keyed
/// with the decoded shared access key.
pub fn create_sas_token(
    connection: &ConnectionString,
    validity: Duration,
) -> DomainResult<String> {
    let expiry = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| DomainError::CredentialError(format!("system clock: {e}")))?
        .as_secs()
        + validity.as_secs();

    let encoded_uri = url_encode(&connection.host_name);
    let to_sign = format!("{encoded_uri}\n{expiry}");

    let key_bytes = BASE64
        .decode(connection.key.as_bytes())
        .map_err(|e| DomainError::CredentialError(format!("shared access key: {e}")))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(&key_bytes)
        .map_err(|e| DomainError::CredentialError(format!("hmac key: {e}")))?;
    mac.update(to_sign.as_bytes());
    let signature = url_encode(&BASE64.encode(mac.finalize().into_bytes()));

    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={signature}&se={expiry}&skn={}",
        connection.key_name
    ))
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Holds the peer's auth material and keeps the signed token fresh.
///
/// Rotation is transparent on the next connect attempt: readers pick up the
/// current token when they build a session; already-connected sessions keep
/// whatever they connected with until they reconnect.
pub struct CredentialService {
    connection: Option<ConnectionString>,
    hub_name: String,
    token: Arc<RwLock<String>>,
    validity: Duration,
    refresh_interval: Duration,
}

impl CredentialService {
    /// Derive everything from a connection string.
    pub fn from_connection_string(
        connection_string: &str,
        validity: Duration,
        refresh_interval: Duration,
    ) -> DomainResult<Self> {
        let connection = parse_connection_string(connection_string).ok_or_else(|| {
            DomainError::InvalidConnectionString(
                "expected HostName, SharedAccessKeyName and SharedAccessKey".to_string(),
            )
        })?;
        let token = create_sas_token(&connection, validity)?;
        Ok(Self {
            hub_name: connection.hub_name(),
            connection: Some(connection),
            token: Arc::new(RwLock::new(token)),
            validity,
            refresh_interval,
        })
    }

    /// Pre-supplied static token; no refresher can run for these.
    pub fn from_static_token(hub_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            connection: None,
            hub_name: hub_name.into(),
            token: Arc::new(RwLock::new(token.into())),
            validity: DEFAULT_TOKEN_VALIDITY,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    /// Snapshot of the current token.
    pub async fn current_token(&self) -> String {
        self.token.read().await.clone()
    }

    /// Re-mint the token in place. Failures are logged and the previous
    /// token stays active.
    pub async fn refresh(&self) {
        let Some(connection) = &self.connection else {
            warn!("static token configured, nothing to refresh");
            return;
        };
        match create_sas_token(connection, self.validity) {
            Ok(fresh) => {
                *self.token.write().await = fresh;
                info!(hub = %self.hub_name, "refreshed shared-access token");
            }
            Err(e) => {
                warn!(hub = %self.hub_name, error = %e, "token refresh failed, keeping previous token");
            }
        }
    }

    /// Run the periodic refresher until halted. One task per peer.
    pub fn spawn_refresher(self: &Arc<Self>, halt: CancellationToken) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = halt.cancelled() => {
                        info!(hub = %service.hub_name, "token refresher halted");
                        break;
                    }
                    _ = tokio::time::sleep(service.refresh_interval) => {
                        service.refresh().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY_B64: &str = "c2VjcmV0LWtleS1tYXRlcmlhbA=="; // "secret-key-material"

    fn test_connection_string() -> String {
        format!("HostName=myhub.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey={TEST_KEY_B64}")
    }

    #[test]
    fn parses_well_formed_connection_string() {
        let parsed = parse_connection_string(&test_connection_string()).unwrap();
        assert_eq!(parsed.host_name, "myhub.azure-devices.net");
        assert_eq!(parsed.key_name, "iothubowner");
        assert_eq!(parsed.key, TEST_KEY_B64);
    }

    #[test]
    fn parse_is_total_over_missing_keys() {
        assert!(parse_connection_string("HostName=h;SharedAccessKeyName=kn").is_none());
        assert!(parse_connection_string("SharedAccessKeyName=kn;SharedAccessKey=k").is_none());
        assert!(parse_connection_string("").is_none());
        assert!(parse_connection_string("garbage").is_none());
    }

    #[test]
    fn parse_keeps_base64_padding_in_key() {
        let parsed = parse_connection_string(
            "HostName=h.azure-devices.net;SharedAccessKeyName=kn;SharedAccessKey=abc==",
        )
        .unwrap();
        assert_eq!(parsed.key, "abc==");
    }

    #[test]
    fn hub_name_strips_dns_suffix() {
        let parsed = parse_connection_string(&test_connection_string()).unwrap();
        assert_eq!(parsed.hub_name(), "myhub");
    }

    #[test]
    fn sas_token_has_expected_shape() {
        let connection = parse_connection_string(&test_connection_string()).unwrap();
        let token = create_sas_token(&connection, Duration::from_secs(3600)).unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=myhub.azure-devices.net"));
        assert!(token.contains("&sig="));
        assert!(token.contains("&se="));
        assert!(token.ends_with("&skn=iothubowner"));
    }

    #[test]
    fn sas_token_rejects_non_base64_key() {
        let connection = ConnectionString {
            host_name: "h".to_string(),
            key_name: "kn".to_string(),
            key: "!!!not-base64!!!".to_string(),
        };
        assert!(create_sas_token(&connection, Duration::from_secs(60)).is_err());
    }

    #[tokio::test]
    async fn refresh_replaces_token() {
        let service = CredentialService::from_connection_string(
            &test_connection_string(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
        .unwrap();
        let before = service.current_token().await;
        // A later mint carries a later expiry, so the token changes.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        service.refresh().await;
        let after = service.current_token().await;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn static_token_survives_refresh() {
        let service = CredentialService::from_static_token("myhub", "SharedAccessSignature sr=x");
        service.refresh().await;
        assert_eq!(service.current_token().await, "SharedAccessSignature sr=x");
        assert_eq!(service.hub_name(), "myhub");
    }

    #[tokio::test]
    async fn refresher_halts_cleanly() {
        let service = Arc::new(CredentialService::from_static_token("myhub", "t"));
        let halt = CancellationToken::new();
        let handle = service.spawn_refresher(halt.clone());
        halt.cancel();
        handle.await.unwrap();
    }
}
