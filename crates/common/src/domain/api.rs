use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A raw upstream API call tunneled from the peer over the command topic.
/// Distinguished from CoAP commands by the presence of `api_uri`/`api_verb`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiRequest {
    pub api_uri: String,
    pub api_verb: String,

    #[serde(default)]
    pub api_body: Option<Value>,

    #[serde(default)]
    pub api_options: Option<String>,

    #[serde(default)]
    pub api_content_type: Option<String>,

    #[serde(default)]
    pub api_request_id: Option<i64>,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl ApiRequest {
    /// Try to interpret a peer message as an API request.
    pub fn from_message(message: &str) -> Option<Self> {
        serde_json::from_str::<Self>(message).ok()
    }

    /// Cheap pre-check so CoAP command messages never pay a typed parse.
    pub fn is_api_request(message: &str) -> bool {
        message.contains("\"api_uri\"") && message.contains("\"api_verb\"")
    }
}

/// Result of an API request, wrapped for publication on the api-response
/// reply topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub api_uri: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_request_id: Option<i64>,

    pub api_http_code: u16,

    pub api_response: Value,
}

impl ApiResponse {
    pub fn new(request: &ApiRequest, http_code: u16, body: &str) -> Self {
        // Keep parsable bodies structured; everything else becomes an
        // api_execute_status error message.
        let api_response = if body.is_empty() {
            api_execute_status("empty response")
        } else {
            serde_json::from_str::<Value>(body)
                .unwrap_or_else(|_| api_execute_status("unparsable json"))
        };
        Self {
            api_uri: request.api_uri.clone(),
            api_request_id: request.api_request_id,
            api_http_code: http_code,
            api_response,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Structured error body used wherever the peer expects JSON back but the
/// operation could not produce any.
pub fn api_execute_status(status: &str) -> Value {
    serde_json::json!({ "api_execute_status": status })
}

/// True when a credential value has been replaced with real material.
/// Packaged configurations ship placeholders containing `Goes_Here`; the
/// bridge must stay up but refuse to use them.
pub fn credential_configured(value: &str) -> bool {
    !value.trim().is_empty() && !value.contains("Goes_Here")
}

/// Hash the bridge reproduces to validate inbound webhook notifications.
/// Installed in the callback descriptor's `Authentication` header and
/// recomputed on every inbound request.
pub fn authentication_hash(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
