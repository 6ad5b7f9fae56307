use crate::domain::result::{DomainError, DomainResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;

/// Decode a base64 CoAP payload into text. Non-UTF8 payloads are replaced
/// lossily; the bridge forwards values, it does not interpret binary TLV.
pub fn decode_coap_payload(b64: &str) -> DomainResult<String> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| DomainError::UnparsableJson(format!("base64 payload: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn encode_coap_payload(value: &str) -> String {
    BASE64.encode(value.as_bytes())
}

/// Derive a JSON value from a decoded CoAP payload: a composite JSON object
/// stays structured, anything else collapses to a fundamental scalar
/// (integer, then float, then string).
pub fn payload_to_value(decoded: &str) -> Value {
    if let Ok(parsed) = serde_json::from_str::<Value>(decoded) {
        if parsed.is_object() || parsed.is_array() {
            return parsed;
        }
    }
    fundamental_value(decoded)
}

/// Collapse a scalar payload to its narrowest JSON type.
pub fn fundamental_value(text: &str) -> Value {
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::from(trimmed)
}

/// The unified observation envelope published to the peer: one flat JSON
/// object per observation, CoAP reply, or async response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationEnvelope {
    pub ep: String,
    pub path: String,
    pub value: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ct: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,

    #[serde(rename = "max-age", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
}

impl ObservationEnvelope {
    pub fn new(ep: impl Into<String>, path: impl Into<String>, value: Value) -> Self {
        Self {
            ep: ep.into(),
            path: path.into(),
            value,
            ct: None,
            verb: None,
            max_age: None,
        }
    }

    pub fn with_verb(mut self, verb: &str) -> Self {
        self.verb = Some(verb.to_string());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
