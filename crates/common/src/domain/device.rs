use crate::domain::result::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// LWM2M object instance that carries the standard device attributes
/// (manufacturer, model, serial) on conforming endpoints.
pub const DEVICE_ATTRIBUTES_PATH: &str = "/3/0";

/// Endpoint-type strings that can never name a real device category.
/// `reg-update` leaks out of the upstream lifecycle stream on some clouds.
const RESERVED_ENDPOINT_TYPES: [&str; 3] = ["", "null", "reg-update"];

/// A single resource in a device's LWM2M resource tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceResource {
    #[serde(alias = "uri")]
    pub path: String,

    /// Resource type string, often empty.
    #[serde(default)]
    pub rt: Option<String>,

    /// Whether the resource is observable.
    #[serde(default)]
    pub obs: bool,

    /// Content type hint, if the cloud reports one.
    #[serde(default, alias = "type")]
    pub ct: Option<String>,
}

/// Well-known device metadata, defaulted at shadow creation and optionally
/// overwritten by attribute retrieval against the live device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub class: String,
    pub description: String,
    pub hardware: String,
    pub location: String,
    pub current_time: i64,
    pub total_memory: String,
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Self {
            manufacturer: "unknown".to_string(),
            model: "generic".to_string(),
            serial: "0".to_string(),
            class: "device".to_string(),
            description: "lwm2m device".to_string(),
            hardware: "1.0".to_string(),
            location: "n/a".to_string(),
            current_time: chrono::Utc::now().timestamp(),
            total_memory: "n/a".to_string(),
        }
    }
}

/// Mutable per-device record, keyed by `device_id`. Created on first
/// sighting, destroyed when the device is deleted or its registration
/// expires.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    /// Sanitized; never empty and never a reserved lifecycle word.
    pub endpoint_type: String,
    pub etag: Option<String>,
    pub dev_url: Option<String>,
    pub resources: Vec<DeviceResource>,
    pub metadata: DeviceMetadata,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>, endpoint_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            endpoint_type: endpoint_type.into(),
            etag: None,
            dev_url: None,
            resources: Vec::new(),
            metadata: DeviceMetadata::default(),
        }
    }

    /// Whether this device exposes the standard device-attributes object,
    /// making attribute retrieval worthwhile.
    pub fn has_device_attributes(&self) -> bool {
        self.resources
            .iter()
            .any(|r| r.path.starts_with(DEVICE_ATTRIBUTES_PATH))
    }
}

/// Substitute the configured default when the upstream endpoint type is
/// missing or is one of the reserved lifecycle words.
pub fn sanitize_endpoint_type(ept: Option<&str>, default_type: &str) -> String {
    match ept {
        Some(t) if !RESERVED_ENDPOINT_TYPES.contains(&t.trim()) => t.trim().to_string(),
        _ => default_type.to_string(),
    }
}

/// CoAP verbs relayed from the peer down to devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapVerb {
    Get,
    Put,
    Post,
    Delete,
}

impl CoapVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoapVerb::Get => "get",
            CoapVerb::Put => "put",
            CoapVerb::Post => "post",
            CoapVerb::Delete => "delete",
        }
    }

    /// Upstream device-request bodies want the HTTP-style method name.
    pub fn as_method(&self) -> &'static str {
        match self {
            CoapVerb::Get => "GET",
            CoapVerb::Put => "PUT",
            CoapVerb::Post => "POST",
            CoapVerb::Delete => "DELETE",
        }
    }
}

impl FromStr for CoapVerb {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(CoapVerb::Get),
            "put" => Ok(CoapVerb::Put),
            "post" => Ok(CoapVerb::Post),
            "delete" | "del" => Ok(CoapVerb::Delete),
            other => Err(DomainError::InvalidCoapVerb(other.to_string())),
        }
    }
}

impl fmt::Display for CoapVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_real_types() {
        assert_eq!(sanitize_endpoint_type(Some("sensor"), "default"), "sensor");
        assert_eq!(sanitize_endpoint_type(Some(" gw "), "default"), "gw");
    }

    #[test]
    fn sanitize_substitutes_reserved_words() {
        assert_eq!(sanitize_endpoint_type(Some(""), "default"), "default");
        assert_eq!(sanitize_endpoint_type(Some("null"), "default"), "default");
        assert_eq!(sanitize_endpoint_type(Some("reg-update"), "default"), "default");
        assert_eq!(sanitize_endpoint_type(None, "default"), "default");
    }

    #[test]
    fn device_attributes_detection() {
        let mut record = DeviceRecord::new("dev1", "sensor");
        assert!(!record.has_device_attributes());

        record.resources.push(DeviceResource {
            path: "/3/0".to_string(),
            rt: None,
            obs: false,
            ct: None,
        });
        assert!(record.has_device_attributes());
    }

    #[test]
    fn device_attributes_detection_on_subresource() {
        let mut record = DeviceRecord::new("dev1", "sensor");
        record.resources.push(DeviceResource {
            path: "/3/0/2".to_string(),
            rt: None,
            obs: true,
            ct: None,
        });
        assert!(record.has_device_attributes());
    }

    #[test]
    fn coap_verb_parsing() {
        assert_eq!("GET".parse::<CoapVerb>().unwrap(), CoapVerb::Get);
        assert_eq!("put".parse::<CoapVerb>().unwrap(), CoapVerb::Put);
        assert_eq!("del".parse::<CoapVerb>().unwrap(), CoapVerb::Delete);
        assert!("observe".parse::<CoapVerb>().is_err());
    }

    #[test]
    fn resource_deserializes_path_alias() {
        let resource: DeviceResource =
            serde_json::from_str(r#"{"uri":"/3/0/0","obs":false}"#).unwrap();
        assert_eq!(resource.path, "/3/0/0");
    }
}
