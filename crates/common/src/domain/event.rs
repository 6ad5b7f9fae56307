use crate::domain::device::DeviceResource;
use crate::domain::result::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};

/// Body keys that describe shadow lifecycle changes. Byte-identical bodies
/// carrying one of these are treated as upstream redelivery and dropped;
/// telemetry-only duplicates are legitimate and always pass.
pub const LIFECYCLE_KEYS: [&str; 4] = [
    "\"de-registrations\":",
    "\"registrations-expired\":",
    "\"registrations\":",
    "\"reg-updates\":",
];

/// True when the raw body contains at least one lifecycle key.
pub fn contains_lifecycle_key(body: &str) -> bool {
    LIFECYCLE_KEYS.iter().any(|key| body.contains(key))
}

/// One device entry inside a `registrations` / `reg-updates` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationEntry {
    #[serde(alias = "id")]
    pub ep: String,

    #[serde(default, alias = "endpoint_type")]
    pub ept: Option<String>,

    #[serde(default)]
    pub etag: Option<String>,

    #[serde(default)]
    pub resources: Vec<DeviceResource>,
}

/// One observation inside a `notifications` batch. The payload arrives
/// base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEntry {
    #[serde(alias = "id")]
    pub ep: String,

    pub path: String,

    /// Base64-encoded CoAP payload.
    pub payload: String,

    #[serde(default)]
    pub ct: Option<String>,

    #[serde(default, rename = "max-age")]
    pub max_age: Option<u64>,
}

/// One deferred reply inside an `async-responses` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncResponseEntry {
    pub id: String,

    #[serde(default)]
    pub status: Option<u16>,

    /// Base64-encoded CoAP payload, absent on error replies.
    #[serde(default)]
    pub payload: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
}

/// A decoded upstream notification event. The channel decodes each inbound
/// body exactly once into a sequence of these.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Notification(Vec<TelemetryEntry>),
    Registration(Vec<RegistrationEntry>),
    ReRegistration(Vec<RegistrationEntry>),
    Deregistration(Vec<String>),
    RegistrationsExpired(Vec<String>),
    AsyncResponse(Vec<AsyncResponseEntry>),
}

impl NotificationEvent {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::Notification(_) => "notification",
            NotificationEvent::Registration(_) => "registration",
            NotificationEvent::ReRegistration(_) => "reg-update",
            NotificationEvent::Deregistration(_) => "de-registration",
            NotificationEvent::RegistrationsExpired(_) => "registration-expired",
            NotificationEvent::AsyncResponse(_) => "async-response",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct NotificationBody {
    #[serde(default)]
    notifications: Option<Vec<TelemetryEntry>>,

    #[serde(default)]
    registrations: Option<Vec<RegistrationEntry>>,

    #[serde(default, rename = "reg-updates")]
    reg_updates: Option<Vec<RegistrationEntry>>,

    #[serde(default, rename = "de-registrations")]
    de_registrations: Option<Vec<String>>,

    #[serde(default, rename = "registrations-expired")]
    registrations_expired: Option<Vec<String>>,

    #[serde(default, rename = "async-responses")]
    async_responses: Option<Vec<AsyncResponseEntry>>,
}

/// Decode one raw notification body into its events, in the upstream's
/// defined processing order: notifications, registrations, reg-updates,
/// de-registrations, registrations-expired, async-responses.
pub fn decode_notification_body(body: &str) -> DomainResult<Vec<NotificationEvent>> {
    let parsed: NotificationBody = serde_json::from_str(body)
        .map_err(|e| DomainError::UnparsableJson(format!("notification body: {e}")))?;

    let mut events = Vec::new();
    if let Some(entries) = parsed.notifications {
        events.push(NotificationEvent::Notification(entries));
    }
    if let Some(entries) = parsed.registrations {
        events.push(NotificationEvent::Registration(entries));
    }
    if let Some(entries) = parsed.reg_updates {
        events.push(NotificationEvent::ReRegistration(entries));
    }
    if let Some(ids) = parsed.de_registrations {
        events.push(NotificationEvent::Deregistration(ids));
    }
    if let Some(ids) = parsed.registrations_expired {
        events.push(NotificationEvent::RegistrationsExpired(ids));
    }
    if let Some(entries) = parsed.async_responses {
        events.push(NotificationEvent::AsyncResponse(entries));
    }

    Ok(events)
}
