use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No shadow session for device: {0}")]
    SessionNotFound(String),

    #[error("Shadow capacity exceeded: {current} active, cap {cap}")]
    ShadowCapacityExceeded { current: usize, cap: usize },

    #[error("Invalid CoAP verb: {0}")]
    InvalidCoapVerb(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Credential error: {0}")]
    CredentialError(String),

    #[error("MQTT transport error: {0}")]
    MqttError(String),

    #[error("Upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Webhook establishment failed: {0}")]
    WebhookEstablishment(String),

    #[error("Notification channel error: {0}")]
    NotificationChannel(String),

    #[error("Unparsable JSON: {0}")]
    UnparsableJson(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),
}
