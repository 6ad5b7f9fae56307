use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON logs (plain fmt when off, for local runs)
    #[serde(default = "default_log_json")]
    pub log_json: bool,

    // Source cloud connection
    /// Source cloud API host (takes precedence when set)
    #[serde(default)]
    pub mds_address: String,

    /// Fallback source cloud API host
    #[serde(default = "default_api_endpoint_address")]
    pub api_endpoint_address: String,

    /// Source cloud API port
    #[serde(default = "default_mds_port")]
    pub mds_port: u16,

    /// Source cloud API key
    #[serde(default = "default_api_key")]
    pub api_key: String,

    // Notification channel
    /// Explicit channel type: webhook | websocket | poll (legacy booleans
    /// below apply when empty)
    #[serde(default)]
    pub mds_notification_type: String,

    /// Long-poll URI relative to the connect API base
    #[serde(default = "default_long_poll_uri")]
    pub mds_long_poll_uri: String,

    #[serde(default)]
    pub mds_enable_long_poll: bool,

    #[serde(default)]
    pub mds_enable_web_socket: bool,

    // Webhook URL assembly
    /// Public address the source cloud can reach this bridge on
    #[serde(default = "default_gw_address")]
    pub mds_gw_address: String,

    #[serde(default = "default_gw_port")]
    pub mds_gw_port: u16,

    #[serde(default)]
    pub mds_gw_context_path: String,

    #[serde(default = "default_gw_events_path")]
    pub mds_gw_events_path: String,

    /// Webhook establishment retries
    #[serde(default = "default_webhook_num_retries")]
    pub mds_webhook_num_retries: u32,

    /// Pause between webhook establishment retries in milliseconds
    #[serde(default = "default_webhook_retry_wait_ms")]
    pub mds_webhook_retry_wait_ms: u64,

    /// Disable inbound notification validation
    #[serde(default)]
    pub mds_skip_validation_checks: bool,

    /// Route CoAP verbs through the queued device-request API
    #[serde(default)]
    pub mds_enable_device_request_api: bool,

    // Device attributes
    /// Fetch device attributes before shadow creation
    #[serde(default)]
    pub mds_enable_attribute_gets: bool,

    /// JSON array of attribute URIs to fetch
    #[serde(default = "default_attribute_uri_list")]
    pub mds_attribute_uri_list: String,

    /// Concurrent shadow-setup workers during bulk discovery
    #[serde(default = "default_max_shadow_create_threads")]
    pub mds_max_shadow_create_threads: usize,

    /// Endpoint type substituted for missing or reserved values
    #[serde(default = "default_def_ep_type")]
    pub mds_def_ep_type: String,

    /// Delete the peer-side shadow when a device de-registers
    #[serde(default)]
    pub mds_remove_on_deregistration: bool,

    /// Delay before bulk device discovery in milliseconds
    #[serde(default = "default_device_discovery_delay_ms")]
    pub mds_device_discovery_delay_ms: u64,

    /// Device ids per discovery page
    #[serde(default = "default_pagination_limit")]
    pub pelion_pagination_limit: usize,

    // Peer hub
    /// Hub connection string; the SAS token and hub name derive from it
    #[serde(default = "default_connect_string")]
    pub iot_event_hub_connect_string: String,

    /// Pre-supplied SAS token (used when no connection string is set)
    #[serde(default)]
    pub iot_event_hub_sas_token: String,

    /// Hub name (used when no connection string is set)
    #[serde(default)]
    pub iot_event_hub_name: String,

    /// Shadow cap; one ephemeral port per session
    #[serde(default = "default_max_shadows")]
    pub iot_event_hub_max_shadows: usize,

    #[serde(default)]
    pub iot_event_hub_enable_device_id_prefix: bool,

    #[serde(default)]
    pub iot_event_hub_device_id_prefix: String,

    /// Hub API version tag, appended to MQTT usernames and registry URLs
    #[serde(default = "default_version_tag")]
    pub iot_event_hub_version_tag: String,

    /// MQTT endpoint template
    #[serde(default = "default_mqtt_ip_address")]
    pub iot_event_hub_mqtt_ip_address: String,

    #[serde(default = "default_mqtt_port")]
    pub iot_event_hub_mqtt_port: u16,

    /// MQTT username template
    #[serde(default = "default_mqtt_username")]
    pub iot_event_hub_mqtt_username: String,

    /// Static MQTT password override; the refreshed SAS token applies when
    /// empty
    #[serde(default)]
    pub iot_event_hub_mqtt_password: String,

    /// Outbound observation topic base
    #[serde(default = "default_observe_notification_topic")]
    pub iot_event_hub_observe_notification_topic: String,

    /// Inbound command topic template
    #[serde(default = "default_coap_cmd_topic")]
    pub iot_event_hub_coap_cmd_topic: String,

    /// Pause between device reconnect phases in milliseconds
    #[serde(default = "default_reconnect_sleep_ms")]
    pub iot_event_hub_reconnect_sleep_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    true
}

fn default_api_endpoint_address() -> String {
    "api.us-east-1.mbedcloud.com".to_string()
}

fn default_mds_port() -> u16 {
    443
}

fn default_api_key() -> String {
    "API_Key_Goes_Here".to_string()
}

fn default_long_poll_uri() -> String {
    "notification/pull".to_string()
}

fn default_gw_address() -> String {
    "127.0.0.1".to_string()
}

fn default_gw_port() -> u16 {
    28520
}

fn default_gw_events_path() -> String {
    "/events/notify".to_string()
}

fn default_webhook_num_retries() -> u32 {
    25
}

fn default_webhook_retry_wait_ms() -> u64 {
    10_000
}

fn default_attribute_uri_list() -> String {
    r#"["/3/0/0","/3/0/1","/3/0/2"]"#.to_string()
}

fn default_max_shadow_create_threads() -> usize {
    100
}

fn default_def_ep_type() -> String {
    "default".to_string()
}

fn default_device_discovery_delay_ms() -> u64 {
    15_000
}

fn default_pagination_limit() -> usize {
    100
}

fn default_connect_string() -> String {
    "Connection_String_Goes_Here".to_string()
}

fn default_max_shadows() -> usize {
    25_000
}

fn default_version_tag() -> String {
    "api-version=2016-11-14".to_string()
}

fn default_mqtt_ip_address() -> String {
    "__IOT_EVENT_HUB__.azure-devices.net".to_string()
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_mqtt_username() -> String {
    "__IOT_EVENT_HUB__.azure-devices.net/__EPNAME__".to_string()
}

fn default_observe_notification_topic() -> String {
    "devices/__EPNAME__/messages/events/".to_string()
}

fn default_coap_cmd_topic() -> String {
    "devices/__EPNAME__/messages/devicebound/__COMMAND_TYPE__".to_string()
}

fn default_reconnect_sleep_ms() -> u64 {
    10_000
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("BRIDGE"))
            .build()?
            .try_deserialize()
    }

    /// Source cloud host; the legacy key takes precedence when set.
    pub fn source_host(&self) -> &str {
        if self.mds_address.is_empty() {
            &self.api_endpoint_address
        } else {
            &self.mds_address
        }
    }

    pub fn source_base_url(&self) -> String {
        format!("https://{}:{}", self.source_host(), self.mds_port)
    }

    /// Public callback URL installed upstream.
    pub fn webhook_url(&self) -> String {
        format!(
            "https://{}:{}{}{}",
            self.mds_gw_address, self.mds_gw_port, self.mds_gw_context_path, self.mds_gw_events_path
        )
    }

    /// Local path the callback endpoint is served on.
    pub fn webhook_events_path(&self) -> String {
        format!("{}{}", self.mds_gw_context_path, self.mds_gw_events_path)
    }

    pub fn webhook_bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.mds_gw_port))
    }

    /// Attribute URI list; malformed JSON falls back to the defaults.
    pub fn attribute_uris(&self) -> Vec<String> {
        serde_json::from_str(&self.mds_attribute_uri_list).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("BRIDGE_API_KEY");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.mds_port, 443);
        assert_eq!(config.mds_webhook_num_retries, 25);
        assert_eq!(config.mds_max_shadow_create_threads, 100);
        assert_eq!(config.mds_def_ep_type, "default");
        assert_eq!(config.pelion_pagination_limit, 100);
        assert_eq!(config.iot_event_hub_max_shadows, 25_000);
        assert_eq!(config.iot_event_hub_mqtt_port, 8883);
        assert_eq!(
            config.attribute_uris(),
            vec!["/3/0/0", "/3/0/1", "/3/0/2"]
        );
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("BRIDGE_API_KEY", "ak_live_1");
            std::env::set_var("BRIDGE_MDS_ADDRESS", "api.eu-west-1.example.com");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.api_key, "ak_live_1");
        assert_eq!(config.source_host(), "api.eu-west-1.example.com");
        assert_eq!(
            config.source_base_url(),
            "https://api.eu-west-1.example.com:443"
        );

        // Clean up
        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("BRIDGE_API_KEY");
            std::env::remove_var("BRIDGE_MDS_ADDRESS");
        }
    }

    #[test]
    fn test_webhook_url_assembly() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("BRIDGE_MDS_GW_ADDRESS", "203.0.113.10");
            std::env::set_var("BRIDGE_MDS_GW_PORT", "8443");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(
            config.webhook_url(),
            "https://203.0.113.10:8443/events/notify"
        );
        assert_eq!(config.webhook_events_path(), "/events/notify");

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("BRIDGE_MDS_GW_ADDRESS");
            std::env::remove_var("BRIDGE_MDS_GW_PORT");
        }
    }

    #[test]
    fn test_malformed_attribute_list_falls_back() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("BRIDGE_MDS_ATTRIBUTE_URI_LIST", "not-json");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert!(config.attribute_uris().is_empty());

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("BRIDGE_MDS_ATTRIBUTE_URI_LIST");
        }
    }
}
