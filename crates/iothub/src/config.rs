use std::time::Duration;

const HUB_TOKEN: &str = "__IOT_EVENT_HUB__";
const EPNAME_TOKEN: &str = "__EPNAME__";

/// Everything the MQTT peer adapter needs to know about its hub, resolved
/// from configuration before the adapter is built.
#[derive(Debug, Clone)]
pub struct IoTHubConfig {
    /// Shadow cap; one ephemeral port per session.
    pub max_shadows: usize,

    /// MQTT endpoint template, `__IOT_EVENT_HUB__` substituted.
    pub mqtt_host_template: String,
    pub mqtt_port: u16,

    /// Username template, `__IOT_EVENT_HUB__` and `__EPNAME__` substituted;
    /// the version tag is appended after a slash.
    pub mqtt_username_template: String,

    /// Full API version query fragment, e.g. `api-version=2016-11-14`.
    pub version_tag: String,

    /// Outbound topic base (`__EPNAME__` placeholder, trailing slash).
    pub observe_topic_base: String,

    /// Command topic template (`__EPNAME__`, `__COMMAND_TYPE__`).
    pub command_topic_template: String,

    pub enable_device_id_prefix: bool,
    pub device_id_prefix: Option<String>,

    /// Substituted when upstream omits or reserves the endpoint type.
    pub default_endpoint_type: String,

    /// Deregistration tears the whole shadow down when set; otherwise only
    /// the MQTT session drops.
    pub remove_on_deregistration: bool,

    /// Pause between the teardown and rebuild steps of a device reconnect.
    pub reconnect_sleep: Duration,

    /// Registry REST base; derived from the hub name in production,
    /// pointed at a local server in tests.
    pub shadow_registry_base_url: Option<String>,
}

impl Default for IoTHubConfig {
    fn default() -> Self {
        Self {
            max_shadows: 25_000,
            mqtt_host_template: format!("{HUB_TOKEN}.azure-devices.net"),
            mqtt_port: 8883,
            mqtt_username_template: format!("{HUB_TOKEN}.azure-devices.net/{EPNAME_TOKEN}"),
            version_tag: "api-version=2016-11-14".to_string(),
            observe_topic_base: format!("devices/{EPNAME_TOKEN}/messages/events/"),
            command_topic_template: format!(
                "devices/{EPNAME_TOKEN}/messages/devicebound/__COMMAND_TYPE__"
            ),
            enable_device_id_prefix: false,
            device_id_prefix: None,
            default_endpoint_type: "default".to_string(),
            remove_on_deregistration: false,
            reconnect_sleep: Duration::from_secs(10),
            shadow_registry_base_url: None,
        }
    }
}

impl IoTHubConfig {
    pub fn mqtt_host(&self, hub_name: &str) -> String {
        self.mqtt_host_template.replace(HUB_TOKEN, hub_name)
    }

    pub fn mqtt_username(&self, hub_name: &str, prefixed_name: &str) -> String {
        let base = self
            .mqtt_username_template
            .replace(HUB_TOKEN, hub_name)
            .replace(EPNAME_TOKEN, prefixed_name);
        format!("{base}/{}", self.version_tag)
    }

    pub fn registry_base_url(&self, hub_name: &str) -> String {
        self.shadow_registry_base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", self.mqtt_host(hub_name)))
    }
}
