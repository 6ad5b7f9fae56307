use rumqttc::QoS;

/// Substring of the outbound topic that names plain observations; swapped
/// for one of the response keys when building reply topics.
pub const OBSERVATION_KEY: &str = "observation";
pub const CMD_RESPONSE_KEY: &str = "cmd-response";
pub const API_RESPONSE_KEY: &str = "api-response";

/// Digital-twin result notifications arrive on this wildcard.
pub const DIGITAL_TWIN_TOPIC: &str = "$iothub/twin/res/#";

const EPNAME_TOKEN: &str = "__EPNAME__";
const COMMAND_TYPE_TOKEN: &str = "__COMMAND_TYPE__";

/// Device prefixes join with `-`; `_` is rejected by the hub.
const PREFIX_SEPARATOR: &str = "-";

/// Optional per-peer device-id prefix. Both directions are pure functions;
/// `add` is idempotent so already-prefixed names pass through untouched.
#[derive(Debug, Clone, Default)]
pub struct PrefixPolicy {
    prefix: Option<String>,
}

impl PrefixPolicy {
    pub fn new(enabled: bool, prefix: Option<&str>) -> Self {
        let prefix = match prefix {
            Some(p) if enabled && !p.is_empty() => Some(format!("{p}{PREFIX_SEPARATOR}")),
            _ => None,
        };
        Self { prefix }
    }

    pub fn disabled() -> Self {
        Self { prefix: None }
    }

    /// Map a bare device id to its peer-side name.
    pub fn add(&self, device_id: &str) -> String {
        match &self.prefix {
            Some(p) if !device_id.starts_with(p.as_str()) => format!("{p}{device_id}"),
            _ => device_id.to_string(),
        }
    }

    /// Map a peer-side name back to the bare device id.
    pub fn remove(&self, prefixed_name: &str) -> String {
        match &self.prefix {
            Some(p) => prefixed_name
                .strip_prefix(p.as_str())
                .unwrap_or(prefixed_name)
                .trim()
                .to_string(),
            None => prefixed_name.trim().to_string(),
        }
    }
}

/// The fixed per-session topic set: command topic plus the digital-twin
/// notification wildcard, both at-least-once.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicData {
    pub subscriptions: Vec<(String, QoS)>,
}

impl TopicData {
    pub fn topic_strings(&self) -> Vec<String> {
        self.subscriptions.iter().map(|(t, _)| t.clone()).collect()
    }
}

/// Builds the peer's topic layout from the configured templates.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    observation_template: String,
    command_template: String,
}

impl TopicScheme {
    /// `observe_base` is the configured outbound topic base (`__EPNAME__`
    /// placeholder, trailing slash); the observation key is appended here.
    /// `command_template` may carry a `__COMMAND_TYPE__` placeholder which
    /// collapses to the wildcard.
    pub fn new(observe_base: &str, command_template: &str) -> Self {
        Self {
            observation_template: format!("{observe_base}{OBSERVATION_KEY}"),
            command_template: command_template.replace(COMMAND_TYPE_TOKEN, "#"),
        }
    }

    pub fn observation_topic(&self, prefixed_name: &str) -> String {
        self.observation_template.replace(EPNAME_TOKEN, prefixed_name)
    }

    pub fn command_topic(&self, prefixed_name: &str) -> String {
        self.command_template.replace(EPNAME_TOKEN, prefixed_name)
    }

    /// Reply topic for CoAP command responses.
    pub fn cmd_response_topic(&self, prefixed_name: &str) -> String {
        self.observation_topic(prefixed_name)
            .replace(OBSERVATION_KEY, CMD_RESPONSE_KEY)
    }

    /// Reply topic for tunneled API responses.
    pub fn api_response_topic(&self, prefixed_name: &str) -> String {
        self.observation_topic(prefixed_name)
            .replace(OBSERVATION_KEY, API_RESPONSE_KEY)
    }

    /// Per-session subscription set.
    pub fn endpoint_topic_data(&self, prefixed_name: &str) -> TopicData {
        TopicData {
            subscriptions: vec![
                (self.command_topic(prefixed_name), QoS::AtLeastOnce),
                (DIGITAL_TWIN_TOPIC.to_string(), QoS::AtLeastOnce),
            ],
        }
    }
}

/// Peer-side device name embedded in an inbound topic: the second slash
/// segment (`devices/<name>/messages/devicebound/...`).
pub fn device_name_from_topic(topic: &str) -> Option<String> {
    let segment = topic.split('/').nth(1)?;
    if segment.is_empty() {
        return None;
    }
    Some(segment.to_string())
}

/// Parse a `key=value` parameter out of a command topic
/// (`.../devicebound/coap_verb=get&coap_uri=/3/0/0`). Values run to the
/// next `&`, so resource paths with slashes survive.
pub fn topic_parameter(topic: &str, key: &str) -> Option<String> {
    let marker = format!("{key}=");
    let start = topic.find(&marker)? + marker.len();
    let rest = &topic[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    let value = &rest[..end];
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

pub fn is_digital_twin_topic(topic: &str) -> bool {
    topic.contains("twin/res")
}

/// Twin acknowledgement topic for a given request id.
pub fn twin_patch_topic(rid: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={rid}")
}

/// Request id carried on a twin result topic
/// (`$iothub/twin/res/<status>/?$rid=<rid>`).
pub fn twin_request_id(topic: &str) -> Option<String> {
    let start = topic.find("$rid=")? + "$rid=".len();
    let rest = &topic[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    let rid = &rest[..end];
    if rid.is_empty() {
        return None;
    }
    Some(rid.to_string())
}
