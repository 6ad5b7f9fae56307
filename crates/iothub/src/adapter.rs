use crate::config::IoTHubConfig;
use crate::correlation::{async_response_id, AsyncCorrelationRecord, AsyncCorrelationStore};
use crate::credentials::CredentialService;
use crate::mqtt::{MessageListener, MqttSession, MqttSessionConfig};
use crate::session_table::{ShadowSession, ShadowSessionTable};
use crate::shadow_registry::ShadowRegistry;
use crate::topics::{
    device_name_from_topic, is_digital_twin_topic, topic_parameter, twin_patch_topic,
    twin_request_id, PrefixPolicy, TopicData, TopicScheme,
};
use async_trait::async_trait;
use common::domain::{
    api_execute_status, decode_coap_payload, payload_to_value, sanitize_endpoint_type, ApiRequest,
    AsyncResponseEntry, CoapVerb, DeviceRecord, DomainResult, EndpointTypeRegistry,
    ObservationEnvelope, PeerAdapter, RegistrationCompleter, RegistrationEntry, TelemetryEntry,
    UpstreamGateway,
};
use rumqttc::QoS;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};

/// CoAP command carried in a peer message:
/// `{"path":"/3/0/0","coap_verb":"get","new_value":"0","ep":"dev1"}`.
/// Verb and URI fall back to `coap_verb=`/`coap_uri=` topic parameters.
#[derive(Debug, Default, Deserialize)]
struct CoapCommand {
    #[serde(default)]
    path: Option<String>,

    #[serde(default)]
    coap_verb: Option<String>,

    #[serde(default)]
    new_value: Option<Value>,

    #[serde(default)]
    ep: Option<String>,

    #[serde(default)]
    options: Option<String>,
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Per-session receive callback; remembers which session it serves so twin
/// notifications (whose topic carries no device name) stay attributable.
struct SessionListener {
    adapter: Weak<IoTHubAdapter>,
    prefixed_name: String,
}

#[async_trait]
impl MessageListener for SessionListener {
    async fn on_message_receive(&self, topic: &str, message: &str) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter
                .on_message_receive(&self.prefixed_name, topic, message)
                .await;
        }
    }
}

/// MQTT-based peer adapter: one shadow identity plus one TLS MQTT session
/// per mirrored device.
pub struct IoTHubAdapter {
    config: IoTHubConfig,
    hub_name: String,
    credentials: Arc<CredentialService>,
    gateway: Arc<dyn UpstreamGateway>,
    shadow_registry: ShadowRegistry,
    sessions: ShadowSessionTable,
    types: Arc<EndpointTypeRegistry>,
    prefix: PrefixPolicy,
    topics: TopicScheme,
    correlation: AsyncCorrelationStore,
    self_ref: Weak<IoTHubAdapter>,
}

impl IoTHubAdapter {
    pub fn new(
        config: IoTHubConfig,
        credentials: Arc<CredentialService>,
        gateway: Arc<dyn UpstreamGateway>,
        types: Arc<EndpointTypeRegistry>,
    ) -> DomainResult<Arc<Self>> {
        let hub_name = credentials.hub_name().to_string();
        let shadow_registry = ShadowRegistry::new(
            config.registry_base_url(&hub_name),
            config.version_tag.clone(),
            Arc::clone(&credentials),
        )?;
        let prefix = PrefixPolicy::new(
            config.enable_device_id_prefix,
            config.device_id_prefix.as_deref(),
        );
        let topics = TopicScheme::new(&config.observe_topic_base, &config.command_topic_template);
        let sessions = ShadowSessionTable::new(config.max_shadows);

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            hub_name,
            credentials,
            gateway,
            shadow_registry,
            sessions,
            types,
            prefix,
            topics,
            correlation: AsyncCorrelationStore::default(),
            self_ref: weak.clone(),
        }))
    }

    pub fn session_table(&self) -> &ShadowSessionTable {
        &self.sessions
    }

    pub fn correlation_store(&self) -> &AsyncCorrelationStore {
        &self.correlation
    }

    fn completer(&self) -> Option<Arc<dyn RegistrationCompleter>> {
        self.self_ref
            .upgrade()
            .map(|adapter| adapter as Arc<dyn RegistrationCompleter>)
    }

    /// Open the MQTT session for a device and register it in the table.
    /// A session that already exists is left alone.
    async fn build_session(
        &self,
        prefixed_name: &str,
        endpoint_type: &str,
        restore: Option<TopicData>,
    ) -> DomainResult<()> {
        if self.sessions.has_session(prefixed_name).await {
            debug!(device = %prefixed_name, "session already exists");
            return Ok(());
        }

        let topic_data = restore.unwrap_or_else(|| self.topics.endpoint_topic_data(prefixed_name));
        let session_config = MqttSessionConfig {
            host: self.config.mqtt_host(&self.hub_name),
            port: self.config.mqtt_port,
            client_id: prefixed_name.to_string(),
            username: self.config.mqtt_username(&self.hub_name, prefixed_name),
            password: self.credentials.current_token().await,
            clean_session: true,
        };
        let listener = Arc::new(SessionListener {
            adapter: self.self_ref.clone(),
            prefixed_name: prefixed_name.to_string(),
        });

        let transport = Arc::new(MqttSession::open(session_config, listener));
        transport.subscribe(&topic_data.subscriptions).await;

        let session = ShadowSession {
            endpoint_type: endpoint_type.to_string(),
            topics: topic_data,
            transport: Arc::clone(&transport),
        };
        if let Err(e) = self.sessions.add_session(prefixed_name, session).await {
            transport.disconnect(true).await;
            return Err(e);
        }
        info!(device = %prefixed_name, endpoint_type = %endpoint_type, "mqtt session created");
        Ok(())
    }

    async fn publish(&self, prefixed_name: &str, topic: &str, body: &str) -> bool {
        match self.sessions.transport(prefixed_name).await {
            Some(transport) => {
                let sent = transport.send_message(topic, body, QoS::AtMostOnce).await;
                if !sent {
                    warn!(device = %prefixed_name, topic = %topic, "publish to peer failed");
                }
                sent
            }
            None => {
                debug!(device = %prefixed_name, "publish skipped, no session");
                false
            }
        }
    }

    /// Inbound message handler for one session. `session_name` identifies
    /// the session the message arrived on; the topic-embedded name wins
    /// when present.
    #[instrument(skip(self, message), fields(topic = %topic))]
    pub async fn on_message_receive(&self, session_name: &str, topic: &str, message: &str) {
        debug!(message_len = message.len(), "inbound peer message");

        if is_digital_twin_topic(topic) {
            self.handle_twin_notification(session_name, topic, message)
                .await;
            return;
        }

        let mut prefixed_name = device_name_from_topic(topic)
            .filter(|name| name != "+")
            .unwrap_or_else(|| session_name.to_string());

        if ApiRequest::is_api_request(message) {
            match ApiRequest::from_message(message) {
                Some(request) => {
                    let response = self.gateway.execute_api_request(&request).await;
                    let reply_topic = self.topics.api_response_topic(&prefixed_name);
                    self.publish(&prefixed_name, &reply_topic, &response.to_json())
                        .await;
                }
                None => warn!("malformed api request message"),
            }
            return;
        }

        let command: CoapCommand = serde_json::from_str(message).unwrap_or_default();
        let uri = command
            .path
            .clone()
            .or_else(|| topic_parameter(topic, "coap_uri"));
        let verb = command
            .coap_verb
            .clone()
            .or_else(|| topic_parameter(topic, "coap_verb"));
        let value = command.new_value.as_ref().map(value_as_string);

        let device_id = command
            .ep
            .clone()
            .unwrap_or_else(|| self.prefix.remove(&prefixed_name));
        if prefixed_name.is_empty() || prefixed_name == "+" {
            prefixed_name = self.prefix.add(&device_id);
        }

        let (Some(uri), Some(verb)) = (uri, verb) else {
            warn!("coap command missing verb or uri, dropping");
            return;
        };

        let verb = match verb.parse::<CoapVerb>() {
            Ok(verb) => verb,
            Err(e) => {
                warn!(error = %e, "unknown coap verb");
                let reply_topic = self.topics.cmd_response_topic(&prefixed_name);
                self.publish(
                    &prefixed_name,
                    &reply_topic,
                    &api_execute_status("invalid coap verb").to_string(),
                )
                .await;
                return;
            }
        };

        let response = match self
            .gateway
            .endpoint_resource_operation(
                verb,
                &device_id,
                &uri,
                value.as_deref(),
                command.options.as_deref(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(device = %device_id, verb = %verb, error = %e, "endpoint operation failed");
                return;
            }
        };

        if response.is_empty() {
            debug!(device = %device_id, verb = %verb, "empty upstream response (OK)");
            return;
        }

        // Deferred replies come back later through the notification channel;
        // only GET and PUT produce them. A synchronous GET reply becomes an
        // observation immediately. Exactly one of the two can happen.
        if let Some(async_id) = async_response_id(&response) {
            if matches!(verb, CoapVerb::Get | CoapVerb::Put) {
                let expired = self.correlation.expire_stale().await;
                if expired > 0 {
                    debug!(expired, "dropped stale async correlations");
                }
                self.correlation
                    .record(AsyncCorrelationRecord {
                        async_id,
                        verb,
                        device_id,
                        prefixed_name: prefixed_name.clone(),
                        uri,
                        inbound_topic: topic.to_string(),
                        reply_topic: self.topics.cmd_response_topic(&prefixed_name),
                        original_message: message.to_string(),
                    })
                    .await;
            } else {
                debug!(verb = %verb, "ignoring async response for verb (OK)");
            }
        } else if verb == CoapVerb::Get {
            let envelope =
                ObservationEnvelope::new(device_id, uri, payload_to_value(&response))
                    .with_verb(verb.as_str());
            let reply_topic = self.topics.cmd_response_topic(&prefixed_name);
            self.publish(&prefixed_name, &reply_topic, &envelope.to_json())
                .await;
        }
    }

    /// Twin result/desired-property notification: relay a desired value
    /// change down to the device as a CoAP PUT, then acknowledge with a
    /// reported-properties PATCH.
    async fn handle_twin_notification(&self, session_name: &str, topic: &str, message: &str) {
        debug!(device = %session_name, "digital twin notification");

        let parsed: Value = match serde_json::from_str(message) {
            Ok(parsed) => parsed,
            Err(_) if message.is_empty() => Value::Null,
            Err(e) => {
                debug!(error = %e, "unparsable twin notification body (OK)");
                Value::Null
            }
        };

        let desired = parsed.get("desired").unwrap_or(&parsed);
        let device_id = desired
            .get("ep")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.prefix.remove(session_name));

        if let (Some(path), Some(value)) = (
            desired.get("path").and_then(Value::as_str),
            desired.get("value"),
        ) {
            let value = value_as_string(value);
            if let Err(e) = self
                .gateway
                .endpoint_resource_operation(CoapVerb::Put, &device_id, path, Some(&value), None)
                .await
            {
                warn!(device = %device_id, path = %path, error = %e, "twin-driven put failed");
            }
        }

        if let Some(rid) = twin_request_id(topic) {
            self.publish(session_name, &twin_patch_topic(&rid), "{}").await;
        }
    }

    /// Tear down and rebuild one device's shadow and session, restoring its
    /// previous subscriptions.
    #[instrument(skip(self))]
    pub async fn reconnect_device(&self, device_id: &str, endpoint_type: &str) -> DomainResult<()> {
        let prefixed_name = self.prefix.add(device_id);
        let topics = self.sessions.topics(&prefixed_name).await;

        self.sessions.remove_session(&prefixed_name).await;
        // The old shadow may already be gone; recreate from scratch.
        if let Err(e) = self.shadow_registry.delete_device(&prefixed_name).await {
            warn!(device = %device_id, error = %e, "shadow delete during reconnect failed");
        }
        tokio::time::sleep(self.config.reconnect_sleep).await;

        let record = DeviceRecord::new(device_id, endpoint_type);
        self.shadow_registry.register_device(&prefixed_name).await?;
        tokio::time::sleep(self.config.reconnect_sleep).await;

        self.build_session(&prefixed_name, &record.endpoint_type, topics)
            .await
    }

    async fn process_registration_batch(&self, entries: &[RegistrationEntry]) {
        if entries.is_empty() {
            debug!("nothing to shadow (OK)");
            return;
        }

        let current = self.sessions.count().await;
        if current + entries.len() >= self.config.max_shadows {
            warn!(
                current,
                batch = entries.len(),
                cap = self.config.max_shadows,
                "shadow cap would be exceeded, skipping registration batch"
            );
            return;
        }

        let Some(completer) = self.completer() else {
            return;
        };

        for entry in entries {
            let endpoint_type =
                sanitize_endpoint_type(entry.ept.as_deref(), &self.config.default_endpoint_type);
            self.types
                .set_endpoint_type(&entry.ep, Some(&endpoint_type))
                .await;

            let mut record = DeviceRecord::new(&entry.ep, &endpoint_type);
            record.etag = entry.etag.clone();
            record.resources = entry.resources.clone();

            self.gateway
                .retrieve_device_attributes(record, Arc::clone(&completer))
                .await;
        }
    }
}

#[async_trait]
impl RegistrationCompleter for IoTHubAdapter {
    async fn complete_new_device_registration(&self, record: DeviceRecord) {
        PeerAdapter::complete_new_device_registration(self, record).await;
    }
}

#[async_trait]
impl PeerAdapter for IoTHubAdapter {
    fn name(&self) -> &str {
        "iothub-mqtt"
    }

    async fn register_new_device(&self, record: &DeviceRecord) -> DomainResult<()> {
        let prefixed_name = self.prefix.add(&record.device_id);
        self.shadow_registry.register_device(&prefixed_name).await?;
        self.build_session(&prefixed_name, &record.endpoint_type, None)
            .await
    }

    async fn delete_device(&self, device_id: &str) -> DomainResult<()> {
        // A retrieval worker may still be assembling this device's record;
        // let it finish before the shadow disappears underneath it.
        self.gateway.join_attribute_retrieval(device_id).await;

        let prefixed_name = self.prefix.add(device_id);
        self.sessions.remove_session(&prefixed_name).await;
        if let Err(e) = self.shadow_registry.delete_device(&prefixed_name).await {
            warn!(device = %device_id, error = %e, "unable to delete shadow from peer");
        }
        self.types.remove(device_id).await;
        info!(device = %device_id, "device shadow deleted");
        Ok(())
    }

    async fn process_notifications(&self, entries: &[TelemetryEntry]) {
        for entry in entries {
            let decoded = match decode_coap_payload(&entry.payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(device = %entry.ep, error = %e, "undecodable observation payload");
                    continue;
                }
            };

            let mut envelope = ObservationEnvelope::new(
                entry.ep.clone(),
                entry.path.clone(),
                payload_to_value(&decoded),
            );
            envelope.ct = entry.ct.clone();
            envelope.max_age = entry.max_age;

            let prefixed_name = self.prefix.add(&entry.ep);
            let topic = self.topics.observation_topic(&prefixed_name);
            if self.publish(&prefixed_name, &topic, &envelope.to_json()).await {
                debug!(device = %entry.ep, path = %entry.path, "observation forwarded");
            }
        }
    }

    async fn process_new_registrations(&self, entries: &[RegistrationEntry]) {
        self.process_registration_batch(entries).await;
    }

    async fn process_re_registrations(&self, entries: &[RegistrationEntry]) {
        // Re-registration is handled exactly like a new registration.
        self.process_registration_batch(entries).await;
    }

    async fn process_deregistrations(&self, device_ids: &[String]) {
        for device_id in device_ids {
            if self.config.remove_on_deregistration {
                info!(device = %device_id, "de-registration: deleting device shadow");
                let _ = self.delete_device(device_id).await;
            } else {
                // Keep the peer-side shadow and the recorded type; drop only
                // the live session.
                info!(device = %device_id, "de-registration: disconnecting session only");
                let prefixed_name = self.prefix.add(device_id);
                self.sessions.remove_session(&prefixed_name).await;
            }
        }
    }

    async fn process_registrations_expired(&self, device_ids: &[String]) {
        self.process_deregistrations(device_ids).await;
    }

    async fn process_device_deletions(&self, device_ids: &[String]) {
        for device_id in device_ids {
            let _ = self.delete_device(device_id).await;
        }
    }

    async fn process_async_responses(&self, entries: &[AsyncResponseEntry]) {
        for entry in entries {
            let Some(record) = self.correlation.take(&entry.id).await else {
                debug!(async_id = %entry.id, "no correlation for async response (OK)");
                continue;
            };

            if let Some(error) = &entry.error {
                warn!(async_id = %entry.id, device = %record.device_id, error = %error, "async response reported an error");
                continue;
            }

            let value = match &entry.payload {
                Some(payload) => match decode_coap_payload(payload) {
                    Ok(decoded) => payload_to_value(&decoded),
                    Err(e) => {
                        warn!(async_id = %entry.id, error = %e, "undecodable async payload");
                        continue;
                    }
                },
                None => Value::Null,
            };

            let envelope = ObservationEnvelope::new(record.device_id, record.uri, value)
                .with_verb(record.verb.as_str());
            self.publish(&record.prefixed_name, &record.reply_topic, &envelope.to_json())
                .await;
        }
    }

    async fn complete_new_device_registration(&self, record: DeviceRecord) {
        if let Err(e) = self.register_new_device(&record).await {
            warn!(device = %record.device_id, error = %e, "shadow registration failed");
            return;
        }

        self.types
            .set_endpoint_type(&record.device_id, Some(&record.endpoint_type))
            .await;

        let prefixed_name = self.prefix.add(&record.device_id);
        if let Err(e) = self
            .shadow_registry
            .establish_twin_properties(&prefixed_name, &record)
            .await
        {
            warn!(device = %record.device_id, error = %e, "twin property init failed (continuing)");
        }

        info!(device = %record.device_id, "device registration completed");
    }

    async fn shutdown(&self) {
        for name in self.sessions.names().await {
            self.sessions.remove_session(&name).await;
        }
        info!(adapter = %self.name(), "adapter shut down");
    }
}
