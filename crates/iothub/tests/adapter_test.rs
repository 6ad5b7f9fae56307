use async_trait::async_trait;
use common::domain::{
    encode_coap_payload, ApiResponse, AsyncResponseEntry, CoapVerb, EndpointTypeRegistry,
    MockUpstreamGateway, PeerAdapter, RegistrationEntry, TelemetryEntry, UpstreamGateway,
};
use iothub::adapter::IoTHubAdapter;
use iothub::config::IoTHubConfig;
use iothub::credentials::CredentialService;
use iothub::mqtt::{MessageListener, MqttSession, MqttSessionConfig};
use iothub::session_table::ShadowSession;
use iothub::topics::TopicData;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct NullListener;

#[async_trait]
impl MessageListener for NullListener {
    async fn on_message_receive(&self, _topic: &str, _message: &str) {}
}

fn test_config(max_shadows: usize, registry_url: Option<String>) -> IoTHubConfig {
    IoTHubConfig {
        max_shadows,
        shadow_registry_base_url: registry_url,
        reconnect_sleep: Duration::from_millis(10),
        ..IoTHubConfig::default()
    }
}

fn test_adapter(
    gateway: MockUpstreamGateway,
    max_shadows: usize,
    registry_url: Option<String>,
) -> (Arc<IoTHubAdapter>, Arc<EndpointTypeRegistry>) {
    let credentials = Arc::new(CredentialService::from_static_token(
        "testhub",
        "SharedAccessSignature sr=testhub",
    ));
    let types = Arc::new(EndpointTypeRegistry::new("default"));
    let gateway: Arc<dyn UpstreamGateway> = Arc::new(gateway);
    let adapter = IoTHubAdapter::new(
        test_config(max_shadows, registry_url),
        credentials,
        gateway,
        Arc::clone(&types),
    )
    .expect("adapter should build");
    (adapter, types)
}

// A detached session pointing at a closed local port; never connects, which
// is all these tests need.
fn dangling_session(endpoint_type: &str) -> ShadowSession {
    let config = MqttSessionConfig {
        host: "127.0.0.1".to_string(),
        port: 18883,
        client_id: "test".to_string(),
        username: "u".to_string(),
        password: "p".to_string(),
        clean_session: true,
    };
    ShadowSession {
        endpoint_type: endpoint_type.to_string(),
        topics: TopicData {
            subscriptions: vec![],
        },
        transport: Arc::new(MqttSession::open(config, Arc::new(NullListener))),
    }
}

fn registration_entry(ep: &str, ept: Option<&str>) -> RegistrationEntry {
    RegistrationEntry {
        ep: ep.to_string(),
        ept: ept.map(str::to_string),
        etag: None,
        resources: vec![],
    }
}

#[tokio::test]
async fn coap_get_with_sync_response_records_no_correlation() {
    let mut gateway = MockUpstreamGateway::new();
    gateway
        .expect_endpoint_resource_operation()
        .withf(|verb, device_id, uri, _, _| {
            *verb == CoapVerb::Get && device_id == "dev1" && uri == "/3/0/0"
        })
        .times(1)
        .returning(|_, _, _, _, _| Ok("42".to_string()));

    let (adapter, _) = test_adapter(gateway, 100, None);
    adapter
        .on_message_receive(
            "dev1",
            "devices/dev1/messages/devicebound/coap_verb=get&coap_uri=/3/0/0",
            r#"{"path":"/3/0/0","coap_verb":"get","ep":"dev1"}"#,
        )
        .await;

    // Synchronous GET reply becomes an observation, never a correlation.
    assert!(adapter.correlation_store().is_empty().await);
}

#[tokio::test]
async fn coap_get_with_async_response_records_exactly_one_correlation() {
    let mut gateway = MockUpstreamGateway::new();
    gateway
        .expect_endpoint_resource_operation()
        .times(1)
        .returning(|_, _, _, _, _| Ok(r#"{"async-response-id":"ar-123"}"#.to_string()));

    let (adapter, _) = test_adapter(gateway, 100, None);
    adapter
        .on_message_receive(
            "dev1",
            "devices/dev1/messages/devicebound/x",
            r#"{"path":"/3/0/0","coap_verb":"get","ep":"dev1"}"#,
        )
        .await;

    assert_eq!(adapter.correlation_store().len().await, 1);

    // The matching async response consumes the correlation.
    adapter
        .process_async_responses(&[AsyncResponseEntry {
            id: "ar-123".to_string(),
            status: Some(200),
            payload: Some(encode_coap_payload("42")),
            error: None,
        }])
        .await;

    assert!(adapter.correlation_store().is_empty().await);
}

#[tokio::test]
async fn async_response_for_post_is_not_recorded() {
    let mut gateway = MockUpstreamGateway::new();
    gateway
        .expect_endpoint_resource_operation()
        .times(1)
        .returning(|_, _, _, _, _| Ok(r#"{"async-response-id":"ar-9"}"#.to_string()));

    let (adapter, _) = test_adapter(gateway, 100, None);
    adapter
        .on_message_receive(
            "dev1",
            "devices/dev1/messages/devicebound/x",
            r#"{"path":"/3/0/1","coap_verb":"post","new_value":"1","ep":"dev1"}"#,
        )
        .await;

    assert!(adapter.correlation_store().is_empty().await);
}

#[tokio::test]
async fn unknown_coap_verb_never_reaches_upstream() {
    let mut gateway = MockUpstreamGateway::new();
    gateway.expect_endpoint_resource_operation().times(0);

    let (adapter, _) = test_adapter(gateway, 100, None);
    adapter
        .on_message_receive(
            "dev1",
            "devices/dev1/messages/devicebound/x",
            r#"{"path":"/3/0/0","coap_verb":"observe","ep":"dev1"}"#,
        )
        .await;
}

#[tokio::test]
async fn verb_and_uri_fall_back_to_topic_parameters() {
    let mut gateway = MockUpstreamGateway::new();
    gateway
        .expect_endpoint_resource_operation()
        .withf(|verb, _, uri, _, _| *verb == CoapVerb::Put && uri == "/3/0/13")
        .times(1)
        .returning(|_, _, _, _, _| Ok(String::new()));

    let (adapter, _) = test_adapter(gateway, 100, None);
    adapter
        .on_message_receive(
            "dev1",
            "devices/dev1/messages/devicebound/coap_verb=put&coap_uri=/3/0/13",
            r#"{"new_value":"7","ep":"dev1"}"#,
        )
        .await;
}

#[tokio::test]
async fn api_request_is_tunneled_upstream() {
    let mut gateway = MockUpstreamGateway::new();
    gateway
        .expect_execute_api_request()
        .times(1)
        .returning(|request| ApiResponse::new(request, 200, r#"{"id":"tenant-1"}"#));
    gateway.expect_endpoint_resource_operation().times(0);

    let (adapter, _) = test_adapter(gateway, 100, None);
    adapter
        .on_message_receive(
            "dev1",
            "devices/dev1/messages/devicebound/x",
            r#"{"api_uri":"/v3/accounts/me","api_verb":"get","api_request_id":1}"#,
        )
        .await;
}

#[tokio::test]
async fn twin_notification_relays_desired_value_as_put() {
    let mut gateway = MockUpstreamGateway::new();
    gateway
        .expect_endpoint_resource_operation()
        .withf(|verb, device_id, uri, value, _| {
            *verb == CoapVerb::Put
                && device_id == "dev1"
                && uri == "/3311/0/5850"
                && *value == Some("1")
        })
        .times(1)
        .returning(|_, _, _, _, _| Ok(String::new()));

    let (adapter, _) = test_adapter(gateway, 100, None);
    adapter
        .on_message_receive(
            "dev1",
            "$iothub/twin/res/200/?$rid=12",
            r#"{"desired":{"path":"/3311/0/5850","value":"1"}}"#,
        )
        .await;
}

#[tokio::test]
async fn registration_batch_over_cap_is_skipped() {
    let mut gateway = MockUpstreamGateway::new();
    gateway.expect_retrieve_device_attributes().times(0);

    let (adapter, _) = test_adapter(gateway, 3, None);
    for name in ["a", "b", "c"] {
        adapter
            .session_table()
            .add_session(name, dangling_session("sensor"))
            .await
            .unwrap();
    }

    adapter
        .process_new_registrations(&[
            registration_entry("new1", Some("sensor")),
            registration_entry("new2", Some("sensor")),
        ])
        .await;

    // The earlier three sessions are unaffected and no new ones appeared.
    assert_eq!(adapter.session_table().count().await, 3);
}

#[tokio::test]
async fn registration_under_cap_triggers_attribute_retrieval_per_device() {
    let mut gateway = MockUpstreamGateway::new();
    gateway
        .expect_retrieve_device_attributes()
        .times(2)
        .returning(|_, _| ());

    let (adapter, types) = test_adapter(gateway, 100, None);
    adapter
        .process_new_registrations(&[
            registration_entry("dev1", Some("sensor")),
            registration_entry("dev2", None),
        ])
        .await;

    assert_eq!(types.endpoint_type("dev1").await.as_deref(), Some("sensor"));
    // Missing type is sanitized to the default.
    assert_eq!(types.endpoint_type("dev2").await.as_deref(), Some("default"));
}

#[tokio::test]
async fn re_registration_is_treated_like_registration() {
    let mut gateway = MockUpstreamGateway::new();
    gateway
        .expect_retrieve_device_attributes()
        .times(1)
        .returning(|_, _| ());

    let (adapter, _) = test_adapter(gateway, 100, None);
    adapter
        .process_re_registrations(&[registration_entry("dev1", Some("sensor"))])
        .await;
}

#[tokio::test]
async fn deregistration_without_removal_policy_keeps_shadow_and_type() {
    let gateway = MockUpstreamGateway::new();
    let (adapter, types) = test_adapter(gateway, 100, None);

    types.set_endpoint_type("dev1", Some("sensor")).await;
    adapter
        .session_table()
        .add_session("dev1", dangling_session("sensor"))
        .await
        .unwrap();

    adapter
        .process_deregistrations(&["dev1".to_string()])
        .await;

    // Session gone, shadow-side state retained.
    assert!(!adapter.session_table().has_session("dev1").await);
    assert_eq!(types.endpoint_type("dev1").await.as_deref(), Some("sensor"));
}

#[tokio::test]
async fn device_deletion_clears_session_shadow_and_type() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/devices/dev1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut gateway = MockUpstreamGateway::new();
    gateway
        .expect_join_attribute_retrieval()
        .times(1)
        .returning(|_| ());
    let (adapter, types) = test_adapter(gateway, 100, Some(server.uri()));

    types.set_endpoint_type("dev1", Some("sensor")).await;
    adapter
        .session_table()
        .add_session("dev1", dangling_session("sensor"))
        .await
        .unwrap();

    adapter
        .process_device_deletions(&["dev1".to_string()])
        .await;

    assert!(!adapter.session_table().has_session("dev1").await);
    assert!(types.endpoint_type("dev1").await.is_none());
}

#[tokio::test]
async fn notifications_without_session_are_skipped() {
    let gateway = MockUpstreamGateway::new();
    let (adapter, _) = test_adapter(gateway, 100, None);

    // No session exists; forwarding is skipped without error.
    adapter
        .process_notifications(&[TelemetryEntry {
            ep: "ghost".to_string(),
            path: "/3303/0/5700".to_string(),
            payload: encode_coap_payload("21.5"),
            ct: None,
            max_age: None,
        }])
        .await;
}

#[tokio::test]
async fn undecodable_notification_payload_is_skipped() {
    let gateway = MockUpstreamGateway::new();
    let (adapter, _) = test_adapter(gateway, 100, None);

    adapter
        .process_notifications(&[TelemetryEntry {
            ep: "dev1".to_string(),
            path: "/3/0/0".to_string(),
            payload: "@@not-base64@@".to_string(),
            ct: None,
            max_age: None,
        }])
        .await;
}

#[tokio::test]
async fn async_response_without_correlation_is_ignored() {
    let gateway = MockUpstreamGateway::new();
    let (adapter, _) = test_adapter(gateway, 100, None);

    adapter
        .process_async_responses(&[AsyncResponseEntry {
            id: "ar-unknown".to_string(),
            status: Some(200),
            payload: None,
            error: None,
        }])
        .await;

    assert!(adapter.correlation_store().is_empty().await);
}

#[tokio::test]
async fn reconnect_rebuilds_shadow_and_session() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/devices/dev1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/devices/dev1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"deviceId":"dev1"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = MockUpstreamGateway::new();
    let (adapter, _) = test_adapter(gateway, 100, Some(server.uri()));
    adapter
        .session_table()
        .add_session("dev1", dangling_session("sensor"))
        .await
        .unwrap();

    adapter.reconnect_device("dev1", "sensor").await.unwrap();

    // A fresh session replaced the old one.
    assert!(adapter.session_table().has_session("dev1").await);
    assert_eq!(
        adapter.session_table().endpoint_type("dev1").await.as_deref(),
        Some("sensor")
    );
}

#[tokio::test]
async fn shutdown_drops_all_sessions() {
    let gateway = MockUpstreamGateway::new();
    let (adapter, _) = test_adapter(gateway, 100, None);

    for name in ["a", "b"] {
        adapter
            .session_table()
            .add_session(name, dangling_session("sensor"))
            .await
            .unwrap();
    }

    adapter.shutdown().await;
    assert_eq!(adapter.session_table().count().await, 0);
}
