use common::domain::{authentication_hash, MockEventSink, NotificationEvent};
use device_cloud::channel::{establish_webhook, webhook_router, WebhookSetup};
use device_cloud::client::{SourceCloudClient, SourceCloudConfig};
use device_cloud::dispatch::EventDispatcher;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const TARGET_URL: &str = "https://bridge.example.com/events";

// PUT /notification/callback: fail the first N attempts, then install.
struct FlakyWebhookPut {
    failures_left: AtomicU32,
    installed: Arc<AtomicBool>,
}

impl Respond for FlakyWebhookPut {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            ResponseTemplate::new(500)
        } else {
            self.installed.store(true, Ordering::SeqCst);
            ResponseTemplate::new(200)
        }
    }
}

// GET /notification/callback: reflect whether the PUT has landed yet.
struct WebhookGet {
    installed: Arc<AtomicBool>,
}

impl Respond for WebhookGet {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.installed.load(Ordering::SeqCst) {
            ResponseTemplate::new(200).set_body_json(json!({ "url": TARGET_URL }))
        } else {
            ResponseTemplate::new(404)
        }
    }
}

fn test_client(server: &MockServer) -> SourceCloudClient {
    SourceCloudClient::new(SourceCloudConfig {
        base_url: server.uri(),
        api_key: "ak_test".to_string(),
        ..SourceCloudConfig::default()
    })
    .unwrap()
}

async fn mount_webhook_endpoints(server: &MockServer, put_failures: u32) -> Arc<AtomicBool> {
    let installed = Arc::new(AtomicBool::new(false));

    Mock::given(method("PUT"))
        .and(path("/v2/notification/callback"))
        .respond_with(FlakyWebhookPut {
            failures_left: AtomicU32::new(put_failures),
            installed: Arc::clone(&installed),
        })
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/notification/callback"))
        .respond_with(WebhookGet {
            installed: Arc::clone(&installed),
        })
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v2/notification/callback"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v2/notification/pull"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;

    installed
}

fn setup(num_retries: u32) -> WebhookSetup {
    WebhookSetup {
        target_url: TARGET_URL.to_string(),
        auth_hash: "hash".to_string(),
        num_retries,
        retry_wait: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn webhook_establishes_after_transient_failures() {
    let server = MockServer::start().await;
    mount_webhook_endpoints(&server, 4).await;

    let client = test_client(&server);
    let halt = CancellationToken::new();

    assert!(establish_webhook(&client, &setup(25), &halt).await);

    // The fifth PUT succeeded; no further attempts were made.
    let puts = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .count();
    assert_eq!(puts, 5);
}

#[tokio::test]
async fn webhook_gives_up_after_retry_budget() {
    let server = MockServer::start().await;
    mount_webhook_endpoints(&server, u32::MAX).await;

    let client = test_client(&server);
    let halt = CancellationToken::new();

    assert!(!establish_webhook(&client, &setup(3), &halt).await);
}

#[tokio::test]
async fn webhook_already_set_is_left_alone() {
    let server = MockServer::start().await;
    let installed = mount_webhook_endpoints(&server, 0).await;
    installed.store(true, Ordering::SeqCst);

    let client = test_client(&server);
    let halt = CancellationToken::new();

    assert!(establish_webhook(&client, &setup(25), &halt).await);

    let puts = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .count();
    assert_eq!(puts, 0);
}

// ── Inbound webhook endpoint ─────────────────────────────────────────

async fn spawn_webhook(dispatcher: Arc<EventDispatcher>) -> String {
    let app = webhook_router("/events", dispatcher);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/events")
}

#[tokio::test]
async fn inbound_notification_is_acked_and_dispatched() {
    let mut sink = MockEventSink::new();
    sink.expect_dispatch_event()
        .withf(|event| matches!(event, NotificationEvent::Registration(entries) if entries[0].ep == "dev1"))
        .times(1)
        .returning(|_| ());

    let hash = authentication_hash("ak_test");
    let dispatcher = Arc::new(EventDispatcher::new(Arc::new(sink), hash.clone(), false));
    let url = spawn_webhook(dispatcher).await;

    let response = reqwest::Client::new()
        .post(&url)
        .header("Authentication", hash)
        .body(r#"{"registrations":[{"ep":"dev1","ept":"sensor","resources":[{"path":"/3/0","rt":"","obs":false}]}]}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/json;charset=utf-8"
    );
    assert_eq!(response.text().await.unwrap(), "{}");
}

#[tokio::test]
async fn invalid_auth_is_acked_but_not_processed() {
    let mut sink = MockEventSink::new();
    sink.expect_dispatch_event().times(0);

    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::new(sink),
        authentication_hash("ak_test"),
        false,
    ));
    let url = spawn_webhook(dispatcher).await;

    let response = reqwest::Client::new()
        .post(&url)
        .header("Authentication", "forged")
        .body(r#"{"registrations":[{"ep":"dev1"}]}"#)
        .send()
        .await
        .unwrap();

    // ACKed regardless of processing outcome.
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn duplicate_lifecycle_post_is_dropped() {
    let mut sink = MockEventSink::new();
    sink.expect_dispatch_event().times(1).returning(|_| ());

    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::new(sink),
        "hash".to_string(),
        true,
    ));
    let url = spawn_webhook(dispatcher).await;

    let body = r#"{"de-registrations":["dev1"]}"#;
    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client.post(&url).body(body).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }
}
