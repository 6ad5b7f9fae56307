use crate::client::SourceCloudClient;
use crate::dispatch::EventDispatcher;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const ACK_CONTENT_TYPE: &str = "application/json;charset=utf-8";

/// Webhook establishment parameters.
#[derive(Debug, Clone)]
pub struct WebhookSetup {
    /// Public callback URL the source cloud will POST to.
    pub target_url: String,

    /// Hash installed in the callback descriptor and revalidated on every
    /// inbound request.
    pub auth_hash: String,

    pub num_retries: u32,
    pub retry_wait: Duration,
}

/// Router exposing the notification callback endpoint.
pub fn webhook_router(events_path: &str, dispatcher: Arc<EventDispatcher>) -> Router {
    Router::new()
        .route(events_path, post(handle_notification))
        .with_state(dispatcher)
}

/// Serve the callback endpoint until halted.
pub async fn serve_webhook(
    bind_addr: SocketAddr,
    events_path: String,
    dispatcher: Arc<EventDispatcher>,
    halt: CancellationToken,
) -> anyhow::Result<()> {
    let app = webhook_router(&events_path, dispatcher);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, path = %events_path, "webhook receiver listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { halt.cancelled().await })
        .await?;
    Ok(())
}

/// Every inbound request is ACKed with an empty JSON 200 regardless of
/// processing outcome; the source cloud only cares that we are alive.
async fn handle_notification(
    State(dispatcher): State<Arc<EventDispatcher>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let auth_header = headers
        .get("Authentication")
        .and_then(|value| value.to_str().ok());

    if dispatcher.validate(auth_header) {
        dispatcher.process_notification_body(&body).await;
    } else {
        warn!("notification validation failed, not processed (OK)");
    }

    ([(header::CONTENT_TYPE, ACK_CONTENT_TYPE)], "{}")
}

/// Install the callback upstream: drop any pull channel, drop any existing
/// callback, PUT the new descriptor, then verify by reading it back. Retries
/// with a fixed pause; the caller escalates to a bridge reset on terminal
/// failure.
#[instrument(skip_all, fields(target_url = %setup.target_url))]
pub async fn establish_webhook(
    client: &SourceCloudClient,
    setup: &WebhookSetup,
    halt: &CancellationToken,
) -> bool {
    for attempt in 0..setup.num_retries {
        if halt.is_cancelled() {
            return false;
        }
        info!(attempt, "setting up webhook");

        if client.get_webhook().await.as_deref() == Some(setup.target_url.as_str()) {
            debug!("webhook already set (OK)");
            return true;
        }

        // Callbacks and pull channels are mutually exclusive upstream.
        client.delete_pull_channel().await;
        client.remove_webhook().await;

        if client.put_webhook(&setup.target_url, &setup.auth_hash).await
            && client.get_webhook().await.as_deref() == Some(setup.target_url.as_str())
        {
            info!("webhook established");
            return true;
        }

        warn!(attempt, "webhook setup failed, pausing before retry");
        tokio::select! {
            _ = halt.cancelled() => return false,
            _ = tokio::time::sleep(setup.retry_wait) => {}
        }
    }

    warn!(retries = setup.num_retries, "unable to establish webhook");
    false
}
