use crate::dispatch::EventDispatcher;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Web-socket URL for the notification stream, derived from the REST base.
pub fn websocket_url(base_url: &str, connect_api_version: &str) -> String {
    let ws_base = base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{ws_base}/v{connect_api_version}/notification/websocket-connect")
}

/// Single listener worker: maintain the socket, feed each text frame to the
/// common dispatch path, reconnect with exponential backoff. A clean server
/// close resets the backoff and reconnects immediately.
#[instrument(skip_all, fields(url = %ws_url))]
pub async fn run_websocket(
    ws_url: String,
    api_key: String,
    dispatcher: Arc<EventDispatcher>,
    halt: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = halt.cancelled() => break,
            result = connect_and_read(&ws_url, &api_key, &dispatcher, &halt) => {
                match result {
                    Ok(()) => {
                        info!("web-socket disconnected cleanly, reconnecting");
                        attempt = 0;
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "web-socket error");
                        let delay = backoff_delay(attempt);
                        tokio::select! {
                            biased;
                            _ = halt.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        }
    }

    info!("web-socket worker stopped");
}

async fn connect_and_read(
    ws_url: &str,
    api_key: &str,
    dispatcher: &Arc<EventDispatcher>,
    halt: &CancellationToken,
) -> anyhow::Result<()> {
    let uri: tungstenite::http::Uri = ws_url.parse()?;
    let request =
        ClientRequestBuilder::new(uri).with_header("Authorization", format!("Bearer {api_key}"));

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
    info!("web-socket connected");

    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            _ = halt.cancelled() => return Ok(()),
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        dispatcher.process_notification_body(&text).await;
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        debug!("web-socket ping");
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => {
                        info!("web-socket close frame received");
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("web-socket stream ended");
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = INITIAL_BACKOFF.as_secs_f64() * 2.0_f64.powi(attempt.min(10) as i32);
    Duration::from_secs_f64(exp.min(MAX_BACKOFF.as_secs_f64()))
}
