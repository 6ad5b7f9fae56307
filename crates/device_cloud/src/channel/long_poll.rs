use crate::client::SourceCloudClient;
use crate::dispatch::EventDispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Single long-poll worker: GET the poll URI in a loop and feed each body
/// to the common dispatch path. Upstream holds the request open until it
/// has something to say, so an empty reply just means another round.
#[instrument(skip_all, fields(uri = %long_poll_uri))]
pub async fn run_long_poll(
    client: Arc<SourceCloudClient>,
    long_poll_uri: String,
    dispatcher: Arc<EventDispatcher>,
    halt: CancellationToken,
) {
    info!("long-poll worker starting");

    loop {
        if halt.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = halt.cancelled() => break,
            result = client.pull_notifications(&long_poll_uri) => {
                match result {
                    Ok(body) => {
                        debug!(len = body.len(), "long-poll body received");
                        dispatcher.process_notification_body(&body).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "long-poll request failed");
                        tokio::select! {
                            _ = halt.cancelled() => break,
                            _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        }
    }

    info!("long-poll worker stopped");
}
