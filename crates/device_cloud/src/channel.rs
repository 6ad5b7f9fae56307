mod long_poll;
mod webhook;
mod websocket;

pub use long_poll::*;
pub use webhook::*;
pub use websocket::*;

/// Which notification channel the bridge runs. Exactly one mode is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    Webhook,
    WebSocket,
    LongPoll,
}

/// Resolve the channel mode from configuration.
///
/// An explicit `notification_type` wins; the legacy boolean pair is honored
/// with priority websocket > long-poll > webhook.
pub fn select_notification_mode(
    notification_type: Option<&str>,
    enable_long_poll: bool,
    enable_web_socket: bool,
) -> NotificationMode {
    if let Some(explicit) = notification_type.filter(|t| !t.is_empty()) {
        let lowered = explicit.to_ascii_lowercase();
        if lowered == "webhook" {
            return NotificationMode::Webhook;
        }
        if lowered == "websocket" {
            return NotificationMode::WebSocket;
        }
        if lowered.contains("poll") {
            return NotificationMode::LongPoll;
        }
        tracing::warn!(notification_type = %explicit, "unknown notification type, using webhook");
        return NotificationMode::Webhook;
    }

    if enable_web_socket {
        NotificationMode::WebSocket
    } else if enable_long_poll {
        NotificationMode::LongPoll
    } else {
        NotificationMode::Webhook
    }
}
