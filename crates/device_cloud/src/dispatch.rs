use common::domain::{contains_lifecycle_key, decode_notification_body, EventSink};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Decodes inbound notification bodies exactly once and hands the events to
/// the sink in dispatch order. All three channel modes feed this path.
pub struct EventDispatcher {
    sink: Arc<dyn EventSink>,
    expected_auth_hash: String,
    skip_validation: bool,
    last_message: Mutex<Option<String>>,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn EventSink>, expected_auth_hash: String, skip_validation: bool) -> Self {
        Self {
            sink,
            expected_auth_hash,
            skip_validation,
            last_message: Mutex::new(None),
        }
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Validate an inbound request's `Authentication` header against the
    /// hash installed in the callback descriptor. A missing header means
    /// push-URL delivery and is accepted.
    pub fn validate(&self, auth_header: Option<&str>) -> bool {
        if self.skip_validation {
            return true;
        }
        match auth_header {
            Some(header) => {
                let valid = header == self.expected_auth_hash;
                if !valid {
                    warn!("notification validation failed");
                }
                valid
            }
            None => true,
        }
    }

    /// Decode one body and dispatch its events. Byte-identical redelivery
    /// of a lifecycle body is dropped; telemetry duplicates always pass.
    pub async fn process_notification_body(&self, body: &str) {
        let trimmed = body.trim();
        if trimmed.is_empty() || trimmed == "{}" {
            debug!("empty notification body (OK)");
            return;
        }

        if self.is_duplicate(trimmed).await {
            warn!("duplicate message discovered, ignoring (OK)");
            return;
        }

        let events = match decode_notification_body(trimmed) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "unable to parse notification body");
                return;
            }
        };

        for event in events {
            debug!(kind = event.kind(), "dispatching event");
            self.sink.dispatch_event(event).await;
        }
    }

    async fn is_duplicate(&self, body: &str) -> bool {
        let mut last = self.last_message.lock().await;
        if last.as_deref() == Some(body) && contains_lifecycle_key(body) {
            return true;
        }
        *last = Some(body.to_string());
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{MockEventSink, NotificationEvent};

    fn dispatcher_with(sink: MockEventSink) -> EventDispatcher {
        EventDispatcher::new(Arc::new(sink), "expected-hash".to_string(), false)
    }

    #[tokio::test]
    async fn dispatches_decoded_events_in_order() {
        let mut sink = MockEventSink::new();
        let mut sequence = mockall::Sequence::new();
        sink.expect_dispatch_event()
            .withf(|event| matches!(event, NotificationEvent::Notification(_)))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| ());
        sink.expect_dispatch_event()
            .withf(|event| matches!(event, NotificationEvent::Deregistration(_)))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| ());

        let dispatcher = dispatcher_with(sink);
        dispatcher
            .process_notification_body(
                r#"{"de-registrations":["dev1"],"notifications":[{"ep":"dev2","path":"/1","payload":"AA=="}]}"#,
            )
            .await;
    }

    #[tokio::test]
    async fn identical_lifecycle_body_is_dropped_once_seen() {
        let mut sink = MockEventSink::new();
        // Only the first POST reaches the sink.
        sink.expect_dispatch_event().times(1).returning(|_| ());

        let dispatcher = dispatcher_with(sink);
        let body = r#"{"de-registrations":["dev1"]}"#;
        dispatcher.process_notification_body(body).await;
        dispatcher.process_notification_body(body).await;
    }

    #[tokio::test]
    async fn telemetry_duplicates_are_never_dropped() {
        let mut sink = MockEventSink::new();
        sink.expect_dispatch_event().times(2).returning(|_| ());

        let dispatcher = dispatcher_with(sink);
        let body = r#"{"notifications":[{"ep":"dev1","path":"/1","payload":"AA=="}]}"#;
        dispatcher.process_notification_body(body).await;
        dispatcher.process_notification_body(body).await;
    }

    #[tokio::test]
    async fn lifecycle_body_after_other_traffic_is_processed_again() {
        let mut sink = MockEventSink::new();
        sink.expect_dispatch_event().times(3).returning(|_| ());

        let dispatcher = dispatcher_with(sink);
        let lifecycle = r#"{"de-registrations":["dev1"]}"#;
        let telemetry = r#"{"notifications":[{"ep":"dev2","path":"/1","payload":"AA=="}]}"#;
        dispatcher.process_notification_body(lifecycle).await;
        dispatcher.process_notification_body(telemetry).await;
        // No longer byte-equal to the previous body, so it goes through.
        dispatcher.process_notification_body(lifecycle).await;
    }

    #[tokio::test]
    async fn empty_and_unparsable_bodies_reach_no_sink() {
        let mut sink = MockEventSink::new();
        sink.expect_dispatch_event().times(0);

        let dispatcher = dispatcher_with(sink);
        dispatcher.process_notification_body("").await;
        dispatcher.process_notification_body("{}").await;
        dispatcher.process_notification_body("not json").await;
    }

    #[tokio::test]
    async fn validation_accepts_matching_and_missing_headers() {
        let dispatcher = dispatcher_with(MockEventSink::new());
        assert!(dispatcher.validate(Some("expected-hash")));
        assert!(dispatcher.validate(None));
        assert!(!dispatcher.validate(Some("wrong")));
    }

    #[tokio::test]
    async fn skip_validation_accepts_anything() {
        let dispatcher =
            EventDispatcher::new(Arc::new(MockEventSink::new()), "h".to_string(), true);
        assert!(dispatcher.validate(Some("wrong")));
    }
}
