use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, SubscribeFilter, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives inbound publishes for one session. Invoked from the session's
/// single event-loop task, so delivery is serial per session.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message_receive(&self, topic: &str, message: &str);
}

/// Connection parameters for one per-device session.
#[derive(Debug, Clone)]
pub struct MqttSessionConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub clean_session: bool,
}

/// A per-device MQTT session over TLS.
///
/// One dedicated task drives the event loop: it maintains the connected
/// flag, lets the client auto-reconnect on transient errors, and forwards
/// publishes to the listener. `disconnect` halts the task cooperatively.
pub struct MqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    halt: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Build the session and start its event-loop task. The broker
    /// connection is established asynchronously; poll `is_connected` or
    /// just publish once the CONNACK has arrived.
    pub fn open(config: MqttSessionConfig, listener: Arc<dyn MessageListener>) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_credentials(&config.username, &config.password);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(config.clean_session);
        // TLS against the platform root store only; self-signed material is
        // not accepted by the hub.
        options.set_transport(Transport::tls_with_default_config());

        let (client, mut eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let halt = CancellationToken::new();

        let task_connected = Arc::clone(&connected);
        let task_halt = halt.clone();
        let client_id = config.client_id.clone();
        let event_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_halt.cancelled() => {
                        debug!(client_id = %client_id, "mqtt session halted");
                        break;
                    }
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                task_connected.store(true, Ordering::SeqCst);
                                info!(client_id = %client_id, "connected to peer MQTT");
                            }
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                let message = String::from_utf8_lossy(&publish.payload);
                                listener.on_message_receive(&publish.topic, &message).await;
                            }
                            Ok(Event::Incoming(Packet::SubAck(_))) => {
                                debug!(client_id = %client_id, "subscription acknowledged");
                            }
                            Ok(Event::Incoming(Packet::Disconnect)) => {
                                task_connected.store(false, Ordering::SeqCst);
                                warn!(client_id = %client_id, "peer disconnected the session");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                task_connected.store(false, Ordering::SeqCst);
                                warn!(client_id = %client_id, error = %e, "mqtt event loop error");
                                // Back off before the event loop retries the
                                // connection, staying responsive to halt.
                                tokio::select! {
                                    _ = task_halt.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                }
                            }
                        }
                    }
                }
            }
            task_connected.store(false, Ordering::SeqCst);
        });

        Self {
            client,
            connected,
            halt,
            event_task: Mutex::new(Some(event_task)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn subscribe(&self, topics: &[(String, QoS)]) -> bool {
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|(topic, qos)| SubscribeFilter::new(topic.clone(), *qos))
            .collect();
        match self.client.subscribe_many(filters).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "mqtt subscribe failed");
                false
            }
        }
    }

    /// Best effort; a failed unsubscribe on a dying session is not an error.
    pub async fn unsubscribe(&self, topics: &[String]) {
        for topic in topics {
            if let Err(e) = self.client.unsubscribe(topic.as_str()).await {
                debug!(topic = %topic, error = %e, "mqtt unsubscribe failed");
            }
        }
    }

    pub async fn send_message(&self, topic: &str, body: &str, qos: QoS) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.client.publish(topic, qos, false, body.as_bytes()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(topic = %topic, error = %e, "mqtt publish failed");
                false
            }
        }
    }

    /// Halt the event-loop task and drop the connection. A hard disconnect
    /// aborts the task instead of draining it.
    pub async fn disconnect(&self, hard: bool) {
        self.halt.cancel();
        let _ = self.client.disconnect().await;
        if let Some(task) = self.event_task.lock().await.take() {
            if hard {
                task.abort();
            } else if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                warn!("mqtt event task did not drain in time");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}
