mod config;

use common::domain::{
    authentication_hash, credential_configured, EndpointTypeRegistry, EventSink,
    RegistrationCompleter, UpstreamGateway,
};
use common::telemetry::{init_telemetry, TelemetryConfig};
use config::ServiceConfig;
use device_cloud::attributes::AttributeRetrievalDispatcher;
use device_cloud::channel::{
    establish_webhook, run_long_poll, run_websocket, select_notification_mode, serve_webhook,
    websocket_url, NotificationMode, WebhookSetup,
};
use device_cloud::client::{SourceCloudClient, SourceCloudConfig};
use device_cloud::discovery::{run_shadow_setup, ShadowSetupConfig};
use device_cloud::dispatch::EventDispatcher;
use device_cloud::gateway::CloudGateway;
use iothub::adapter::IoTHubAdapter;
use iothub::config::IoTHubConfig;
use iothub::credentials::{
    CredentialService, DEFAULT_REFRESH_INTERVAL, DEFAULT_TOKEN_VALIDITY,
};
use orchestrator::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

enum BridgeExit {
    Shutdown,
    Reset,
}

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&TelemetryConfig {
        service_name: "shadow-bridge".to_string(),
        log_level: config.log_level.clone(),
        json_output: config.log_json,
    }) {
        eprintln!("Failed to initialize telemetry: {e}");
        std::process::exit(1);
    }

    info!(source = %config.source_host(), "starting shadow bridge");

    // A reset tears the whole bridge down and builds it again from
    // configuration; all device state is rediscovered from upstream.
    loop {
        match run_bridge(&config).await {
            Ok(BridgeExit::Shutdown) => break,
            Ok(BridgeExit::Reset) => {
                warn!("bridge reset: tearing down and re-initializing");
            }
            Err(e) => {
                error!("bridge failed to start: {e:#}");
                std::process::exit(1);
            }
        }
    }

    info!("shadow bridge exiting");
}

/// Build the peer credential service, preferring a connection string over
/// pre-supplied static material.
fn build_credentials(config: &ServiceConfig) -> Option<CredentialService> {
    if credential_configured(&config.iot_event_hub_connect_string) {
        match CredentialService::from_connection_string(
            &config.iot_event_hub_connect_string,
            DEFAULT_TOKEN_VALIDITY,
            DEFAULT_REFRESH_INTERVAL,
        ) {
            Ok(service) => return Some(service),
            Err(e) => {
                error!(error = %e, "connection string rejected");
                return None;
            }
        }
    }

    let static_token = if credential_configured(&config.iot_event_hub_sas_token) {
        Some(config.iot_event_hub_sas_token.clone())
    } else if credential_configured(&config.iot_event_hub_mqtt_password) {
        Some(config.iot_event_hub_mqtt_password.clone())
    } else {
        None
    };

    match static_token {
        Some(token) if !config.iot_event_hub_name.is_empty() => Some(
            CredentialService::from_static_token(config.iot_event_hub_name.clone(), token),
        ),
        _ => None,
    }
}

fn spawn_discovery(
    client: Arc<SourceCloudClient>,
    gateway: Arc<dyn UpstreamGateway>,
    types: Arc<EndpointTypeRegistry>,
    completer: Arc<dyn RegistrationCompleter>,
    setup: ShadowSetupConfig,
    halt: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match run_shadow_setup(client, gateway, types, completer, setup, halt).await {
            Ok(count) => info!(count, "initial shadow setup complete"),
            Err(e) => warn!(error = %e, "initial shadow setup failed"),
        }
    })
}

async fn run_bridge(config: &ServiceConfig) -> anyhow::Result<BridgeExit> {
    // Misconfigured credentials keep the bridge alive but idle, so it can
    // be reconfigured and restarted without crash-looping.
    if !credential_configured(&config.api_key) {
        warn!("source cloud API key is unconfigured; bridge is idle");
        tokio::signal::ctrl_c().await?;
        return Ok(BridgeExit::Shutdown);
    }
    let Some(credentials) = build_credentials(config) else {
        warn!("peer hub credentials are unconfigured; bridge is idle");
        tokio::signal::ctrl_c().await?;
        return Ok(BridgeExit::Shutdown);
    };
    let credentials = Arc::new(credentials);

    let halt = CancellationToken::new();
    let refresher = credentials.spawn_refresher(halt.child_token());

    let types = Arc::new(EndpointTypeRegistry::new(config.mds_def_ep_type.clone()));
    let client = Arc::new(SourceCloudClient::new(SourceCloudConfig {
        base_url: config.source_base_url(),
        api_key: config.api_key.clone(),
        pagination_limit: config.pelion_pagination_limit,
        enable_device_request_api: config.mds_enable_device_request_api,
        ..SourceCloudConfig::default()
    })?);

    let attributes = Arc::new(AttributeRetrievalDispatcher::new(
        Arc::clone(&client),
        config.attribute_uris(),
    ));
    let gateway: Arc<dyn UpstreamGateway> = Arc::new(CloudGateway::new(
        Arc::clone(&client),
        attributes,
        config.mds_enable_attribute_gets,
    ));

    let hub_config = IoTHubConfig {
        max_shadows: config.iot_event_hub_max_shadows,
        mqtt_host_template: config.iot_event_hub_mqtt_ip_address.clone(),
        mqtt_port: config.iot_event_hub_mqtt_port,
        mqtt_username_template: config.iot_event_hub_mqtt_username.clone(),
        version_tag: config.iot_event_hub_version_tag.clone(),
        observe_topic_base: config.iot_event_hub_observe_notification_topic.clone(),
        command_topic_template: config.iot_event_hub_coap_cmd_topic.clone(),
        enable_device_id_prefix: config.iot_event_hub_enable_device_id_prefix,
        device_id_prefix: (!config.iot_event_hub_device_id_prefix.is_empty())
            .then(|| config.iot_event_hub_device_id_prefix.clone()),
        default_endpoint_type: config.mds_def_ep_type.clone(),
        remove_on_deregistration: config.mds_remove_on_deregistration,
        reconnect_sleep: Duration::from_millis(config.iot_event_hub_reconnect_sleep_ms),
        shadow_registry_base_url: None,
    };
    let adapter = IoTHubAdapter::new(
        hub_config,
        Arc::clone(&credentials),
        Arc::clone(&gateway),
        Arc::clone(&types),
    )?;

    let orchestrator = Arc::new(
        Orchestrator::new(Arc::clone(&types), config.mds_remove_on_deregistration)
            .with_adapter(adapter),
    );
    info!(
        remove_on_deregistration = orchestrator.device_removed_on_deregistration(),
        "orchestrator initialized"
    );

    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::clone(&orchestrator) as Arc<dyn EventSink>,
        authentication_hash(&config.api_key),
        config.mds_skip_validation_checks,
    ));

    let mode = select_notification_mode(
        (!config.mds_notification_type.is_empty())
            .then_some(config.mds_notification_type.as_str()),
        config.mds_enable_long_poll,
        config.mds_enable_web_socket,
    );
    info!(mode = ?mode, "notification channel selected");

    let setup_config = ShadowSetupConfig {
        max_workers: config.mds_max_shadow_create_threads,
        default_endpoint_type: config.mds_def_ep_type.clone(),
        discovery_delay: Duration::from_millis(config.mds_device_discovery_delay_ms),
    };
    let completer = Arc::clone(&orchestrator) as Arc<dyn RegistrationCompleter>;

    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    workers.push(refresher);

    match mode {
        NotificationMode::Webhook => {
            let server_dispatcher = Arc::clone(&dispatcher);
            let server_halt = halt.child_token();
            let bind_addr = config.webhook_bind_addr();
            let events_path = config.webhook_events_path();
            workers.push(tokio::spawn(async move {
                if let Err(e) =
                    serve_webhook(bind_addr, events_path, server_dispatcher, server_halt).await
                {
                    error!(error = %e, "webhook receiver failed");
                }
            }));

            let setup = WebhookSetup {
                target_url: config.webhook_url(),
                auth_hash: authentication_hash(&config.api_key),
                num_retries: config.mds_webhook_num_retries,
                retry_wait: Duration::from_millis(config.mds_webhook_retry_wait_ms),
            };
            if establish_webhook(&client, &setup, &halt).await {
                if client.bulk_subscribe().await {
                    info!("webhook set; scanning for devices");
                    workers.push(spawn_discovery(
                        Arc::clone(&client),
                        Arc::clone(&gateway),
                        Arc::clone(&types),
                        completer,
                        setup_config,
                        halt.child_token(),
                    ));
                } else {
                    warn!("webhook set but bulk subscribe failed; not scanning for devices yet");
                }
            } else {
                error!("unable to establish webhook; restarting bridge");
                orchestrator.request_reset();
            }
        }
        NotificationMode::LongPoll => {
            if !client.bulk_subscribe().await {
                warn!("bulk subscribe failed; continuing with long poll");
            }
            workers.push(tokio::spawn(run_long_poll(
                Arc::clone(&client),
                config.mds_long_poll_uri.clone(),
                Arc::clone(&dispatcher),
                halt.child_token(),
            )));
            workers.push(spawn_discovery(
                Arc::clone(&client),
                Arc::clone(&gateway),
                Arc::clone(&types),
                completer,
                setup_config,
                halt.child_token(),
            ));
        }
        NotificationMode::WebSocket => {
            if !client.enable_websocket_channel().await {
                warn!("web-socket channel enable failed; listener will retry");
            }
            if !client.bulk_subscribe().await {
                warn!("bulk subscribe failed; continuing with web socket");
            }
            let ws_url = websocket_url(
                &config.source_base_url(),
                &client.config().connect_api_version,
            );
            workers.push(tokio::spawn(run_websocket(
                ws_url,
                config.api_key.clone(),
                Arc::clone(&dispatcher),
                halt.child_token(),
            )));
            workers.push(spawn_discovery(
                Arc::clone(&client),
                Arc::clone(&gateway),
                Arc::clone(&types),
                completer,
                setup_config,
                halt.child_token(),
            ));
        }
    }

    let exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            BridgeExit::Shutdown
        }
        _ = orchestrator.wait_for_reset() => BridgeExit::Reset,
    };

    // Teardown: halt workers, drop every session, remove the webhook so
    // upstream stops POSTing at a dead endpoint.
    halt.cancel();
    orchestrator.shutdown().await;
    client.remove_webhook().await;
    for worker in workers {
        if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
            warn!("worker did not stop in time");
        }
    }

    Ok(exit)
}
