use crate::attributes::AttributeRetrievalDispatcher;
use crate::client::SourceCloudClient;
use async_trait::async_trait;
use common::domain::{
    api_execute_status, ApiRequest, ApiResponse, CoapVerb, DeviceRecord, DomainResult,
    RegistrationCompleter, UpstreamGateway,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The adapters' doorway back into the source cloud: CoAP relays, tunneled
/// API calls and attribute retrieval.
pub struct CloudGateway {
    client: Arc<SourceCloudClient>,
    attributes: Arc<AttributeRetrievalDispatcher>,
    enable_attribute_gets: bool,
}

impl CloudGateway {
    pub fn new(
        client: Arc<SourceCloudClient>,
        attributes: Arc<AttributeRetrievalDispatcher>,
        enable_attribute_gets: bool,
    ) -> Self {
        Self {
            client,
            attributes,
            enable_attribute_gets,
        }
    }
}

#[async_trait]
impl UpstreamGateway for CloudGateway {
    async fn endpoint_resource_operation<'a>(
        &self,
        verb: CoapVerb,
        device_id: &'a str,
        uri: &'a str,
        value: Option<&'a str>,
        options: Option<&'a str>,
    ) -> DomainResult<String> {
        self.client
            .endpoint_resource_operation(verb, device_id, uri, value, options)
            .await
    }

    async fn execute_api_request(&self, request: &ApiRequest) -> ApiResponse {
        let verb = match request.api_verb.parse::<CoapVerb>() {
            Ok(verb) => verb,
            Err(e) => {
                warn!(verb = %request.api_verb, error = %e, "api request with invalid verb");
                let mut response = ApiResponse::new(request, 400, "");
                response.api_response = api_execute_status("invalid coap verb");
                return response;
            }
        };

        match self
            .client
            .api_request(
                verb,
                &request.api_uri,
                request.api_body.as_ref(),
                request.api_options.as_deref(),
                request.api_content_type.as_deref(),
                request.api_key.as_deref(),
            )
            .await
        {
            Ok(http) => {
                debug!(uri = %request.api_uri, status = http.status, "api request executed");
                ApiResponse::new(request, http.status, &http.body)
            }
            Err(e) => {
                warn!(uri = %request.api_uri, error = %e, "api request transport failure");
                let mut response = ApiResponse::new(request, 502, "");
                response.api_response = api_execute_status("transport failure");
                response
            }
        }
    }

    async fn retrieve_device_attributes(
        &self,
        record: DeviceRecord,
        completer: Arc<dyn RegistrationCompleter>,
    ) {
        if self.enable_attribute_gets && record.has_device_attributes() {
            info!(device_id = %record.device_id, "fetching device attributes before shadow create");
            self.attributes.dispatch(record, completer).await;
        } else {
            // Nothing to fetch; the defaulted metadata is good enough.
            debug!(device_id = %record.device_id, "completing registration without attribute gets");
            completer.complete_new_device_registration(record).await;
        }
    }

    async fn join_attribute_retrieval(&self, device_id: &str) {
        self.attributes.join(device_id).await;
    }
}
