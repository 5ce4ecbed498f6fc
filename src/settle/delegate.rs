use tracing::instrument;

use super::SettlementDispatcher;
use crate::error_class::ErrorClassifier;
use crate::facilitator_client::FacilitatorClient;
use crate::proto::{PaymentPayload, PaymentRequirements, SettleRequest, SettleResponse};

/// Relays settlement to a remote facilitator.
///
/// The peer's response is passed through unchanged. Transport failures and non-200
/// answers become a failed [`SettleResponse`] classified like a chain error.
#[derive(Debug, Clone)]
pub struct DelegatingDispatcher {
    client: FacilitatorClient,
}

impl DelegatingDispatcher {
    pub fn new(client: FacilitatorClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &FacilitatorClient {
        &self.client
    }
}

impl SettlementDispatcher for DelegatingDispatcher {
    #[instrument(skip_all, fields(network = %requirements.network, facilitator = %self.client.base_url()))]
    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> SettleResponse {
        let request = SettleRequest::new(payload.clone(), requirements.clone());
        match self.client.settle(&request).await {
            Ok(response) => response,
            Err(error) => {
                let classified = ErrorClassifier::classify_error(&error);
                tracing::warn!(kind = %classified.kind, error = %error, "Delegated settlement failed");
                SettleResponse::failed(requirements.network.clone(), classified.kind.code())
                    .with_message(classified.message)
            }
        }
    }
}
