//! Payment gate for axum routes.
//!
//! The paygate handles:
//! - Extracting the payment payload from the `Payment-Signature` header, or from a
//!   `paymentPayload` field of a JSON request body
//! - Verifying it, locally with [`AuthorizationVerifier`] or through a remote facilitator
//! - Settling it before the guarded handler runs
//! - Returning 402 challenges when payment is missing or invalid
//!
//! ## Example
//!
//! ```ignore
//! use x402_gate::paygate::{Paygate, PaymentReceipt};
//!
//! let paygate = Arc::new(Paygate::new(registry, vec![requirements], resource, verifier, dispatcher));
//! let app = paygate.protect(Router::new().route("/paid", get(handler)));
//!
//! async fn handler(Extension(receipt): Extension<PaymentReceipt>) -> String {
//!     format!("paid by {}", receipt.payer)
//! }
//! ```

use alloy_primitives::Address;
use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Instrument, instrument};

use crate::chain::Network;
use crate::chain::eip155::Eip155ChainConnection;
use crate::config::{ConfigError, PaygateConfig, SettlementMode, VerificationMode};
use crate::error_class::{ErrorClassifier, ErrorKind};
use crate::facilitator_client::{FacilitatorClient, FacilitatorClientError};
use crate::facilitator_local::FacilitatorService;
use crate::networks::NetworkRegistry;
use crate::proto::{
    PaymentPayload, PaymentRequirements, ResourceInfo, SettleResponse, VerifyRequest,
    VerifyResponse,
};
use crate::requirement::{PaymentOffer, RequirementBuilder, RequirementError};
use crate::settle::{DelegatingDispatcher, Dispatcher, SettlementDispatcher};
use crate::timestamp::{Clock, SystemClock};
use crate::util::b64::Base64Bytes;
use crate::verify::AuthorizationVerifier;

pub const PAYMENT_SIGNATURE_HEADER: HeaderName = HeaderName::from_static("payment-signature");
pub const PAYMENT_REQUIRED_HEADER: HeaderName = HeaderName::from_static("payment-required");
pub const PAYMENT_RESPONSE_HEADER: HeaderName = HeaderName::from_static("payment-response");

/// Largest request body buffered while looking for a `paymentPayload` field.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Why a request did not get past verification. Rendered as the `error` of a 402 challenge.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Payment required")]
    PaymentRequired,
    #[error("Invalid payment payload: {0}")]
    InvalidPayload(String),
    #[error("Unable to find matching payment requirements")]
    NoPaymentMatching,
    #[error("{0}")]
    VerificationFailed(String),
    #[error("Facilitator verification failed: {0}")]
    Facilitator(#[from] FacilitatorClientError),
}

#[derive(Debug, thiserror::Error)]
pub enum PaygateInitError {
    #[error(transparent)]
    Requirement(#[from] RequirementError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Client(#[from] FacilitatorClientError),
    #[error("Direct settlement needs a configured network entry for {0}")]
    NoBroadcaster(Network),
}

/// Settled payment, attached to the request as an extension before the guarded handler runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payer: Address,
    pub transaction: String,
    pub network: Network,
}

/// Body returned instead of running the handler when settlement fails.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementFailure {
    #[serde(flatten)]
    pub settlement: SettleResponse,
    pub hint: &'static str,
}

impl SettlementFailure {
    pub fn new(settlement: SettleResponse) -> Self {
        let reason = settlement.error_reason.as_deref().unwrap_or_default();
        let hint = match ErrorKind::from_code(reason) {
            Some(kind) => kind.hint(),
            None => ErrorClassifier::classify(reason).hint,
        };
        Self { settlement, hint }
    }
}

/// The receipt for a successful settlement. A success that lacks its payer or
/// transaction is turned into a failure naming the missing field.
fn settlement_receipt(settlement: &SettleResponse) -> Result<PaymentReceipt, SettleResponse> {
    if !settlement.success {
        return Err(settlement.clone());
    }
    match (settlement.payer, &settlement.transaction) {
        (Some(payer), Some(transaction)) => Ok(PaymentReceipt {
            payer,
            transaction: transaction.clone(),
            network: settlement.network.clone(),
        }),
        (payer, transaction) => {
            let missing = if transaction.is_none() {
                "transaction"
            } else {
                "payer"
            };
            Err(SettleResponse::failed(
                settlement.network.clone(),
                format!("Settlement response missing {missing}"),
            )
            .with_payer(payer)
            .with_transaction(transaction.clone()))
        }
    }
}

/// Where authorizations are verified.
pub enum PaymentVerifier {
    Local {
        verifier: AuthorizationVerifier,
        clock: Arc<dyn Clock>,
    },
    Remote(FacilitatorClient),
}

impl PaymentVerifier {
    pub fn local(verifier: AuthorizationVerifier) -> Self {
        PaymentVerifier::Local {
            verifier,
            clock: Arc::new(SystemClock),
        }
    }

    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        match self {
            PaymentVerifier::Local { verifier, clock } => {
                Ok(verifier.verify(payload, requirements, clock.now()))
            }
            PaymentVerifier::Remote(client) => {
                let request = VerifyRequest::new(payload.clone(), requirements.clone());
                client
                    .verify(&request)
                    .instrument(tracing::info_span!("x402.paygate.remote_verify"))
                    .await
            }
        }
    }
}

impl std::fmt::Debug for PaymentVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentVerifier::Local { .. } => f.write_str("Local"),
            PaymentVerifier::Remote(client) => {
                f.debug_tuple("Remote").field(client.base_url()).finish()
            }
        }
    }
}

/// Guards routes behind an x402 payment.
///
/// Requirements are built once and shared. Settlement runs before the handler; a handler
/// never runs for a payment that did not settle.
#[derive(Debug)]
pub struct Paygate<C> {
    registry: Arc<NetworkRegistry>,
    accepts: Arc<Vec<PaymentRequirements>>,
    resource: ResourceInfo,
    verifier: PaymentVerifier,
    dispatcher: Dispatcher<C>,
}

impl<C> Paygate<C>
where
    C: Eip155ChainConnection + Send + Sync + 'static,
{
    pub fn new(
        registry: Arc<NetworkRegistry>,
        accepts: Vec<PaymentRequirements>,
        resource: ResourceInfo,
        verifier: PaymentVerifier,
        dispatcher: Dispatcher<C>,
    ) -> Self {
        Self {
            registry,
            accepts: Arc::new(accepts),
            resource,
            verifier,
            dispatcher,
        }
    }

    /// Builds the paygate described by `config`. Direct settlement borrows the
    /// broadcaster `service` runs for the configured network.
    pub fn from_config(
        config: &PaygateConfig,
        registry: Arc<NetworkRegistry>,
        service: &FacilitatorService<C>,
    ) -> Result<Self, PaygateInitError> {
        let mut offer = PaymentOffer::new(
            config.price.inner().clone(),
            config.network.clone(),
            *config.pay_to.inner(),
        );
        if let Some(asset) = config.asset {
            offer = offer.with_asset(asset, None);
        }
        if let Some(seconds) = config.max_timeout_seconds {
            offer = offer.with_max_timeout_seconds(seconds);
        }
        let requirements = RequirementBuilder::new(registry.clone()).build(&offer)?;

        let client = config
            .facilitator_url()?
            .map(|url| FacilitatorClient::try_from(url.as_str()))
            .transpose()?;

        let verifier = match (config.verification, &client) {
            (VerificationMode::Remote, Some(client)) => PaymentVerifier::Remote(client.clone()),
            (VerificationMode::Remote, None) => return Err(ConfigError::MissingFacilitatorUrl.into()),
            (VerificationMode::Local, _) => PaymentVerifier::local(
                AuthorizationVerifier::new(registry.clone())
                    .with_chain_id_override(config.chain_id_override),
            ),
        };

        let dispatcher = match (config.settlement, client) {
            (SettlementMode::Delegate, Some(client)) => {
                Dispatcher::Delegate(DelegatingDispatcher::new(client))
            }
            (SettlementMode::Delegate, None) => return Err(ConfigError::MissingFacilitatorUrl.into()),
            (SettlementMode::Direct, _) => {
                let broadcaster = service
                    .broadcaster(&config.network)
                    .ok_or_else(|| PaygateInitError::NoBroadcaster(config.network.clone()))?;
                Dispatcher::Direct(broadcaster.clone())
            }
        };

        Ok(Self::new(
            registry,
            vec![requirements],
            config.resource.clone(),
            verifier,
            dispatcher,
        ))
    }

    pub fn accepts(&self) -> &[PaymentRequirements] {
        &self.accepts
    }

    /// Installs the paygate in front of every route of `router`.
    pub fn protect<S>(self: Arc<Self>, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.route_layer(from_fn_with_state(self, paygate_middleware::<C>))
    }

    /// Handles an incoming request, processing payment if required.
    #[instrument(name = "x402.paygate.handle_request", skip_all, fields(path = %request.uri().path()))]
    pub async fn handle_request(&self, request: Request, next: Next) -> Response {
        let (payload, request) = match self.extract_payment_payload(request).await {
            Ok(extracted) => extracted,
            Err(response) => return response,
        };
        let Some(payload) = payload else {
            return self.challenge_response(&VerificationError::PaymentRequired);
        };
        let requirements = match self.verify_payment(&payload).await {
            Ok(requirements) => requirements,
            Err(err) => {
                tracing::debug!(error = %err, "Payment rejected");
                return self.challenge_response(&err);
            }
        };

        let settlement = self.dispatcher.settle(&payload, requirements).await;
        let receipt = match settlement_receipt(&settlement) {
            Ok(receipt) => receipt,
            Err(failure) => {
                tracing::warn!(reason = ?failure.error_reason, "Settlement failed");
                return (StatusCode::OK, Json(SettlementFailure::new(failure))).into_response();
            }
        };

        let mut request = request;
        request.extensions_mut().insert(receipt);
        let mut response = next
            .run(request)
            .instrument(tracing::info_span!("inner"))
            .await;
        match settlement_to_header(&settlement) {
            Ok(header) => {
                response.headers_mut().insert(PAYMENT_RESPONSE_HEADER, header);
            }
            Err(err) => tracing::warn!(error = %err, "Failed to encode Payment-Response header"),
        }
        response
    }

    /// Finds the payment payload and hands the request back, with its body restored if
    /// it was read.
    async fn extract_payment_payload(
        &self,
        request: Request,
    ) -> Result<(Option<PaymentPayload>, Request), Response> {
        if let Some(payload) = payload_from_headers(request.headers()) {
            return match payload {
                Ok(payload) => Ok((Some(payload), request)),
                Err(err) => Err(self.challenge_response(&VerificationError::InvalidPayload(err))),
            };
        }
        let (parts, body) = request.into_parts();
        let bytes = to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response())?;
        let payload = payload_from_body(&bytes);
        let request = Request::from_parts(parts, Body::from(bytes));
        match payload {
            None => Ok((None, request)),
            Some(Ok(payload)) => Ok((Some(payload), request)),
            Some(Err(err)) => Err(self.challenge_response(&VerificationError::InvalidPayload(err))),
        }
    }

    /// Verifies `payload` against the matching requirement and returns that requirement.
    pub async fn verify_payment(
        &self,
        payload: &PaymentPayload,
    ) -> Result<&PaymentRequirements, VerificationError> {
        let selected = self
            .accepts
            .iter()
            .find(|requirements| {
                self.registry
                    .same_chain(&requirements.network, &payload.accepted.network)
            })
            .ok_or(VerificationError::NoPaymentMatching)?;
        match self.verifier.verify(payload, selected).await? {
            VerifyResponse::Valid { .. } => Ok(selected),
            VerifyResponse::Invalid { reason, .. } => {
                Err(VerificationError::VerificationFailed(reason))
            }
        }
    }

    /// 402 with the challenge as JSON body and, base64 encoded, in `Payment-Required`.
    fn challenge_response(&self, err: &VerificationError) -> Response {
        let challenge =
            RequirementBuilder::challenge(self.accepts.to_vec(), self.resource.clone(), err.to_string());
        let mut response = (StatusCode::PAYMENT_REQUIRED, Json(&challenge)).into_response();
        match Base64Bytes::encode_json(&challenge)
            .map_err(|e| e.to_string())
            .and_then(|b64| HeaderValue::from_bytes(b64.as_ref()).map_err(|e| e.to_string()))
        {
            Ok(header) => {
                response.headers_mut().insert(PAYMENT_REQUIRED_HEADER, header);
            }
            Err(err) => tracing::warn!(error = %err, "Failed to encode Payment-Required header"),
        }
        response
    }
}

/// Middleware entry point for [`axum::middleware::from_fn_with_state`].
pub async fn paygate_middleware<C>(
    State(paygate): State<Arc<Paygate<C>>>,
    request: Request,
    next: Next,
) -> Response
where
    C: Eip155ChainConnection + Send + Sync + 'static,
{
    paygate.handle_request(request, next).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BodyWithPayment {
    payment_payload: Option<serde_json::Value>,
}

fn payload_from_headers(headers: &HeaderMap) -> Option<Result<PaymentPayload, String>> {
    let header = headers.get(PAYMENT_SIGNATURE_HEADER)?;
    Some(
        Base64Bytes::from(header.as_bytes())
            .decode_json()
            .map_err(|e| e.to_string()),
    )
}

fn payload_from_body(bytes: &Bytes) -> Option<Result<PaymentPayload, String>> {
    if bytes.is_empty() {
        return None;
    }
    let body: BodyWithPayment = serde_json::from_slice(bytes).ok()?;
    let value = body.payment_payload?;
    Some(serde_json::from_value(value).map_err(|e| e.to_string()))
}

fn settlement_to_header(settlement: &SettleResponse) -> Result<HeaderValue, String> {
    let encoded = Base64Bytes::encode_json(settlement).map_err(|e| e.to_string())?;
    HeaderValue::from_bytes(encoded.as_ref()).map_err(|e| e.to_string())
}
