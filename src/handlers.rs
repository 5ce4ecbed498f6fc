//! HTTP endpoints of the x402 facilitator.
//!
//! - `GET /verify`, `GET /settle`: machine-readable endpoint descriptions
//! - `POST /verify`, `POST /settle`: the facilitator peer protocol
//! - `GET /supported`: configured scheme/network pairs and signer addresses
//! - `GET /health`: liveness, answered from `supported`
//!
//! A verification or settlement failure is a 200 with the failure in the body.
//! Only a failure to produce an outcome at all is a 500.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::fmt::Display;
use tracing::instrument;

use crate::facilitator::Facilitator;
use crate::proto::{SettleRequest, VerifyRequest};

pub fn routes<A>() -> Router<A>
where
    A: Facilitator + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/verify", get(get_verify_info).post(post_verify::<A>))
        .route("/settle", get(get_settle_info).post(post_settle::<A>))
        .route("/supported", get(get_supported::<A>))
        .route("/health", get(get_health::<A>))
}

/// `GET /verify`: describes the `POST /verify` body.
#[instrument(skip_all)]
pub async fn get_verify_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/verify",
        "description": "POST to verify x402 payments",
        "body": {
            "paymentPayload": "PaymentPayload",
            "paymentRequirements": "PaymentRequirements",
        }
    }))
}

/// `GET /settle`: describes the `POST /settle` body.
#[instrument(skip_all)]
pub async fn get_settle_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/settle",
        "description": "POST to settle x402 payments",
        "body": {
            "paymentPayload": "PaymentPayload",
            "paymentRequirements": "PaymentRequirements",
        }
    }))
}

#[instrument(skip_all)]
pub async fn get_supported<A: Facilitator>(State(facilitator): State<A>) -> Response {
    match facilitator.supported().await {
        Ok(supported) => (StatusCode::OK, Json(supported)).into_response(),
        Err(error) => internal_error("Failed to list supported kinds", error),
    }
}

#[instrument(skip_all)]
pub async fn get_health<A: Facilitator>(State(facilitator): State<A>) -> Response {
    get_supported(State(facilitator)).await
}

#[instrument(skip_all)]
pub async fn post_verify<A: Facilitator>(
    State(facilitator): State<A>,
    Json(body): Json<VerifyRequest>,
) -> Response {
    match facilitator.verify(&body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => internal_error("Verification failed", error),
    }
}

#[instrument(skip_all)]
pub async fn post_settle<A: Facilitator>(
    State(facilitator): State<A>,
    Json(body): Json<SettleRequest>,
) -> Response {
    match facilitator.settle(&body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => internal_error("Settlement failed", error),
    }
}

fn internal_error<E: Display>(context: &'static str, error: E) -> Response {
    tracing::error!(error = %error, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{context}: {error}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facilitator_local::FacilitatorService;
    use crate::settle::DirectBroadcaster;
    use crate::test_support::*;
    use crate::timestamp::{FixedClock, UnixTimestamp};
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let broadcaster = Arc::new(DirectBroadcaster::new(MockConnection::new(43113), fuji_info()));
        let service = FacilitatorService::new(fuji_registry(), vec![broadcaster])
            .unwrap()
            .with_clock(FixedClock(UnixTimestamp::from_secs(NOW)));
        routes().with_state(Arc::new(service))
    }

    async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn request_body(params: AuthorizationParams) -> Value {
        let requirements = fuji_requirements();
        let request = VerifyRequest::new(signed_payload(&requirements, params), requirements);
        serde_json::to_value(request).unwrap()
    }

    #[tokio::test]
    async fn test_post_verify() {
        let (status, body) = call(
            app(),
            Method::POST,
            "/verify",
            Some(request_body(AuthorizationParams::default())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isValid"], true);
        let reported: alloy_primitives::Address =
            serde_json::from_value(body["payer"].clone()).unwrap();
        assert_eq!(reported, payer().address());
    }

    #[tokio::test]
    async fn test_post_verify_invalid_is_200() {
        let params = AuthorizationParams {
            value: alloy_primitives::U256::from(1u64),
            ..Default::default()
        };
        let (status, body) = call(app(), Method::POST, "/verify", Some(request_body(params))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isValid"], false);
        assert_eq!(body["invalidReason"], "insufficient amount");
    }

    #[tokio::test]
    async fn test_post_settle() {
        let (status, body) = call(
            app(),
            Method::POST,
            "/settle",
            Some(request_body(AuthorizationParams::default())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["network"], "eip155:43113");
        assert!(body["transaction"].as_str().unwrap().starts_with("0x"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let (status, _) = call(
            app(),
            Method::POST,
            "/verify",
            Some(json!({ "paymentPayload": 1 })),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_supported_and_health() {
        let (status, body) = call(app(), Method::GET, "/supported", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kinds"][0]["network"], "eip155:43113");
        assert_eq!(body["kinds"][0]["x402Version"], 2);

        let (status, health) = call(app(), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health, body);
    }

    #[tokio::test]
    async fn test_endpoint_descriptions() {
        let (status, body) = call(app(), Method::GET, "/settle", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["endpoint"], "/settle");
    }
}
