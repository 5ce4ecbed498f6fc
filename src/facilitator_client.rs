//! HTTP client for a remote x402 facilitator.
//!
//! [`FacilitatorClient`] implements [`Facilitator`] by calling the peer's `/verify`,
//! `/settle` and `/supported` endpoints. It is what the paygate uses for remote
//! verification and what [`DelegatingDispatcher`](crate::settle::DelegatingDispatcher)
//! uses for settlement. `/supported` answers are kept for a TTL.
//!
//! ```rust
//! use x402_gate::facilitator_client::FacilitatorClient;
//!
//! let facilitator = FacilitatorClient::try_from("https://facilitator.example.com").unwrap();
//! ```

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{Span, field, instrument};
use url::Url;

use crate::facilitator::Facilitator;
use crate::proto::{SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse};

/// Remote facilitator endpoints, relative to the base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Verify,
    Settle,
    Supported,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Verify => "verify",
            Endpoint::Settle => "settle",
            Endpoint::Supported => "supported",
        }
    }

    pub fn method(self) -> Method {
        match self {
            Endpoint::Verify | Endpoint::Settle => Method::POST,
            Endpoint::Supported => Method::GET,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} /{}", self.method(), self.path())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("Invalid facilitator URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{endpoint} failed: {source}")]
    Http {
        endpoint: Endpoint,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned an unreadable body: {source}")]
    Decode {
        endpoint: Endpoint,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}: {body}")]
    HttpStatus {
        endpoint: Endpoint,
        status: StatusCode,
        body: String,
    },
}

/// Last `/supported` answer and when it was fetched.
///
/// A clone starts empty, so clients built from one another never share an entry.
#[derive(Debug)]
struct SupportedCache {
    ttl: Duration,
    entry: RwLock<Option<(Instant, SupportedResponse)>>,
}

impl SupportedCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    async fn fresh(&self) -> Option<SupportedResponse> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|(fetched_at, _)| fetched_at.elapsed() < self.ttl)
            .map(|(_, response)| response.clone())
    }

    async fn store(&self, response: SupportedResponse) {
        if self.ttl.is_zero() {
            return;
        }
        *self.entry.write().await = Some((Instant::now(), response));
    }
}

impl Clone for SupportedCache {
    fn clone(&self) -> Self {
        Self::new(self.ttl)
    }
}

/// Client for a remote x402 facilitator.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    base_url: Url,
    http: Client,
    /// Extra headers sent with every request, e.g. an API key.
    headers: HeaderMap,
    timeout: Option<Duration>,
    supported: SupportedCache,
}

impl FacilitatorClient {
    pub const DEFAULT_SUPPORTED_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

    /// `base_url` must be able to act as a base; endpoints are joined onto it.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorClientError> {
        if base_url.cannot_be_a_base() {
            return Err(FacilitatorClientError::InvalidUrl {
                url: base_url.to_string(),
                source: url::ParseError::RelativeUrlWithCannotBeABaseBase,
            });
        }
        Ok(Self {
            base_url,
            http: Client::new(),
            headers: HeaderMap::new(),
            timeout: None,
            supported: SupportedCache::new(Self::DEFAULT_SUPPORTED_CACHE_TTL),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn url(&self, endpoint: Endpoint) -> Result<Url, FacilitatorClientError> {
        self.base_url
            .join(endpoint.path())
            .map_err(|source| FacilitatorClientError::InvalidUrl {
                url: format!("{}{}", self.base_url, endpoint.path()),
                source,
            })
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_supported_cache_ttl(mut self, ttl: Duration) -> Self {
        self.supported = SupportedCache::new(ttl);
        self
    }

    pub fn without_supported_cache(self) -> Self {
        self.with_supported_cache_ttl(Duration::ZERO)
    }

    #[instrument(
        name = "x402.facilitator_client.verify",
        skip_all,
        fields(otel.status_code = field::Empty, error.message = field::Empty)
    )]
    pub async fn verify(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        self.call(Endpoint::Verify, Some(request)).await
    }

    #[instrument(
        name = "x402.facilitator_client.settle",
        skip_all,
        fields(otel.status_code = field::Empty, error.message = field::Empty)
    )]
    pub async fn settle(
        &self,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorClientError> {
        self.call(Endpoint::Settle, Some(request)).await
    }

    /// Answers from the cache while it is fresh.
    #[instrument(
        name = "x402.facilitator_client.supported",
        skip_all,
        fields(otel.status_code = field::Empty, error.message = field::Empty)
    )]
    pub async fn supported(&self) -> Result<SupportedResponse, FacilitatorClientError> {
        if let Some(response) = self.supported.fresh().await {
            return Ok(response);
        }
        tracing::debug!("supported cache miss");
        let response: SupportedResponse = self.call(Endpoint::Supported, None::<&()>).await?;
        self.supported.store(response.clone()).await;
        Ok(response)
    }

    /// A 200 decodes into `R`; any other status is returned with its body.
    async fn call<B, R>(&self, endpoint: Endpoint, body: Option<&B>) -> Result<R, FacilitatorClientError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self
            .http
            .request(endpoint.method(), self.url(endpoint)?)
            .headers(self.headers.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let result = match request.send().await {
            Err(source) => Err(FacilitatorClientError::Http { endpoint, source }),
            Ok(response) if response.status() == StatusCode::OK => response
                .json::<R>()
                .await
                .map_err(|source| FacilitatorClientError::Decode { endpoint, source }),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Err(FacilitatorClientError::HttpStatus {
                    endpoint,
                    status,
                    body,
                })
            }
        };
        record_outcome(&result);
        result
    }
}

impl Facilitator for FacilitatorClient {
    type Error = FacilitatorClientError;

    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, Self::Error> {
        FacilitatorClient::verify(self, request).await
    }

    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, Self::Error> {
        FacilitatorClient::settle(self, request).await
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        FacilitatorClient::supported(self).await
    }
}

/// Accepts the base URL with or without trailing slashes; endpoints always land beneath it.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = format!("{}/", value.trim_end_matches('/'));
        let url = Url::parse(&normalized).map_err(|source| FacilitatorClientError::InvalidUrl {
            url: value.to_string(),
            source,
        })?;
        FacilitatorClient::try_new(url)
    }
}

impl TryFrom<String> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FacilitatorClient::try_from(value.as_str())
    }
}

fn record_outcome<R>(result: &Result<R, FacilitatorClientError>) {
    let span = Span::current();
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(err) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", field::display(err));
            tracing::warn!(error = %err, "Facilitator request failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Network;
    use crate::proto::SupportedPaymentKind;
    use crate::test_support::*;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_supported_response() -> SupportedResponse {
        SupportedResponse {
            kinds: vec![SupportedPaymentKind {
                x402_version: 2,
                scheme: "exact".to_string(),
                network: "eip155:43113".to_string(),
            }],
            signers: HashMap::new(),
        }
    }

    fn verify_request() -> VerifyRequest {
        let requirements = fuji_requirements();
        VerifyRequest::new(
            signed_payload(&requirements, AuthorizationParams::default()),
            requirements,
        )
    }

    #[test]
    fn test_try_from_normalizes_trailing_slash() {
        let client = FacilitatorClient::try_from("https://facilitator.example.com/x402///").unwrap();
        assert_eq!(
            client.url(Endpoint::Verify).unwrap().as_str(),
            "https://facilitator.example.com/x402/verify"
        );
        assert_eq!(
            client.url(Endpoint::Supported).unwrap().as_str(),
            "https://facilitator.example.com/x402/supported"
        );
    }

    #[tokio::test]
    async fn test_verify_posts_request() {
        let mock_server = MockServer::start().await;
        let payer = payer().address();
        Mock::given(method("POST"))
            .and(path("/verify"))
            .and(body_partial_json(json!({"x402Version": 2})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"isValid": true, "payer": payer.to_string()})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_from(mock_server.uri()).unwrap();
        let response = client.verify(&verify_request()).await.unwrap();
        assert_eq!(response, VerifyResponse::valid(payer));
    }

    #[tokio::test]
    async fn test_settle_relays_failure_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "errorReason": "NONCE_CONFLICT",
                "network": "eip155:43113"
            })))
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_from(mock_server.uri()).unwrap();
        let response = client.settle(&verify_request()).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error_reason.as_deref(), Some("NONCE_CONFLICT"));
        assert_eq!(response.network, "eip155:43113".parse::<Network>().unwrap());
    }

    #[tokio::test]
    async fn test_non_200_is_http_status_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_from(mock_server.uri()).unwrap();
        let error = client.settle(&verify_request()).await.unwrap_err();
        match error {
            FacilitatorClientError::HttpStatus { status, body, .. } => {
                assert_eq!(status, StatusCode::BAD_GATEWAY);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_supported_cache_caches_response() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/supported"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(&create_test_supported_response()),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_new(mock_server.uri().parse().unwrap()).unwrap();
        let result1 = client.supported().await.unwrap();
        let result2 = client.supported().await.unwrap();
        assert_eq!(result1.kinds, result2.kinds);
    }

    #[tokio::test]
    async fn test_supported_cache_disabled() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/supported"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(&create_test_supported_response()),
            )
            .expect(2)
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_new(mock_server.uri().parse().unwrap())
            .unwrap()
            .without_supported_cache();
        client.supported().await.unwrap();
        client.supported().await.unwrap();
    }

    #[tokio::test]
    async fn test_supported_cache_clones_independently() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/supported"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(&create_test_supported_response()),
            )
            .expect(2)
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_new(mock_server.uri().parse().unwrap()).unwrap();
        let client2 = client.clone();
        client.supported().await.unwrap();
        client2.supported().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_facilitator_is_http_error() {
        let client = FacilitatorClient::try_from("http://127.0.0.1:9")
            .unwrap()
            .with_timeout(Duration::from_secs(2));
        let error = client.verify(&verify_request()).await.unwrap_err();
        assert!(matches!(error, FacilitatorClientError::Http { .. }));
    }
}
