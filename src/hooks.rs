//! Observation hooks run around `verify` and `settle`.
//!
//! Hooks observe; they never change an outcome. The facilitator logs a hook's
//! error at WARN and carries on with the result it already has.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::chain::Network;
use crate::proto::{SettleRequest, SettleResponse, VerifyRequest, VerifyResponse};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Webhook responded with status {0}")]
    Status(reqwest::StatusCode),
    #[error("{0}")]
    Custom(String),
}

/// Callbacks around facilitator operations. Every method defaults to a no-op.
#[async_trait]
pub trait FacilitatorHooks: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before_verify(&self, _request: &VerifyRequest) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_verify(
        &self,
        _request: &VerifyRequest,
        _response: &VerifyResponse,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn before_settle(&self, _request: &SettleRequest) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_settle(
        &self,
        _request: &SettleRequest,
        _response: &SettleResponse,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// An ordered list of hooks. Failures are logged and swallowed.
#[derive(Clone, Default)]
pub struct HookSet(Vec<Arc<dyn FacilitatorHooks>>);

impl HookSet {
    pub fn new(hooks: Vec<Arc<dyn FacilitatorHooks>>) -> Self {
        Self(hooks)
    }

    pub fn push<H: FacilitatorHooks + 'static>(&mut self, hook: H) {
        self.0.push(Arc::new(hook));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub async fn before_verify(&self, request: &VerifyRequest) {
        for hook in &self.0 {
            report(hook.name(), "before_verify", hook.before_verify(request).await);
        }
    }

    pub async fn after_verify(&self, request: &VerifyRequest, response: &VerifyResponse) {
        for hook in &self.0 {
            report(hook.name(), "after_verify", hook.after_verify(request, response).await);
        }
    }

    pub async fn before_settle(&self, request: &SettleRequest) {
        for hook in &self.0 {
            report(hook.name(), "before_settle", hook.before_settle(request).await);
        }
    }

    pub async fn after_settle(&self, request: &SettleRequest, response: &SettleResponse) {
        for hook in &self.0 {
            report(hook.name(), "after_settle", hook.after_settle(request, response).await);
        }
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|hook| hook.name()))
            .finish()
    }
}

fn report(hook: &'static str, stage: &'static str, result: Result<(), HookError>) {
    if let Err(error) = result {
        tracing::warn!(hook, stage, error = %error, "Facilitator hook failed");
    }
}

/// Logs every verify and settle outcome at INFO under the `x402_gate::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogHook;

#[async_trait]
impl FacilitatorHooks for AuditLogHook {
    fn name(&self) -> &'static str {
        "audit_log"
    }

    async fn after_verify(
        &self,
        request: &VerifyRequest,
        response: &VerifyResponse,
    ) -> Result<(), HookError> {
        tracing::info!(
            target: "x402_gate::audit",
            network = %request.payment_requirements.network,
            pay_to = %request.payment_requirements.pay_to,
            amount = %request.payment_requirements.amount,
            valid = response.is_valid(),
            payer = ?response.payer(),
            reason = response.invalid_reason(),
            "verify"
        );
        Ok(())
    }

    async fn after_settle(
        &self,
        request: &SettleRequest,
        response: &SettleResponse,
    ) -> Result<(), HookError> {
        tracing::info!(
            target: "x402_gate::audit",
            network = %response.network,
            pay_to = %request.payment_requirements.pay_to,
            amount = %request.payment_requirements.amount,
            success = response.success,
            payer = ?response.payer,
            transaction = response.transaction.as_deref(),
            reason = response.error_reason.as_deref(),
            "settle"
        );
        Ok(())
    }
}

/// Body POSTed by [`WebhookHook`] after each settlement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementWebhook {
    pub event: &'static str,
    pub success: bool,
    pub network: Network,
    pub amount: String,
    pub pay_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl SettlementWebhook {
    pub fn new(request: &SettleRequest, response: &SettleResponse) -> Self {
        Self {
            event: "settle",
            success: response.success,
            network: response.network.clone(),
            amount: request.payment_requirements.amount.to_string(),
            pay_to: request.payment_requirements.pay_to.to_string(),
            payer: response.payer.map(|payer| payer.to_string()),
            transaction: response.transaction.clone(),
            error_reason: response.error_reason.clone(),
        }
    }
}

/// POSTs settlement outcomes as JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookHook {
    client: Client,
    url: Url,
    timeout: Duration,
}

impl WebhookHook {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(url: Url) -> Self {
        if url.scheme() != "https" {
            tracing::warn!(url = %url, "Webhook URL does not use HTTPS");
        }
        Self {
            client: Client::new(),
            url,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FacilitatorHooks for WebhookHook {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn after_settle(
        &self,
        request: &SettleRequest,
        response: &SettleResponse,
    ) -> Result<(), HookError> {
        let body = SettlementWebhook::new(request, response);
        let http_response = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        let status = http_response.status();
        if !status.is_success() {
            return Err(HookError::Status(status));
        }
        tracing::debug!(url = %self.url, %status, "Webhook delivered");
        Ok(())
    }
}
