//! The local [`Facilitator`]: verification with [`AuthorizationVerifier`] and settlement
//! through one [`DirectBroadcaster`] per configured network.
//!
//! Every settlement is re-verified first. Networks are fixed at startup: a payment for a
//! network without a broadcaster is rejected, never settled.

use alloy_primitives::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::chain::Network;
use crate::chain::eip155::Eip155ChainConnection;
use crate::chain::eip155::provider::{Eip155ChainProvider, ProviderInitError};
use crate::config::{Config, ConfigError, HooksConfig};
use crate::facilitator::Facilitator;
use crate::hooks::{AuditLogHook, HookSet, WebhookHook};
use crate::networks::{NetworkRegistry, NetworkRegistryError};
use crate::proto::{
    ExactScheme, PaymentVerificationError, SettleRequest, SettleResponse, SupportedPaymentKind,
    SupportedResponse, VerifyRequest, VerifyResponse,
};
use crate::settle::{DirectBroadcaster, SettlementDispatcher};
use crate::timestamp::{Clock, SystemClock};
use crate::verify::AuthorizationVerifier;

#[derive(Debug, thiserror::Error)]
pub enum FacilitatorLocalError {
    #[error(transparent)]
    Network(#[from] NetworkRegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to initialize provider for {network}: {source}")]
    Provider {
        network: Network,
        #[source]
        source: ProviderInitError,
    },
    #[error("Network {0} is configured more than once")]
    DuplicateNetwork(Network),
}

pub struct FacilitatorService<C> {
    verifier: AuthorizationVerifier,
    broadcasters: Vec<Arc<DirectBroadcaster<C>>>,
    clock: Arc<dyn Clock>,
    hooks: HookSet,
}

impl<C: Eip155ChainConnection> std::fmt::Debug for FacilitatorService<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorService")
            .field(
                "networks",
                &self.broadcasters.iter().map(|b| &b.info().name).collect::<Vec<_>>(),
            )
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl<C: Eip155ChainConnection> FacilitatorService<C> {
    /// Fails if two broadcasters serve the same chain.
    pub fn new(
        registry: Arc<NetworkRegistry>,
        broadcasters: Vec<Arc<DirectBroadcaster<C>>>,
    ) -> Result<Self, FacilitatorLocalError> {
        for (i, broadcaster) in broadcasters.iter().enumerate() {
            let chain_id = broadcaster.info().chain_id;
            if broadcasters[..i].iter().any(|b| b.info().chain_id == chain_id) {
                return Err(FacilitatorLocalError::DuplicateNetwork(
                    broadcaster.info().network(),
                ));
            }
        }
        Ok(Self {
            verifier: AuthorizationVerifier::new(registry),
            broadcasters,
            clock: Arc::new(SystemClock),
            hooks: HookSet::default(),
        })
    }

    pub fn with_clock<K: Clock + 'static>(mut self, clock: K) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn verifier(&self) -> &AuthorizationVerifier {
        &self.verifier
    }

    /// The broadcaster settling on `network`'s chain.
    pub fn broadcaster(&self, network: &Network) -> Option<&Arc<DirectBroadcaster<C>>> {
        let chain_id = self.verifier.registry().resolve(network).ok()?.chain_id;
        self.broadcasters
            .iter()
            .find(|broadcaster| broadcaster.info().chain_id == chain_id)
    }

    fn check(&self, request: &VerifyRequest) -> VerifyResponse {
        let network = &request.payment_requirements.network;
        if self.broadcaster(network).is_none() {
            let error = PaymentVerificationError::UnsupportedNetwork(network.to_string());
            return VerifyResponse::invalid(&error, None);
        }
        self.verifier.verify(
            &request.payment_payload,
            &request.payment_requirements,
            self.clock.now(),
        )
    }
}

impl FacilitatorService<Eip155ChainProvider> {
    /// Connects to every network in `config.networks()` and installs the configured hooks.
    pub fn from_config(
        config: &Config,
        registry: Arc<NetworkRegistry>,
    ) -> Result<Self, FacilitatorLocalError> {
        let mut broadcasters = Vec::with_capacity(config.networks().len());
        for (network, network_config) in config.networks().iter() {
            let info = registry.resolve(network)?;
            let rpc = network_config.rpc_or_default(info)?;
            let provider =
                Eip155ChainProvider::from_config(info.chain_reference(), network_config, &rpc)
                    .map_err(|source| FacilitatorLocalError::Provider {
                        network: network.clone(),
                        source,
                    })?;
            broadcasters.push(Arc::new(DirectBroadcaster::new(provider, info.clone())));
        }
        let service = Self::new(registry, broadcasters)?;
        Ok(service.with_hooks(hooks_from_config(config.hooks())))
    }
}

pub fn hooks_from_config(config: &HooksConfig) -> HookSet {
    let mut hooks = HookSet::default();
    if config.audit_log {
        hooks.push(AuditLogHook);
    }
    if let Some(url) = &config.webhook_url {
        hooks.push(
            WebhookHook::new(url.inner().clone())
                .with_timeout(Duration::from_secs(config.webhook_timeout_secs)),
        );
    }
    hooks
}

impl<C> Facilitator for FacilitatorService<C>
where
    C: Eip155ChainConnection + Send + Sync,
{
    type Error = FacilitatorLocalError;

    #[instrument(skip_all, fields(network = %request.payment_requirements.network))]
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, Self::Error> {
        self.hooks.before_verify(request).await;
        let response = self.check(request);
        self.hooks.after_verify(request, &response).await;
        Ok(response)
    }

    #[instrument(skip_all, fields(network = %request.payment_requirements.network))]
    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, Self::Error> {
        self.hooks.before_settle(request).await;
        let requirements = &request.payment_requirements;
        let verification = self.check(request);
        let response = match (&verification, self.broadcaster(&requirements.network)) {
            (VerifyResponse::Valid { .. }, Some(broadcaster)) => {
                broadcaster
                    .settle(&request.payment_payload, requirements)
                    .await
            }
            _ => {
                let reason = verification
                    .invalid_reason()
                    .unwrap_or("unsupported network")
                    .to_string();
                tracing::info!(reason = %reason, "Refusing to settle unverified payment");
                SettleResponse::failed(requirements.network.clone(), reason)
                    .with_payer(verification.payer())
            }
        };
        self.hooks.after_settle(request, &response).await;
        Ok(response)
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        let mut kinds = Vec::with_capacity(self.broadcasters.len());
        let mut signers: HashMap<String, Vec<String>> = HashMap::new();
        for broadcaster in &self.broadcasters {
            let chain_id = broadcaster.info().caip2().to_string();
            kinds.push(SupportedPaymentKind {
                x402_version: 2,
                scheme: ExactScheme.to_string(),
                network: chain_id.clone(),
            });
            let signer: Address = broadcaster.signer_address();
            signers.entry(chain_id).or_default().push(signer.to_string());
        }
        Ok(SupportedResponse { kinds, signers })
    }
}
