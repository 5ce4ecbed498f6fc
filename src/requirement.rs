//! Building payment requirements and 402 challenges.
//!
//! A [`PaymentOffer`] is what an operator configures for a route: a price, a network and
//! a recipient. [`RequirementBuilder::build`] resolves the network through the
//! [`NetworkRegistry`] and produces the immutable [`PaymentRequirements`] sent to payers.
//! Build requirements once at startup: an unknown network is a configuration error.

use alloy_primitives::Address;
use std::sync::Arc;

use crate::chain::Network;
use crate::networks::{NetworkRegistry, NetworkRegistryError, TokenEip712};
use crate::proto::{
    ExactScheme, PaymentRequired, PaymentRequirements, PaymentRequirementsExtra, ResourceInfo,
    TokenAmount, X402Version2,
};
use crate::util::money_amount::{MoneyAmount, MoneyAmountParseError};

/// Authorization validity granted to payers unless configured otherwise.
pub const DEFAULT_MAX_TIMEOUT_SECONDS: u64 = 600;

/// Price and destination of a payment, before network resolution.
#[derive(Debug, Clone)]
pub struct PaymentOffer {
    pub price: MoneyAmount,
    pub network: Network,
    pub pay_to: Address,
    /// Overrides the registry's asset contract.
    pub asset: Option<Address>,
    /// Overrides the registry's EIP-712 domain name and version.
    pub eip712: Option<TokenEip712>,
    pub max_timeout_seconds: Option<u64>,
}

impl PaymentOffer {
    pub fn new(price: MoneyAmount, network: Network, pay_to: Address) -> Self {
        Self {
            price,
            network,
            pay_to,
            asset: None,
            eip712: None,
            max_timeout_seconds: None,
        }
    }

    pub fn with_asset(mut self, asset: Address, eip712: Option<TokenEip712>) -> Self {
        self.asset = Some(asset);
        self.eip712 = eip712;
        self
    }

    pub fn with_max_timeout_seconds(mut self, seconds: u64) -> Self {
        self.max_timeout_seconds = Some(seconds);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequirementError {
    #[error(transparent)]
    Network(#[from] NetworkRegistryError),
    #[error("Invalid price: {0}")]
    Price(#[from] MoneyAmountParseError),
}

#[derive(Debug, Clone)]
pub struct RequirementBuilder {
    registry: Arc<NetworkRegistry>,
}

impl RequirementBuilder {
    pub fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self { registry }
    }

    pub fn build(&self, offer: &PaymentOffer) -> Result<PaymentRequirements, RequirementError> {
        let info = self.registry.resolve(&offer.network)?;
        let amount = offer.price.to_atomic(u32::from(info.decimals))?;
        let eip712 = offer.eip712.as_ref().unwrap_or(&info.eip712);
        Ok(PaymentRequirements {
            scheme: ExactScheme,
            network: offer.network.clone(),
            asset: offer.asset.unwrap_or(info.asset),
            pay_to: offer.pay_to,
            amount: TokenAmount(amount),
            max_timeout_seconds: offer
                .max_timeout_seconds
                .unwrap_or(DEFAULT_MAX_TIMEOUT_SECONDS),
            extra: PaymentRequirementsExtra {
                name: eip712.name.clone(),
                version: eip712.version.clone(),
            },
        })
    }

    /// The 402 body offering `accepts` for `resource`.
    pub fn challenge<E: Into<String>>(
        accepts: Vec<PaymentRequirements>,
        resource: ResourceInfo,
        error: E,
    ) -> PaymentRequired {
        PaymentRequired {
            x402_version: X402Version2,
            accepts,
            error: error.into(),
            resource,
        }
    }
}
