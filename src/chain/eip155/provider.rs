use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, Bytes, TxHash};
use alloy_provider::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, WalletFiller,
};
use alloy_provider::{Identity, PendingTransactionBuilder, Provider, ProviderBuilder, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{BlockId, TransactionRequest};
use alloy_signer::Signer;
use alloy_signer_local::{LocalSignerError, PrivateKeySigner};
use alloy_transport::layers::{FallbackLayer, ThrottleLayer};
use alloy_transport_http::Http;
use std::num::NonZeroUsize;
use std::time::Duration;
use tower::ServiceBuilder;
use tracing::Instrument;

use super::{
    ConnectionError, Eip155ChainConnection, Eip155ChainReference, MetaTransaction,
    TransactionOutcome,
};
use crate::chain::ChainId;
use crate::config::{NetworkConfig, RpcConfig};

/// Gas, blob gas and chain id fillers. The nonce is set explicitly per submission.
pub type InnerFiller = JoinFill<GasFiller, JoinFill<BlobGasFiller, ChainIdFiller>>;

/// The fully composed Ethereum provider type used for settlement.
pub type InnerProvider = FillProvider<
    JoinFill<JoinFill<Identity, InnerFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderInitError {
    #[error("No HTTP RPC endpoint configured for chain {0}")]
    NoRpc(ChainId),
    #[error("Invalid signer key: {0}")]
    Signer(#[from] LocalSignerError),
}

/// Alloy-backed [`Eip155ChainConnection`] holding a single signing key.
///
/// Reads the pending nonce from the node before every submission. Callers must not
/// submit concurrently; `DirectBroadcaster` holds a lock across send and receipt.
#[derive(Debug)]
pub struct Eip155ChainProvider {
    chain: Eip155ChainReference,
    eip1559: bool,
    receipt_timeout_secs: u64,
    signer_address: Address,
    inner: InnerProvider,
}

impl Eip155ChainProvider {
    /// Fallback over throttled HTTP transports. Non-HTTP URLs are skipped.
    pub fn rpc_client(chain_id: &ChainId, rpc: &[RpcConfig]) -> Result<RpcClient, ProviderInitError> {
        let transports = rpc
            .iter()
            .filter_map(|provider_config| {
                let scheme = provider_config.http.scheme();
                if scheme != "http" && scheme != "https" {
                    return None;
                }
                let rpc_url = provider_config.http.clone();
                tracing::info!(chain=%chain_id, rpc_url=%rpc_url, rate_limit=?provider_config.rate_limit, "Using HTTP transport");
                let rate_limit = provider_config.rate_limit.unwrap_or(u32::MAX);
                let service = ServiceBuilder::new()
                    .layer(ThrottleLayer::new(rate_limit))
                    .service(Http::new(rpc_url));
                Some(service)
            })
            .collect::<Vec<_>>();
        let active = NonZeroUsize::new(transports.len())
            .ok_or_else(|| ProviderInitError::NoRpc(chain_id.clone()))?;
        let fallback = ServiceBuilder::new()
            .layer(FallbackLayer::default().with_active_transport_count(active))
            .service(transports);
        Ok(RpcClient::new(fallback, false))
    }

    pub fn from_config(
        chain: Eip155ChainReference,
        config: &NetworkConfig,
        rpc: &[RpcConfig],
    ) -> Result<Self, ProviderInitError> {
        let signer = PrivateKeySigner::from_bytes(config.signer.as_b256())
            .map_err(LocalSignerError::from)?
            .with_chain_id(Some(chain.inner()));
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let chain_id = ChainId::from(chain);
        let client = Self::rpc_client(&chain_id, rpc)?;
        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(BlobGasFiller::default(), ChainIdFiller::default()),
        );
        let inner: InnerProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_client(client);

        tracing::info!(chain=%chain_id, signer=%signer_address, "Using EVM provider");

        Ok(Self {
            chain,
            eip1559: config.eip1559,
            receipt_timeout_secs: config.receipt_timeout_secs,
            signer_address,
            inner,
        })
    }
}

impl Eip155ChainConnection for Eip155ChainProvider {
    fn chain(&self) -> Eip155ChainReference {
        self.chain
    }

    fn signer_address(&self) -> Address {
        self.signer_address
    }

    async fn read_contract(&self, to: Address, calldata: Bytes) -> Result<Bytes, ConnectionError> {
        let request = TransactionRequest::default().with_to(to).with_input(calldata);
        let output = self.inner.call(request).await?;
        Ok(output)
    }

    /// Gas price is fetched explicitly on legacy networks and left to the filler on
    /// EIP-1559 ones. Gas limit is estimated against the pending block.
    async fn send_transaction(&self, tx: MetaTransaction) -> Result<TxHash, ConnectionError> {
        let nonce = self
            .inner
            .get_transaction_count(self.signer_address)
            .pending()
            .await?;
        let mut txr = TransactionRequest::default()
            .with_to(tx.to)
            .with_from(self.signer_address)
            .with_input(tx.calldata)
            .with_nonce(nonce);

        if !self.eip1559 {
            let gas: u128 = self
                .inner
                .get_gas_price()
                .instrument(tracing::info_span!("get_gas_price"))
                .await?;
            txr.set_gas_price(gas);
        }

        let gas_limit = self
            .inner
            .estimate_gas(txr.clone())
            .block(BlockId::pending())
            .await?;
        txr.set_gas_limit(gas_limit);

        let pending = self.inner.send_transaction(txr).await?;
        Ok(*pending.tx_hash())
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TransactionOutcome, ConnectionError> {
        let timeout = Duration::from_secs(self.receipt_timeout_secs);
        let receipt = PendingTransactionBuilder::new(self.inner.root().clone(), tx_hash)
            .with_timeout(Some(timeout))
            .get_receipt()
            .await?;
        Ok(TransactionOutcome {
            transaction_hash: receipt.transaction_hash,
            success: receipt.status(),
        })
    }
}
