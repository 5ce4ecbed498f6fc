use alloy_primitives::{Address, U256};
use alloy_sol_types::SolCall;
use tokio::sync::Mutex;
use tracing::instrument;

use super::SettlementDispatcher;
use crate::chain::Network;
use crate::chain::eip155::{
    ConnectionError, Eip155ChainConnection, IEIP3009, MetaTransaction, split_signature,
};
use crate::error_class::{ErrorClassifier, ErrorKind};
use crate::networks::NetworkInfo;
use crate::proto::{PaymentPayload, PaymentRequirements, SettleResponse};
use crate::verify::ExactEvmPayment;

/// Reason reported when the transfer was included with receipt status 0.
pub const TRANSACTION_REVERTED: &str = "Transaction reverted";

/// Broadcasts `transferWithAuthorization` from a single facilitator key on one network.
///
/// Submissions from the key are serialized: the lock is held from nonce assignment
/// until the receipt arrives, so two settlements never race for the same nonce.
/// The lock does not cover the payload checks or the balance preflight.
#[derive(Debug)]
pub struct DirectBroadcaster<C> {
    connection: C,
    info: NetworkInfo,
    submission: Mutex<()>,
}

impl<C: Eip155ChainConnection> DirectBroadcaster<C> {
    pub fn new(connection: C, info: NetworkInfo) -> Self {
        Self {
            connection,
            info,
            submission: Mutex::new(()),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn info(&self) -> &NetworkInfo {
        &self.info
    }

    pub fn signer_address(&self) -> Address {
        self.connection.signer_address()
    }

    /// Token balance of `owner`.
    pub async fn balance_of(&self, asset: Address, owner: Address) -> Result<U256, ConnectionError> {
        let calldata = IEIP3009::balanceOfCall { account: owner }.abi_encode();
        let output = self.connection.read_contract(asset, calldata.into()).await?;
        IEIP3009::balanceOfCall::abi_decode_returns(&output)
            .map_err(|e| ConnectionError::Custom(format!("Failed to decode balanceOf: {e}")))
    }

    fn classified_failure<E: std::error::Error>(
        network: &Network,
        payer: Address,
        error: &E,
    ) -> SettleResponse {
        let classified = ErrorClassifier::classify_error(error);
        tracing::warn!(kind = %classified.kind, error = %classified.message, "Settlement failed");
        SettleResponse::failed(network.clone(), classified.kind.code())
            .with_message(classified.message)
            .with_payer(Some(payer))
    }
}

impl<C> SettlementDispatcher for DirectBroadcaster<C>
where
    C: Eip155ChainConnection + Send + Sync,
{
    #[instrument(skip_all, fields(network = %requirements.network, tx = tracing::field::Empty))]
    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> SettleResponse {
        let network = &requirements.network;
        let payment = match ExactEvmPayment::try_from(&payload.payload) {
            Ok(payment) => payment,
            Err(error) => return SettleResponse::failed(network.clone(), error.to_string()),
        };
        let payer = payment.from;

        match self.balance_of(requirements.asset, payer).await {
            Ok(balance) if balance < payment.value => {
                let message = format!("payer balance {balance} is below {}", payment.value);
                tracing::info!(%payer, %balance, value = %payment.value, "Insufficient payer balance");
                return SettleResponse::failed(network.clone(), ErrorKind::InsufficientFunds.code())
                    .with_message(message)
                    .with_payer(Some(payer));
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(%payer, error = %error, "Balance preflight failed, broadcasting anyway");
            }
        }

        let (v, r, s) = split_signature(&payment.signature);
        let transfer = payment.transfer();
        let calldata = IEIP3009::transferWithAuthorizationCall {
            from: transfer.from,
            to: transfer.to,
            value: transfer.value,
            validAfter: transfer.validAfter,
            validBefore: transfer.validBefore,
            nonce: transfer.nonce,
            v,
            r,
            s,
        }
        .abi_encode();
        let tx = MetaTransaction {
            to: requirements.asset,
            calldata: calldata.into(),
        };

        let outcome = {
            let _submission = self.submission.lock().await;
            let tx_hash = match self.connection.send_transaction(tx).await {
                Ok(tx_hash) => tx_hash,
                Err(error) => return Self::classified_failure(network, payer, &error),
            };
            tracing::Span::current().record("tx", tracing::field::display(tx_hash));
            match self.connection.wait_for_receipt(tx_hash).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    return Self::classified_failure(network, payer, &error)
                        .with_transaction(Some(tx_hash.to_string()));
                }
            }
        };

        let transaction = outcome.transaction_hash.to_string();
        if outcome.success {
            tracing::info!(
                %payer,
                explorer = %self.info.explorer_tx_url(&transaction),
                "Settlement included"
            );
            SettleResponse::settled(network.clone(), payer, transaction)
        } else {
            tracing::warn!(%payer, transaction = %transaction, "Settlement reverted");
            SettleResponse::failed(network.clone(), TRANSACTION_REVERTED)
                .with_payer(Some(payer))
                .with_transaction(Some(transaction))
        }
    }
}
