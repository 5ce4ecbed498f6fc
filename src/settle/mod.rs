//! Settlement strategies.
//!
//! The strategy is chosen once at startup and never negotiated per request:
//! - [`DirectBroadcaster`] submits `transferWithAuthorization` from its own key
//! - [`DelegatingDispatcher`] relays to a remote facilitator's `/settle`
//!
//! Both resolve to a [`SettleResponse`]; failures are classified through
//! [`ErrorClassifier`](crate::error_class::ErrorClassifier) so callers see one taxonomy.
//! Settlement is never retried.

mod delegate;
mod direct;

pub use delegate::*;
pub use direct::*;

use std::sync::Arc;

use crate::chain::eip155::Eip155ChainConnection;
use crate::proto::{PaymentPayload, PaymentRequirements, SettleResponse};

pub trait SettlementDispatcher {
    fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> impl Future<Output = SettleResponse> + Send;
}

impl<T: SettlementDispatcher + Send + Sync> SettlementDispatcher for Arc<T> {
    fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> impl Future<Output = SettleResponse> + Send {
        self.as_ref().settle(payload, requirements)
    }
}

/// The settlement strategy selected from configuration.
#[derive(Debug)]
pub enum Dispatcher<C> {
    Direct(Arc<DirectBroadcaster<C>>),
    Delegate(DelegatingDispatcher),
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        match self {
            Dispatcher::Direct(direct) => Dispatcher::Direct(direct.clone()),
            Dispatcher::Delegate(delegate) => Dispatcher::Delegate(delegate.clone()),
        }
    }
}

impl<C> SettlementDispatcher for Dispatcher<C>
where
    C: Eip155ChainConnection + Send + Sync,
{
    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> SettleResponse {
        match self {
            Dispatcher::Direct(direct) => direct.settle(payload, requirements).await,
            Dispatcher::Delegate(delegate) => delegate.settle(payload, requirements).await,
        }
    }
}
