use async_trait::async_trait;
use thiserror::Error;

use crate::order_types::{FetchedOrders, Order, OrderId, SubjectToken, UpstreamSyncReport};

/// The remote service that owns orders for a subject.
///
/// Implementations must make [`fetch_orders`](Self::fetch_orders) idempotent and free of side effects, since the
/// engine calls it on a timer and whenever a consumer asks for a refresh.
#[cfg_attr(any(test, feature = "test_utils"), mockall::automock)]
#[async_trait]
pub trait RemoteOrderSource: Send + Sync {
    /// Fetches the current set of orders for the subject identified by `token`.
    async fn fetch_orders(&self, token: &SubjectToken) -> Result<FetchedOrders, OrderSourceError>;

    /// Asks the remote source to assign the order to the subject.
    ///
    /// If the order was already accepted by this subject, implementations return [`AcceptOutcome::AlreadyAccepted`]
    /// rather than an error. An order taken by someone else is an [`OrderSourceError::Rejected`].
    async fn accept_order(&self, token: &SubjectToken, order_id: &OrderId) -> Result<AcceptOutcome, OrderSourceError>;

    /// Triggers a bulk refresh from the upstream system of record into the order source.
    async fn sync_from_upstream(&self) -> Result<UpstreamSyncReport, OrderSourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted(Order),
    AlreadyAccepted(Order),
}

impl AcceptOutcome {
    pub fn into_order(self) -> Order {
        match self {
            Self::Accepted(o) | Self::AlreadyAccepted(o) => o,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderSourceError {
    #[error("The order source is unavailable. {0}")]
    Unavailable(String),
    #[error("The order source rejected the request ({status}). {reason}")]
    Rejected { status: u16, reason: String },
    #[error("The subject token was not accepted by the order source.")]
    Unauthorized,
    #[error("The order source sent a response that could not be understood. {0}")]
    InvalidResponse(String),
}
