//! [`RemoteOrderSource`] over the order service's REST API.
//!
//! | Route                          | Use                          |
//! |--------------------------------|------------------------------|
//! | `GET  {api}/orders`            | the subject's orders         |
//! | `POST {api}/orders/{id}/accept`| assign an order to the caller|
//! | `POST {api}/admin/sync-upstream`| bulk refresh from upstream  |
//!
//! Every request carries the subject token as a bearer token.
use async_trait::async_trait;
use jobsync_engine::{
    order_types::{FetchedOrders, Order, OrderId, OrderStatusType, SubjectToken, UpstreamSyncReport},
    traits::{AcceptOutcome, OrderSourceError},
    RemoteOrderSource,
};
use log::*;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client,
    Response,
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize};
use url::Url;

use crate::errors::AgentError;

pub struct HttpOrderSource {
    client: Client,
    api_url: Url,
    /// Used for the admin route, which is not tied to a fetch.
    token: Option<SubjectToken>,
}

/// Body of a 409 from the accept route.
#[derive(Debug, Clone, Deserialize)]
pub struct AcceptConflict {
    #[serde(default)]
    pub order: Option<Order>,
    #[serde(default)]
    pub assigned_to_caller: bool,
    #[serde(default)]
    pub error: String,
}

impl HttpOrderSource {
    pub fn new(api_url: Url, token: Option<SubjectToken>) -> Result<Self, AgentError> {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .user_agent("jobsync-agent")
            .default_headers(headers)
            .build()
            .map_err(|e| AgentError::InvalidConfiguration(format!("Could not create the HTTP client. {e}")))?;
        Ok(Self { client, api_url, token })
    }

    pub fn url(&self, path: &str) -> Result<Url, OrderSourceError> {
        self.api_url.join(path).map_err(|e| OrderSourceError::InvalidResponse(format!("Bad route {path}. {e}")))
    }

    async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, OrderSourceError> {
        res.json::<T>().await.map_err(|e| OrderSourceError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl RemoteOrderSource for HttpOrderSource {
    async fn fetch_orders(&self, token: &SubjectToken) -> Result<FetchedOrders, OrderSourceError> {
        let url = self.url("orders")?;
        trace!("🔄️ GET {url}");
        let res = self.client.get(url).bearer_auth(token.reveal()).send().await.map_err(transport_error)?;
        let status = res.status();
        if !status.is_success() {
            let reason = res.text().await.unwrap_or_default();
            return Err(status_error(status, reason));
        }
        let fetched = Self::decode::<FetchedOrders>(res).await?;
        debug!("🔄️ Order service returned {} orders", fetched.orders.len());
        Ok(fetched)
    }

    async fn accept_order(&self, token: &SubjectToken, order_id: &OrderId) -> Result<AcceptOutcome, OrderSourceError> {
        let url = self.url(&format!("orders/{}/accept", order_id.as_str()))?;
        trace!("🔄️ POST {url}");
        let res = self.client.post(url).bearer_auth(token.reveal()).send().await.map_err(transport_error)?;
        let status = res.status();
        if status.is_success() {
            return Self::decode::<Order>(res).await.map(AcceptOutcome::Accepted);
        }
        if status == StatusCode::CONFLICT {
            let body = res.text().await.unwrap_or_default();
            return classify_conflict(order_id, &body);
        }
        let reason = res.text().await.unwrap_or_default();
        Err(status_error(status, reason))
    }

    async fn sync_from_upstream(&self) -> Result<UpstreamSyncReport, OrderSourceError> {
        let url = self.url("admin/sync-upstream")?;
        trace!("🔄️ POST {url}");
        let mut req = self.client.post(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.reveal());
        }
        let res = req.send().await.map_err(transport_error)?;
        let status = res.status();
        if !status.is_success() {
            let reason = res.text().await.unwrap_or_default();
            return Err(status_error(status, reason));
        }
        Self::decode::<UpstreamSyncReport>(res).await
    }
}

fn transport_error(e: reqwest::Error) -> OrderSourceError {
    OrderSourceError::Unavailable(e.to_string())
}

pub fn status_error(status: StatusCode, reason: String) -> OrderSourceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => OrderSourceError::Unauthorized,
        s if s.is_server_error() => OrderSourceError::Unavailable(format!("{s}. {reason}")),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            OrderSourceError::Unavailable(format!("{status}. {reason}"))
        },
        s => OrderSourceError::Rejected { status: s.as_u16(), reason },
    }
}

/// A conflict means success if the order already belongs to the caller.
pub fn classify_conflict(order_id: &OrderId, body: &str) -> Result<AcceptOutcome, OrderSourceError> {
    let conflict = serde_json::from_str::<AcceptConflict>(body).map_err(|e| {
        OrderSourceError::InvalidResponse(format!("Unreadable conflict response for order {order_id}. {e}"))
    })?;
    match conflict.order {
        Some(order) if conflict.assigned_to_caller && order.status == OrderStatusType::Assigned => {
            debug!("🔄️ Order {order_id} was already accepted by this subject");
            Ok(AcceptOutcome::AlreadyAccepted(order))
        },
        _ => {
            let reason = if conflict.error.is_empty() {
                format!("Order {order_id} has been taken by someone else")
            } else {
                conflict.error
            };
            Err(OrderSourceError::Rejected { status: StatusCode::CONFLICT.as_u16(), reason })
        },
    }
}
