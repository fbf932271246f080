use std::{collections::HashSet, fmt::Display, str::FromStr};

use blake2::{Blake2b512, Digest};
use chrono::{DateTime, Utc};
use jobsync_common::{Amount, Secret};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

//--------------------------------------        OrderId        ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl FromStr for OrderId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl OrderId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

//--------------------------------------   OrderStatusType     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatusType {
    /// The job has been published and nobody has taken it yet.
    Pending,
    /// A partner has accepted the job.
    Assigned,
    /// Work on the job has started.
    InProgress,
    /// The job is finished.
    Completed,
    /// The job was withdrawn by the customer or an admin.
    Cancelled,
}

impl OrderStatusType {
    /// Terminal orders never change status again and are candidates for local cache cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl Display for OrderStatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatusType::Pending => write!(f, "pending"),
            OrderStatusType::Assigned => write!(f, "assigned"),
            OrderStatusType::InProgress => write!(f, "in_progress"),
            OrderStatusType::Completed => write!(f, "completed"),
            OrderStatusType::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Invalid order status: {0}")]
pub struct ConversionError(String);

impl FromStr for OrderStatusType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            s => Err(ConversionError(s.to_string())),
        }
    }
}

//--------------------------------------        Order          ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub status: OrderStatusType,
    pub created_at: DateTime<Utc>,
    pub amount: Amount,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub service_type: String,
}

impl Order {
    pub fn new<I: Into<OrderId>>(id: I, status: OrderStatusType, created_at: DateTime<Utc>, amount: Amount) -> Self {
        Self {
            id: id.into(),
            status,
            created_at,
            amount,
            customer_name: String::default(),
            location: String::default(),
            service_type: String::default(),
        }
    }

    pub fn with_customer<S: Into<String>>(mut self, customer_name: S) -> Self {
        self.customer_name = customer_name.into();
        self
    }

    pub fn with_location<S: Into<String>>(mut self, location: S) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_service_type<S: Into<String>>(mut self, service_type: S) -> Self {
        self.service_type = service_type.into();
        self
    }

    /// True if any field the synchronization logic tracks (status, amount) differs. Display metadata is ignored.
    pub fn mutable_fields_differ(&self, other: &Order) -> bool {
        self.status != other.status || self.amount != other.amount
    }
}

//--------------------------------------       OrderSet        ---------------------------------------------------------
/// The orders currently believed correct for a subject, in the order the source provided them.
///
/// An `OrderSet` never holds two orders with the same id: when the source sends duplicates, the first occurrence
/// wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OrderSet(Vec<Order>);

impl OrderSet {
    pub fn new(orders: Vec<Order>) -> Self {
        let mut seen = HashSet::with_capacity(orders.len());
        let total = orders.len();
        let orders = orders.into_iter().filter(|o| seen.insert(o.id.clone())).collect::<Vec<_>>();
        if orders.len() != total {
            warn!("📦️ Dropped {} duplicate order(s) from the order set", total - orders.len());
        }
        Self(orders)
    }

    pub fn orders(&self) -> &[Order] {
        &self.0
    }

    pub fn get(&self, id: &OrderId) -> Option<&Order> {
        self.0.iter().find(|o| &o.id == id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Order> {
        self.0.iter()
    }

    pub fn ids(&self) -> Vec<OrderId> {
        self.0.iter().map(|o| o.id.clone()).collect()
    }

    /// Replaces the order with the same id in place. An unknown order is placed at the front, since sources list
    /// newest first.
    pub(crate) fn upsert(&mut self, order: Order) {
        match self.0.iter_mut().find(|o| o.id == order.id) {
            Some(existing) => *existing = order,
            None => self.0.insert(0, order),
        }
    }

    pub(crate) fn retain<F: FnMut(&Order) -> bool>(&mut self, f: F) {
        self.0.retain(f)
    }
}

impl From<Vec<Order>> for OrderSet {
    fn from(orders: Vec<Order>) -> Self {
        Self::new(orders)
    }
}

impl<'de> Deserialize<'de> for OrderSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Order>::deserialize(deserializer).map(Self::new)
    }
}

impl<'a> IntoIterator for &'a OrderSet {
    type IntoIter = std::slice::Iter<'a, Order>;
    type Item = &'a Order;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

//--------------------------------------      SubjectInfo      ---------------------------------------------------------
/// The partner or admin whose view of orders is being synchronized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub service_category: String,
}

//--------------------------------------     SubjectToken      ---------------------------------------------------------
/// The credential that resolves to exactly one subject on the remote order source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SubjectToken(Secret<String>);

impl SubjectToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(Secret::new(token.into()))
    }

    pub fn reveal(&self) -> &str {
        self.0.reveal()
    }

    /// A short, stable digest of the token. Contexts compare fingerprints to tell whether they act for the same
    /// subject without writing the token itself to shared storage.
    pub fn fingerprint(&self) -> String {
        let hash = Blake2b512::digest(self.reveal().as_bytes());
        hash[..12].iter().map(|b| format!("{b:02x}")).collect()
    }
}

//--------------------------------------     FetchedOrders     ---------------------------------------------------------
/// The answer of the remote order source to a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedOrders {
    pub orders: OrderSet,
    pub subject: SubjectInfo,
    pub total: u64,
}

impl FetchedOrders {
    pub fn new(orders: Vec<Order>, subject: SubjectInfo) -> Self {
        let orders = OrderSet::new(orders);
        let total = orders.len() as u64;
        Self { orders, subject, total }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = total;
        self
    }
}

//--------------------------------------   UpstreamSyncReport  ---------------------------------------------------------
/// Result of a bulk refresh from the system of record into the order source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSyncReport {
    pub created: u64,
    pub updated: u64,
    pub errors: u64,
}

impl UpstreamSyncReport {
    pub fn has_changes(&self) -> bool {
        self.created > 0 || self.updated > 0
    }
}

impl Display for UpstreamSyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} created, {} updated, {} errors", self.created, self.updated, self.errors)
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    fn order(id: &str, status: OrderStatusType) -> Order {
        Order::new(id, status, Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(), Amount::from_units(50))
    }

    #[test]
    fn order_set_drops_duplicate_ids() {
        let set = OrderSet::new(vec![
            order("1", OrderStatusType::Pending),
            order("2", OrderStatusType::Pending),
            order("1", OrderStatusType::Completed),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(&"1".into()).unwrap().status, OrderStatusType::Pending);
    }

    #[test]
    fn metadata_does_not_count_as_a_change() {
        let a = order("1", OrderStatusType::Pending);
        let b = a.clone().with_customer("Alice").with_location("Porto");
        assert!(!a.mutable_fields_differ(&b));
        let mut c = a.clone();
        c.amount = Amount::from_units(51);
        assert!(a.mutable_fields_differ(&c));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in ["pending", "assigned", "in_progress", "completed", "cancelled"] {
            let status = s.parse::<OrderStatusType>().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("paid".parse::<OrderStatusType>().is_err());
        let json = serde_json::to_string(&OrderStatusType::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn subject_token_is_not_printed() {
        let token = SubjectToken::new("very-secret");
        assert_eq!(format!("{token:?}"), "SubjectToken(****)");
        assert_eq!(token.reveal(), "very-secret");
    }

    #[test]
    fn fingerprints_differ_per_token() {
        let a = SubjectToken::new("token-a");
        assert_eq!(a.fingerprint(), SubjectToken::new("token-a").fingerprint());
        assert_ne!(a.fingerprint(), SubjectToken::new("token-b").fingerprint());
        assert_eq!(a.fingerprint().len(), 24);
        assert!(!a.fingerprint().contains("token"));
    }

    #[test]
    fn upstream_reports_with_huge_counts_still_have_changes() {
        let report = UpstreamSyncReport { created: u64::MAX, updated: u64::MAX, errors: 0 };
        assert!(report.has_changes());
        assert!(!UpstreamSyncReport { errors: 3, ..Default::default() }.has_changes());
    }
}
