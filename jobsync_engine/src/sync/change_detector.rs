use std::collections::{HashMap, HashSet};

use crate::order_types::{Order, OrderId, OrderSet};

/// The structural difference between two snapshots of an order set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderDiff {
    /// Orders whose id was not in the previous set, in the order of the new set.
    pub added: Vec<Order>,
    /// Ids of orders that disappeared, in the order of the previous set.
    pub removed: Vec<OrderId>,
    /// Orders present in both sets whose status or amount differ. Holds the new version.
    pub changed: Vec<Order>,
}

impl OrderDiff {
    pub fn new_count(&self) -> usize {
        self.added.len()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub struct ChangeDetector;

impl ChangeDetector {
    /// Classifies every order of `next` against `previous`.
    ///
    /// The comparison is order-blind: moving an unchanged order to another position is not a change.
    pub fn diff(previous: &OrderSet, next: &OrderSet) -> OrderDiff {
        let index = previous.iter().map(|o| (&o.id, o)).collect::<HashMap<_, _>>();
        let mut diff = OrderDiff::default();
        for order in next {
            match index.get(&order.id) {
                None => diff.added.push(order.clone()),
                Some(old) if old.mutable_fields_differ(order) => diff.changed.push(order.clone()),
                Some(_) => {},
            }
        }
        let next_ids = next.iter().map(|o| &o.id).collect::<HashSet<_>>();
        diff.removed = previous.iter().filter(|o| !next_ids.contains(&o.id)).map(|o| o.id.clone()).collect();
        diff
    }
}
