use std::{sync::Arc, time::Duration};

use cucumber::{gherkin::Step, given, then, when};
use jobsync_engine::{
    order_types::{Order, OrderId, OrderStatusType, UpstreamSyncReport},
    test_utils::prepare_env::order_aged,
    traits::OrderSourceError,
};

use crate::cucumber::SyncWorld;

fn orders_from_table(step: &Step) -> Vec<Order> {
    let table = step.table.as_ref().expect("Step needs a table of orders");
    table
        .rows
        .iter()
        .skip(1)
        .map(|row| {
            let status = row[1].parse::<OrderStatusType>().expect("Not a valid order status");
            let age_hours = row.get(2).map(|h| h.parse::<i64>().expect("Not a valid age")).unwrap_or(1);
            order_aged(&row[0], status, age_hours)
        })
        .collect()
}

fn describe(orders: &[Order]) -> String {
    orders.iter().map(|o| format!("{}:{}", o.id.as_str(), o.status)).collect::<Vec<_>>().join(",")
}

#[given("a subject with the orders")]
async fn subject_with_orders(world: &mut SyncWorld, step: &Step) {
    world.source().set_orders(orders_from_table(step));
}

#[when("the source now has the orders")]
async fn source_has_orders(world: &mut SyncWorld, step: &Step) {
    world.source().set_orders(orders_from_table(step));
}

#[given("the orders have been fetched")]
async fn initial_fetch(world: &mut SyncWorld) {
    refresh_orders(world).await;
    assert!(world.system().results.iter().all(|r| r.is_ok()), "The initial fetch failed");
}

#[when("I refresh the orders")]
async fn refresh(world: &mut SyncWorld) {
    refresh_orders(world).await;
}

async fn refresh_orders(world: &mut SyncWorld) {
    let result = world.engine().refresh().await;
    world.system().results.push(result);
}

#[given("an observer is subscribed")]
async fn observer_subscribed(world: &mut SyncWorld) {
    world.system().subscribe();
}

#[when("the source fails the next request")]
async fn source_fails(world: &mut SyncWorld) {
    world.source().fail_next(OrderSourceError::Unavailable("connection reset by peer".into()));
}

#[when("the source holds its responses")]
async fn source_holds(world: &mut SyncWorld) {
    world.source().hold_fetches();
}

#[when(expr = "{int} refreshes are requested at once")]
async fn concurrent_refreshes(world: &mut SyncWorld, count: usize) {
    let engine = world.engine();
    let handles = (0..count)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.refresh().await })
        })
        .collect::<Vec<_>>();
    world.system().in_flight.extend(handles);
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[when("the source releases its responses")]
async fn source_releases(world: &mut SyncWorld) {
    world.source().release_fetches();
    let handles = std::mem::take(&mut world.system().in_flight);
    for handle in handles {
        let result = handle.await.expect("Refresh task panicked");
        world.system().results.push(result);
    }
}

#[when(expr = "I accept order {word}")]
async fn accept(world: &mut SyncWorld, order_id: String) {
    let result = world.engine().accept_order(&OrderId::from(order_id)).await.map(|o| o.status);
    world.system().last_accept = Some(result);
}

#[when(expr = "the upstream sync reports {int} created and {int} updated orders")]
async fn upstream_reports(world: &mut SyncWorld, created: u64, updated: u64) {
    world.source().set_upstream_report(UpstreamSyncReport { created, updated, errors: 0 });
}

#[when("I request an upstream sync")]
async fn upstream_sync(world: &mut SyncWorld) {
    let result = world.engine().sync_from_upstream().await;
    world.system().results.push(result);
}

#[when("I dismiss the new orders notification")]
async fn dismiss(world: &mut SyncWorld) {
    world.engine().dismiss_new_orders_notification();
}

#[when("I clean up old orders")]
async fn cleanup(world: &mut SyncWorld) {
    world.engine().cleanup_old_orders();
}

#[then(expr = "the cached orders are {word}")]
async fn cached_orders(world: &mut SyncWorld, expected: String) {
    let state = world.engine().get_snapshot();
    assert_eq!(describe(state.orders.orders()), expected);
}

#[then(expr = "the source still has order {word} as {word}")]
async fn source_order(world: &mut SyncWorld, order_id: String, status: String) {
    let id = OrderId::from(order_id);
    let order = world.source().orders().into_iter().find(|o| o.id == id).expect("Order is not in the source");
    assert_eq!(order.status.to_string(), status);
}

#[then(expr = "there {word} {int} new order(s)")]
async fn new_orders(world: &mut SyncWorld, _verb: String, count: usize) {
    let state = world.engine().get_snapshot();
    assert!(state.has_new_orders, "The new orders flag is not set");
    assert_eq!(state.new_orders_count, count);
}

#[then("there are no new orders")]
async fn no_new_orders(world: &mut SyncWorld) {
    let state = world.engine().get_snapshot();
    assert!(!state.has_new_orders, "The new orders flag is still set");
    assert_eq!(state.new_orders_count, 0);
}

#[then("the state shows an error")]
async fn state_has_error(world: &mut SyncWorld) {
    let state = world.engine().get_snapshot();
    assert!(state.error.is_some(), "Expected an error in the sync state");
    assert!(!state.is_loading);
    assert!(matches!(world.system().results.last(), Some(Err(_))));
}

#[then("the state shows no error")]
async fn state_has_no_error(world: &mut SyncWorld) {
    let state = world.engine().get_snapshot();
    assert_eq!(state.error, None);
    assert_eq!(state.consecutive_failures, 0);
}

#[then(expr = "the last {int} refreshes returned {int} orders")]
async fn refresh_results(world: &mut SyncWorld, count: usize, orders: usize) {
    let results = &world.system().results;
    assert!(results.len() >= count, "Only {} refreshes have completed", results.len());
    for result in &results[results.len() - count..] {
        let set = result.as_ref().expect("Refresh failed");
        assert_eq!(set.len(), orders);
    }
}

#[then(expr = "the source was asked for orders {int} times")]
async fn fetch_calls(world: &mut SyncWorld, calls: usize) {
    assert_eq!(world.source().fetch_calls(), calls);
}

#[then(expr = "the observer was notified {int} time(s)")]
async fn observer_notified(world: &mut SyncWorld, count: usize) {
    assert_eq!(world.system().deliveries(), count);
}

#[then(expr = "the order was accepted as {word}")]
async fn accepted_as(world: &mut SyncWorld, status: String) {
    let result = world.system().last_accept.clone().expect("No order was accepted");
    let status_now = result.expect("Accepting the order failed");
    assert_eq!(status_now.to_string(), status);
}

#[then("the accept was refused")]
async fn accept_refused(world: &mut SyncWorld) {
    let result = world.system().last_accept.clone().expect("No order was accepted");
    assert!(result.is_err(), "Expected the accept to fail, got {result:?}");
}
