use jobsync_common::Amount;
use jobsync_engine::{order_types::Order, SchedulerState, SyncState};
use prettytable::{
    format::{LinePosition, LineSeparator, TableFormat},
    row,
    Table,
};

fn markdown_format() -> TableFormat {
    prettytable::format::FormatBuilder::new()
        .column_separator('|')
        .borders('|')
        .separator(LinePosition::Title, LineSeparator::new('-', '|', '|', '|'))
        .padding(1, 1)
        .build()
}

pub fn format_orders(orders: &[Order]) -> String {
    if orders.is_empty() {
        return "No orders".to_string();
    }
    let mut table = Table::new();
    table.set_titles(row!["Order id", "Status", "Amount", "Customer", "Location", "Service", "Created at"]);
    orders.iter().for_each(|order| {
        table.add_row(row![
            order.id,
            order.status.to_string(),
            order.amount.to_string(),
            order.customer_name,
            order.location,
            order.service_type,
            order.created_at.format("%Y-%m-%d %H:%M").to_string()
        ]);
    });
    table.set_format(markdown_format());
    let total = orders.iter().map(|o| o.amount).sum::<Amount>();
    format!("{table}\n{count:>4} orders. Total value: {total}", count = orders.len())
}

/// One line describing the sync state, for the `watch` command.
pub fn format_summary(state: &SyncState) -> String {
    let mut parts = vec![format!("{} orders", state.orders.len())];
    if state.is_loading {
        parts.push("loading".to_string());
    }
    if state.has_new_orders {
        parts.push(format!("{} new", state.new_orders_count));
    }
    if let Some(at) = state.last_fetch_at {
        parts.push(format!("fetched {}", at.format("%H:%M:%S")));
    }
    if let Some(error) = &state.error {
        parts.push(format!("error: {error}"));
    }
    parts.join(" | ")
}

pub fn format_schedule(state: &SchedulerState) -> String {
    let schedule = if state.enabled {
        format!("next fetch in {}s", state.countdown_seconds)
    } else {
        "automatic fetching is off".to_string()
    };
    match state.last_fetch_at {
        Some(at) => format!("{schedule}. Last fetch at {}", at.to_rfc3339()),
        None => schedule,
    }
}
