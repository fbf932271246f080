use std::{sync::Arc, time::Duration};

use anyhow::Result;
use jobsync_engine::{
    events::{EventHandlers, EventHooks},
    order_types::OrderId,
    traits::ContextId,
    OrderSyncEngine,
    PersistentKv,
    SchedulerState,
};
use log::*;

use crate::{
    config::AgentConfig,
    errors::AgentError,
    file_kv::FileKv,
    formatting::{format_orders, format_schedule},
    http_source::HttpOrderSource,
    observer::ConsoleObserver,
};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

pub type AgentEngine = OrderSyncEngine<HttpOrderSource>;

pub fn open_shared_state(config: &AgentConfig) -> Result<Option<Arc<dyn PersistentKv>>, AgentError> {
    let Some(path) = &config.kv_path else {
        return Ok(None);
    };
    let id = config.context_id.clone().map(ContextId::from).unwrap_or_else(ContextId::random);
    let kv = FileKv::open(path, id, config.kv_poll_interval)?;
    info!("🚀️ Sharing the schedule through {} as {}", kv.path().display(), kv.context_id());
    Ok(Some(Arc::new(kv)))
}

fn event_hooks() -> EventHooks {
    let mut hooks = EventHooks::default();
    hooks
        .on_new_orders(|ev| {
            Box::pin(async move {
                info!("🚀️ {} new orders ({} unacknowledged)", ev.orders.len(), ev.unacknowledged);
            })
        })
        .on_sync_failed(|ev| {
            Box::pin(async move {
                warn!("🚀️ Sync failed {} times in a row. {}", ev.consecutive_failures, ev.error);
            })
        });
    hooks
}

pub fn build_engine(config: &AgentConfig, kv: Option<Arc<dyn PersistentKv>>) -> Result<AgentEngine, AgentError> {
    let source = HttpOrderSource::new(config.api_url.clone(), config.subject_token())?;
    let handlers = EventHandlers::new(config.engine.event_buffer_size, event_hooks());
    let producers = handlers.producers();
    handlers.start_handlers();
    let engine = OrderSyncEngine::new(config.engine.clone(), source, kv, producers);
    engine.set_subject_token(config.subject_token());
    Ok(engine)
}

fn require_token(config: &AgentConfig) -> Result<(), AgentError> {
    match config.subject_token {
        Some(_) => Ok(()),
        None => Err(AgentError::MissingToken),
    }
}

pub async fn watch(config: AgentConfig, no_schedule: bool) -> Result<()> {
    let kv = open_shared_state(&config)?;
    let engine = build_engine(&config, kv)?;
    let _subscription = engine.subscribe(Arc::new(ConsoleObserver::default()));
    let restored = engine.start();
    if !restored.enabled && !no_schedule {
        engine.toggle_schedule();
    }
    println!("Watching orders. {}", format_schedule(&engine.scheduler_state()));
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("🚀️ Could not listen for Ctrl-C. {e}");
                }
                break;
            },
            _ = housekeeping.tick() => {
                let removed = engine.cleanup_old_orders();
                debug!("🚀️ Housekeeping removed {removed} old orders");
            },
        }
    }
    engine.shutdown();
    println!("Stopped watching. {}", format_schedule(&engine.scheduler_state()));
    Ok(())
}

pub async fn list(config: AgentConfig) -> Result<()> {
    require_token(&config)?;
    let engine = build_engine(&config, None)?;
    let orders = engine.refresh().await.map_err(AgentError::from)?;
    println!("{}", format_orders(orders.orders()));
    Ok(())
}

pub async fn accept(config: AgentConfig, order_id: String) -> Result<()> {
    require_token(&config)?;
    let engine = build_engine(&config, None)?;
    let order = engine.accept_order(&OrderId::from(order_id)).await.map_err(AgentError::from)?;
    println!("Order {} is now {}", order.id.as_str(), order.status);
    Ok(())
}

pub async fn upstream_sync(config: AgentConfig) -> Result<()> {
    let engine = build_engine(&config, None)?;
    let orders = engine.sync_from_upstream().await.map_err(AgentError::from)?;
    println!("Upstream sync complete. {} orders in view", orders.len());
    Ok(())
}

pub fn schedule(config: AgentConfig) -> Result<()> {
    let Some(kv) = open_shared_state(&config)? else {
        println!("No shared state file is configured. Set JOBSYNC_KV_PATH or pass --kv-path.");
        return Ok(());
    };
    let keys = config.engine.storage_keys();
    let state = SchedulerState::load(kv.as_ref(), &keys, config.engine.sync_period_secs).map_err(AgentError::from)?;
    println!("{}", format_schedule(&state));
    Ok(())
}
