//! Order lifecycle → event log.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::{
    BusEvent, EventBus, HandlerId, TOPIC_ORDER_FILLED, TOPIC_ORDER_PLACED, TOPIC_ORDER_REJECTED,
};
use crate::models::{OrderEvent, OrderEventKind, Source};
use crate::store::CandleStore;

const ORDER_TOPICS: [&str; 3] = [TOPIC_ORDER_PLACED, TOPIC_ORDER_FILLED, TOPIC_ORDER_REJECTED];

#[derive(Debug, Default)]
struct RecorderCounters {
    recorded: AtomicU64,
    fill_flushes: AtomicU64,
    errors: AtomicU64,
    malformed_dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStats {
    pub recorded: u64,
    pub fill_flushes: u64,
    pub errors: u64,
    pub malformed_dropped: u64,
}

/// Persists every order event published on the bus. Fills force a store
/// flush so they are immediately visible to readers.
pub struct EventRecorder {
    bus: Arc<EventBus>,
    store: Arc<CandleStore>,
    source: Source,
    counters: Arc<RecorderCounters>,
    handlers: Mutex<Vec<(&'static str, HandlerId)>>,
}

impl EventRecorder {
    pub fn new(bus: Arc<EventBus>, store: Arc<CandleStore>, source: Source) -> Self {
        Self {
            bus,
            store,
            source,
            counters: Arc::new(RecorderCounters::default()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let mut handlers = self.handlers.lock();
        if !handlers.is_empty() {
            return;
        }

        for topic in ORDER_TOPICS {
            let store = Arc::clone(&self.store);
            let counters = Arc::clone(&self.counters);
            let source = self.source;
            let id = self.bus.subscribe(topic, move |event| match event {
                BusEvent::Order(order) => record(&store, &counters, source, order),
                other => {
                    counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(topic, event = ?other, "Ignoring non-order event on order topic");
                }
            });
            handlers.push((topic, id));
        }
        info!(source = %self.source, "Event recorder started");
    }

    pub fn stop(&self) {
        let handlers = std::mem::take(&mut *self.handlers.lock());
        for (topic, id) in handlers {
            self.bus.unsubscribe(topic, id);
        }
    }

    pub fn stats(&self) -> RecorderStats {
        let c = &self.counters;
        RecorderStats {
            recorded: c.recorded.load(Ordering::Relaxed),
            fill_flushes: c.fill_flushes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            malformed_dropped: c.malformed_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record(store: &CandleStore, counters: &RecorderCounters, source: Source, order: &OrderEvent) {
    let event_type = order.kind.event_type();
    if let Err(e) = store.add_event(
        event_type,
        order.timestamp_ms,
        &order.symbol,
        source,
        order.payload(),
    ) {
        counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!(event_type, order_id = %order.order_id, error = %e, "Failed to record order event");
        return;
    }
    counters.recorded.fetch_add(1, Ordering::Relaxed);

    if order.kind == OrderEventKind::Filled {
        match store.flush_all() {
            Ok(()) => {
                counters.fill_flushes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(order_id = %order.order_id, error = %e, "Flush after fill failed");
            }
        }
    }
}
