//! In-process topic-keyed publish/subscribe bus.
//!
//! Handlers run synchronously on the publisher's thread in subscription
//! order. The handler list is snapshotted before dispatch, so a handler may
//! publish (or subscribe) from inside its own callback without deadlocking.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::models::{Candle, OrderEvent, TradePrint};

pub const TOPIC_TRADE_PRINT: &str = "TradePrint";
pub const TOPIC_CHART_CANDLE: &str = "ChartCandle";
pub const TOPIC_ORDER_PLACED: &str = "OrderPlaced";
pub const TOPIC_ORDER_FILLED: &str = "OrderFilled";
pub const TOPIC_ORDER_REJECTED: &str = "OrderRejected";

/// Payloads carried on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    TradePrint(TradePrint),
    ChartCandle(Candle),
    Order(OrderEvent),
}

pub type HandlerId = u64;
pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. The returned id can be passed to `unsubscribe`.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.handlers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns true if a handler was removed.
    pub fn unsubscribe(&self, topic: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        list.len() != before
    }

    /// Deliver `event` to every handler subscribed to `topic`.
    pub fn publish(&self, topic: &str, event: &BusEvent) {
        let snapshot: Vec<Handler> = match self.handlers.read().get(topic) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers.read().get(topic).map_or(0, |l| l.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn trade(ts_ms: i64) -> BusEvent {
        BusEvent::TradePrint(TradePrint::new("BTCUSD", 100.0, 1.0, ts_ms))
    }

    #[test]
    fn test_publish_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        bus.subscribe(TOPIC_TRADE_PRINT, move |_| s1.lock().push("first"));
        let s2 = Arc::clone(&seen);
        bus.subscribe(TOPIC_TRADE_PRINT, move |_| s2.lock().push("second"));

        bus.publish(TOPIC_TRADE_PRINT, &trade(1));
        bus.publish(TOPIC_CHART_CANDLE, &trade(2));

        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(TOPIC_TRADE_PRINT, |_| {});
        assert_eq!(bus.subscriber_count(TOPIC_TRADE_PRINT), 1);
        assert!(!bus.unsubscribe(TOPIC_CHART_CANDLE, id));
        assert!(bus.unsubscribe(TOPIC_TRADE_PRINT, id));
        assert!(!bus.unsubscribe(TOPIC_TRADE_PRINT, id));
        assert_eq!(bus.subscriber_count(TOPIC_TRADE_PRINT), 0);
    }

    #[test]
    fn test_reentrant_publish() {
        let bus = Arc::new(EventBus::new());
        let forwarded = Arc::new(Mutex::new(0usize));

        let inner = Arc::clone(&bus);
        bus.subscribe(TOPIC_TRADE_PRINT, move |ev| {
            if let BusEvent::TradePrint(tp) = ev {
                inner.publish(
                    TOPIC_CHART_CANDLE,
                    &BusEvent::ChartCandle(Candle::flat(tp.symbol.clone(), tp.ts_ms, tp.price)),
                );
            }
        });
        let counter = Arc::clone(&forwarded);
        bus.subscribe(TOPIC_CHART_CANDLE, move |_| *counter.lock() += 1);

        bus.publish(TOPIC_TRADE_PRINT, &trade(5));
        assert_eq!(*forwarded.lock(), 1);
    }
}
