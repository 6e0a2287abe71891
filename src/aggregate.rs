//! Dense-series construction and resolution aggregation for candle queries.

use std::collections::BTreeMap;

use crate::bucketer::bucket_key;
use crate::error::QueryError;
use crate::models::{Candle, Millis};

/// Fold `next` into `acc`, which must cover the same or an earlier slice of
/// the same bucket.
fn merge_into(acc: &mut Candle, next: &Candle) {
    acc.high = acc.high.max(next.high);
    acc.low = acc.low.min(next.low);
    acc.close = next.close;
    acc.volume += next.volume;
    acc.trade_count += next.trade_count;
}

/// Collapse rows sharing an `open_time_ms` (e.g. the same bucket recorded
/// under two sources). Input must be sorted by open time.
pub fn fold_duplicates(candles: Vec<Candle>) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles {
        match out.last_mut() {
            Some(last) if last.open_time_ms == candle.open_time_ms => merge_into(last, &candle),
            _ => out.push(candle),
        }
    }
    out
}

/// Insert flat zero-volume candles for every missing `base_ms` bucket.
///
/// Leading gaps run from the first base-aligned bucket at or after
/// `start_ms` and carry the first real candle's open; every later gap
/// carries the previous candle's close. `raw` must be sorted, unique and
/// base-aligned. Nothing is synthesized after the last real candle.
pub fn gap_fill(
    raw: &[Candle],
    base_ms: Millis,
    start_ms: Millis,
    max_dense: u64,
) -> Result<Vec<Candle>, QueryError> {
    let (Some(first), Some(last)) = (raw.first(), raw.last()) else {
        return Ok(Vec::new());
    };

    // Ceil to the base grid; past Millis::MAX the first real candle wins.
    let offset = start_ms.rem_euclid(base_ms);
    let aligned_start = if offset == 0 {
        start_ms
    } else {
        start_ms.checked_add(base_ms - offset).unwrap_or(Millis::MAX)
    };
    let dense_start = aligned_start.min(first.open_time_ms);
    let buckets = match last.open_time_ms.checked_sub(dense_start) {
        Some(width) => (width / base_ms) as u64 + 1,
        None => u64::MAX,
    };
    if buckets > max_dense {
        return Err(QueryError::SpanTooLarge {
            buckets,
            max: max_dense,
        });
    }

    let mut out = Vec::with_capacity(buckets as usize);
    let mut last_close = first.open;
    let mut expected = dense_start;

    for candle in raw {
        while expected < candle.open_time_ms {
            out.push(Candle::flat(candle.symbol.clone(), expected, last_close));
            expected += base_ms;
        }
        out.push(candle.clone());
        last_close = candle.close;
        expected = candle.open_time_ms.saturating_add(base_ms);
    }

    Ok(out)
}

/// Group a time-ordered series into `resolution_ms`-aligned buckets.
pub fn aggregate(candles: &[Candle], resolution_ms: Millis) -> Vec<Candle> {
    let mut buckets: BTreeMap<Millis, Candle> = BTreeMap::new();
    for candle in candles {
        let key = bucket_key(candle.open_time_ms, resolution_ms);
        buckets
            .entry(key)
            .and_modify(|acc| merge_into(acc, candle))
            .or_insert_with(|| Candle {
                open_time_ms: key,
                ..candle.clone()
            });
    }
    buckets.into_values().collect()
}

/// Cut `items` down to `limit`; returns whether anything was dropped.
pub fn truncate<T>(items: &mut Vec<T>, limit: usize) -> bool {
    if items.len() > limit {
        items.truncate(limit);
        true
    } else {
        false
    }
}
