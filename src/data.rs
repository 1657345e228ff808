//! Per-instrument cursors over already loaded candles.
//!
//! A [`DataHandler`] owns one instrument's stream and a cursor into it. The
//! [`DataHolder`] indexes handlers by [`InstrumentKey`]. Offsets are the
//! 0-based stream index, so the n-th call to `next()` hands out offset n-1.

use crate::events::{DataEvent, Event};
use crate::types::{InstrumentKey, Interval, Offset};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("handler not found for {0}")]
    HandlerNotFound(InstrumentKey),

    #[error("nil event received")]
    NilEvent,
}

#[derive(Debug, Clone)]
pub struct DataHandler {
    instrument: InstrumentKey,
    interval: Interval,
    stream: Vec<DataEvent>,
    consumed: usize,
}

impl DataHandler {
    pub fn new(instrument: InstrumentKey, interval: Interval) -> Self {
        Self {
            instrument,
            interval,
            stream: Vec::new(),
            consumed: 0,
        }
    }

    pub fn with_stream(instrument: InstrumentKey, interval: Interval, events: Vec<DataEvent>) -> Self {
        let mut handler = Self::new(instrument, interval);
        handler.append_stream(events);
        handler
    }

    pub fn instrument(&self) -> &InstrumentKey {
        &self.instrument
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Advance the cursor. `None` means the stream is exhausted.
    pub fn next(&mut self) -> Option<DataEvent> {
        let event = self.stream.get(self.consumed)?.clone();
        self.consumed += 1;
        Some(event)
    }

    pub fn latest(&self) -> Option<&DataEvent> {
        self.consumed.checked_sub(1).and_then(|i| self.stream.get(i))
    }

    pub fn history(&self) -> &[DataEvent] {
        &self.stream[..self.consumed]
    }

    /// Ticks not yet handed out by `next()`.
    pub fn list(&self) -> &[DataEvent] {
        &self.stream[self.consumed..]
    }

    pub fn is_last_event(&self) -> bool {
        self.consumed > 0 && self.consumed == self.stream.len()
    }

    // -1 until the first next()
    pub fn offset(&self) -> Offset {
        self.consumed as Offset - 1
    }

    pub fn len(&self) -> usize {
        self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    /// Closes of every consumed tick, oldest first.
    pub fn close_prices(&self) -> Vec<Decimal> {
        self.history().iter().map(|ev| ev.close).collect()
    }

    /// Extend the stream. Ticks whose time is already present are skipped,
    /// new ticks are sorted by time and stamped with their stream index.
    /// Returns how many ticks were added.
    pub fn append_stream(&mut self, mut events: Vec<DataEvent>) -> usize {
        let last_time = self.stream.last().map(|ev| ev.meta.time);
        events.retain(|ev| match last_time {
            Some(t) => ev.meta.time > t,
            None => true,
        });
        events.sort_by_key(|ev| ev.meta.time);
        events.dedup_by_key(|ev| ev.meta.time);

        let added = events.len();
        for mut ev in events {
            ev.meta.offset = self.stream.len() as Offset;
            ev.meta.instrument = self.instrument.clone();
            ev.meta.interval = self.interval;
            self.stream.push(ev);
        }
        added
    }

    pub fn rewind(&mut self) {
        self.consumed = 0;
    }
}

/// Index of every tracked instrument's cursor.
#[derive(Debug, Default)]
pub struct DataHolder {
    handlers: BTreeMap<InstrumentKey, DataHandler>,
}

pub type SharedDataHolder = Arc<Mutex<DataHolder>>;

/// Short lived guard over the shared holder. a poisoned lock still holds valid cursors.
pub fn lock_data(data: &SharedDataHolder) -> MutexGuard<'_, DataHolder> {
    data.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DataHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedDataHolder {
        Arc::new(Mutex::new(self))
    }

    pub fn set_data_for_currency(&mut self, handler: DataHandler) {
        self.handlers.insert(handler.instrument.clone(), handler);
    }

    pub fn get_data_for_currency(&self, event: &Event) -> Result<&DataHandler, DataError> {
        self.handler(event.instrument())
    }

    pub fn get_data_for_event(&self, event: Option<&Event>) -> Result<&DataHandler, DataError> {
        let event = event.ok_or(DataError::NilEvent)?;
        self.get_data_for_currency(event)
    }

    pub fn handler(&self, key: &InstrumentKey) -> Result<&DataHandler, DataError> {
        self.handlers
            .get(key)
            .ok_or_else(|| DataError::HandlerNotFound(key.clone()))
    }

    pub fn handler_mut(&mut self, key: &InstrumentKey) -> Result<&mut DataHandler, DataError> {
        self.handlers
            .get_mut(key)
            .ok_or_else(|| DataError::HandlerNotFound(key.clone()))
    }

    pub fn all_data(&self) -> impl Iterator<Item = &DataHandler> {
        self.handlers.values()
    }

    pub fn all_data_mut(&mut self) -> impl Iterator<Item = &mut DataHandler> {
        self.handlers.values_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn reset(&mut self) {
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use rust_decimal_macros::dec;

    fn key() -> InstrumentKey {
        InstrumentKey::spot("binance", "BTC", "USDT")
    }

    fn candles(n: i64) -> Vec<DataEvent> {
        (1..=n)
            .map(|i| {
                let px = Decimal::from(100 + i);
                DataEvent::candle(
                    key(),
                    Timestamp::from_millis(i * 60_000),
                    Interval::ONE_MINUTE,
                    [px, px, px, px, dec!(10)],
                )
            })
            .collect()
    }

    #[test]
    fn four_ticks_then_exhausted() {
        let mut h = DataHandler::with_stream(key(), Interval::ONE_MINUTE, candles(4));
        assert_eq!(h.offset(), -1);
        assert!(h.latest().is_none());
        assert_eq!(h.list().len(), 4);

        for expected in 0..4 {
            let ev = h.next().unwrap();
            assert_eq!(ev.meta.offset, expected);
        }
        assert!(h.is_last_event());
        assert_eq!(h.offset(), 3);
        assert!(h.list().is_empty());
        assert_eq!(h.history().len(), 4);
        assert!(h.next().is_none());
        assert_eq!(h.offset(), 3);
    }

    #[test]
    fn latest_does_not_advance() {
        let mut h = DataHandler::with_stream(key(), Interval::ONE_MINUTE, candles(3));
        h.next();
        assert_eq!(h.latest().unwrap().close, dec!(101));
        assert_eq!(h.latest().unwrap().close, dec!(101));
        assert_eq!(h.list().len(), 2);
        assert_eq!(h.close_prices(), vec![dec!(101)]);
    }

    #[test]
    fn append_skips_known_ticks() {
        let mut h = DataHandler::with_stream(key(), Interval::ONE_MINUTE, candles(2));
        // overlapping poll window returns the last known tick again
        let added = h.append_stream(candles(3));
        assert_eq!(added, 1);
        assert_eq!(h.len(), 3);
        assert_eq!(h.list()[2].meta.offset, 2);
    }

    #[test]
    fn holder_lookup_errors() {
        let mut holder = DataHolder::new();
        holder.set_data_for_currency(DataHandler::with_stream(key(), Interval::ONE_MINUTE, candles(1)));

        let ev = Event::Data(candles(1).remove(0));
        assert!(holder.get_data_for_currency(&ev).is_ok());
        assert_eq!(holder.get_data_for_event(None).unwrap_err(), DataError::NilEvent);

        let other = InstrumentKey::spot("kraken", "ETH", "USD");
        assert!(matches!(holder.handler(&other), Err(DataError::HandlerNotFound(_))));

        holder.reset();
        assert!(holder.is_empty());
    }
}
