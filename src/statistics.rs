//! Run statistics: an append-only, offset keyed record of everything the engine did.
//!
//! Every event slot at an (instrument, offset) can be written once. A second write
//! returns [`StatisticsError::AlreadyProcessed`], which the engine uses as its
//! "seen this tick already" signal.

use crate::events::{DataEvent, Event, FillEvent, OrderEvent, SignalEvent};
use crate::portfolio::{ComplianceSnapshot, Holding, PnlSummary};
use crate::types::{InstrumentKey, Offset, Timestamp};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatisticsError {
    #[error("{kind} already processed for {instrument} at offset {offset}")]
    AlreadyProcessed {
        instrument: InstrumentKey,
        offset: Offset,
        kind: &'static str,
    },

    #[error("no data recorded for {instrument} at offset {offset}")]
    NoDataAtOffset { instrument: InstrumentKey, offset: Offset },

    #[error("no statistics for {0}")]
    UnknownInstrument(InstrumentKey),
}

impl StatisticsError {
    pub fn is_already_processed(&self) -> bool {
        matches!(self, StatisticsError::AlreadyProcessed { .. })
    }
}

// 8.0: one record per instrument per offset
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataAtOffset {
    pub offset: Offset,
    pub time: Timestamp,
    pub close_price: Decimal,
    pub data: Option<DataEvent>,
    pub signal: Option<SignalEvent>,
    pub order: Option<OrderEvent>,
    pub fill: Option<FillEvent>,
    pub holdings: Option<Holding>,
    pub compliance: Option<ComplianceSnapshot>,
    pub pnl: Option<PnlSummary>,
}

// 8.1: the recorder seam
pub trait StatisticsRecorder: Send {
    fn set_event_for_offset(&mut self, event: &Event) -> Result<(), StatisticsError>;
    fn add_holdings_for_time(&mut self, holding: &Holding) -> Result<(), StatisticsError>;
    fn add_compliance_snapshot_for_time(
        &mut self,
        snapshot: &ComplianceSnapshot,
        fill: &FillEvent,
    ) -> Result<(), StatisticsError>;
    fn add_pnl_for_time(&mut self, pnl: &PnlSummary) -> Result<(), StatisticsError>;
    /// One line describing a recorded event. used for live logging.
    fn create_log(&self, event: &Event) -> String;
    /// Every record for the instrument, ordered by offset.
    fn records(&self, key: &InstrumentKey) -> &[DataAtOffset];
    fn record_at(&self, key: &InstrumentKey, offset: Offset) -> Option<&DataAtOffset> {
        let records = self.records(key);
        find_offset(records, offset).ok().map(|i| &records[i])
    }
    fn reset(&mut self);
}

#[derive(Debug, Default)]
pub struct Statistic {
    records: BTreeMap<InstrumentKey, Vec<DataAtOffset>>,
}

impl Statistic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instruments(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.records.keys()
    }

    pub fn fill_count(&self) -> usize {
        self.records
            .values()
            .flatten()
            .filter(|d| d.fill.as_ref().is_some_and(|f| f.order.is_some()))
            .count()
    }

    fn record_mut(&mut self, key: &InstrumentKey, offset: Offset) -> Result<&mut DataAtOffset, StatisticsError> {
        self.records
            .get_mut(key)
            .and_then(|r| {
                let i = find_offset(r, offset).ok()?;
                r.get_mut(i)
            })
            .ok_or_else(|| StatisticsError::NoDataAtOffset {
                instrument: key.clone(),
                offset,
            })
    }
}

// records stay sorted by offset. ticks arrive in order, so this is almost always the tail
fn find_offset(records: &[DataAtOffset], offset: Offset) -> Result<usize, usize> {
    match records.last() {
        Some(last) if last.offset < offset => Err(records.len()),
        Some(last) if last.offset == offset => Ok(records.len() - 1),
        _ => records.binary_search_by_key(&offset, |d| d.offset),
    }
}

// fills a slot once, second write is the idempotency error
fn set_once<T: Clone>(
    slot: &mut Option<T>,
    value: &T,
    instrument: &InstrumentKey,
    offset: Offset,
    kind: &'static str,
) -> Result<(), StatisticsError> {
    if slot.is_some() {
        return Err(StatisticsError::AlreadyProcessed {
            instrument: instrument.clone(),
            offset,
            kind,
        });
    }
    *slot = Some(value.clone());
    Ok(())
}

impl StatisticsRecorder for Statistic {
    fn set_event_for_offset(&mut self, event: &Event) -> Result<(), StatisticsError> {
        let key = event.instrument();
        let offset = event.offset();
        if let Event::Data(data) = event {
            let records = self.records.entry(key.clone()).or_default();
            let at = match find_offset(records, offset) {
                Ok(_) => {
                    return Err(StatisticsError::AlreadyProcessed {
                        instrument: key.clone(),
                        offset,
                        kind: event.kind(),
                    })
                }
                Err(at) => at,
            };
            records.insert(at, DataAtOffset {
                offset,
                time: data.meta.time,
                close_price: data.close,
                data: Some(data.clone()),
                ..DataAtOffset::default()
            });
            return Ok(());
        }

        let record = self.record_mut(key, offset)?;
        match event {
            Event::Signal(ev) => set_once(&mut record.signal, ev, key, offset, "signal"),
            Event::Order(ev) => set_once(&mut record.order, ev, key, offset, "order"),
            Event::Fill(ev) => set_once(&mut record.fill, ev, key, offset, "fill"),
            Event::Data(_) => Ok(()),
        }
    }

    fn add_holdings_for_time(&mut self, holding: &Holding) -> Result<(), StatisticsError> {
        let record = self.record_mut(&holding.instrument, holding.offset)?;
        record.holdings = Some(holding.clone());
        Ok(())
    }

    fn add_compliance_snapshot_for_time(
        &mut self,
        snapshot: &ComplianceSnapshot,
        fill: &FillEvent,
    ) -> Result<(), StatisticsError> {
        let record = self.record_mut(&fill.meta.instrument, fill.meta.offset)?;
        record.compliance = Some(snapshot.clone());
        Ok(())
    }

    fn add_pnl_for_time(&mut self, pnl: &PnlSummary) -> Result<(), StatisticsError> {
        let record = self.record_mut(&pnl.instrument, pnl.offset)?;
        record.pnl = Some(pnl.clone());
        Ok(())
    }

    fn create_log(&self, event: &Event) -> String {
        let meta = event.meta();
        let mut line = format!(
            "{} {} offset {} {}",
            meta.time,
            meta.instrument,
            meta.offset,
            event.kind()
        );
        if let Some(direction) = event.direction() {
            line.push_str(&format!(" {direction}"));
        }
        if let Event::Fill(fill) = event {
            if let Some(order) = &fill.order {
                line.push_str(&format!(" amount {} at {} fee {}", order.amount, order.price, order.fee));
            }
        } else {
            line.push_str(&format!(" price {}", event.close_price()));
        }
        let reason = meta.reason();
        if !reason.is_empty() {
            line.push_str(&format!(" ({reason})"));
        }
        line
    }

    fn records(&self, key: &InstrumentKey) -> &[DataAtOffset] {
        self.records.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn reset(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Interval};
    use rust_decimal_macros::dec;

    fn key() -> InstrumentKey {
        InstrumentKey::spot("binance", "BTC", "USDT")
    }

    fn data(offset: Offset) -> DataEvent {
        let mut ev = DataEvent::candle(key(), Timestamp::from_millis(60_000), Interval::ONE_MINUTE, [dec!(100); 5]);
        ev.meta.offset = offset;
        ev
    }

    #[test]
    fn data_slot_set_once() {
        let mut stats = Statistic::new();
        stats.set_event_for_offset(&Event::Data(data(0))).unwrap();
        let err = stats.set_event_for_offset(&Event::Data(data(0))).unwrap_err();
        assert!(err.is_already_processed());
        stats.set_event_for_offset(&Event::Data(data(1))).unwrap();
        assert_eq!(stats.records(&key()).len(), 2);
    }

    #[test]
    fn signal_needs_data_first() {
        let mut stats = Statistic::new();
        let signal = SignalEvent::from_data(&data(0), Direction::Buy);
        assert!(matches!(
            stats.set_event_for_offset(&Event::Signal(signal.clone())),
            Err(StatisticsError::NoDataAtOffset { .. })
        ));
        stats.set_event_for_offset(&Event::Data(data(0))).unwrap();
        stats.set_event_for_offset(&Event::Signal(signal.clone())).unwrap();
        assert!(stats.set_event_for_offset(&Event::Signal(signal)).unwrap_err().is_already_processed());
    }

    #[test]
    fn late_offsets_are_slotted_in_order() {
        let mut stats = Statistic::new();
        for offset in [0, 1, 4, 2] {
            stats.set_event_for_offset(&Event::Data(data(offset))).unwrap();
        }
        let offsets: Vec<Offset> = stats.records(&key()).iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 4]);
        assert!(stats.set_event_for_offset(&Event::Data(data(2))).unwrap_err().is_already_processed());
        assert!(stats.record_at(&key(), 3).is_none());
        assert_eq!(stats.record_at(&key(), 4).unwrap().offset, 4);
    }

    #[test]
    fn long_runs_record_every_tick() {
        let mut stats = Statistic::new();
        let ticks: Offset = 100_000;
        for offset in 0..ticks {
            stats.set_event_for_offset(&Event::Data(data(offset))).unwrap();
            let signal = SignalEvent::from_data(&data(offset), Direction::DoNothing);
            stats.set_event_for_offset(&Event::Signal(signal)).unwrap();
        }
        assert_eq!(stats.records(&key()).len(), ticks as usize);
        assert!(stats.record_at(&key(), ticks - 1).is_some_and(|r| r.signal.is_some()));
    }

    #[test]
    fn log_line_names_the_event() {
        let stats = Statistic::new();
        let mut signal = SignalEvent::from_data(&data(3), Direction::Sell);
        signal.meta.append_reason("crossed");
        let line = stats.create_log(&Event::Signal(signal));
        assert!(line.contains("offset 3"));
        assert!(line.contains("SELL"));
        assert!(line.contains("(crossed)"));
    }
}
