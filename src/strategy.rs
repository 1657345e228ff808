//! Strategy seam plus two small strategies used by the demo binary and the tests.

use crate::data::DataHandler;
use crate::events::{DataEvent, SignalEvent};
use crate::funding::FundingManager;
use crate::portfolio::{Holding, Portfolio};
use crate::types::{Direction, InstrumentKey, Offset};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use thiserror::Error;

pub type StrategyResult<T> = Result<T, StrategyError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    /// Halts the run.
    #[error("too much bad data: {0}")]
    TooMuchBadData(String),

    #[error("{0} not supported by strategy")]
    NotSupported(&'static str),

    #[error("no data for {0}")]
    NoData(InstrumentKey),

    #[error("strategy error: {0}")]
    Custom(String),
}

impl StrategyError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StrategyError::TooMuchBadData(_))
    }
}

pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// When true the engine hands every instrument's latest tick to one call.
    fn using_simultaneous_processing(&self) -> bool {
        false
    }

    fn set_simultaneous_processing(&mut self, enabled: bool) -> StrategyResult<()> {
        if enabled {
            return Err(StrategyError::NotSupported("simultaneous signal processing"));
        }
        Ok(())
    }

    fn on_signal(
        &mut self,
        data: &DataHandler,
        funding: &dyn FundingManager,
        portfolio: &Portfolio,
    ) -> StrategyResult<SignalEvent>;

    fn on_simultaneous_signals(
        &mut self,
        _data: &[&DataHandler],
        _funding: &dyn FundingManager,
        _portfolio: &Portfolio,
    ) -> StrategyResult<Vec<SignalEvent>> {
        Err(StrategyError::NotSupported("simultaneous signal processing"))
    }

    fn close_all_positions(
        &mut self,
        _holdings: &[Holding],
        _latest_prices: &[DataEvent],
    ) -> StrategyResult<Vec<SignalEvent>> {
        Err(StrategyError::NotSupported("closing all positions"))
    }
}

// signal at the handler's latest tick, or MissingData if it has none
fn signal_at(data: &DataHandler, direction: Direction) -> StrategyResult<SignalEvent> {
    let latest = data
        .latest()
        .ok_or_else(|| StrategyError::NoData(data.instrument().clone()))?;
    let mut signal = SignalEvent::from_data(latest, direction);
    if latest.close <= Decimal::ZERO {
        signal.direction = Some(Direction::MissingData);
        signal.meta.append_reason("missing close price");
    }
    Ok(signal)
}

/// Buys a fixed amount (or whatever funds allow, for zero) on every tick.
#[derive(Debug, Clone)]
pub struct DollarCostAverage {
    pub amount: Decimal,
    pub simultaneous: bool,
}

impl DollarCostAverage {
    pub fn new(amount: Decimal) -> Self {
        Self {
            amount,
            simultaneous: false,
        }
    }

    pub fn simultaneous(mut self) -> Self {
        self.simultaneous = true;
        self
    }

    fn buy(&self, data: &DataHandler) -> StrategyResult<SignalEvent> {
        let mut signal = signal_at(data, Direction::Buy)?;
        signal.amount = self.amount;
        signal.meta.append_reason("dca purchase");
        Ok(signal)
    }
}

impl Strategy for DollarCostAverage {
    fn name(&self) -> &str {
        "dollar-cost-average"
    }

    fn using_simultaneous_processing(&self) -> bool {
        self.simultaneous
    }

    fn set_simultaneous_processing(&mut self, enabled: bool) -> StrategyResult<()> {
        self.simultaneous = enabled;
        Ok(())
    }

    fn on_signal(
        &mut self,
        data: &DataHandler,
        _funding: &dyn FundingManager,
        _portfolio: &Portfolio,
    ) -> StrategyResult<SignalEvent> {
        self.buy(data)
    }

    fn on_simultaneous_signals(
        &mut self,
        data: &[&DataHandler],
        _funding: &dyn FundingManager,
        _portfolio: &Portfolio,
    ) -> StrategyResult<Vec<SignalEvent>> {
        data.iter().map(|d| self.buy(d)).collect()
    }

    fn close_all_positions(
        &mut self,
        holdings: &[Holding],
        latest_prices: &[DataEvent],
    ) -> StrategyResult<Vec<SignalEvent>> {
        let mut signals = Vec::new();
        for holding in holdings.iter().filter(|h| h.base_size > Decimal::ZERO) {
            let Some(latest) = latest_prices.iter().find(|d| d.meta.instrument == holding.instrument) else {
                continue;
            };
            let mut signal = SignalEvent::from_data(latest, Direction::Sell);
            signal.amount = holding.base_size;
            signal.meta.append_reason("closing all positions on shutdown");
            signals.push(signal);
        }
        Ok(signals)
    }
}

/// Replays a fixed plan of directions keyed by instrument and offset. DoNothing elsewhere.
#[derive(Debug, Clone, Default)]
pub struct Scripted {
    plan: BTreeMap<(InstrumentKey, Offset), (Direction, Decimal)>,
    simultaneous: bool,
    /// consecutive MissingData ticks tolerated before giving up on the run
    pub bad_data_tolerance: Option<usize>,
    bad_data_seen: usize,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, key: &InstrumentKey, offset: Offset, direction: Direction, amount: Decimal) -> Self {
        self.plan.insert((key.clone(), offset), (direction, amount));
        self
    }

    pub fn simultaneous(mut self) -> Self {
        self.simultaneous = true;
        self
    }

    fn planned(&mut self, data: &DataHandler) -> StrategyResult<SignalEvent> {
        let (direction, amount) = self
            .plan
            .get(&(data.instrument().clone(), data.offset()))
            .copied()
            .unwrap_or((Direction::DoNothing, Decimal::ZERO));
        let mut signal = signal_at(data, direction)?;
        signal.amount = amount;

        if signal.direction == Some(Direction::MissingData) {
            self.bad_data_seen += 1;
            if let Some(limit) = self.bad_data_tolerance {
                if self.bad_data_seen > limit {
                    return Err(StrategyError::TooMuchBadData(format!(
                        "{} consecutive ticks without a price",
                        self.bad_data_seen
                    )));
                }
            }
        } else {
            self.bad_data_seen = 0;
        }
        Ok(signal)
    }
}

impl Strategy for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn using_simultaneous_processing(&self) -> bool {
        self.simultaneous
    }

    fn set_simultaneous_processing(&mut self, enabled: bool) -> StrategyResult<()> {
        self.simultaneous = enabled;
        Ok(())
    }

    fn on_signal(
        &mut self,
        data: &DataHandler,
        _funding: &dyn FundingManager,
        _portfolio: &Portfolio,
    ) -> StrategyResult<SignalEvent> {
        self.planned(data)
    }

    fn on_simultaneous_signals(
        &mut self,
        data: &[&DataHandler],
        _funding: &dyn FundingManager,
        _portfolio: &Portfolio,
    ) -> StrategyResult<Vec<SignalEvent>> {
        data.iter().map(|d| self.planned(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funding::FundManager;
    use crate::types::{Interval, Timestamp};
    use rust_decimal_macros::dec;

    fn key() -> InstrumentKey {
        InstrumentKey::spot("binance", "BTC", "USDT")
    }

    fn handler(closes: &[Decimal]) -> DataHandler {
        let events = closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                DataEvent::candle(key(), Timestamp::from_millis((i as i64 + 1) * 60_000), Interval::ONE_MINUTE, [*c; 5])
            })
            .collect();
        DataHandler::with_stream(key(), Interval::ONE_MINUTE, events)
    }

    #[test]
    fn scripted_follows_plan() {
        let mut s = Scripted::new().at(&key(), 1, Direction::Buy, dec!(2));
        let mut h = handler(&[dec!(1), dec!(2)]);
        let (f, p) = (FundManager::new(), Portfolio::default());

        h.next();
        assert_eq!(s.on_signal(&h, &f, &p).unwrap().direction, Some(Direction::DoNothing));
        h.next();
        let signal = s.on_signal(&h, &f, &p).unwrap();
        assert_eq!(signal.direction, Some(Direction::Buy));
        assert_eq!(signal.amount, dec!(2));
    }

    #[test]
    fn too_much_bad_data_is_fatal() {
        let mut s = Scripted::new();
        s.bad_data_tolerance = Some(1);
        let mut h = handler(&[dec!(0), dec!(0)]);
        let (f, p) = (FundManager::new(), Portfolio::default());

        h.next();
        assert_eq!(s.on_signal(&h, &f, &p).unwrap().direction, Some(Direction::MissingData));
        h.next();
        let err = s.on_signal(&h, &f, &p).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn no_tick_yet_is_an_error() {
        let mut s = DollarCostAverage::new(dec!(1));
        let h = handler(&[dec!(1)]);
        let (f, p) = (FundManager::new(), Portfolio::default());
        assert!(matches!(s.on_signal(&h, &f, &p), Err(StrategyError::NoData(_))));
    }

    #[test]
    fn default_close_all_is_not_supported() {
        let mut s = Scripted::new();
        assert!(matches!(s.close_all_positions(&[], &[]), Err(StrategyError::NotSupported(_))));
    }
}
