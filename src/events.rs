// 2.0: the four pipeline events. data -> signal -> order -> fill.
// every variant carries the same EventMetadata by composition; the Event enum is what
// the queue holds and what the engine dispatches on.

use crate::types::{CurrencyCode, Direction, InstrumentKey, Interval, Leverage, Offset, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// 2.1: shared metadata. immutable once enqueued except for the reason trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub offset: Offset,
    pub instrument: InstrumentKey,
    pub time: Timestamp,
    pub interval: Interval,
    pub reasons: Vec<String>,
}

impl EventMetadata {
    pub fn new(instrument: InstrumentKey, offset: Offset, time: Timestamp, interval: Interval) -> Self {
        Self {
            offset,
            instrument,
            time,
            interval,
            reasons: Vec::new(),
        }
    }

    pub fn append_reason(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !reason.is_empty() {
            self.reasons.push(reason);
        }
    }

    pub fn reason(&self) -> String {
        self.reasons.join(". ")
    }
}

/// One candle for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    pub meta: EventMetadata,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl DataEvent {
    pub fn candle(
        instrument: InstrumentKey,
        time: Timestamp,
        interval: Interval,
        ohlcv: [Decimal; 5],
    ) -> Self {
        let [open, high, low, close, volume] = ohlcv;
        Self {
            meta: EventMetadata::new(instrument, 0, time, interval),
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

// 2.2: what the strategy wants to do. direction None is the invalid/unset case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub meta: EventMetadata,
    pub direction: Option<Direction>,
    pub close_price: Decimal,
    /// requested amount, zero lets the sizer decide
    pub amount: Decimal,
    pub buy_limit: Decimal,
    pub sell_limit: Decimal,
    pub collateral_currency: Option<CurrencyCode>,
    pub fill_dependent_event: Option<Box<SignalEvent>>,
    /// when this signal is raised by a fill, copy the filled amount into it
    pub match_order_amount: bool,
}

impl SignalEvent {
    pub fn from_data(data: &DataEvent, direction: Direction) -> Self {
        Self {
            meta: data.meta.clone(),
            direction: Some(direction),
            close_price: data.close,
            amount: Decimal::ZERO,
            buy_limit: Decimal::ZERO,
            sell_limit: Decimal::ZERO,
            collateral_currency: None,
            fill_dependent_event: None,
            match_order_amount: false,
        }
    }

    pub fn with_fill_dependent_event(mut self, dependent: SignalEvent) -> Self {
        self.fill_dependent_event = Some(Box::new(dependent));
        self
    }
}

// 2.3: sized, risk checked order. may be a could-not pseudo order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub meta: EventMetadata,
    pub direction: Direction,
    pub close_price: Decimal,
    pub amount: Decimal,
    pub allocated_funds: Decimal,
    pub leverage: Leverage,
    pub buy_limit: Decimal,
    pub sell_limit: Decimal,
    pub liquidating: bool,
    pub closing_position: bool,
    pub fill_dependent_event: Option<Box<SignalEvent>>,
}

impl OrderEvent {
    pub fn from_signal(signal: &SignalEvent, direction: Direction) -> Self {
        Self {
            meta: signal.meta.clone(),
            direction,
            close_price: signal.close_price,
            amount: signal.amount,
            allocated_funds: Decimal::ZERO,
            leverage: Leverage::one(),
            buy_limit: signal.buy_limit,
            sell_limit: signal.sell_limit,
            liquidating: false,
            closing_position: direction == Direction::ClosePosition,
            fill_dependent_event: signal.fill_dependent_event.clone(),
        }
    }

    pub fn value(&self) -> Decimal {
        self.amount * self.close_price
    }
}

/// Exchange side record of an executed order. compliance snapshots keep these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledOrder {
    pub id: u64,
    pub direction: Direction,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub leverage: Leverage,
    pub date: Timestamp,
}

impl FilledOrder {
    pub fn cost(&self) -> Decimal {
        self.price * self.amount
    }
}

// 2.4: the result of execution. always produced, even when execution fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub meta: EventMetadata,
    pub direction: Direction,
    pub amount: Decimal,
    pub close_price: Decimal,
    pub volume_adjusted_price: Decimal,
    pub purchase_price: Decimal,
    pub exchange_fee: Decimal,
    pub slippage: Decimal,
    pub total: Decimal,
    /// funds the portfolio reserved for the order. futures fills post this as margin
    pub allocated_funds: Decimal,
    pub order: Option<FilledOrder>,
    pub liquidated: bool,
    pub fill_dependent_event: Option<Box<SignalEvent>>,
}

impl FillEvent {
    pub fn from_order(order: &OrderEvent) -> Self {
        Self {
            meta: order.meta.clone(),
            direction: order.direction,
            amount: order.amount,
            close_price: order.close_price,
            volume_adjusted_price: order.close_price,
            purchase_price: Decimal::ZERO,
            exchange_fee: Decimal::ZERO,
            slippage: Decimal::ZERO,
            total: Decimal::ZERO,
            allocated_funds: order.allocated_funds,
            order: None,
            liquidated: order.liquidating,
            fill_dependent_event: order.fill_dependent_event.clone(),
        }
    }
}

// 2.5: capability for events that may carry a second leg
pub trait FillDependent {
    fn fill_dependent_event(&self) -> Option<&SignalEvent>;
    fn take_fill_dependent_event(&mut self) -> Option<SignalEvent>;
}

macro_rules! impl_fill_dependent {
    ($($ty:ty),*) => {
        $(impl FillDependent for $ty {
            fn fill_dependent_event(&self) -> Option<&SignalEvent> {
                self.fill_dependent_event.as_deref()
            }

            fn take_fill_dependent_event(&mut self) -> Option<SignalEvent> {
                self.fill_dependent_event.take().map(|ev| *ev)
            }
        })*
    };
}

impl_fill_dependent!(SignalEvent, OrderEvent, FillEvent);

// 2.6: the queue element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Data(DataEvent),
    Signal(SignalEvent),
    Order(OrderEvent),
    Fill(FillEvent),
}

impl Event {
    pub fn meta(&self) -> &EventMetadata {
        match self {
            Event::Data(ev) => &ev.meta,
            Event::Signal(ev) => &ev.meta,
            Event::Order(ev) => &ev.meta,
            Event::Fill(ev) => &ev.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut EventMetadata {
        match self {
            Event::Data(ev) => &mut ev.meta,
            Event::Signal(ev) => &mut ev.meta,
            Event::Order(ev) => &mut ev.meta,
            Event::Fill(ev) => &mut ev.meta,
        }
    }

    pub fn instrument(&self) -> &InstrumentKey {
        &self.meta().instrument
    }

    pub fn offset(&self) -> Offset {
        self.meta().offset
    }

    pub fn time(&self) -> Timestamp {
        self.meta().time
    }

    /// Data events have no direction.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Event::Data(_) => None,
            Event::Signal(ev) => ev.direction,
            Event::Order(ev) => Some(ev.direction),
            Event::Fill(ev) => Some(ev.direction),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Data(_) => "data",
            Event::Signal(_) => "signal",
            Event::Order(_) => "order",
            Event::Fill(_) => "fill",
        }
    }

    pub fn close_price(&self) -> Decimal {
        match self {
            Event::Data(ev) => ev.close,
            Event::Signal(ev) => ev.close_price,
            Event::Order(ev) => ev.close_price,
            Event::Fill(ev) => ev.close_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle() -> DataEvent {
        DataEvent::candle(
            InstrumentKey::spot("binance", "BTC", "USDT"),
            Timestamp::from_millis(1_000),
            Interval::ONE_HOUR,
            [dec!(100), dec!(110), dec!(90), dec!(105), dec!(10)],
        )
    }

    #[test]
    fn reason_trail_joins() {
        let mut meta = candle().meta;
        meta.append_reason("first");
        meta.append_reason("");
        meta.append_reason("second");
        assert_eq!(meta.reason(), "first. second");
    }

    #[test]
    fn fill_dependent_moves_down_the_pipeline() {
        let data = candle();
        let second_leg = SignalEvent::from_data(&data, Direction::Short);
        let signal = SignalEvent::from_data(&data, Direction::Buy).with_fill_dependent_event(second_leg);
        assert!(signal.fill_dependent_event().is_some());

        let order = OrderEvent::from_signal(&signal, Direction::Buy);
        let mut fill = FillEvent::from_order(&order);
        let taken = fill.take_fill_dependent_event().unwrap();
        assert_eq!(taken.direction, Some(Direction::Short));
        assert!(fill.fill_dependent_event().is_none());
    }

    #[test]
    fn event_accessors() {
        let ev = Event::Data(candle());
        assert_eq!(ev.kind(), "data");
        assert_eq!(ev.direction(), None);
        assert_eq!(ev.close_price(), dec!(105));
        assert_eq!(ev.time(), Timestamp::from_millis(1_000));
    }

    #[test]
    fn close_position_orders_are_flagged() {
        let data = candle();
        let signal = SignalEvent::from_data(&data, Direction::ClosePosition);
        let order = OrderEvent::from_signal(&signal, Direction::ClosePosition);
        assert!(order.closing_position);
        assert!(!order.liquidating);
    }
}
