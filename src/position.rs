// 4.0: futures position tracking. pnl = size * (price - entry).
// 4.1 has increase/reduce logic, 4.2 the margin figures the liquidation check compares against.

use crate::events::FilledOrder;
use crate::types::{Direction, Leverage, Price, Quote, SignedSize, Timestamp};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Unopened,
    Open,
    Closed,
    Liquidated,
}

/// One point in a position's pnl history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlResult {
    pub time: Timestamp,
    pub price: Decimal,
    pub exposure: SignedSize,
    pub unrealised_pnl: Quote,
    pub realised_pnl: Quote,
    pub is_order: bool,
    pub is_liquidated: bool,
    pub status: PositionStatus,
}

impl Default for PnlResult {
    fn default() -> Self {
        Self {
            time: Timestamp::default(),
            price: Decimal::ZERO,
            exposure: SignedSize::zero(),
            unrealised_pnl: Quote::zero(),
            realised_pnl: Quote::zero(),
            is_order: false,
            is_liquidated: false,
            status: PositionStatus::Unopened,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesPosition {
    pub size: SignedSize,
    pub entry_price: Price,
    pub leverage: Leverage,
    /// collateral posted against this position
    pub margin: Quote,
    pub realised_pnl: Quote,
    pub unrealised_pnl: Quote,
    pub status: PositionStatus,
    pub opened_at: Timestamp,
    pub updated_at: Timestamp,
    pub orders: Vec<FilledOrder>,
    pub pnl_history: Vec<PnlResult>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionUpdate {
    pub realised_pnl: Quote,
    pub margin_released: Quote,
    pub closed: bool,
    /// order amount left over after the position went flat
    pub overflow: Decimal,
}

impl FuturesPosition {
    pub fn open(order: &FilledOrder, direction: Direction, margin: Quote) -> Self {
        let mut position = Self {
            size: SignedSize::from_direction(direction, order.amount),
            entry_price: Price::new_unchecked(order.price),
            leverage: order.leverage,
            margin,
            realised_pnl: Quote::zero(),
            unrealised_pnl: Quote::zero(),
            status: PositionStatus::Open,
            opened_at: order.date,
            updated_at: order.date,
            orders: vec![order.clone()],
            pnl_history: Vec::new(),
        };
        position.record(order.date, order.price, true);
        position
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn direction(&self) -> Option<Direction> {
        self.size.direction()
    }

    pub fn notional_value(&self, price: Decimal) -> Decimal {
        self.size.abs() * price
    }

    pub fn latest_pnl(&self) -> Option<&PnlResult> {
        self.pnl_history.last()
    }

    fn record(&mut self, time: Timestamp, price: Decimal, is_order: bool) -> PnlResult {
        let result = PnlResult {
            time,
            price,
            exposure: self.size,
            unrealised_pnl: self.unrealised_pnl,
            realised_pnl: self.realised_pnl,
            is_order,
            is_liquidated: self.status == PositionStatus::Liquidated,
            status: self.status,
        };
        // one entry per time, orders overwrite the price tick they happened on
        match self.pnl_history.last_mut() {
            Some(last) if last.time == time => *last = result.clone(),
            _ => self.pnl_history.push(result.clone()),
        }
        result
    }

    // 4.1: adds to the position. averages the entry price
    pub fn increase(&mut self, order: &FilledOrder, margin: Quote) {
        debug_assert!(self.is_open());
        let old_abs = self.size.abs();
        let new_abs = old_abs + order.amount;
        if new_abs > Decimal::ZERO {
            let weighted = old_abs * self.entry_price.value() + order.amount * order.price;
            self.entry_price = Price::new_unchecked(weighted / new_abs);
        }
        self.size = SignedSize::new(self.size.value().signum() * new_abs);
        self.margin = self.margin.add(margin);
        self.updated_at = order.date;
        self.orders.push(order.clone());
        self.unrealised_pnl =
            calculate_unrealized_pnl(self.size, self.entry_price, Price::new_unchecked(order.price));
        self.record(order.date, order.price, true);
    }

    pub fn reduce(&mut self, order: &FilledOrder) -> PositionUpdate {
        debug_assert!(self.is_open());
        let position_abs = self.size.abs();
        let reduce_amount = order.amount.min(position_abs);
        let overflow = order.amount - reduce_amount;

        let close_size = SignedSize::new(self.size.value().signum() * reduce_amount);
        let price = Price::new_unchecked(order.price);
        let realised = calculate_realized_pnl(close_size, self.entry_price, price);

        let fraction = if position_abs.is_zero() {
            Decimal::ONE
        } else {
            reduce_amount / position_abs
        };
        let margin_released = Quote::new(self.margin.value() * fraction);
        self.margin = self.margin.sub(margin_released);

        let remaining = position_abs - reduce_amount;
        self.size = SignedSize::new(self.size.value().signum() * remaining);
        self.realised_pnl = self.realised_pnl.add(realised);
        self.updated_at = order.date;
        self.orders.push(order.clone());

        let closed = self.size.is_zero();
        if closed {
            self.status = PositionStatus::Closed;
            self.unrealised_pnl = Quote::zero();
        } else {
            self.unrealised_pnl = calculate_unrealized_pnl(self.size, self.entry_price, price);
        }
        self.record(order.date, order.price, true);

        PositionUpdate {
            realised_pnl: realised,
            margin_released,
            closed,
            overflow,
        }
    }

    pub fn update_unrealised(&mut self, price: Price, time: Timestamp) -> PnlResult {
        if self.is_open() {
            self.unrealised_pnl = calculate_unrealized_pnl(self.size, self.entry_price, price);
            self.updated_at = time;
        }
        self.record(time, price.value(), false)
    }

    /// Forced close. size is kept until the closing order fills so it can be sized from here.
    pub fn liquidate(&mut self, price: Decimal, time: Timestamp) -> PnlResult {
        self.status = PositionStatus::Liquidated;
        self.record(time, price, false)
    }

    pub fn settle_liquidation(&mut self, order: &FilledOrder) {
        self.size = SignedSize::zero();
        self.margin = Quote::zero();
        self.unrealised_pnl = Quote::zero();
        self.orders.push(order.clone());
        self.record(order.date, order.price, true);
    }
}

// 4.3: the pnl formula. size * (mark - entry)
pub fn calculate_unrealized_pnl(size: SignedSize, entry_price: Price, mark_price: Price) -> Quote {
    Quote::new(size.value() * (mark_price.value() - entry_price.value()))
}

pub fn calculate_realized_pnl(close_size: SignedSize, entry_price: Price, exit_price: Price) -> Quote {
    Quote::new(close_size.value() * (exit_price.value() - entry_price.value()))
}

// 4.2: IM = notional / leverage, MM = IM * ratio
pub fn initial_margin(size: SignedSize, price: Decimal, leverage: Leverage) -> Quote {
    Quote::new(size.abs() * price * leverage.initial_margin_fraction())
}

pub fn maintenance_margin(size: SignedSize, price: Decimal, leverage: Leverage, ratio: Decimal) -> Quote {
    Quote::new(initial_margin(size, price, leverage).value() * ratio)
}
