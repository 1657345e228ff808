// 6.1: holdings ledger. one snapshot of funds and position per instrument per offset.

use super::{Portfolio, PortfolioError};
use crate::events::{DataEvent, EventMetadata, FillEvent};
use crate::funding::FundReader;
use crate::types::{Direction, InstrumentKey, Interval, Offset, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub offset: Offset,
    pub instrument: InstrumentKey,
    pub timestamp: Timestamp,
    pub interval: Interval,
    pub price: Decimal,

    pub base_initial_funds: Decimal,
    pub base_size: Decimal,
    pub base_value: Decimal,
    /// quote (or collateral) funds at start
    pub initial_funds: Decimal,
    /// quote (or collateral) funds available now
    pub remaining_funds: Decimal,

    pub bought_amount: Decimal,
    pub bought_value: Decimal,
    pub sold_amount: Decimal,
    pub sold_value: Decimal,
    pub total_fees: Decimal,

    pub total_initial_value: Decimal,
    pub total_value: Decimal,
    pub change_in_total_value_percent: Decimal,
    pub is_liquidated: bool,
}

impl Holding {
    pub fn new<F: FundReader + ?Sized>(meta: &EventMetadata, price: Decimal, funds: &F) -> Self {
        let mut holding = Holding {
            instrument: meta.instrument.clone(),
            base_initial_funds: funds.base_initial_funds(),
            initial_funds: funds.quote_initial_funds(),
            ..Holding::default()
        };
        holding.total_initial_value = if funds.is_collateral() {
            holding.initial_funds
        } else {
            holding.base_initial_funds * price + holding.initial_funds
        };
        holding.move_to(meta);
        holding.update_value(price, funds);
        holding
    }

    pub fn move_to(&mut self, meta: &EventMetadata) {
        self.offset = meta.offset;
        self.timestamp = meta.time;
        self.interval = meta.interval;
    }

    pub fn update_value<F: FundReader + ?Sized>(&mut self, price: Decimal, funds: &F) {
        self.price = price;
        self.base_size = funds.base_available();
        self.remaining_funds = funds.quote_available();
        self.base_value = self.base_size * price;
        // collateral value is the funds; contracts are exposure, not holdings
        self.total_value = if funds.is_collateral() {
            self.remaining_funds
        } else {
            self.base_value + self.remaining_funds
        };
        if self.total_initial_value > Decimal::ZERO {
            self.change_in_total_value_percent =
                (self.total_value - self.total_initial_value) / self.total_initial_value * dec!(100);
        }
    }

    pub fn update_from_fill<F: FundReader + ?Sized>(&mut self, fill: &FillEvent, funds: &F) {
        self.move_to(&fill.meta);
        if let Some(order) = &fill.order {
            match order.direction {
                Direction::Buy | Direction::Long => {
                    self.bought_amount += order.amount;
                    self.bought_value += order.cost();
                }
                Direction::Sell | Direction::Short | Direction::ClosePosition => {
                    self.sold_amount += order.amount;
                    self.sold_value += order.cost();
                }
                _ => {}
            }
            self.total_fees += order.fee;
        }
        self.is_liquidated |= fill.liquidated;
        let price = if fill.purchase_price > Decimal::ZERO {
            fill.purchase_price
        } else {
            fill.close_price
        };
        self.update_value(price, funds);
    }
}

impl Portfolio {
    // 6.1.1: insert mode rejects a duplicate offset, overwrite mode needs one
    pub fn set_holdings_for_offset(&mut self, holding: Holding, overwrite: bool) -> Result<(), PortfolioError> {
        if holding.timestamp.is_unset() {
            return Err(PortfolioError::HoldingsNoTimestamp);
        }
        let settings = self.settings_mut(&holding.instrument)?;
        // kept in offset order, new ticks land on the tail
        let holdings = &mut settings.holdings;
        let existing = match holdings.last() {
            Some(last) if last.offset < holding.offset => Err(holdings.len()),
            _ => holdings.binary_search_by_key(&holding.offset, |h| h.offset),
        };
        match (existing, overwrite) {
            (Ok(i), true) => holdings[i] = holding,
            (Err(_), true) => return Err(PortfolioError::NoHoldings),
            (Ok(_), false) => return Err(PortfolioError::HoldingsAlreadySet(holding.offset)),
            (Err(at), false) => holdings.insert(at, holding),
        }
        Ok(())
    }

    // overwrite first, insert on the one error that means "nothing to overwrite"
    fn store_holding(&mut self, holding: Holding) -> Result<(), PortfolioError> {
        match self.set_holdings_for_offset(holding.clone(), true) {
            Err(PortfolioError::NoHoldings) => self.set_holdings_for_offset(holding, false),
            other => other,
        }
    }

    /// Revalue the instrument's holding at the new price.
    pub fn update_holdings<F: FundReader + ?Sized>(&mut self, ev: &DataEvent, funds: &F) -> Result<Holding, PortfolioError> {
        let settings = self.settings(&ev.meta.instrument)?;
        let holding = match settings.holdings.last() {
            Some(latest) => {
                let mut h = latest.clone();
                h.move_to(&ev.meta);
                h.update_value(ev.close, funds);
                h
            }
            None => Holding::new(&ev.meta, ev.close, funds),
        };
        self.store_holding(holding.clone())?;
        Ok(holding)
    }

    /// Settle a fill into holdings and compliance.
    pub fn on_fill<F: FundReader + ?Sized>(&mut self, fill: &FillEvent, funds: &F) -> Result<Holding, PortfolioError> {
        let settings = self.settings(&fill.meta.instrument)?;
        let mut holding = match settings.holdings.last() {
            Some(latest) => latest.clone(),
            None => Holding::new(&fill.meta, fill.close_price, funds),
        };
        holding.update_from_fill(fill, funds);
        self.store_holding(holding.clone())?;

        let settings = self.settings_mut(&fill.meta.instrument)?;
        let snapshot = settings.compliance.snapshot_for_fill(fill);
        if let Err(err) = settings.compliance.add_snapshot(snapshot) {
            error!(instrument = %fill.meta.instrument, offset = fill.meta.offset, error = %err, "compliance snapshot rejected");
        }
        Ok(holding)
    }

    pub fn latest_holdings(&self, key: &InstrumentKey) -> Option<&Holding> {
        self.settings.get(key).and_then(|s| s.holdings.last())
    }

    pub fn holding_at_offset(&self, key: &InstrumentKey, offset: Offset) -> Option<&Holding> {
        self.settings
            .get(key)
            .and_then(|s| s.holdings.iter().find(|h| h.offset == offset))
    }

    pub fn holdings(&self, key: &InstrumentKey) -> &[Holding] {
        self.settings.get(key).map(|s| s.holdings.as_slice()).unwrap_or(&[])
    }

    pub fn latest_holdings_for_all(&self) -> Vec<Holding> {
        self.settings
            .values()
            .filter_map(|s| s.holdings.last().cloned())
            .collect()
    }
}
