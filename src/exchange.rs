//! Simulated order execution.
//!
//! An [`Executor`] turns an order into a fill. The fill is produced even when
//! execution fails: [`ExecutionFailure`] owns it, so callers always have
//! something to record downstream.

use crate::data::DataHandler;
use crate::events::{FillEvent, FilledOrder, OrderEvent};
use crate::funding::{FundReleaser, FundingError};
use crate::types::{CurrencyCode, Direction, InstrumentKey, Leverage};
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("cannot transact a {0} order")]
    CannotTransact(Direction),

    #[error("no exchange settings for {0}")]
    SettingsNotFound(InstrumentKey),

    #[error("no data for {0}")]
    NoData(InstrumentKey),

    #[error("order for {0} fitted to zero amount")]
    ZeroAmount(InstrumentKey),

    #[error("funding error: {0}")]
    Funding(#[from] FundingError),
}

/// Failed execution. the fill is still there to be recorded.
#[derive(Debug, Clone, Error)]
#[error("{source}")]
pub struct ExecutionFailure {
    pub fill: Box<FillEvent>,
    pub source: ExchangeError,
}

impl ExecutionFailure {
    pub fn new(fill: FillEvent, source: ExchangeError) -> Self {
        Self {
            fill: Box::new(fill),
            source,
        }
    }

    pub fn is_cannot_transact(&self) -> bool {
        matches!(self.source, ExchangeError::CannotTransact(_))
    }
}

/// Size limits for one side of the book. zero means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMax {
    pub minimum_size: Decimal,
    pub maximum_size: Decimal,
    pub maximum_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeverageSettings {
    pub can_use_leverage: bool,
    pub maximum_leverage: Decimal,
}

impl Default for LeverageSettings {
    fn default() -> Self {
        Self {
            can_use_leverage: false,
            maximum_leverage: Decimal::ONE,
        }
    }
}

// 7.0: per-instrument execution settings: fee, slippage bounds, leverage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSettings {
    pub instrument: InstrumentKey,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    /// percent, 0.5 = 0.5%
    pub min_slippage_percent: Decimal,
    pub max_slippage_percent: Decimal,
    pub buy_side: MinMax,
    pub sell_side: MinMax,
    pub leverage: LeverageSettings,
    pub skip_candle_volume_fitting: bool,
    pub collateral_currency: Option<CurrencyCode>,
}

impl ExchangeSettings {
    pub fn new(instrument: InstrumentKey) -> Self {
        Self {
            instrument,
            maker_fee: dec!(0.001),
            taker_fee: dec!(0.002),
            min_slippage_percent: Decimal::ZERO,
            max_slippage_percent: Decimal::ZERO,
            buy_side: MinMax::default(),
            sell_side: MinMax::default(),
            leverage: LeverageSettings::default(),
            skip_candle_volume_fitting: false,
            collateral_currency: None,
        }
    }

    pub fn order_leverage(&self) -> Leverage {
        if self.leverage.can_use_leverage {
            Leverage::new(self.leverage.maximum_leverage).unwrap_or_default()
        } else {
            Leverage::one()
        }
    }

    pub fn side_limits(&self, direction: Direction) -> &MinMax {
        if direction.is_buy_side() {
            &self.buy_side
        } else {
            &self.sell_side
        }
    }

    // deterministic midpoint of the configured band
    pub fn slippage_rate(&self) -> Decimal {
        (self.min_slippage_percent + self.max_slippage_percent) / dec!(2) / dec!(100)
    }
}

// 7.1: the execution seam
pub trait Executor: Send {
    fn currency_settings(&self, key: &InstrumentKey) -> Result<&ExchangeSettings, ExchangeError>;

    fn execute_order(
        &mut self,
        order: &OrderEvent,
        data: &DataHandler,
        funds: &mut dyn FundReleaser,
    ) -> Result<FillEvent, ExecutionFailure>;

    /// Currency realised futures pnl is paid in.
    fn realised_pnl_currency(&self, key: &InstrumentKey) -> Result<CurrencyCode, ExchangeError>;

    fn reset(&mut self);
}

#[derive(Debug, Default)]
pub struct SimulatedExchange {
    settings: BTreeMap<InstrumentKey, ExchangeSettings>,
    next_order_id: u64,
}

impl SimulatedExchange {
    pub fn new() -> Self {
        Self {
            settings: BTreeMap::new(),
            next_order_id: 1,
        }
    }

    pub fn add_settings(&mut self, settings: ExchangeSettings) {
        self.settings.insert(settings.instrument.clone(), settings);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }
}

// hand back what the portfolio reserved for an order that will never fill
fn return_reservation(order: &OrderEvent, funds: &mut dyn FundReleaser) {
    if order.allocated_funds <= Decimal::ZERO {
        return;
    }
    let side = match (order.direction.is_buy_side(), funds.is_collateral()) {
        (true, false) => Direction::Buy,
        (false, false) => Direction::Sell,
        (true, true) => Direction::Long,
        (false, true) => Direction::Short,
    };
    if let Err(err) = funds.release(order.allocated_funds, order.allocated_funds, side) {
        warn!(instrument = %order.meta.instrument, error = %err, "could not return reservation");
    }
}

impl Executor for SimulatedExchange {
    fn currency_settings(&self, key: &InstrumentKey) -> Result<&ExchangeSettings, ExchangeError> {
        self.settings
            .get(key)
            .ok_or_else(|| ExchangeError::SettingsNotFound(key.clone()))
    }

    fn execute_order(
        &mut self,
        order: &OrderEvent,
        data: &DataHandler,
        funds: &mut dyn FundReleaser,
    ) -> Result<FillEvent, ExecutionFailure> {
        let mut fill = FillEvent::from_order(order);
        let key = order.meta.instrument.clone();

        if !order.direction.is_actionable() {
            return_reservation(order, funds);
            return Err(ExecutionFailure::new(fill, ExchangeError::CannotTransact(order.direction)));
        }

        let Some(latest) = data.latest() else {
            return_reservation(order, funds);
            return Err(ExecutionFailure::new(fill, ExchangeError::NoData(key)));
        };
        fill.close_price = latest.close;

        // forced closes fill at the close with no fee. funding was already zeroed
        if order.liquidating {
            let id = self.next_id();
            fill.purchase_price = latest.close;
            fill.volume_adjusted_price = latest.close;
            fill.total = latest.close * order.amount;
            fill.order = Some(FilledOrder {
                id,
                direction: order.direction,
                price: latest.close,
                amount: order.amount,
                fee: Decimal::ZERO,
                leverage: order.leverage,
                date: order.meta.time,
            });
            return Ok(fill);
        }

        let settings = match self.settings.get(&key) {
            Some(s) => s.clone(),
            None => {
                return_reservation(order, funds);
                return Err(ExecutionFailure::new(fill, ExchangeError::SettingsNotFound(key)));
            }
        };

        // 7.2: fit the order into the candle
        let mut amount = order.amount;
        if !settings.skip_candle_volume_fitting && !key.is_futures() && latest.volume > Decimal::ZERO {
            amount = amount.min(latest.volume);
        }
        let adjusted = latest.close.max(latest.low).min(if latest.high > Decimal::ZERO {
            latest.high
        } else {
            latest.close
        });
        fill.volume_adjusted_price = adjusted;

        let buying = match order.direction {
            Direction::ClosePosition => funds
                .collateral_releaser()
                .map(|c| c.exposure().is_short())
                .unwrap_or(false),
            d => d.is_buy_side(),
        };
        let rate = settings.slippage_rate();
        let price = if buying {
            adjusted * (Decimal::ONE + rate)
        } else {
            adjusted * (Decimal::ONE - rate)
        };
        let fee_rate = settings.taker_fee;

        match order.direction {
            Direction::Buy => {
                let mut cost = price * amount * (Decimal::ONE + fee_rate);
                if cost > order.allocated_funds {
                    amount = (order.allocated_funds / (price * (Decimal::ONE + fee_rate)))
                        .round_dp_with_strategy(8, RoundingStrategy::ToZero);
                    cost = price * amount * (Decimal::ONE + fee_rate);
                }
                if amount <= Decimal::ZERO {
                    return_reservation(order, funds);
                    return Err(ExecutionFailure::new(fill, ExchangeError::ZeroAmount(key)));
                }
                if let Err(err) = funds.release(order.allocated_funds, order.allocated_funds - cost, Direction::Buy) {
                    return Err(ExecutionFailure::new(fill, err.into()));
                }
                funds.increase_available(amount, Direction::Buy);
            }
            Direction::Sell => {
                if amount <= Decimal::ZERO {
                    return_reservation(order, funds);
                    return Err(ExecutionFailure::new(fill, ExchangeError::ZeroAmount(key)));
                }
                if let Err(err) = funds.release(order.allocated_funds, order.allocated_funds - amount, Direction::Sell) {
                    return Err(ExecutionFailure::new(fill, err.into()));
                }
                funds.increase_available(price * amount * (Decimal::ONE - fee_rate), Direction::Sell);
            }
            // futures margin stays posted; the portfolio moves contracts and margin on the fill
            _ => {}
        }

        let fee = price * amount * fee_rate;
        let id = self.next_id();
        fill.amount = amount;
        fill.purchase_price = price;
        fill.exchange_fee = fee;
        fill.slippage = rate * dec!(100);
        fill.total = if buying { price * amount + fee } else { price * amount - fee };
        fill.order = Some(FilledOrder {
            id,
            direction: order.direction,
            price,
            amount,
            fee,
            leverage: order.leverage,
            date: order.meta.time,
        });
        Ok(fill)
    }

    fn realised_pnl_currency(&self, key: &InstrumentKey) -> Result<CurrencyCode, ExchangeError> {
        let settings = self.currency_settings(key)?;
        Ok(settings
            .collateral_currency
            .clone()
            .unwrap_or_else(|| key.pair.quote.clone()))
    }

    fn reset(&mut self) {
        self.next_order_id = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DataEvent, SignalEvent};
    use crate::funding::{FundManager, FundReader, FundingManager};
    use crate::types::{Interval, Timestamp};

    fn key() -> InstrumentKey {
        InstrumentKey::spot("binance", "BTC", "USDT")
    }

    fn handler() -> DataHandler {
        let candle = DataEvent::candle(
            key(),
            Timestamp::from_millis(60_000),
            Interval::ONE_MINUTE,
            [dec!(100), dec!(110), dec!(90), dec!(100), dec!(1000)],
        );
        let mut h = DataHandler::with_stream(key(), Interval::ONE_MINUTE, vec![candle]);
        h.next();
        h
    }

    fn order(direction: Direction, amount: Decimal, allocated: Decimal) -> OrderEvent {
        let data = handler().latest().cloned().unwrap();
        let mut o = OrderEvent::from_signal(&SignalEvent::from_data(&data, direction), direction);
        o.amount = amount;
        o.allocated_funds = allocated;
        o
    }

    fn exchange() -> SimulatedExchange {
        let mut ex = SimulatedExchange::new();
        let mut settings = ExchangeSettings::new(key());
        settings.taker_fee = dec!(0.01);
        ex.add_settings(settings);
        ex
    }

    #[test]
    fn buy_settles_funds() {
        let mut funding = FundManager::new();
        funding.add_spot(key(), dec!(0), dec!(1000));
        funding.reserver(&key()).unwrap().reserve(dec!(505), Direction::Buy).unwrap();

        let mut ex = exchange();
        let fill = ex
            .execute_order(&order(Direction::Buy, dec!(5), dec!(505)), &handler(), funding.releaser(&key()).unwrap())
            .unwrap();
        assert_eq!(fill.amount, dec!(5));
        assert_eq!(fill.exchange_fee, dec!(5));
        assert_eq!(fill.total, dec!(505));
        let reader = funding.funding_for_event(&key()).unwrap();
        assert_eq!(reader.base_available(), dec!(5));
        assert_eq!(reader.quote_available(), dec!(495));
    }

    #[test]
    fn sell_settles_funds() {
        let mut funding = FundManager::new();
        funding.add_spot(key(), dec!(2), dec!(0));
        funding.reserver(&key()).unwrap().reserve(dec!(2), Direction::Sell).unwrap();

        let mut ex = exchange();
        let fill = ex
            .execute_order(&order(Direction::Sell, dec!(2), dec!(2)), &handler(), funding.releaser(&key()).unwrap())
            .unwrap();
        assert_eq!(fill.total, dec!(198));
        let reader = funding.funding_for_event(&key()).unwrap();
        assert_eq!(reader.base_available(), dec!(0));
        assert_eq!(reader.quote_available(), dec!(198));
    }

    #[test]
    fn failed_execution_still_has_a_fill() {
        let mut funding = FundManager::new();
        funding.add_spot(key(), dec!(0), dec!(1000));
        let mut ex = exchange();

        let err = ex
            .execute_order(&order(Direction::CouldNotBuy, dec!(0), dec!(0)), &handler(), funding.releaser(&key()).unwrap())
            .unwrap_err();
        assert!(err.is_cannot_transact());
        assert_eq!(err.fill.direction, Direction::CouldNotBuy);
        assert!(err.fill.order.is_none());
    }

    #[test]
    fn refused_orders_return_their_reservation() {
        let mut funding = FundManager::new();
        funding.add_spot(key(), dec!(0), dec!(1000));
        funding.reserver(&key()).unwrap().reserve(dec!(300), Direction::Buy).unwrap();
        let mut ex = exchange();

        let refused = order(Direction::CouldNotBuy, dec!(3), dec!(300));
        let _ = ex.execute_order(&refused, &handler(), funding.releaser(&key()).unwrap());
        assert_eq!(funding.funding_for_event(&key()).unwrap().quote_available(), dec!(1000));
    }

    #[test]
    fn missing_settings_fail_with_fill() {
        let mut funding = FundManager::new();
        funding.add_spot(key(), dec!(1), dec!(0));
        funding.reserver(&key()).unwrap().reserve(dec!(1), Direction::Sell).unwrap();
        let mut ex = SimulatedExchange::new();

        let err = ex
            .execute_order(&order(Direction::Sell, dec!(1), dec!(1)), &handler(), funding.releaser(&key()).unwrap())
            .unwrap_err();
        assert!(matches!(err.source, ExchangeError::SettingsNotFound(_)));
        assert_eq!(err.fill.meta.instrument, key());
    }

    #[test]
    fn realised_currency_defaults_to_quote() {
        let ex = exchange();
        assert_eq!(ex.realised_pnl_currency(&key()).unwrap(), CurrencyCode::new("USDT"));
    }
}
