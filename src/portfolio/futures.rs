// 6.3: futures tracking, pnl and liquidation.
// one FuturesTracker per futures instrument. the last position in the list is the live one;
// closed and liquidated positions stay for the record.

use super::{Portfolio, PortfolioError};
use crate::events::{DataEvent, EventMetadata, FillEvent, OrderEvent, SignalEvent};
use crate::funding::{CollateralReader, CollateralReleaser, FundingManager};
use crate::position::{maintenance_margin, FuturesPosition, PnlResult, PositionStatus};
use crate::types::{CurrencyCode, Direction, InstrumentKey, Offset, Price, Quote};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct FuturesTracker {
    pub collateral_currency: CurrencyCode,
    positions: Vec<FuturesPosition>,
}

impl FuturesTracker {
    pub fn new(collateral_currency: CurrencyCode) -> Self {
        Self {
            collateral_currency,
            positions: Vec::new(),
        }
    }

    pub fn positions(&self) -> &[FuturesPosition] {
        &self.positions
    }

    pub fn latest(&self) -> Option<&FuturesPosition> {
        self.positions.last()
    }

    fn open_position_mut(&mut self) -> Option<&mut FuturesPosition> {
        self.positions.last_mut().filter(|p| p.is_open())
    }

    pub fn open_position(&self) -> Option<&FuturesPosition> {
        self.positions.last().filter(|p| p.is_open())
    }
}

/// Latest pnl for one futures instrument, as recorded by statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSummary {
    pub instrument: InstrumentKey,
    pub collateral_currency: CurrencyCode,
    pub offset: Offset,
    pub result: PnlResult,
}

impl PnlSummary {
    pub fn is_liquidated(&self) -> bool {
        self.result.is_liquidated
    }

    /// Flip to liquidated. returns false if it already was.
    pub fn mark_liquidated(&mut self) -> bool {
        if self.result.is_liquidated {
            return false;
        }
        self.result.is_liquidated = true;
        self.result.status = PositionStatus::Liquidated;
        true
    }
}

/// What a futures fill did to the position.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOrder {
    pub summary: PnlSummary,
    /// pnl realised by this order net of its fee
    pub realised: Quote,
}

impl Portfolio {
    fn tracker_mut(&mut self, key: &InstrumentKey) -> Result<&mut FuturesTracker, PortfolioError> {
        self.settings_mut(key)?
            .futures
            .as_mut()
            .ok_or_else(|| PortfolioError::NotFutures(key.clone()))
    }

    pub fn tracker(&self, key: &InstrumentKey) -> Result<&FuturesTracker, PortfolioError> {
        self.settings(key)?
            .futures
            .as_ref()
            .ok_or_else(|| PortfolioError::NotFutures(key.clone()))
    }

    // 6.3.1: apply a filled futures order to the position and the collateral
    pub fn track_futures_order(
        &mut self,
        fill: &FillEvent,
        collateral: &mut dyn CollateralReleaser,
    ) -> Result<TrackedOrder, PortfolioError> {
        let key = fill.meta.instrument.clone();
        let Some(order) = fill.order.as_ref() else {
            return Err(PortfolioError::NoOrder(key));
        };
        let tracker = self.tracker_mut(&key)?;

        // funding was zeroed when the liquidation fired; just settle the book
        if fill.liquidated {
            if let Some(pos) = tracker.positions.last_mut() {
                pos.settle_liquidation(order);
            }
            let summary = self.latest_pnl_for_event(&fill.meta)?;
            return Ok(TrackedOrder {
                summary,
                realised: Quote::zero(),
            });
        }

        let mut realised = Quote::zero();
        let mut margin_to_release = Quote::zero();
        match (order.direction, tracker.open_position_mut()) {
            (Direction::ClosePosition, Some(pos)) => {
                let update = pos.reduce(order);
                realised = update.realised_pnl;
                margin_to_release = update.margin_released;
            }
            (Direction::ClosePosition, None) => return Err(PortfolioError::PositionNotFound(key)),
            (Direction::Long | Direction::Short, None) => {
                tracker
                    .positions
                    .push(FuturesPosition::open(order, order.direction, Quote::new(fill.allocated_funds)));
            }
            (Direction::Long | Direction::Short, Some(pos)) => {
                let same_side = pos.direction() == Some(order.direction);
                if same_side {
                    pos.increase(order, Quote::new(fill.allocated_funds));
                } else {
                    let update = pos.reduce(order);
                    realised = update.realised_pnl;
                    margin_to_release = update.margin_released;

                    // the part of the posted margin that backs the flipped remainder stays reserved
                    let kept = if order.amount > Decimal::ZERO {
                        fill.allocated_funds * update.overflow / order.amount
                    } else {
                        Decimal::ZERO
                    };
                    margin_to_release = margin_to_release.add(Quote::new(fill.allocated_funds - kept));
                    if update.overflow > Decimal::ZERO {
                        let mut remainder = order.clone();
                        remainder.amount = update.overflow;
                        remainder.fee = Decimal::ZERO;
                        tracker
                            .positions
                            .push(FuturesPosition::open(&remainder, order.direction, Quote::new(kept)));
                    }
                }
            }
            (other, _) => return Err(PortfolioError::InvalidDirection(Some(other))),
        }

        collateral.update_contracts(order.direction, order.amount)?;
        if !margin_to_release.is_zero() {
            collateral.release_margin(margin_to_release.value());
        }

        let realised = realised.sub(Quote::new(order.fee));
        debug!(instrument = %key, direction = %order.direction, amount = %order.amount, realised = %realised.value(), "futures order tracked");
        let summary = self.latest_pnl_for_event(&fill.meta)?;
        Ok(TrackedOrder { summary, realised })
    }

    // 6.3.2: mark the live position to the new close
    pub fn update_pnl(&mut self, ev: &DataEvent) -> Result<(), PortfolioError> {
        let key = &ev.meta.instrument;
        let tracker = self.tracker_mut(key)?;
        let Some(pos) = tracker.positions.last_mut() else {
            return Err(PortfolioError::PositionNotFound(key.clone()));
        };
        if !pos.is_open() {
            return Ok(());
        }
        let price = Price::new(ev.close).ok_or(PortfolioError::InvalidPrice(ev.close))?;
        pos.update_unrealised(price, ev.meta.time);
        Ok(())
    }

    pub fn latest_pnl_for_event(&self, meta: &EventMetadata) -> Result<PnlSummary, PortfolioError> {
        let tracker = self.tracker(&meta.instrument)?;
        let result = tracker
            .latest()
            .and_then(FuturesPosition::latest_pnl)
            .cloned()
            .unwrap_or_default();
        Ok(PnlSummary {
            instrument: meta.instrument.clone(),
            collateral_currency: tracker.collateral_currency.clone(),
            offset: meta.offset,
            result,
        })
    }

    pub fn latest_pnls(&self) -> Vec<PnlSummary> {
        self.settings
            .iter()
            .filter_map(|(key, s)| {
                let tracker = s.futures.as_ref()?;
                let pos = tracker.latest()?;
                let holding_offset = s.holdings.last().map(|h| h.offset).unwrap_or_default();
                Some(PnlSummary {
                    instrument: key.clone(),
                    collateral_currency: tracker.collateral_currency.clone(),
                    offset: holding_offset,
                    result: pos.latest_pnl().cloned().unwrap_or_default(),
                })
            })
            .collect()
    }

    // 6.3.3: equity = collateral (free and posted) + unrealised of every open position on it
    pub fn check_liquidation_status(
        &self,
        ev: &DataEvent,
        collateral: &dyn CollateralReader,
        summary: &PnlSummary,
    ) -> Result<(), PortfolioError> {
        if summary.is_liquidated() {
            return Ok(());
        }
        let key = &ev.meta.instrument;
        let mut unrealised = Decimal::ZERO;
        let mut maintenance = Decimal::ZERO;
        let mut any_open = false;
        for (k, s) in &self.settings {
            if !k.same_exchange(key) {
                continue;
            }
            let Some(tracker) = s.futures.as_ref() else {
                continue;
            };
            if &tracker.collateral_currency != collateral.collateral_currency() {
                continue;
            }
            let Some(pos) = tracker.open_position() else {
                continue;
            };
            any_open = true;
            // this instrument marks at the new close, the rest at their last mark
            let mark = if k == key {
                ev.close
            } else {
                pos.latest_pnl().map(|r| r.price).unwrap_or(pos.entry_price.value())
            };
            unrealised += pos.size.value() * (mark - pos.entry_price.value());
            maintenance += maintenance_margin(pos.size, mark, pos.leverage, self.maintenance_margin_ratio).value();
        }
        if !any_open {
            return Ok(());
        }

        let equity = collateral.available_collateral() + collateral.reserved_collateral() + unrealised;
        if equity <= maintenance {
            warn!(instrument = %key, equity = %equity, maintenance = %maintenance, "collateral below maintenance margin");
            return Err(PortfolioError::PositionLiquidated(key.clone()));
        }
        Ok(())
    }

    // 6.3.4: every open position on the exchange gets a forced close.
    // each order sits on its instrument's latest tick, the one the sweep records a price for
    pub fn create_liquidation_orders_for_exchange(
        &mut self,
        ev: &DataEvent,
        latest_ticks: &[DataEvent],
        funding: &dyn FundingManager,
    ) -> Result<Vec<OrderEvent>, PortfolioError> {
        let exchange = &ev.meta.instrument;
        let mut orders = Vec::new();
        for (key, settings) in self.settings.iter_mut() {
            if !key.same_exchange(exchange) {
                continue;
            }
            let tick = if key == exchange {
                Some(ev)
            } else {
                latest_ticks.iter().find(|t| &t.meta.instrument == key)
            };
            let (offset, interval, price) = match (tick, settings.holdings.last()) {
                (Some(tick), _) => (tick.meta.offset, tick.meta.interval, tick.close),
                (None, Some(latest)) => (latest.offset, latest.interval, latest.price),
                (None, None) => continue,
            };
            let mut meta = EventMetadata::new(key.clone(), offset, ev.meta.time, interval);
            meta.append_reason("liquidated");

            if let Some(tracker) = settings.futures.as_mut() {
                let Some(pos) = tracker.open_position_mut() else {
                    continue;
                };
                let amount = pos.size.abs();
                if amount.is_zero() {
                    continue;
                }
                pos.liquidate(price, ev.meta.time);
                orders.push(liquidation_order(meta, Direction::ClosePosition, price, amount));
                continue;
            }

            let base = match funding.funding_for_event(key) {
                Ok(reader) => reader.base_available(),
                Err(err) => {
                    warn!(instrument = %key, error = %err, "no funding for liquidation sweep");
                    continue;
                }
            };
            if base > Decimal::ZERO {
                orders.push(liquidation_order(meta, Direction::Sell, price, base));
            }
        }
        Ok(orders)
    }
}

fn liquidation_order(meta: EventMetadata, direction: Direction, price: Decimal, amount: Decimal) -> OrderEvent {
    let signal = SignalEvent {
        meta,
        direction: Some(direction),
        close_price: price,
        amount,
        buy_limit: Decimal::ZERO,
        sell_limit: Decimal::ZERO,
        collateral_currency: None,
        fill_dependent_event: None,
        match_order_amount: false,
    };
    let mut order = OrderEvent::from_signal(&signal, direction);
    order.liquidating = true;
    order.closing_position = true;
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FilledOrder;
    use crate::funding::FundManager;
    use crate::types::{Interval, Leverage, Timestamp};
    use rust_decimal_macros::dec;

    fn key() -> InstrumentKey {
        InstrumentKey::futures("binance", "BTC", "USDT")
    }

    fn usdt() -> CurrencyCode {
        CurrencyCode::new("USDT")
    }

    fn setup() -> (Portfolio, FundManager) {
        let mut p = Portfolio::default();
        p.add_futures_instrument(key(), usdt());
        let mut f = FundManager::new();
        f.add_futures(key(), usdt(), dec!(1000));
        (p, f)
    }

    fn candle(offset: Offset, close: Decimal) -> DataEvent {
        let mut ev = DataEvent::candle(
            key(),
            Timestamp::from_millis((offset + 1) * 60_000),
            Interval::ONE_MINUTE,
            [close; 5],
        );
        ev.meta.offset = offset;
        ev
    }

    fn fill(direction: Direction, amount: Decimal, price: Decimal, allocated: Decimal, offset: Offset) -> FillEvent {
        let data = candle(offset, price);
        let mut order = OrderEvent::from_signal(&SignalEvent::from_data(&data, direction), direction);
        order.amount = amount;
        order.allocated_funds = allocated;
        let mut fill = FillEvent::from_order(&order);
        fill.order = Some(FilledOrder {
            id: offset as u64,
            direction,
            price,
            amount,
            fee: Decimal::ZERO,
            leverage: Leverage::new(dec!(10)).unwrap(),
            date: data.meta.time,
        });
        fill
    }

    #[test]
    fn open_then_close_realises() {
        let (mut p, mut f) = setup();
        f.reserver(&key()).unwrap().reserve(dec!(100), Direction::Long).unwrap();

        let opened = p
            .track_futures_order(&fill(Direction::Long, dec!(10), dec!(100), dec!(100), 0), f.collateral_releaser(&key()).unwrap())
            .unwrap();
        assert_eq!(opened.realised, Quote::zero());
        assert_eq!(opened.summary.result.exposure.value(), dec!(10));
        assert_eq!(f.collateral_reader(&key()).unwrap().exposure().value(), dec!(10));

        let closed = p
            .track_futures_order(
                &fill(Direction::ClosePosition, dec!(10), dec!(110), dec!(0), 1),
                f.collateral_releaser(&key()).unwrap(),
            )
            .unwrap();
        assert_eq!(closed.realised.value(), dec!(100));
        assert_eq!(closed.summary.result.status, PositionStatus::Closed);
        let reader = f.collateral_reader(&key()).unwrap();
        assert!(reader.exposure().is_zero());
        assert_eq!(reader.reserved_collateral(), dec!(0));
        assert_eq!(reader.available_collateral(), dec!(1000));
    }

    #[test]
    fn close_without_position_errors() {
        let (mut p, mut f) = setup();
        let err = p
            .track_futures_order(
                &fill(Direction::ClosePosition, dec!(1), dec!(100), dec!(0), 0),
                f.collateral_releaser(&key()).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, PortfolioError::PositionNotFound(_)));
    }

    #[test]
    fn update_pnl_without_position_is_not_found() {
        let (mut p, _) = setup();
        assert!(matches!(p.update_pnl(&candle(0, dec!(100))), Err(PortfolioError::PositionNotFound(_))));
    }

    #[test]
    fn liquidation_trips_below_maintenance() {
        let (mut p, mut f) = setup();
        // 1000 collateral, 10x on 100 contracts at 100: notional 10000, maintenance 500
        f.reserver(&key()).unwrap().reserve(dec!(1000), Direction::Long).unwrap();
        p.track_futures_order(&fill(Direction::Long, dec!(100), dec!(100), dec!(1000), 0), f.collateral_releaser(&key()).unwrap())
            .unwrap();

        let ok = candle(1, dec!(99));
        p.update_pnl(&ok).unwrap();
        let summary = p.latest_pnl_for_event(&ok.meta).unwrap();
        assert!(p.check_liquidation_status(&ok, f.collateral_reader(&key()).unwrap(), &summary).is_ok());

        // equity 1000 - 600 = 400, maintenance 100 * 94 / 10 * 0.5 = 470
        let bad = candle(2, dec!(94));
        p.update_pnl(&bad).unwrap();
        let summary = p.latest_pnl_for_event(&bad.meta).unwrap();
        assert!(matches!(
            p.check_liquidation_status(&bad, f.collateral_reader(&key()).unwrap(), &summary),
            Err(PortfolioError::PositionLiquidated(_))
        ));
    }

    #[test]
    fn no_position_never_liquidates() {
        let (p, f) = setup();
        let ev = candle(0, dec!(1));
        let summary = p.latest_pnl_for_event(&ev.meta).unwrap();
        assert!(p.check_liquidation_status(&ev, f.collateral_reader(&key()).unwrap(), &summary).is_ok());
    }

    #[test]
    fn mark_liquidated_once() {
        let (p, _) = setup();
        let mut summary = p.latest_pnl_for_event(&candle(0, dec!(1)).meta).unwrap();
        assert!(summary.mark_liquidated());
        assert_eq!(summary.result.status, PositionStatus::Liquidated);
        assert!(!summary.mark_liquidated());
    }

    #[test]
    fn flip_opens_remainder() {
        let (mut p, mut f) = setup();
        f.reserver(&key()).unwrap().reserve(dec!(100), Direction::Long).unwrap();
        p.track_futures_order(&fill(Direction::Long, dec!(10), dec!(100), dec!(100), 0), f.collateral_releaser(&key()).unwrap())
            .unwrap();
        f.reserver(&key()).unwrap().reserve(dec!(150), Direction::Short).unwrap();
        p.track_futures_order(&fill(Direction::Short, dec!(15), dec!(100), dec!(150), 1), f.collateral_releaser(&key()).unwrap())
            .unwrap();

        let tracker = p.tracker(&key()).unwrap();
        assert_eq!(tracker.positions().len(), 2);
        let open = tracker.open_position().unwrap();
        assert_eq!(open.size.value(), dec!(-5));
        assert_eq!(open.margin.value(), dec!(50));
        assert_eq!(f.collateral_reader(&key()).unwrap().reserved_collateral(), dec!(50));
    }
}
