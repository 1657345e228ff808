// 6.4: order sizing. bounds an order by what the funds can pay for and the side limits.

use crate::events::OrderEvent;
use crate::exchange::ExchangeSettings;
use crate::types::Direction;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizingError {
    #[error("received {0} funds to size with")]
    NoFunds(Decimal),

    #[error("cannot size against price {0}")]
    InvalidPrice(Decimal),

    #[error("sized amount {amount} below minimum {minimum}")]
    BelowMinimum { amount: Decimal, minimum: Decimal },
}

pub trait SizeHandler: Send {
    fn size_order(
        &self,
        order: &OrderEvent,
        funds: Decimal,
        settings: &ExchangeSettings,
    ) -> Result<OrderEvent, SizingError>;
}

/// Default sizer: spend what is available, capped by the order's own amount and the side limits.
#[derive(Debug, Clone, Default)]
pub struct Sizer;

impl SizeHandler for Sizer {
    fn size_order(
        &self,
        order: &OrderEvent,
        funds: Decimal,
        settings: &ExchangeSettings,
    ) -> Result<OrderEvent, SizingError> {
        if funds <= Decimal::ZERO {
            return Err(SizingError::NoFunds(funds));
        }
        let price = order.close_price;
        if price <= Decimal::ZERO {
            return Err(SizingError::InvalidPrice(price));
        }

        let fee_factor = Decimal::ONE + settings.taker_fee;
        let affordable = match order.direction {
            // base units already
            Direction::Sell => funds,
            Direction::Long | Direction::Short => funds * order.leverage.value() / (price * fee_factor),
            _ => funds / (price * fee_factor),
        };

        let mut amount = if order.amount > Decimal::ZERO {
            order.amount.min(affordable)
        } else {
            affordable
        };

        let limits = settings.side_limits(order.direction);
        if limits.maximum_size > Decimal::ZERO {
            amount = amount.min(limits.maximum_size);
        }
        if limits.maximum_total > Decimal::ZERO {
            amount = amount.min(limits.maximum_total / price);
        }
        amount = amount.round_dp_with_strategy(8, RoundingStrategy::ToZero);

        if limits.minimum_size > Decimal::ZERO && amount < limits.minimum_size {
            return Err(SizingError::BelowMinimum {
                amount,
                minimum: limits.minimum_size,
            });
        }

        let mut sized = order.clone();
        sized.amount = amount;
        Ok(sized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DataEvent, SignalEvent};
    use crate::types::{InstrumentKey, Interval, Leverage, Timestamp};
    use rust_decimal_macros::dec;

    fn order(direction: Direction, amount: Decimal) -> OrderEvent {
        let data = DataEvent::candle(
            InstrumentKey::spot("test", "BTC", "USD"),
            Timestamp::from_millis(1),
            Interval::ONE_HOUR,
            [dec!(100); 5],
        );
        let mut o = OrderEvent::from_signal(&SignalEvent::from_data(&data, direction), direction);
        o.amount = amount;
        o
    }

    fn settings() -> ExchangeSettings {
        let mut s = ExchangeSettings::new(InstrumentKey::spot("test", "BTC", "USD"));
        s.taker_fee = Decimal::ZERO;
        s
    }

    #[test]
    fn buy_spends_quote() {
        let sized = Sizer.size_order(&order(Direction::Buy, dec!(0)), dec!(1000), &settings()).unwrap();
        assert_eq!(sized.amount, dec!(10));
    }

    #[test]
    fn requested_amount_caps() {
        let sized = Sizer.size_order(&order(Direction::Buy, dec!(2)), dec!(1000), &settings()).unwrap();
        assert_eq!(sized.amount, dec!(2));
    }

    #[test]
    fn sell_uses_base_units() {
        let sized = Sizer.size_order(&order(Direction::Sell, dec!(0)), dec!(3), &settings()).unwrap();
        assert_eq!(sized.amount, dec!(3));
    }

    #[test]
    fn leverage_scales_futures() {
        let mut o = order(Direction::Long, dec!(0));
        o.leverage = Leverage::new(dec!(5)).unwrap();
        let sized = Sizer.size_order(&o, dec!(100), &settings()).unwrap();
        assert_eq!(sized.amount, dec!(5));
    }

    #[test]
    fn limits_apply() {
        let mut s = settings();
        s.buy_side.maximum_size = dec!(4);
        let sized = Sizer.size_order(&order(Direction::Buy, dec!(0)), dec!(1000), &s).unwrap();
        assert_eq!(sized.amount, dec!(4));

        s.buy_side.minimum_size = dec!(20);
        let err = Sizer.size_order(&order(Direction::Buy, dec!(0)), dec!(1000), &s).unwrap_err();
        assert!(matches!(err, SizingError::BelowMinimum { .. }));
    }

    #[test]
    fn no_funds_errors() {
        assert_eq!(
            Sizer.size_order(&order(Direction::Buy, dec!(0)), dec!(0), &settings()),
            Err(SizingError::NoFunds(dec!(0)))
        );
    }
}
