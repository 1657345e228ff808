// 6.5: pre-trade risk. rejects orders that break leverage or concentration limits.

use super::holdings::Holding;
use crate::events::OrderEvent;
use crate::exchange::ExchangeSettings;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RiskError {
    #[error("leverage {0} requested but leverage is disabled")]
    LeverageDisabled(Decimal),

    #[error("leverage {requested} exceeds maximum {maximum}")]
    LeverageTooHigh { requested: Decimal, maximum: Decimal },

    #[error("order would hold {ratio} of portfolio value, limit {limit}")]
    TooConcentrated { ratio: Decimal, limit: Decimal },
}

pub trait RiskHandler: Send {
    fn evaluate_order(
        &self,
        order: &OrderEvent,
        latest_holdings: &[Holding],
        settings: &ExchangeSettings,
    ) -> Result<OrderEvent, RiskError>;
}

#[derive(Debug, Clone, Default)]
pub struct Risk {
    /// largest share of total holdings value one instrument may reach. zero disables
    pub max_holdings_ratio: Decimal,
}

impl Risk {
    pub fn new(max_holdings_ratio: Decimal) -> Self {
        Self { max_holdings_ratio }
    }

    fn check_concentration(&self, order: &OrderEvent, holdings: &[Holding]) -> Result<(), RiskError> {
        if self.max_holdings_ratio <= Decimal::ZERO || !order.direction.is_buy_side() {
            return Ok(());
        }
        let total: Decimal = holdings.iter().map(|h| h.total_value).sum();
        if total <= Decimal::ZERO {
            return Ok(());
        }
        let current = holdings
            .iter()
            .filter(|h| h.instrument == order.meta.instrument)
            .map(|h| h.base_value)
            .sum::<Decimal>();
        let ratio = (current + order.value()) / total;
        if ratio > self.max_holdings_ratio {
            return Err(RiskError::TooConcentrated {
                ratio: ratio.round_dp(4),
                limit: self.max_holdings_ratio,
            });
        }
        Ok(())
    }
}

impl RiskHandler for Risk {
    fn evaluate_order(
        &self,
        order: &OrderEvent,
        latest_holdings: &[Holding],
        settings: &ExchangeSettings,
    ) -> Result<OrderEvent, RiskError> {
        let requested = order.leverage.value();
        if requested > Decimal::ONE {
            if !settings.leverage.can_use_leverage {
                return Err(RiskError::LeverageDisabled(requested));
            }
            let maximum = settings.leverage.maximum_leverage;
            if maximum > Decimal::ZERO && requested > maximum {
                return Err(RiskError::LeverageTooHigh { requested, maximum });
            }
        }
        self.check_concentration(order, latest_holdings)?;
        Ok(order.clone())
    }
}
