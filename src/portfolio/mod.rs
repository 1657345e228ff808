//! Portfolio: turns signals into sized, risk checked orders and keeps the per-instrument
//! ledger of holdings, compliance snapshots and futures positions.
//!
//! All mutation happens from the engine's single execution context, so nothing here locks.

pub mod compliance;
pub mod futures;
pub mod holdings;
pub mod risk;
pub mod sizing;

pub use compliance::{ComplianceError, ComplianceManager, ComplianceSnapshot, SnapshotOrder};
pub use futures::{FuturesTracker, PnlSummary, TrackedOrder};
pub use holdings::Holding;
pub use risk::{Risk, RiskError, RiskHandler};
pub use sizing::{SizeHandler, Sizer, SizingError};

use crate::events::{OrderEvent, SignalEvent};
use crate::exchange::ExchangeSettings;
use crate::funding::{FundReserver, FundingError};
use crate::types::{CurrencyCode, Direction, InstrumentKey, Offset};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortfolioError {
    #[error("invalid direction")]
    InvalidDirection(Option<Direction>),

    #[error("no holdings found")]
    NoHoldings,

    #[error("holding with unset timestamp received")]
    HoldingsNoTimestamp,

    #[error("holding already set at offset {0}")]
    HoldingsAlreadySet(Offset),

    #[error("no portfolio settings for {0}")]
    NoPortfolioSettings(InstrumentKey),

    #[error("position liquidated for {0}")]
    PositionLiquidated(InstrumentKey),

    #[error("no open position for {0}")]
    PositionNotFound(InstrumentKey),

    #[error("{0} is not a futures instrument")]
    NotFutures(InstrumentKey),

    #[error("fill for {0} carries no order")]
    NoOrder(InstrumentKey),

    #[error("invalid price {0}")]
    InvalidPrice(Decimal),

    #[error(transparent)]
    Compliance(#[from] ComplianceError),

    #[error(transparent)]
    Funding(#[from] FundingError),
}

impl PortfolioError {
    pub fn is_liquidation(&self) -> bool {
        matches!(self, PortfolioError::PositionLiquidated(_))
    }
}

/// Everything the portfolio tracks for one instrument.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub holdings: Vec<Holding>,
    pub compliance: ComplianceManager,
    pub futures: Option<FuturesTracker>,
}

// 6.0: the portfolio
pub struct Portfolio {
    settings: BTreeMap<InstrumentKey, Settings>,
    sizer: Box<dyn SizeHandler>,
    risk: Box<dyn RiskHandler>,
    /// maintenance margin as a share of initial margin
    pub maintenance_margin_ratio: Decimal,
}

impl Default for Portfolio {
    fn default() -> Self {
        Self::new(Box::new(Sizer), Box::new(Risk::default()))
    }
}

impl std::fmt::Debug for Portfolio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portfolio")
            .field("instruments", &self.settings.len())
            .field("maintenance_margin_ratio", &self.maintenance_margin_ratio)
            .finish()
    }
}

impl Portfolio {
    pub fn new(sizer: Box<dyn SizeHandler>, risk: Box<dyn RiskHandler>) -> Self {
        Self {
            settings: BTreeMap::new(),
            sizer,
            risk,
            maintenance_margin_ratio: dec!(0.5),
        }
    }

    pub fn with_maintenance_margin_ratio(mut self, ratio: Decimal) -> Self {
        self.maintenance_margin_ratio = ratio;
        self
    }

    pub fn add_instrument(&mut self, key: InstrumentKey) {
        self.settings.entry(key).or_default();
    }

    pub fn add_futures_instrument(&mut self, key: InstrumentKey, collateral_currency: CurrencyCode) {
        let settings = self.settings.entry(key).or_default();
        settings.futures = Some(FuturesTracker::new(collateral_currency));
    }

    pub fn instruments(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.settings.keys()
    }

    pub(crate) fn settings(&self, key: &InstrumentKey) -> Result<&Settings, PortfolioError> {
        self.settings
            .get(key)
            .ok_or_else(|| PortfolioError::NoPortfolioSettings(key.clone()))
    }

    pub(crate) fn settings_mut(&mut self, key: &InstrumentKey) -> Result<&mut Settings, PortfolioError> {
        self.settings
            .get_mut(key)
            .ok_or_else(|| PortfolioError::NoPortfolioSettings(key.clone()))
    }

    pub fn compliance(&self, key: &InstrumentKey) -> Result<&ComplianceManager, PortfolioError> {
        Ok(&self.settings(key)?.compliance)
    }

    pub fn latest_compliance_snapshot(&self, key: &InstrumentKey) -> Option<&ComplianceSnapshot> {
        self.settings.get(key).and_then(|s| s.compliance.latest_snapshot())
    }

    // 6.0.1: signal -> order. returns a could-not order rather than failing for anything
    // the pipeline should see and record
    pub fn on_signal(
        &mut self,
        signal: &SignalEvent,
        exchange: &ExchangeSettings,
        funds: &mut dyn FundReserver,
    ) -> Result<OrderEvent, PortfolioError> {
        let Some(direction) = signal.direction else {
            return Err(PortfolioError::InvalidDirection(None));
        };
        let key = &signal.meta.instrument;
        let first_iteration = self.settings(key)?.holdings.is_empty();
        if first_iteration {
            let seed = Holding::new(&signal.meta, signal.close_price, &*funds);
            self.set_holdings_for_offset(seed, false)?;
        }

        let mut order = OrderEvent::from_signal(signal, direction);
        order.leverage = exchange.order_leverage();

        if matches!(direction, Direction::DoNothing | Direction::MissingData) {
            return Ok(order);
        }

        if !funds.can_place_order(direction) {
            return Ok(cannot_purchase(order, direction));
        }

        if direction == Direction::ClosePosition {
            // closing is sized by the open position, no new margin is needed
            let amount = self
                .tracker(key)
                .ok()
                .and_then(FuturesTracker::open_position)
                .map(|p| p.size.abs())
                .unwrap_or_default();
            if amount.is_zero() {
                order.direction = Direction::DoNothing;
                order.meta.append_reason("no open position to close");
            } else {
                order.amount = amount;
            }
            return Ok(order);
        }

        let sizing_funds = funds.available_for(direction);
        if sizing_funds <= Decimal::ZERO {
            return Ok(cannot_purchase(order, direction));
        }

        let mut sized = match self.sizer.size_order(&order, sizing_funds, exchange) {
            Ok(sized) => sized,
            Err(err) => {
                order.meta.append_reason(err.to_string());
                order.direction = direction.could_not();
                return Ok(order);
            }
        };
        if sized.amount.is_zero() {
            order.direction = direction.could_not();
            order.meta.append_reason("sized order to 0");
            return Ok(order);
        }

        // 6.0.2: sell reserves base, buy reserves quote, futures reserve margin
        let reservation = match direction {
            Direction::Sell => sized.amount,
            Direction::Long | Direction::Short => {
                sized.amount * sized.close_price * sized.leverage.initial_margin_fraction()
            }
            _ => sized.amount * sized.close_price,
        };
        if let Err(err) = funds.reserve(reservation, direction) {
            debug!(instrument = %key, error = %err, "reservation failed");
            sized.direction = Direction::DoNothing;
            sized.meta.append_reason(err.to_string());
            return Ok(sized);
        }
        sized.allocated_funds = reservation;

        let latest = self.latest_holdings_for_all();
        match self.risk.evaluate_order(&sized, &latest, exchange) {
            Ok(evaluated) => Ok(evaluated),
            Err(err) => {
                // keeps allocated_funds so the exchange can hand the reservation back
                sized.meta.append_reason(err.to_string());
                sized.direction = direction.could_not();
                Ok(sized)
            }
        }
    }

    /// Drop all per-run state, keep the instruments.
    pub fn reset(&mut self) {
        for settings in self.settings.values_mut() {
            settings.holdings.clear();
            settings.compliance = ComplianceManager::new();
            if let Some(tracker) = settings.futures.as_mut() {
                *tracker = FuturesTracker::new(tracker.collateral_currency.clone());
            }
        }
    }
}

fn cannot_purchase(mut order: OrderEvent, direction: Direction) -> OrderEvent {
    order
        .meta
        .append_reason(format!("not enough funds to {}", direction.as_str().to_lowercase()));
    order.direction = direction.could_not();
    order
}
