// 10.0 config.rs: run settings in one place. instruments, funds, fees, portfolio, live polling.
// 10.1 builders turn a validated RunConfig into the engine's collaborators.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineConfig;
use crate::exchange::{ExchangeSettings, LeverageSettings, MinMax, SimulatedExchange};
use crate::funding::FundManager;
use crate::live::LiveConfig;
use crate::portfolio::{Portfolio, Risk, Sizer};
use crate::types::{AssetKind, CurrencyCode, CurrencyPair, InstrumentKey};

// Funds and execution settings for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencySettings {
    pub exchange: String,
    pub asset: AssetKind,
    pub base: String,
    pub quote: String,
    // spot funding
    #[serde(default)]
    pub initial_base_funds: Decimal,
    #[serde(default)]
    pub initial_quote_funds: Decimal,
    // futures funding. collateral currency defaults to the quote
    #[serde(default)]
    pub collateral_currency: Option<String>,
    #[serde(default)]
    pub initial_collateral: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    // percent, 0.5 = 0.5%
    #[serde(default)]
    pub min_slippage_percent: Decimal,
    #[serde(default)]
    pub max_slippage_percent: Decimal,
    #[serde(default)]
    pub buy_side: MinMax,
    #[serde(default)]
    pub sell_side: MinMax,
    #[serde(default)]
    pub leverage: LeverageSettings,
    #[serde(default)]
    pub skip_candle_volume_fitting: bool,
}

impl CurrencySettings {
    pub fn spot(exchange: &str, base: &str, quote: &str, base_funds: Decimal, quote_funds: Decimal) -> Self {
        Self {
            exchange: exchange.to_string(),
            asset: AssetKind::Spot,
            base: base.to_string(),
            quote: quote.to_string(),
            initial_base_funds: base_funds,
            initial_quote_funds: quote_funds,
            collateral_currency: None,
            initial_collateral: Decimal::ZERO,
            maker_fee: dec!(0.001),
            taker_fee: dec!(0.002),
            min_slippage_percent: Decimal::ZERO,
            max_slippage_percent: Decimal::ZERO,
            buy_side: MinMax::default(),
            sell_side: MinMax::default(),
            leverage: LeverageSettings::default(),
            skip_candle_volume_fitting: false,
        }
    }

    pub fn futures(exchange: &str, base: &str, quote: &str, collateral: Decimal, max_leverage: Decimal) -> Self {
        Self {
            asset: AssetKind::Futures,
            initial_collateral: collateral,
            leverage: LeverageSettings {
                can_use_leverage: max_leverage > Decimal::ONE,
                maximum_leverage: max_leverage,
            },
            ..Self::spot(exchange, base, quote, Decimal::ZERO, Decimal::ZERO)
        }
    }

    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(&self.exchange, self.asset, CurrencyPair::new(&self.base, &self.quote))
    }

    pub fn collateral(&self) -> CurrencyCode {
        CurrencyCode::new(self.collateral_currency.as_deref().unwrap_or(&self.quote))
    }

    pub fn exchange_settings(&self) -> ExchangeSettings {
        let mut settings = ExchangeSettings::new(self.instrument());
        settings.maker_fee = self.maker_fee;
        settings.taker_fee = self.taker_fee;
        settings.min_slippage_percent = self.min_slippage_percent;
        settings.max_slippage_percent = self.max_slippage_percent;
        settings.buy_side = self.buy_side.clone();
        settings.sell_side = self.sell_side.clone();
        settings.leverage = self.leverage.clone();
        settings.skip_candle_volume_fitting = self.skip_candle_volume_fitting;
        if self.asset.is_futures() {
            settings.collateral_currency = Some(self.collateral());
        }
        settings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySettings {
    pub name: String,
    // hand every instrument's latest tick to the strategy in one call
    pub simultaneous_signal_processing: bool,
    pub close_positions_on_stop: bool,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            name: "dollar-cost-average".to_string(),
            simultaneous_signal_processing: false,
            close_positions_on_stop: false,
        }
    }
}

/** 10.2: portfolio risk params */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSettings {
    // maintenance margin as a share of initial margin, (0, 1)
    pub maintenance_margin_ratio: Decimal,
    // largest share of total holdings one instrument may reach. zero disables
    pub max_holdings_ratio: Decimal,
}

impl Default for PortfolioSettings {
    fn default() -> Self {
        Self {
            maintenance_margin_ratio: dec!(0.5),
            max_holdings_ratio: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSettings {
    pub check_interval_ms: u64,
    pub retry_tolerance: u32,
    pub retry_wait_ms: u64,
    pub event_timeout_ms: u64,
    // orders go to a real venue which liquidates for us
    pub real_orders: bool,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 1_000,
            retry_tolerance: 3,
            retry_wait_ms: 500,
            event_timeout_ms: 60_000,
            real_orders: false,
        }
    }
}

// The complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub nickname: String,
    #[serde(default)]
    pub strategy: StrategySettings,
    pub currencies: Vec<CurrencySettings>,
    #[serde(default)]
    pub portfolio: PortfolioSettings,
    #[serde(default)]
    pub live: Option<LiveSettings>,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            nickname: "spot-dca".to_string(),
            strategy: StrategySettings::default(),
            currencies: vec![CurrencySettings::spot("binance", "BTC", "USDT", Decimal::ZERO, dec!(10000))],
            portfolio: PortfolioSettings::default(),
            live: None,
            verbose: false,
        }
    }
}

impl RunConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    // Preset with one spot pair per exchange, both traded together
    pub fn multi_spot() -> Self {
        Self {
            nickname: "multi-spot".to_string(),
            strategy: StrategySettings {
                simultaneous_signal_processing: true,
                ..StrategySettings::default()
            },
            currencies: vec![
                CurrencySettings::spot("binance", "BTC", "USDT", Decimal::ZERO, dec!(10000)),
                CurrencySettings::spot("binance", "ETH", "USDT", Decimal::ZERO, dec!(10000)),
            ],
            ..Self::default()
        }
    }

    // Preset with a leveraged futures contract
    pub fn futures() -> Self {
        Self {
            nickname: "futures".to_string(),
            currencies: vec![CurrencySettings::futures("binance", "BTC", "USDT", dec!(1000), dec!(10))],
            ..Self::default()
        }
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currencies.is_empty() {
            return Err(ConfigError::NoCurrencies);
        }

        let mut seen = BTreeSet::new();
        for c in &self.currencies {
            let key = c.instrument();
            if !seen.insert(key.clone()) {
                return Err(ConfigError::DuplicateCurrency(key.to_string()));
            }
            if c.exchange.is_empty() || c.base.is_empty() || c.quote.is_empty() {
                return Err(ConfigError::InvalidCurrency {
                    instrument: key.to_string(),
                    reason: "exchange, base and quote must be set".to_string(),
                });
            }

            // funds
            let funded = if c.asset.is_futures() {
                c.initial_collateral > Decimal::ZERO
            } else {
                c.initial_base_funds > Decimal::ZERO || c.initial_quote_funds > Decimal::ZERO
            };
            if !funded {
                return Err(ConfigError::InvalidCurrency {
                    instrument: key.to_string(),
                    reason: "no initial funds".to_string(),
                });
            }

            // fees
            if c.maker_fee < Decimal::ZERO || c.taker_fee < Decimal::ZERO || c.taker_fee >= Decimal::ONE {
                return Err(ConfigError::InvalidCurrency {
                    instrument: key.to_string(),
                    reason: "fees must be in [0, 1)".to_string(),
                });
            }

            if c.min_slippage_percent > c.max_slippage_percent {
                return Err(ConfigError::InvalidCurrency {
                    instrument: key.to_string(),
                    reason: "min slippage above max slippage".to_string(),
                });
            }

            for side in [&c.buy_side, &c.sell_side] {
                if side.maximum_size > Decimal::ZERO && side.minimum_size > side.maximum_size {
                    return Err(ConfigError::InvalidCurrency {
                        instrument: key.to_string(),
                        reason: "minimum size above maximum size".to_string(),
                    });
                }
            }

            if c.leverage.can_use_leverage && c.leverage.maximum_leverage < Decimal::ONE {
                return Err(ConfigError::InvalidCurrency {
                    instrument: key.to_string(),
                    reason: "maximum leverage below 1".to_string(),
                });
            }
        }

        // maintenance margin is a share of initial margin, so it must stay below it
        let ratio = self.portfolio.maintenance_margin_ratio;
        if ratio <= Decimal::ZERO || ratio >= Decimal::ONE {
            return Err(ConfigError::InvalidPortfolio {
                reason: "maintenance margin ratio must be between 0 and 1".to_string(),
            });
        }
        if self.portfolio.max_holdings_ratio < Decimal::ZERO || self.portfolio.max_holdings_ratio > Decimal::ONE {
            return Err(ConfigError::InvalidPortfolio {
                reason: "max holdings ratio must be between 0 and 1".to_string(),
            });
        }

        if let Some(live) = &self.live {
            if live.check_interval_ms == 0 || live.event_timeout_ms == 0 {
                return Err(ConfigError::InvalidLive {
                    reason: "intervals must be positive".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn instruments(&self) -> Vec<InstrumentKey> {
        self.currencies.iter().map(CurrencySettings::instrument).collect()
    }

    pub fn fund_manager(&self) -> FundManager {
        let mut funding = FundManager::new();
        for c in &self.currencies {
            if c.asset.is_futures() {
                funding.add_futures(c.instrument(), c.collateral(), c.initial_collateral);
            } else {
                funding.add_spot(c.instrument(), c.initial_base_funds, c.initial_quote_funds);
            }
        }
        funding
    }

    pub fn exchange(&self) -> SimulatedExchange {
        let mut exchange = SimulatedExchange::new();
        for c in &self.currencies {
            exchange.add_settings(c.exchange_settings());
        }
        exchange
    }

    pub fn portfolio(&self) -> Portfolio {
        let mut portfolio = Portfolio::new(Box::new(Sizer), Box::new(Risk::new(self.portfolio.max_holdings_ratio)))
            .with_maintenance_margin_ratio(self.portfolio.maintenance_margin_ratio);
        for c in &self.currencies {
            if c.asset.is_futures() {
                portfolio.add_futures_instrument(c.instrument(), c.collateral());
            } else {
                portfolio.add_instrument(c.instrument());
            }
        }
        portfolio
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            verbose: self.verbose,
            live: self.live.is_some(),
            real_orders: self.live.as_ref().is_some_and(|l| l.real_orders),
            close_positions_on_stop: self.strategy.close_positions_on_stop,
        }
    }

    pub fn live_config(&self) -> Option<LiveConfig> {
        self.live.as_ref().map(|l| LiveConfig {
            check_interval: Duration::from_millis(l.check_interval_ms),
            retry_tolerance: l.retry_tolerance,
            retry_wait: Duration::from_millis(l.retry_wait_ms),
            event_timeout: Duration::from_millis(l.event_timeout_ms),
        })
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),

    #[error("no currencies configured")]
    NoCurrencies,

    #[error("currency {0} configured twice")]
    DuplicateCurrency(String),

    #[error("invalid currency {instrument}: {reason}")]
    InvalidCurrency { instrument: String, reason: String },

    #[error("invalid portfolio settings: {reason}")]
    InvalidPortfolio { reason: String },

    #[error("invalid live settings: {reason}")]
    InvalidLive { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funding::{FundingManager, FundReader};

    #[test]
    fn test_default_config_valid() {
        assert!(RunConfig::default().validate().is_ok());
        assert!(RunConfig::multi_spot().validate().is_ok());
        assert!(RunConfig::futures().validate().is_ok());
    }

    #[test]
    fn test_duplicate_currency() {
        let mut config = RunConfig::default();
        config.currencies.push(config.currencies[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateCurrency(_))));
    }

    #[test]
    fn test_unfunded_currency() {
        let mut config = RunConfig::default();
        config.currencies[0].initial_quote_funds = Decimal::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCurrency { .. })));
    }

    #[test]
    fn test_invalid_margin_ratio() {
        let mut config = RunConfig::futures();
        config.portfolio.maintenance_margin_ratio = dec!(1.1);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPortfolio { .. })));
    }

    #[test]
    fn test_builders() {
        let config = RunConfig::futures();
        let key = config.instruments()[0].clone();
        assert!(key.is_futures());

        let funding = config.fund_manager();
        assert!(funding.has_futures());
        assert_eq!(funding.funding_for_event(&key).unwrap().quote_available(), dec!(1000));

        let settings = config.currencies[0].exchange_settings();
        assert_eq!(settings.collateral_currency, Some(CurrencyCode::new("USDT")));
        assert!(settings.leverage.can_use_leverage);

        assert!(config.live_config().is_none());
        assert!(!config.engine_config().live);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "nickname": "json",
            "currencies": [{
                "exchange": "Binance",
                "asset": "spot",
                "base": "btc",
                "quote": "usdt",
                "initial_quote_funds": "5000",
                "maker_fee": "0.001",
                "taker_fee": "0.002"
            }],
            "live": { "check_interval_ms": 100, "retry_tolerance": 1, "retry_wait_ms": 10, "event_timeout_ms": 1000, "real_orders": false }
        }"#;
        let config = RunConfig::from_json(json).unwrap();
        assert_eq!(config.instruments()[0], InstrumentKey::spot("binance", "BTC", "USDT"));
        assert_eq!(config.live_config().unwrap().check_interval, Duration::from_millis(100));

        assert!(matches!(RunConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_serialization() {
        let config = RunConfig::multi_spot();
        let json = serde_json::to_string(&config).unwrap();
        let back = RunConfig::from_json(&json).unwrap();
        assert_eq!(back, config);
    }
}
