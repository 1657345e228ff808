// 8.0.2: run bookkeeping and engine errors.

use crate::config::ConfigError;
use crate::data::DataError;
use crate::exchange::ExchangeError;
use crate::funding::FundingError;
use crate::live::LiveError;
use crate::portfolio::PortfolioError;
use crate::statistics::StatisticsError;
use crate::strategy::StrategyError;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("funding error: {0}")]
    Funding(#[from] FundingError),

    #[error("portfolio error: {0}")]
    Portfolio(#[from] PortfolioError),

    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("statistics error: {0}")]
    Statistics(#[from] StatisticsError),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("live error: {0}")]
    Live(#[from] LiveError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("run {0} has already ran")]
    AlreadyRan(String),

    #[error("run {0} is already running")]
    TaskIsRunning(String),

    #[error("only a live run can do this")]
    LiveOnly,

    #[error("live runs cannot be waited on")]
    CannotWaitForLive,
}

impl EngineError {
    /// Errors that end the run instead of just the event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Strategy(err) if err.is_fatal())
    }

    pub fn is_liquidation(&self) -> bool {
        matches!(self, EngineError::Portfolio(err) if err.is_liquidation())
    }

    pub fn is_already_processed(&self) -> bool {
        matches!(self, EngineError::Statistics(err) if err.is_already_processed())
    }
}

/** 8.2: when the run was loaded, started and closed */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    pub nickname: String,
    pub strategy: String,
    pub live: bool,
    pub date_loaded: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_ended: Option<DateTime<Utc>>,
    pub closed: bool,
}

impl RunMetadata {
    pub fn new(nickname: &str, strategy: &str, live: bool) -> Self {
        Self {
            nickname: nickname.to_string(),
            strategy: strategy.to_string(),
            live,
            date_loaded: Utc::now(),
            date_started: None,
            date_ended: None,
            closed: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.date_started.is_some() && !self.closed
    }

    pub fn has_ran(&self) -> bool {
        self.closed
    }

    pub(super) fn start(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::AlreadyRan(self.nickname.clone()));
        }
        if self.date_started.is_some() {
            return Err(EngineError::TaskIsRunning(self.nickname.clone()));
        }
        self.date_started = Some(Utc::now());
        Ok(())
    }

    // true on the call that closed it
    pub(super) fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.date_ended = Some(Utc::now());
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub metadata: RunMetadata,
    pub events_processed: u64,
    pub fills: u64,
    pub liquidations: u64,
}
