// backtest-core: event driven trading simulation and live execution engine.
// per-offset ordering first: every tick, signal, order and fill is recorded once per
// instrument per offset, and futures liquidation is a state transition, not a crash.
// the engine is single threaded; only live polling runs concurrently.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: InstrumentKey, Direction, Price, Quote, Leverage, Timestamp
//   2.x  events.rs: data, signal, order and fill events, fill-dependent events
//   3.x  queue.rs: fifo event queue
//   3.x  data.rs: per-instrument cursors and the holder that indexes them
//   4.x  position.rs: futures position, weighted entry, realised/unrealised pnl
//   5.x  funding.rs: funding pools, reservation and release tokens, snapshots
//   6.x  portfolio/: sizing, risk, holdings ledger, compliance, futures pnl and liquidation
//   7.x  exchange.rs: simulated execution
//   8.x  engine/: run loop, dispatch, pipeline stages, live loop
//   8.x  statistics.rs: offset keyed run record
//   9.x  live/: concurrent polling of live sources, single-slot mailboxes
//   10.x config.rs: run configuration, validation and builders
//        strategy.rs: strategy seam plus DCA and scripted strategies

// core pipeline
pub mod data;
pub mod engine;
pub mod events;
pub mod queue;
pub mod types;

// bookkeeping
pub mod funding;
pub mod portfolio;
pub mod position;
pub mod statistics;

// collaborators and outer surfaces
pub mod config;
pub mod exchange;
pub mod live;
pub mod strategy;

// re exports for convenience
pub use engine::*;
pub use events::*;
pub use types::*;
pub use config::{ConfigError, CurrencySettings, LiveSettings, PortfolioSettings, RunConfig, StrategySettings};
pub use data::{lock_data, DataError, DataHandler, DataHolder, SharedDataHolder};
pub use exchange::{ExchangeError, ExchangeSettings, ExecutionFailure, Executor, SimulatedExchange};
pub use funding::{FundManager, FundingError, FundingManager};
pub use live::{Latch, LiveConfig, LiveDataChecker, LiveDataSource, LiveError, Notice, SourceError};
pub use portfolio::{Holding, PnlSummary, Portfolio, PortfolioError};
pub use queue::EventQueue;
pub use statistics::{Statistic, StatisticsError, StatisticsRecorder};
pub use strategy::{DollarCostAverage, Scripted, Strategy, StrategyError};
