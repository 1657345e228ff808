// 8.0 engine/core.rs: the engine struct, construction, accessors and lifecycle.

use super::config::EngineConfig;
use super::results::{EngineError, RunMetadata, RunSummary};
use crate::config::RunConfig;
use crate::data::{lock_data, SharedDataHolder};
use crate::events::Event;
use crate::exchange::Executor;
use crate::funding::FundingManager;
use crate::live::{Latch, LiveDataChecker};
use crate::portfolio::Portfolio;
use crate::queue::EventQueue;
use crate::statistics::{Statistic, StatisticsRecorder};
use crate::strategy::Strategy;
use crate::types::Offset;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

/// The collaborators an engine drives.
pub struct EngineComponents {
    pub data: SharedDataHolder,
    pub strategy: Box<dyn Strategy>,
    pub portfolio: Portfolio,
    pub exchange: Box<dyn Executor>,
    pub funding: Box<dyn FundingManager>,
    pub statistics: Box<dyn StatisticsRecorder>,
}

/** 8.1: main engine struct. all run state lives here */
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) queue: EventQueue,
    pub(super) data: SharedDataHolder,
    pub(super) strategy: Box<dyn Strategy>,
    pub(super) portfolio: Portfolio,
    pub(super) exchange: Box<dyn Executor>,
    pub(super) funding: Box<dyn FundingManager>,
    pub(super) statistics: Box<dyn StatisticsRecorder>,
    pub(super) live: Option<LiveDataChecker>,
    pub(super) shutdown: Latch,
    // offsets already queued as data events. simultaneous runs queue one event per offset
    pub(super) processed_data_at_offset: BTreeSet<Offset>,
    pub(super) has_processed_an_event: bool,
    pub(super) metadata: RunMetadata,
    pub(super) events_processed: u64,
    pub(super) fills: u64,
    pub(super) liquidations: u64,
}

impl Engine {
    pub fn new(config: EngineConfig, components: EngineComponents) -> Self {
        let metadata = RunMetadata::new("", components.strategy.name(), config.live);
        Self {
            config,
            queue: EventQueue::new(),
            data: components.data,
            strategy: components.strategy,
            portfolio: components.portfolio,
            exchange: components.exchange,
            funding: components.funding,
            statistics: components.statistics,
            live: None,
            shutdown: Latch::new(),
            processed_data_at_offset: BTreeSet::new(),
            has_processed_an_event: false,
            metadata,
            events_processed: 0,
            fills: 0,
            liquidations: 0,
        }
    }

    /// Build every collaborator from a validated run config. live runs get a checker
    /// without sources; add them through `live_mut`.
    pub fn from_config(
        run: &RunConfig,
        data: SharedDataHolder,
        mut strategy: Box<dyn Strategy>,
    ) -> Result<Self, EngineError> {
        run.validate()?;
        strategy.set_simultaneous_processing(run.strategy.simultaneous_signal_processing)?;

        let components = EngineComponents {
            data: Arc::clone(&data),
            strategy,
            portfolio: run.portfolio(),
            exchange: Box::new(run.exchange()),
            funding: Box::new(run.fund_manager()),
            statistics: Box::new(Statistic::new()),
        };
        let mut engine = Engine::new(run.engine_config(), components).with_nickname(&run.nickname);
        if let Some(live) = run.live_config() {
            engine = engine.with_live(LiveDataChecker::new(live, data));
        }
        Ok(engine)
    }

    pub fn with_nickname(mut self, nickname: &str) -> Self {
        self.metadata.nickname = nickname.to_string();
        self
    }

    pub fn with_live(mut self, checker: LiveDataChecker) -> Self {
        self.config.live = true;
        self.metadata.live = true;
        self.live = Some(checker);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn data(&self) -> &SharedDataHolder {
        &self.data
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn funding(&self) -> &dyn FundingManager {
        self.funding.as_ref()
    }

    pub fn statistics(&self) -> &dyn StatisticsRecorder {
        self.statistics.as_ref()
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }

    pub fn live_mut(&mut self) -> Option<&mut LiveDataChecker> {
        self.live.as_mut()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Push an event straight onto the queue. it is processed on the next run.
    pub fn append_event(&mut self, event: Event) {
        self.queue.append_event(event);
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn is_running(&self) -> bool {
        self.metadata.is_running()
    }

    pub fn has_ran(&self) -> bool {
        self.metadata.has_ran()
    }

    /// Closing this latch stops a live run from another task.
    pub fn shutdown_handle(&self) -> Latch {
        self.shutdown.clone()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            metadata: self.metadata.clone(),
            events_processed: self.events_processed,
            fills: self.fills,
            liquidations: self.liquidations,
        }
    }

    /// Backtest to completion, then stop.
    pub fn execute(&mut self) -> Result<RunSummary, EngineError> {
        if self.config.live {
            return Err(EngineError::CannotWaitForLive);
        }
        self.metadata.start()?;
        let result = self.run();
        self.stop();
        result?;
        Ok(self.summary())
    }

    /// End the run. closing twice is a no-op.
    pub fn stop(&mut self) {
        self.shutdown.close();
        if !self.metadata.close() {
            return;
        }
        if self.config.close_positions_on_stop {
            if let Err(err) = self.close_all_positions() {
                error!(error = %err, "could not close all positions on stop");
            }
        }
        info!(
            run = %self.metadata.nickname,
            events = self.events_processed,
            fills = self.fills,
            liquidations = self.liquidations,
            "run stopped"
        );
    }

    /// Clear every per-run state so the same collaborators can run again.
    pub fn reset(&mut self) {
        self.queue.reset();
        lock_data(&self.data).reset();
        self.portfolio.reset();
        self.statistics.reset();
        self.exchange.reset();
        self.funding.reset();
        self.processed_data_at_offset.clear();
        self.has_processed_an_event = false;
        self.events_processed = 0;
        self.fills = 0;
        self.liquidations = 0;
        self.shutdown = Latch::new();
        let nickname = self.metadata.nickname.clone();
        self.metadata = RunMetadata::new(&nickname, self.strategy.name(), self.config.live);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("strategy", &self.strategy.name())
            .field("queued", &self.queue.len())
            .field("portfolio", &self.portfolio)
            .field("live", &self.live)
            .field("metadata", &self.metadata)
            .finish()
    }
}
