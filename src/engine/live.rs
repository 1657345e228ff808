//! Live outer loop and closing positions on the way out.

use super::core::Engine;
use super::results::{EngineError, RunSummary};
use crate::data::lock_data;
use crate::events::{DataEvent, Event};
use crate::strategy::StrategyError;
use tracing::{error, info, warn};

impl Engine {
    /// Start the live checker and call `run` once per data update until shutdown,
    /// the checker stopping, or a fatal error. The engine is stopped on the way out.
    pub async fn run_live(&mut self) -> Result<RunSummary, EngineError> {
        let Some(live) = self.live.as_mut() else {
            return Err(EngineError::LiveOnly);
        };
        self.metadata.start()?;
        // subscribe first, a poller may raise before start returns
        let mut updated = live.updated();
        live.start()?;
        let stopped = live.has_stopped();
        let shutdown = self.shutdown.clone();
        info!(run = %self.metadata.nickname, "running against live data");

        let outcome = loop {
            tokio::select! {
                _ = shutdown.wait() => break Ok(()),
                _ = stopped.wait() => {
                    warn!("live data checker stopped, ending run");
                    // the last poll may have landed data nobody has run over yet
                    if updated.try_take() {
                        break self.run();
                    }
                    break Ok(());
                }
                alive = updated.notified() => {
                    if !alive {
                        break Ok(());
                    }
                    if let Err(err) = self.run() {
                        break Err(err);
                    }
                }
            }
        };

        if let Some(live) = self.live.as_mut() {
            live.stop().await;
        }
        self.stop();
        outcome?;
        Ok(self.summary())
    }

    /// Ask the strategy to close everything it holds and push those signals through
    /// the pipeline straight away. Runs one offset past each instrument's last tick.
    pub fn close_all_positions(&mut self) -> Result<(), EngineError> {
        let latest_prices: Vec<DataEvent> = {
            let data = lock_data(&self.data);
            data.all_data().filter_map(|h| h.latest().cloned()).collect()
        };
        let holdings = self.portfolio.latest_holdings_for_all();

        let signals = match self.strategy.close_all_positions(&holdings, &latest_prices) {
            Ok(signals) => signals,
            Err(StrategyError::NotSupported(_)) => {
                warn!(strategy = self.strategy.name(), "closing all positions is not supported by strategy");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let Some(time) = signals.first().map(|s| s.meta.time) else {
            return Ok(());
        };

        for mut signal in signals {
            let key = signal.meta.instrument.clone();
            let Some(latest) = latest_prices.iter().find(|d| d.meta.instrument == key) else {
                warn!(instrument = %key, "no price to close position at");
                continue;
            };
            let mut closing_tick = latest.clone();
            closing_tick.meta.offset += 1;
            signal.meta.offset = closing_tick.meta.offset;
            self.statistics.set_event_for_offset(&Event::Data(closing_tick))?;

            let event = Event::Signal(signal);
            self.record_event(&event);
            self.queue.append_event(event);
        }

        while let Some(event) = self.queue.next_event() {
            self.process_event(event)?;
        }

        self.funding.create_snapshot(time);
        for holding in self.portfolio.latest_holdings_for_all() {
            if let Err(err) = self.statistics.add_holdings_for_time(&holding) {
                error!(instrument = %holding.instrument, offset = holding.offset, error = %err, "could not record closing holding");
            }
        }
        Ok(())
    }
}
