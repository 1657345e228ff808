//! Data stage: price updates, liquidation checks and signal generation.

use super::core::Engine;
use super::results::EngineError;
use crate::data::{lock_data, DataHandler};
use crate::events::{DataEvent, Event, SignalEvent};
use crate::portfolio::{PnlSummary, PortfolioError};
use crate::strategy::StrategyResult;
use crate::types::InstrumentKey;
use tracing::{debug, error, warn};

impl Engine {
    // 8.5: one instrument's tick, one signal
    pub(super) fn process_single_data_event(&mut self, ev: &DataEvent) -> Result<(), EngineError> {
        self.update_stats_for_data_event(ev)?;

        let signal = {
            let data = lock_data(&self.data);
            let handler = data.handler(&ev.meta.instrument)?;
            self.strategy.on_signal(handler, self.funding.as_ref(), &self.portfolio)
        };
        let Some(signal) = self.accept_strategy_result(signal)? else {
            return Ok(());
        };
        self.enqueue_signals(vec![signal]);
        Ok(())
    }

    // 8.5.1: every instrument's latest tick goes to the strategy in one call
    pub(super) fn process_simultaneous_data_events(&mut self) -> Result<(), EngineError> {
        let latest: Vec<DataEvent> = {
            let data = lock_data(&self.data);
            data.all_data().filter_map(|h| h.latest().cloned()).collect()
        };

        let mut ready: Vec<InstrumentKey> = Vec::with_capacity(latest.len());
        for ev in &latest {
            match self.update_stats_for_data_event(ev) {
                Ok(()) => {}
                Err(err) if err.is_already_processed() => {
                    warn!(instrument = %ev.meta.instrument, offset = ev.meta.offset, error = %err, "skipping instrument this tick");
                    continue;
                }
                // a forced close owns this tick, no new signals
                Err(err) if err.is_liquidation() => {
                    warn!(instrument = %ev.meta.instrument, offset = ev.meta.offset, "liquidation aborted signal generation");
                    return Ok(());
                }
                Err(err) => {
                    error!(instrument = %ev.meta.instrument, offset = ev.meta.offset, error = %err, "could not update stats for data event");
                }
            }
            ready.push(ev.meta.instrument.clone());
        }

        let signals = {
            let data = lock_data(&self.data);
            let handlers: Vec<&DataHandler> = ready.iter().filter_map(|k| data.handler(k).ok()).collect();
            self.strategy
                .on_simultaneous_signals(&handlers, self.funding.as_ref(), &self.portfolio)
        };
        let Some(signals) = self.accept_strategy_result(signals)? else {
            return Ok(());
        };
        self.enqueue_signals(signals);
        Ok(())
    }

    // too much bad data ends the run, any other strategy failure only skips the tick
    fn accept_strategy_result<T>(&self, result: StrategyResult<T>) -> Result<Option<T>, EngineError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                error!(strategy = self.strategy.name(), error = %err, "strategy could not produce a signal");
                Ok(None)
            }
        }
    }

    fn enqueue_signals(&mut self, signals: Vec<SignalEvent>) {
        for signal in signals {
            let event = Event::Signal(signal);
            self.record_event(&event);
            self.queue.append_event(event);
        }
    }

    // 8.6: make statistics, holdings and futures pnl aware of the new price.
    // a duplicate offset is handed back so each caller can decide what it means
    pub(super) fn update_stats_for_data_event(&mut self, ev: &DataEvent) -> Result<(), EngineError> {
        let key = &ev.meta.instrument;
        if let Err(err) = self.statistics.set_event_for_offset(&Event::Data(ev.clone())) {
            if err.is_already_processed() {
                return Err(err.into());
            }
            error!(instrument = %key, offset = ev.meta.offset, error = %err, "could not record data event");
        }

        let funds = self.funding.funding_for_event(key)?;
        match self.portfolio.update_holdings(ev, funds) {
            Ok(holding) => {
                if let Err(err) = self.statistics.add_holdings_for_time(&holding) {
                    error!(instrument = %key, offset = ev.meta.offset, error = %err, "could not record holding");
                }
            }
            Err(err) => error!(instrument = %key, offset = ev.meta.offset, error = %err, "could not update holdings"),
        }

        if !key.is_futures() {
            return Ok(());
        }
        self.funding.collateral_reader(key)?;

        match self.portfolio.update_pnl(ev) {
            Ok(()) => {}
            // nothing to mark before the first order
            Err(PortfolioError::PositionNotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let mut pnl = self.portfolio.latest_pnl_for_event(&ev.meta)?;
        if pnl.is_liquidated() {
            return Ok(());
        }

        if !self.config.real_orders {
            let collateral = self.funding.collateral_reader(key)?;
            if let Err(err) = self.portfolio.check_liquidation_status(ev, collateral, &pnl) {
                if err.is_liquidation() {
                    self.trigger_liquidations_for_exchange(ev, &mut pnl)?;
                }
                return Err(err.into());
            }
        }

        self.statistics.add_pnl_for_time(&pnl)?;
        Ok(())
    }

    // 8.7: forced close of everything the exchange holds
    pub(super) fn trigger_liquidations_for_exchange(
        &mut self,
        ev: &DataEvent,
        pnl: &mut PnlSummary,
    ) -> Result<(), EngineError> {
        let exchange = &ev.meta.instrument;
        let latest_ticks: Vec<DataEvent> = {
            let data = lock_data(&self.data);
            data.all_data()
                .filter(|h| h.instrument().same_exchange(exchange) && h.instrument() != exchange)
                .filter_map(|h| h.latest().cloned())
                .chain(std::iter::once(ev.clone()))
                .collect()
        };
        let orders = self
            .portfolio
            .create_liquidation_orders_for_exchange(ev, &latest_ticks, self.funding.as_ref())?;
        for order in orders {
            let key = order.meta.instrument.clone();
            // the order may land on an offset no data event has been recorded for yet
            let tick = latest_ticks
                .iter()
                .find(|t| t.meta.instrument == key && t.meta.offset == order.meta.offset);
            match tick {
                Some(tick) => {
                    if let Err(err) = self.statistics.set_event_for_offset(&Event::Data(tick.clone())) {
                        if !err.is_already_processed() {
                            return Err(err.into());
                        }
                    }
                }
                None => warn!(instrument = %key, offset = order.meta.offset, "no price to record for liquidation"),
            }

            let event = Event::Order(order);
            self.record_event(&event);
            self.queue.append_event(event);
            self.funding.liquidate(&key)?;
            debug!(instrument = %key, "liquidation order queued");
        }

        if pnl.mark_liquidated() {
            self.liquidations += 1;
            warn!(instrument = %pnl.instrument, offset = pnl.offset, "position liquidated");
        }
        self.statistics.add_pnl_for_time(pnl)?;
        Ok(())
    }
}
