//! The run loop and event dispatch.

use super::core::Engine;
use super::results::EngineError;
use crate::data::lock_data;
use crate::events::Event;
use tracing::{debug, error, info};

impl Engine {
    /// Drain the queue, pulling the next tick of every instrument whenever it runs dry.
    /// Stops on a second empty read in a row, on shutdown, or once any cursor is exhausted
    /// in a backtest. Only a fatal error is returned; everything else is logged per event.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let mut double_nil = false;
        loop {
            let Some(event) = self.queue.next_event() else {
                if self.shutdown.is_closed() {
                    return Ok(());
                }
                if double_nil {
                    if self.config.verbose {
                        info!("no new data on second check");
                    }
                    return Ok(());
                }
                double_nil = true;
                if !self.load_next_data() && (!self.config.live || self.queue.is_empty()) {
                    return Ok(());
                }
                continue;
            };
            double_nil = false;
            self.process_event(event)?;
        }
    }

    // 8.3: advance every cursor once. true when at least one tick was queued.
    // a backtest ends on the first exhausted cursor, live feeds just have nothing yet
    fn load_next_data(&mut self) -> bool {
        let simultaneous = self.strategy.using_simultaneous_processing();
        let live = self.config.live;
        let mut queued = false;
        let mut data = lock_data(&self.data);
        for handler in data.all_data_mut() {
            let Some(ev) = handler.next() else {
                if !live {
                    if !self.has_processed_an_event {
                        error!(instrument = %handler.instrument(), "unable to advance data");
                    } else {
                        debug!(instrument = %handler.instrument(), "no more data");
                    }
                    return false;
                }
                if self.has_processed_an_event {
                    debug!(instrument = %handler.instrument(), "no new live data");
                }
                continue;
            };
            let offset = ev.meta.offset;
            // the simultaneous stage reads every other instrument's latest tick itself
            if simultaneous && self.processed_data_at_offset.contains(&offset) {
                continue;
            }
            self.queue.append_event(Event::Data(ev));
            self.processed_data_at_offset.insert(offset);
            queued = true;
        }
        queued
    }

    // one event, with the error policy applied
    pub(super) fn process_event(&mut self, event: Event) -> Result<(), EngineError> {
        let kind = event.kind();
        let instrument = event.instrument().clone();
        let offset = event.offset();
        if let Err(err) = self.handle_event(event) {
            if err.is_fatal() {
                error!(instrument = %instrument, offset, error = %err, "halting run");
                return Err(err);
            }
            error!(instrument = %instrument, offset, kind, error = %err, "event failed");
        }
        self.has_processed_an_event = true;
        self.events_processed += 1;
        Ok(())
    }

    // 8.4: funding context, collateral refresh, dispatch by kind, funding snapshot
    fn handle_event(&mut self, event: Event) -> Result<(), EngineError> {
        let key = event.instrument().clone();
        let time = event.time();
        if self.config.verbose {
            info!(instrument = %key, offset = event.offset(), kind = event.kind(), direction = ?event.direction(), "handling event");
        }

        self.funding.funding_for_event(&key)?;
        if self.funding.has_futures() {
            self.funding.update_collateral_for_event(&key, false)?;
        }

        match event {
            Event::Data(ev) => {
                if self.strategy.using_simultaneous_processing() {
                    self.process_simultaneous_data_events()?;
                } else {
                    self.process_single_data_event(&ev)?;
                }
            }
            Event::Signal(ev) => self.process_signal_event(ev)?,
            Event::Order(ev) => self.process_order_event(ev)?,
            Event::Fill(ev) => {
                // live runs log every fill as it happens
                let line = self.config.live.then(|| self.statistics.create_log(&Event::Fill(ev.clone())));
                self.process_fill_event(ev)?;
                if let Some(line) = line {
                    info!("{line}");
                }
            }
        }

        self.funding.create_snapshot(time);
        Ok(())
    }

    // record an event, logging anything that goes wrong
    pub(super) fn record_event(&mut self, event: &Event) {
        if let Err(err) = self.statistics.set_event_for_offset(event) {
            error!(instrument = %event.instrument(), offset = event.offset(), kind = event.kind(), error = %err, "could not record event");
        }
    }
}
