//! Signal, order and fill stages.

use super::core::Engine;
use super::results::EngineError;
use crate::data::lock_data;
use crate::events::{Event, FillDependent, FillEvent, OrderEvent, SignalEvent};
use tracing::{debug, error, warn};

impl Engine {
    // 8.8: signal -> sized, risk checked order
    pub(super) fn process_signal_event(&mut self, signal: SignalEvent) -> Result<(), EngineError> {
        let key = signal.meta.instrument.clone();
        let settings = self.exchange.currency_settings(&key)?;
        let funds = self.funding.reserver(&key)?;
        let order = self.portfolio.on_signal(&signal, settings, funds)?;
        debug!(instrument = %key, offset = order.meta.offset, direction = %order.direction, amount = %order.amount, "order created");

        let event = Event::Order(order);
        self.record_event(&event);
        self.queue.append_event(event);
        Ok(())
    }

    // 8.9: order -> fill. a fill comes back even when execution fails and is recorded either way
    pub(super) fn process_order_event(&mut self, order: OrderEvent) -> Result<(), EngineError> {
        let key = order.meta.instrument.clone();
        let result = {
            let data = lock_data(&self.data);
            let handler = data.handler(&key)?;
            let funds = self.funding.releaser(&key)?;
            self.exchange.execute_order(&order, handler, funds)
        };
        let fill = match result {
            Ok(fill) => fill,
            Err(failure) => {
                // could-not orders are expected to bounce
                if !failure.is_cannot_transact() {
                    error!(instrument = %key, offset = order.meta.offset, error = %failure, "order execution failed");
                }
                *failure.fill
            }
        };

        let event = Event::Fill(fill);
        self.record_event(&event);
        self.queue.append_event(event);
        Ok(())
    }

    // 8.10: settle holdings and compliance, then raise any dependent event
    pub(super) fn process_fill_event(&mut self, mut fill: FillEvent) -> Result<(), EngineError> {
        let key = fill.meta.instrument.clone();
        let funds = self.funding.funding_for_event(&key)?;
        let holding = self.portfolio.on_fill(&fill, funds)?;
        self.funding.update_collateral_for_event(&key, false)?;
        if fill.order.is_some() {
            self.fills += 1;
        }

        if let Err(err) = self.statistics.add_holdings_for_time(&holding) {
            error!(instrument = %key, offset = fill.meta.offset, error = %err, "could not record holding");
        }
        match self.portfolio.latest_compliance_snapshot(&key) {
            Some(snapshot) => {
                if let Err(err) = self.statistics.add_compliance_snapshot_for_time(snapshot, &fill) {
                    error!(instrument = %key, offset = fill.meta.offset, error = %err, "could not record compliance snapshot");
                }
            }
            None => warn!(instrument = %key, offset = fill.meta.offset, "fill left no compliance snapshot"),
        }

        if let Some(mut dependent) = fill.take_fill_dependent_event() {
            dependent.meta.offset = fill.meta.offset;
            if dependent.match_order_amount && fill.order.is_some() {
                dependent.amount = fill.amount;
            }
            dependent.meta.append_reason(format!("raising event after {key} fill"));
            let event = Event::Signal(dependent);
            self.record_event(&event);
            self.queue.append_event(event);
        }

        if key.is_futures() {
            return self.process_futures_fill_event(&fill);
        }
        Ok(())
    }

    // 8.11: move the position, realise its pnl into the collateral currency
    fn process_futures_fill_event(&mut self, fill: &FillEvent) -> Result<(), EngineError> {
        let key = &fill.meta.instrument;
        if fill.order.is_some() {
            let collateral = self.funding.collateral_releaser(key)?;
            let tracked = self.portfolio.track_futures_order(fill, collateral)?;

            if !tracked.realised.is_zero() {
                let currency = self.exchange.realised_pnl_currency(key)?;
                self.funding.realise_pnl(key, &currency, tracked.realised.value())?;
            }
            if let Err(err) = self.statistics.add_pnl_for_time(&tracked.summary) {
                error!(instrument = %key, offset = fill.meta.offset, error = %err, "could not record pnl");
            }
        }
        self.funding.update_collateral_for_event(key, false)?;
        Ok(())
    }
}
