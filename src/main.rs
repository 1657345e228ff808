//! Backtest simulation.
//!
//! Runs the engine end to end: a spot dollar cost average backtest, a leveraged
//! futures position that gets liquidated, and a short live run fed by a replayed source.

use async_trait::async_trait;
use backtest_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("Backtest Core Simulation\n");

    scenario_1_spot_dca()?;
    scenario_2_futures_liquidation()?;
    scenario_3_live_replay().await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

const START_MS: i64 = 1_700_000_000_000;

fn candles(key: &InstrumentKey, closes: &[Decimal]) -> Vec<DataEvent> {
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| {
            let time = Timestamp::from_millis(START_MS + i as i64 * Interval::ONE_HOUR.as_millis());
            DataEvent::candle(key.clone(), time, Interval::ONE_HOUR, [*close, *close, *close, *close, dec!(100)])
        })
        .collect()
}

fn holder(streams: Vec<(InstrumentKey, Vec<Decimal>)>) -> SharedDataHolder {
    let mut holder = DataHolder::new();
    for (key, closes) in streams {
        let events = candles(&key, &closes);
        holder.set_data_for_currency(DataHandler::with_stream(key, Interval::ONE_HOUR, events));
    }
    holder.shared()
}

fn print_summary(engine: &Engine) {
    let summary = engine.summary();
    println!(
        "  {} events, {} fills, {} liquidations",
        summary.events_processed, summary.fills, summary.liquidations
    );
    for key in engine.portfolio().instruments() {
        if let Some(h) = engine.portfolio().latest_holdings(key) {
            println!(
                "  {key}: base {} remaining {} total value {} ({}%)",
                h.base_size,
                h.remaining_funds.round_dp(2),
                h.total_value.round_dp(2),
                h.change_in_total_value_percent.round_dp(2)
            );
        }
    }
}

/// Buy 0.02 BTC every hour while the price drifts.
fn scenario_1_spot_dca() -> Result<(), EngineError> {
    println!("Scenario 1: Spot Dollar Cost Average\n");

    let config = RunConfig::default();
    let key = config.instruments()[0].clone();
    let closes = [dec!(30000), dec!(29500), dec!(31000), dec!(30500), dec!(32000), dec!(31500)];
    let data = holder(vec![(key, closes.to_vec())]);

    let mut engine = Engine::from_config(&config, data, Box::new(DollarCostAverage::new(dec!(0.02))))?;
    engine.execute()?;
    print_summary(&engine);
    Ok(())
}

/// 10x long that the market runs over.
fn scenario_2_futures_liquidation() -> Result<(), EngineError> {
    println!("\nScenario 2: Futures Liquidation\n");

    let config = RunConfig::futures();
    let key = config.instruments()[0].clone();
    let closes = [dec!(50000), dec!(48000), dec!(45000), dec!(42000), dec!(41000)];
    let data = holder(vec![(key.clone(), closes.to_vec())]);
    let strategy = Scripted::new().at(&key, 0, Direction::Long, dec!(0.1));

    let mut engine = Engine::from_config(&config, data, Box::new(strategy))?;
    engine.execute()?;
    print_summary(&engine);
    if let Ok(tracker) = engine.portfolio().tracker(&key) {
        for pos in tracker.positions() {
            println!("  position {:?} entry {} realised {}", pos.status, pos.entry_price, pos.realised_pnl);
        }
    }
    Ok(())
}

/// Hands out one more candle on every poll.
struct ReplaySource {
    key: InstrumentKey,
    candles: Vec<DataEvent>,
    served: AtomicUsize,
}

#[async_trait]
impl LiveDataSource for ReplaySource {
    fn instrument(&self) -> &InstrumentKey {
        &self.key
    }

    fn interval(&self) -> Interval {
        Interval::ONE_HOUR
    }

    async fn fetch_latest(&self) -> Result<Vec<DataEvent>, SourceError> {
        let n = (self.served.fetch_add(1, Ordering::SeqCst) + 1).min(self.candles.len());
        Ok(self.candles[..n].to_vec())
    }
}

/// Live loop over a replayed feed. ends once the feed goes quiet.
async fn scenario_3_live_replay() -> Result<(), EngineError> {
    println!("\nScenario 3: Live Replay\n");

    let mut config = RunConfig::default();
    config.nickname = "live-replay".to_string();
    config.live = Some(LiveSettings {
        check_interval_ms: 20,
        retry_tolerance: 1,
        retry_wait_ms: 10,
        event_timeout_ms: 200,
        real_orders: false,
    });
    config.strategy.close_positions_on_stop = true;
    let key = config.instruments()[0].clone();
    let closes = [dec!(30000), dec!(30100), dec!(30250), dec!(29900)];

    let data = DataHolder::new().shared();
    let mut engine = Engine::from_config(&config, data, Box::new(DollarCostAverage::new(dec!(0.01))))?;
    if let Some(live) = engine.live_mut() {
        live.append_source(Arc::new(ReplaySource {
            key: key.clone(),
            candles: candles(&key, &closes),
            served: AtomicUsize::new(0),
        }))?;
    }
    engine.run_live().await?;
    print_summary(&engine);
    Ok(())
}
