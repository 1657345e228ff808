//! Live polling tests
//!
//! Mock sources feed the checker on short intervals; the engine tests at the bottom
//! drive `run_live` end to end.

use async_trait::async_trait;
use backtest_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const START_MS: i64 = 1_700_000_000_000;
const WAIT: Duration = Duration::from_secs(5);

fn btc() -> InstrumentKey {
    InstrumentKey::spot("binance", "BTC", "USDT")
}

fn candles(key: &InstrumentKey, closes: &[Decimal]) -> Vec<DataEvent> {
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| {
            let time = Timestamp::from_millis(START_MS + i as i64 * Interval::ONE_MINUTE.as_millis());
            DataEvent::candle(key.clone(), time, Interval::ONE_MINUTE, [*close, *close, *close, *close, dec!(100)])
        })
        .collect()
}

fn fast(event_timeout: Duration) -> LiveConfig {
    LiveConfig {
        check_interval: Duration::from_millis(10),
        retry_tolerance: 3,
        retry_wait: Duration::from_millis(5),
        event_timeout,
    }
}

/// Returns the first `n` candles on the n-th poll, then keeps repeating them all.
struct Replay {
    key: InstrumentKey,
    candles: Vec<DataEvent>,
    polls: AtomicUsize,
    failures: AtomicUsize,
}

impl Replay {
    fn new(key: InstrumentKey, closes: &[Decimal]) -> Self {
        let candles = candles(&key, closes);
        Self {
            key,
            candles,
            polls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    fn failing_first(self, failures: usize) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl LiveDataSource for Replay {
    fn instrument(&self) -> &InstrumentKey {
        &self.key
    }

    fn interval(&self) -> Interval {
        Interval::ONE_MINUTE
    }

    async fn fetch_latest(&self) -> Result<Vec<DataEvent>, SourceError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(SourceError("exchange unavailable".to_string()));
        }
        let n = (self.polls.fetch_add(1, Ordering::SeqCst) + 1).min(self.candles.len());
        Ok(self.candles[..n].to_vec())
    }
}

/// Hands out the same candles on every poll.
struct Fixed {
    key: InstrumentKey,
    candles: Vec<DataEvent>,
}

#[async_trait]
impl LiveDataSource for Fixed {
    fn instrument(&self) -> &InstrumentKey {
        &self.key
    }

    fn interval(&self) -> Interval {
        Interval::ONE_MINUTE
    }

    async fn fetch_latest(&self) -> Result<Vec<DataEvent>, SourceError> {
        Ok(self.candles.clone())
    }
}

/// Never answers within any reasonable test window.
struct Hanging {
    key: InstrumentKey,
}

#[async_trait]
impl LiveDataSource for Hanging {
    fn instrument(&self) -> &InstrumentKey {
        &self.key
    }

    fn interval(&self) -> Interval {
        Interval::ONE_MINUTE
    }

    async fn fetch_latest(&self) -> Result<Vec<DataEvent>, SourceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
}

fn stream_len(data: &SharedDataHolder, key: &InstrumentKey) -> usize {
    lock_data(data).handler(key).map(DataHandler::len).unwrap_or(0)
}

mod checker {
    use super::*;

    #[tokio::test]
    async fn new_ticks_land_before_the_notice() {
        let data = DataHolder::new().shared();
        let mut checker = LiveDataChecker::new(fast(Duration::from_secs(30)), data.clone());
        checker
            .append_source(Arc::new(Fixed {
                key: btc(),
                candles: candles(&btc(), &[dec!(100), dec!(101), dec!(102)]),
            }))
            .unwrap();
        let mut updated = checker.updated();

        checker.start().unwrap();
        assert!(timeout(WAIT, updated.notified()).await.unwrap());
        assert_eq!(stream_len(&data, &btc()), 3);

        // offsets follow the stream index
        let guard = lock_data(&data);
        let offsets: Vec<Offset> = guard.handler(&btc()).unwrap().list().iter().map(|ev| ev.meta.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        drop(guard);

        checker.stop().await;
        assert!(!checker.is_running());
    }

    #[tokio::test]
    async fn repeated_candles_are_announced_once() {
        let data = DataHolder::new().shared();
        let mut checker = LiveDataChecker::new(fast(Duration::from_secs(30)), data.clone());
        checker
            .append_source(Arc::new(Fixed {
                key: btc(),
                candles: candles(&btc(), &[dec!(100), dec!(101)]),
            }))
            .unwrap();
        let mut updated = checker.updated();

        checker.start().unwrap();
        assert!(timeout(WAIT, updated.notified()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!updated.try_take());
        assert_eq!(stream_len(&data, &btc()), 2);
        checker.stop().await;
    }

    #[tokio::test]
    async fn growing_feed_coalesces_into_pending_notice() {
        let data = DataHolder::new().shared();
        let mut checker = LiveDataChecker::new(fast(Duration::from_secs(30)), data.clone());
        checker
            .append_source(Arc::new(Replay::new(btc(), &[dec!(1), dec!(2), dec!(3), dec!(4)])))
            .unwrap();
        let mut updated = checker.updated();

        checker.start().unwrap();
        // nobody reads while the feed grows
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stream_len(&data, &btc()), 4);
        assert!(updated.try_take());
        assert!(!updated.try_take());
        checker.stop().await;
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let data = DataHolder::new().shared();
        let mut checker = LiveDataChecker::new(fast(Duration::from_secs(30)), data.clone());
        checker
            .append_source(Arc::new(Replay::new(btc(), &[dec!(100)]).failing_first(2)))
            .unwrap();
        let mut updated = checker.updated();

        checker.start().unwrap();
        assert!(timeout(WAIT, updated.notified()).await.unwrap());
        assert_eq!(stream_len(&data, &btc()), 1);
        checker.stop().await;
    }

    #[tokio::test]
    async fn duplicate_source_is_rejected() {
        let mut checker = LiveDataChecker::new(LiveConfig::default(), DataHolder::new().shared());
        checker.append_source(Arc::new(Replay::new(btc(), &[dec!(1)]))).unwrap();
        let err = checker.append_source(Arc::new(Replay::new(btc(), &[dec!(1)]))).unwrap_err();
        assert_eq!(err, LiveError::DataSourceExists(btc()));
        assert_eq!(checker.sources().count(), 1);
    }

    #[tokio::test]
    async fn start_needs_sources_and_runs_once() {
        let mut checker = LiveDataChecker::new(fast(Duration::from_secs(30)), DataHolder::new().shared());
        assert_eq!(checker.start().unwrap_err(), LiveError::NoSources);

        checker.append_source(Arc::new(Replay::new(btc(), &[dec!(1)]))).unwrap();
        checker.start().unwrap();
        assert_eq!(checker.start().unwrap_err(), LiveError::AlreadyStarted);
        checker.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut checker = LiveDataChecker::new(fast(Duration::from_secs(30)), DataHolder::new().shared());
        // before start
        checker.stop().await;

        checker.append_source(Arc::new(Replay::new(btc(), &[dec!(1)]))).unwrap();
        checker.start().unwrap();
        checker.stop().await;
        checker.stop().await;
        assert!(checker.has_stopped().is_closed());
        assert!(checker.shutdown_handle().is_closed());
    }

    #[tokio::test]
    async fn stop_does_not_wait_on_a_hung_fetch() {
        let mut checker = LiveDataChecker::new(fast(Duration::from_secs(30)), DataHolder::new().shared());
        checker.append_source(Arc::new(Hanging { key: btc() })).unwrap();
        checker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(Duration::from_secs(2), checker.stop()).await.unwrap();
        assert!(checker.has_stopped().is_closed());
    }

    #[tokio::test]
    async fn idle_watchdog_abandons_a_hung_fetch() {
        let mut checker = LiveDataChecker::new(fast(Duration::from_millis(100)), DataHolder::new().shared());
        checker.append_source(Arc::new(Hanging { key: btc() })).unwrap();
        checker.start().unwrap();

        // the idle watchdog closes shutdown, the fetch is abandoned with it
        timeout(Duration::from_secs(2), checker.has_stopped().wait()).await.unwrap();
        checker.stop().await;
    }

    #[tokio::test]
    async fn idle_feed_stops_the_checker() {
        let mut checker = LiveDataChecker::new(fast(Duration::from_millis(50)), DataHolder::new().shared());
        checker.append_source(Arc::new(Replay::new(btc(), &[dec!(1)]))).unwrap();
        checker.start().unwrap();

        timeout(WAIT, checker.has_stopped().wait()).await.unwrap();
        assert!(!checker.is_running());
        checker.stop().await;
    }
}

mod live_runs {
    use super::*;

    fn live_engine(event_timeout_ms: u64) -> Engine {
        let mut config = RunConfig::default();
        config.nickname = "live-test".to_string();
        config.currencies[0].taker_fee = Decimal::ZERO;
        config.live = Some(LiveSettings {
            check_interval_ms: 10,
            retry_tolerance: 1,
            retry_wait_ms: 5,
            event_timeout_ms,
            real_orders: false,
        });
        Engine::from_config(&config, DataHolder::new().shared(), Box::new(DollarCostAverage::new(dec!(1)))).unwrap()
    }

    #[tokio::test]
    async fn run_live_processes_updates_until_shutdown() {
        let mut engine = live_engine(30_000);
        engine
            .live_mut()
            .unwrap()
            .append_source(Arc::new(Replay::new(btc(), &[dec!(100), dec!(101), dec!(102), dec!(103)])))
            .unwrap();

        let shutdown = engine.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            shutdown.close();
        });

        let summary = timeout(WAIT, engine.run_live()).await.unwrap().unwrap();
        assert!(summary.metadata.live);
        assert!(summary.metadata.closed);
        assert_eq!(summary.fills, 4);
        assert_eq!(engine.statistics().records(&btc()).len(), 4);
        assert!(!engine.live_mut().unwrap().is_running());
    }

    #[tokio::test]
    async fn quiet_feed_ends_run_live() {
        let mut engine = live_engine(100);
        engine
            .live_mut()
            .unwrap()
            .append_source(Arc::new(Fixed {
                key: btc(),
                candles: candles(&btc(), &[dec!(100)]),
            }))
            .unwrap();

        let summary = timeout(WAIT, engine.run_live()).await.unwrap().unwrap();
        assert_eq!(summary.fills, 1);
        assert!(engine.has_ran());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_poll_feed_is_never_missed() {
        // pollers on other threads race the engine to the first notice
        for _ in 0..20 {
            let mut engine = live_engine(60);
            engine
                .live_mut()
                .unwrap()
                .append_source(Arc::new(Fixed {
                    key: btc(),
                    candles: candles(&btc(), &[dec!(100)]),
                }))
                .unwrap();

            let summary = timeout(WAIT, engine.run_live()).await.unwrap().unwrap();
            assert_eq!(summary.fills, 1);
        }
    }

    #[tokio::test]
    async fn run_live_twice_is_already_ran() {
        let mut engine = live_engine(50);
        engine
            .live_mut()
            .unwrap()
            .append_source(Arc::new(Replay::new(btc(), &[dec!(100)])))
            .unwrap();
        timeout(WAIT, engine.run_live()).await.unwrap().unwrap();

        let err = engine.run_live().await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRan(_)));
    }

    #[tokio::test]
    async fn backtest_engine_cannot_run_live() {
        let mut engine = Engine::from_config(
            &RunConfig::default(),
            DataHolder::new().shared(),
            Box::new(DollarCostAverage::new(dec!(1))),
        )
        .unwrap();
        assert!(matches!(engine.run_live().await, Err(EngineError::LiveOnly)));
    }
}
