//! Live data polling.
//!
//! One tokio task per registered source polls on the check interval, retries transient
//! failures a bounded number of times, writes new ticks into the shared [`DataHolder`]
//! and only then raises the `updated` notice. The engine is the only reader, and it only
//! reads after a notice, so the holder sees one writer at a time.
//!
//! [`DataHolder`]: crate::data::DataHolder

pub mod notice;

pub use notice::{Latch, Notice, NoticeReceiver};

use crate::data::{lock_data, DataHandler, SharedDataHolder};
use crate::events::DataEvent;
use crate::types::{InstrumentKey, Interval, Timestamp};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SourceError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveError {
    #[error("data source already registered for {0}")]
    DataSourceExists(InstrumentKey),

    #[error("live data checker already started")]
    AlreadyStarted,

    #[error("no data sources registered")]
    NoSources,

    #[error("no data processed within timeframe")]
    LiveDataTimeout,

    #[error("source failed after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: SourceError },

    #[error("live data checker shutting down")]
    ShuttingDown,
}

/// Where live candles come from. one source per instrument.
#[async_trait]
pub trait LiveDataSource: Send + Sync {
    fn instrument(&self) -> &InstrumentKey;
    fn interval(&self) -> Interval;
    /// Latest closed candles. may repeat ones already returned.
    async fn fetch_latest(&self) -> Result<Vec<DataEvent>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConfig {
    pub check_interval: Duration,
    pub retry_tolerance: u32,
    pub retry_wait: Duration,
    /// stop if nothing new arrives for this long
    pub event_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            retry_tolerance: 3,
            retry_wait: Duration::from_millis(500),
            event_timeout: Duration::from_secs(60),
        }
    }
}

// 9.2: per-source state behind the shared lock
#[derive(Debug, Default)]
struct SourceState {
    processed: HashSet<Timestamp>,
    pending: Vec<DataEvent>,
}

struct PollContext {
    config: LiveConfig,
    data: SharedDataHolder,
    states: Mutex<BTreeMap<InstrumentKey, SourceState>>,
    last_update: Mutex<Instant>,
    updated: Notice,
    shutdown: Latch,
    stopped: Latch,
    active: AtomicUsize,
}

impl PollContext {
    // dedupe against what this source already announced, then hand new ticks to the holder
    fn accept(&self, key: &InstrumentKey, interval: Interval, events: Vec<DataEvent>) -> usize {
        let fresh = {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let state = states.entry(key.clone()).or_default();
            for ev in events {
                if state.processed.insert(ev.meta.time) {
                    state.pending.push(ev);
                }
            }
            std::mem::take(&mut state.pending)
        };
        if fresh.is_empty() {
            return 0;
        }

        let added = {
            let mut holder = lock_data(&self.data);
            if holder.handler(key).is_err() {
                holder.set_data_for_currency(DataHandler::new(key.clone(), interval));
            }
            match holder.handler_mut(key) {
                Ok(handler) => handler.append_stream(fresh),
                Err(err) => {
                    error!(instrument = %key, error = %err, "live handler vanished");
                    0
                }
            }
        };
        if added > 0 {
            *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        }
        added
    }

    fn worker_done(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.stopped.close();
            info!("live data checker stopped");
        }
    }
}

// one fetch bounded by the event timeout. None once shutdown wins the race
async fn fetch_once(source: &dyn LiveDataSource, ctx: &PollContext) -> Option<Result<Vec<DataEvent>, SourceError>> {
    let limit = ctx.config.event_timeout;
    tokio::select! {
        _ = ctx.shutdown.wait() => None,
        fetched = tokio::time::timeout(limit, source.fetch_latest()) => Some(fetched.unwrap_or_else(|_| {
            Err(SourceError(format!("fetch timed out after {}ms", limit.as_millis())))
        })),
    }
}

async fn fetch_with_retry(source: &dyn LiveDataSource, ctx: &PollContext) -> Result<Vec<DataEvent>, LiveError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match fetch_once(source, ctx).await {
            None => return Err(LiveError::ShuttingDown),
            Some(Ok(events)) => return Ok(events),
            Some(Err(err)) => err,
        };
        if attempt > ctx.config.retry_tolerance {
            return Err(LiveError::RetriesExhausted {
                attempts: attempt,
                source: err,
            });
        }
        warn!(instrument = %source.instrument(), attempt, error = %err, "live fetch failed, retrying");
        if !ctx.shutdown.sleep(ctx.config.retry_wait).await {
            return Err(LiveError::ShuttingDown);
        }
    }
}

async fn poll_source(source: Arc<dyn LiveDataSource>, ctx: Arc<PollContext>) {
    let key = source.instrument().clone();
    debug!(instrument = %key, "live poller started");
    loop {
        match fetch_with_retry(source.as_ref(), &ctx).await {
            Ok(events) => {
                let added = ctx.accept(&key, source.interval(), events);
                if added > 0 {
                    debug!(instrument = %key, added, "new live data");
                    ctx.updated.raise();
                }
            }
            Err(LiveError::ShuttingDown) => break,
            Err(err) => error!(instrument = %key, error = %err, "live fetch gave up"),
        }
        if !ctx.shutdown.sleep(ctx.config.check_interval).await {
            break;
        }
    }
    ctx.worker_done();
}

async fn watch_timeout(ctx: Arc<PollContext>) {
    while ctx.shutdown.sleep(ctx.config.check_interval).await {
        let idle = ctx
            .last_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if idle > ctx.config.event_timeout {
            error!(idle_ms = idle.as_millis() as u64, error = %LiveError::LiveDataTimeout, "stopping live data checker");
            ctx.shutdown.close();
            break;
        }
    }
    ctx.worker_done();
}

// 9.0: the checker
pub struct LiveDataChecker {
    config: LiveConfig,
    data: SharedDataHolder,
    sources: Vec<Arc<dyn LiveDataSource>>,
    updated: Notice,
    shutdown: Latch,
    stopped: Latch,
    workers: Vec<JoinHandle<()>>,
}

impl LiveDataChecker {
    pub fn new(config: LiveConfig, data: SharedDataHolder) -> Self {
        Self {
            config,
            data,
            sources: Vec::new(),
            updated: Notice::new(),
            shutdown: Latch::new(),
            stopped: Latch::new(),
            workers: Vec::new(),
        }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn append_source(&mut self, source: Arc<dyn LiveDataSource>) -> Result<(), LiveError> {
        let key = source.instrument();
        if self.sources.iter().any(|s| s.instrument() == key) {
            return Err(LiveError::DataSourceExists(key.clone()));
        }
        self.sources.push(source);
        Ok(())
    }

    pub fn sources(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.sources.iter().map(|s| s.instrument())
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty() && !self.stopped.is_closed()
    }

    /// Spawn the pollers. must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<(), LiveError> {
        if self.is_running() {
            return Err(LiveError::AlreadyStarted);
        }
        if self.sources.is_empty() {
            return Err(LiveError::NoSources);
        }
        // a finished run leaves closed latches behind
        if self.shutdown.is_closed() || self.stopped.is_closed() {
            self.shutdown = Latch::new();
            self.stopped = Latch::new();
        }
        self.workers.clear();

        let ctx = Arc::new(PollContext {
            config: self.config.clone(),
            data: Arc::clone(&self.data),
            states: Mutex::new(BTreeMap::new()),
            last_update: Mutex::new(Instant::now()),
            updated: self.updated.clone(),
            shutdown: self.shutdown.clone(),
            stopped: self.stopped.clone(),
            active: AtomicUsize::new(self.sources.len() + 1),
        });
        for source in &self.sources {
            self.workers
                .push(tokio::spawn(poll_source(Arc::clone(source), Arc::clone(&ctx))));
        }
        self.workers.push(tokio::spawn(watch_timeout(ctx)));
        info!(sources = self.sources.len(), "live data checker started");
        Ok(())
    }

    /// Close the shutdown latch and wait for every worker. safe to call repeatedly or before start.
    pub async fn stop(&mut self) {
        self.shutdown.close();
        for handle in self.workers.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "live worker panicked");
            }
        }
    }

    /// Raised whenever new data lands in the holder.
    pub fn updated(&self) -> NoticeReceiver {
        self.updated.subscribe()
    }

    /// Closed once every worker has exited.
    pub fn has_stopped(&self) -> Latch {
        self.stopped.clone()
    }

    pub fn shutdown_handle(&self) -> Latch {
        self.shutdown.clone()
    }
}

impl std::fmt::Debug for LiveDataChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveDataChecker")
            .field("config", &self.config)
            .field("sources", &self.sources.len())
            .field("running", &self.is_running())
            .finish()
    }
}
