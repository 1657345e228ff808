//! Engine configuration options.

/// Engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Log every dequeued event.
    pub verbose: bool,
    /// Fed by a live data checker. exhausted cursors wait for the next update instead of ending the run.
    pub live: bool,
    /// Orders go to a real venue, so the venue liquidates and the engine does not.
    pub real_orders: bool,
    pub close_positions_on_stop: bool,
}
