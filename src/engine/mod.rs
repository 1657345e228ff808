// 8.0: the orchestration engine. drains the event queue, pulls new ticks from every
// cursor when the queue runs dry and pushes each event through data -> signal -> order -> fill.
// single threaded; the live loop only decides when to call run().

mod config;
mod core;
mod data_events;
mod live;
mod pipeline;
mod results;
mod run;

pub use config::EngineConfig;
pub use self::core::{Engine, EngineComponents};
pub use results::{EngineError, RunMetadata, RunSummary};
