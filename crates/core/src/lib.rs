// Minion execution runtime for the Stampede load-testing platform

pub mod config;
pub mod context;
pub mod decorator;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod minion;
pub mod step;
pub mod sync;
pub mod telemetry;
pub mod types;

pub use types::*;
