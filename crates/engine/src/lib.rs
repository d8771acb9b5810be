//! Irrigation Engine: the on-device controller that owns valves, sensors,
//! per-plant schedules, and the pulsed wet/rest irrigation algorithm.

pub mod algorithm;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod events;
pub mod managers;
pub mod messages;
pub mod plant;
pub mod relay;
pub mod scheduler;
pub mod sensor;
pub mod task_registry;
pub mod valve;

pub use engine::{Engine, EngineScheduleSink, NewPlantParams};
pub use error::{EngineError, EngineResult};
