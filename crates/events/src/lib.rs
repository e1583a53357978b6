//! Events published by the task engine and the bus that carries them.
//!
//! Observers subscribe for live delivery or replay a task's recent history.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
