//! Domain types shared by the task orchestration engine.
//!
//! Everything here is plain data: tasks, plans, steps, step results,
//! execution contexts and checkpoints. No I/O, no async.

pub mod domain;
mod error;

pub use domain::*;
pub use error::CoreError;
