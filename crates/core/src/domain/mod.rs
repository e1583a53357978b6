mod checkpoint;
mod execution;
mod plan;
mod step;
mod step_result;
mod task;

pub use checkpoint::*;
pub use execution::*;
pub use plan::*;
pub use step::*;
pub use step_result::*;
pub use task::*;
