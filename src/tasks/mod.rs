//! Task lifecycle: durable task records plus the executor that drives them
//! through the A2A task state machine (spec.md §4.6).

pub mod executor;
pub mod store;

pub use executor::Executor;
pub use store::{CreateTaskInput, Task, TaskStatus, TaskStore, UpdateTaskInput};
