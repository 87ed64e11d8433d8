//! Task execution: one handler dispatch away from models and hooks.

pub mod errors;
pub mod executor;
pub mod parse;

pub use errors::TaskError;
pub use executor::{StandardTaskExecutor, TaskInput, TaskOutput, TaskRunner};
