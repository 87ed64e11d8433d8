//! Task-chain model and execution.
//!
//! A chain is a directed state machine whose nodes invoke models or hooks
//! and whose edges are chosen by evaluating each node's output. This module
//! owns the declarative model ([`definition`]), the pure evaluation pieces
//! (templates, transitions, compose) and the state-machine walker
//! ([`executor`]).

pub mod compose;
pub mod definition;
pub mod errors;
pub mod executor;
pub mod template;
pub mod transition;

pub use definition::{
    ChainDefinition, ChainTask, ComposeSpec, ExecuteConfig, HookCall, TaskHandler, Transition,
    TransitionBranch, TransitionOperator,
};
pub use errors::ChainError;
pub use executor::{ChainExecutor, ChainFailure, ChainResult};
