//! # taskchain
//!
//! Runtime for orchestrating generative-AI workflows declared as task
//! chains: directed state machines whose nodes invoke LLMs, embedding
//! models or external hooks, and whose edges are chosen by evaluating each
//! node's output. The HTTP surface accepts ad-hoc prompts, OpenAI-style
//! chat requests, or full chain definitions plus input, and answers with
//! the terminal output and a per-step execution trace.

pub mod bus;
pub mod chain;
pub mod hooks;
pub mod inspector;
pub mod modelrepo;
pub mod providers;
pub mod runtimestate;
pub mod server;
pub mod store;
pub mod tasks;
pub mod tokenizer;
pub mod tracker;
pub mod types;

pub use chain::{ChainDefinition, ChainError, ChainExecutor};
pub use inspector::{CapturedStateUnit, Inspector};
pub use modelrepo::{ModelRepo, ModelResolver, ResolveRequest};
pub use tasks::{StandardTaskExecutor, TaskRunner};
pub use types::DataType;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
