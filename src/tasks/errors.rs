//! Task-level error set.
//!
//! Kinds follow their effect on the chain: retryable failures go back
//! through the attempt loop, non-retryable ones jump straight to
//! `on_failure` or fail the chain.

use thiserror::Error;

use crate::chain::compose::ComposeError;
use crate::hooks::HookError;
use crate::modelrepo::ResolverError;
use crate::providers::ProviderError;
use crate::tokenizer::TokenizerError;

#[derive(Debug, Error)]
pub enum TaskError {
    /// The task or its input is structurally unusable.
    #[error("task validation failed: {0}")]
    Validation(String),

    /// No provider matched the request.
    #[error(transparent)]
    Resolver(#[from] ResolverError),

    /// The provider call itself failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Pre-call token check over the chain budget.
    #[error("token budget exceeded: {used} > {limit}")]
    TokenBudgetExceeded { used: i64, limit: i64 },

    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),

    #[error(transparent)]
    Hook(#[from] HookError),

    /// A model answer did not parse into what the handler needs.
    #[error("unparseable model response: {0}")]
    Parse(String),

    /// Compose strategy failure.
    #[error(transparent)]
    Compose(#[from] ComposeError),

    /// Output template failure on a hook result.
    #[error("output template error: {0}")]
    Template(String),

    /// The `raise_error` handler fired.
    #[error("{0}")]
    Raised(String),

    /// The attempt's timeout elapsed.
    #[error("task attempt timed out")]
    Timeout,

    /// The cancellation token fired mid-attempt.
    #[error("task canceled")]
    Canceled,

    #[error("unsupported task type: {0}")]
    Unsupported(String),

    #[error("internal task error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Whether the chain executor's retry loop should try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Validation(_)
            | TaskError::TokenBudgetExceeded { .. }
            | TaskError::Compose(_)
            | TaskError::Canceled
            | TaskError::Unsupported(_) => false,
            TaskError::Hook(e) => e.is_retryable(),
            _ => true,
        }
    }
}
