//! Token counting behind a narrow interface.
//!
//! The chat handler's budget gate needs per-message token counts before a
//! call goes out. A remote tokenizer service sits behind the same trait in
//! production; the heuristic implementation keeps the runtime self-contained
//! and is deliberately pessimistic.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::chat::ChatHistory;

/// Fixed per-message overhead, covering role and framing tokens.
const PER_MESSAGE_OVERHEAD: i64 = 4;

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("tokenizer unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Tokenizer: Send + Sync {
    /// Count the tokens of `text` under `model`'s vocabulary.
    async fn count_tokens(&self, model: &str, text: &str) -> Result<i64, TokenizerError>;
}

/// Sum token counts over a history's messages, overhead included.
pub async fn count_history_tokens(
    tokenizer: &dyn Tokenizer,
    model: &str,
    history: &ChatHistory,
) -> Result<i64, TokenizerError> {
    let mut total = 0;
    for message in &history.messages {
        total += tokenizer.count_tokens(model, &message.content).await? + PER_MESSAGE_OVERHEAD;
    }
    Ok(total)
}

/// Character-quarter estimate. Biased high for CJK and code, which is the
/// safe direction for a budget gate.
#[derive(Debug, Clone)]
pub struct HeuristicTokenizer {
    chars_per_token: usize,
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl HeuristicTokenizer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Tokenizer for HeuristicTokenizer {
    async fn count_tokens(&self, _model: &str, text: &str) -> Result<i64, TokenizerError> {
        if text.is_empty() {
            return Ok(0);
        }
        let chars = text.chars().count();
        Ok(((chars + self.chars_per_token - 1) / self.chars_per_token) as i64)
    }
}
