//! Streaming response parcels.
//!
//! Provider streams (SSE or newline-delimited JSON) are surfaced as a lazy
//! finite sequence of [`StreamParcel`] values. Termination is either
//! producer-driven (the backend closes the stream) or consumer-driven
//! (cancellation drops the stream).

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A single unit of a streamed model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamParcel {
    /// A data fragment (usually a text delta).
    Data { data: String },
    /// A terminal error; no further parcels follow.
    Error { message: String },
}

impl StreamParcel {
    pub fn data(s: impl Into<String>) -> Self {
        StreamParcel::Data { data: s.into() }
    }

    pub fn error(s: impl Into<String>) -> Self {
        StreamParcel::Error { message: s.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamParcel::Error { .. })
    }
}

/// The stream type returned by provider stream clients.
pub type ParcelStream = BoxStream<'static, StreamParcel>;
