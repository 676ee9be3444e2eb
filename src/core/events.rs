//! Events flowing from the stream decoder to its subscribers.

use thiserror::Error;

/// Prefix of the authoritative function-call buffer published at end of stream.
pub const FUNCTION_CALL_SENTINEL: &str = "function_call";

/// Kind of an [`Incoming`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncomingKind {
    Content,
    FunctionCall,
}

/// A decoded event from the model stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A fragment of assistant-visible text.
    Content(String),
    /// A fragment of the function-call buffer.
    FunctionCall(String),
}

impl Incoming {
    #[must_use]
    pub fn kind(&self) -> IncomingKind {
        match self {
            Incoming::Content(_) => IncomingKind::Content,
            Incoming::FunctionCall(_) => IncomingKind::FunctionCall,
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Incoming::Content(text) | Incoming::FunctionCall(text) => text,
        }
    }
}

/// Terminal failure of a model stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("SSE stream request failed: HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Stream transport error: {0}")]
    Transport(String),
    #[error("Stream cancelled")]
    Cancelled,
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<T> {
    Next(T),
    Complete,
    Error(StreamError),
}

impl<T> Signal<T> {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }
}
