//! Collects the function-call buffer and parses it into tool-call requests.

use thiserror::Error;

use super::channel::Subscriber;
use super::events::{FUNCTION_CALL_SENTINEL, Incoming, StreamError};
use crate::models::ToolCallRequest;

#[derive(Debug, Error)]
pub enum FunctionCallParseError {
    #[error("function-call buffer does not start with `function_call`")]
    MissingSentinel,
    #[error("invalid function-call payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse a `function_call[...]` buffer.
pub fn parse_function_calls(buffer: &str) -> Result<Vec<ToolCallRequest>, FunctionCallParseError> {
    let payload = buffer
        .strip_prefix(FUNCTION_CALL_SENTINEL)
        .ok_or(FunctionCallParseError::MissingSentinel)?;
    Ok(serde_json::from_str(payload)?)
}

/// Buffers `FunctionCall` events and yields the turn's batch on completion.
#[derive(Debug, Default)]
pub struct FunctionCallAccumulator {
    buffer: String,
    batch: Option<Vec<ToolCallRequest>>,
}

impl FunctionCallAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The parsed batch, if the stream completed with at least one call.
    #[must_use]
    pub fn into_batch(self) -> Option<Vec<ToolCallRequest>> {
        self.batch
    }
}

impl Subscriber<Incoming> for FunctionCallAccumulator {
    fn on_next(&mut self, item: Incoming) {
        if let Incoming::FunctionCall(text) = item {
            self.buffer.push_str(&text);
        }
    }

    fn on_error(&mut self, error: StreamError) {
        if !self.buffer.is_empty() {
            tracing::debug!(%error, "Discarding function-call buffer");
        }
        self.buffer.clear();
    }

    fn on_complete(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        if !buffer.starts_with(FUNCTION_CALL_SENTINEL) {
            return;
        }
        match parse_function_calls(&buffer) {
            Ok(calls) if calls.is_empty() => {}
            Ok(calls) => {
                tracing::info!(count = calls.len(), "Model requested tool calls");
                self.batch = Some(calls);
            }
            Err(err) => tracing::error!(error = %err, payload = %buffer, "Failed to parse function calls"),
        }
    }
}
