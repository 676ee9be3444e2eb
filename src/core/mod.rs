//! Streaming pipeline: decoder, channel, accumulators, tool-call engine and
//! the turn loop that ties them together.

pub mod channel;
pub mod content;
pub mod decoder;
pub mod engine;
pub mod events;
pub mod feedback;
pub mod function_call;
pub mod session;

pub use engine::{EngineConfig, EngineError, ToolCallEngine, ToolCallOutcome};
pub use events::{Incoming, StreamError};
pub use session::{ChatSession, SessionReport};
