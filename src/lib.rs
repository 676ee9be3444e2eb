//! Streaming chat client with concurrent tool execution.
//!
//! A model response is decoded from SSE into content and function-call
//! events, shown as it arrives, and any requested tool calls are run against
//! registered tool clients with bounded concurrency and a per-call timeout.
//! Results go back into the conversation and trigger a follow-up turn.

pub mod client;
pub mod config;
pub mod core;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod tools;
pub mod view;

#[cfg(test)]
mod test_support;
