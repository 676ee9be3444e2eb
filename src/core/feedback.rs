//! Appends tool results to the conversation and schedules the follow-up turn.

use std::sync::Arc;

use super::engine::{CompletionSink, ToolCallOutcome};
use crate::models::{ChatMessage, Conversation};

/// Starts a new model turn over a conversation. Fire and forget.
pub trait TurnScheduler: Send + Sync {
    fn schedule_turn(&self, conversation: Conversation);
}

/// Records each outcome as an invocation/result message pair and, once the
/// batch is done, schedules exactly one follow-up turn.
pub struct FeedbackLoop {
    conversation: Conversation,
    scheduler: Arc<dyn TurnScheduler>,
    recorded: usize,
}

impl FeedbackLoop {
    #[must_use]
    pub fn new(conversation: Conversation, scheduler: Arc<dyn TurnScheduler>) -> Self {
        Self {
            conversation,
            scheduler,
            recorded: 0,
        }
    }

    /// Outcomes appended so far.
    #[must_use]
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Schedule the follow-up turn. Consumes the loop so it can only happen once.
    pub fn finish(self) {
        tracing::debug!(results = self.recorded, "Scheduling follow-up turn");
        self.scheduler.schedule_turn(self.conversation);
    }
}

impl CompletionSink for FeedbackLoop {
    fn on_completion(&mut self, outcome: &ToolCallOutcome) {
        self.conversation
            .push(ChatMessage::function_call(&outcome.request));
        self.conversation
            .push(ChatMessage::function_result(&outcome.request, &outcome.result));
        self.recorded += 1;
    }
}
