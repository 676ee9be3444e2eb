//! Turn driver: streams a model response, accumulates it, executes any tool
//! calls and runs the follow-up turns the feedback loop schedules.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::channel::{Publisher, drive};
use super::content::ContentAccumulator;
use super::decoder::StreamDecoder;
use super::engine::{EngineConfig, EngineError, ToolCallEngine, ToolCallOutcome};
use super::events::StreamError;
use super::feedback::{FeedbackLoop, TurnScheduler};
use super::function_call::FunctionCallAccumulator;
use crate::client::{LineStream, ModelClient};
use crate::config::DEFAULT_MAX_FOLLOW_UP_TURNS;
use crate::models::{ChatMessage, Conversation};
use crate::tools::{ToolClientRegistry, function_definitions};
use crate::view::Presenter;

/// What one user message led to.
#[derive(Debug, Default)]
pub struct SessionReport {
    /// Model turns run, including the first.
    pub turns: usize,
    /// Tool outcomes across all turns, in completion order.
    pub tool_outcomes: Vec<ToolCallOutcome>,
}

/// Queues follow-up turns for the session loop.
struct QueuedTurns {
    tx: mpsc::UnboundedSender<Conversation>,
}

impl TurnScheduler for QueuedTurns {
    fn schedule_turn(&self, conversation: Conversation) {
        if self.tx.send(conversation).is_err() {
            tracing::debug!("Follow-up turn scheduled after the session loop ended");
        }
    }
}

pub struct ChatSession {
    model: Arc<dyn ModelClient>,
    presenter: Arc<dyn Presenter>,
    engine: ToolCallEngine,
    conversation: Conversation,
    max_follow_up_turns: usize,
}

impl ChatSession {
    #[must_use]
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: Arc<dyn ToolClientRegistry>,
        presenter: Arc<dyn Presenter>,
        engine_config: EngineConfig,
    ) -> Self {
        Self {
            model,
            engine: ToolCallEngine::new(registry, Arc::clone(&presenter), engine_config),
            presenter,
            conversation: Conversation::new(),
            max_follow_up_turns: DEFAULT_MAX_FOLLOW_UP_TURNS,
        }
    }

    #[must_use]
    pub fn with_max_follow_up_turns(mut self, turns: usize) -> Self {
        self.max_follow_up_turns = turns;
        self
    }

    #[must_use]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Append `message` and run turns until the model stops
    /// calling tools or the follow-up limit is reached.
    pub async fn send_user_message(
        &self,
        message: ChatMessage,
        cancel: &CancellationToken,
    ) -> Result<SessionReport> {
        self.conversation.push(message);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler: Arc<dyn TurnScheduler> = Arc::new(QueuedTurns { tx });
        let mut report = SessionReport::default();
        let mut next = Some(self.conversation.clone());

        while let Some(conversation) = next.take() {
            if report.turns > self.max_follow_up_turns {
                tracing::warn!(
                    limit = self.max_follow_up_turns,
                    "Follow-up turn limit reached; stopping"
                );
                break;
            }
            report.turns += 1;
            let outcomes = self
                .run_turn(&conversation, &scheduler, cancel)
                .await
                .with_context(|| format!("Model turn {} failed", report.turns))?;
            report.tool_outcomes.extend(outcomes);
            next = rx.try_recv().ok();
        }

        Ok(report)
    }

    async fn run_turn(
        &self,
        conversation: &Conversation,
        scheduler: &Arc<dyn TurnScheduler>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolCallOutcome>> {
        let tools = function_definitions(self.engine.registry().as_ref());
        let messages = conversation.snapshot();
        tracing::debug!(messages = messages.len(), tools = tools.len(), "Opening model stream");

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StreamError::Cancelled.into()),
            opened = self.model.open_stream(&messages, &tools) => opened,
        };
        // A failed request still reaches subscribers as a stream error.
        let lines: LineStream = match opened {
            Ok(lines) => lines,
            Err(err) => Box::pin(futures_util::stream::once(async move {
                Err::<String, StreamError>(err)
            })),
        };

        let publisher = Publisher::new();
        let content = publisher.subscribe();
        let calls = publisher.subscribe();
        let mut decoder = StreamDecoder::new();

        let (decoded, content, calls) = tokio::join!(
            decoder.run(lines, &publisher, cancel),
            drive(content, ContentAccumulator::new(Arc::clone(&self.presenter))),
            drive(calls, FunctionCallAccumulator::new()),
        );

        for text in content.into_messages() {
            conversation.push(ChatMessage::assistant(text));
        }
        let summary = decoded?;
        tracing::debug!(
            lines = summary.lines,
            events = summary.content_events,
            saw_done = summary.saw_done,
            "Model stream finished"
        );

        let Some(batch) = calls.into_batch() else {
            return Ok(Vec::new());
        };

        let mut feedback = FeedbackLoop::new(conversation.clone(), Arc::clone(scheduler));
        match self.engine.execute(batch, &mut feedback, cancel).await {
            Ok(outcomes) => {
                feedback.finish();
                Ok(outcomes)
            }
            Err(EngineError::EmptyBatch) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}
