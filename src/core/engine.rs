//! Tool-call execution engine.
//!
//! Runs one batch of tool calls with bounded parallelism and a per-call
//! deadline, yielding exactly one result per request in completion order.
//! Client calls are synchronous and run on blocking workers; a worker keeps
//! its concurrency permit until the client returns, even after its deadline
//! has been reported.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::models::{ToolCallRequest, ToolCallResult};
use crate::tools::{ToolClient, ToolClientRegistry};
use crate::view::{DisplayMessage, Presenter};

pub const DEFAULT_MAX_CONCURRENCY: usize = 5;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_millis(30_000);

pub const NULL_RESULT_MESSAGE: &str = "Tool returned null result";
pub const INTERRUPTED_MESSAGE: &str = "Interrupted while waiting for result";

// === Types ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub tool_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// A request paired with its single result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallOutcome {
    pub request: ToolCallRequest,
    pub result: ToolCallResult,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No function calls to execute")]
    EmptyBatch,
    /// The run was cancelled. Every request still has an outcome.
    #[error("Tool execution interrupted")]
    Interrupted { outcomes: Vec<ToolCallOutcome> },
}

/// Receives each outcome as it is drained.
pub trait CompletionSink: Send {
    fn on_completion(&mut self, outcome: &ToolCallOutcome);
}

impl CompletionSink for Vec<ToolCallOutcome> {
    fn on_completion(&mut self, outcome: &ToolCallOutcome) {
        self.push(outcome.clone());
    }
}

enum Resolution {
    Dispatch {
        client: Arc<dyn ToolClient>,
        tool: String,
    },
    Rejected(ToolCallResult),
}

// === Engine ===

pub struct ToolCallEngine {
    registry: Arc<dyn ToolClientRegistry>,
    presenter: Arc<dyn Presenter>,
    config: EngineConfig,
}

impl ToolCallEngine {
    #[must_use]
    pub fn new(
        registry: Arc<dyn ToolClientRegistry>,
        presenter: Arc<dyn Presenter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            presenter,
            config,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn ToolClientRegistry> {
        &self.registry
    }

    fn resolve(&self, request: &ToolCallRequest) -> Resolution {
        let Some((client_name, tool_name)) = request.split_name() else {
            return Resolution::Rejected(ToolCallResult::error(format!(
                "Invalid function call format: {}",
                request.name
            )));
        };
        match self.registry.find_client(client_name) {
            Some(client) => Resolution::Dispatch {
                client,
                tool: tool_name.to_string(),
            },
            None => Resolution::Rejected(ToolCallResult::error(format!(
                "Tool not found: {client_name}:{tool_name}"
            ))),
        }
    }

    /// Execute `requests`, feeding `sink` in completion order.
    ///
    /// Returns every outcome in drain order. When `cancel` fires, requests
    /// without a result get [`INTERRUPTED_MESSAGE`] and the run ends with
    /// [`EngineError::Interrupted`].
    pub async fn execute(
        &self,
        requests: Vec<ToolCallRequest>,
        sink: &mut dyn CompletionSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolCallOutcome>, EngineError> {
        if requests.is_empty() {
            return Err(EngineError::EmptyBatch);
        }

        let total = requests.len();
        let parallelism = total.min(self.config.max_concurrency.max(1));
        let permits = Arc::new(Semaphore::new(parallelism));
        let deadline = self.config.tool_timeout;
        tracing::info!(
            count = total,
            parallelism,
            timeout_ms = deadline.as_millis() as u64,
            "Executing tool calls"
        );

        let mut run = BatchRun {
            ledger: DisplayLedger::new(Arc::clone(&self.presenter)),
            pending: HashMap::with_capacity(total),
            outcomes: Vec::with_capacity(total),
            sink,
        };
        let mut rejected = Vec::new();
        let mut tasks = FuturesUnordered::new();

        for (index, request) in requests.into_iter().enumerate() {
            run.ledger.announce(index, &request);
            match self.resolve(&request) {
                Resolution::Rejected(result) => rejected.push((index, result)),
                Resolution::Dispatch { client, tool } => tasks.push(run_call(
                    index,
                    client,
                    tool,
                    request.arguments.clone(),
                    Arc::clone(&permits),
                    deadline,
                    cancel.child_token(),
                )),
            }
            run.pending.insert(index, request);
        }

        for (index, result) in rejected {
            run.complete(index, result);
        }

        let mut interrupted = false;
        while !tasks.is_empty() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                next = tasks.next() => match next {
                    Some((index, result)) => run.complete(index, result),
                    None => break,
                },
            }
        }
        // Dropping the queue detaches workers still inside a client call.
        drop(tasks);

        if interrupted {
            let mut remaining: Vec<usize> = run.pending.keys().copied().collect();
            remaining.sort_unstable();
            tracing::warn!(remaining = remaining.len(), "Tool execution interrupted");
            for index in remaining {
                run.complete(index, ToolCallResult::error(INTERRUPTED_MESSAGE));
            }
            return Err(EngineError::Interrupted {
                outcomes: run.outcomes,
            });
        }

        tracing::info!(count = run.outcomes.len(), "Tool calls finished");
        Ok(run.outcomes)
    }
}

/// Acquire a permit, run the client on a blocking worker, and map every way
/// the call can end onto one result.
async fn run_call(
    index: usize,
    client: Arc<dyn ToolClient>,
    tool: String,
    arguments: Map<String, Value>,
    permits: Arc<Semaphore>,
    deadline: Duration,
    cancel: CancellationToken,
) -> (usize, ToolCallResult) {
    let Ok(permit) = permits.acquire_owned().await else {
        return (index, ToolCallResult::error(INTERRUPTED_MESSAGE));
    };

    let worker_cancel = cancel.clone();
    let worker = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        client.call_tool(&tool, &arguments, &worker_cancel)
    });

    let result = match tokio::time::timeout(deadline, worker).await {
        Ok(Ok(Ok(Some(result)))) => result,
        Ok(Ok(Ok(None))) => ToolCallResult::error(NULL_RESULT_MESSAGE),
        Ok(Ok(Err(err))) => ToolCallResult::error(format!("Execution error: {err:#}")),
        Ok(Err(join_err)) => {
            let message = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                join_err.to_string()
            };
            ToolCallResult::error(format!("Execution error: {message}"))
        }
        Err(_elapsed) => {
            cancel.cancel();
            ToolCallResult::error(format!("Timeout after {} ms", deadline.as_millis()))
        }
    };
    (index, result)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "tool client panicked".to_string()
    }
}

// === Run state ===

struct BatchRun<'a> {
    ledger: DisplayLedger,
    pending: HashMap<usize, ToolCallRequest>,
    outcomes: Vec<ToolCallOutcome>,
    sink: &'a mut dyn CompletionSink,
}

impl BatchRun<'_> {
    fn complete(&mut self, index: usize, result: ToolCallResult) {
        let Some(request) = self.pending.remove(&index) else {
            return;
        };
        if result.is_error {
            tracing::warn!(tool = %request.name, id = %request.id, error = %result.text(), "Tool call failed");
        } else {
            tracing::debug!(tool = %request.name, id = %request.id, "Tool call succeeded");
        }
        self.ledger.record_result(index, &result);
        let outcome = ToolCallOutcome { request, result };
        self.sink.on_completion(&outcome);
        self.outcomes.push(outcome);
    }
}

/// Display entries for the run's invocations, keyed by batch position.
/// Call ids can be empty or repeated, so they cannot key the entries.
struct DisplayLedger {
    presenter: Arc<dyn Presenter>,
    entries: HashMap<usize, DisplayMessage>,
}

impl DisplayLedger {
    fn new(presenter: Arc<dyn Presenter>) -> Self {
        Self {
            presenter,
            entries: HashMap::new(),
        }
    }

    fn announce(&mut self, index: usize, request: &ToolCallRequest) {
        let mut message = self.presenter.begin_function_call_message();
        let payload = serde_json::to_string(request).unwrap_or_else(|_| request.name.clone());
        message.set_text(format!("function_call {payload}"));
        self.presenter.update_message(&message);
        self.entries.insert(index, message);
    }

    /// Unknown positions are ignored.
    fn record_result(&mut self, index: usize, result: &ToolCallResult) {
        let Some(mut message) = self.entries.remove(&index) else {
            return;
        };
        message.append(&format!("\nresp:{}", result.response_text()));
        self.presenter.update_message(&message);
        self.presenter.end_message(&message);
    }
}
