//! SSE chat-completions decoder.
//!
//! Turns `data:` lines into [`Incoming`] events. Assistant text is published
//! as it arrives. Tool-call deltas (legacy `function_call` and indexed
//! `tool_calls`) are assembled per call index and published once, at the
//! `[DONE]` sentinel, as a single `function_call[...]` buffer.

use std::collections::BTreeMap;

use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::channel::Publisher;
use super::events::{FUNCTION_CALL_SENTINEL, Incoming, StreamError};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Result of decoding one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Not a data line, an empty payload, or a malformed payload.
    Ignored,
    Events(Vec<Incoming>),
    /// The end-of-data sentinel.
    Done,
}

/// Counters for one decoded stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub lines: usize,
    pub content_events: usize,
    pub saw_done: bool,
    pub published_function_calls: bool,
}

// === Tool-call assembly ===

#[derive(Debug, Default, Clone)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Per-call-index accumulator for streamed tool-call fragments.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<u64, PendingCall>,
    legacy_slot: Option<u64>,
}

impl ToolCallAssembler {
    /// `None` once the highest key is `u64::MAX`.
    fn next_slot(&self) -> Option<u64> {
        match self.calls.keys().next_back() {
            Some(last) => last.checked_add(1),
            None => Some(0),
        }
    }

    fn latest_slot(&self) -> Option<u64> {
        self.calls.keys().next_back().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Apply a legacy `function_call` delta. A delta carrying a name opens a
    /// new call; argument-only deltas extend the current one.
    pub fn apply_legacy(&mut self, delta: &Value) {
        let name = non_empty_str(delta.get("name"));
        let slot = match (name, self.legacy_slot) {
            (None, Some(slot)) => slot,
            _ => {
                let Some(slot) = self.next_slot() else {
                    tracing::warn!(fragment = %delta, "No call slot left; skipping function_call delta");
                    return;
                };
                self.legacy_slot = Some(slot);
                slot
            }
        };
        let call = self.calls.entry(slot).or_default();
        if let Some(name) = name {
            call.name = name.to_string();
        }
        if let Some(args) = delta.get("arguments").and_then(Value::as_str) {
            call.arguments.push_str(args);
        }
    }

    /// Apply one entry of a `tool_calls` delta.
    pub fn apply_tool_call(&mut self, delta: &Value) {
        let function = delta.get("function");
        let name = non_empty_str(function.and_then(|f| f.get("name")));
        let slot = match delta.get("index").and_then(Value::as_u64) {
            Some(index) => index,
            None => match (name, self.latest_slot()) {
                (None, Some(slot)) => slot,
                _ => match self.next_slot() {
                    Some(slot) => slot,
                    None => {
                        tracing::warn!(fragment = %delta, "No call slot left; skipping tool_call delta");
                        return;
                    }
                },
            },
        };
        let call = self.calls.entry(slot).or_default();
        if let Some(id) = non_empty_str(delta.get("id"))
            && call.id.is_empty()
        {
            call.id = id.to_string();
        }
        if let Some(name) = name
            && call.name.is_empty()
        {
            call.name = name.to_string();
        }
        if let Some(args) = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
        {
            call.arguments.push_str(args);
        }
    }

    /// Drain the assembled calls into the `function_call[...]` buffer.
    pub fn finish(&mut self) -> Option<String> {
        self.legacy_slot = None;
        if self.calls.is_empty() {
            return None;
        }
        let calls: Vec<Value> = std::mem::take(&mut self.calls)
            .into_values()
            .map(|call| {
                json!({
                    "name": call.name,
                    "id": call.id,
                    "arguments": parse_arguments(&call.name, &call.arguments),
                })
            })
            .collect();
        Some(format!("{FUNCTION_CALL_SENTINEL}{}", Value::Array(calls)))
    }

    fn reset(&mut self) {
        self.calls.clear();
        self.legacy_slot = None;
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn parse_arguments(name: &str, raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(tool = name, error = %err, "Tool call arguments are not valid JSON");
            Value::String(raw.to_string())
        }
    }
}

// === Decoder ===

/// Stateful decoder for one model response.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    calls: ToolCallAssembler,
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode_line(&mut self, line: &str) -> LineOutcome {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return LineOutcome::Ignored;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return LineOutcome::Ignored;
        }
        if payload == DONE_SENTINEL {
            return LineOutcome::Done;
        }

        let chunk: Value = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(error = %err, line = payload, "Skipping malformed stream line");
                return LineOutcome::Ignored;
            }
        };

        if let Some(error) = chunk.get("error") {
            tracing::warn!(%error, "Model stream reported an error payload");
            return LineOutcome::Ignored;
        }

        let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
            tracing::trace!("Stream chunk without choices");
            return LineOutcome::Events(Vec::new());
        };

        let mut events = Vec::new();
        for choice in choices {
            let Some(delta) = choice.get("delta") else {
                continue;
            };
            if let Some(content) = delta.get("content").and_then(Value::as_str)
                && !content.is_empty()
            {
                events.push(Incoming::Content(content.to_string()));
            }
            if let Some(function_call) = delta.get("function_call").filter(|v| v.is_object()) {
                tracing::trace!(fragment = %function_call, "function_call fragment");
                self.calls.apply_legacy(function_call);
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for tool_call in tool_calls {
                    tracing::trace!(fragment = %tool_call, "tool_call fragment");
                    self.calls.apply_tool_call(tool_call);
                }
            }
        }
        LineOutcome::Events(events)
    }

    /// The authoritative function-call event, if any calls were assembled.
    pub fn finish(&mut self) -> Option<Incoming> {
        self.calls.finish().map(Incoming::FunctionCall)
    }

    /// Decode `lines` into `publisher`, closing it when the stream ends.
    ///
    /// Transport failures and cancellation close the channel exceptionally
    /// and discard any partially assembled tool calls.
    pub async fn run<S>(
        &mut self,
        lines: S,
        publisher: &Publisher<Incoming>,
        cancel: &CancellationToken,
    ) -> Result<DecodeSummary, StreamError>
    where
        S: Stream<Item = Result<String, StreamError>>,
    {
        let mut lines = std::pin::pin!(lines);
        let mut summary = DecodeSummary::default();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.abort(publisher, StreamError::Cancelled)),
                next = lines.next() => next,
            };
            let line = match next {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(err)) => return Err(self.abort(publisher, err)),
            };
            summary.lines += 1;

            match self.decode_line(&line) {
                LineOutcome::Ignored => {}
                LineOutcome::Events(events) => {
                    for event in events {
                        if !publish(publisher, event, cancel).await? {
                            return Ok(summary);
                        }
                        summary.content_events += 1;
                    }
                }
                LineOutcome::Done => {
                    summary.saw_done = true;
                    if let Some(event) = self.finish() {
                        summary.published_function_calls = publish(publisher, event, cancel).await?;
                    }
                    break;
                }
            }
        }

        if !summary.saw_done && !self.calls.is_empty() {
            tracing::warn!(
                calls = self.calls.len(),
                "Stream ended without [DONE]; dropping partial tool calls"
            );
            self.calls.reset();
        }
        publisher.close();
        Ok(summary)
    }

    fn abort(&mut self, publisher: &Publisher<Incoming>, error: StreamError) -> StreamError {
        tracing::debug!(%error, "Stream decoding stopped");
        self.calls.reset();
        publisher.close_exceptionally(error.clone());
        error
    }
}

/// Submit one event, giving up if cancellation fires while waiting for demand.
/// Returns false if the channel was closed underneath us.
async fn publish(
    publisher: &Publisher<Incoming>,
    event: Incoming,
    cancel: &CancellationToken,
) -> Result<bool, StreamError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            publisher.close_exceptionally(StreamError::Cancelled);
            Err(StreamError::Cancelled)
        }
        submitted = publisher.submit(event) => Ok(submitted.is_ok()),
    }
}

/// Decode a complete, in-memory stream.
pub fn decode_lines<I, L>(lines: I) -> Vec<Incoming>
where
    I: IntoIterator<Item = L>,
    L: AsRef<str>,
{
    let mut decoder = StreamDecoder::new();
    let mut events = Vec::new();
    for line in lines {
        match decoder.decode_line(line.as_ref()) {
            LineOutcome::Ignored => {}
            LineOutcome::Events(batch) => events.extend(batch),
            LineOutcome::Done => {
                events.extend(decoder.finish());
                break;
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{Subscriber, drive};
    use crate::models::ToolCallRequest;
    use pretty_assertions::assert_eq;

    fn content_line(text: &str) -> String {
        format!("data: {}", json!({"choices": [{"delta": {"content": text}}]}))
    }

    fn tool_line(index: u64, id: Option<&str>, name: Option<&str>, args: &str) -> String {
        let mut call = json!({"index": index, "function": {"arguments": args}});
        if let Some(id) = id {
            call["id"] = json!(id);
            call["type"] = json!("function");
        }
        if let Some(name) = name {
            call["function"]["name"] = json!(name);
        }
        format!("data: {}", json!({"choices": [{"delta": {"tool_calls": [call]}}]}))
    }

    fn parse_buffer(event: &Incoming) -> Vec<ToolCallRequest> {
        let Incoming::FunctionCall(text) = event else {
            panic!("expected a function call event, got {event:?}");
        };
        let json = text.strip_prefix(FUNCTION_CALL_SENTINEL).unwrap();
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn content_lines_become_content_events() {
        let events = decode_lines([
            ": keep-alive".to_string(),
            "event: message".to_string(),
            content_line("Hel"),
            String::new(),
            content_line("lo"),
            "data:".to_string(),
            "data: [DONE]".to_string(),
        ]);
        assert_eq!(
            events,
            vec![Incoming::Content("Hel".into()), Incoming::Content("lo".into())]
        );
    }

    #[test]
    fn data_prefix_without_space_is_accepted() {
        let line = format!("data:{}", json!({"choices": [{"delta": {"content": "x"}}]}));
        assert_eq!(decode_lines([line]), vec![Incoming::Content("x".into())]);
    }

    #[test]
    fn interleaved_tool_calls_are_assembled_by_index() {
        let events = decode_lines([
            tool_line(0, Some("call_a"), Some("files__read"), ""),
            tool_line(1, Some("call_b"), Some("git__status"), "{\"sh"),
            tool_line(0, None, None, "{\"path\":"),
            tool_line(1, None, None, "ort\":true}"),
            tool_line(0, None, None, "\"a.txt\"}"),
            "data: [DONE]".to_string(),
        ]);
        assert_eq!(events.len(), 1);
        let calls = parse_buffer(&events[0]);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].name, "files__read");
        assert_eq!(calls[0].arguments.get("path"), Some(&json!("a.txt")));
        assert_eq!(calls[1].id, "call_b");
        assert_eq!(calls[1].arguments.get("short"), Some(&json!(true)));
    }

    #[test]
    fn legacy_function_call_fragments_are_assembled() {
        let legacy = |fc: Value| format!("data: {}", json!({"choices": [{"delta": {"function_call": fc}}]}));
        let events = decode_lines([
            content_line("Let me check."),
            legacy(json!({"name": "clock__now", "arguments": ""})),
            legacy(json!({"arguments": "{\"tz\":"})),
            legacy(json!({"arguments": "\"UTC\"}"})),
            "data: [DONE]".to_string(),
        ]);
        assert_eq!(events[0], Incoming::Content("Let me check.".into()));
        let calls = parse_buffer(&events[1]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "");
        assert_eq!(calls[0].name, "clock__now");
        assert_eq!(calls[0].arguments.get("tz"), Some(&json!("UTC")));
    }

    #[test]
    fn deltas_past_the_last_slot_are_skipped() {
        let legacy = |fc: Value| format!("data: {}", json!({"choices": [{"delta": {"function_call": fc}}]}));
        let unindexed = json!({"choices": [{"delta": {"tool_calls": [
            {"id": "c2", "function": {"name": "a__d", "arguments": "{}"}}
        ]}}]});
        let events = decode_lines([
            tool_line(u64::MAX, Some("c1"), Some("a__b"), "{}"),
            legacy(json!({"name": "a__c", "arguments": "{}"})),
            format!("data: {unindexed}"),
            "data: [DONE]".to_string(),
        ]);
        assert_eq!(events.len(), 1);
        let calls = parse_buffer(&events[0]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].name, "a__b");
    }

    #[test]
    fn empty_arguments_become_an_empty_object() {
        let events = decode_lines([
            tool_line(0, Some("c1"), Some("clock__now"), ""),
            "data: [DONE]".to_string(),
        ]);
        let calls = parse_buffer(&events[0]);
        assert!(calls[0].arguments.is_empty());
    }

    #[test]
    fn no_tool_calls_means_no_function_call_event() {
        let events = decode_lines([content_line("plain answer"), "data: [DONE]".to_string()]);
        assert!(events.iter().all(|e| matches!(e, Incoming::Content(_))));
    }

    #[test]
    fn malformed_line_is_skipped() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.decode_line("data: {\"choices\": [}"), LineOutcome::Ignored);
        assert_eq!(
            decoder.decode_line(&content_line("still here")),
            LineOutcome::Events(vec![Incoming::Content("still here".into())])
        );
    }

    #[test]
    fn decoding_is_deterministic() {
        let lines = vec![
            content_line("a"),
            tool_line(0, Some("x"), Some("c__t"), "{\"k\":1}"),
            content_line("b"),
            "data: [DONE]".to_string(),
        ];
        assert_eq!(decode_lines(&lines), decode_lines(&lines));
    }

    #[derive(Default)]
    struct Collector {
        events: Vec<Incoming>,
        error: Option<StreamError>,
        completed: bool,
    }

    impl Subscriber<Incoming> for Collector {
        fn on_next(&mut self, item: Incoming) {
            self.events.push(item);
        }
        fn on_error(&mut self, error: StreamError) {
            self.error = Some(error);
        }
        fn on_complete(&mut self) {
            self.completed = true;
        }
    }

    async fn run_lines(
        lines: Vec<Result<String, StreamError>>,
        cancel: &CancellationToken,
    ) -> (Result<DecodeSummary, StreamError>, Collector) {
        let publisher = Publisher::new();
        let consumer = drive(publisher.subscribe(), Collector::default());
        let mut decoder = StreamDecoder::new();
        let producer = decoder.run(futures_util::stream::iter(lines), &publisher, cancel);
        let (summary, collector) = tokio::join!(producer, consumer);
        (summary, collector)
    }

    #[tokio::test]
    async fn run_publishes_and_completes() {
        let (summary, collector) = run_lines(
            vec![
                Ok(content_line("hi")),
                Ok(tool_line(0, Some("c1"), Some("a__b"), "{}")),
                Ok("data: [DONE]".to_string()),
            ],
            &CancellationToken::new(),
        )
        .await;
        let summary = summary.unwrap();
        assert!(summary.saw_done);
        assert!(summary.published_function_calls);
        assert_eq!(collector.events.len(), 2);
        assert!(collector.completed);
    }

    #[tokio::test]
    async fn transport_error_closes_exceptionally_without_calls() {
        let (summary, collector) = run_lines(
            vec![
                Ok(tool_line(0, Some("c1"), Some("a__b"), "{}")),
                Err(StreamError::Transport("connection reset".into())),
                Ok("data: [DONE]".to_string()),
            ],
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(summary, Err(StreamError::Transport("connection reset".into())));
        assert!(collector.events.is_empty());
        assert_eq!(collector.error, Some(StreamError::Transport("connection reset".into())));
    }

    #[tokio::test]
    async fn cancellation_stops_decoding() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (summary, collector) =
            run_lines(vec![Ok(content_line("never")), Ok("data: [DONE]".into())], &cancel).await;
        assert_eq!(summary, Err(StreamError::Cancelled));
        assert!(collector.events.is_empty());
        assert_eq!(collector.error, Some(StreamError::Cancelled));
    }

    #[tokio::test]
    async fn stream_without_done_drops_partial_calls() {
        let (summary, collector) = run_lines(
            vec![Ok(content_line("partial")), Ok(tool_line(0, Some("c"), Some("a__b"), "{"))],
            &CancellationToken::new(),
        )
        .await;
        let summary = summary.unwrap();
        assert!(!summary.saw_done);
        assert_eq!(collector.events, vec![Incoming::Content("partial".into())]);
        assert!(collector.completed);
    }
}
