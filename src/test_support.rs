//! Fakes shared by unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::models::{ToolCallRequest, ToolCallResult};
use crate::tools::{ClientDescriptor, ToolClient, ToolClientRegistry};
use crate::view::{DisplayKind, DisplayMessage, Presenter};

/// Serialises tests that mutate process environment variables.
pub fn lock_test_env() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterCall {
    Begin(u64),
    BeginFunctionCall(u64),
    Update(u64, String),
    End(u64, String),
}

#[derive(Default)]
pub struct RecordingPresenter {
    next_id: AtomicU64,
    calls: Mutex<Vec<PresenterCall>>,
}

impl RecordingPresenter {
    pub fn calls(&self) -> Vec<PresenterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ended(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, PresenterCall::End(..)))
            .count()
    }

    /// Latest text published for message `id`.
    pub fn text_of(&self, id: u64) -> Option<String> {
        self.calls().into_iter().rev().find_map(|call| match call {
            PresenterCall::Update(m, text) | PresenterCall::End(m, text) if m == id => Some(text),
            _ => None,
        })
    }

    pub fn function_call_texts(&self) -> Vec<String> {
        let ids: Vec<u64> = self
            .calls()
            .iter()
            .filter_map(|call| match call {
                PresenterCall::BeginFunctionCall(id) => Some(*id),
                _ => None,
            })
            .collect();
        ids.into_iter().filter_map(|id| self.text_of(id)).collect()
    }

    fn record(&self, call: PresenterCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Presenter for RecordingPresenter {
    fn begin_message(&self) -> DisplayMessage {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(PresenterCall::Begin(id));
        DisplayMessage::new(id, DisplayKind::Assistant)
    }

    fn begin_function_call_message(&self) -> DisplayMessage {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(PresenterCall::BeginFunctionCall(id));
        DisplayMessage::new(id, DisplayKind::FunctionCall)
    }

    fn update_message(&self, message: &DisplayMessage) {
        self.record(PresenterCall::Update(message.id, message.text().to_string()));
    }

    fn end_message(&self, message: &DisplayMessage) {
        self.record(PresenterCall::End(message.id, message.text().to_string()));
    }
}

/// What a [`FakeClient`] does for a given tool name.
#[derive(Debug, Clone)]
pub enum Behavior {
    Reply(String),
    Fail(String),
    Null,
    Panic,
    /// Sleep, honouring cancellation, then reply.
    Sleep(Duration),
    /// Sleep and ignore cancellation.
    Stubborn(Duration),
}

/// Tool client that tracks how many calls are in flight.
#[derive(Default)]
pub struct FakeClient {
    behaviors: Mutex<BTreeMap<String, Behavior>>,
    pub calls: Mutex<Vec<String>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, tool: &str, behavior: Behavior) -> Self {
        self.behaviors.lock().unwrap().insert(tool.to_string(), behavior);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ToolClient for FakeClient {
    fn call_tool(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<ToolCallResult>> {
        self.calls.lock().unwrap().push(tool_name.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(tool_name)
            .cloned()
            .unwrap_or_else(|| Behavior::Reply(Value::Object(arguments.clone()).to_string()));

        let outcome = match behavior {
            Behavior::Reply(text) => Ok(Some(ToolCallResult::success(text))),
            Behavior::Fail(message) => Err(anyhow::anyhow!(message)),
            Behavior::Null => Ok(None),
            Behavior::Panic => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                panic!("tool exploded");
            }
            Behavior::Sleep(duration) => {
                let started = Instant::now();
                while started.elapsed() < duration {
                    if cancel.is_cancelled() {
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                if cancel.is_cancelled() {
                    Err(anyhow::anyhow!("cancelled"))
                } else {
                    Ok(Some(ToolCallResult::success(format!("slept {tool_name}"))))
                }
            }
            Behavior::Stubborn(duration) => {
                thread::sleep(duration);
                Ok(Some(ToolCallResult::success("late")))
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Registry with fixed clients.
#[derive(Default)]
pub struct FakeRegistry {
    pub clients: BTreeMap<String, Arc<FakeClient>>,
}

impl FakeRegistry {
    pub fn with(name: &str, client: Arc<FakeClient>) -> Self {
        let mut clients = BTreeMap::new();
        clients.insert(name.to_string(), client);
        Self { clients }
    }
}

impl ToolClientRegistry for FakeRegistry {
    fn find_client(&self, name: &str) -> Option<Arc<dyn ToolClient>> {
        self.clients
            .get(name)
            .map(|client| Arc::clone(client) as Arc<dyn ToolClient>)
    }

    fn list_enabled_clients(&self) -> BTreeMap<String, ClientDescriptor> {
        self.clients
            .keys()
            .map(|name| (name.clone(), ClientDescriptor::default()))
            .collect()
    }
}

pub fn request(id: &str, name: &str) -> ToolCallRequest {
    ToolCallRequest::new(id, name, Map::new())
}
