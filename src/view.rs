//! Display seam between the runtime and whatever renders the conversation.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    Assistant,
    FunctionCall,
}

/// A message as shown to the user. Updated in place while it is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub id: u64,
    pub kind: DisplayKind,
    text: String,
}

impl DisplayMessage {
    #[must_use]
    pub fn new(id: u64, kind: DisplayKind) -> Self {
        Self {
            id,
            kind,
            text: String::new(),
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn append(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }
}

/// Renders display messages.
///
/// The runtime calls a presenter from one task at a time, but implementations
/// are shared across turns and must be `Send + Sync`.
pub trait Presenter: Send + Sync {
    fn begin_message(&self) -> DisplayMessage;
    fn begin_function_call_message(&self) -> DisplayMessage;
    fn update_message(&self, message: &DisplayMessage);
    fn end_message(&self, message: &DisplayMessage);
}

// === Terminal ===

/// Streams messages to stdout. Consecutive updates to the same message print
/// only the appended suffix; switching messages starts a new line.
#[derive(Debug, Default)]
pub struct TerminalPresenter {
    next_id: AtomicU64,
    state: Mutex<TerminalState>,
}

#[derive(Debug, Default)]
struct TerminalState {
    printed: HashMap<u64, String>,
    last: Option<u64>,
}

impl TerminalPresenter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, kind: DisplayKind) -> DisplayMessage {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        DisplayMessage::new(id, kind)
    }

    fn render(kind: DisplayKind, text: &str) -> String {
        match kind {
            DisplayKind::Assistant => text.to_string(),
            DisplayKind::FunctionCall => text.dimmed().to_string(),
        }
    }

    fn write(text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{text}");
        let _ = stdout.flush();
    }
}

impl Presenter for TerminalPresenter {
    fn begin_message(&self) -> DisplayMessage {
        self.allocate(DisplayKind::Assistant)
    }

    fn begin_function_call_message(&self) -> DisplayMessage {
        self.allocate(DisplayKind::FunctionCall)
    }

    fn update_message(&self, message: &DisplayMessage) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let switched = state.last.is_some_and(|last| last != message.id);
        let shown = state.printed.get(&message.id).map_or("", String::as_str);
        let delta = match message.text().strip_prefix(shown) {
            Some(suffix) if !switched => suffix.to_string(),
            _ => message.text().to_string(),
        };
        if delta.is_empty() {
            return;
        }
        if switched {
            Self::write("\n");
        }
        Self::write(&Self::render(message.kind, &delta));
        state.printed.insert(message.id, message.text().to_string());
        state.last = Some(message.id);
    }

    fn end_message(&self, message: &DisplayMessage) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.printed.remove(&message.id).is_some() && state.last == Some(message.id) {
            Self::write("\n");
            state.last = None;
        }
    }
}
