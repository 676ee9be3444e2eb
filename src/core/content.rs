//! Accumulates streamed assistant text into one live display message.

use std::sync::Arc;

use super::channel::Subscriber;
use super::events::{Incoming, IncomingKind, StreamError};
use crate::view::{DisplayMessage, Presenter};

/// Keeps at most one open display message. A change of event kind ends it.
pub struct ContentAccumulator {
    presenter: Arc<dyn Presenter>,
    current: Option<DisplayMessage>,
    last_kind: Option<IncomingKind>,
    finished: Vec<String>,
}

impl ContentAccumulator {
    #[must_use]
    pub fn new(presenter: Arc<dyn Presenter>) -> Self {
        Self {
            presenter,
            current: None,
            last_kind: None,
            finished: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Texts of the messages closed so far, in order.
    #[must_use]
    pub fn into_messages(self) -> Vec<String> {
        self.finished
    }

    fn end_current(&mut self) {
        if let Some(message) = self.current.take() {
            self.presenter.end_message(&message);
            if !message.text().is_empty() {
                self.finished.push(message.text().to_string());
            }
        }
    }
}

impl Subscriber<Incoming> for ContentAccumulator {
    fn on_next(&mut self, item: Incoming) {
        let kind = item.kind();
        if self.last_kind.is_some_and(|last| last != kind) {
            self.end_current();
        }
        self.last_kind = Some(kind);

        let Incoming::Content(text) = item else {
            return;
        };
        let presenter = Arc::clone(&self.presenter);
        let message = self.current.get_or_insert_with(|| presenter.begin_message());
        message.append(&text);
        presenter.update_message(message);
    }

    fn on_error(&mut self, error: StreamError) {
        tracing::error!(%error, "Model stream failed");
        self.end_current();
    }

    fn on_complete(&mut self) {
        self.end_current();
    }
}
