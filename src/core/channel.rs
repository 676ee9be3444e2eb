//! Pull-based, single-producer / multi-consumer event channel.
//!
//! Every subscription carries its own demand counter. The publisher only
//! delivers an item to a subscriber after that subscriber has requested it,
//! so a slow consumer holds the producer back instead of buffering without
//! bound. Terminal signals need no demand.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};

use super::events::{Signal, StreamError};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("channel is already closed")]
pub struct ChannelClosed;

#[derive(Debug, Clone)]
enum Terminal {
    Complete,
    Error(StreamError),
}

impl Terminal {
    fn signal<T>(&self) -> Signal<T> {
        match self {
            Terminal::Complete => Signal::Complete,
            Terminal::Error(err) => Signal::Error(err.clone()),
        }
    }
}

struct Slot<T> {
    demand: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Signal<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            demand: Arc::clone(&self.demand),
            tx: self.tx.clone(),
        }
    }
}

struct State<T> {
    slots: Vec<Slot<T>>,
    terminal: Option<Terminal>,
}

// === Publisher ===

/// Producer side of the channel.
pub struct Publisher<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone + Send> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> Publisher<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                slots: Vec::new(),
                terminal: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new consumer. A consumer registered after the channel was
    /// closed only sees the terminal signal.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let demand = Arc::new(Semaphore::new(0));
        let mut state = self.state();
        match state.terminal.clone() {
            Some(terminal) => {
                let _ = tx.send(terminal.signal());
            }
            None => state.slots.push(Slot {
                demand: Arc::clone(&demand),
                tx,
            }),
        }
        Subscription {
            demand,
            rx,
            finished: false,
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state().slots.iter().filter(|slot| !slot.tx.is_closed()).count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().terminal.is_some()
    }

    /// Deliver `item` to every live subscriber, waiting for each one's demand.
    pub async fn submit(&self, item: T) -> Result<(), ChannelClosed> {
        let slots = {
            let state = self.state();
            if state.terminal.is_some() {
                return Err(ChannelClosed);
            }
            state.slots.clone()
        };

        for slot in &slots {
            if slot.tx.is_closed() {
                continue;
            }
            // A closed semaphore means the subscription was dropped.
            let Ok(permit) = slot.demand.acquire().await else {
                continue;
            };
            permit.forget();
            let _ = slot.tx.send(Signal::Next(item.clone()));
        }

        self.state().slots.retain(|slot| !slot.tx.is_closed());
        Ok(())
    }

    /// Signal normal completion. Returns false if the channel was already closed.
    pub fn close(&self) -> bool {
        self.terminate(Terminal::Complete)
    }

    /// Signal failure. Returns false if the channel was already closed.
    pub fn close_exceptionally(&self, error: StreamError) -> bool {
        self.terminate(Terminal::Error(error))
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        let mut state = self.state();
        if state.terminal.is_some() {
            return false;
        }
        for slot in state.slots.drain(..) {
            let _ = slot.tx.send(terminal.signal());
        }
        state.terminal = Some(terminal);
        true
    }
}

// === Subscription ===

/// Consumer side of the channel.
pub struct Subscription<T> {
    demand: Arc<Semaphore>,
    rx: mpsc::UnboundedReceiver<Signal<T>>,
    finished: bool,
}

impl<T> Subscription<T> {
    /// Grant the publisher `n` more deliveries.
    pub fn request(&self, n: usize) {
        let headroom = Semaphore::MAX_PERMITS.saturating_sub(self.demand.available_permits());
        let n = n.min(headroom);
        if n > 0 {
            self.demand.add_permits(n);
        }
    }

    /// Next signal, or `None` once a terminal signal has been returned.
    ///
    /// A publisher dropped without closing reads as completion.
    pub async fn next(&mut self) -> Option<Signal<T>> {
        if self.finished {
            return None;
        }
        let signal = self.rx.recv().await.unwrap_or(Signal::Complete);
        if signal.is_terminal() {
            self.finished = true;
            self.demand.close();
        }
        Some(signal)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.demand.close();
        self.rx.close();
    }
}

// === Subscriber ===

/// Callback-style consumer driven by [`drive`].
pub trait Subscriber<T> {
    fn on_next(&mut self, item: T);
    fn on_error(&mut self, error: StreamError);
    fn on_complete(&mut self);
}

/// Pull one event at a time into `subscriber` until a terminal signal, then
/// hand the subscriber back.
pub async fn drive<T, S>(mut subscription: Subscription<T>, mut subscriber: S) -> S
where
    S: Subscriber<T>,
{
    loop {
        subscription.request(1);
        match subscription.next().await {
            Some(Signal::Next(item)) => subscriber.on_next(item),
            Some(Signal::Error(err)) => {
                subscriber.on_error(err);
                break;
            }
            Some(Signal::Complete) | None => {
                subscriber.on_complete();
                break;
            }
        }
    }
    subscriber
}
