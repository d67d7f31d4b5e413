//! # Event Queue
//!
//! Ordered, multi-producer, single-consumer delivery of events to the guest.
//!
//! ## Model
//!
//! - **Backlog**: a FIFO of events nobody is waiting for yet.
//! - **Parked waiter**: a single-slot rendezvous. When the consumer finds the
//!   backlog empty it parks a oneshot sender in the shared state; the next
//!   `push` hands its event straight to that slot instead of the backlog.
//!
//! The receiver is not `Clone` and `next` takes `&mut self`, so at most one
//! waiter can ever be parked. The oneshot receiver lives in the
//! [`EventReceiver`] rather than in the `next` future, which keeps `next`
//! cancellation safe: an event handed to a waiter whose future was dropped is
//! returned by the following `next` call, ahead of the backlog.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio::sync::oneshot;

use crate::event::Event;

struct State {
    backlog: VecDeque<Event>,
    waiter: Option<oneshot::Sender<Event>>,
    senders: usize,
    receiver_alive: bool,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creates a connected sender/receiver pair with an empty backlog.
pub fn event_queue() -> (EventSender, EventReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            backlog: VecDeque::new(),
            waiter: None,
            senders: 1,
            receiver_alive: true,
        }),
    });
    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver {
            shared,
            parked: None,
        },
    )
}

/// Producer handle. Cheap to clone; timer and storage pumps each hold one.
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Delivers `event` to the parked waiter if there is one, otherwise
    /// appends it to the backlog.
    ///
    /// Events pushed after the receiver is gone are discarded.
    pub fn push(&self, event: Event) {
        let mut state = self.shared.lock();
        if !state.receiver_alive {
            tracing::trace!(?event, "event receiver dropped, discarding event");
            return;
        }
        match state.waiter.take() {
            Some(waiter) => {
                if let Err(event) = waiter.send(event) {
                    state.backlog.push_back(event);
                }
            }
            None => state.backlog.push_back(event),
        }
    }

    /// Returns true once the consuming side has been dropped.
    pub fn is_closed(&self) -> bool {
        !self.shared.lock().receiver_alive
    }
}

impl Clone for EventSender {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.senders -= 1;
        if state.senders == 0 {
            // Wakes a parked consumer with "no more events".
            state.waiter = None;
        }
    }
}

/// The single consumer. Owned by the driver loop.
pub struct EventReceiver {
    shared: Arc<Shared>,
    parked: Option<oneshot::Receiver<Event>>,
}

impl EventReceiver {
    /// Waits for the next event in push order.
    ///
    /// Returns `None` once the backlog is drained and every sender is gone.
    pub async fn next(&mut self) -> Option<Event> {
        if self.parked.is_none() {
            let mut state = self.shared.lock();
            if let Some(event) = state.backlog.pop_front() {
                return Some(event);
            }
            if state.senders == 0 {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiter = Some(tx);
            self.parked = Some(rx);
        }

        let parked = self.parked.as_mut()?;
        let result = parked.await;
        self.parked = None;
        result.ok()
    }

    /// Non-suspending variant of [`EventReceiver::next`].
    pub fn try_next(&mut self) -> Option<Event> {
        if let Some(parked) = self.parked.as_mut() {
            return match parked.try_recv() {
                Ok(event) => {
                    self.parked = None;
                    Some(event)
                }
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.parked = None;
                    None
                }
            };
        }
        self.shared.lock().backlog.pop_front()
    }

    /// Number of events waiting in the backlog.
    pub fn len(&self) -> usize {
        self.shared.lock().backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.receiver_alive = false;
        state.waiter = None;
        state.backlog.clear();
    }
}
