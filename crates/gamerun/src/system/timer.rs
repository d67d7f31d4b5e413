//! # Timer pump
//!
//! A single task owns every pending timeout, ordered by `(deadline, id)`.
//! Deadlines are fixed when the guest makes the call, so timeouts with equal
//! delays expire in the order they were requested.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::action::ActionId;
use crate::event::Event;
use crate::event::TimeoutTag;
use crate::queue::EventSender;

#[derive(Debug)]
pub(crate) struct TimerRequest {
    pub id: ActionId,
    pub tag: TimeoutTag,
    /// `None` when the deadline lies beyond what the clock can represent.
    pub deadline: Option<Instant>,
}

impl TimerRequest {
    pub fn new(id: ActionId, tag: TimeoutTag, timeout: Duration) -> Self {
        Self {
            id,
            tag,
            deadline: Instant::now().checked_add(timeout),
        }
    }
}

/// Converts a guest-supplied delay in seconds. Negative and NaN delays
/// expire immediately; delays too large to represent never expire.
pub(crate) fn delay_from_secs(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

/// Starts the timer pump on the current tokio runtime.
///
/// The pump exits, dropping whatever is still pending, once every request
/// sender is dropped.
pub(crate) fn spawn_pump(events: EventSender) -> mpsc::UnboundedSender<TimerRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(rx, events));
    tx
}

async fn pump(mut requests: mpsc::UnboundedReceiver<TimerRequest>, events: EventSender) {
    let mut pending: BTreeMap<(Instant, ActionId), TimeoutTag> = BTreeMap::new();
    let mut dormant = 0usize;
    loop {
        let next_deadline = pending.keys().next().map(|(deadline, _)| *deadline);
        // Far-future placeholder; the branch is disabled while nothing is pending.
        let sleep = tokio::time::sleep_until(
            next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400)),
        );

        tokio::select! {
            biased;
            request = requests.recv() => match request {
                Some(TimerRequest { id, tag, deadline: Some(deadline) }) => {
                    pending.insert((deadline, id), tag);
                }
                Some(TimerRequest { id, tag, deadline: None }) => {
                    tracing::debug!(%id, tag = tag.0, "timeout lies beyond the clock's range; it will not fire");
                    dormant += 1;
                }
                None => break,
            },
            _ = sleep, if next_deadline.is_some() => {
                let now = Instant::now();
                while let Some(entry) = pending.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    let ((_, id), tag) = entry.remove_entry();
                    tracing::trace!(%id, tag = tag.0, "timeout expired");
                    events.push(Event::timeout(id, tag));
                }
            }
        }
    }
    if !pending.is_empty() || dormant > 0 {
        tracing::debug!(dropped = pending.len() + dormant, "timer pump stopped with pending timeouts");
    }
}
