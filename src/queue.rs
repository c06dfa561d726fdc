//! Per-participant event-driven message queues.
//!
//! Handles:
//! - Predicate-based blocking batch retrieval (no polling loops)
//! - Selective removal: non-matching messages keep their order
//! - Differential wait windows for targeted vs. unaddressed traffic
//! - Immediate wake-up for human-originated messages
//!
//! Waiters suspend on a [`tokio::sync::Notify`]; `put` wakes all of them.
//! The notified future is armed before the buffer is re-checked, so a
//! message enqueued between the check and the suspension is never missed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::ParticipantRef;
use crate::message::Message;

/// A participant's inbox.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug)]
struct State {
    buffer: VecDeque<Message>,
    closed: bool,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    buffer: VecDeque::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Append a message and wake all waiters.
    pub fn put(&self, message: Message) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(Error::QueueClosed);
            }
            tracing::trace!(id = %message.id, sender = %message.sender, "queued message");
            state.buffer.push_back(message);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Retrieve a batch of matching messages, suspending the caller until
    /// enough accumulate, `timeout` elapses, or the queue is closed.
    ///
    /// Only matching messages are removed; everything else stays buffered
    /// in its original order. Returns early (before `min_items`) when a
    /// matching message is human-originated: the human never waits on a
    /// batching window.
    ///
    /// A timeout returns whatever matched so far, possibly nothing. A
    /// closed queue returns the final matches, then `Error::QueueClosed`.
    pub async fn get_batch<F>(
        &self,
        predicate: F,
        timeout: Duration,
        min_items: usize,
        max_items: usize,
    ) -> Result<Vec<Message>>
    where
        F: Fn(&Message) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let target = min_items.max(1);

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Arm before re-checking the buffer so a concurrent `put`
            // cannot slip between the check and the await.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().unwrap();
                let matched = count_matches(&state.buffer, &predicate);
                let human_hit = state
                    .buffer
                    .iter()
                    .any(|m| m.is_human_originated() && predicate(m));

                if matched >= target || (human_hit && matched > 0) {
                    return Ok(take_matches(&mut state.buffer, &predicate, max_items));
                }
                if state.closed {
                    let batch = take_matches(&mut state.buffer, &predicate, max_items);
                    if batch.is_empty() {
                        return Err(Error::QueueClosed);
                    }
                    return Ok(batch);
                }
            }

            if Instant::now() >= deadline {
                let mut state = self.inner.state.lock().unwrap();
                return Ok(take_matches(&mut state.buffer, &predicate, max_items));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let mut state = self.inner.state.lock().unwrap();
                    return Ok(take_matches(&mut state.buffer, &predicate, max_items));
                }
            }
        }
    }

    /// Inspect matching messages without removing them.
    pub fn peek<F>(&self, predicate: F) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let state = self.inner.state.lock().unwrap();
        state
            .buffer
            .iter()
            .filter(|m| predicate(m))
            .cloned()
            .collect()
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue and wake all waiters.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
        }
        self.inner.notify.notify_waiters();
    }

    /// Compute the adaptive wait window for `me`.
    ///
    /// Fast window (first match returns immediately) when buffered traffic
    /// explicitly targets `me` (by id in a target list — the authoritative
    /// signal) or, as best-effort fallback, mentions `name` in its
    /// content. Otherwise the longer accumulation window, held open so
    /// several unaddressed contributions collect into one batch;
    /// human-originated matches still cut it short via `get_batch`'s
    /// bypass.
    pub fn wait_window(&self, config: &Config, me: &ParticipantRef, name: &str) -> WaitWindow {
        let state = self.inner.state.lock().unwrap();
        let targeted = state.buffer.iter().any(|m| {
            m.targets(me) || m.is_human_originated() || mentions_name(&m.content, name)
        });
        if targeted {
            WaitWindow {
                timeout: config.fast_window(),
                min_items: 1,
            }
        } else {
            WaitWindow {
                timeout: config.batch_window(),
                min_items: usize::MAX,
            }
        }
    }
}

/// Batching parameters for one blocking retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitWindow {
    /// Longest the caller suspends before taking what matched.
    pub timeout: Duration,
    /// Matches to accumulate before returning ahead of the timeout.
    pub min_items: usize,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn count_matches<F>(buffer: &VecDeque<Message>, predicate: &F) -> usize
where
    F: Fn(&Message) -> bool,
{
    buffer.iter().filter(|m| predicate(m)).count()
}

/// Remove up to `max_items` matching messages, preserving the relative
/// order of everything left behind.
fn take_matches<F>(buffer: &mut VecDeque<Message>, predicate: &F, max_items: usize) -> Vec<Message>
where
    F: Fn(&Message) -> bool,
{
    let mut batch = Vec::new();
    let mut rest = VecDeque::with_capacity(buffer.len());

    for message in buffer.drain(..) {
        if batch.len() < max_items && predicate(&message) {
            batch.push(message);
        } else {
            rest.push_back(message);
        }
    }

    *buffer = rest;
    batch
}

/// Best-effort check for a word-boundary mention of `name` in `content`.
///
/// Inherently fuzzy and may false-positive; the explicit target list is
/// always consulted first.
fn mentions_name(content: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(name))) {
        Ok(re) => re.is_match(content),
        Err(_) => false,
    }
}
