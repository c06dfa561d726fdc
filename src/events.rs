//! Process-wide publish/subscribe for coordination events.
//!
//! One mechanism serves every notification in the crate: channel creation,
//! message delivery, stream phases, and meeting lifecycle. Subscribers are
//! error-isolated; a failing observer is logged and skipped, and the rest
//! still run. Telemetry, transcripts, and UI bridges all attach here
//! rather than through per-feature callback lists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::identity::{MeetingId, ParticipantRef};
use crate::message::Message;

/// Everything observable about the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum CoordinationEvent {
    ChannelCreated {
        channel: ChannelId,
    },
    MessageDelivered {
        message: Message,
        recipient: ParticipantRef,
    },
    StreamStarted {
        stream_id: String,
        sender: ParticipantRef,
        recipient: ParticipantRef,
    },
    StreamChunk {
        stream_id: String,
        recipient: ParticipantRef,
        chunk: String,
    },
    StreamCompleted {
        stream_id: String,
        recipient: ParticipantRef,
        content: String,
    },
    InvitationIssued {
        meeting: MeetingId,
        invitee: ParticipantRef,
    },
    InvitationResolved {
        meeting: MeetingId,
        invitee: ParticipantRef,
        joined: bool,
    },
    MeetingStarted {
        meeting: MeetingId,
    },
    ParticipantLeft {
        meeting: MeetingId,
        who: ParticipantRef,
    },
    MeetingEnded {
        meeting: MeetingId,
    },
}

impl CoordinationEvent {
    /// The intended recipient, for per-viewer filtering. `None` means the
    /// event is not recipient-scoped.
    pub fn recipient(&self) -> Option<&ParticipantRef> {
        match self {
            Self::MessageDelivered { recipient, .. }
            | Self::StreamStarted { recipient, .. }
            | Self::StreamChunk { recipient, .. }
            | Self::StreamCompleted { recipient, .. } => Some(recipient),
            _ => None,
        }
    }
}

/// What a subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event.
    All,
    /// Only events scoped to this recipient.
    Recipient(ParticipantRef),
}

impl EventFilter {
    fn matches(&self, event: &CoordinationEvent) -> bool {
        match self {
            Self::All => true,
            Self::Recipient(who) => event.recipient() == Some(who),
        }
    }
}

/// Handle for removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&CoordinationEvent) -> anyhow::Result<()> + Send + Sync>;

/// The process-wide event bus.
pub struct EventBus {
    subscribers: Mutex<HashMap<SubscriptionId, (EventFilter, Callback)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer. The callback runs synchronously on the
    /// publishing task; keep it short.
    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&CoordinationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, (filter, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.lock().unwrap().remove(&id).is_some()
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Callbacks run outside the registry lock, so a subscriber may itself
    /// subscribe or unsubscribe. A subscriber error is logged and does not
    /// reach the other subscribers or the publisher.
    pub fn publish(&self, event: &CoordinationEvent) {
        let matching: Vec<Callback> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers
                .values()
                .filter(|(filter, _)| filter.matches(event))
                .map(|(_, cb)| cb.clone())
                .collect()
        };

        for callback in matching {
            if let Err(e) = callback(event) {
                tracing::warn!(error = %e, "event subscriber failed, skipping");
            }
        }
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
