//! Immutable message records.
//!
//! A `Message` is constructed once and never edited afterwards; downstream
//! code only appends it to histories or delivers clones of it.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::{MeetingId, ParticipantRef};

/// Message type classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// One-to-one message between two participants.
    Direct,
    /// Fan-out to every joined member of a meeting.
    MeetingBroadcast,
    /// Invitation to join a meeting.
    Invitation,
    /// Response to an invitation (joined or rejected).
    InvitationResponse,
}

/// Where a message is going.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    /// A single recipient.
    Direct(ParticipantRef),
    /// A meeting's joined members. An empty `targets` list means everyone;
    /// a non-empty list names the members explicitly addressed (still
    /// delivered to all, but targeted members wake faster).
    Meeting {
        meeting: MeetingId,
        targets: Vec<ParticipantRef>,
    },
}

impl Address {
    /// The meeting context, if this is meeting-addressed.
    pub fn meeting(&self) -> Option<&MeetingId> {
        match self {
            Self::Meeting { meeting, .. } => Some(meeting),
            Self::Direct(_) => None,
        }
    }
}

/// One unit of communication between participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (ULID).
    pub id: String,
    /// Who sent it.
    pub sender: ParticipantRef,
    /// Where it is going.
    pub address: Address,
    /// Type tag.
    pub kind: MessageKind,
    /// Message body.
    pub content: String,
    /// Stream this message belongs to, if any.
    pub stream_id: Option<String>,
    /// Creation timestamp (unix ms).
    pub created_at: i64,
}

impl Message {
    /// Create a direct message to a single recipient.
    pub fn direct(
        sender: ParticipantRef,
        recipient: ParticipantRef,
        content: impl Into<String>,
    ) -> Self {
        Self::new(sender, Address::Direct(recipient), MessageKind::Direct, content)
    }

    /// Create a broadcast into a meeting, addressed to everyone.
    pub fn meeting_broadcast(
        sender: ParticipantRef,
        meeting: MeetingId,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            sender,
            Address::Meeting {
                meeting,
                targets: Vec::new(),
            },
            MessageKind::MeetingBroadcast,
            content,
        )
    }

    /// Create a message with explicit kind and address.
    pub fn new(
        sender: ParticipantRef,
        address: Address,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            sender,
            address,
            kind,
            content: content.into(),
            stream_id: None,
            created_at: current_timestamp(),
        }
    }

    /// Attach a stream id (builder-style, at construction time only).
    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Explicitly name targeted recipients (builder-style).
    pub fn with_targets(mut self, new_targets: Vec<ParticipantRef>) -> Self {
        if let Address::Meeting { targets, .. } = &mut self.address {
            *targets = new_targets;
        }
        self
    }

    /// Whether this message explicitly targets `who` via the target list.
    ///
    /// This is the authoritative targeting signal. Content scanning (see
    /// [`crate::queue::MessageQueue::wait_window`]) is a best-effort
    /// fallback only.
    pub fn targets(&self, who: &ParticipantRef) -> bool {
        match &self.address {
            Address::Direct(recipient) => recipient == who,
            Address::Meeting { targets, .. } => targets.contains(who),
        }
    }

    /// Whether this message came from the human participant.
    pub fn is_human_originated(&self) -> bool {
        self.sender.is_human()
    }

    /// The meeting context, if any.
    pub fn meeting(&self) -> Option<&MeetingId> {
        self.address.meeting()
    }
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MeetingId;

    #[test]
    fn test_direct_message() {
        let msg = Message::direct(
            ParticipantRef::agent("a"),
            ParticipantRef::agent("b"),
            "hello",
        );
        assert_eq!(msg.kind, MessageKind::Direct);
        assert!(!msg.id.is_empty());
        assert!(msg.created_at > 0);
        assert!(msg.targets(&ParticipantRef::agent("b")));
        assert!(!msg.targets(&ParticipantRef::agent("c")));
    }

    #[test]
    fn test_meeting_targets() {
        let msg = Message::meeting_broadcast(
            ParticipantRef::agent("a"),
            MeetingId::new("m1"),
            "status?",
        )
        .with_targets(vec![ParticipantRef::agent("b")]);

        assert!(msg.targets(&ParticipantRef::agent("b")));
        assert!(!msg.targets(&ParticipantRef::agent("c")));
        assert_eq!(msg.meeting(), Some(&MeetingId::new("m1")));
    }

    #[test]
    fn test_human_origin() {
        let msg = Message::direct(ParticipantRef::Human, ParticipantRef::agent("a"), "hi");
        assert!(msg.is_human_originated());
    }
}
