//! Conclave library root.
//!
//! A multi-party communication and coordination substrate: typed
//! participant identities, immutable messages, event-driven inboxes with
//! blocking retrieval, error-isolated channel fan-out, chunked stream
//! delivery, and quorum-gated meetings, all fronted by a single router.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod meeting;
pub mod message;
pub mod participant;
pub mod queue;
pub mod router;
pub mod stream;

pub use channel::{Channel, ChannelId, ChannelRegistry, DeliveryReport};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{CoordinationEvent, EventBus, EventFilter};
pub use identity::{AgentId, MeetingId, ParsedTarget, ParticipantRef};
pub use meeting::{Meeting, MeetingManager, MeetingState};
pub use message::{Address, Message, MessageKind};
pub use participant::{AgentParticipant, HumanParticipant, Participant, ParticipantDirectory};
pub use queue::{MessageQueue, WaitWindow};
pub use router::{ResolvedTarget, Router};
pub use stream::StreamStart;
