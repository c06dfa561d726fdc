//! The participant capability contract and its concrete shapes.
//!
//! A participant is anything with an identity that can accept a `deliver`.
//! Two shapes cover the current system: agents and the human operator,
//! both backed by a [`MessageQueue`] inbox. A transport-backed shape is
//! anticipated but deliberately not pre-built; the trait stays minimal
//! until a genuinely different delivery mechanism exists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::identity::{AgentId, ParticipantRef};
use crate::message::Message;
use crate::queue::MessageQueue;

/// Participant classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Agent,
    Human,
}

/// Minimal capability a deliverable target must satisfy.
#[async_trait]
pub trait Participant: Send + Sync {
    /// This participant's identity.
    fn id(&self) -> ParticipantRef;

    /// Agent or human.
    fn kind(&self) -> ParticipantKind;

    /// Whether this participant can render incremental stream output.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Hand a message to this participant.
    async fn deliver(&self, message: Message) -> Result<()>;
}

/// An agent participant with an in-process inbox.
pub struct AgentParticipant {
    id: AgentId,
    inbox: MessageQueue,
    streaming: bool,
}

impl AgentParticipant {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            inbox: MessageQueue::new(),
            streaming: false,
        }
    }

    /// Enable incremental-display capability.
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// The inbox this participant drains.
    pub fn inbox(&self) -> MessageQueue {
        self.inbox.clone()
    }
}

#[async_trait]
impl Participant for AgentParticipant {
    fn id(&self) -> ParticipantRef {
        ParticipantRef::Agent(self.id.clone())
    }

    fn kind(&self) -> ParticipantKind {
        ParticipantKind::Agent
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn deliver(&self, message: Message) -> Result<()> {
        self.inbox.put(message)
    }
}

/// The human operator's participant shape.
///
/// Humans get incremental display by default; their frontends render
/// chunks as they arrive.
pub struct HumanParticipant {
    inbox: MessageQueue,
    streaming: bool,
}

impl HumanParticipant {
    pub fn new() -> Self {
        Self {
            inbox: MessageQueue::new(),
            streaming: true,
        }
    }

    pub fn without_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    pub fn inbox(&self) -> MessageQueue {
        self.inbox.clone()
    }
}

impl Default for HumanParticipant {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Participant for HumanParticipant {
    fn id(&self) -> ParticipantRef {
        ParticipantRef::Human
    }

    fn kind(&self) -> ParticipantKind {
        ParticipantKind::Human
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn deliver(&self, message: Message) -> Result<()> {
        self.inbox.put(message)
    }
}

/// Shared registry of live participants.
pub struct ParticipantDirectory {
    map: RwLock<HashMap<ParticipantRef, Arc<dyn Participant>>>,
}

impl ParticipantDirectory {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Register a participant under its own identity.
    pub async fn register(&self, participant: Arc<dyn Participant>) {
        let id = participant.id();
        tracing::debug!(participant = %id, "registered participant");
        self.map.write().await.insert(id, participant);
    }

    /// Remove a participant. Returns whether it was present.
    pub async fn deregister(&self, id: &ParticipantRef) -> bool {
        self.map.write().await.remove(id).is_some()
    }

    /// Look up a participant by identity.
    pub async fn get(&self, id: &ParticipantRef) -> Option<Arc<dyn Participant>> {
        self.map.read().await.get(id).cloned()
    }

    /// Whether this identity is registered.
    pub async fn contains(&self, id: &ParticipantRef) -> bool {
        self.map.read().await.contains_key(id)
    }

    /// Number of registered participants.
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ParticipantDirectory {
    fn default() -> Self {
        Self::new()
    }
}
