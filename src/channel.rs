//! Routing channels and the channel registry.
//!
//! A channel owns a participant set and any in-flight stream state, and is
//! the single conduit for 1:1, 1:N and N:N traffic. Fan-out is
//! error-isolated per recipient: one failing delivery is caught, logged,
//! and reported in the [`DeliveryReport`] while the rest proceed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::events::{CoordinationEvent, EventBus};
use crate::identity::{MeetingId, ParticipantRef};
use crate::message::Message;
use crate::participant::Participant;
use crate::stream::StreamState;

/// Deterministic channel identifier.
///
/// Stable for the channel's lifetime and collision-free for distinct
/// participant sets: direct channels hash to the sorted member-key tuple,
/// group channels to the meeting id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    /// Id for a direct channel over a participant set. Order-insensitive.
    pub fn for_members(members: &[ParticipantRef]) -> Self {
        let mut keys: Vec<String> = members.iter().map(|m| m.key()).collect();
        keys.sort();
        keys.dedup();
        Self(format!("dm:{}", keys.join("+")))
    }

    /// Id for a meeting's group channel.
    pub fn for_meeting(meeting: &MeetingId) -> Self {
        Self(format!("meeting:{}", meeting.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// Recipients that accepted the message.
    pub delivered: Vec<ParticipantRef>,
    /// Recipients that failed, with the failure reason.
    pub failures: Vec<(ParticipantRef, String)>,
}

impl DeliveryReport {
    pub fn all_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty() && !self.delivered.is_empty()
    }
}

/// A routing conduit over a participant set.
pub struct Channel {
    id: ChannelId,
    members: RwLock<Vec<Arc<dyn Participant>>>,
    pub(crate) streams: Mutex<HashMap<String, StreamState>>,
    events: Arc<EventBus>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        members: Vec<Arc<dyn Participant>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            id,
            members: RwLock::new(members),
            streams: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub(crate) fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Add a member. A participant already present is not duplicated.
    pub async fn add_member(&self, participant: Arc<dyn Participant>) {
        let mut members = self.members.write().await;
        if !members.iter().any(|m| m.id() == participant.id()) {
            members.push(participant);
        }
    }

    /// Remove a member by identity. Returns whether it was present.
    pub async fn remove_member(&self, id: &ParticipantRef) -> bool {
        let mut members = self.members.write().await;
        let before = members.len();
        members.retain(|m| &m.id() != id);
        members.len() < before
    }

    /// Identities of the current members.
    pub async fn member_ids(&self) -> Vec<ParticipantRef> {
        self.members.read().await.iter().map(|m| m.id()).collect()
    }

    /// Current members able to render incremental stream output,
    /// excluding the given sender.
    pub(crate) async fn streaming_recipients(
        &self,
        sender: &ParticipantRef,
    ) -> Vec<Arc<dyn Participant>> {
        self.members
            .read()
            .await
            .iter()
            .filter(|m| &m.id() != sender && m.supports_streaming())
            .cloned()
            .collect()
    }

    /// Deliver a message to every member except its sender.
    ///
    /// A failing recipient never blocks the others; failures come back in
    /// the report instead of as an error.
    pub async fn send(&self, message: &Message) -> DeliveryReport {
        let recipients: Vec<Arc<dyn Participant>> = {
            let members = self.members.read().await;
            members
                .iter()
                .filter(|m| m.id() != message.sender)
                .cloned()
                .collect()
        };

        let mut report = DeliveryReport {
            delivered: Vec::new(),
            failures: Vec::new(),
        };

        for recipient in recipients {
            let recipient_id = recipient.id();
            match recipient.deliver(message.clone()).await {
                Ok(()) => {
                    self.events.publish(&CoordinationEvent::MessageDelivered {
                        message: message.clone(),
                        recipient: recipient_id.clone(),
                    });
                    report.delivered.push(recipient_id);
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %self.id,
                        recipient = %recipient_id,
                        error = %e,
                        "delivery failed, continuing fan-out"
                    );
                    report.failures.push((recipient_id, e.to_string()));
                }
            }
        }

        report
    }
}

/// Registry of live channels.
///
/// The only place channels are created. `get_or_create` is a single
/// check-and-set under the registry lock: concurrent callers for the same
/// participant set observe exactly one instance and exactly one
/// `ChannelCreated` event.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
    events: Arc<EventBus>,
}

impl ChannelRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Get or atomically create the direct channel over `members`.
    pub async fn get_or_create(&self, members: Vec<Arc<dyn Participant>>) -> Arc<Channel> {
        let ids: Vec<ParticipantRef> = members.iter().map(|m| m.id()).collect();
        self.get_or_create_with_id(ChannelId::for_members(&ids), members)
            .await
    }

    /// Get or atomically create a meeting's group channel.
    pub async fn get_or_create_meeting(
        &self,
        meeting: &MeetingId,
        members: Vec<Arc<dyn Participant>>,
    ) -> Arc<Channel> {
        self.get_or_create_with_id(ChannelId::for_meeting(meeting), members)
            .await
    }

    async fn get_or_create_with_id(
        &self,
        id: ChannelId,
        members: Vec<Arc<dyn Participant>>,
    ) -> Arc<Channel> {
        let mut created = false;
        let channel = {
            let mut channels = self.channels.write().await;
            channels
                .entry(id.clone())
                .or_insert_with(|| {
                    created = true;
                    tracing::debug!(channel = %id, "created channel");
                    Arc::new(Channel::new(id.clone(), members, self.events.clone()))
                })
                .clone()
        };

        // Only the creating caller publishes; everyone else saw an
        // existing entry under the lock.
        if created {
            self.events
                .publish(&CoordinationEvent::ChannelCreated { channel: id });
        }
        channel
    }

    /// Look up an existing channel.
    pub async fn get(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.read().await.get(id).cloned()
    }

    /// Number of live channels.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::identity::AgentId;
    use crate::message::Message;
    use crate::participant::{AgentParticipant, ParticipantKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn agent(id: &str) -> Arc<AgentParticipant> {
        Arc::new(AgentParticipant::new(AgentId::new(id)))
    }

    #[test]
    fn test_channel_id_symmetric() {
        let a = ParticipantRef::agent("a");
        let b = ParticipantRef::agent("b");
        assert_eq!(
            ChannelId::for_members(&[a.clone(), b.clone()]),
            ChannelId::for_members(&[b, a])
        );
    }

    #[test]
    fn test_channel_id_distinct_sets() {
        let a = ParticipantRef::agent("a");
        let b = ParticipantRef::agent("b");
        let c = ParticipantRef::agent("c");
        assert_ne!(
            ChannelId::for_members(&[a.clone(), b.clone()]),
            ChannelId::for_members(&[a.clone(), c])
        );
        // Agent and meeting with the same raw string stay distinct.
        assert_ne!(
            ChannelId::for_members(&[a, b]).as_str(),
            ChannelId::for_meeting(&MeetingId::new("a+b")).as_str()
        );
    }

    /// A participant whose delivery always fails.
    struct Broken;

    #[async_trait]
    impl Participant for Broken {
        fn id(&self) -> ParticipantRef {
            ParticipantRef::agent("broken")
        }

        fn kind(&self) -> ParticipantKind {
            ParticipantKind::Agent
        }

        async fn deliver(&self, _message: Message) -> crate::error::Result<()> {
            Err(crate::error::Error::Delivery {
                recipient: "broken".to_string(),
                reason: "inbox on fire".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let events = Arc::new(EventBus::new());
        let healthy = agent("healthy");
        let channel = Channel::new(
            ChannelId::for_members(&[
                ParticipantRef::agent("sender"),
                ParticipantRef::agent("healthy"),
                ParticipantRef::agent("broken"),
            ]),
            vec![agent("sender"), healthy.clone(), Arc::new(Broken)],
            events,
        );

        let msg = Message::direct(
            ParticipantRef::agent("sender"),
            ParticipantRef::agent("healthy"),
            "fan out",
        );
        let report = channel.send(&msg).await;

        assert!(report.is_partial());
        assert_eq!(report.delivered, vec![ParticipantRef::agent("healthy")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, ParticipantRef::agent("broken"));
        // The healthy member still got the message.
        assert_eq!(healthy.inbox().len(), 1);
    }

    #[tokio::test]
    async fn test_sender_excluded_from_fanout() {
        let events = Arc::new(EventBus::new());
        let sender = agent("sender");
        let peer = agent("peer");
        let channel = Channel::new(
            ChannelId::for_members(&[sender.id(), peer.id()]),
            vec![sender.clone(), peer.clone()],
            events,
        );

        let msg = Message::direct(sender.id(), peer.id(), "hi");
        let report = channel.send(&msg).await;

        assert!(report.all_ok());
        assert_eq!(sender.inbox().len(), 0);
        assert_eq!(peer.inbox().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_single_instance() {
        let events = Arc::new(EventBus::new());
        let created = Arc::new(AtomicUsize::new(0));

        let created_clone = created.clone();
        events.subscribe(EventFilter::All, move |event| {
            if matches!(event, CoordinationEvent::ChannelCreated { .. }) {
                created_clone.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        let registry = Arc::new(ChannelRegistry::new(events));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let channel = registry.get_or_create(vec![agent("a"), agent("b")]).await;
                channel.id().clone()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.len().await, 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_membership_add_remove_idempotent() {
        let events = Arc::new(EventBus::new());
        let channel = Channel::new(
            ChannelId::for_meeting(&MeetingId::new("m1")),
            vec![],
            events,
        );

        channel.add_member(agent("a")).await;
        channel.add_member(agent("a")).await;
        assert_eq!(channel.member_ids().await.len(), 1);

        assert!(channel.remove_member(&ParticipantRef::agent("a")).await);
        assert!(!channel.remove_member(&ParticipantRef::agent("a")).await);
    }
}
