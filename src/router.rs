//! Top-level registry and routing facade.
//!
//! The router owns the participant directory, the channel registry, and
//! the meeting manager, and is the entry surface the interpreter layer
//! calls. Identifier text is parsed once at this boundary; resolution
//! failures surface as typed errors and are never silently dropped or
//! retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{Channel, ChannelRegistry, DeliveryReport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::identity::{self, AgentId, MeetingId, ParsedTarget, ParticipantRef};
use crate::meeting::{Meeting, MeetingManager, MeetingState};
use crate::message::{Address, Message};
use crate::participant::{AgentParticipant, HumanParticipant, Participant, ParticipantDirectory};
use crate::queue::MessageQueue;
use crate::stream::StreamStart;

/// Cap on one retrieved batch.
pub const MAX_BATCH: usize = 100;

/// A recipient spec resolved against the live registries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    Participant(ParticipantRef),
    Meeting(MeetingId),
}

/// The coordination core's front door.
pub struct Router {
    directory: Arc<ParticipantDirectory>,
    channels: Arc<ChannelRegistry>,
    meetings: MeetingManager,
    events: Arc<EventBus>,
    config: Config,
    /// Inboxes of in-process participants, for blocking retrieval.
    inboxes: Mutex<HashMap<ParticipantRef, MessageQueue>>,
    /// Stream id -> owning channel, for chunk/complete routing.
    streams: Mutex<HashMap<String, Arc<Channel>>>,
}

impl Router {
    pub fn new(config: Config) -> Self {
        let events = Arc::new(EventBus::new());
        let directory = Arc::new(ParticipantDirectory::new());
        let channels = Arc::new(ChannelRegistry::new(events.clone()));
        let meetings = MeetingManager::new(
            directory.clone(),
            channels.clone(),
            events.clone(),
            config.clone(),
        );
        Self {
            directory,
            channels,
            meetings,
            events,
            config,
            inboxes: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide event bus, for observers (telemetry, transcripts,
    /// presentation bridges).
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The meeting manager, for direct lifecycle calls.
    pub fn meetings(&self) -> &MeetingManager {
        &self.meetings
    }

    // ---- registration ----------------------------------------------------

    /// Register an agent without incremental-display capability. Returns
    /// the inbox its runtime drains.
    pub async fn register_agent(&self, id: AgentId) -> MessageQueue {
        self.register_inboxed(Arc::new(AgentParticipant::new(id)))
            .await
    }

    /// Register an agent able to render incremental stream output.
    pub async fn register_streaming_agent(&self, id: AgentId) -> MessageQueue {
        self.register_inboxed(Arc::new(AgentParticipant::new(id).with_streaming()))
            .await
    }

    /// Register the human operator.
    pub async fn register_human(&self) -> MessageQueue {
        self.register_inboxed(Arc::new(HumanParticipant::new()))
            .await
    }

    /// Register a custom participant shape (e.g. a future transport-backed
    /// one). Such participants handle their own delivery; the router
    /// cannot run `wait_for_messages` for them.
    pub async fn register(&self, participant: Arc<dyn Participant>) {
        self.directory.register(participant).await;
    }

    async fn register_inboxed<P>(&self, participant: Arc<P>) -> MessageQueue
    where
        P: Participant + HasInbox + 'static,
    {
        let inbox = participant.inbox();
        self.inboxes
            .lock()
            .unwrap()
            .insert(participant.id(), inbox.clone());
        self.directory.register(participant).await;
        inbox
    }

    // ---- resolution ------------------------------------------------------

    /// Resolve recipient text against the live registries. Bare tokens are
    /// tried as an agent first, then as a meeting; an id that matches
    /// neither surfaces as `UnknownRecipient`.
    pub async fn resolve(&self, spec: &str) -> Result<ResolvedTarget> {
        match identity::parse(spec)? {
            ParsedTarget::Agent(id) => {
                let participant = ParticipantRef::Agent(id);
                if self.directory.contains(&participant).await {
                    Ok(ResolvedTarget::Participant(participant))
                } else {
                    Err(Error::UnknownRecipient(spec.to_string()))
                }
            }
            ParsedTarget::Meeting(id) => {
                if self.meetings.contains(&id) {
                    Ok(ResolvedTarget::Meeting(id))
                } else {
                    Err(Error::UnknownRecipient(spec.to_string()))
                }
            }
            ParsedTarget::Human => {
                if self.directory.contains(&ParticipantRef::Human).await {
                    Ok(ResolvedTarget::Participant(ParticipantRef::Human))
                } else {
                    Err(Error::UnknownRecipient(spec.to_string()))
                }
            }
            ParsedTarget::Bare(token) => {
                let as_agent = ParticipantRef::agent(token.clone());
                if self.directory.contains(&as_agent).await {
                    return Ok(ResolvedTarget::Participant(as_agent));
                }
                let as_meeting = MeetingId::new(token);
                if self.meetings.contains(&as_meeting) {
                    return Ok(ResolvedTarget::Meeting(as_meeting));
                }
                Err(Error::UnknownRecipient(spec.to_string()))
            }
        }
    }

    // ---- messaging -------------------------------------------------------

    /// Route one message. Direct recipients get it over the pair channel;
    /// meeting recipients get a broadcast to every other joined member.
    pub async fn route_message(
        &self,
        sender: &ParticipantRef,
        recipient_spec: &str,
        content: &str,
    ) -> Result<DeliveryReport> {
        match self.resolve(recipient_spec).await? {
            ResolvedTarget::Participant(recipient) => {
                let channel = self.pair_channel(sender, &recipient).await?;
                let message = Message::direct(sender.clone(), recipient, content);
                Ok(channel.send(&message).await)
            }
            ResolvedTarget::Meeting(meeting) => {
                self.meetings.broadcast(&meeting, sender, content).await
            }
        }
    }

    /// Block until messages arrive for `me`, optionally filtered by
    /// source, bounded by `timeout`. Returns an ordered batch; a timeout
    /// with nothing buffered returns an empty batch.
    pub async fn wait_for_messages(
        &self,
        me: &ParticipantRef,
        source: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        let inbox = self.inbox_of(me)?;
        let filter = match source {
            Some(spec) => Some(self.resolve(spec).await?),
            None => None,
        };

        inbox
            .get_batch(
                move |m| match &filter {
                    None => true,
                    Some(ResolvedTarget::Participant(p)) => &m.sender == p,
                    Some(ResolvedTarget::Meeting(id)) => m.meeting() == Some(id),
                },
                timeout,
                1,
                MAX_BATCH,
            )
            .await
    }

    /// Meeting-scoped wait with the differential window: short when
    /// buffered traffic targets `me` (first match returns immediately),
    /// longer otherwise — the window is held open so several unaddressed
    /// contributions accumulate into one batch. Human-originated messages
    /// wake the waiter immediately either way.
    pub async fn wait_for_meeting_messages(
        &self,
        me: &ParticipantRef,
        meeting: &MeetingId,
    ) -> Result<Vec<Message>> {
        let inbox = self.inbox_of(me)?;
        let window = inbox.wait_window(&self.config, me, me.name());
        let meeting = meeting.clone();
        inbox
            .get_batch(
                move |m| m.meeting() == Some(&meeting),
                window.timeout,
                window.min_items,
                MAX_BATCH,
            )
            .await
    }

    // ---- meetings --------------------------------------------------------

    /// Create a meeting and send its invitations. The owner should then
    /// suspend on [`wait_for_quorum`](Self::wait_for_quorum).
    pub async fn create_meeting(
        &self,
        owner: &ParticipantRef,
        topic: &str,
        required: Vec<ParticipantRef>,
        optional: Vec<ParticipantRef>,
    ) -> Result<MeetingId> {
        self.meetings
            .create_meeting(owner.clone(), topic, required, optional)
            .await
    }

    /// Suspend until quorum or the configured timeout.
    pub async fn wait_for_quorum(&self, meeting: &MeetingId) -> Result<()> {
        self.meetings.wait_for_quorum(meeting).await
    }

    pub async fn join_meeting(&self, meeting: &MeetingId, who: &ParticipantRef) -> Result<()> {
        self.meetings.join_meeting(meeting, who).await
    }

    pub async fn reject_invitation(
        &self,
        meeting: &MeetingId,
        who: &ParticipantRef,
        reason: &str,
    ) -> Result<()> {
        self.meetings.reject_invitation(meeting, who, reason).await
    }

    pub async fn leave_meeting(&self, meeting: &MeetingId, who: &ParticipantRef) -> Result<()> {
        self.meetings.leave_meeting(meeting, who).await
    }

    pub async fn end_meeting(&self, meeting: &MeetingId, who: &ParticipantRef) -> Result<()> {
        self.meetings.end_meeting(meeting, who).await
    }

    /// Read-only snapshot of a meeting record.
    pub fn meeting_snapshot(&self, meeting: &MeetingId) -> Result<Meeting> {
        self.meetings.snapshot(meeting)
    }

    pub fn meeting_state(&self, meeting: &MeetingId) -> Result<MeetingState> {
        self.meetings.state(meeting)
    }

    // ---- streams ---------------------------------------------------------

    /// Open a stream toward a direct recipient or a meeting. The result
    /// says explicitly whether incremental delivery happens or the call
    /// degraded to whole-message delivery.
    pub async fn start_stream(
        &self,
        sender: &ParticipantRef,
        recipient_spec: &str,
    ) -> Result<StreamStart> {
        let (channel, address) = match self.resolve(recipient_spec).await? {
            ResolvedTarget::Participant(recipient) => {
                let channel = self.pair_channel(sender, &recipient).await?;
                (channel, Address::Direct(recipient))
            }
            ResolvedTarget::Meeting(meeting) => {
                let channel = self.meetings.channel(&meeting)?;
                (
                    channel,
                    Address::Meeting {
                        meeting,
                        targets: Vec::new(),
                    },
                )
            }
        };

        let start = channel.start_stream(sender.clone(), address).await?;
        self.streams
            .lock()
            .unwrap()
            .insert(start.stream_id().to_string(), channel);
        Ok(start)
    }

    /// Append a chunk to an open stream.
    pub fn stream_chunk(&self, stream_id: &str, chunk: &str) -> Result<()> {
        let channel = self.stream_channel(stream_id)?;
        channel.stream_chunk(stream_id, chunk)
    }

    /// Close a stream; the full content is delivered exactly once.
    pub async fn complete_stream(&self, stream_id: &str) -> Result<DeliveryReport> {
        let channel = self.stream_channel(stream_id)?;
        let report = channel.complete_stream(stream_id).await?;
        self.streams.lock().unwrap().remove(stream_id);
        Ok(report)
    }

    // ---- internals -------------------------------------------------------

    async fn pair_channel(
        &self,
        sender: &ParticipantRef,
        recipient: &ParticipantRef,
    ) -> Result<Arc<Channel>> {
        let sender_p = self
            .directory
            .get(sender)
            .await
            .ok_or_else(|| Error::UnknownRecipient(sender.to_string()))?;
        let recipient_p = self
            .directory
            .get(recipient)
            .await
            .ok_or_else(|| Error::UnknownRecipient(recipient.to_string()))?;
        Ok(self.channels.get_or_create(vec![sender_p, recipient_p]).await)
    }

    fn inbox_of(&self, me: &ParticipantRef) -> Result<MessageQueue> {
        self.inboxes
            .lock()
            .unwrap()
            .get(me)
            .cloned()
            .ok_or_else(|| Error::UnknownRecipient(me.to_string()))
    }

    fn stream_channel(&self, stream_id: &str) -> Result<Arc<Channel>> {
        self.streams
            .lock()
            .unwrap()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| {
                Error::StreamProtocol(format!("no open stream with id {}", stream_id))
            })
    }
}

/// In-process participant shapes that expose their inbox to the router.
trait HasInbox {
    fn inbox(&self) -> MessageQueue;
}

impl HasInbox for AgentParticipant {
    fn inbox(&self) -> MessageQueue {
        self.inbox()
    }
}

impl HasInbox for HumanParticipant {
    fn inbox(&self) -> MessageQueue {
        self.inbox()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    async fn router_with(agents: &[&str]) -> Router {
        let router = Router::new(Config {
            quorum_timeout_ms: 200,
            batch_window_ms: 300,
            ..Config::default()
        });
        router.register_human().await;
        for id in agents {
            router.register_agent(AgentId::new(*id)).await;
        }
        router
    }

    #[tokio::test]
    async fn test_route_direct_message() {
        let router = router_with(&["a", "b"]).await;

        let report = router
            .route_message(&ParticipantRef::agent("a"), "agent b", "hello b")
            .await
            .unwrap();
        assert!(report.all_ok());

        let batch = router
            .wait_for_messages(
                &ParticipantRef::agent("b"),
                None,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].content, "hello b");
        assert_eq!(batch[0].kind, MessageKind::Direct);
    }

    #[tokio::test]
    async fn test_unknown_recipient_surfaces() {
        let router = router_with(&["a"]).await;

        let result = router
            .route_message(&ParticipantRef::agent("a"), "agent ghost", "anyone?")
            .await;
        assert!(matches!(result, Err(Error::UnknownRecipient(_))));

        // Malformed text fails at parse time, not resolution time.
        let result = router
            .route_message(&ParticipantRef::agent("a"), "not an id at all", "?")
            .await;
        assert!(matches!(result, Err(Error::MalformedIdentifier { .. })));
    }

    #[tokio::test]
    async fn test_bare_token_resolution() {
        let router = router_with(&["coder"]).await;

        // Bare token resolves by context to the registered agent.
        assert_eq!(
            router.resolve("coder").await.unwrap(),
            ResolvedTarget::Participant(ParticipantRef::agent("coder"))
        );

        let meeting = router
            .create_meeting(&ParticipantRef::Human, "sync", vec![], vec![])
            .await
            .unwrap();
        assert_eq!(
            router.resolve(meeting.as_str()).await.unwrap(),
            ResolvedTarget::Meeting(meeting)
        );
    }

    #[tokio::test]
    async fn test_source_filtered_wait() {
        let router = router_with(&["a", "b", "c"]).await;

        router
            .route_message(&ParticipantRef::agent("a"), "agent c", "from a")
            .await
            .unwrap();
        router
            .route_message(&ParticipantRef::agent("b"), "agent c", "from b")
            .await
            .unwrap();

        let batch = router
            .wait_for_messages(
                &ParticipantRef::agent("c"),
                Some("agent a"),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].content, "from a");

        // The other message is still buffered.
        let rest = router
            .wait_for_messages(
                &ParticipantRef::agent("c"),
                None,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].content, "from b");
    }

    #[tokio::test]
    async fn test_meeting_flow_through_router() {
        let router = Arc::new(router_with(&["a", "b"]).await);
        let meeting = router
            .create_meeting(
                &ParticipantRef::Human,
                "planning",
                vec![ParticipantRef::agent("a"), ParticipantRef::agent("b")],
                vec![],
            )
            .await
            .unwrap();

        let waiter = {
            let router = router.clone();
            let meeting = meeting.clone();
            tokio::spawn(async move { router.wait_for_quorum(&meeting).await })
        };

        router
            .join_meeting(&meeting, &ParticipantRef::agent("a"))
            .await
            .unwrap();
        router
            .join_meeting(&meeting, &ParticipantRef::agent("b"))
            .await
            .unwrap();
        waiter.await.unwrap().unwrap();

        // Routing to the meeting id fans out to the other members.
        let report = router
            .route_message(
                &ParticipantRef::agent("a"),
                &meeting.to_string(),
                "let's begin",
            )
            .await
            .unwrap();
        assert_eq!(report.delivered.len(), 2);

        let batch = router
            .wait_for_meeting_messages(&ParticipantRef::agent("b"), &meeting)
            .await
            .unwrap();
        assert!(batch.iter().any(|m| m.content == "let's begin"));
    }

    #[tokio::test]
    async fn test_unaddressed_broadcasts_batch_in_one_window() {
        let router = Arc::new(Router::new(Config {
            quorum_timeout_ms: 200,
            fast_window_ms: 100,
            batch_window_ms: 600,
            ..Config::default()
        }));
        router.register_human().await;
        router.register_agent(AgentId::new("a")).await;
        router.register_agent(AgentId::new("b")).await;

        let meeting = router
            .create_meeting(
                &ParticipantRef::Human,
                "updates",
                vec![ParticipantRef::agent("a"), ParticipantRef::agent("b")],
                vec![],
            )
            .await
            .unwrap();
        router
            .join_meeting(&meeting, &ParticipantRef::agent("a"))
            .await
            .unwrap();
        router
            .join_meeting(&meeting, &ParticipantRef::agent("b"))
            .await
            .unwrap();

        router
            .route_message(&ParticipantRef::agent("a"), &meeting.to_string(), "first")
            .await
            .unwrap();
        let sender = router.clone();
        let target = meeting.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            sender
                .route_message(&ParticipantRef::agent("a"), &target.to_string(), "second")
                .await
                .unwrap();
        });

        // Neither broadcast targets b, so the accumulation window holds
        // open and both land in a single batch.
        let start = std::time::Instant::now();
        let batch = router
            .wait_for_meeting_messages(&ParticipantRef::agent("b"), &meeting)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
        let contents: Vec<&str> = batch.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_stream_through_router() {
        let router = router_with(&["writer"]).await;

        // Human supports streaming, so the stream materializes.
        let start = router
            .start_stream(&ParticipantRef::agent("writer"), "human")
            .await
            .unwrap();
        assert!(start.started());

        router.stream_chunk(start.stream_id(), "long ").unwrap();
        router.stream_chunk(start.stream_id(), "report").unwrap();
        let report = router.complete_stream(start.stream_id()).await.unwrap();
        assert!(report.all_ok());

        // Stream state is gone after completion.
        assert!(matches!(
            router.stream_chunk(start.stream_id(), "late"),
            Err(Error::StreamProtocol(_))
        ));

        let batch = router
            .wait_for_messages(&ParticipantRef::Human, None, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(batch.iter().any(|m| m.content == "long report"));
    }
}
