//! Meetings and the coordination manager.
//!
//! Handles:
//! - Meeting lifecycle: FORMING -> ACTIVE -> ENDED, one-directional
//! - Invitations, quorum gating, and the owner's event-based quorum wait
//! - Broadcast through the group channel with bounded history
//! - Dynamic membership: idempotent invites, leave notifications,
//!   sole-survivor confirmation before ending
//!
//! All state changes happen under the per-meeting lock; channel sends and
//! event publication happen after the lock is released. The owner's quorum
//! wait suspends on a `Notify` woken by every membership change; the core
//! never polls and never retries a timed-out wait.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelRegistry, DeliveryReport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::identity::{MeetingId, ParticipantRef};
use crate::message::{Address, Message, MessageKind};
use crate::participant::ParticipantDirectory;

/// Meeting lifecycle states. Transitions are one-directional; there is no
/// resurrection from `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingState {
    /// Invitations outstanding.
    Forming,
    /// All required attendees joined.
    Active,
    /// Explicitly ended, or the last participant departed.
    Ended,
}

/// How an invitee has responded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Joined,
    Rejected { reason: String },
}

/// One invitation and its state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingInvitation {
    pub inviter: ParticipantRef,
    pub invitee: ParticipantRef,
    pub issued_at: i64,
    pub status: InvitationStatus,
}

impl MeetingInvitation {
    fn new(inviter: ParticipantRef, invitee: ParticipantRef) -> Self {
        Self {
            inviter,
            invitee,
            issued_at: current_timestamp(),
            status: InvitationStatus::Pending,
        }
    }
}

/// A structured group conversation with explicit membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: MeetingId,
    pub owner: ParticipantRef,
    pub topic: String,
    pub required: Vec<ParticipantRef>,
    pub optional: Vec<ParticipantRef>,
    pub joined: Vec<ParticipantRef>,
    pub invitations: HashMap<ParticipantRef, MeetingInvitation>,
    /// Append-only, bounded; oldest entries drop past the limit.
    pub history: VecDeque<Message>,
    /// Small shared key/value blob visible to all participants.
    pub shared: HashMap<String, serde_json::Value>,
    pub state: MeetingState,
    pub created_at: i64,
    /// Whether this meeting ever had two or more joined participants.
    was_multi_party: bool,
    /// Sole remaining participant asked to confirm ending, if any.
    pending_end_confirmation: Option<ParticipantRef>,
}

impl Meeting {
    fn new(
        id: MeetingId,
        owner: ParticipantRef,
        topic: impl Into<String>,
        required: Vec<ParticipantRef>,
        optional: Vec<ParticipantRef>,
    ) -> Self {
        Self {
            id,
            owner: owner.clone(),
            topic: topic.into(),
            required,
            optional,
            joined: vec![owner],
            invitations: HashMap::new(),
            history: VecDeque::new(),
            shared: HashMap::new(),
            state: MeetingState::Forming,
            created_at: current_timestamp(),
            was_multi_party: false,
            pending_end_confirmation: None,
        }
    }

    /// Required attendees that have not joined.
    pub fn missing_required(&self) -> Vec<ParticipantRef> {
        self.required
            .iter()
            .filter(|r| !self.joined.contains(r))
            .cloned()
            .collect()
    }

    /// Whether every required attendee has joined. Optional attendees
    /// never gate this.
    pub fn is_quorate(&self) -> bool {
        self.missing_required().is_empty()
    }

    /// The sole remaining participant asked to confirm ending, if a
    /// confirmation is outstanding. Cleared when anyone joins.
    pub fn pending_end_confirmation(&self) -> Option<&ParticipantRef> {
        self.pending_end_confirmation.as_ref()
    }

    fn record_join(&mut self, who: ParticipantRef) {
        self.joined.push(who.clone());
        if self.joined.len() >= 2 {
            self.was_multi_party = true;
        }
        self.pending_end_confirmation = None;
        self.invitations
            .entry(who.clone())
            .and_modify(|inv| inv.status = InvitationStatus::Joined)
            .or_insert_with(|| {
                let mut inv = MeetingInvitation::new(who.clone(), who);
                inv.status = InvitationStatus::Joined;
                inv
            });
    }

    fn append_history(&mut self, message: Message, limit: usize) {
        self.history.push_back(message);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

/// Per-meeting live state: the record, its wake-up, and its group channel.
struct MeetingHandle {
    state: Mutex<Meeting>,
    changed: Notify,
    channel: Arc<Channel>,
}

/// Group lifecycle coordinator, built on channels, messages, and queues.
pub struct MeetingManager {
    meetings: Mutex<HashMap<MeetingId, Arc<MeetingHandle>>>,
    directory: Arc<ParticipantDirectory>,
    channels: Arc<ChannelRegistry>,
    events: Arc<EventBus>,
    config: Config,
}

impl MeetingManager {
    pub fn new(
        directory: Arc<ParticipantDirectory>,
        channels: Arc<ChannelRegistry>,
        events: Arc<EventBus>,
        config: Config,
    ) -> Self {
        Self {
            meetings: Mutex::new(HashMap::new()),
            directory,
            channels,
            events,
            config,
        }
    }

    /// Create a meeting: allocate its id, open the group channel, and send
    /// an invitation to each invitee over that invitee's 1:1 channel with
    /// the owner.
    ///
    /// Returns once invitations are out; the owner then suspends on
    /// [`wait_for_quorum`](Self::wait_for_quorum).
    pub async fn create_meeting(
        &self,
        owner: ParticipantRef,
        topic: &str,
        required: Vec<ParticipantRef>,
        optional: Vec<ParticipantRef>,
    ) -> Result<MeetingId> {
        let owner_participant = self
            .directory
            .get(&owner)
            .await
            .ok_or_else(|| Error::UnknownRecipient(owner.to_string()))?;

        // Resolve every invitee up front; an unknown invitee surfaces
        // before any state is created.
        let mut invitees = Vec::new();
        for invitee in required.iter().chain(optional.iter()) {
            let participant = self
                .directory
                .get(invitee)
                .await
                .ok_or_else(|| Error::UnknownRecipient(invitee.to_string()))?;
            invitees.push((invitee.clone(), participant));
        }

        let id = MeetingId::new(ulid::Ulid::new().to_string());
        let channel = self
            .channels
            .get_or_create_meeting(&id, vec![owner_participant.clone()])
            .await;

        let mut meeting = Meeting::new(
            id.clone(),
            owner.clone(),
            topic,
            required.clone(),
            optional,
        );
        for (invitee, _) in &invitees {
            meeting
                .invitations
                .insert(invitee.clone(), MeetingInvitation::new(owner.clone(), invitee.clone()));
        }
        let quorate_at_creation = meeting.is_quorate();
        if quorate_at_creation {
            meeting.state = MeetingState::Active;
        }

        let handle = Arc::new(MeetingHandle {
            state: Mutex::new(meeting),
            changed: Notify::new(),
            channel,
        });
        self.meetings.lock().unwrap().insert(id.clone(), handle);

        tracing::info!(meeting = %id, topic = %topic, "created meeting");

        for (invitee, participant) in &invitees {
            let pair = self
                .channels
                .get_or_create(vec![owner_participant.clone(), participant.clone()])
                .await;
            let invitation = Message::new(
                owner.clone(),
                Address::Direct(invitee.clone()),
                MessageKind::Invitation,
                format!("{} invites you to '{}' ({})", owner.name(), topic, id),
            );
            let report = pair.send(&invitation).await;
            if !report.all_ok() {
                tracing::warn!(
                    meeting = %id,
                    invitee = %invitee,
                    "invitation delivery failed"
                );
            }
            self.events.publish(&CoordinationEvent::InvitationIssued {
                meeting: id.clone(),
                invitee: invitee.clone(),
            });
        }

        if quorate_at_creation {
            self.events
                .publish(&CoordinationEvent::MeetingStarted { meeting: id.clone() });
        }

        Ok(id)
    }

    /// Suspend until the meeting reaches quorum, bounded by the configured
    /// timeout. On expiry, raises `MeetingTimeout` naming the still-missing
    /// required attendees; the core never retries this internally.
    pub async fn wait_for_quorum(&self, meeting: &MeetingId) -> Result<()> {
        let handle = self.handle(meeting)?;
        let deadline = Instant::now() + self.config.quorum_timeout();

        loop {
            let notified = handle.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = handle.state.lock().unwrap();
                match state.state {
                    MeetingState::Active => return Ok(()),
                    MeetingState::Ended => return Err(Error::MeetingEnded(meeting.clone())),
                    MeetingState::Forming => {}
                }
            }

            if Instant::now() >= deadline {
                return quorum_deadline_outcome(&handle, meeting);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return quorum_deadline_outcome(&handle, meeting);
                }
            }
        }
    }

    /// Accept an invitation and join. Joining an already-joined meeting is
    /// a no-op. When the last required attendee joins, the meeting goes
    /// ACTIVE, members get a started notification, and the owner's quorum
    /// wait is woken.
    pub async fn join_meeting(&self, meeting: &MeetingId, who: &ParticipantRef) -> Result<()> {
        let handle = self.handle(meeting)?;
        let participant = self
            .directory
            .get(who)
            .await
            .ok_or_else(|| Error::UnknownRecipient(who.to_string()))?;

        let (activated, topic) = {
            let mut state = handle.state.lock().unwrap();
            if state.state == MeetingState::Ended {
                return Err(Error::MeetingEnded(meeting.clone()));
            }
            if state.joined.contains(who) {
                return Ok(());
            }
            state.record_join(who.clone());

            let activated = state.state == MeetingState::Forming && state.is_quorate();
            if activated {
                state.state = MeetingState::Active;
            }
            (activated, state.topic.clone())
        };

        handle.channel.add_member(participant).await;

        let joined_note = Message::new(
            who.clone(),
            meeting_address(meeting),
            MessageKind::InvitationResponse,
            format!("{} joined the meeting", who.name()),
        );
        handle.channel.send(&joined_note).await;

        self.events.publish(&CoordinationEvent::InvitationResolved {
            meeting: meeting.clone(),
            invitee: who.clone(),
            joined: true,
        });

        if activated {
            tracing::info!(meeting = %meeting, "meeting reached quorum");
            let started = Message::new(
                who.clone(),
                meeting_address(meeting),
                MessageKind::MeetingBroadcast,
                format!("Meeting started: {}", topic),
            );
            handle.channel.send(&started).await;
            self.events
                .publish(&CoordinationEvent::MeetingStarted { meeting: meeting.clone() });
        }

        handle.changed.notify_waiters();
        Ok(())
    }

    /// Decline an invitation with a reason. A rejected required attendee
    /// still counts as missing for quorum; the owner's wait runs to its
    /// timeout rather than failing early.
    pub async fn reject_invitation(
        &self,
        meeting: &MeetingId,
        who: &ParticipantRef,
        reason: &str,
    ) -> Result<()> {
        let handle = self.handle(meeting)?;

        {
            let mut state = handle.state.lock().unwrap();
            if state.state == MeetingState::Ended {
                return Err(Error::MeetingEnded(meeting.clone()));
            }
            state
                .invitations
                .entry(who.clone())
                .and_modify(|inv| {
                    inv.status = InvitationStatus::Rejected {
                        reason: reason.to_string(),
                    }
                })
                .or_insert_with(|| {
                    let mut inv = MeetingInvitation::new(who.clone(), who.clone());
                    inv.status = InvitationStatus::Rejected {
                        reason: reason.to_string(),
                    };
                    inv
                });
        }

        let note = Message::new(
            who.clone(),
            meeting_address(meeting),
            MessageKind::InvitationResponse,
            format!("{} declined the invitation: {}", who.name(), reason),
        );
        handle.channel.send(&note).await;

        self.events.publish(&CoordinationEvent::InvitationResolved {
            meeting: meeting.clone(),
            invitee: who.clone(),
            joined: false,
        });
        handle.changed.notify_waiters();
        Ok(())
    }

    /// Invite another participant mid-meeting. Idempotent: inviting an
    /// already-joined or already-pending participant sends nothing and
    /// changes nothing.
    pub async fn invite(
        &self,
        meeting: &MeetingId,
        inviter: &ParticipantRef,
        invitee: &ParticipantRef,
        required: bool,
    ) -> Result<()> {
        let handle = self.handle(meeting)?;
        let inviter_participant = self
            .directory
            .get(inviter)
            .await
            .ok_or_else(|| Error::UnknownRecipient(inviter.to_string()))?;
        let invitee_participant = self
            .directory
            .get(invitee)
            .await
            .ok_or_else(|| Error::UnknownRecipient(invitee.to_string()))?;

        let topic = {
            let mut state = handle.state.lock().unwrap();
            if state.state == MeetingState::Ended {
                return Err(Error::MeetingEnded(meeting.clone()));
            }
            let already_pending = matches!(
                state.invitations.get(invitee).map(|inv| &inv.status),
                Some(InvitationStatus::Pending)
            );
            if state.joined.contains(invitee) || already_pending {
                return Ok(());
            }
            let roster = if required {
                &mut state.required
            } else {
                &mut state.optional
            };
            if !roster.contains(invitee) {
                roster.push(invitee.clone());
            }
            state
                .invitations
                .insert(invitee.clone(), MeetingInvitation::new(inviter.clone(), invitee.clone()));
            state.topic.clone()
        };

        let pair = self
            .channels
            .get_or_create(vec![inviter_participant, invitee_participant])
            .await;
        let invitation = Message::new(
            inviter.clone(),
            Address::Direct(invitee.clone()),
            MessageKind::Invitation,
            format!("{} invites you to '{}' ({})", inviter.name(), topic, meeting),
        );
        pair.send(&invitation).await;

        let note = Message::new(
            inviter.clone(),
            meeting_address(meeting),
            MessageKind::MeetingBroadcast,
            format!("{} was invited to the meeting", invitee.name()),
        );
        handle.channel.send(&note).await;

        self.events.publish(&CoordinationEvent::InvitationIssued {
            meeting: meeting.clone(),
            invitee: invitee.clone(),
        });
        handle.changed.notify_waiters();
        Ok(())
    }

    /// Broadcast to every other joined member and append to the bounded
    /// history.
    pub async fn broadcast(
        &self,
        meeting: &MeetingId,
        sender: &ParticipantRef,
        content: &str,
    ) -> Result<DeliveryReport> {
        self.broadcast_message(
            meeting,
            Message::meeting_broadcast(sender.clone(), meeting.clone(), content),
        )
        .await
    }

    /// Broadcast a pre-built message (used for explicitly targeted
    /// contributions).
    pub async fn broadcast_message(
        &self,
        meeting: &MeetingId,
        message: Message,
    ) -> Result<DeliveryReport> {
        let handle = self.handle(meeting)?;

        {
            let mut state = handle.state.lock().unwrap();
            if state.state == MeetingState::Ended {
                return Err(Error::MeetingEnded(meeting.clone()));
            }
            if !state.joined.contains(&message.sender) {
                return Err(Error::Other(format!(
                    "{} is not a joined member of {}",
                    message.sender, meeting
                )));
            }
            let limit = self.config.history_limit;
            state.append_history(message.clone(), limit);
        }

        Ok(handle.channel.send(&message).await)
    }

    /// Leave a meeting. Idempotent: a second leave for the same
    /// participant is a no-op. Remaining members are notified by name.
    ///
    /// When the last member leaves, the meeting ends implicitly. When
    /// exactly one member remains in a previously multi-party meeting, it
    /// does not auto-end: that member is prompted to confirm first.
    pub async fn leave_meeting(&self, meeting: &MeetingId, who: &ParticipantRef) -> Result<()> {
        let handle = self.handle(meeting)?;

        let (was_member, ended, prompt) = {
            let mut state = handle.state.lock().unwrap();
            if state.state == MeetingState::Ended {
                return Err(Error::MeetingEnded(meeting.clone()));
            }
            if !state.joined.contains(who) {
                (false, false, None)
            } else {
                state.joined.retain(|m| m != who);
                if state.joined.is_empty() {
                    state.state = MeetingState::Ended;
                    (true, true, None)
                } else if state.joined.len() == 1 && state.was_multi_party {
                    let sole = state.joined[0].clone();
                    state.pending_end_confirmation = Some(sole.clone());
                    (true, false, Some(sole))
                } else {
                    (true, false, None)
                }
            }
        };

        if !was_member {
            return Ok(());
        }

        handle.channel.remove_member(who).await;

        let note = Message::new(
            who.clone(),
            meeting_address(meeting),
            MessageKind::MeetingBroadcast,
            format!("{} left the meeting", who.name()),
        );
        handle.channel.send(&note).await;

        if let Some(sole) = prompt {
            tracing::debug!(meeting = %meeting, sole = %sole, "prompting sole participant");
            let confirm = Message::new(
                who.clone(),
                meeting_address(meeting),
                MessageKind::MeetingBroadcast,
                "Everyone else has left. Confirm ending the meeting, or invite others to continue.",
            )
            .with_targets(vec![sole]);
            handle.channel.send(&confirm).await;
        }

        self.events.publish(&CoordinationEvent::ParticipantLeft {
            meeting: meeting.clone(),
            who: who.clone(),
        });
        if ended {
            tracing::info!(meeting = %meeting, "last participant left, meeting ended");
            self.events
                .publish(&CoordinationEvent::MeetingEnded { meeting: meeting.clone() });
        }
        handle.changed.notify_waiters();
        Ok(())
    }

    /// End a meeting explicitly. Any operation after this fails with
    /// `MeetingEnded`.
    pub async fn end_meeting(&self, meeting: &MeetingId, who: &ParticipantRef) -> Result<()> {
        let handle = self.handle(meeting)?;

        {
            let mut state = handle.state.lock().unwrap();
            if state.state == MeetingState::Ended {
                return Err(Error::MeetingEnded(meeting.clone()));
            }
            state.state = MeetingState::Ended;
        }

        let note = Message::new(
            who.clone(),
            meeting_address(meeting),
            MessageKind::MeetingBroadcast,
            format!("Meeting ended by {}", who.name()),
        );
        handle.channel.send(&note).await;

        tracing::info!(meeting = %meeting, by = %who, "meeting ended");
        self.events
            .publish(&CoordinationEvent::MeetingEnded { meeting: meeting.clone() });
        handle.changed.notify_waiters();
        Ok(())
    }

    /// Write a key into the meeting's shared state blob.
    pub fn set_shared(
        &self,
        meeting: &MeetingId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let handle = self.handle(meeting)?;
        let mut state = handle.state.lock().unwrap();
        if state.state == MeetingState::Ended {
            return Err(Error::MeetingEnded(meeting.clone()));
        }
        state.shared.insert(key.into(), value);
        Ok(())
    }

    /// Read-only snapshot of the meeting record. Legacy consumers iterate
    /// this instead of holding a second mutable mirror.
    pub fn snapshot(&self, meeting: &MeetingId) -> Result<Meeting> {
        let handle = self.handle(meeting)?;
        let state = handle.state.lock().unwrap();
        Ok(state.clone())
    }

    /// Current lifecycle state.
    pub fn state(&self, meeting: &MeetingId) -> Result<MeetingState> {
        Ok(self.snapshot(meeting)?.state)
    }

    /// The meeting's group channel.
    pub fn channel(&self, meeting: &MeetingId) -> Result<Arc<Channel>> {
        Ok(self.handle(meeting)?.channel.clone())
    }

    /// Whether a meeting with this id exists.
    pub fn contains(&self, meeting: &MeetingId) -> bool {
        self.meetings.lock().unwrap().contains_key(meeting)
    }

    fn handle(&self, meeting: &MeetingId) -> Result<Arc<MeetingHandle>> {
        self.meetings
            .lock()
            .unwrap()
            .get(meeting)
            .cloned()
            .ok_or_else(|| Error::UnknownRecipient(meeting.to_string()))
    }
}

/// Final state check when the quorum deadline fires. A join that raced
/// the timer is honored, and the missing list reflects the state at this
/// moment rather than an earlier look.
fn quorum_deadline_outcome(handle: &MeetingHandle, meeting: &MeetingId) -> Result<()> {
    let state = handle.state.lock().unwrap();
    match state.state {
        MeetingState::Active => Ok(()),
        MeetingState::Ended => Err(Error::MeetingEnded(meeting.clone())),
        MeetingState::Forming => Err(Error::MeetingTimeout {
            meeting: meeting.clone(),
            missing: state
                .missing_required()
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
        }),
    }
}

fn meeting_address(meeting: &MeetingId) -> Address {
    Address::Meeting {
        meeting: meeting.clone(),
        targets: Vec::new(),
    }
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}
