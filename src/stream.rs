//! Stream coordination: chunked delivery of long-form content.
//!
//! A stream is materialized as incremental only when at least one current
//! recipient can render it; otherwise the call degrades to one ordinary
//! message at completion, and says so explicitly in the result. Chunks
//! accumulate server-side, so the `complete` phase always carries the full
//! content exactly once — consumers treat `complete` as the single source
//! of truth and chunks as a transient view.

use crate::channel::{Channel, DeliveryReport};
use crate::error::{Error, Result};
use crate::events::CoordinationEvent;
use crate::identity::ParticipantRef;
use crate::message::{Address, Message, MessageKind};
use crate::participant::Participant;

/// In-flight state for one stream, owned by its channel.
#[derive(Debug)]
pub struct StreamState {
    sender: ParticipantRef,
    address: Address,
    /// Capable recipients notified on each phase. Empty for degraded
    /// streams.
    observers: Vec<ParticipantRef>,
    buffer: String,
}

/// Explicit outcome of opening a stream.
///
/// `Degraded` means "skipped by design": no recipient could render
/// incremental output, so chunks buffer silently and completion delivers
/// one ordinary message. It is a deliberate tag, never an ambiguous empty
/// value, and distinct from an actual failure (which is an `Err`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStart {
    /// At least one recipient renders chunks as they arrive.
    Streamed { stream_id: String },
    /// No capable recipient; content is delivered whole at completion.
    Degraded { stream_id: String },
}

impl StreamStart {
    /// Whether incremental delivery is actually happening.
    pub fn started(&self) -> bool {
        matches!(self, Self::Streamed { .. })
    }

    pub fn stream_id(&self) -> &str {
        match self {
            Self::Streamed { stream_id } | Self::Degraded { stream_id } => stream_id,
        }
    }
}

impl Channel {
    /// Open a stream from `sender` toward this channel's members.
    pub async fn start_stream(
        &self,
        sender: ParticipantRef,
        address: Address,
    ) -> Result<StreamStart> {
        let stream_id = ulid::Ulid::new().to_string();
        let observers: Vec<ParticipantRef> = self
            .streaming_recipients(&sender)
            .await
            .iter()
            .map(|p| p.id())
            .collect();

        let incremental = !observers.is_empty();
        {
            let mut streams = self.streams.lock().unwrap();
            streams.insert(
                stream_id.clone(),
                StreamState {
                    sender: sender.clone(),
                    address,
                    observers: observers.clone(),
                    buffer: String::new(),
                },
            );
        }

        if incremental {
            tracing::debug!(stream = %stream_id, channel = %self.id(), "stream started");
            for recipient in &observers {
                self.events().publish(&CoordinationEvent::StreamStarted {
                    stream_id: stream_id.clone(),
                    sender: sender.clone(),
                    recipient: recipient.clone(),
                });
            }
            Ok(StreamStart::Streamed { stream_id })
        } else {
            tracing::debug!(
                stream = %stream_id,
                channel = %self.id(),
                "no capable recipient, degrading to whole-message delivery"
            );
            Ok(StreamStart::Degraded { stream_id })
        }
    }

    /// Append a chunk to an open stream.
    pub fn stream_chunk(&self, stream_id: &str, chunk: &str) -> Result<()> {
        let observers = {
            let mut streams = self.streams.lock().unwrap();
            let state = streams.get_mut(stream_id).ok_or_else(|| {
                Error::StreamProtocol(format!(
                    "chunk for unknown or completed stream {}",
                    stream_id
                ))
            })?;
            state.buffer.push_str(chunk);
            state.observers.clone()
        };

        for recipient in observers {
            self.events().publish(&CoordinationEvent::StreamChunk {
                stream_id: stream_id.to_string(),
                recipient,
                chunk: chunk.to_string(),
            });
        }
        Ok(())
    }

    /// Close a stream, emitting the full accumulated content exactly once
    /// and delivering it as one message to every member except the sender.
    pub async fn complete_stream(&self, stream_id: &str) -> Result<DeliveryReport> {
        let state = {
            let mut streams = self.streams.lock().unwrap();
            streams.remove(stream_id).ok_or_else(|| {
                Error::StreamProtocol(format!("complete without a prior start for {}", stream_id))
            })?
        };

        for recipient in &state.observers {
            self.events().publish(&CoordinationEvent::StreamCompleted {
                stream_id: stream_id.to_string(),
                recipient: recipient.clone(),
                content: state.buffer.clone(),
            });
        }

        let kind = match &state.address {
            Address::Direct(_) => MessageKind::Direct,
            Address::Meeting { .. } => MessageKind::MeetingBroadcast,
        };
        let message = Message::new(state.sender, state.address, kind, state.buffer)
            .with_stream_id(stream_id);

        tracing::debug!(stream = %stream_id, channel = %self.id(), "stream completed");
        Ok(self.send(&message).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::events::{EventBus, EventFilter};
    use crate::identity::AgentId;
    use crate::participant::{AgentParticipant, Participant};
    use std::sync::{Arc, Mutex};

    fn direct_channel(
        sender: Arc<AgentParticipant>,
        recipient: Arc<AgentParticipant>,
        events: Arc<EventBus>,
    ) -> Channel {
        Channel::new(
            ChannelId::for_members(&[sender.id(), recipient.id()]),
            vec![sender, recipient],
            events,
        )
    }

    #[tokio::test]
    async fn test_degraded_stream_delivers_whole_content() {
        let events = Arc::new(EventBus::new());
        let sender = Arc::new(AgentParticipant::new(AgentId::new("writer")));
        // No streaming capability.
        let recipient = Arc::new(AgentParticipant::new(AgentId::new("reader")));
        let channel = direct_channel(sender.clone(), recipient.clone(), events);

        let start = channel
            .start_stream(sender.id(), Address::Direct(recipient.id()))
            .await
            .unwrap();
        assert!(!start.started());

        channel.stream_chunk(start.stream_id(), "part one, ").unwrap();
        channel.stream_chunk(start.stream_id(), "part two").unwrap();
        let report = channel.complete_stream(start.stream_id()).await.unwrap();
        assert!(report.all_ok());

        // Exactly one ordinary message, carrying everything.
        let inbox = recipient.inbox();
        assert_eq!(inbox.len(), 1);
        let delivered = inbox.peek(|_| true);
        assert_eq!(delivered[0].content, "part one, part two");
        assert_eq!(delivered[0].stream_id.as_deref(), Some(start.stream_id()));
    }

    #[tokio::test]
    async fn test_capable_recipient_sees_phases_and_full_complete() {
        let events = Arc::new(EventBus::new());
        let sender = Arc::new(AgentParticipant::new(AgentId::new("writer")));
        let recipient =
            Arc::new(AgentParticipant::new(AgentId::new("reader")).with_streaming());
        let channel = direct_channel(sender.clone(), recipient.clone(), events.clone());

        let phases = Arc::new(Mutex::new(Vec::new()));
        let phases_clone = phases.clone();
        events.subscribe(EventFilter::Recipient(recipient.id()), move |event| {
            let label = match event {
                CoordinationEvent::StreamStarted { .. } => "start".to_string(),
                CoordinationEvent::StreamChunk { chunk, .. } => format!("chunk:{}", chunk),
                CoordinationEvent::StreamCompleted { content, .. } => {
                    format!("complete:{}", content)
                }
                _ => return Ok(()),
            };
            phases_clone.lock().unwrap().push(label);
            Ok(())
        });

        let start = channel
            .start_stream(sender.id(), Address::Direct(recipient.id()))
            .await
            .unwrap();
        assert!(start.started());

        channel.stream_chunk(start.stream_id(), "abc").unwrap();
        channel.stream_chunk(start.stream_id(), "def").unwrap();
        channel.complete_stream(start.stream_id()).await.unwrap();

        let phases = phases.lock().unwrap();
        assert_eq!(
            *phases,
            vec![
                "start".to_string(),
                "chunk:abc".to_string(),
                "chunk:def".to_string(),
                "complete:abcdef".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_degraded_matches_capable_byte_for_byte() {
        let events = Arc::new(EventBus::new());
        let sender = Arc::new(AgentParticipant::new(AgentId::new("writer")));
        let capable =
            Arc::new(AgentParticipant::new(AgentId::new("capable")).with_streaming());
        let plain = Arc::new(AgentParticipant::new(AgentId::new("plain")));

        let completed = Arc::new(Mutex::new(String::new()));
        let completed_clone = completed.clone();
        events.subscribe(EventFilter::Recipient(capable.id()), move |event| {
            if let CoordinationEvent::StreamCompleted { content, .. } = event {
                *completed_clone.lock().unwrap() = content.clone();
            }
            Ok(())
        });

        let chunks = ["alpha ", "beta ", "gamma"];

        // Capable recipient path.
        let channel_a = direct_channel(sender.clone(), capable.clone(), events.clone());
        let start = channel_a
            .start_stream(sender.id(), Address::Direct(capable.id()))
            .await
            .unwrap();
        assert!(start.started());
        for chunk in chunks {
            channel_a.stream_chunk(start.stream_id(), chunk).unwrap();
        }
        channel_a.complete_stream(start.stream_id()).await.unwrap();

        // Incapable recipient path, same chunks.
        let channel_b = direct_channel(sender.clone(), plain.clone(), events);
        let start = channel_b
            .start_stream(sender.id(), Address::Direct(plain.id()))
            .await
            .unwrap();
        assert!(!start.started());
        for chunk in chunks {
            channel_b.stream_chunk(start.stream_id(), chunk).unwrap();
        }
        channel_b.complete_stream(start.stream_id()).await.unwrap();

        let plain_received = plain.inbox().peek(|_| true);
        assert_eq!(plain_received[0].content, *completed.lock().unwrap());
        assert_eq!(plain_received[0].content, "alpha beta gamma");
    }

    #[tokio::test]
    async fn test_protocol_order_errors() {
        let events = Arc::new(EventBus::new());
        let sender = Arc::new(AgentParticipant::new(AgentId::new("writer")));
        let recipient = Arc::new(AgentParticipant::new(AgentId::new("reader")));
        let channel = direct_channel(sender.clone(), recipient.clone(), events);

        // Complete without start.
        assert!(matches!(
            channel.complete_stream("nope").await,
            Err(Error::StreamProtocol(_))
        ));

        // Chunk after complete.
        let start = channel
            .start_stream(sender.id(), Address::Direct(recipient.id()))
            .await
            .unwrap();
        channel.stream_chunk(start.stream_id(), "x").unwrap();
        channel.complete_stream(start.stream_id()).await.unwrap();
        assert!(matches!(
            channel.stream_chunk(start.stream_id(), "y"),
            Err(Error::StreamProtocol(_))
        ));
    }
}
