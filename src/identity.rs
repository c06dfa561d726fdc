//! Typed participant and meeting identifiers.
//!
//! Parsing happens exactly once, at the boundary where text from the
//! interpreter layer enters the core. Downstream code compares typed ids,
//! never strings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Aliases accepted for the human participant.
const HUMAN_ALIASES: &[&str] = &["human", "user", "operator"];

/// Identifier for an agent participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent {}", self.0)
    }
}

/// Identifier for a meeting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeetingId(String);

impl MeetingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "meeting {}", self.0)
    }
}

/// A deliverable participant: an agent or the human operator.
///
/// This is the closed sum used everywhere a sender or recipient appears.
/// The human case is a singleton; there is one human per process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRef {
    Agent(AgentId),
    Human,
}

impl ParticipantRef {
    pub fn agent(id: impl Into<String>) -> Self {
        Self::Agent(AgentId::new(id))
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Self::Human)
    }

    /// Short display name, without the kind prefix.
    pub fn name(&self) -> &str {
        match self {
            Self::Agent(id) => id.as_str(),
            Self::Human => "human",
        }
    }

    /// Compact canonical key, used for deterministic channel ids.
    pub fn key(&self) -> String {
        match self {
            Self::Agent(id) => format!("agent:{}", id.as_str()),
            Self::Human => "human".to_string(),
        }
    }
}

impl fmt::Display for ParticipantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "{}", id),
            Self::Human => write!(f, "human"),
        }
    }
}

/// Result of parsing an identifier at the boundary.
///
/// A bare token ("1234") is ambiguous between an agent and a meeting; the
/// parser reports it as `Bare` and the router resolves it against its
/// registries. The parser itself never resolves ambiguity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTarget {
    Agent(AgentId),
    Meeting(MeetingId),
    Human,
    Bare(String),
}

/// Parse an identifier from interpreter-layer text.
///
/// Recognized forms:
/// - `agent <id>` (also `agent-<id>`, `agent:<id>`)
/// - `meeting <id>` (same separators)
/// - human aliases: `human`, `user`, `operator`
/// - a bare token, reported as [`ParsedTarget::Bare`]
pub fn parse(text: &str) -> Result<ParsedTarget> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(Error::MalformedIdentifier {
            input: text.to_string(),
        });
    }

    let lowered = trimmed.to_lowercase();
    if HUMAN_ALIASES.contains(&lowered.as_str()) {
        return Ok(ParsedTarget::Human);
    }

    if let Some(rest) = strip_kind_prefix(trimmed, "agent") {
        return if rest.is_empty() {
            Err(Error::MalformedIdentifier {
                input: text.to_string(),
            })
        } else {
            Ok(ParsedTarget::Agent(AgentId::new(rest)))
        };
    }

    if let Some(rest) = strip_kind_prefix(trimmed, "meeting") {
        return if rest.is_empty() {
            Err(Error::MalformedIdentifier {
                input: text.to_string(),
            })
        } else {
            Ok(ParsedTarget::Meeting(MeetingId::new(rest)))
        };
    }

    // A single bare token is valid but ambiguous; anything with interior
    // whitespace is malformed.
    if trimmed.split_whitespace().count() == 1 {
        Ok(ParsedTarget::Bare(trimmed.to_string()))
    } else {
        Err(Error::MalformedIdentifier {
            input: text.to_string(),
        })
    }
}

/// Strip `<kind> `, `<kind>-` or `<kind>:` (case-insensitive) from `text`.
fn strip_kind_prefix<'a>(text: &'a str, kind: &str) -> Option<&'a str> {
    if text.len() < kind.len() || !text[..kind.len()].eq_ignore_ascii_case(kind) {
        return None;
    }
    let rest = &text[kind.len()..];
    let mut chars = rest.chars();
    match chars.next() {
        Some(' ') | Some('-') | Some(':') => Some(chars.as_str().trim()),
        None => Some(""),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent() {
        assert_eq!(
            parse("agent 1234").unwrap(),
            ParsedTarget::Agent(AgentId::new("1234"))
        );
        assert_eq!(
            parse("Agent-coder").unwrap(),
            ParsedTarget::Agent(AgentId::new("coder"))
        );
        assert_eq!(
            parse("agent:42").unwrap(),
            ParsedTarget::Agent(AgentId::new("42"))
        );
    }

    #[test]
    fn test_parse_meeting() {
        assert_eq!(
            parse("meeting 42").unwrap(),
            ParsedTarget::Meeting(MeetingId::new("42"))
        );
    }

    #[test]
    fn test_parse_human_aliases() {
        for alias in ["human", "user", "operator", "Human"] {
            assert_eq!(parse(alias).unwrap(), ParsedTarget::Human);
        }
    }

    #[test]
    fn test_parse_bare() {
        assert_eq!(parse("1234").unwrap(), ParsedTarget::Bare("1234".into()));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse(""),
            Err(Error::MalformedIdentifier { .. })
        ));
        assert!(matches!(
            parse("agent "),
            Err(Error::MalformedIdentifier { .. })
        ));
        assert!(matches!(
            parse("not an id at all"),
            Err(Error::MalformedIdentifier { .. })
        ));
    }

    #[test]
    fn test_display_round_trips() {
        let agent = AgentId::new("1234");
        assert_eq!(
            parse(&agent.to_string()).unwrap(),
            ParsedTarget::Agent(agent)
        );

        let meeting = MeetingId::new("42");
        assert_eq!(
            parse(&meeting.to_string()).unwrap(),
            ParsedTarget::Meeting(meeting)
        );

        assert_eq!(
            parse(&ParticipantRef::Human.to_string()).unwrap(),
            ParsedTarget::Human
        );
    }

    #[test]
    fn test_ids_not_interchangeable() {
        // Same underlying string, different kinds.
        let agent = AgentId::new("42");
        let meeting = MeetingId::new("42");
        assert_eq!(agent.as_str(), meeting.as_str());
        assert_ne!(agent.to_string(), meeting.to_string());
    }
}
