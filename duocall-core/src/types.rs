//! Call types and data structures

use crate::identity::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media a call was requested with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio-only call
    Audio,
    /// Audio plus camera video
    Video,
}

impl MediaKind {
    /// Check if this kind sends camera video
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Which side initiated the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We sent the offer
    Outgoing,
    /// We received the offer
    Incoming,
}

/// Call lifecycle state
///
/// Outgoing calls move `Connecting -> Ringing -> Connected`; incoming calls
/// skip `Ringing`. `Ended` and `Rejected` are terminal: no transition leaves
/// them, a new session is required for a new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// Session exists, negotiation not yet completed
    Connecting,
    /// Offer sent, waiting for the remote side to answer
    Ringing,
    /// Media session is established
    Connected,
    /// Call finished (terminal)
    Ended,
    /// Call was rejected by either side (terminal)
    Rejected,
}

impl CallStatus {
    /// Check whether this is a terminal state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected)
    }
}

/// Why a call reached a terminal state
///
/// Remote-signaled outcomes (`RemoteRejected`, `RemoteBusy`) are business
/// outcomes, not errors; each carries a distinct user-visible message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// We hung up
    HungUp,
    /// The remote side hung up
    RemoteHungUp,
    /// The remote side declined the call
    RemoteRejected,
    /// The remote side is in another call
    RemoteBusy,
    /// We declined the call
    RejectedLocally,
    /// Camera or microphone could not be acquired
    MediaUnavailable,
    /// The signaling channel failed
    SignalingFailed,
    /// Offer/answer negotiation failed
    NegotiationFailed,
    /// The established transport failed
    TransportFailed,
}

impl EndReason {
    /// Human-readable message for the presentation layer
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            Self::HungUp => "Call ended",
            Self::RemoteHungUp => "The other participant ended the call",
            Self::RemoteRejected => "Call declined",
            Self::RemoteBusy => "The other participant is busy",
            Self::RejectedLocally => "Call rejected",
            Self::MediaUnavailable => "Camera or microphone unavailable",
            Self::SignalingFailed => "Lost connection to the call service",
            Self::NegotiationFailed => "Could not establish the call",
            Self::TransportFailed => "Connection lost",
        }
    }
}

/// Event emitted for the presentation layer
///
/// The UI only ever observes status transitions; failures never propagate to
/// it as faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// Lifecycle state changed
    StatusChanged {
        /// New status
        status: CallStatus,
        /// Why, when the transition is terminal
        reason: Option<EndReason>,
    },
}

/// Call session configuration
///
/// Environment-specific values are inputs here rather than constants in the
/// controller. STUN-only: there is no TURN/relay fallback, so calls across
/// restrictive NATs may fail to connect. That is a known limitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN resolver URLs used for path discovery
    pub stun_servers: Vec<String>,
    /// Capture device configuration
    pub media: crate::media::MediaConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            media: crate::media::MediaConfig::default(),
        }
    }
}

/// Root entity describing one call
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Call identifier
    pub call_id: CallId,
    /// Local participant
    pub local: ParticipantId,
    /// Remote participant
    pub remote: ParticipantId,
    /// Logical chat/thread the call belongs to
    pub chat_id: String,
    /// Requested media kind
    pub media_kind: MediaKind,
    /// Who initiated
    pub direction: CallDirection,
    /// Current lifecycle state
    pub status: CallStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the media session was established
    pub connected_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Create a new session in `Connecting`
    #[must_use]
    pub fn new(
        local: ParticipantId,
        remote: ParticipantId,
        chat_id: String,
        media_kind: MediaKind,
        direction: CallDirection,
    ) -> Self {
        Self {
            call_id: CallId::new(),
            local,
            remote,
            chat_id,
            media_kind,
            direction,
            status: CallStatus::Connecting,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        }
    }

    /// Time spent connected
    ///
    /// `None` until the call connects; keeps counting while the call is live.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.connected_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - start)
    }
}
