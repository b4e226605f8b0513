//! Duocall - two-party call session engine
//!
//! A controller that negotiates a peer-to-peer audio/video session over an
//! unreliable, asynchronous signaling channel, manages a queue of
//! out-of-order ICE candidates, and mutates live media tracks (mute, camera
//! toggle, screen-share substitution) without renegotiating the session.
//!
//! - **One controller per call**: peer connection, media and signaling are
//!   owned by a single [`CallSessionController`], created and destroyed with
//!   the session
//! - **Serialized negotiation**: signaling, candidates and state reports are
//!   processed by one task, one step at a time
//! - **Track operations without renegotiation**: mute, camera toggle and
//!   screen-share substitution act on live senders only
//! - **STUN-only path discovery**: no TURN/relay fallback
//!
//! # Examples
//!
//! ```rust,no_run
//! use duocall_core::{CallConfig, CallSessionController, MediaKind, ParticipantId};
//! use duocall_core::signaling::memory_pair;
//!
//! # async fn example() -> Result<(), duocall_core::CallError> {
//! let (transport, _remote) = memory_pair();
//!
//! let mut call = CallSessionController::outgoing(
//!     ParticipantId::new("alice"),
//!     ParticipantId::new("bob"),
//!     "chat-7",
//!     MediaKind::Video,
//!     "Alice",
//!     CallConfig::default(),
//!     transport,
//! );
//!
//! call.start_outgoing_call().await?;
//! call.run().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Call session lifecycle and state machine
pub mod session;

/// Local media capture and live track control
pub mod media;

/// Signaling protocol and transports
pub mod signaling;

/// ICE candidate buffering
pub mod candidate_queue;

/// Participant identity
pub mod identity;

// Re-export main types at crate root
pub use candidate_queue::{CandidateQueueStats, IceCandidateQueue};
pub use identity::ParticipantId;
pub use media::{LocalMediaState, MediaConfig, MediaController, MediaError, MediaEvent, VideoSource};
pub use session::{CallError, CallSessionController};
pub use signaling::{
    memory_pair, MemorySignalingTransport, SignalingChannel, SignalingError, SignalingMessage,
    SignalingTransport,
};
pub use types::{
    CallConfig, CallDirection, CallEvent, CallId, CallSession, CallStatus, EndReason, MediaKind,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::candidate_queue::IceCandidateQueue;
    pub use crate::identity::ParticipantId;
    pub use crate::media::{MediaConfig, MediaController, MediaEvent};
    pub use crate::session::{CallError, CallSessionController};
    pub use crate::signaling::{
        memory_pair, SignalingChannel, SignalingMessage, SignalingTransport,
    };
    pub use crate::types::{
        CallConfig, CallDirection, CallEvent, CallId, CallStatus, EndReason, MediaKind,
    };
}
