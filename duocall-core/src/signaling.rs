//! Call signaling protocol
//!
//! Typed messages exchanged through a persistent, per-user relay channel.
//! Delivery is best-effort: there is no acknowledgement or retry envelope,
//! and the session controller must tolerate missing or duplicate messages.

use crate::identity::ParticipantId;
use crate::types::MediaKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Channel is closed
    #[error("signaling channel closed")]
    Closed,

    /// Transport failure
    #[error("signaling transport error: {0}")]
    Transport(String),

    /// Wire encoding failure
    #[error("signaling encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Wire messages for one logical call
///
/// JSON with an external `type` tag; session descriptions and candidates are
/// embedded in their standard serialized forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Offer a new call
    CallOffer {
        /// Caller id
        from: ParticipantId,
        /// Callee id
        to: ParticipantId,
        /// Chat/thread the call belongs to
        chat_id: String,
        /// Requested media kind
        call_type: MediaKind,
        /// Caller display name, shown by the callee UI
        user_name: String,
        /// Session description offer
        offer: RTCSessionDescription,
    },

    /// Answer an offered call
    CallAnswer {
        /// Answerer id
        from: ParticipantId,
        /// Caller id
        to: ParticipantId,
        /// Session description answer
        answer: RTCSessionDescription,
    },

    /// A discovered network path
    IceCandidate {
        /// Sender id
        from: ParticipantId,
        /// Recipient id
        to: ParticipantId,
        /// The candidate
        candidate: RTCIceCandidateInit,
    },

    /// Call was declined
    CallRejected {
        /// Sender id
        from: ParticipantId,
        /// Recipient id
        to: ParticipantId,
    },

    /// Call was hung up
    CallEnded {
        /// Sender id
        from: ParticipantId,
        /// Recipient id
        to: ParticipantId,
    },

    /// Callee is already in a call
    CallBusy,
}

/// Helper to extract message type for tracing
fn message_type(msg: &SignalingMessage) -> &'static str {
    match msg {
        SignalingMessage::CallOffer { .. } => "CallOffer",
        SignalingMessage::CallAnswer { .. } => "CallAnswer",
        SignalingMessage::IceCandidate { .. } => "IceCandidate",
        SignalingMessage::CallRejected { .. } => "CallRejected",
        SignalingMessage::CallEnded { .. } => "CallEnded",
        SignalingMessage::CallBusy => "CallBusy",
    }
}

/// Signaling transport trait
///
/// Implement this for the actual relay connection (websocket, in-memory pair
/// for tests, etc.). The channel is keyed by the local participant identity;
/// one transport instance carries the traffic of one logical call.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a message to the remote participant
    async fn send(&self, message: SignalingMessage) -> Result<(), Self::Error>;

    /// Receive the next message
    async fn recv(&self) -> Result<SignalingMessage, Self::Error>;

    /// Close the channel; further sends and receives fail
    async fn close(&self) -> Result<(), Self::Error>;

    /// Whether the channel has been closed
    fn is_closed(&self) -> bool;
}

/// Base delay applied per consecutive receive error
const RECEIVE_BACKOFF_STEP: Duration = Duration::from_millis(100);
/// Cap on the error count feeding the backoff
const RECEIVE_BACKOFF_CAP: u32 = 10;

/// Signaling channel for one call
///
/// Wraps a transport with structured logging and receive backoff. Owned by a
/// single session controller for the lifetime of one call.
pub struct SignalingChannel<T: SignalingTransport> {
    local: ParticipantId,
    transport: T,
    error_count: tokio::sync::Mutex<u32>,
}

impl<T: SignalingTransport> SignalingChannel<T> {
    /// Create a new channel keyed by the local participant
    #[must_use]
    pub fn new(local: ParticipantId, transport: T) -> Self {
        Self {
            local,
            transport,
            error_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Local participant this channel is keyed by
    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the message
    #[tracing::instrument(skip(self, message), fields(local = %self.local, message_type = message_type(&message)))]
    pub async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        self.transport
            .send(message)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }

    /// Receive the next signaling message, backing off on repeated errors
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn recv(&self) -> Result<SignalingMessage, SignalingError> {
        match self.transport.recv().await {
            Ok(message) => {
                let mut error_count = self.error_count.lock().await;
                *error_count = 0;
                drop(error_count);

                tracing::debug!(
                    message_type = message_type(&message),
                    "Received signaling message"
                );
                Ok(message)
            }
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff = RECEIVE_BACKOFF_STEP * count.min(RECEIVE_BACKOFF_CAP);
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff.as_millis() as u64,
                    "Error receiving signaling message, backing off"
                );
                sleep(backoff).await;

                Err(SignalingError::Transport(e.to_string()))
            }
        }
    }

    /// Tell a caller we are already in another call
    ///
    /// Sent by the embedding application when an offer arrives while a
    /// session is active; the busy message carries no addressing fields, the
    /// relay pairing identifies the recipient.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the message
    pub async fn send_busy(&self) -> Result<(), SignalingError> {
        self.send(SignalingMessage::CallBusy).await
    }

    /// Close the underlying transport
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to close
    pub async fn close(&self) -> Result<(), SignalingError> {
        self.transport
            .close()
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }

    /// Whether the underlying transport has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

/// In-memory signaling transport
///
/// One half of a paired channel; messages sent on one half arrive on the
/// other. Messages cross the pair in their JSON wire form, so the full
/// serialization path is exercised. Used by tests and the loopback demo.
pub struct MemorySignalingTransport {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    closed: AtomicBool,
}

/// Create a connected pair of in-memory transports
#[must_use]
pub fn memory_pair() -> (MemorySignalingTransport, MemorySignalingTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemorySignalingTransport {
            tx: std::sync::Mutex::new(Some(a_tx)),
            rx: tokio::sync::Mutex::new(a_rx),
            closed: AtomicBool::new(false),
        },
        MemorySignalingTransport {
            tx: std::sync::Mutex::new(Some(b_tx)),
            rx: tokio::sync::Mutex::new(b_rx),
            closed: AtomicBool::new(false),
        },
    )
}

#[async_trait]
impl SignalingTransport for MemorySignalingTransport {
    type Error = SignalingError;

    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let wire = serde_json::to_string(&message)?;
        let tx = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx.send(wire).map_err(|_| SignalingError::Closed),
            None => Err(SignalingError::Closed),
        }
    }

    async fn recv(&self) -> Result<SignalingMessage, SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let wire = {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(SignalingError::Closed)?
        };
        Ok(serde_json::from_str(&wire)?)
    }

    async fn close(&self) -> Result<(), SignalingError> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender wakes the peer's pending receive.
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
