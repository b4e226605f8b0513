//! Call session lifecycle
//!
//! [`CallSessionController`] owns everything one call needs: the peer
//! connection, local media, the signaling channel and the candidate queue.
//! Construction and destruction are tied one-to-one to the session; there is
//! no ambient state shared between calls.
//!
//! The controller serializes all work for its session. Platform callbacks
//! (connection state, local candidate discovery) do not act directly: they
//! forward events into an internal channel consumed by the same task that
//! processes signaling, so every external event has exactly one documented
//! effect on [`CallStatus`].

use crate::candidate_queue::{CandidateQueueStats, IceCandidateQueue};
use crate::identity::ParticipantId;
use crate::media::{MediaController, MediaError};
use crate::signaling::{SignalingChannel, SignalingError, SignalingMessage, SignalingTransport};
use crate::types::{
    CallConfig, CallDirection, CallEvent, CallSession, CallStatus, EndReason, MediaKind,
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// Call session errors
///
/// Every variant is handled at the controller boundary and converted into a
/// terminal [`CallStatus`] plus an [`EndReason`]; nothing propagates to the
/// presentation layer as an unhandled fault.
#[derive(Error, Debug)]
pub enum CallError {
    /// Camera, microphone or screen capture denied or unavailable
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// The signaling channel failed to open or dropped
    #[error("Signaling transport failed: {0}")]
    SignalingTransport(String),

    /// Applying a remote description or producing an offer/answer failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The established connection reached a failed/closed state
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Operation not valid in the current lifecycle state
    #[error("Operation invalid in state {0:?}")]
    InvalidState(CallStatus),

    /// A message of an unexpected type was supplied
    #[error("Unexpected signaling message: expected {0}")]
    UnexpectedMessage(&'static str),
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::SignalingTransport(err.to_string())
    }
}

/// Events forwarded from platform callbacks into the controller task
#[derive(Debug)]
enum EngineEvent {
    /// The peer connection reported a state change
    ConnectionState(RTCPeerConnectionState),
    /// A local network path was discovered
    LocalCandidate(RTCIceCandidateInit),
}

/// Controller for one call session
///
/// Owns the [`CallSession`], the peer connection, local media and the
/// signaling channel for exactly one call. All lifecycle operations and
/// signaling messages are processed through `&mut self`, which serializes
/// negotiation: a second step never starts before the previous asynchronous
/// result has been applied.
pub struct CallSessionController<T: SignalingTransport> {
    session: CallSession,
    config: CallConfig,
    display_name: String,
    signaling: SignalingChannel<T>,
    media: MediaController,
    peer: Option<Arc<RTCPeerConnection>>,
    candidates: IceCandidateQueue,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    status_tx: watch::Sender<CallStatus>,
    event_sender: broadcast::Sender<CallEvent>,
    torn_down: bool,
}

impl<T: SignalingTransport> CallSessionController<T> {
    fn new(
        session: CallSession,
        display_name: String,
        config: CallConfig,
        transport: T,
    ) -> Self {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(session.status);
        let (event_sender, _) = broadcast::channel(100);
        let media = MediaController::new(config.media.clone());
        let signaling = SignalingChannel::new(session.local.clone(), transport);
        Self {
            session,
            config,
            display_name,
            signaling,
            media,
            peer: None,
            candidates: IceCandidateQueue::new(),
            engine_tx,
            engine_rx,
            status_tx,
            event_sender,
            torn_down: false,
        }
    }

    /// Create a controller for a call we are about to place
    #[must_use]
    pub fn outgoing(
        local: ParticipantId,
        remote: ParticipantId,
        chat_id: impl Into<String>,
        media_kind: MediaKind,
        display_name: impl Into<String>,
        config: CallConfig,
        transport: T,
    ) -> Self {
        let session = CallSession::new(
            local,
            remote,
            chat_id.into(),
            media_kind,
            CallDirection::Outgoing,
        );
        Self::new(session, display_name.into(), config, transport)
    }

    /// Create a controller for a call offered to us
    #[must_use]
    pub fn incoming(
        local: ParticipantId,
        remote: ParticipantId,
        chat_id: impl Into<String>,
        media_kind: MediaKind,
        config: CallConfig,
        transport: T,
    ) -> Self {
        let display_name = local.as_str().to_string();
        let session = CallSession::new(
            local,
            remote,
            chat_id.into(),
            media_kind,
            CallDirection::Incoming,
        );
        Self::new(session, display_name, config, transport)
    }

    /// Create an incoming controller directly from a received `call-offer`
    ///
    /// Returns the controller together with the offer description to pass to
    /// [`Self::accept_incoming_call`] once the user accepts.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::UnexpectedMessage`] when the message is not a
    /// `call-offer`.
    pub fn from_offer(
        local: ParticipantId,
        message: SignalingMessage,
        config: CallConfig,
        transport: T,
    ) -> Result<(Self, RTCSessionDescription), CallError> {
        match message {
            SignalingMessage::CallOffer {
                from,
                chat_id,
                call_type,
                offer,
                ..
            } => {
                let controller = Self::incoming(local, from, chat_id, call_type, config, transport);
                Ok((controller, offer))
            }
            _ => Err(CallError::UnexpectedMessage("call-offer")),
        }
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Place the outgoing call
    ///
    /// Acquires local media first (failing here terminates the attempt before
    /// any network action), creates the peer connection, attaches the local
    /// tracks, produces the offer and emits `call-offer`. On success the
    /// session is `Ringing`.
    ///
    /// # Errors
    ///
    /// Any failure terminates the session (`Ended` with a matching reason)
    /// and is returned to the caller.
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id, peer = %self.session.remote))]
    pub async fn start_outgoing_call(&mut self) -> Result<(), CallError> {
        if self.session.direction != CallDirection::Outgoing
            || self.session.status != CallStatus::Connecting
            || self.peer.is_some()
        {
            return Err(CallError::InvalidState(self.session.status));
        }

        tracing::info!(media = %self.session.media_kind, "Starting outgoing call");
        match self.start_outgoing_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "Outgoing call failed to start");
                self.transition(CallStatus::Ended, Some(Self::reason_for(&e)));
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn start_outgoing_inner(&mut self) -> Result<(), CallError> {
        // Local capture must exist before the offer is produced, or the
        // remote end will not receive media on this leg.
        self.media.acquire(self.session.media_kind)?;

        let pc = self.create_peer().await?;
        self.peer = Some(Arc::clone(&pc));
        self.media.attach_to(&pc).await?;
        self.add_receive_transceivers(&pc).await?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::Negotiation(format!("Failed to create offer: {e}")))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| CallError::Negotiation(format!("Failed to set local description: {e}")))?;

        self.transition(CallStatus::Ringing, None);
        self.signaling
            .send(SignalingMessage::CallOffer {
                from: self.session.local.clone(),
                to: self.session.remote.clone(),
                chat_id: self.session.chat_id.clone(),
                call_type: self.session.media_kind,
                user_name: self.display_name.clone(),
                offer,
            })
            .await?;
        Ok(())
    }

    /// Accept an incoming call with the offer it carried
    ///
    /// Acquires local media, creates the peer connection, applies the offer,
    /// drains the candidate queue, answers, and emits `call-answer`. On
    /// success the session is `Connected`.
    ///
    /// # Errors
    ///
    /// Any failure recovers by rejecting the call, so the caller is informed
    /// via `call-rejected` rather than left with a half-open session.
    #[tracing::instrument(skip(self, offer), fields(call_id = %self.session.call_id, peer = %self.session.remote))]
    pub async fn accept_incoming_call(
        &mut self,
        offer: RTCSessionDescription,
    ) -> Result<(), CallError> {
        if self.session.direction != CallDirection::Incoming
            || self.session.status != CallStatus::Connecting
            || self.peer.is_some()
        {
            return Err(CallError::InvalidState(self.session.status));
        }

        tracing::info!(media = %self.session.media_kind, "Accepting incoming call");
        match self.accept_inner(offer).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "Accept failed, rejecting call");
                self.reject_with(Self::reason_for(&e)).await;
                Err(e)
            }
        }
    }

    async fn accept_inner(&mut self, offer: RTCSessionDescription) -> Result<(), CallError> {
        self.media.acquire(self.session.media_kind)?;

        let pc = self.create_peer().await?;
        self.peer = Some(Arc::clone(&pc));
        self.media.attach_to(&pc).await?;
        self.add_receive_transceivers(&pc).await?;

        self.apply_remote_description(&pc, offer).await?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::Negotiation(format!("Failed to create answer: {e}")))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::Negotiation(format!("Failed to set local description: {e}")))?;

        self.signaling
            .send(SignalingMessage::CallAnswer {
                from: self.session.local.clone(),
                to: self.session.remote.clone(),
                answer,
            })
            .await?;
        self.mark_connected();
        Ok(())
    }

    /// Decline the call
    ///
    /// Emits `call-rejected`, releases all resources and transitions to
    /// `Rejected`. A no-op on a terminated session.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible for interface symmetry.
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    pub async fn reject_call(&mut self) -> Result<(), CallError> {
        if self.session.status.is_terminal() {
            return Ok(());
        }
        self.reject_with(EndReason::RejectedLocally).await;
        Ok(())
    }

    async fn reject_with(&mut self, reason: EndReason) {
        if self.session.status.is_terminal() {
            return;
        }
        if let Err(e) = self
            .signaling
            .send(SignalingMessage::CallRejected {
                from: self.session.local.clone(),
                to: self.session.remote.clone(),
            })
            .await
        {
            tracing::warn!(error = %e, "Failed to send call-rejected");
        }
        self.teardown().await;
        self.transition(CallStatus::Rejected, Some(reason));
    }

    /// Hang up
    ///
    /// Transitions to `Ended` eagerly so the UI reflects termination
    /// immediately, emits `call-ended` fire-and-forget (teardown is not
    /// gated on the remote acknowledging it), then releases all resources.
    /// Idempotent: a second call does nothing and emits no second message.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible for interface symmetry.
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        if self.session.status.is_terminal() {
            tracing::debug!("end_call on a terminated session is a no-op");
            return Ok(());
        }
        self.end_with(EndReason::HungUp, true).await;
        Ok(())
    }

    async fn end_with(&mut self, reason: EndReason, notify_remote: bool) {
        self.transition(CallStatus::Ended, Some(reason));
        if notify_remote && !self.signaling.is_closed() {
            if let Err(e) = self
                .signaling
                .send(SignalingMessage::CallEnded {
                    from: self.session.local.clone(),
                    to: self.session.remote.clone(),
                })
                .await
            {
                tracing::warn!(error = %e, "Failed to send call-ended");
            }
        }
        self.teardown().await;
    }

    // =========================================================================
    // Inbound events
    // =========================================================================

    /// Process one inbound signaling message
    ///
    /// Messages for a terminated session are ignored; the channel is
    /// best-effort and duplicates must not corrupt state.
    ///
    /// # Errors
    ///
    /// Returns error when a fatal negotiation step fails; the session has
    /// already been moved to a terminal state by then.
    #[tracing::instrument(skip(self, message), fields(call_id = %self.session.call_id))]
    pub async fn handle_signaling(&mut self, message: SignalingMessage) -> Result<(), CallError> {
        if self.session.status.is_terminal() {
            tracing::debug!("Ignoring signaling message for terminated session");
            return Ok(());
        }
        match message {
            SignalingMessage::CallOffer { offer, .. } => self.handle_remote_offer(offer).await,
            SignalingMessage::CallAnswer { answer, .. } => self.handle_remote_answer(answer).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.handle_remote_candidate(candidate).await
            }
            SignalingMessage::CallRejected { .. } => {
                tracing::info!("Remote side declined the call");
                self.teardown().await;
                self.transition(CallStatus::Rejected, Some(EndReason::RemoteRejected));
                Ok(())
            }
            SignalingMessage::CallEnded { .. } => {
                tracing::info!("Remote side ended the call");
                self.transition(CallStatus::Ended, Some(EndReason::RemoteHungUp));
                self.teardown().await;
                Ok(())
            }
            SignalingMessage::CallBusy => {
                tracing::info!("Remote side is busy");
                self.transition(CallStatus::Ended, Some(EndReason::RemoteBusy));
                self.teardown().await;
                Ok(())
            }
        }
    }

    async fn handle_remote_offer(&mut self, offer: RTCSessionDescription) -> Result<(), CallError> {
        let Some(pc) = self.peer.clone() else {
            // Incoming sessions receive their offer through accept; anything
            // arriving here before then is a relay duplicate.
            tracing::warn!("Offer received before session start, ignoring");
            return Ok(());
        };
        if !self.candidates.has_remote_description() {
            // Glare: both sides offered at once. No polite/impolite
            // convention here; the session that reached Connecting first is
            // authoritative and the competing offer is informational only.
            tracing::warn!("Competing offer while awaiting answer ignored (glare)");
            return Ok(());
        }
        if self.session.direction != CallDirection::Outgoing {
            tracing::debug!("Duplicate offer on incoming session ignored");
            return Ok(());
        }

        // Late offer on an active outgoing-initiated session: apply it as a
        // description update and answer in kind.
        if let Err(e) = self.answer_remote_offer(&pc, offer).await {
            tracing::error!(error = %e, "Failed to answer late offer");
            self.transition(CallStatus::Ended, Some(Self::reason_for(&e)));
            self.teardown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn answer_remote_offer(
        &mut self,
        pc: &Arc<RTCPeerConnection>,
        offer: RTCSessionDescription,
    ) -> Result<(), CallError> {
        self.apply_remote_description(pc, offer).await?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::Negotiation(format!("Failed to create answer: {e}")))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::Negotiation(format!("Failed to set local description: {e}")))?;

        self.signaling
            .send(SignalingMessage::CallAnswer {
                from: self.session.local.clone(),
                to: self.session.remote.clone(),
                answer,
            })
            .await?;
        self.mark_connected();
        Ok(())
    }

    async fn handle_remote_answer(
        &mut self,
        answer: RTCSessionDescription,
    ) -> Result<(), CallError> {
        let Some(pc) = self.peer.clone() else {
            tracing::warn!("Answer received before session start, ignoring");
            return Ok(());
        };
        if self.candidates.has_remote_description() {
            tracing::debug!("Duplicate answer ignored");
            return Ok(());
        }

        if let Err(e) = self.apply_remote_description(&pc, answer).await {
            tracing::error!(error = %e, "Failed to apply answer");
            self.transition(CallStatus::Ended, Some(Self::reason_for(&e)));
            self.teardown().await;
            return Err(e);
        }
        self.mark_connected();
        Ok(())
    }

    async fn handle_remote_candidate(
        &mut self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), CallError> {
        if let Some(candidate) = self.candidates.offer(candidate) {
            if let Some(pc) = &self.peer {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    // Best-effort channel: a malformed candidate is tolerated,
                    // not fatal.
                    tracing::warn!(error = %e, "Failed to apply ICE candidate");
                }
            }
        }
        Ok(())
    }

    /// React to a connection state report from the transport
    ///
    /// `Failed` and `Closed` are terminal and handled like a local hangup
    /// (fail-fast, no retry). `Disconnected` is a transient blip: logged,
    /// session kept.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible for interface symmetry.
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    pub async fn handle_connection_state(
        &mut self,
        state: RTCPeerConnectionState,
    ) -> Result<(), CallError> {
        if self.session.status.is_terminal() {
            return Ok(());
        }
        match state {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                tracing::warn!(state = ?state, "Transport reached a terminal state, ending call");
                self.end_with(EndReason::TransportFailed, true).await;
            }
            RTCPeerConnectionState::Disconnected => {
                tracing::warn!("Transport disconnected (transient), keeping session");
            }
            other => {
                tracing::debug!(state = ?other, "Connection state changed");
            }
        }
        Ok(())
    }

    /// Drive the session until it reaches a terminal state
    ///
    /// Single loop consuming inbound signaling and engine events; this is
    /// what serializes all mutation for the session. A failed signaling
    /// channel terminates the call (`SignalingFailed`), no reconnect is
    /// attempted within a call.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible for interface symmetry.
    pub async fn run(&mut self) -> Result<(), CallError> {
        enum Next {
            Signal(Result<SignalingMessage, SignalingError>),
            Engine(EngineEvent),
        }

        while !self.session.status.is_terminal() {
            let next = tokio::select! {
                message = self.signaling.recv() => Next::Signal(message),
                event = self.engine_rx.recv() => match event {
                    Some(event) => Next::Engine(event),
                    None => continue,
                },
            };
            match next {
                Next::Signal(Ok(message)) => {
                    if let Err(e) = self.handle_signaling(message).await {
                        tracing::warn!(error = %e, "Signaling message handling failed");
                    }
                }
                Next::Signal(Err(e)) => {
                    if self.session.status.is_terminal() {
                        break;
                    }
                    tracing::error!(error = %e, "Signaling channel failed, ending call");
                    self.end_with(EndReason::SignalingFailed, false).await;
                }
                Next::Engine(event) => {
                    if let Err(e) = self.handle_engine_event(event).await {
                        tracing::warn!(error = %e, "Engine event handling failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) -> Result<(), CallError> {
        match event {
            EngineEvent::ConnectionState(state) => self.handle_connection_state(state).await,
            EngineEvent::LocalCandidate(candidate) => {
                if self.session.status.is_terminal() || self.signaling.is_closed() {
                    return Ok(());
                }
                if let Err(e) = self
                    .signaling
                    .send(SignalingMessage::IceCandidate {
                        from: self.session.local.clone(),
                        to: self.session.remote.clone(),
                        candidate,
                    })
                    .await
                {
                    tracing::warn!(error = %e, "Failed to send ICE candidate");
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // Track operations
    //
    // These never change CallStatus and never re-enter offer/answer; they are
    // transport-track operations delegated to the media controller.
    // =========================================================================

    /// Toggle the microphone, returning the new enabled state
    ///
    /// # Errors
    ///
    /// Returns error on a terminated session or when no audio track exists
    pub async fn toggle_audio(&mut self) -> Result<bool, CallError> {
        self.ensure_live()?;
        Ok(self.media.toggle_audio()?)
    }

    /// Toggle the camera, returning the new enabled state
    ///
    /// Turning video on during an audio-only call acquires a camera and adds
    /// the track to the live peer connection.
    ///
    /// # Errors
    ///
    /// Returns error on a terminated session or when the camera is unavailable
    pub async fn toggle_video(&mut self) -> Result<bool, CallError> {
        self.ensure_live()?;
        let pc = self
            .peer
            .clone()
            .ok_or(CallError::InvalidState(self.session.status))?;
        Ok(self.media.toggle_video(&pc).await?)
    }

    /// Toggle screen sharing, returning whether it is now active
    ///
    /// # Errors
    ///
    /// Returns error on a terminated session, when screen capture is
    /// unavailable, or when there is no outgoing video sender to substitute
    pub async fn toggle_screen_share(&mut self) -> Result<bool, CallError> {
        self.ensure_live()?;
        if self.media.state().screen_sharing {
            self.media.stop_screen_share().await?;
            Ok(false)
        } else {
            self.media.start_screen_share().await?;
            Ok(true)
        }
    }

    /// Toggle local muting of remote playback, returning the new muted state
    pub fn toggle_speaker(&mut self) -> bool {
        self.media.toggle_speaker()
    }

    /// Platform hook: the OS-level "stop sharing" control ended the capture
    ///
    /// # Errors
    ///
    /// Returns error if restoring the camera track fails
    pub async fn screen_capture_ended(&mut self) -> Result<(), CallError> {
        Ok(self.media.screen_capture_ended().await?)
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Current lifecycle state
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.session.status
    }

    /// The session entity
    #[must_use]
    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Watch lifecycle state changes
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status_tx.subscribe()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Time spent connected so far
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.session.duration()
    }

    /// The local media controller, for state reads
    #[must_use]
    pub fn media(&self) -> &MediaController {
        &self.media
    }

    /// Handle to the live peer connection, if any
    #[must_use]
    pub fn peer(&self) -> Option<Arc<RTCPeerConnection>> {
        self.peer.clone()
    }

    /// Number of remote candidates still buffered
    #[must_use]
    pub fn pending_remote_candidates(&self) -> usize {
        self.candidates.pending()
    }

    /// Candidate queue counters
    #[must_use]
    pub fn candidate_stats(&self) -> CandidateQueueStats {
        self.candidates.stats()
    }

    /// Whether the signaling channel has been closed
    #[must_use]
    pub fn is_signaling_closed(&self) -> bool {
        self.signaling.is_closed()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn create_peer(&mut self) -> Result<Arc<RTCPeerConnection>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::Negotiation(format!("Failed to register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| CallError::Negotiation(format!("Failed to build interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.config.stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.config.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            CallError::Negotiation(format!("Failed to create peer connection: {e}"))
        })?);
        self.wire_callbacks(&pc);
        tracing::debug!(call_id = %self.session.call_id, "Peer connection created");
        Ok(pc)
    }

    fn wire_callbacks(&self, pc: &Arc<RTCPeerConnection>) {
        let tx = self.engine_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EngineEvent::ConnectionState(state));
            })
        }));

        let tx = self.engine_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(EngineEvent::LocalCandidate(init));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to serialize local ICE candidate");
                        }
                    }
                }
            })
        }));
    }

    async fn add_receive_transceivers(
        &self,
        pc: &Arc<RTCPeerConnection>,
    ) -> Result<(), CallError> {
        // Receive capability for both kinds is always requested so the far
        // end may send video back even on an audio-only call.
        if !self.session.media_kind.has_video() {
            pc.add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                CallError::Negotiation(format!("Failed to add receive transceiver: {e}"))
            })?;
        }
        Ok(())
    }

    async fn apply_remote_description(
        &mut self,
        pc: &Arc<RTCPeerConnection>,
        description: RTCSessionDescription,
    ) -> Result<(), CallError> {
        pc.set_remote_description(description)
            .await
            .map_err(|e| CallError::Negotiation(format!("Failed to set remote description: {e}")))?;

        // The queue must be empty before any answer goes out, so none of the
        // remote side's discovered paths are silently dropped.
        for candidate in self.candidates.mark_remote_description() {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to apply buffered ICE candidate");
            }
        }
        Ok(())
    }

    fn mark_connected(&mut self) {
        if self.session.connected_at.is_none() {
            self.session.connected_at = Some(Utc::now());
        }
        self.transition(CallStatus::Connected, None);
    }

    fn transition(&mut self, status: CallStatus, reason: Option<EndReason>) {
        if self.session.status == status {
            return;
        }
        let old_status = self.session.status;
        self.session.status = status;
        tracing::debug!(
            call_id = %self.session.call_id,
            old_state = ?old_status,
            new_state = ?status,
            reason = ?reason,
            "Call state transition"
        );
        let _ = self.status_tx.send(status);
        let _ = self
            .event_sender
            .send(CallEvent::StatusChanged { status, reason });
    }

    /// Scoped teardown invoked from every exit path
    ///
    /// Stops local tracks, closes the peer connection, closes the signaling
    /// channel and freezes the duration clock. Idempotent, so no path can
    /// leak an open track or socket.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        tracing::debug!(call_id = %self.session.call_id, "Tearing down call resources");

        self.media.stop_all();
        if let Some(pc) = &self.peer {
            if let Err(e) = pc.close().await {
                tracing::warn!(error = %e, "Failed to close peer connection");
            }
        }
        if !self.signaling.is_closed() {
            if let Err(e) = self.signaling.close().await {
                tracing::warn!(error = %e, "Failed to close signaling channel");
            }
        }
        if self.session.ended_at.is_none() {
            self.session.ended_at = Some(Utc::now());
        }
        tracing::info!(
            call_id = %self.session.call_id,
            duration = ?self.session.duration(),
            "Call resources released"
        );
    }

    fn ensure_live(&self) -> Result<(), CallError> {
        if self.session.status.is_terminal() {
            Err(CallError::InvalidState(self.session.status))
        } else {
            Ok(())
        }
    }

    fn reason_for(error: &CallError) -> EndReason {
        match error {
            CallError::MediaAcquisition(_) => EndReason::MediaUnavailable,
            CallError::SignalingTransport(_) => EndReason::SignalingFailed,
            CallError::TransportFailure(_) => EndReason::TransportFailed,
            _ => EndReason::NegotiationFailed,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::MediaConfig;
    use crate::signaling::memory_pair;

    fn offline_config() -> CallConfig {
        CallConfig {
            stun_servers: vec![],
            media: MediaConfig::default(),
        }
    }

    fn outgoing_controller() -> CallSessionController<crate::signaling::MemorySignalingTransport> {
        let (transport, _remote) = memory_pair();
        CallSessionController::outgoing(
            ParticipantId::new("alice"),
            ParticipantId::new("bob"),
            "chat-1",
            MediaKind::Audio,
            "Alice",
            offline_config(),
            transport,
        )
    }

    #[test]
    fn test_new_session_is_connecting() {
        let controller = outgoing_controller();
        assert_eq!(controller.status(), CallStatus::Connecting);
        assert_eq!(controller.session().direction, CallDirection::Outgoing);
        assert!(controller.peer().is_none());
    }

    #[tokio::test]
    async fn test_accept_on_outgoing_session_is_invalid() {
        let mut controller = outgoing_controller();
        let offer: RTCSessionDescription = serde_json::from_value(serde_json::json!({
            "type": "offer",
            "sdp": "v=0\r\n",
        }))
        .unwrap();
        let result = controller.accept_incoming_call(offer).await;
        assert!(matches!(result, Err(CallError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_start_on_incoming_session_is_invalid() {
        let (transport, _remote) = memory_pair();
        let mut controller = CallSessionController::incoming(
            ParticipantId::new("bob"),
            ParticipantId::new("alice"),
            "chat-1",
            MediaKind::Audio,
            offline_config(),
            transport,
        );
        let result = controller.start_outgoing_call().await;
        assert!(matches!(result, Err(CallError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_start_without_microphone_fails_before_network() {
        let (transport, remote) = memory_pair();
        let mut controller = CallSessionController::outgoing(
            ParticipantId::new("alice"),
            ParticipantId::new("bob"),
            "chat-1",
            MediaKind::Audio,
            "Alice",
            CallConfig {
                stun_servers: vec![],
                media: MediaConfig {
                    audio_device: None,
                    ..MediaConfig::default()
                },
            },
            transport,
        );

        let result = controller.start_outgoing_call().await;
        assert!(matches!(result, Err(CallError::MediaAcquisition(_))));
        assert_eq!(controller.status(), CallStatus::Ended);

        // No network action was taken: the remote end sees only the channel
        // closing, never an offer.
        assert!(matches!(
            remote.recv().await,
            Err(crate::signaling::SignalingError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_from_offer_rejects_other_messages() {
        let (transport, _remote) = memory_pair();
        let result = CallSessionController::from_offer(
            ParticipantId::new("bob"),
            SignalingMessage::CallBusy,
            offline_config(),
            transport,
        );
        assert!(matches!(result, Err(CallError::UnexpectedMessage(_))));
    }

    #[tokio::test]
    async fn test_track_ops_rejected_after_termination() {
        let mut controller = outgoing_controller();
        controller.end_call().await.unwrap();

        assert!(matches!(
            controller.toggle_audio().await,
            Err(CallError::InvalidState(CallStatus::Ended))
        ));
        assert!(matches!(
            controller.toggle_screen_share().await,
            Err(CallError::InvalidState(CallStatus::Ended))
        ));
    }
}
