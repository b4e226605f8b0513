//! Local media capture and live track control
//!
//! Owns the microphone/camera/screen capture tracks for one call and mutates
//! them in place. Mute, camera toggle and screen-share substitution are
//! transport-track operations: they never re-enter offer/answer negotiation
//! and never change the call lifecycle state.
//!
//! Muting disables the track at the sample-feed level rather than removing
//! it, so the remote side sees silence instead of a torn-down leg. Screen
//! share swaps the source feeding the already-negotiated outgoing video
//! sender via track replacement.

use crate::types::MediaKind;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Screen capture unavailable
    #[error("Screen capture unavailable")]
    ScreenCaptureUnavailable,

    /// No outgoing video sender to substitute
    #[error("No outgoing video to replace")]
    NoOutgoingVideo,

    /// Track error
    #[error("Track error: {0}")]
    TrackError(String),
}

/// Source currently feeding the outgoing video leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoSource {
    /// Camera capture
    Camera,
    /// Screen capture
    Screen,
}

/// Media events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Capture track created
    TrackAcquired {
        /// Media kind of the track
        kind: MediaKind,
    },
    /// Enabled flag flipped on a live track
    TrackToggled {
        /// Media kind of the track
        kind: MediaKind,
        /// New enabled state
        enabled: bool,
    },
    /// Outgoing video switched to screen capture
    ScreenShareStarted,
    /// Outgoing video switched back off screen capture
    ScreenShareStopped,
    /// All capture released
    Released,
}

/// Capture device configuration
///
/// Device identifiers are environment inputs; `None` models a denied or
/// missing device so acquisition failures can be exercised without hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Microphone device id, `None` when unavailable
    pub audio_device: Option<String>,
    /// Camera device id, `None` when unavailable
    pub video_device: Option<String>,
    /// Whether screen capture is available
    pub screen_capture: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio_device: Some("default-microphone".to_string()),
            video_device: Some("default-camera".to_string()),
            screen_capture: true,
        }
    }
}

/// Snapshot of the local media state for the presentation layer and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMediaState {
    /// Audio enabled flag, `None` when no audio track exists
    pub audio_enabled: Option<bool>,
    /// Video enabled flag, `None` when no video track exists
    pub video_enabled: Option<bool>,
    /// Source feeding the outgoing video leg
    pub video_source: Option<VideoSource>,
    /// Whether screen capture is live
    pub screen_sharing: bool,
    /// Whether remote playback is muted locally
    pub speaker_muted: bool,
    /// Whether all capture has been released
    pub released: bool,
}

/// A live capture track with its enabled flag
struct CaptureTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl CaptureTrack {
    fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Local media controller for one call
///
/// Exclusively owned by one session controller; created with the session and
/// released by the session teardown routine.
pub struct MediaController {
    config: MediaConfig,
    audio: Option<CaptureTrack>,
    camera: Option<CaptureTrack>,
    screen: Option<CaptureTrack>,
    audio_sender: Option<Arc<RTCRtpSender>>,
    video_sender: Option<Arc<RTCRtpSender>>,
    speaker_muted: bool,
    released: bool,
    preview_tx: watch::Sender<Option<VideoSource>>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaController {
    /// Create a controller for the given device configuration
    #[must_use]
    pub fn new(config: MediaConfig) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        let (preview_tx, _) = watch::channel(None);
        Self {
            config,
            audio: None,
            camera: None,
            screen: None,
            audio_sender: None,
            video_sender: None,
            speaker_muted: false,
            released: false,
            preview_tx,
            event_sender,
        }
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }

    /// Watch the local preview source
    ///
    /// The preview sink is distinct from the outgoing track: during screen
    /// share it mirrors the screen capture while the camera track is idle.
    #[must_use]
    pub fn preview(&self) -> watch::Receiver<Option<VideoSource>> {
        self.preview_tx.subscribe()
    }

    /// Acquire capture for the requested media kind
    ///
    /// Always acquires the microphone; acquires the camera as well for video
    /// calls. Must be called before the peer connection is created, so tracks
    /// exist before the first offer or answer is produced.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::DeviceNotFound`] when a required device is
    /// unavailable or permission was denied.
    pub fn acquire(&mut self, kind: MediaKind) -> Result<(), MediaError> {
        let mic = self
            .config
            .audio_device
            .as_ref()
            .ok_or_else(|| MediaError::DeviceNotFound("microphone".to_string()))?;
        tracing::info!(device = %mic, "Acquiring audio capture");
        self.audio = Some(CaptureTrack::new(Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio-0".to_string(),
            "duocall-local".to_string(),
        ))));
        let _ = self.event_sender.send(MediaEvent::TrackAcquired {
            kind: MediaKind::Audio,
        });

        if kind.has_video() {
            self.acquire_camera()?;
        }
        Ok(())
    }

    fn acquire_camera(&mut self) -> Result<(), MediaError> {
        let camera = self
            .config
            .video_device
            .as_ref()
            .ok_or_else(|| MediaError::DeviceNotFound("camera".to_string()))?;
        tracing::info!(device = %camera, "Acquiring camera capture");
        self.camera = Some(CaptureTrack::new(Arc::new(TrackLocalStaticSample::new(
            vp8_capability(),
            "video-0".to_string(),
            "duocall-local".to_string(),
        ))));
        let _ = self.preview_tx.send(Some(VideoSource::Camera));
        let _ = self.event_sender.send(MediaEvent::TrackAcquired {
            kind: MediaKind::Video,
        });
        Ok(())
    }

    /// Attach acquired tracks to the peer connection
    ///
    /// # Errors
    ///
    /// Returns error if a track cannot be added
    pub async fn attach_to(&mut self, pc: &Arc<RTCPeerConnection>) -> Result<(), MediaError> {
        if let Some(audio) = &self.audio {
            let track: Arc<dyn TrackLocal + Send + Sync> = audio.track.clone();
            let sender = pc
                .add_track(track)
                .await
                .map_err(|e| MediaError::TrackError(format!("Failed to add audio track: {e}")))?;
            self.audio_sender = Some(sender);
        }
        if let Some(camera) = &self.camera {
            let track: Arc<dyn TrackLocal + Send + Sync> = camera.track.clone();
            let sender = pc
                .add_track(track)
                .await
                .map_err(|e| MediaError::TrackError(format!("Failed to add video track: {e}")))?;
            self.video_sender = Some(sender);
        }
        Ok(())
    }

    /// Toggle the microphone, returning the new enabled state
    ///
    /// Flips the enabled flag on the live track; the sample feed observes the
    /// flag, so the remote side receives silence rather than a removed track.
    ///
    /// # Errors
    ///
    /// Returns error if no audio track exists
    pub fn toggle_audio(&mut self) -> Result<bool, MediaError> {
        let audio = self
            .audio
            .as_ref()
            .ok_or_else(|| MediaError::DeviceNotFound("microphone".to_string()))?;
        let enabled = !audio.is_enabled();
        audio.set_enabled(enabled);
        tracing::info!(enabled, "Audio toggled");
        let _ = self.event_sender.send(MediaEvent::TrackToggled {
            kind: MediaKind::Audio,
            enabled,
        });
        Ok(enabled)
    }

    /// Toggle the camera, returning the new enabled state
    ///
    /// When the call started audio-only and video is being turned on, a
    /// camera track is acquired and attached as a new outgoing track.
    ///
    /// # Errors
    ///
    /// Returns error if the camera is unavailable or the track cannot be added
    pub async fn toggle_video(&mut self, pc: &Arc<RTCPeerConnection>) -> Result<bool, MediaError> {
        if let Some(camera) = &self.camera {
            let enabled = !camera.is_enabled();
            camera.set_enabled(enabled);
            tracing::info!(enabled, "Video toggled");
            if self.screen.is_none() {
                let _ = self
                    .preview_tx
                    .send(enabled.then_some(VideoSource::Camera));
            }
            let _ = self.event_sender.send(MediaEvent::TrackToggled {
                kind: MediaKind::Video,
                enabled,
            });
            return Ok(enabled);
        }

        // Call started audio-only: acquire a camera and add the track live.
        self.acquire_camera()?;
        let camera = self
            .camera
            .as_ref()
            .ok_or_else(|| MediaError::DeviceNotFound("camera".to_string()))?;
        let track: Arc<dyn TrackLocal + Send + Sync> = camera.track.clone();
        let sender = pc
            .add_track(track)
            .await
            .map_err(|e| MediaError::TrackError(format!("Failed to add video track: {e}")))?;
        self.video_sender = Some(sender);
        let _ = self.event_sender.send(MediaEvent::TrackToggled {
            kind: MediaKind::Video,
            enabled: true,
        });
        Ok(true)
    }

    /// Substitute screen capture into the outgoing video leg
    ///
    /// Replaces the track on the existing video sender in place; no new
    /// offer or answer is produced. The screen stream is also mirrored into
    /// the local preview sink.
    ///
    /// # Errors
    ///
    /// Returns error if screen capture is unavailable or there is no
    /// outgoing video sender to substitute.
    pub async fn start_screen_share(&mut self) -> Result<(), MediaError> {
        if self.screen.is_some() {
            tracing::debug!("Screen share already active");
            return Ok(());
        }
        if !self.config.screen_capture {
            return Err(MediaError::ScreenCaptureUnavailable);
        }
        let sender = self
            .video_sender
            .as_ref()
            .ok_or(MediaError::NoOutgoingVideo)?;

        tracing::info!("Starting screen share");
        let screen = CaptureTrack::new(Arc::new(TrackLocalStaticSample::new(
            vp8_capability(),
            "screen-0".to_string(),
            "duocall-local".to_string(),
        )));
        let track: Arc<dyn TrackLocal + Send + Sync> = screen.track.clone();
        sender
            .replace_track(Some(track))
            .await
            .map_err(|e| MediaError::TrackError(format!("Failed to replace track: {e}")))?;

        self.screen = Some(screen);
        let _ = self.preview_tx.send(Some(VideoSource::Screen));
        let _ = self.event_sender.send(MediaEvent::ScreenShareStarted);
        Ok(())
    }

    /// Stop screen capture and restore the camera on the outgoing video leg
    ///
    /// Replaces the sender's track back with the camera track if video is
    /// still enabled, or with no track otherwise. A no-op when no screen
    /// share is active.
    ///
    /// # Errors
    ///
    /// Returns error if the sender rejects the replacement
    pub async fn stop_screen_share(&mut self) -> Result<(), MediaError> {
        if self.screen.take().is_none() {
            return Ok(());
        }
        tracing::info!("Stopping screen share");

        if let Some(sender) = &self.video_sender {
            let camera_track = self.camera.as_ref().filter(|c| c.is_enabled()).map(|c| {
                let track: Arc<dyn TrackLocal + Send + Sync> = c.track.clone();
                track
            });
            sender
                .replace_track(camera_track)
                .await
                .map_err(|e| MediaError::TrackError(format!("Failed to restore track: {e}")))?;
        }

        let preview = self
            .camera
            .as_ref()
            .filter(|c| c.is_enabled())
            .map(|_| VideoSource::Camera);
        let _ = self.preview_tx.send(preview);
        let _ = self.event_sender.send(MediaEvent::ScreenShareStopped);
        Ok(())
    }

    /// Platform hook: the OS-level "stop sharing" control ended the capture
    ///
    /// # Errors
    ///
    /// Returns error if restoring the camera track fails
    pub async fn screen_capture_ended(&mut self) -> Result<(), MediaError> {
        if self.screen.is_some() {
            tracing::info!("Screen capture ended by platform control");
            self.stop_screen_share().await?;
        }
        Ok(())
    }

    /// Toggle local muting of remote playback, returning the new muted state
    pub fn toggle_speaker(&mut self) -> bool {
        self.speaker_muted = !self.speaker_muted;
        tracing::info!(muted = self.speaker_muted, "Speaker toggled");
        self.speaker_muted
    }

    /// Feed an encoded audio sample into the outgoing track
    ///
    /// Silently dropped while audio is muted, so the remote leg stays up and
    /// carries silence.
    ///
    /// # Errors
    ///
    /// Returns error if the track rejects the sample
    pub async fn send_audio(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        let Some(audio) = &self.audio else {
            return Ok(());
        };
        if self.released || !audio.is_enabled() {
            return Ok(());
        }
        audio
            .track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| MediaError::TrackError(e.to_string()))
    }

    /// Feed an encoded video frame into the active outgoing video track
    ///
    /// Goes to the screen track while sharing, the camera track otherwise.
    ///
    /// # Errors
    ///
    /// Returns error if the track rejects the sample
    pub async fn send_video(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        let target = match (&self.screen, &self.camera) {
            (Some(screen), _) => screen,
            (None, Some(camera)) if camera.is_enabled() => camera,
            _ => return Ok(()),
        };
        if self.released {
            return Ok(());
        }
        target
            .track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| MediaError::TrackError(e.to_string()))
    }

    /// Release all capture
    ///
    /// Part of the session teardown routine; drops every track and sender so
    /// no capture outlives the call.
    pub fn stop_all(&mut self) {
        if self.released {
            return;
        }
        tracing::info!("Releasing local media");
        self.audio = None;
        self.camera = None;
        self.screen = None;
        self.audio_sender = None;
        self.video_sender = None;
        self.released = true;
        let _ = self.preview_tx.send(None);
        let _ = self.event_sender.send(MediaEvent::Released);
    }

    /// Snapshot of the current state
    #[must_use]
    pub fn state(&self) -> LocalMediaState {
        let video_source = if self.screen.is_some() {
            Some(VideoSource::Screen)
        } else {
            self.camera.as_ref().map(|_| VideoSource::Camera)
        };
        LocalMediaState {
            audio_enabled: self.audio.as_ref().map(CaptureTrack::is_enabled),
            video_enabled: self.camera.as_ref().map(CaptureTrack::is_enabled),
            video_source,
            screen_sharing: self.screen.is_some(),
            speaker_muted: self.speaker_muted,
            released: self.released,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    async fn test_peer_connection() -> Arc<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    fn no_camera_config() -> MediaConfig {
        MediaConfig {
            video_device: None,
            ..MediaConfig::default()
        }
    }

    #[test]
    fn test_acquire_audio_only() {
        let mut media = MediaController::new(MediaConfig::default());
        media.acquire(MediaKind::Audio).unwrap();

        let state = media.state();
        assert_eq!(state.audio_enabled, Some(true));
        assert_eq!(state.video_enabled, None);
        assert!(!state.screen_sharing);
    }

    #[test]
    fn test_acquire_fails_without_microphone() {
        let mut media = MediaController::new(MediaConfig {
            audio_device: None,
            ..MediaConfig::default()
        });
        let result = media.acquire(MediaKind::Audio);
        assert!(matches!(result, Err(MediaError::DeviceNotFound(_))));
    }

    #[test]
    fn test_acquire_video_fails_without_camera() {
        let mut media = MediaController::new(no_camera_config());
        let result = media.acquire(MediaKind::Video);
        assert!(matches!(result, Err(MediaError::DeviceNotFound(_))));
    }

    #[test]
    fn test_toggle_audio_flips_flag() {
        let mut media = MediaController::new(MediaConfig::default());
        media.acquire(MediaKind::Audio).unwrap();

        assert!(!media.toggle_audio().unwrap());
        assert_eq!(media.state().audio_enabled, Some(false));
        assert!(media.toggle_audio().unwrap());
        assert_eq!(media.state().audio_enabled, Some(true));
    }

    #[test]
    fn test_screen_share_requires_video_sender() {
        let mut media = MediaController::new(MediaConfig::default());
        media.acquire(MediaKind::Video).unwrap();

        // Not attached to a peer connection yet, so there is no sender.
        let result = tokio_test::block_on(media.start_screen_share());
        assert!(matches!(result, Err(MediaError::NoOutgoingVideo)));
    }

    #[tokio::test]
    async fn test_screen_share_round_trip_restores_camera() {
        let mut media = MediaController::new(MediaConfig::default());
        media.acquire(MediaKind::Video).unwrap();

        let pc = test_peer_connection().await;
        media.attach_to(&pc).await.unwrap();

        media.start_screen_share().await.unwrap();
        let sharing = media.state();
        assert!(sharing.screen_sharing);
        assert_eq!(sharing.video_source, Some(VideoSource::Screen));
        assert_eq!(*media.preview().borrow(), Some(VideoSource::Screen));

        media.stop_screen_share().await.unwrap();
        let restored = media.state();
        assert!(!restored.screen_sharing);
        assert_eq!(restored.video_source, Some(VideoSource::Camera));
        assert_eq!(*media.preview().borrow(), Some(VideoSource::Camera));
    }

    #[tokio::test]
    async fn test_platform_capture_end_stops_share() {
        let mut media = MediaController::new(MediaConfig::default());
        media.acquire(MediaKind::Video).unwrap();

        let pc = test_peer_connection().await;
        media.attach_to(&pc).await.unwrap();
        media.start_screen_share().await.unwrap();

        media.screen_capture_ended().await.unwrap();
        assert!(!media.state().screen_sharing);
    }

    #[tokio::test]
    async fn test_toggle_video_acquires_camera_mid_call() {
        let mut media = MediaController::new(MediaConfig::default());
        media.acquire(MediaKind::Audio).unwrap();

        let pc = test_peer_connection().await;
        media.attach_to(&pc).await.unwrap();
        assert_eq!(media.state().video_enabled, None);

        let enabled = media.toggle_video(&pc).await.unwrap();
        assert!(enabled);
        assert_eq!(media.state().video_enabled, Some(true));
        assert_eq!(media.state().video_source, Some(VideoSource::Camera));
    }

    #[test]
    fn test_stop_all_releases_everything() {
        let mut media = MediaController::new(MediaConfig::default());
        media.acquire(MediaKind::Video).unwrap();
        media.stop_all();

        let state = media.state();
        assert!(state.released);
        assert_eq!(state.audio_enabled, None);
        assert_eq!(state.video_enabled, None);
        assert!(!state.screen_sharing);

        // Idempotent.
        media.stop_all();
        assert!(media.state().released);
    }

    #[tokio::test]
    async fn test_muted_audio_drops_samples_without_error() {
        let mut media = MediaController::new(MediaConfig::default());
        media.acquire(MediaKind::Audio).unwrap();

        media.toggle_audio().unwrap();
        media
            .send_audio(Bytes::from_static(&[0u8; 8]), Duration::from_millis(20))
            .await
            .unwrap();

        media.toggle_audio().unwrap();
        media
            .send_audio(Bytes::from_static(&[0u8; 8]), Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[test]
    fn test_toggle_speaker_is_local_only() {
        let mut media = MediaController::new(MediaConfig::default());
        assert!(media.toggle_speaker());
        assert!(media.state().speaker_muted);
        assert!(!media.toggle_speaker());
    }
}
