//! Media tracks and sources
//!
//! A [`MediaTrack`] is a live fan-out of frames from one producer. A
//! [`MediaSource`] groups the tracks that came out of one device grant
//! (camera + microphone, a screen capture, the compositor output).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use huddle_media::{MediaFrame, VideoFrame};
use huddle_protocol::{SourceKind, TrackKind};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Frames buffered per subscriber before the slowest one starts lagging
const TRACK_BUFFER: usize = 8;

/// Handle on the hardware behind a track, released exactly once
pub trait DeviceLease: Send + Sync {
    fn release(&self);
}

pub struct MediaTrack {
    id: Uuid,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
    frames: broadcast::Sender<MediaFrame>,
    ended: watch::Sender<bool>,
    lease: Mutex<Option<Arc<dyn DeviceLease>>>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Arc<Self> {
        Self::build(kind, label.into(), None)
    }

    /// Track backed by a device that must be released on stop
    pub fn with_lease(kind: TrackKind, label: impl Into<String>, lease: Arc<dyn DeviceLease>) -> Arc<Self> {
        Self::build(kind, label.into(), Some(lease))
    }

    fn build(kind: TrackKind, label: String, lease: Option<Arc<dyn DeviceLease>>) -> Arc<Self> {
        let (frames, _) = broadcast::channel(TRACK_BUFFER);
        let (ended, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            label,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            frames,
            ended,
            lease: Mutex::new(lease),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute. The device stays open either way.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Push a frame to every subscriber.
    ///
    /// Returns false when the frame was dropped because the track is muted
    /// or already ended.
    pub fn publish(&self, frame: MediaFrame) -> bool {
        if !self.is_live() || !self.is_enabled() {
            return false;
        }
        if frame.kind() != self.kind {
            tracing::warn!("Dropping {} frame published on {} track {}", frame.kind(), self.kind, self.label);
            return false;
        }
        // No subscribers is fine
        let _ = self.frames.send(frame);
        true
    }

    pub fn publish_video(&self, frame: VideoFrame) -> bool {
        self.publish(MediaFrame::Video(Arc::new(frame)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.frames.subscribe()
    }

    /// Flips to `true` once the track ends
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    pub async fn wait_ended(&self) {
        let mut ended = self.ended.subscribe();
        let _ = ended.wait_for(|ended| *ended).await;
    }

    /// End the track and release its device. Idempotent.
    pub fn stop(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(lease) = lease {
            lease.release();
        }
        self.ended.send_replace(true);
        tracing::debug!("Track {} ({}) stopped", self.label, self.kind);
    }
}

impl Drop for MediaTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
pub struct MediaSource {
    id: Uuid,
    kind: SourceKind,
    tracks: Vec<Arc<MediaTrack>>,
    live: AtomicBool,
}

impl MediaSource {
    pub fn new(kind: SourceKind, tracks: Vec<Arc<MediaTrack>>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            tracks,
            live: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn audio_track(&self) -> Option<&Arc<MediaTrack>> {
        self.track(TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&Arc<MediaTrack>> {
        self.track(TrackKind::Video)
    }

    /// Live until stopped, or until every track has ended on its own
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && self.tracks.iter().any(|t| t.is_live())
    }

    /// Enable flag of the first track of `kind`, false if there is none
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some_and(|t| t.is_enabled())
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    /// Stop every track. Idempotent.
    pub fn stop(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
        tracing::info!("{} source {} stopped", self.kind, self.id);
    }
}
