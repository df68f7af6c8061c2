//! Outbound source selection
//!
//! Priority is Screen, then Virtual (only while a background mode is set
//! and the compositor has produced at least one frame), then Camera. The
//! microphone rides along with whichever video source wins unless the
//! screen capture brought its own audio.

use std::sync::Arc;

use huddle_protocol::{BackgroundMode, SourceKind};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::media::{MediaSource, MediaTrack};

const CHANGE_BUFFER: usize = 32;

/// The source currently transmitted, with the tracks picked from it
#[derive(Debug, Clone)]
pub struct OutboundSelection {
    pub source: Arc<MediaSource>,
    pub video: Option<Arc<MediaTrack>>,
    pub audio: Option<Arc<MediaTrack>>,
}

impl OutboundSelection {
    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    fn identity(&self) -> (Uuid, Option<Uuid>) {
        (self.source.id(), self.audio.as_ref().map(|t| t.id()))
    }

    /// Same source and same audio track
    pub fn same_as(&self, other: &OutboundSelection) -> bool {
        self.identity() == other.identity()
    }
}

#[derive(Debug, Clone)]
pub struct SourceChanged {
    pub previous: Option<SourceKind>,
    pub current: Option<OutboundSelection>,
}

#[derive(Debug)]
pub struct StreamSourceRegistry {
    camera: Option<Arc<MediaSource>>,
    virtual_source: Option<Arc<MediaSource>>,
    virtual_ready: bool,
    screen: Option<Arc<MediaSource>>,
    mode: BackgroundMode,
    active: Option<OutboundSelection>,
    changes: broadcast::Sender<SourceChanged>,
}

impl Default for StreamSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSourceRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            camera: None,
            virtual_source: None,
            virtual_ready: false,
            screen: None,
            mode: BackgroundMode::None,
            active: None,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceChanged> {
        self.changes.subscribe()
    }

    pub fn active(&self) -> Option<OutboundSelection> {
        self.active.clone()
    }

    pub fn active_kind(&self) -> Option<SourceKind> {
        self.active.as_ref().map(|a| a.kind())
    }

    pub fn mode(&self) -> BackgroundMode {
        self.mode
    }

    pub fn set_camera(&mut self, camera: Option<Arc<MediaSource>>) -> Option<SourceChanged> {
        self.camera = camera;
        self.recompute()
    }

    pub fn set_virtual_source(&mut self, source: Option<Arc<MediaSource>>) -> Option<SourceChanged> {
        self.virtual_source = source;
        self.recompute()
    }

    /// Compositor output became available or went away
    pub fn set_virtual_ready(&mut self, ready: bool) -> Option<SourceChanged> {
        self.virtual_ready = ready;
        self.recompute()
    }

    pub fn set_screen(&mut self, screen: Option<Arc<MediaSource>>) -> Option<SourceChanged> {
        self.screen = screen;
        self.recompute()
    }

    pub fn set_mode(&mut self, mode: BackgroundMode) -> Option<SourceChanged> {
        self.mode = mode;
        self.recompute()
    }

    /// Drop every candidate, e.g. when the session ends
    pub fn clear(&mut self) -> Option<SourceChanged> {
        self.camera = None;
        self.virtual_source = None;
        self.virtual_ready = false;
        self.screen = None;
        self.recompute()
    }

    /// Re-evaluate the selection; emits when the selection identity changed
    pub fn recompute(&mut self) -> Option<SourceChanged> {
        let next = self.select();
        let changed = match (&self.active, &next) {
            (Some(current), Some(next)) => !current.same_as(next),
            (None, None) => false,
            _ => true,
        };
        if !changed {
            return None;
        }

        let event = SourceChanged {
            previous: self.active_kind(),
            current: next.clone(),
        };
        tracing::info!(
            "Active source changed: {:?} -> {:?}",
            event.previous,
            next.as_ref().map(|n| n.kind())
        );
        self.active = next;
        let _ = self.changes.send(event.clone());
        Some(event)
    }

    fn select(&self) -> Option<OutboundSelection> {
        let live = |source: &Option<Arc<MediaSource>>| source.as_ref().filter(|s| s.is_live()).cloned();

        let camera = live(&self.camera);
        let microphone = camera.as_ref().and_then(|c| c.audio_track().cloned());

        let virtual_source = if self.mode.is_virtual() && self.virtual_ready {
            live(&self.virtual_source)
        } else {
            None
        };

        let chosen = live(&self.screen).or(virtual_source).or(camera)?;
        let video = chosen.video_track().cloned();
        let audio = match chosen.kind() {
            SourceKind::Screen => chosen.audio_track().cloned().or(microphone),
            SourceKind::Virtual => microphone,
            SourceKind::Camera => chosen.audio_track().cloned(),
        };

        Some(OutboundSelection {
            source: chosen,
            video,
            audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::TrackKind;

    fn camera() -> Arc<MediaSource> {
        MediaSource::new(
            SourceKind::Camera,
            vec![
                MediaTrack::new(TrackKind::Video, "camera"),
                MediaTrack::new(TrackKind::Audio, "microphone"),
            ],
        )
    }

    fn virtual_output() -> Arc<MediaSource> {
        MediaSource::new(SourceKind::Virtual, vec![MediaTrack::new(TrackKind::Video, "virtual")])
    }

    fn screen(with_audio: bool) -> Arc<MediaSource> {
        let mut tracks = vec![MediaTrack::new(TrackKind::Video, "screen")];
        if with_audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "system audio"));
        }
        MediaSource::new(SourceKind::Screen, tracks)
    }

    #[test]
    fn empty_registry_selects_nothing() {
        let mut registry = StreamSourceRegistry::new();
        assert!(registry.recompute().is_none());
        assert!(registry.active().is_none());
    }

    #[test]
    fn virtual_requires_mode_and_a_composited_frame() {
        let mut registry = StreamSourceRegistry::new();
        let cam = camera();
        registry.set_camera(Some(cam.clone()));
        registry.set_virtual_source(Some(virtual_output()));

        registry.set_mode(BackgroundMode::Blur);
        assert_eq!(registry.active_kind(), Some(SourceKind::Camera));

        registry.set_virtual_ready(true);
        assert_eq!(registry.active_kind(), Some(SourceKind::Virtual));

        registry.set_mode(BackgroundMode::None);
        assert_eq!(registry.active_kind(), Some(SourceKind::Camera));
    }

    #[test]
    fn microphone_follows_virtual_video() {
        let mut registry = StreamSourceRegistry::new();
        let cam = camera();
        registry.set_camera(Some(cam.clone()));
        registry.set_virtual_source(Some(virtual_output()));
        registry.set_virtual_ready(true);
        registry.set_mode(BackgroundMode::Blur);

        let active = registry.active().unwrap();
        assert_eq!(active.kind(), SourceKind::Virtual);
        assert_eq!(
            active.audio.map(|t| t.id()),
            cam.audio_track().map(|t| t.id())
        );
    }

    #[test]
    fn screen_outranks_everything_and_prefers_its_own_audio() {
        let mut registry = StreamSourceRegistry::new();
        registry.set_camera(Some(camera()));
        registry.set_virtual_source(Some(virtual_output()));
        registry.set_virtual_ready(true);
        registry.set_mode(BackgroundMode::Image);

        let share = screen(true);
        let event = registry.set_screen(Some(share.clone())).unwrap();
        assert_eq!(event.previous, Some(SourceKind::Virtual));

        let active = registry.active().unwrap();
        assert_eq!(active.kind(), SourceKind::Screen);
        assert_eq!(
            active.audio.map(|t| t.id()),
            share.audio_track().map(|t| t.id())
        );
    }

    #[test]
    fn silent_screen_borrows_the_microphone() {
        let mut registry = StreamSourceRegistry::new();
        let cam = camera();
        registry.set_camera(Some(cam.clone()));
        registry.set_screen(Some(screen(false)));

        let active = registry.active().unwrap();
        assert_eq!(active.kind(), SourceKind::Screen);
        assert_eq!(
            active.audio.map(|t| t.id()),
            cam.audio_track().map(|t| t.id())
        );
    }

    #[test]
    fn same_source_recompute_is_silent() {
        let mut registry = StreamSourceRegistry::new();
        let mut changes = registry.subscribe();
        registry.set_camera(Some(camera()));
        assert!(changes.try_recv().is_ok());

        // Blur -> Image repaints in place
        registry.set_virtual_source(Some(virtual_output()));
        registry.set_virtual_ready(true);
        registry.set_mode(BackgroundMode::Blur);
        assert!(changes.try_recv().is_ok());
        assert!(registry.set_mode(BackgroundMode::Image).is_none());
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn stopped_sources_never_stay_active() {
        let mut registry = StreamSourceRegistry::new();
        let cam = camera();
        registry.set_camera(Some(cam.clone()));
        let share = screen(false);
        registry.set_screen(Some(share.clone()));

        share.stop();
        let event = registry.recompute().unwrap();
        assert_eq!(event.current.unwrap().kind(), SourceKind::Camera);

        cam.stop();
        assert!(registry.recompute().unwrap().current.is_none());
    }
}
