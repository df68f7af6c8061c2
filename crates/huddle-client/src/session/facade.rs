//! Session facade
//!
//! Owns every source, the compositor, the recorder and the peer manager,
//! and wires them together. A single driver task forwards transport events
//! and source changes to the peer manager in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use huddle_media::ContainerEncoderFactory;
use huddle_protocol::{BackgroundMode, SourceKind, TrackKind};
use image::RgbaImage;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Result, SessionError};
use crate::media::{CameraRequest, MediaDevices, MediaSource, MediaTrack};
use crate::session::compositor::{self, Compositor, CompositorConfig};
use crate::session::notice::{Feature, Notice};
use crate::session::peers::{Participant, PeerSessionManager};
use crate::session::recorder::{Recorder, RecorderConfig, RecordingArtifact, RecordingStart, RecordingState};
use crate::session::registry::{OutboundSelection, SourceChanged, StreamSourceRegistry};
use crate::session::segmentation::Segmenter;
use crate::settings::PersistentSettings;
use crate::transport::{Transport, TransportEvent};

const NOTICE_BUFFER: usize = 32;

/// External collaborators a session runs against
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn Transport>,
    pub devices: Arc<dyn MediaDevices>,
    pub segmenter: Arc<dyn Segmenter>,
    pub recording_encoders: Arc<dyn ContainerEncoderFactory>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub display_name: String,
    /// Identity to ask the relay for, a fresh one when unset
    pub requested_id: Option<String>,
    pub background_mode: BackgroundMode,
    pub camera: CameraRequest,
    pub compositor: CompositorConfig,
    pub background_image: Option<Arc<RgbaImage>>,
    pub recording: RecorderConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), &PersistentSettings::default())
    }
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings, persistent: &PersistentSettings) -> Self {
        Self {
            display_name: persistent
                .display_name
                .clone()
                .unwrap_or_else(|| settings.display_name.clone()),
            requested_id: settings.signaling.requested_id.clone(),
            background_mode: persistent.background_mode,
            camera: CameraRequest {
                device_index: persistent.video_device,
                ..Default::default()
            },
            compositor: CompositorConfig::from(&settings.compositor),
            background_image: settings
                .compositor
                .background_image
                .as_deref()
                .and_then(compositor::load_background),
            recording: RecorderConfig::from(&settings.recording),
        }
    }
}

/// What the local user is currently sending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaState {
    pub audio: bool,
    pub video: bool,
    pub screen_sharing: bool,
}

#[derive(Debug)]
pub enum RecordingToggle {
    Started,
    Stopped(Option<RecordingArtifact>),
    /// Prompt dismissed or capture unavailable; recording stays off
    NotStarted,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub local_id: Option<String>,
    pub recording: Option<RecordingArtifact>,
}

struct DriverInputs {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    changes: broadcast::Receiver<SourceChanged>,
    ready: watch::Receiver<bool>,
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    devices: Arc<dyn MediaDevices>,
    peers: PeerSessionManager,
    compositor: Compositor,
    recorder: Recorder,
    registry: Mutex<StreamSourceRegistry>,
    camera: Mutex<Option<Arc<MediaSource>>>,
    screen: Mutex<Option<Arc<MediaSource>>>,
    /// Serializes screen share toggles across the permission prompt
    screen_gate: tokio::sync::Mutex<()>,
    camera_request: CameraRequest,
    requested_id: Option<String>,
    mode: watch::Sender<BackgroundMode>,
    media_state: watch::Sender<MediaState>,
    active_source: watch::Sender<Option<SourceKind>>,
    notices: broadcast::Sender<Notice>,
    pending: Mutex<Option<DriverInputs>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    ended: AtomicBool,
    completed: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wire up a session. Nothing is opened until [`Session::start`].
    pub fn new(deps: SessionDeps, options: SessionOptions) -> Result<Self> {
        let events = deps
            .transport
            .take_events()
            .ok_or_else(|| anyhow::anyhow!("transport events already taken"))?;

        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let peers = PeerSessionManager::new(deps.transport.clone(), options.display_name.clone(), notices.clone());

        let compositor = Compositor::new(deps.segmenter, options.compositor, options.background_image.clone());
        compositor.set_mode(options.background_mode);

        let recorder = Recorder::new(
            deps.devices.clone(),
            deps.recording_encoders,
            options.recording.clone(),
            notices.clone(),
        );

        let mut registry = StreamSourceRegistry::new();
        registry.set_virtual_source(Some(compositor.output()));
        registry.set_mode(options.background_mode);
        let inputs = DriverInputs {
            events,
            changes: registry.subscribe(),
            ready: compositor.subscribe_ready(),
        };

        let (mode, _) = watch::channel(options.background_mode);
        let (media_state, _) = watch::channel(MediaState::default());
        let (active_source, _) = watch::channel(None);
        let (completed, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(SessionInner {
                transport: deps.transport,
                devices: deps.devices,
                peers,
                compositor,
                recorder,
                registry: Mutex::new(registry),
                camera: Mutex::new(None),
                screen: Mutex::new(None),
                screen_gate: tokio::sync::Mutex::new(()),
                camera_request: options.camera,
                requested_id: options.requested_id,
                mode,
                media_state,
                active_source,
                notices,
                pending: Mutex::new(Some(inputs)),
                driver: Mutex::new(None),
                ended: AtomicBool::new(false),
                completed,
            }),
        })
    }

    /// Open the camera, start the driver and acquire the local identity.
    ///
    /// A camera failure is reported as a notice and the session goes on
    /// without it. Safe to call more than once.
    pub async fn start(&self) -> Result<String> {
        self.ensure_live()?;

        let inputs = lock(&self.inner.pending).take();
        if let Some(inputs) = inputs {
            self.open_camera().await?;
            let driver = tokio::spawn(drive(
                Arc::downgrade(&self.inner),
                self.inner.peers.clone(),
                inputs,
            ));
            *lock(&self.inner.driver) = Some(driver);
        }

        match self.inner.peers.start(self.inner.requested_id.as_deref()).await {
            Ok(id) => Ok(id),
            Err(e) => {
                tracing::error!("Failed to acquire identity: {}", e);
                self.notify(Notice::Peer {
                    peer_id: None,
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Fails only when the session ended while the prompt was open
    async fn open_camera(&self) -> Result<()> {
        match self.inner.devices.open_camera(self.inner.camera_request).await {
            Ok(camera) => {
                {
                    let mut slot = lock(&self.inner.camera);
                    if self.inner.ended.load(Ordering::SeqCst) {
                        drop(slot);
                        tracing::info!("Session ended during camera prompt, releasing camera");
                        camera.stop();
                        return Err(SessionError::Ended);
                    }
                    *slot = Some(camera.clone());
                }
                tracing::info!("Camera opened with {} tracks", camera.tracks().len());
                if let Some(video) = camera.video_track() {
                    self.inner.compositor.start(video.clone());
                    self.watch_camera(video.clone());
                }
                self.update_registry(|registry| registry.set_camera(Some(camera)));
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!("Camera prompt dismissed, continuing without camera");
            }
            Err(e) => {
                tracing::warn!("Failed to open camera: {}", e);
                self.notify(Notice::Device {
                    feature: Feature::Camera,
                    message: e.to_string(),
                });
            }
        }
        self.publish_media_state();
        Ok(())
    }

    /// Re-select when the camera disappears underneath us
    fn watch_camera(&self, video: Arc<MediaTrack>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            video.wait_ended().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.ended.load(Ordering::SeqCst) {
                return;
            }
            tracing::warn!("Camera track ended");
            let session = Session { inner };
            session.inner.compositor.stop();
            session.update_registry(|registry| registry.recompute());
            session.publish_media_state();
        });
    }

    /// Connect to `remote_id` once identity and an outbound source exist
    pub async fn join(&self, remote_id: &str) -> Result<()> {
        self.ensure_live()?;
        self.inner.peers.join(remote_id).await;
        Ok(())
    }

    /// Mute or unmute the microphone. Returns whether audio is now on.
    pub fn toggle_audio(&self) -> Result<bool> {
        self.ensure_live()?;
        let Some(track) = self.camera_track(TrackKind::Audio) else {
            tracing::debug!("No microphone to toggle");
            return Ok(false);
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::info!("Microphone {}", if enabled { "unmuted" } else { "muted" });
        self.publish_media_state();
        Ok(enabled)
    }

    /// Pause or resume the camera. Returns whether video is now on.
    pub fn toggle_video(&self) -> Result<bool> {
        self.ensure_live()?;
        let Some(track) = self.camera_track(TrackKind::Video) else {
            tracing::debug!("No camera to toggle");
            return Ok(false);
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        self.inner.compositor.output().set_enabled(TrackKind::Video, enabled);
        tracing::info!("Camera {}", if enabled { "resumed" } else { "paused" });
        self.publish_media_state();
        Ok(enabled)
    }

    /// None -> Blur -> Image -> None
    pub fn cycle_background(&self) -> Result<BackgroundMode> {
        let next = self.background_mode().next();
        self.set_background_mode(next)
    }

    pub fn set_background_mode(&self, mode: BackgroundMode) -> Result<BackgroundMode> {
        self.ensure_live()?;
        tracing::info!("Background mode set to {:?}", mode);
        self.inner.mode.send_replace(mode);
        self.inner.compositor.set_mode(mode);
        if mode.is_virtual() && !self.inner.compositor.is_running() {
            if let Some(video) = self.camera_track(TrackKind::Video).filter(|t| t.is_live()) {
                self.inner.compositor.start(video);
            }
        }
        self.update_registry(|registry| registry.set_mode(mode));
        Ok(mode)
    }

    /// Start or stop sharing the screen. Returns whether sharing is now on.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        self.ensure_live()?;
        let _gate = self.inner.screen_gate.lock().await;

        let current = lock(&self.inner.screen).take();
        if let Some(screen) = current {
            tracing::info!("Stopping screen share");
            screen.stop();
            self.update_registry(|registry| registry.set_screen(None));
            self.publish_media_state();
            return Ok(false);
        }

        let screen = match self.inner.devices.open_screen().await {
            Ok(screen) => screen,
            Err(e) if e.is_cancelled() => {
                tracing::info!("Screen share prompt dismissed");
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!("Failed to share screen: {}", e);
                self.notify(Notice::Device {
                    feature: Feature::ScreenShare,
                    message: e.to_string(),
                });
                return Ok(false);
            }
        };

        if self.inner.ended.load(Ordering::SeqCst) {
            screen.stop();
            return Err(SessionError::Ended);
        }

        tracing::info!("Screen share started");
        *lock(&self.inner.screen) = Some(screen.clone());
        self.update_registry(|registry| registry.set_screen(Some(screen.clone())));
        self.publish_media_state();
        self.watch_screen(screen);
        Ok(true)
    }

    /// The OS can end a share (e.g. the user clicks "stop sharing")
    fn watch_screen(&self, screen: Arc<MediaSource>) {
        let Some(video) = screen.video_track().cloned() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            video.wait_ended().await;
            if let Some(inner) = weak.upgrade() {
                Session { inner }.on_screen_ended(screen.id()).await;
            }
        });
    }

    async fn on_screen_ended(&self, screen_id: Uuid) {
        let _gate = self.inner.screen_gate.lock().await;
        let ended = {
            let mut screen = lock(&self.inner.screen);
            match screen.as_ref() {
                Some(current) if current.id() == screen_id => screen.take(),
                _ => None,
            }
        };
        if let Some(screen) = ended {
            tracing::info!("Screen share ended by the system");
            screen.stop();
            self.update_registry(|registry| registry.set_screen(None));
            self.publish_media_state();
        }
    }

    pub async fn toggle_recording(&self) -> Result<RecordingToggle> {
        self.ensure_live()?;
        if self.inner.recorder.is_recording() {
            return Ok(RecordingToggle::Stopped(self.inner.recorder.stop().await?));
        }

        match self.inner.recorder.start().await {
            Ok(RecordingStart::Started) => Ok(RecordingToggle::Started),
            Ok(RecordingStart::AlreadyRecording) => Ok(RecordingToggle::Started),
            Ok(RecordingStart::Cancelled) => Ok(RecordingToggle::NotStarted),
            Err(SessionError::Device(e)) => {
                tracing::warn!("Failed to start recording: {}", e);
                self.notify(Notice::Device {
                    feature: Feature::Recording,
                    message: e.to_string(),
                });
                Ok(RecordingToggle::NotStarted)
            }
            Err(e) => {
                tracing::warn!("Failed to start recording: {}", e);
                self.notify(Notice::Recording { message: e.to_string() });
                Ok(RecordingToggle::NotStarted)
            }
        }
    }

    pub async fn set_display_name(&self, name: impl Into<String>) -> Result<()> {
        self.ensure_live()?;
        self.inner.peers.set_local_name(name).await;
        Ok(())
    }

    /// Stop every owned source, finalize a running recording, close all
    /// peers and leave the relay
    pub async fn end_session(&self) -> Result<SessionSummary> {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Ended);
        }
        tracing::info!("Ending session");

        {
            let _gate = self.inner.screen_gate.lock().await;
            if let Some(screen) = lock(&self.inner.screen).take() {
                screen.stop();
            }
        }
        if let Some(camera) = lock(&self.inner.camera).take() {
            camera.stop();
        }
        self.inner.compositor.close();
        self.update_registry(|registry| registry.clear());

        let recording = match self.inner.recorder.stop().await {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::error!("Failed to finalize recording: {}", e);
                self.notify(Notice::Recording { message: e.to_string() });
                None
            }
        };

        self.inner.peers.close_all().await;
        self.inner.transport.shutdown().await;
        if let Some(driver) = lock(&self.inner.driver).take() {
            driver.abort();
        }
        lock(&self.inner.pending).take();

        self.publish_media_state();
        self.inner.completed.send_replace(true);
        tracing::info!("Session ended");

        Ok(SessionSummary {
            local_id: self.inner.peers.local_id(),
            recording,
        })
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Resolves once [`Session::end_session`] completed
    pub async fn wait_ended(&self) {
        let mut completed = self.inner.completed.subscribe();
        let _ = completed.wait_for(|done| *done).await;
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.inner.peers.roster()
    }

    pub fn subscribe_roster(&self) -> watch::Receiver<Vec<Participant>> {
        self.inner.peers.subscribe_roster()
    }

    pub fn local_id(&self) -> Option<String> {
        self.inner.peers.local_id()
    }

    pub fn subscribe_local_id(&self) -> watch::Receiver<Option<String>> {
        self.inner.peers.subscribe_local_id()
    }

    pub fn active_source(&self) -> Option<SourceKind> {
        *self.inner.active_source.borrow()
    }

    pub fn subscribe_active_source(&self) -> watch::Receiver<Option<SourceKind>> {
        self.inner.active_source.subscribe()
    }

    pub fn active_selection(&self) -> Option<OutboundSelection> {
        lock(&self.inner.registry).active()
    }

    pub fn background_mode(&self) -> BackgroundMode {
        *self.inner.mode.borrow()
    }

    pub fn subscribe_background_mode(&self) -> watch::Receiver<BackgroundMode> {
        self.inner.mode.subscribe()
    }

    pub fn media_state(&self) -> MediaState {
        *self.inner.media_state.borrow()
    }

    pub fn subscribe_media_state(&self) -> watch::Receiver<MediaState> {
        self.inner.media_state.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    pub fn subscribe_recording_state(&self) -> watch::Receiver<RecordingState> {
        self.inner.recorder.subscribe_state()
    }

    pub fn subscribe_recordings(&self) -> broadcast::Receiver<RecordingArtifact> {
        self.inner.recorder.subscribe_finished()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recorder.is_recording()
    }

    pub fn compositor(&self) -> &Compositor {
        &self.inner.compositor
    }

    pub fn peers(&self) -> &PeerSessionManager {
        &self.inner.peers
    }

    pub fn camera(&self) -> Option<Arc<MediaSource>> {
        lock(&self.inner.camera).clone()
    }

    fn camera_track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        lock(&self.inner.camera).as_ref().and_then(|c| c.track(kind).cloned())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(SessionError::Ended);
        }
        Ok(())
    }

    fn update_registry(&self, apply: impl FnOnce(&mut StreamSourceRegistry) -> Option<SourceChanged>) {
        let mut registry = lock(&self.inner.registry);
        if let Some(change) = apply(&mut registry) {
            self.inner
                .active_source
                .send_replace(change.current.as_ref().map(|c| c.kind()));
        }
    }

    fn publish_media_state(&self) {
        let on = |kind: TrackKind| self.camera_track(kind).is_some_and(|t| t.is_live() && t.is_enabled());
        let state = MediaState {
            audio: on(TrackKind::Audio),
            video: on(TrackKind::Video),
            screen_sharing: lock(&self.inner.screen).as_ref().is_some_and(|s| s.is_live()),
        };
        self.inner.media_state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn notify(&self, notice: Notice) {
        let _ = self.inner.notices.send(notice);
    }
}

/// Single consumer for transport events, source changes and compositor
/// readiness, so the peer manager sees them in order
async fn drive(session: Weak<SessionInner>, peers: PeerSessionManager, inputs: DriverInputs) {
    let DriverInputs {
        mut events,
        mut changes,
        mut ready,
    } = inputs;
    let mut events_open = true;
    let mut ready_open = true;

    loop {
        tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(event) => peers.handle_event(event).await,
                None => {
                    tracing::info!("Transport event stream ended");
                    events_open = false;
                }
            },
            change = changes.recv() => match change {
                Ok(change) => peers.on_source_changed(change.current).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} source changes, resyncing", skipped);
                    let Some(inner) = session.upgrade() else { break };
                    let active = lock(&inner.registry).active();
                    drop(inner);
                    peers.on_source_changed(active).await;
                }
                Err(RecvError::Closed) => break,
            },
            changed = ready.changed(), if ready_open => match changed {
                Ok(()) => {
                    let is_ready = *ready.borrow_and_update();
                    let Some(inner) = session.upgrade() else { break };
                    tracing::debug!("Virtual output ready: {}", is_ready);
                    Session { inner }.update_registry(|registry| registry.set_virtual_ready(is_ready));
                }
                Err(_) => ready_open = false,
            },
        }
    }
    tracing::debug!("Session driver exiting");
}
