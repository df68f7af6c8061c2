use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use huddle_protocol::{SourceKind, TrackKind};
use tokio::sync::watch;

use crate::error::DeviceError;
use crate::media::{CameraRequest, DeviceLease, MediaDevices, MediaSource, MediaTrack};

/// How a fake permission prompt resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Allow,
    Deny,
    Cancel,
}

impl Grant {
    fn check(self, what: &str) -> Result<(), DeviceError> {
        match self {
            Grant::Allow => Ok(()),
            Grant::Deny => Err(DeviceError::PermissionDenied(format!("{} access denied", what))),
            Grant::Cancel => Err(DeviceError::Cancelled),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    released: AtomicUsize,
}

struct FakeLease {
    counters: Arc<Counters>,
}

impl DeviceLease for FakeLease {
    fn release(&self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture devices that count every open and release
pub struct FakeDevices {
    camera: Mutex<Grant>,
    screen: Mutex<Grant>,
    recording: Mutex<Grant>,
    screen_audio: AtomicBool,
    /// Camera prompts stay open while this is false
    camera_prompt: watch::Sender<bool>,
    camera_prompts: AtomicUsize,
    counters: Arc<Counters>,
    last_camera: Mutex<Option<Arc<MediaSource>>>,
    last_screen: Mutex<Option<Arc<MediaSource>>>,
    last_recording: Mutex<Option<Arc<MediaSource>>>,
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self {
            camera: Mutex::new(Grant::Allow),
            screen: Mutex::new(Grant::Allow),
            recording: Mutex::new(Grant::Allow),
            screen_audio: AtomicBool::new(false),
            camera_prompt: watch::channel(true).0,
            camera_prompts: AtomicUsize::new(0),
            counters: Arc::new(Counters::default()),
            last_camera: Mutex::new(None),
            last_screen: Mutex::new(None),
            last_recording: Mutex::new(None),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_camera(&self, grant: Grant) {
        *lock(&self.camera) = grant;
    }

    pub fn set_screen(&self, grant: Grant) {
        *lock(&self.screen) = grant;
    }

    pub fn set_recording(&self, grant: Grant) {
        *lock(&self.recording) = grant;
    }

    /// Screen captures come with a system audio track
    pub fn set_screen_audio(&self, enabled: bool) {
        self.screen_audio.store(enabled, Ordering::SeqCst);
    }

    /// Keep the camera prompt open until [`FakeDevices::answer_camera_prompt`]
    pub fn hold_camera_prompt(&self) {
        self.camera_prompt.send_replace(false);
    }

    pub fn answer_camera_prompt(&self) {
        self.camera_prompt.send_replace(true);
    }

    /// Camera prompts shown so far
    pub fn camera_prompts(&self) -> usize {
        self.camera_prompts.load(Ordering::SeqCst)
    }

    /// Devices opened so far (one per track)
    pub fn opens(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Devices currently held
    pub fn held(&self) -> usize {
        self.opens() - self.releases()
    }

    pub fn last_camera(&self) -> Option<Arc<MediaSource>> {
        lock(&self.last_camera).clone()
    }

    pub fn last_screen(&self) -> Option<Arc<MediaSource>> {
        lock(&self.last_screen).clone()
    }

    pub fn last_recording(&self) -> Option<Arc<MediaSource>> {
        lock(&self.last_recording).clone()
    }

    fn track(&self, kind: TrackKind, label: &str) -> Arc<MediaTrack> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let lease = Arc::new(FakeLease {
            counters: self.counters.clone(),
        });
        MediaTrack::with_lease(kind, label, lease)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_camera(&self, request: CameraRequest) -> Result<Arc<MediaSource>, DeviceError> {
        self.camera_prompts.fetch_add(1, Ordering::SeqCst);
        let mut prompt = self.camera_prompt.subscribe();
        let _ = prompt.wait_for(|answered| *answered).await;
        let grant = *lock(&self.camera);
        grant.check("camera")?;

        let mut tracks = Vec::new();
        if request.video {
            tracks.push(self.track(TrackKind::Video, "fake camera"));
        }
        if request.audio {
            tracks.push(self.track(TrackKind::Audio, "fake microphone"));
        }
        let source = MediaSource::new(SourceKind::Camera, tracks);
        *lock(&self.last_camera) = Some(source.clone());
        Ok(source)
    }

    async fn open_screen(&self) -> Result<Arc<MediaSource>, DeviceError> {
        let grant = *lock(&self.screen);
        grant.check("screen")?;

        let mut tracks = vec![self.track(TrackKind::Video, "fake screen")];
        if self.screen_audio.load(Ordering::SeqCst) {
            tracks.push(self.track(TrackKind::Audio, "fake system audio"));
        }
        let source = MediaSource::new(SourceKind::Screen, tracks);
        *lock(&self.last_screen) = Some(source.clone());
        Ok(source)
    }

    async fn open_recording_capture(&self) -> Result<Arc<MediaSource>, DeviceError> {
        let grant = *lock(&self.recording);
        grant.check("recording")?;

        let source = MediaSource::new(
            SourceKind::Screen,
            vec![
                self.track(TrackKind::Video, "fake recording screen"),
                self.track(TrackKind::Audio, "fake recording audio"),
            ],
        );
        *lock(&self.last_recording) = Some(source.clone());
        Ok(source)
    }
}
