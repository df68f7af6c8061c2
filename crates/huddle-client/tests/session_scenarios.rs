//! End-to-end session scenarios against the in-memory doubles
//!
//! Run with: cargo test -p huddle-client --test session_scenarios

use std::sync::Arc;
use std::time::Duration;

use huddle_client::session::{Feature, Notice, RecorderConfig, RecordingToggle};
use huddle_client::testing::{
    FakeDevices, FakeSegmenter, FakeTransport, Grant, MemoryEncoderFactory, eventually, feed_video, video_frame,
};
use huddle_client::{Session, SessionDeps, SessionOptions};
use huddle_protocol::{BackgroundMode, SourceKind, TrackKind};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    session: Session,
    transport: Arc<FakeTransport>,
    devices: Arc<FakeDevices>,
    segmenter: Arc<FakeSegmenter>,
    feeder: Option<JoinHandle<()>>,
}

impl Harness {
    fn new(transport: Arc<FakeTransport>, segmenter: FakeSegmenter) -> Self {
        Self::with_options(transport, segmenter, SessionOptions::default())
    }

    fn with_options(transport: Arc<FakeTransport>, segmenter: FakeSegmenter, options: SessionOptions) -> Self {
        let devices = FakeDevices::new();
        let segmenter = Arc::new(segmenter);
        let deps = SessionDeps {
            transport: transport.clone(),
            devices: devices.clone(),
            segmenter: segmenter.clone(),
            recording_encoders: Arc::new(MemoryEncoderFactory::new()),
        };
        let options = SessionOptions {
            display_name: "Ada".to_string(),
            ..options
        };
        let session = Session::new(deps, options).expect("Failed to build session");
        Self {
            session,
            transport,
            devices,
            segmenter,
            feeder: None,
        }
    }

    /// Start and keep camera frames flowing
    async fn start(&mut self) {
        self.session.start().await.expect("Failed to start session");
        if let Some(video) = self.session.camera().and_then(|c| c.video_track().cloned()) {
            self.feeder = Some(feed_video(video));
        }
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

#[tokio::test]
async fn virtual_source_needs_a_mode_and_a_composited_frame() {
    let mut h = Harness::new(FakeTransport::new("me"), FakeSegmenter::loading());
    h.start().await;
    assert_eq!(h.session.active_source(), Some(SourceKind::Camera));

    h.session.set_background_mode(BackgroundMode::Blur).unwrap();
    h.settle().await;
    // Model still loading, nothing composited yet
    assert_eq!(h.session.active_source(), Some(SourceKind::Camera));
    assert_eq!(h.session.compositor().composited_frames(), 0);

    h.segmenter.set_ready(true);
    eventually(|| h.session.active_source() == Some(SourceKind::Virtual)).await;
    assert!(h.session.compositor().composited_frames() > 0);

    h.session.set_background_mode(BackgroundMode::None).unwrap();
    eventually(|| h.session.active_source() == Some(SourceKind::Camera)).await;
}

#[tokio::test]
async fn screen_share_outranks_a_running_virtual_background() {
    let mut h = Harness::new(FakeTransport::new("me"), FakeSegmenter::ready());
    h.start().await;
    h.session.join("bob").await.unwrap();
    eventually(|| h.transport.calls_to("bob").len() == 1).await;

    h.session.set_background_mode(BackgroundMode::Blur).unwrap();
    eventually(|| h.session.active_source() == Some(SourceKind::Virtual)).await;

    assert!(h.session.toggle_screen_share().await.unwrap());
    eventually(|| h.session.active_source() == Some(SourceKind::Screen)).await;
    assert!(h.session.media_state().screen_sharing);
    assert!(h.session.compositor().is_running());

    let screen = h.devices.last_screen().unwrap();
    let screen_video = screen.video_track().unwrap().id();
    let call = h.transport.calls_to("bob").remove(0);
    eventually(|| call.current_track(TrackKind::Video) == Some(screen_video)).await;

    assert!(!h.session.toggle_screen_share().await.unwrap());
    eventually(|| h.session.active_source() == Some(SourceKind::Virtual)).await;
    assert!(!screen.is_live());
}

#[tokio::test]
async fn system_ended_share_falls_back() {
    let mut h = Harness::new(FakeTransport::new("me"), FakeSegmenter::loading());
    h.start().await;

    assert!(h.session.toggle_screen_share().await.unwrap());
    assert_eq!(h.session.active_source(), Some(SourceKind::Screen));

    h.devices.last_screen().unwrap().stop();
    eventually(|| h.session.active_source() == Some(SourceKind::Camera)).await;
    eventually(|| !h.session.media_state().screen_sharing).await;
}

#[tokio::test]
async fn mode_changes_never_run_two_compositor_loops() {
    let mut h = Harness::new(FakeTransport::new("me"), FakeSegmenter::ready());
    h.start().await;

    for _ in 0..6 {
        h.session.cycle_background().unwrap();
        assert!(h.session.compositor().running_loops() <= 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(h.session.compositor().running_loops() <= 1);
    }
    h.session.toggle_video().unwrap();
    h.session.toggle_video().unwrap();
    h.settle().await;
    assert_eq!(h.session.compositor().running_loops(), 1);
}

#[tokio::test]
async fn join_before_identity_fires_once() {
    let transport = FakeTransport::gated("me");
    let h = Harness::new(transport.clone(), FakeSegmenter::loading());

    let starters: Vec<_> = (0..2)
        .map(|_| {
            let session = h.session.clone();
            tokio::spawn(async move { session.start().await })
        })
        .collect();
    h.session.join("bob").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.calls_to("bob").is_empty());

    transport.release_identity();
    for starter in starters {
        assert_eq!(starter.await.unwrap().unwrap(), "me");
    }

    eventually(|| transport.calls_to("bob").len() == 1).await;
    h.settle().await;
    assert_eq!(transport.calls_to("bob").len(), 1);
    assert_eq!(transport.channels_to("bob").len(), 1);
    assert_eq!(transport.opens(), 1);
    assert_eq!(h.session.local_id().as_deref(), Some("me"));
}

#[tokio::test]
async fn duplicate_inbound_calls_yield_one_connection() {
    let mut h = Harness::new(FakeTransport::new("me"), FakeSegmenter::loading());
    h.start().await;

    let first = h.transport.inbound_call("carol", Some("Carol"));
    let second = h.transport.inbound_call("carol", Some("Carol"));
    h.transport
        .emit(huddle_client::transport::TransportEvent::IncomingCall(first.clone()));
    h.transport
        .emit(huddle_client::transport::TransportEvent::IncomingCall(second.clone()));

    eventually(|| first.is_answered() && second.is_closed()).await;
    assert!(!second.is_answered());
    assert_eq!(h.session.peers().connection_count().await, 1);

    h.transport.emit(h.transport.stream_event(&first));
    eventually(|| h.session.roster().len() == 2).await;
    let roster = h.session.roster();
    assert!(roster[0].is_local);
    assert_eq!(roster[1].display_name, "Carol");
}

#[tokio::test]
async fn muting_never_reopens_devices() {
    let mut h = Harness::new(FakeTransport::new("me"), FakeSegmenter::loading());
    h.start().await;
    h.session.join("bob").await.unwrap();
    eventually(|| h.transport.calls_to("bob").len() == 1).await;
    assert_eq!(h.devices.opens(), 2);

    assert!(!h.session.toggle_audio().unwrap());
    assert!(!h.session.toggle_video().unwrap());
    assert_eq!(
        h.session.media_state(),
        huddle_client::session::MediaState {
            audio: false,
            video: false,
            screen_sharing: false,
        }
    );
    assert!(h.session.toggle_audio().unwrap());
    assert!(h.session.toggle_video().unwrap());
    h.settle().await;

    assert_eq!(h.devices.opens(), 2);
    assert_eq!(h.devices.held(), 2);
    let call = h.transport.calls_to("bob").remove(0);
    assert_eq!(call.replacements(TrackKind::Audio), 0);
    assert_eq!(call.replacements(TrackKind::Video), 0);
}

#[tokio::test]
async fn denied_camera_reports_and_continues() {
    let h = Harness::new(FakeTransport::new("me"), FakeSegmenter::ready());
    h.devices.set_camera(Grant::Deny);
    let mut notices = h.session.subscribe_notices();

    assert_eq!(assert_ok!(h.session.start().await), "me");

    let notice = timeout(Duration::from_secs(1), notices.recv()).await.unwrap().unwrap();
    assert!(matches!(
        notice,
        Notice::Device {
            feature: Feature::Camera,
            ..
        }
    ));
    let state = h.session.media_state();
    assert!(!state.audio && !state.video);
    assert_eq!(h.session.active_source(), None);
    assert!(h.session.camera().is_none());
}

#[tokio::test]
async fn background_cycle_replaces_video_twice_per_connection() {
    let mut h = Harness::new(FakeTransport::new("me"), FakeSegmenter::ready());
    h.start().await;
    for peer in ["bob", "carol"] {
        h.session.join(peer).await.unwrap();
        eventually(|| h.transport.calls_to(peer).len() == 1).await;
    }
    let calls = h.transport.all_calls();
    assert_eq!(calls.len(), 2);

    assert_eq!(h.session.cycle_background().unwrap(), BackgroundMode::Blur);
    eventually(|| calls.iter().all(|c| c.replacements(TrackKind::Video) == 1)).await;

    // Blur to Image repaints the same virtual track
    assert_eq!(h.session.cycle_background().unwrap(), BackgroundMode::Image);
    h.settle().await;
    assert!(calls.iter().all(|c| c.replacements(TrackKind::Video) == 1));

    assert_eq!(h.session.cycle_background().unwrap(), BackgroundMode::None);
    eventually(|| calls.iter().all(|c| c.replacements(TrackKind::Video) == 2)).await;
    h.settle().await;

    let camera_video = h.session.camera().unwrap().video_track().unwrap().id();
    for call in &calls {
        assert_eq!(call.replacements(TrackKind::Video), 2);
        assert_eq!(call.replacements(TrackKind::Audio), 0);
        assert_eq!(call.current_track(TrackKind::Video), Some(camera_video));
    }
}

#[tokio::test]
async fn revoked_recording_capture_still_saves() {
    let dir = tempfile::tempdir().unwrap();
    let options = SessionOptions {
        recording: RecorderConfig {
            directory: dir.path().to_path_buf(),
            file_prefix: "standup".to_string(),
        },
        ..SessionOptions::default()
    };
    let mut h = Harness::with_options(FakeTransport::new("me"), FakeSegmenter::loading(), options);
    h.start().await;
    let mut recordings = h.session.subscribe_recordings();

    assert!(matches!(
        h.session.toggle_recording().await.unwrap(),
        RecordingToggle::Started
    ));
    assert!(h.session.is_recording());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let capture = h.devices.last_recording().unwrap();
    capture.video_track().unwrap().publish_video(video_frame(4, 2));
    tokio::time::sleep(Duration::from_millis(20)).await;
    // The user stops sharing from the OS
    capture.stop();

    let artifact = timeout(Duration::from_secs(2), recordings.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(artifact.path.starts_with(dir.path()));
    assert!(artifact.path.exists());
    assert!(artifact.size_bytes > 0);
    eventually(|| !h.session.is_recording()).await;

    // Camera is untouched
    assert_eq!(h.devices.held(), 2);
}

#[tokio::test]
async fn end_session_releases_everything_once() {
    let mut h = Harness::new(FakeTransport::new("me"), FakeSegmenter::ready());
    h.start().await;
    h.session.join("bob").await.unwrap();
    eventually(|| h.transport.calls_to("bob").len() == 1).await;
    h.session.toggle_screen_share().await.unwrap();

    let summary = assert_ok!(h.session.end_session().await);
    assert_eq!(summary.local_id.as_deref(), Some("me"));
    assert!(summary.recording.is_none());
    assert!(h.session.is_ended());
    h.session.wait_ended().await;

    assert_eq!(h.devices.held(), 0);
    assert!(h.transport.calls_to("bob")[0].is_closed());
    assert_eq!(h.session.active_source(), None);
    assert_err!(h.session.end_session().await);
    assert_err!(h.session.toggle_audio());
}

#[tokio::test]
async fn ending_during_camera_prompt_releases_the_camera() {
    let h = Harness::new(FakeTransport::new("me"), FakeSegmenter::ready());
    h.devices.hold_camera_prompt();

    let starter = {
        let session = h.session.clone();
        tokio::spawn(async move { session.start().await })
    };
    eventually(|| h.devices.camera_prompts() == 1).await;

    assert_ok!(h.session.end_session().await);
    h.devices.answer_camera_prompt();
    let started = timeout(Duration::from_secs(2), starter)
        .await
        .expect("start hung after end_session")
        .unwrap();

    assert_err!(started);
    assert!(h.session.camera().is_none());
    assert_eq!(h.devices.opens(), 2);
    assert_eq!(h.devices.held(), 0);
    assert_eq!(h.session.active_source(), None);
    assert_eq!(h.transport.opens(), 0);
}
