//! Virtual background compositor
//!
//! Reads frames from the camera's video track, asks the segmenter for a
//! person mask and publishes the composited frame on its own `Virtual`
//! source. The loop is paced by a tokio interval and exits on its own once
//! the active flag drops or a newer loop replaced it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use huddle_media::compositing::{self, BackgroundFill};
use huddle_media::{CompositeError, MediaFrame, SegmentationMask, VideoFrame};
use huddle_protocol::{BackgroundMode, SourceKind, TrackKind};
use image::RgbaImage;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CompositorSettings;
use crate::media::{MediaSource, MediaTrack};
use crate::session::segmentation::Segmenter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositorConfig {
    pub frame_interval: Duration,
    pub ready_backoff: Duration,
    pub blur_sigma: f32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self::from(&CompositorSettings::default())
    }
}

impl From<&CompositorSettings> for CompositorConfig {
    fn from(settings: &CompositorSettings) -> Self {
        Self {
            frame_interval: settings.frame_interval(),
            ready_backoff: settings.ready_backoff(),
            blur_sigma: settings.blur_sigma,
        }
    }
}

/// Load the replacement background, `None` degrades Image mode to blur
pub fn load_background(path: &Path) -> Option<Arc<RgbaImage>> {
    match image::open(path) {
        Ok(image) => {
            tracing::info!("Loaded background image {:?}", path);
            Some(Arc::new(image.to_rgba8()))
        }
        Err(e) => {
            tracing::warn!("Failed to load background image {:?}: {}. Falling back to blur.", path, e);
            None
        }
    }
}

#[derive(Clone)]
pub struct Compositor {
    inner: Arc<CompositorInner>,
}

struct CompositorInner {
    segmenter: Arc<dyn Segmenter>,
    config: CompositorConfig,
    background: Option<Arc<RgbaImage>>,
    mode: watch::Sender<BackgroundMode>,
    output: Arc<MediaSource>,
    output_ready: watch::Sender<bool>,
    is_running: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    running_loops: AtomicUsize,
    composited: AtomicU64,
}

impl CompositorInner {
    fn is_current(&self, generation: u64) -> bool {
        self.is_running.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Keeps the running loop count honest even when the task is aborted
struct LoopGuard(Arc<CompositorInner>);

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.running_loops.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Compositor {
    pub fn new(segmenter: Arc<dyn Segmenter>, config: CompositorConfig, background: Option<Arc<RgbaImage>>) -> Self {
        let output = MediaSource::new(
            SourceKind::Virtual,
            vec![MediaTrack::new(TrackKind::Video, "virtual background")],
        );
        let (mode, _) = watch::channel(BackgroundMode::None);
        let (output_ready, _) = watch::channel(false);

        Self {
            inner: Arc::new(CompositorInner {
                segmenter,
                config,
                background,
                mode,
                output,
                output_ready,
                is_running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                loop_task: Mutex::new(None),
                running_loops: AtomicUsize::new(0),
                composited: AtomicU64::new(0),
            }),
        }
    }

    /// The `Virtual` source frames are published on
    pub fn output(&self) -> Arc<MediaSource> {
        self.inner.output.clone()
    }

    /// Takes effect on the next composited frame
    pub fn set_mode(&self, mode: BackgroundMode) {
        self.inner.mode.send_replace(mode);
    }

    pub fn mode(&self) -> BackgroundMode {
        *self.inner.mode.borrow()
    }

    /// `true` once the current loop produced a frame, `false` after stop
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.inner.output_ready.subscribe()
    }

    pub fn has_output(&self) -> bool {
        *self.inner.output_ready.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// Frame loops currently alive
    pub fn running_loops(&self) -> usize {
        self.inner.running_loops.load(Ordering::SeqCst)
    }

    pub fn composited_frames(&self) -> u64 {
        self.inner.composited.load(Ordering::SeqCst)
    }

    /// Start compositing frames from `camera`.
    ///
    /// A previous loop is aborted first, so at most one loop is ever
    /// scheduled.
    pub fn start(&self, camera: Arc<MediaTrack>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            tracing::warn!("Compositor already closed, not starting");
            return;
        }

        let mut task = self.inner.loop_task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.is_running.store(true, Ordering::SeqCst);
        self.inner.running_loops.fetch_add(1, Ordering::SeqCst);

        let guard = LoopGuard(self.inner.clone());
        *task = Some(tokio::spawn(run_loop(guard, generation, camera)));
        tracing::info!("Compositor started (generation {})", generation);
    }

    /// Idempotent, safe before `start`
    pub fn stop(&self) {
        if self.inner.is_running.swap(false, Ordering::SeqCst) {
            tracing::info!("Compositor stopped");
        }
        self.inner.output_ready.send_replace(false);
    }

    /// Stop and end the virtual source for good
    pub fn close(&self) {
        self.stop();
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self
            .inner
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.inner.output.stop();
    }
}

async fn run_loop(guard: LoopGuard, generation: u64, camera: Arc<MediaTrack>) {
    let inner = guard.0.clone();
    let mut frames = camera.subscribe();
    let mut latest: Option<Arc<VideoFrame>> = None;
    let mut published_any = false;

    let mut ticker = tokio::time::interval(inner.config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !inner.is_current(generation) {
            break;
        }
        if !camera.is_live() {
            tracing::info!("Camera track ended, compositor loop exiting");
            break;
        }

        // Only the newest camera frame matters
        loop {
            match frames.try_recv() {
                Ok(MediaFrame::Video(frame)) => latest = Some(frame),
                Ok(MediaFrame::Audio(_)) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::trace!("Compositor skipped {} camera frames", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        if *inner.mode.borrow() == BackgroundMode::None {
            continue;
        }

        if !inner.segmenter.is_ready() {
            tracing::debug!("Segmenter not ready, retrying in {:?}", inner.config.ready_backoff);
            tokio::time::sleep(inner.config.ready_backoff).await;
            continue;
        }

        let Some(frame) = latest.take() else {
            continue;
        };

        let segmentation = inner.segmenter.segment(frame).await;
        if !inner.is_current(generation) {
            break;
        }
        let segmentation = match segmentation {
            Ok(segmentation) => segmentation,
            Err(e) => {
                tracing::warn!("Segmentation failed, retrying next tick: {}", e);
                continue;
            }
        };

        let mode = *inner.mode.borrow();
        let background = inner.background.clone();
        let sigma = inner.config.blur_sigma;
        let rendered = tokio::task::spawn_blocking(move || {
            render(&segmentation.image, &segmentation.mask, mode, background.as_deref(), sigma)
        })
        .await;
        if !inner.is_current(generation) {
            break;
        }

        match rendered {
            Ok(Ok(composited)) => {
                let Some(track) = inner.output.video_track() else {
                    break;
                };
                track.publish(MediaFrame::Video(Arc::new(composited)));
                let count = inner.composited.fetch_add(1, Ordering::SeqCst) + 1;
                if !published_any {
                    published_any = true;
                    inner.output_ready.send_replace(true);
                    tracing::info!("First virtual background frame published");
                }
                if count % 300 == 0 {
                    tracing::debug!("Composited {} frames", count);
                }
            }
            Ok(Err(e)) => tracing::warn!("Failed to composite frame: {}", e),
            Err(e) => tracing::warn!("Compositing task failed: {}", e),
        }
    }

    tracing::debug!("Compositor loop (generation {}) exited", generation);
    drop(guard);
}

fn render(
    frame: &VideoFrame,
    mask: &SegmentationMask,
    mode: BackgroundMode,
    background: Option<&RgbaImage>,
    sigma: f32,
) -> Result<VideoFrame, CompositeError> {
    let fill = match (mode, background) {
        (BackgroundMode::Image, Some(image)) => BackgroundFill::Image(image),
        _ => BackgroundFill::Blur { sigma },
    };
    compositing::composite_frame(frame, mask, &fill)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeSegmenter};

    fn fast_config() -> CompositorConfig {
        CompositorConfig {
            frame_interval: Duration::from_millis(5),
            ready_backoff: Duration::from_millis(20),
            blur_sigma: 2.0,
        }
    }

    fn camera_track() -> Arc<MediaTrack> {
        MediaTrack::new(TrackKind::Video, "camera")
    }

    /// Keep a camera track fed until the returned handle is aborted
    fn feed(track: Arc<MediaTrack>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                track.publish_video(testing::video_frame(8, 8));
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        })
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let compositor = Compositor::new(Arc::new(FakeSegmenter::ready()), fast_config(), None);
        compositor.stop();
        compositor.stop();
        assert!(!compositor.is_running());
        assert_eq!(compositor.running_loops(), 0);
    }

    #[tokio::test]
    async fn restarts_never_leave_two_loops() {
        let compositor = Compositor::new(Arc::new(FakeSegmenter::ready()), fast_config(), None);
        let camera = camera_track();

        for _ in 0..10 {
            compositor.start(camera.clone());
            compositor.stop();
            compositor.start(camera.clone());
            tokio::task::yield_now().await;
        }

        testing::eventually(|| compositor.running_loops() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(compositor.running_loops(), 1);
        compositor.stop();
        testing::eventually(|| compositor.running_loops() == 0).await;
    }

    #[tokio::test]
    async fn waits_for_segmenter_then_publishes() {
        let segmenter = Arc::new(FakeSegmenter::loading());
        let compositor = Compositor::new(segmenter.clone(), fast_config(), None);
        compositor.set_mode(BackgroundMode::Blur);
        let camera = camera_track();
        let feeder = feed(camera.clone());
        let mut output = compositor.output().video_track().unwrap().subscribe();

        compositor.start(camera);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(segmenter.calls(), 0);
        assert!(!compositor.has_output());

        segmenter.set_ready(true);
        testing::eventually(|| compositor.has_output()).await;
        assert!(matches!(output.recv().await.unwrap(), MediaFrame::Video(_)));

        feeder.abort();
        compositor.close();
    }

    #[tokio::test]
    async fn mode_none_skips_segmentation() {
        let segmenter = Arc::new(FakeSegmenter::ready());
        let compositor = Compositor::new(segmenter.clone(), fast_config(), None);
        let camera = camera_track();
        let feeder = feed(camera.clone());

        compositor.start(camera);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(segmenter.calls(), 0);

        compositor.set_mode(BackgroundMode::Image);
        testing::eventually(|| compositor.composited_frames() > 0).await;

        feeder.abort();
        compositor.close();
    }

    #[tokio::test]
    async fn segmentation_failures_are_retried() {
        let segmenter = Arc::new(FakeSegmenter::ready());
        segmenter.fail_next(3);
        let compositor = Compositor::new(segmenter.clone(), fast_config(), None);
        compositor.set_mode(BackgroundMode::Blur);
        let camera = camera_track();
        let feeder = feed(camera.clone());

        compositor.start(camera);
        testing::eventually(|| compositor.composited_frames() > 0).await;
        assert!(segmenter.calls() >= 4);

        feeder.abort();
        compositor.close();
    }

    #[tokio::test]
    async fn one_composite_per_segmentation() {
        let segmenter = Arc::new(FakeSegmenter::ready());
        let compositor = Compositor::new(segmenter.clone(), fast_config(), None);
        compositor.set_mode(BackgroundMode::Blur);
        let camera = camera_track();
        let feeder = feed(camera.clone());

        compositor.start(camera);
        testing::eventually(|| compositor.composited_frames() >= 5).await;
        feeder.abort();
        compositor.stop();
        testing::eventually(|| compositor.running_loops() == 0).await;

        // Results that landed after stop are discarded, never doubled
        assert!(compositor.composited_frames() <= segmenter.successes());
        assert!(segmenter.successes() - compositor.composited_frames() <= 1);
    }

    #[test]
    fn image_mode_without_background_blurs() {
        let frame = testing::video_frame(8, 8);
        let mask = SegmentationMask::filled(8, 8, 0);
        let out = render(&frame, &mask, BackgroundMode::Image, None, 2.0).unwrap();
        assert_eq!((out.width, out.height), (8, 8));
    }

    #[test]
    fn unreadable_background_is_none() {
        assert!(load_background(Path::new("/no/such/background.png")).is_none());
    }
}
