//! Local recording
//!
//! Records a dedicated screen + audio capture, separate from whatever is
//! being sent to peers. Chunks from the container encoder are collected in
//! memory and written out as one file when the recording stops, either on
//! request or because the capture ended underneath us.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_media::{ContainerEncoder, ContainerEncoderFactory, MediaFrame, RecordingFormat, artifact_file_name, select_format};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RecordingSettings;
use crate::error::{Result, SessionError};
use crate::media::{MediaDevices, MediaSource, MediaTrack};
use crate::session::notice::Notice;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
}

impl From<&RecordingSettings> for RecorderConfig {
    fn from(settings: &RecordingSettings) -> Self {
        Self {
            directory: settings.directory.clone(),
            file_prefix: settings.file_prefix.clone(),
        }
    }
}

/// A finished recording on disk
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingArtifact {
    pub path: PathBuf,
    pub format: RecordingFormat,
    pub size_bytes: u64,
    pub chunk_count: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordingState {
    Idle,
    Recording {
        started_at: DateTime<Utc>,
        format: RecordingFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStart {
    Started,
    AlreadyRecording,
    /// The user dismissed the capture prompt
    Cancelled,
}

struct ActiveRecording {
    id: Uuid,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<RecordingArtifact>>,
}

struct RecorderInner {
    devices: Arc<dyn MediaDevices>,
    encoders: Arc<dyn ContainerEncoderFactory>,
    config: RecorderConfig,
    active: Mutex<Option<ActiveRecording>>,
    state: watch::Sender<RecordingState>,
    finished: broadcast::Sender<RecordingArtifact>,
    notices: broadcast::Sender<Notice>,
}

impl RecorderInner {
    /// Forget recording `id` unless a newer one already took its place
    async fn clear(&self, id: Uuid) {
        let mut active = self.active.lock().await;
        match active.as_ref() {
            Some(current) if current.id == id => *active = None,
            Some(_) => return,
            None => {}
        }
        self.state.send_replace(RecordingState::Idle);
    }
}

#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl Recorder {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        encoders: Arc<dyn ContainerEncoderFactory>,
        config: RecorderConfig,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        let (state, _) = watch::channel(RecordingState::Idle);
        let (finished, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(RecorderInner {
                devices,
                encoders,
                config,
                active: Mutex::new(None),
                state,
                finished,
                notices,
            }),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(*self.inner.state.borrow(), RecordingState::Recording { .. })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RecordingState> {
        self.inner.state.subscribe()
    }

    /// Every artifact, including ones from recordings that stopped on their own
    pub fn subscribe_finished(&self) -> broadcast::Receiver<RecordingArtifact> {
        self.inner.finished.subscribe()
    }

    /// Start recording. A no-op while a recording is active or starting.
    pub async fn start(&self) -> Result<RecordingStart> {
        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            tracing::debug!("Recording already active");
            return Ok(RecordingStart::AlreadyRecording);
        }

        let encoders = self.inner.encoders.clone();
        let format = select_format(|f| encoders.supports(f))
            .ok_or_else(|| SessionError::Recording("no supported recording format".to_string()))?;

        let capture = match self.inner.devices.open_recording_capture().await {
            Ok(capture) => capture,
            Err(e) if e.is_cancelled() => {
                tracing::info!("Recording capture prompt dismissed");
                return Ok(RecordingStart::Cancelled);
            }
            Err(e) => return Err(e.into()),
        };

        let encoder = match self.inner.encoders.create(&format) {
            Ok(encoder) => encoder,
            Err(e) => {
                capture.stop();
                return Err(e.into());
            }
        };

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(record(self.inner.clone(), id, capture, encoder, started_at, stop_rx));

        *active = Some(ActiveRecording { id, stop_tx, task });
        self.inner
            .state
            .send_replace(RecordingState::Recording { started_at, format });
        tracing::info!("Recording started ({})", format.mime_type());
        Ok(RecordingStart::Started)
    }

    /// Stop and write the artifact. `None` when nothing was recording.
    pub async fn stop(&self) -> Result<Option<RecordingArtifact>> {
        let Some(active) = self.inner.active.lock().await.take() else {
            return Ok(None);
        };

        let _ = active.stop_tx.send(());
        match active.task.await {
            Ok(result) => result.map(Some),
            Err(e) => {
                self.inner.state.send_replace(RecordingState::Idle);
                Err(SessionError::Recording(format!("recording task failed: {}", e)))
            }
        }
    }
}

async fn record(
    inner: Arc<RecorderInner>,
    id: Uuid,
    capture: Arc<MediaSource>,
    mut encoder: Box<dyn ContainerEncoder>,
    started_at: DateTime<Utc>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<RecordingArtifact> {
    let (frame_tx, mut frames) = mpsc::channel::<MediaFrame>(64);
    let forwarders: Vec<_> = capture
        .tracks()
        .iter()
        .map(|track| forward(track.clone(), frame_tx.clone()))
        .collect();
    drop(frame_tx);

    let mut capture_ended = capture
        .video_track()
        .or_else(|| capture.tracks().first())
        .map(|track| track.ended());

    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut frame_count: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ended(&mut capture_ended) => {
                tracing::info!("Recording capture ended, stopping recording");
                break;
            }
            frame = frames.recv() => match frame {
                Some(frame) => {
                    frame_count += 1;
                    match encoder.push(&frame) {
                        Ok(Some(chunk)) => chunks.push(chunk),
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Dropping {} frame from recording: {}", frame.kind(), e),
                    }
                }
                None => {
                    tracing::info!("All recording tracks ended");
                    break;
                }
            }
        }
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
    match encoder.finish() {
        Ok(tail) if !tail.is_empty() => chunks.push(tail),
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to finalize recording encoder: {}", e),
    }
    capture.stop();
    tracing::debug!("Recording consumed {} frames into {} chunks", frame_count, chunks.len());

    let artifact = write_artifact(&inner.config, started_at, encoder.format(), chunks).await;
    inner.clear(id).await;

    match &artifact {
        Ok(artifact) => {
            tracing::info!("Recording saved to {:?} ({} bytes)", artifact.path, artifact.size_bytes);
            let _ = inner.finished.send(artifact.clone());
        }
        Err(e) => {
            tracing::error!("Failed to save recording: {}", e);
            let _ = inner.notices.send(Notice::Recording { message: e.to_string() });
        }
    }
    artifact
}

async fn ended(receiver: &mut Option<watch::Receiver<bool>>) {
    match receiver {
        Some(receiver) => {
            let _ = receiver.wait_for(|ended| *ended).await;
        }
        None => std::future::pending().await,
    }
}

/// Copy frames from one capture track into the encoder queue
fn forward(track: Arc<MediaTrack>, tx: mpsc::Sender<MediaFrame>) -> JoinHandle<()> {
    let mut frames = track.subscribe();
    let mut ended = track.ended();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Recording skipped {} {} frames", skipped, track.kind());
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = async { let _ = ended.wait_for(|ended| *ended).await; } => break,
            }
        }
    })
}

async fn write_artifact(
    config: &RecorderConfig,
    started_at: DateTime<Utc>,
    format: RecordingFormat,
    chunks: Vec<Vec<u8>>,
) -> Result<RecordingArtifact> {
    tokio::fs::create_dir_all(&config.directory).await?;
    let path = unique_path(&config.directory, &artifact_file_name(&config.file_prefix, started_at, &format)).await?;

    let chunk_count = chunks.len();
    let data = chunks.concat();
    tokio::fs::write(&path, &data).await?;

    Ok(RecordingArtifact {
        path,
        format,
        size_bytes: data.len() as u64,
        chunk_count,
        started_at,
    })
}

/// `name` inside `directory`, suffixed `-1`, `-2`, ... if already taken
async fn unique_path(directory: &Path, name: &str) -> Result<PathBuf> {
    let candidate = directory.join(name);
    if !tokio::fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    for n in 1..1000 {
        let candidate = directory.join(format!("{}-{}.{}", stem, n, ext));
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(SessionError::Recording(format!("no free file name for {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeDevices, Grant, MemoryEncoderFactory};
    use huddle_media::{Container, VideoCodec};
    use std::time::Duration;

    fn recorder(devices: Arc<FakeDevices>, dir: &Path) -> (Recorder, broadcast::Receiver<Notice>) {
        let (notices, rx) = broadcast::channel(8);
        let recorder = Recorder::new(
            devices,
            Arc::new(MemoryEncoderFactory::new()),
            RecorderConfig {
                directory: dir.to_path_buf(),
                file_prefix: "test-recording".to_string(),
            },
            notices,
        );
        (recorder, rx)
    }

    #[tokio::test]
    async fn stop_writes_collected_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let devices = FakeDevices::new();
        let (recorder, _) = recorder(devices.clone(), dir.path());

        assert_eq!(recorder.start().await.unwrap(), RecordingStart::Started);
        assert!(recorder.is_recording());
        let capture = devices.last_recording().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        capture.video_track().unwrap().publish_video(testing::video_frame(4, 2));
        capture.audio_track().unwrap().publish(testing::audio_chunk().into());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let artifact = recorder.stop().await.unwrap().unwrap();
        let contents = std::fs::read_to_string(&artifact.path).unwrap();
        assert!(contents.contains("V4x2;"));
        assert!(contents.contains("A1920;"));
        assert!(contents.ends_with("END"));
        assert_eq!(artifact.chunk_count, 3);
        assert!(artifact.path.file_name().unwrap().to_str().unwrap().starts_with("test-recording-"));
        assert_eq!(artifact.path.extension().unwrap(), "webm");

        assert!(!recorder.is_recording());
        assert!(!capture.is_live());
        assert_eq!(devices.held(), 0);
    }

    #[tokio::test]
    async fn second_start_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let devices = FakeDevices::new();
        let (recorder, _) = recorder(devices.clone(), dir.path());

        recorder.start().await.unwrap();
        assert_eq!(recorder.start().await.unwrap(), RecordingStart::AlreadyRecording);
        assert_eq!(devices.opens(), 2);

        recorder.stop().await.unwrap();
        assert!(recorder.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dismissed_prompt_leaves_recording_off() {
        let dir = tempfile::tempdir().unwrap();
        let devices = FakeDevices::new();
        devices.set_recording(Grant::Cancel);
        let (recorder, mut notices) = recorder(devices.clone(), dir.path());

        assert_eq!(recorder.start().await.unwrap(), RecordingStart::Cancelled);
        assert!(!recorder.is_recording());
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn denied_capture_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let devices = FakeDevices::new();
        devices.set_recording(Grant::Deny);
        let (recorder, _) = recorder(devices.clone(), dir.path());

        assert!(matches!(recorder.start().await, Err(SessionError::Device(_))));
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn revoked_capture_stops_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let devices = FakeDevices::new();
        let (recorder, _) = recorder(devices.clone(), dir.path());
        let mut finished = recorder.subscribe_finished();

        recorder.start().await.unwrap();
        let capture = devices.last_recording().unwrap();
        capture.video_track().unwrap().stop();

        let artifact = tokio::time::timeout(Duration::from_secs(2), finished.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(artifact.path.exists());
        testing::eventually(|| !recorder.is_recording()).await;
        assert_eq!(devices.held(), 0);
    }

    #[tokio::test]
    async fn unsupported_host_cannot_record() {
        let dir = tempfile::tempdir().unwrap();
        let (notices, _) = broadcast::channel(8);
        let recorder = Recorder::new(
            FakeDevices::new(),
            Arc::new(MemoryEncoderFactory::supporting(vec![])),
            RecorderConfig {
                directory: dir.path().to_path_buf(),
                file_prefix: "x".to_string(),
            },
            notices,
        );
        assert!(matches!(recorder.start().await, Err(SessionError::Recording(_))));
    }

    #[tokio::test]
    async fn picks_mp4_when_only_mp4_is_available() {
        let dir = tempfile::tempdir().unwrap();
        let (notices, _) = broadcast::channel(8);
        let mp4 = RecordingFormat::new(Container::Mp4, VideoCodec::H264, None);
        let recorder = Recorder::new(
            FakeDevices::new(),
            Arc::new(MemoryEncoderFactory::supporting(vec![mp4])),
            RecorderConfig {
                directory: dir.path().to_path_buf(),
                file_prefix: "x".to_string(),
            },
            notices,
        );
        recorder.start().await.unwrap();
        let artifact = recorder.stop().await.unwrap().unwrap();
        assert_eq!(artifact.format, mp4);
        assert_eq!(artifact.path.extension().unwrap(), "mp4");
    }

    #[tokio::test]
    async fn same_second_recordings_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let name = "clip-20260101T000000Z.webm";
        std::fs::write(dir.path().join(name), b"old").unwrap();

        let path = unique_path(dir.path(), name).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "clip-20260101T000000Z-1.webm");
    }
}
