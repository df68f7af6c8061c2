//! Track pump
//!
//! Feeds one outgoing `TrackLocalStaticSample` from whichever `MediaTrack`
//! is currently attached. Swapping the attached track is how calls change
//! what they send without renegotiating.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use huddle_media::{AudioEncoder, EncodedPacket, EncoderError, EncoderFactory, MediaFrame, VideoEncoder};
use huddle_protocol::TrackKind;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::media::MediaTrack;

const VIDEO_FPS: u32 = 30;

/// Frames between repeated encoder error logs
const ERROR_LOG_EVERY: u64 = 100;

#[derive(Debug, thiserror::Error)]
enum PumpError {
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error("failed to write sample: {0}")]
    Write(#[from] webrtc::Error),
}

pub struct TrackPump {
    kind: TrackKind,
    source: watch::Sender<Option<Arc<MediaTrack>>>,
    task: JoinHandle<()>,
}

impl TrackPump {
    pub fn spawn(
        kind: TrackKind,
        output: Arc<TrackLocalStaticSample>,
        encoders: Arc<dyn EncoderFactory>,
        initial: Option<Arc<MediaTrack>>,
    ) -> Self {
        let (source, source_rx) = watch::channel(initial);
        let task = tokio::spawn(run(kind, output, encoders, source_rx));
        Self { kind, source, task }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Attach `track`, or send nothing with `None`
    pub fn set_source(&self, track: Option<Arc<MediaTrack>>) {
        tracing::debug!(
            "Pump for {} now reads {:?}",
            self.kind,
            track.as_ref().map(|t| t.label().to_string())
        );
        self.source.send_replace(track);
    }
}

impl Drop for TrackPump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct Encoders {
    video: Option<Box<dyn VideoEncoder>>,
    audio: Option<Box<dyn AudioEncoder>>,
}

impl Encoders {
    fn encode(&mut self, factory: &dyn EncoderFactory, frame: &MediaFrame) -> Result<Vec<EncodedPacket>, EncoderError> {
        match frame {
            MediaFrame::Video(frame) => {
                let size = (frame.width, frame.height);
                if self.video.as_ref().map(|e| e.dimensions()) != Some(size) {
                    tracing::info!("Creating {:?} encoder for {}x{}", factory.video_codec(), size.0, size.1);
                    self.video = Some(factory.video_encoder(size.0, size.1, VIDEO_FPS)?);
                }
                match self.video.as_mut() {
                    Some(encoder) => encoder.encode(frame),
                    None => Ok(Vec::new()),
                }
            }
            MediaFrame::Audio(chunk) => {
                if self.audio.is_none() {
                    self.audio = Some(factory.audio_encoder()?);
                }
                match self.audio.as_mut() {
                    Some(encoder) => encoder.encode(chunk),
                    None => Ok(Vec::new()),
                }
            }
        }
    }
}

async fn run(
    kind: TrackKind,
    output: Arc<TrackLocalStaticSample>,
    factory: Arc<dyn EncoderFactory>,
    mut source: watch::Receiver<Option<Arc<MediaTrack>>>,
) {
    let mut encoders = Encoders::default();
    let mut failures: u64 = 0;

    loop {
        let current = source.borrow_and_update().clone();
        let Some(track) = current else {
            if source.changed().await.is_err() {
                return;
            }
            continue;
        };

        let mut frames = track.subscribe();
        // The next source starts with a keyframe
        if let Some(video) = encoders.video.as_mut() {
            video.force_keyframe();
        }

        loop {
            tokio::select! {
                changed = source.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                frame = frames.recv() => match frame {
                    Ok(frame) if frame.kind() == kind => {
                        if let Err(e) = pump(&mut encoders, factory.as_ref(), &output, &frame).await {
                            if failures % ERROR_LOG_EVERY == 0 {
                                tracing::warn!("Dropping {} frame: {}", kind, e);
                            }
                            failures += 1;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("{} pump skipped {} frames", kind, skipped);
                    }
                    Err(RecvError::Closed) => {
                        // Track gone; idle until something else is attached
                        if source.changed().await.is_err() {
                            return;
                        }
                        break;
                    }
                },
            }
        }
    }
}

async fn pump(
    encoders: &mut Encoders,
    factory: &dyn EncoderFactory,
    output: &TrackLocalStaticSample,
    frame: &MediaFrame,
) -> Result<(), PumpError> {
    let fallback = match frame {
        MediaFrame::Video(_) => Duration::from_millis(1000 / u64::from(VIDEO_FPS)),
        MediaFrame::Audio(chunk) => chunk.duration(),
    };

    for packet in encoders.encode(factory, frame)? {
        let sample = Sample {
            data: Bytes::from(packet.data),
            duration: if packet.duration.is_zero() { fallback } else { packet.duration },
            ..Default::default()
        };
        output.write_sample(&sample).await?;
    }
    Ok(())
}
