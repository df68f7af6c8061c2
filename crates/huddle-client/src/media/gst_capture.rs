//! GStreamer capture devices
//!
//! Each track is backed by its own pipeline ending in an `appsink`. The
//! pipeline is the track's device lease: stopping the track sets it to
//! `Null`, and a pipeline that dies on its own (EOS, device unplugged,
//! permission revoked) ends the track.
//!
//! Platform sources:
//! - macOS: avfvideosrc (camera and `capture-screen=true`)
//! - Linux: v4l2src, ximagesrc
//! - Windows: ksvideosrc, d3d11screencapturesrc

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use huddle_media::{AudioChunk, MediaFrame, PixelFormat, VideoFrame, audio};
use huddle_protocol::{SourceKind, TrackKind};

use crate::error::DeviceError;
use crate::media::{CameraRequest, DeviceLease, MediaDevices, MediaSource, MediaTrack};

fn camera_pipeline(device_index: u32) -> String {
    #[cfg(target_os = "macos")]
    let source = format!("avfvideosrc device-index={}", device_index);

    #[cfg(target_os = "windows")]
    let source = format!("ksvideosrc device-index={}", device_index);

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let source = format!("v4l2src device=/dev/video{}", device_index);

    // The caps filter must come after videoconvert to force RGBA output
    format!("{} ! videoconvert ! video/x-raw,format=RGBA ! videoscale ! appsink name=sink", source)
}

fn screen_pipeline() -> String {
    #[cfg(target_os = "macos")]
    let source = "avfvideosrc capture-screen=true capture-screen-cursor=true";

    #[cfg(target_os = "windows")]
    let source = "d3d11screencapturesrc show-cursor=true ! d3d11download";

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let source = "ximagesrc show-pointer=true use-damage=false";

    format!(
        "{} ! videorate ! video/x-raw,framerate=30/1 ! videoconvert ! video/x-raw,format=RGBA ! appsink name=sink",
        source
    )
}

fn microphone_pipeline() -> String {
    format!(
        "autoaudiosrc ! audioconvert ! audioresample ! \
         audio/x-raw,format=S16LE,rate={},channels={},layout=interleaved ! \
         appsink name=sink",
        audio::SAMPLE_RATE,
        audio::CHANNELS
    )
}

/// Sort a GStreamer error into what the session can act on
fn classify(message: &str) -> DeviceError {
    let lower = message.to_lowercase();
    if lower.contains("cancel") {
        DeviceError::Cancelled
    } else if lower.contains("permission") || lower.contains("not authorized") || lower.contains("denied") {
        DeviceError::PermissionDenied(message.to_string())
    } else if lower.contains("busy") {
        DeviceError::Busy(message.to_string())
    } else {
        DeviceError::Unavailable(message.to_string())
    }
}

/// A running pipeline owned by one track
struct PipelineLease {
    pipeline: gst::Pipeline,
    running: Arc<AtomicBool>,
}

impl DeviceLease for PipelineLease {
    fn release(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.pipeline.set_state(gst::State::Null);
        tracing::info!("Capture pipeline {} stopped", self.pipeline.name());
    }
}

fn launch(description: &str) -> std::result::Result<(gst::Pipeline, gst_app::AppSink), DeviceError> {
    let build = || -> Result<(gst::Pipeline, gst_app::AppSink)> {
        let pipeline = gst::parse::launch(description)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("Failed to downcast to Pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| anyhow!("Could not find appsink"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| anyhow!("Failed to downcast to AppSink"))?;

        appsink.set_property("sync", false);
        appsink.set_property("max-buffers", 2u32);
        appsink.set_property("drop", true);
        Ok((pipeline, appsink))
    };
    let (pipeline, appsink) = build().map_err(|e| DeviceError::Backend(e.to_string()))?;

    tracing::info!("Starting capture pipeline: {}", description);
    if pipeline.set_state(gst::State::Playing).is_err() {
        let error = first_bus_error(&pipeline).unwrap_or_else(|| "failed to start pipeline".to_string());
        let _ = pipeline.set_state(gst::State::Null);
        return Err(classify(&error));
    }

    let (state_result, _current, _pending) = pipeline.state(gst::ClockTime::from_seconds(2));
    if let Some(error) = first_bus_error(&pipeline) {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(classify(&error));
    }
    if state_result.is_err() {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(DeviceError::Unavailable("pipeline failed to reach Playing state".to_string()));
    }

    Ok((pipeline, appsink))
}

fn first_bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    while let Some(msg) = bus.pop() {
        if let gst::MessageView::Error(err) = msg.view() {
            return Some(format!("{} ({:?})", err.error(), err.debug()));
        }
    }
    None
}

fn to_frame(kind: TrackKind, sample: &gst::Sample) -> Option<MediaFrame> {
    let buffer = sample.buffer()?;
    let timestamp = buffer
        .pts()
        .map(|pts| Duration::from_nanos(pts.nseconds()))
        .unwrap_or_default();
    let map = buffer.map_readable().ok()?;

    match kind {
        TrackKind::Video => {
            let info = gst_video::VideoInfo::from_caps(sample.caps()?).ok()?;
            let frame = VideoFrame::new(
                info.width(),
                info.height(),
                PixelFormat::Rgba,
                map.as_slice().to_vec(),
                timestamp,
            );
            frame.is_well_formed().then(|| frame.into())
        }
        TrackKind::Audio => {
            let samples = map
                .as_slice()
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            Some(
                AudioChunk {
                    sample_rate: audio::SAMPLE_RATE,
                    channels: audio::CHANNELS as u16,
                    samples,
                    timestamp,
                }
                .into(),
            )
        }
    }
}

/// Start `description` and publish what its appsink produces on a new track
fn open_track(kind: TrackKind, label: &str, description: &str) -> std::result::Result<Arc<MediaTrack>, DeviceError> {
    let (pipeline, appsink) = launch(description)?;
    let running = Arc::new(AtomicBool::new(true));
    let lease = Arc::new(PipelineLease {
        pipeline: pipeline.clone(),
        running: running.clone(),
    });
    let track = MediaTrack::with_lease(kind, label, lease);

    let weak: Weak<MediaTrack> = Arc::downgrade(&track);
    let mut frame_count = 0u64;
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let Some(track) = weak.upgrade() else {
                    return Err(gst::FlowError::Eos);
                };
                frame_count += 1;
                if frame_count % 300 == 1 {
                    tracing::debug!("{} captured frame {}", track.label(), frame_count);
                }
                if let Some(frame) = to_frame(kind, &sample) {
                    track.publish(frame);
                }
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    watch_bus(pipeline, running, Arc::downgrade(&track));
    Ok(track)
}

/// End the track when the pipeline dies underneath it
fn watch_bus(pipeline: gst::Pipeline, running: Arc<AtomicBool>, track: Weak<MediaTrack>) {
    let Some(bus) = pipeline.bus() else {
        return;
    };
    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(250)) else {
                continue;
            };
            let reason = match msg.view() {
                gst::MessageView::Eos(_) => "end of stream".to_string(),
                gst::MessageView::Error(err) => format!("{} ({:?})", err.error(), err.debug()),
                _ => continue,
            };
            if let Some(track) = track.upgrade() {
                tracing::warn!("Capture for {} ended: {}", track.label(), reason);
                track.stop();
            }
            break;
        }
    });
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> std::result::Result<T, DeviceError> + Send + 'static,
) -> std::result::Result<T, DeviceError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeviceError::Backend(format!("capture task failed: {}", e)))?
}

/// Capture devices backed by GStreamer
pub struct GstDevices;

impl GstDevices {
    pub fn new() -> Result<Self> {
        gst::init()?;
        Ok(Self)
    }
}

#[async_trait]
impl MediaDevices for GstDevices {
    async fn open_camera(&self, request: CameraRequest) -> std::result::Result<Arc<MediaSource>, DeviceError> {
        blocking(move || {
            let mut tracks = Vec::new();
            if request.video {
                let index = request.device_index.unwrap_or(0);
                tracks.push(open_track(TrackKind::Video, "camera", &camera_pipeline(index))?);
            }
            if request.audio {
                match open_track(TrackKind::Audio, "microphone", &microphone_pipeline()) {
                    Ok(track) => tracks.push(track),
                    // Still usable as a camera-only source
                    Err(e) if !tracks.is_empty() => tracing::warn!("Microphone unavailable: {}", e),
                    Err(e) => return Err(e),
                }
            }
            Ok(MediaSource::new(SourceKind::Camera, tracks))
        })
        .await
    }

    async fn open_screen(&self) -> std::result::Result<Arc<MediaSource>, DeviceError> {
        blocking(|| {
            let video = open_track(TrackKind::Video, "screen", &screen_pipeline())?;
            Ok(MediaSource::new(SourceKind::Screen, vec![video]))
        })
        .await
    }

    async fn open_recording_capture(&self) -> std::result::Result<Arc<MediaSource>, DeviceError> {
        blocking(|| {
            let video = open_track(TrackKind::Video, "recording screen", &screen_pipeline())?;
            let mut tracks = vec![video];
            match open_track(TrackKind::Audio, "recording audio", &microphone_pipeline()) {
                Ok(audio) => tracks.push(audio),
                Err(e) => tracing::warn!("Recording without audio: {}", e),
            }
            Ok(MediaSource::new(SourceKind::Screen, tracks))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_classified() {
        assert!(classify("User cancelled the capture").is_cancelled());
        assert!(matches!(
            classify("Screen recording permission denied"),
            DeviceError::PermissionDenied(_)
        ));
        assert!(matches!(classify("Device or resource busy"), DeviceError::Busy(_)));
        assert!(matches!(classify("No such device"), DeviceError::Unavailable(_)));
    }

    #[test]
    fn pipelines_end_in_appsink() {
        for pipeline in [camera_pipeline(1), screen_pipeline(), microphone_pipeline()] {
            assert!(pipeline.ends_with("appsink name=sink"), "{}", pipeline);
        }
        assert!(microphone_pipeline().contains("rate=48000,channels=2"));
    }
}
