//! GStreamer-based encoders
//!
//! Live call video is VP8 from `vp8enc`, tuned for realtime. Audio goes
//! through libopus directly. Recordings run one muxing pipeline per
//! recording, fed from `appsrc` and drained from `appsink`.

use std::fmt::Display;
use std::time::Duration;

use anyhow::{Result, anyhow};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use huddle_media::{
    AudioChunk, AudioCodec, AudioEncoder, Container, ContainerEncoder, ContainerEncoderFactory, EncodedPacket,
    EncoderError, EncoderFactory, MediaFrame, RecordingFormat, VideoCodec, VideoEncoder, VideoFrame, audio,
};

const RECORDING_FPS: u32 = 30;

fn backend(e: impl Display) -> EncoderError {
    EncoderError::Backend(e.to_string())
}

fn launch(description: &str) -> Result<(gst::Pipeline, gst_app::AppSink)> {
    let pipeline = gst::parse::launch(description)?
        .downcast::<gst::Pipeline>()
        .map_err(|_| anyhow!("Failed to downcast to Pipeline"))?;

    let appsink = pipeline
        .by_name("sink")
        .ok_or_else(|| anyhow!("Could not find appsink"))?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| anyhow!("Failed to downcast to AppSink"))?;

    Ok((pipeline, appsink))
}

fn appsrc(pipeline: &gst::Pipeline, name: &str) -> Result<gst_app::AppSrc> {
    pipeline
        .by_name(name)
        .ok_or_else(|| anyhow!("Could not find appsrc {}", name))?
        .downcast::<gst_app::AppSrc>()
        .map_err(|_| anyhow!("Failed to downcast to AppSrc"))
}

fn start(pipeline: &gst::Pipeline) -> Result<()> {
    pipeline.set_state(gst::State::Playing)?;

    if let Some(bus) = pipeline.bus() {
        while let Some(msg) = bus.pop() {
            if let gst::MessageView::Error(err) = msg.view() {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(anyhow!("Encoder pipeline failed: {} ({:?})", err.error(), err.debug()));
            }
        }
    }
    Ok(())
}

fn buffer_from(data: &[u8], timestamp: Duration) -> Result<gst::Buffer, EncoderError> {
    let mut buffer = gst::Buffer::with_size(data.len()).map_err(backend)?;
    {
        let buffer_ref = buffer
            .get_mut()
            .ok_or_else(|| backend("Failed to get buffer mut"))?;
        buffer_ref.set_pts(gst::ClockTime::from_nseconds(timestamp.as_nanos() as u64));
        let mut map = buffer_ref.map_writable().map_err(backend)?;
        map.copy_from_slice(data);
    }
    Ok(buffer)
}

fn rgba_caps(width: u32, height: u32, fps: u32) -> Result<gst::Caps, EncoderError> {
    gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgba, width, height)
        .fps(gst::Fraction::new(fps as i32, 1))
        .build()
        .and_then(|info| info.to_caps())
        .map_err(backend)
}

/// VP8 encoder for outgoing call video
pub struct GstVp8Encoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    encoder: gst::Element,
    width: u32,
    height: u32,
    fps: u32,
}

impl GstVp8Encoder {
    pub fn new(width: u32, height: u32, fps: u32) -> Result<Self> {
        let bitrate = Self::calculate_bitrate(width, height, fps);

        let pipeline_str = format!(
            "appsrc name=src format=time is-live=true do-timestamp=true \
             caps=video/x-raw,format=RGBA,width={},height={},framerate={}/1 ! \
             videoconvert ! video/x-raw,format=I420 ! \
             vp8enc name=encoder deadline=1 cpu-used=8 end-usage=cbr target-bitrate={} \
             keyframe-max-dist={} error-resilient=partitions lag-in-frames=0 ! \
             appsink name=sink sync=false max-buffers=4 drop=false",
            width,
            height,
            fps,
            bitrate,
            fps * 2
        );

        tracing::info!(
            "Creating VP8 encoder for {}x{} @{}fps, {}kbps",
            width,
            height,
            fps,
            bitrate / 1000
        );

        let (pipeline, appsink) = launch(&pipeline_str)?;
        let appsrc = appsrc(&pipeline, "src")?;
        let encoder = pipeline
            .by_name("encoder")
            .ok_or_else(|| anyhow!("Failed to find encoder element in pipeline"))?;

        start(&pipeline)?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            encoder,
            width,
            height,
            fps,
        })
    }

    fn calculate_bitrate(width: u32, height: u32, fps: u32) -> u32 {
        let pixels = width * height;
        let base_bitrate = if pixels >= 1920 * 1080 {
            2_500_000
        } else if pixels >= 1280 * 720 {
            1_200_000
        } else {
            600_000
        };
        (base_bitrate as f64 * fps as f64 / 30.0) as u32
    }
}

impl VideoEncoder for GstVp8Encoder {
    fn encode(&mut self, frame: &VideoFrame) -> Result<Vec<EncodedPacket>, EncoderError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(EncoderError::InvalidInput(format!(
                "Frame size mismatch: expected {}x{}, got {}x{}",
                self.width, self.height, frame.width, frame.height
            )));
        }
        let rgba = frame
            .to_rgba_image()
            .ok_or_else(|| EncoderError::InvalidInput("malformed frame".to_string()))?;

        let buffer = buffer_from(rgba.as_raw(), frame.timestamp)?;
        self.appsrc.push_buffer(buffer).map_err(backend)?;

        let duration = Duration::from_secs(1) / self.fps;
        let mut packets = Vec::new();
        let mut timeout = gst::ClockTime::from_mseconds(30);
        while let Some(sample) = self.appsink.try_pull_sample(timeout) {
            let Some(buffer) = sample.buffer() else {
                continue;
            };
            let map = buffer.map_readable().map_err(backend)?;
            packets.push(EncodedPacket {
                data: map.as_slice().to_vec(),
                duration,
                keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
            });
            timeout = gst::ClockTime::ZERO;
        }
        Ok(packets)
    }

    fn codec(&self) -> VideoCodec {
        VideoCodec::VP8
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn force_keyframe(&mut self) {
        let event = gst_video::DownstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();

        let sent = self
            .encoder
            .static_pad("sink")
            .map(|pad| pad.send_event(event))
            .unwrap_or(false);
        if !sent {
            tracing::warn!("Failed to send force-keyframe event to encoder");
        }
    }
}

impl Drop for GstVp8Encoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
        tracing::debug!("VP8 encoder stopped");
    }
}

/// Call encoders: VP8 video and Opus audio
pub struct GstSampleEncoders;

impl GstSampleEncoders {
    pub fn new() -> Result<Self> {
        gst::init()?;
        Ok(Self)
    }
}

impl EncoderFactory for GstSampleEncoders {
    fn video_codec(&self) -> VideoCodec {
        VideoCodec::VP8
    }

    fn audio_codec(&self) -> AudioCodec {
        AudioCodec::Opus
    }

    fn video_encoder(&self, width: u32, height: u32, fps: u32) -> Result<Box<dyn VideoEncoder>, EncoderError> {
        let encoder = GstVp8Encoder::new(width, height, fps).map_err(|e| EncoderError::Unavailable(e.to_string()))?;
        Ok(Box::new(encoder))
    }

    fn audio_encoder(&self) -> Result<Box<dyn AudioEncoder>, EncoderError> {
        Ok(Box::new(audio::OpusEncoder::new()?))
    }
}

fn video_elements(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::VP8 => &["vp8enc"],
        VideoCodec::VP9 => &["vp9enc"],
        VideoCodec::H264 => &["x264enc", "h264parse"],
    }
}

fn video_segment(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::VP8 => "vp8enc deadline=1 cpu-used=4 keyframe-max-dist=60",
        VideoCodec::VP9 => "vp9enc deadline=1 cpu-used=6 row-mt=true keyframe-max-dist=60",
        VideoCodec::H264 => "x264enc tune=zerolatency speed-preset=veryfast key-int-max=60 ! h264parse",
    }
}

fn audio_elements(codec: AudioCodec) -> &'static [&'static str] {
    match codec {
        AudioCodec::Opus => &["opusenc"],
        AudioCodec::Aac => &["avenc_aac", "aacparse"],
    }
}

fn audio_segment(codec: AudioCodec) -> &'static str {
    match codec {
        AudioCodec::Opus => "opusenc",
        AudioCodec::Aac => "avenc_aac ! aacparse",
    }
}

fn muxer(container: Container) -> &'static str {
    match container {
        Container::WebM => "webmmux streamable=true",
        // Fragmented so the file is playable without seeking back to the header
        Container::Mp4 => "mp4mux fragment-duration=1000",
    }
}

fn muxer_element(container: Container) -> &'static str {
    match container {
        Container::WebM => "webmmux",
        Container::Mp4 => "mp4mux",
    }
}

/// Full recording pipeline for `format`, scaled to `width`x`height`
fn recording_pipeline(format: &RecordingFormat, width: u32, height: u32) -> String {
    let mut description = format!(
        "{} name=mux ! appsink name=sink sync=false \
         appsrc name=vsrc format=time is-live=true ! \
         videoconvert ! videoscale ! video/x-raw,width={},height={} ! videorate ! \
         video/x-raw,framerate={}/1 ! queue ! {} ! queue ! mux.",
        muxer(format.container),
        width,
        height,
        RECORDING_FPS,
        video_segment(format.video)
    );
    if let Some(codec) = format.audio {
        description.push_str(&format!(
            " appsrc name=asrc format=time is-live=true \
             caps=audio/x-raw,format=S16LE,rate={},channels={},layout=interleaved ! \
             audioconvert ! audioresample ! queue ! {} ! queue ! mux.",
            audio::SAMPLE_RATE,
            audio::CHANNELS,
            audio_segment(codec)
        ));
    }
    description
}

struct RecordingPipeline {
    pipeline: gst::Pipeline,
    video: gst_app::AppSrc,
    audio: Option<gst_app::AppSrc>,
    appsink: gst_app::AppSink,
}

impl RecordingPipeline {
    fn new(format: &RecordingFormat, width: u32, height: u32) -> Result<Self> {
        let description = recording_pipeline(format, width, height);
        tracing::info!("Starting recording pipeline: {}", description);

        let (pipeline, appsink) = launch(&description)?;
        let video = appsrc(&pipeline, "vsrc")?;
        let audio = match format.audio {
            Some(_) => Some(appsrc(&pipeline, "asrc")?),
            None => None,
        };
        start(&pipeline)?;

        Ok(Self {
            pipeline,
            video,
            audio,
            appsink,
        })
    }

    fn drain(&self, timeout: gst::ClockTime) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(sample) = self.appsink.try_pull_sample(timeout) {
            if let Some(map) = sample.buffer().and_then(|b| b.map_readable().ok()) {
                out.extend_from_slice(map.as_slice());
            }
        }
        out
    }
}

impl Drop for RecordingPipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// One recording in progress
pub struct GstContainerEncoder {
    format: RecordingFormat,
    pipeline: Option<RecordingPipeline>,
    finished: bool,
}

impl GstContainerEncoder {
    fn push_video(&mut self, frame: &VideoFrame) -> Result<(), EncoderError> {
        if self.pipeline.is_none() {
            let pipeline = RecordingPipeline::new(&self.format, frame.width, frame.height)
                .map_err(|e| EncoderError::Unavailable(e.to_string()))?;
            self.pipeline = Some(pipeline);
        }
        let Some(pipeline) = &self.pipeline else {
            return Ok(());
        };
        let rgba = frame
            .to_rgba_image()
            .ok_or_else(|| EncoderError::InvalidInput("malformed frame".to_string()))?;

        // Captures may change size mid-recording; caps travel with each sample
        let caps = rgba_caps(frame.width, frame.height, RECORDING_FPS)?;
        let buffer = buffer_from(rgba.as_raw(), frame.timestamp)?;
        let sample = gst::Sample::builder().buffer(&buffer).caps(&caps).build();
        pipeline.video.push_sample(&sample).map_err(backend)?;
        Ok(())
    }

    fn push_audio(&mut self, chunk: &AudioChunk) -> Result<(), EncoderError> {
        // Audio before the first video frame has no pipeline to go to
        let Some(audio) = self.pipeline.as_ref().and_then(|p| p.audio.as_ref()) else {
            return Ok(());
        };
        let bytes: Vec<u8> = chunk.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        audio.push_buffer(buffer_from(&bytes, chunk.timestamp)?).map_err(backend)?;
        Ok(())
    }
}

impl ContainerEncoder for GstContainerEncoder {
    fn format(&self) -> RecordingFormat {
        self.format
    }

    fn push(&mut self, frame: &MediaFrame) -> Result<Option<Vec<u8>>, EncoderError> {
        if self.finished {
            return Err(EncoderError::Finished);
        }
        match frame {
            MediaFrame::Video(video) => self.push_video(video)?,
            MediaFrame::Audio(chunk) => self.push_audio(chunk)?,
        }
        let chunk = self
            .pipeline
            .as_ref()
            .map(|p| p.drain(gst::ClockTime::ZERO))
            .unwrap_or_default();
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn finish(&mut self) -> Result<Vec<u8>, EncoderError> {
        if self.finished {
            return Err(EncoderError::Finished);
        }
        self.finished = true;

        let Some(pipeline) = self.pipeline.take() else {
            return Ok(Vec::new());
        };
        let _ = pipeline.video.end_of_stream();
        if let Some(audio) = &pipeline.audio {
            let _ = audio.end_of_stream();
        }

        let mut out = Vec::new();
        if let Some(bus) = pipeline.pipeline.bus() {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            loop {
                out.extend(pipeline.drain(gst::ClockTime::ZERO));
                if std::time::Instant::now() >= deadline {
                    tracing::warn!("Recording pipeline did not drain in time");
                    break;
                }
                let Some(msg) = bus.timed_pop_filtered(
                    gst::ClockTime::from_mseconds(50),
                    &[gst::MessageType::Eos, gst::MessageType::Error],
                ) else {
                    continue;
                };
                if let gst::MessageView::Error(err) = msg.view() {
                    return Err(backend(format!("{} ({:?})", err.error(), err.debug())));
                }
                break;
            }
        }
        out.extend(pipeline.drain(gst::ClockTime::ZERO));
        Ok(out)
    }
}

/// Recording encoders from whatever GStreamer plugins are installed
pub struct GstRecordingEncoders;

impl GstRecordingEncoders {
    pub fn new() -> Result<Self> {
        gst::init()?;
        Ok(Self)
    }
}

fn installed(element: &str) -> bool {
    gst::ElementFactory::find(element).is_some()
}

impl ContainerEncoderFactory for GstRecordingEncoders {
    fn supports(&self, format: &RecordingFormat) -> bool {
        let audio = format.audio.map(audio_elements).unwrap_or(&[]);
        installed(muxer_element(format.container))
            && video_elements(format.video).iter().all(|e| installed(e))
            && audio.iter().all(|e| installed(e))
    }

    fn create(&self, format: &RecordingFormat) -> Result<Box<dyn ContainerEncoder>, EncoderError> {
        if !self.supports(format) {
            return Err(EncoderError::Unavailable(format.mime_type()));
        }
        Ok(Box::new(GstContainerEncoder {
            format: *format,
            pipeline: None,
            finished: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_media::RECORDING_CANDIDATES;

    #[test]
    fn recording_pipeline_links_audio_only_when_requested() {
        let with_audio = recording_pipeline(&RECORDING_CANDIDATES[0], 1280, 720);
        assert!(with_audio.starts_with("webmmux"));
        assert!(with_audio.contains("vp9enc"));
        assert!(with_audio.contains("name=asrc"));

        let silent = recording_pipeline(&RECORDING_CANDIDATES[4], 1280, 720);
        assert!(silent.starts_with("mp4mux"));
        assert!(silent.contains("x264enc"));
        assert!(!silent.contains("name=asrc"));
    }

    #[test]
    fn bitrate_scales_with_resolution() {
        assert!(GstVp8Encoder::calculate_bitrate(1920, 1080, 30) > GstVp8Encoder::calculate_bitrate(640, 480, 30));
        assert_eq!(
            GstVp8Encoder::calculate_bitrate(1280, 720, 15),
            GstVp8Encoder::calculate_bitrate(1280, 720, 30) / 2
        );
    }
}
