//! Recording container selection
//!
//! A recording is written in the first container/codec combination the
//! host can actually produce. Candidates are ordered from the most widely
//! playable to the least.

use chrono::{DateTime, Utc};

use crate::codec::{AudioCodec, EncoderError, VideoCodec};
use crate::frame::MediaFrame;

/// Container type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    WebM,
    Mp4,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Container::WebM => "webm",
            Container::Mp4 => "mp4",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Container::WebM => "video/webm",
            Container::Mp4 => "video/mp4",
        }
    }
}

/// Container plus codecs for one recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordingFormat {
    pub container: Container,
    pub video: VideoCodec,
    pub audio: Option<AudioCodec>,
}

impl RecordingFormat {
    pub const fn new(container: Container, video: VideoCodec, audio: Option<AudioCodec>) -> Self {
        Self {
            container,
            video,
            audio,
        }
    }

    pub fn extension(&self) -> &'static str {
        self.container.extension()
    }

    /// e.g. `video/webm;codecs=vp9,opus`
    pub fn mime_type(&self) -> String {
        match self.audio {
            Some(audio) => format!(
                "{};codecs={},{}",
                self.container.mime_type(),
                self.video.name(),
                audio.name()
            ),
            None => format!("{};codecs={}", self.container.mime_type(), self.video.name()),
        }
    }
}

/// Preference order for recordings
pub const RECORDING_CANDIDATES: [RecordingFormat; 5] = [
    RecordingFormat::new(Container::WebM, VideoCodec::VP9, Some(AudioCodec::Opus)),
    RecordingFormat::new(Container::WebM, VideoCodec::VP8, Some(AudioCodec::Opus)),
    RecordingFormat::new(Container::Mp4, VideoCodec::H264, Some(AudioCodec::Aac)),
    RecordingFormat::new(Container::WebM, VideoCodec::VP8, None),
    RecordingFormat::new(Container::Mp4, VideoCodec::H264, None),
];

/// Pick the first candidate the host supports
pub fn select_format(supports: impl Fn(&RecordingFormat) -> bool) -> Option<RecordingFormat> {
    let format = RECORDING_CANDIDATES.iter().copied().find(|f| supports(f))?;
    if format.audio.is_none() {
        tracing::warn!(
            "No audio encoder available for {}. Recording without audio.",
            format.mime_type()
        );
    }
    Some(format)
}

/// File name for a finished recording, `{prefix}-{YYYYMMDDTHHMMSSZ}.{ext}`
pub fn artifact_file_name(prefix: &str, started_at: DateTime<Utc>, format: &RecordingFormat) -> String {
    format!(
        "{}-{}.{}",
        prefix,
        started_at.format("%Y%m%dT%H%M%SZ"),
        format.extension()
    )
}

/// Muxing encoder that turns captured frames into container chunks
pub trait ContainerEncoder: Send {
    fn format(&self) -> RecordingFormat;

    /// Feed one captured frame; returns a chunk when the muxer flushed one
    fn push(&mut self, frame: &MediaFrame) -> Result<Option<Vec<u8>>, EncoderError>;

    /// Flush everything still buffered. Further pushes fail.
    fn finish(&mut self) -> Result<Vec<u8>, EncoderError>;
}

/// Creates container encoders for recordings
pub trait ContainerEncoderFactory: Send + Sync {
    fn supports(&self, format: &RecordingFormat) -> bool;
    fn create(&self, format: &RecordingFormat) -> Result<Box<dyn ContainerEncoder>, EncoderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn prefers_webm_vp9_when_everything_is_available() {
        let format = select_format(|_| true).unwrap();
        assert_eq!(format.container, Container::WebM);
        assert_eq!(format.video, VideoCodec::VP9);
        assert_eq!(format.mime_type(), "video/webm;codecs=vp9,opus");
    }

    #[test]
    fn falls_back_to_mp4_without_vpx() {
        let format = select_format(|f| f.container == Container::Mp4).unwrap();
        assert_eq!(format.mime_type(), "video/mp4;codecs=avc1,mp4a");
        assert_eq!(format.extension(), "mp4");
    }

    #[test]
    fn records_without_audio_as_last_resort() {
        let format = select_format(|f| f.audio.is_none() && f.video == VideoCodec::VP8).unwrap();
        assert_eq!(format.mime_type(), "video/webm;codecs=vp8");
    }

    #[test]
    fn nothing_supported_yields_none() {
        assert!(select_format(|_| false).is_none());
    }

    #[test]
    fn file_name_carries_iso8601_timestamp() {
        let started = Utc.with_ymd_and_hms(2026, 3, 9, 14, 5, 7).unwrap();
        let name = artifact_file_name("huddle-recording", started, &RECORDING_CANDIDATES[0]);
        assert_eq!(name, "huddle-recording-20260309T140507Z.webm");
    }
}
