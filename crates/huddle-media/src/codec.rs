//! Encoder seams
//!
//! Huddle never ships its own codec. Capture backends and the transport
//! talk to host encoders through these traits.

use std::time::Duration;

use thiserror::Error;

use crate::frame::{AudioChunk, VideoFrame};

/// Video codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    VP8,
    VP9,
    H264,
}

impl VideoCodec {
    /// MIME type as used in SDP and the webrtc media engine
    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
            VideoCodec::H264 => "video/H264",
        }
    }

    /// Codec name as it appears in a container MIME string
    pub fn name(self) -> &'static str {
        match self {
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
            VideoCodec::H264 => "avc1",
        }
    }
}

/// Audio codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    Opus,
    Aac,
}

impl AudioCodec {
    pub fn mime_type(self) -> &'static str {
        match self {
            AudioCodec::Opus => "audio/opus",
            AudioCodec::Aac => "audio/mp4a-latm",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AudioCodec::Opus => "opus",
            AudioCodec::Aac => "mp4a",
        }
    }
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("codec not available: {0}")]
    Unavailable(String),
    #[error("encoder rejected input: {0}")]
    InvalidInput(String),
    #[error("encoder failed: {0}")]
    Backend(String),
    #[error("encoder already finished")]
    Finished,
}

/// One encoded access unit
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub duration: Duration,
    pub keyframe: bool,
}

/// Video encoder trait
pub trait VideoEncoder: Send {
    /// Encode one frame. An empty result means the encoder is buffering.
    fn encode(&mut self, frame: &VideoFrame) -> Result<Vec<EncodedPacket>, EncoderError>;
    fn codec(&self) -> VideoCodec;
    /// Geometry the encoder was configured for
    fn dimensions(&self) -> (u32, u32);
    fn force_keyframe(&mut self) {}
}

/// Audio encoder trait
pub trait AudioEncoder: Send {
    fn encode(&mut self, chunk: &AudioChunk) -> Result<Vec<EncodedPacket>, EncoderError>;
    fn codec(&self) -> AudioCodec;
}

/// Builds live encoders for outgoing call tracks
pub trait EncoderFactory: Send + Sync {
    fn video_codec(&self) -> VideoCodec;
    fn audio_codec(&self) -> AudioCodec;
    fn video_encoder(&self, width: u32, height: u32, fps: u32) -> Result<Box<dyn VideoEncoder>, EncoderError>;
    fn audio_encoder(&self) -> Result<Box<dyn AudioEncoder>, EncoderError>;
}
