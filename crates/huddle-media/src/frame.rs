use std::sync::Arc;
use std::time::Duration;

use huddle_protocol::TrackKind;
use image::RgbaImage;

/// Pixel layout of a raw video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    I420,
    Nv12,
    Rgb24,
    Rgba,
}

impl PixelFormat {
    /// Bytes needed for one frame of the given size
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::I420 | PixelFormat::Nv12 => pixels + pixels / 2,
            PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Rgba => pixels * 4,
        }
    }
}

/// Raw video frame
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Capture time relative to the start of the producing track
    pub timestamp: Duration,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>, timestamp: Duration) -> Self {
        Self {
            width,
            height,
            format,
            data,
            timestamp,
        }
    }

    pub fn from_rgba_image(image: RgbaImage, timestamp: Duration) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            format: PixelFormat::Rgba,
            data: image.into_raw(),
            timestamp,
        }
    }

    /// Whether the buffer length matches the declared geometry
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == self.format.frame_len(self.width, self.height)
    }

    /// Convert to an RGBA image for compositing.
    ///
    /// Only packed RGB formats are handled here; planar YUV frames are
    /// converted by the capture backend before they reach the compositor.
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        if !self.is_well_formed() {
            return None;
        }
        match self.format {
            PixelFormat::Rgba => RgbaImage::from_raw(self.width, self.height, self.data.clone()),
            PixelFormat::Rgb24 => {
                let mut rgba = Vec::with_capacity(self.format.frame_len(self.width, self.height) / 3 * 4);
                for px in self.data.chunks_exact(3) {
                    rgba.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                RgbaImage::from_raw(self.width, self.height, rgba)
            }
            PixelFormat::I420 | PixelFormat::Nv12 => None,
        }
    }
}

/// Interleaved PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
    pub timestamp: Duration,
}

impl AudioChunk {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

/// One sample travelling through a media track
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Audio(Arc<AudioChunk>),
    Video(Arc<VideoFrame>),
}

impl MediaFrame {
    pub fn kind(&self) -> TrackKind {
        match self {
            MediaFrame::Audio(_) => TrackKind::Audio,
            MediaFrame::Video(_) => TrackKind::Video,
        }
    }

    pub fn timestamp(&self) -> Duration {
        match self {
            MediaFrame::Audio(chunk) => chunk.timestamp,
            MediaFrame::Video(frame) => frame.timestamp,
        }
    }
}

impl From<VideoFrame> for MediaFrame {
    fn from(frame: VideoFrame) -> Self {
        MediaFrame::Video(Arc::new(frame))
    }
}

impl From<AudioChunk> for MediaFrame {
    fn from(chunk: AudioChunk) -> Self {
        MediaFrame::Audio(Arc::new(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_frames_expand_to_opaque_rgba() {
        let frame = VideoFrame::new(2, 1, PixelFormat::Rgb24, vec![1, 2, 3, 4, 5, 6], Duration::ZERO);
        let image = frame.to_rgba_image().unwrap();
        assert_eq!(image.as_raw(), &vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = VideoFrame::new(4, 4, PixelFormat::Rgba, vec![0; 10], Duration::ZERO);
        assert!(!frame.is_well_formed());
        assert!(frame.to_rgba_image().is_none());
    }

    #[test]
    fn audio_chunk_duration_counts_frames_not_samples() {
        let chunk = AudioChunk {
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0; 960 * 2],
            timestamp: Duration::ZERO,
        };
        assert_eq!(chunk.duration(), Duration::from_millis(20));
    }
}
