use std::time::Duration;

#[cfg(feature = "opus")]
use crate::codec::{AudioCodec, AudioEncoder, EncodedPacket, EncoderError};
#[cfg(feature = "opus")]
use crate::frame::AudioChunk;

/// Audio sample rate used throughout the application (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Audio channels (stereo)
pub const CHANNELS: usize = 2;

/// Frame size in samples (20ms at 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Duration of one encoder frame
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Splits arbitrarily sized PCM chunks into fixed encoder frames
#[derive(Debug)]
pub struct PcmFramer {
    frame_len: usize,
    pending: Vec<i16>,
}

impl PcmFramer {
    pub fn new(channels: usize, frame_size: usize) -> Self {
        Self {
            frame_len: channels * frame_size,
            pending: Vec::with_capacity(channels * frame_size * 2),
        }
    }

    /// Append samples and return every complete frame
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Duplicate mono samples into interleaved stereo
pub fn upmix_mono(samples: &[i16]) -> Vec<i16> {
    samples.iter().flat_map(|&s| [s, s]).collect()
}

/// Opus audio encoder
#[cfg(feature = "opus")]
pub struct OpusEncoder {
    encoder: opus::Encoder,
    framer: PcmFramer,
}

#[cfg(feature = "opus")]
impl OpusEncoder {
    pub fn new() -> Result<Self, EncoderError> {
        let encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Stereo, opus::Application::Voip)
            .map_err(|e| EncoderError::Unavailable(e.to_string()))?;

        Ok(Self {
            encoder,
            framer: PcmFramer::new(CHANNELS, FRAME_SIZE),
        })
    }

    /// Set the bitrate (in bits per second)
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), EncoderError> {
        self.encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| EncoderError::Backend(e.to_string()))
    }
}

#[cfg(feature = "opus")]
impl AudioEncoder for OpusEncoder {
    fn encode(&mut self, chunk: &AudioChunk) -> Result<Vec<EncodedPacket>, EncoderError> {
        if chunk.sample_rate != SAMPLE_RATE {
            return Err(EncoderError::InvalidInput(format!(
                "expected {} Hz, got {} Hz",
                SAMPLE_RATE, chunk.sample_rate
            )));
        }

        let frames = match chunk.channels {
            1 => self.framer.push(&upmix_mono(&chunk.samples)),
            2 => self.framer.push(&chunk.samples),
            n => {
                return Err(EncoderError::InvalidInput(format!("unsupported channel count {}", n)));
            }
        };

        let mut packets = Vec::with_capacity(frames.len());
        for pcm in frames {
            let mut output = vec![0u8; 4000]; // Max opus packet size
            let len = self
                .encoder
                .encode(&pcm, &mut output)
                .map_err(|e| EncoderError::Backend(e.to_string()))?;
            output.truncate(len);
            packets.push(EncodedPacket {
                data: output,
                duration: FRAME_DURATION,
                keyframe: true,
            });
        }
        Ok(packets)
    }

    fn codec(&self) -> AudioCodec {
        AudioCodec::Opus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_emits_whole_frames_and_keeps_remainder() {
        let mut framer = PcmFramer::new(CHANNELS, FRAME_SIZE);

        assert!(framer.push(&vec![0; 1000]).is_empty());
        let frames = framer.push(&vec![1; 3000]);

        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_SIZE * CHANNELS));
        assert_eq!(framer.pending_samples(), 4000 - 2 * FRAME_SIZE * CHANNELS);
    }

    #[test]
    fn upmix_duplicates_each_sample() {
        assert_eq!(upmix_mono(&[1, -2]), vec![1, 1, -2, -2]);
    }

    #[cfg(feature = "opus")]
    #[test]
    fn opus_encodes_silence() {
        let mut encoder = OpusEncoder::new().unwrap();
        let chunk = AudioChunk {
            sample_rate: SAMPLE_RATE,
            channels: 2,
            samples: vec![0; FRAME_SIZE * CHANNELS],
            timestamp: Duration::ZERO,
        };
        let packets = encoder.encode(&chunk).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].data.is_empty());
    }
}
