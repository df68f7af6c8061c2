use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use huddle_media::{ContainerEncoder, ContainerEncoderFactory, EncoderError, MediaFrame, RecordingFormat};

/// Container encoder that writes a readable trace instead of media
#[derive(Debug, Default)]
pub struct MemoryEncoderFactory {
    /// `None` supports every format
    supported: Mutex<Option<Vec<RecordingFormat>>>,
    created: AtomicUsize,
}

impl MemoryEncoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supporting(formats: Vec<RecordingFormat>) -> Self {
        Self {
            supported: Mutex::new(Some(formats)),
            created: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ContainerEncoderFactory for MemoryEncoderFactory {
    fn supports(&self, format: &RecordingFormat) -> bool {
        match &*self.supported.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(formats) => formats.contains(format),
            None => true,
        }
    }

    fn create(&self, format: &RecordingFormat) -> Result<Box<dyn ContainerEncoder>, EncoderError> {
        if !self.supports(format) {
            return Err(EncoderError::Unavailable(format.mime_type()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryEncoder {
            format: *format,
            finished: false,
        }))
    }
}

struct MemoryEncoder {
    format: RecordingFormat,
    finished: bool,
}

impl ContainerEncoder for MemoryEncoder {
    fn format(&self) -> RecordingFormat {
        self.format
    }

    fn push(&mut self, frame: &MediaFrame) -> Result<Option<Vec<u8>>, EncoderError> {
        if self.finished {
            return Err(EncoderError::Finished);
        }
        let chunk = match frame {
            MediaFrame::Video(frame) => format!("V{}x{};", frame.width, frame.height),
            MediaFrame::Audio(chunk) => format!("A{};", chunk.samples.len()),
        };
        Ok(Some(chunk.into_bytes()))
    }

    fn finish(&mut self) -> Result<Vec<u8>, EncoderError> {
        if self.finished {
            return Err(EncoderError::Finished);
        }
        self.finished = true;
        Ok(b"END".to_vec())
    }
}
