//! Test doubles for the session core
//!
//! In-memory stand-ins for every external collaborator: the peer
//! transport, capture devices, the segmentation model and the recording
//! encoder. They record what the core did to them so tests can assert on
//! it.

pub mod devices;
pub mod encoder;
pub mod frames;
pub mod segmenter;
pub mod transport;

pub use devices::{FakeDevices, Grant};
pub use encoder::MemoryEncoderFactory;
pub use frames::{audio_chunk, eventually, feed_video, video_frame};
pub use segmenter::FakeSegmenter;
pub use transport::{FakeCall, FakeChannel, FakeTransport};
