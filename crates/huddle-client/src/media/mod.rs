pub mod devices;
pub mod source;

#[cfg(feature = "gstreamer")]
pub mod gst_capture;
#[cfg(feature = "gstreamer")]
pub mod gst_encoder;

pub use devices::{CameraRequest, MediaDevices};
pub use source::{DeviceLease, MediaSource, MediaTrack};
