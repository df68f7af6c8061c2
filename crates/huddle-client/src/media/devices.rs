use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DeviceError;
use crate::media::source::MediaSource;

/// What to ask the camera grant for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraRequest {
    pub audio: bool,
    pub video: bool,
    /// Platform camera index, first camera when unset
    pub device_index: Option<u32>,
}

impl Default for CameraRequest {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            device_index: None,
        }
    }
}

/// Access to capture hardware.
///
/// Every call may prompt the user. A dismissed prompt surfaces as
/// [`DeviceError::Cancelled`].
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera video plus microphone audio as one `Camera` source
    async fn open_camera(&self, request: CameraRequest) -> Result<Arc<MediaSource>, DeviceError>;

    /// Screen video, plus system audio when the platform offers it
    async fn open_screen(&self) -> Result<Arc<MediaSource>, DeviceError>;

    /// Full-resolution screen and audio capture used only by the recorder
    async fn open_recording_capture(&self) -> Result<Arc<MediaSource>, DeviceError>;
}
