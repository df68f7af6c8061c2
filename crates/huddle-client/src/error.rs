use huddle_media::EncoderError;
use thiserror::Error;

/// Failure opening or running a capture device
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The user dismissed the permission prompt. Not a failure.
    #[error("Permission prompt dismissed")]
    Cancelled,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Device unavailable: {0}")]
    Unavailable(String),

    #[error("Capture backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeviceError::Cancelled)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is not open")]
    NotOpen,

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Identity already taken: {0}")]
    IdTaken(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Side channel closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::WebRtc(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::Signaling(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Session already ended")]
    Ended,

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
