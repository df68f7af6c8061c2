use std::fmt;

/// Capability a device notice refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Camera,
    Microphone,
    ScreenShare,
    Recording,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Camera => write!(f, "camera"),
            Feature::Microphone => write!(f, "microphone"),
            Feature::ScreenShare => write!(f, "screen share"),
            Feature::Recording => write!(f, "recording"),
        }
    }
}

/// User-facing message about something that went wrong
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Device { feature: Feature, message: String },
    Peer { peer_id: Option<String>, message: String },
    Recording { message: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Device { feature, message } => write!(f, "Could not use {}: {}", feature, message),
            Notice::Peer {
                peer_id: Some(peer_id),
                message,
            } => write!(f, "Connection to {} failed: {}", peer_id, message),
            Notice::Peer { peer_id: None, message } => write!(f, "Connection problem: {}", message),
            Notice::Recording { message } => write!(f, "Recording problem: {}", message),
        }
    }
}
