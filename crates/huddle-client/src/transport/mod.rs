//! Peer transport seam
//!
//! The session core only sees identities, media calls and side channels.
//! [`rtc::RtcTransport`] implements this over webrtc-rs and a websocket
//! signaling relay; tests use `testing::FakeTransport`.

pub mod pump;
pub mod rtc;
pub mod signaling;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use huddle_protocol::{CallMetadata, PeerMessage, TrackKind};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::error::TransportError;
use crate::media::MediaTrack;
use crate::session::registry::OutboundSelection;

pub use rtc::RtcTransport;

/// Identifies one call or side channel, unique per process
pub type LinkId = Uuid;

/// Tracks attached to an outgoing call
#[derive(Debug, Clone, Default)]
pub struct OutboundTracks {
    pub audio: Option<Arc<MediaTrack>>,
    pub video: Option<Arc<MediaTrack>>,
}

impl OutboundTracks {
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

impl From<&OutboundSelection> for OutboundTracks {
    fn from(selection: &OutboundSelection) -> Self {
        Self {
            audio: selection.audio.clone(),
            video: selection.video.clone(),
        }
    }
}

/// One inbound track of a remote stream, carrying depacketized payloads
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub packets: broadcast::Sender<Bytes>,
}

/// Everything a remote peer sends us on one call
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Events raised by the transport, consumed by the peer session manager
#[derive(Clone)]
pub enum TransportEvent {
    IncomingCall(Arc<dyn MediaCall>),
    IncomingChannel(Arc<dyn DataChannel>),
    ChannelOpen { channel_id: LinkId, remote_id: String },
    ChannelData { channel_id: LinkId, remote_id: String, data: String },
    ChannelClosed { channel_id: LinkId, remote_id: String },
    CallStream { call_id: LinkId, remote_id: String, stream: RemoteStream },
    CallClosed { call_id: LinkId, remote_id: String },
    CallError { call_id: LinkId, remote_id: String, error: String },
    /// Relay-level failure, optionally about one peer
    Error { remote_id: Option<String>, error: String },
    /// Lost the signaling relay; established calls keep running
    Disconnected,
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::IncomingCall(call) => write!(f, "IncomingCall({}, {})", call.id(), call.remote_id()),
            TransportEvent::IncomingChannel(channel) => {
                write!(f, "IncomingChannel({}, {})", channel.id(), channel.remote_id())
            }
            TransportEvent::ChannelOpen { channel_id, remote_id } => {
                write!(f, "ChannelOpen({}, {})", channel_id, remote_id)
            }
            TransportEvent::ChannelData { channel_id, remote_id, .. } => {
                write!(f, "ChannelData({}, {})", channel_id, remote_id)
            }
            TransportEvent::ChannelClosed { channel_id, remote_id } => {
                write!(f, "ChannelClosed({}, {})", channel_id, remote_id)
            }
            TransportEvent::CallStream { call_id, remote_id, stream } => {
                write!(f, "CallStream({}, {}, {} tracks)", call_id, remote_id, stream.tracks.len())
            }
            TransportEvent::CallClosed { call_id, remote_id } => write!(f, "CallClosed({}, {})", call_id, remote_id),
            TransportEvent::CallError { call_id, remote_id, error } => {
                write!(f, "CallError({}, {}, {})", call_id, remote_id, error)
            }
            TransportEvent::Error { remote_id, error } => write!(f, "Error({:?}, {})", remote_id, error),
            TransportEvent::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// A negotiated (or negotiating) media call with one remote peer
#[async_trait]
pub trait MediaCall: Send + Sync {
    fn id(&self) -> LinkId;
    fn remote_id(&self) -> &str;
    fn metadata(&self) -> &CallMetadata;

    /// Accept an inbound call, sending `tracks`
    async fn answer(&self, tracks: OutboundTracks) -> Result<(), TransportError>;

    /// Swap what is sent for `kind` without renegotiating
    async fn replace_track(&self, kind: TrackKind, track: Option<Arc<MediaTrack>>) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Side channel used for small JSON messages between peers
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn id(&self) -> LinkId;
    fn remote_id(&self) -> &str;
    fn is_open(&self) -> bool;

    async fn send(&self, message: &PeerMessage) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Register with the relay and return our identity
    async fn open(&self, requested_id: Option<&str>) -> Result<String, TransportError>;

    async fn call(
        &self,
        remote_id: &str,
        tracks: OutboundTracks,
        metadata: CallMetadata,
    ) -> Result<Arc<dyn MediaCall>, TransportError>;

    async fn connect(&self, remote_id: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// The event stream; can be taken once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Close every link and leave the relay
    async fn shutdown(&self);
}
