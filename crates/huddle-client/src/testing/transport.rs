use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use huddle_protocol::{CallMetadata, PeerMessage, TrackKind};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::error::TransportError;
use crate::media::MediaTrack;
use crate::transport::{
    DataChannel, LinkId, MediaCall, OutboundTracks, RemoteStream, RemoteTrack, Transport, TransportEvent,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory transport. Outgoing work is recorded; inbound traffic is
/// injected by the test through the `*_event` builders or [`FakeTransport::emit`].
pub struct FakeTransport {
    local_id: String,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    identity_gate: watch::Sender<bool>,
    opens: AtomicUsize,
    calls: Mutex<Vec<Arc<FakeCall>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeTransport {
    pub fn new(local_id: &str) -> Arc<Self> {
        let transport = Self::gated(local_id);
        transport.release_identity();
        transport
    }

    /// `open` blocks until [`FakeTransport::release_identity`]
    pub fn gated(local_id: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (identity_gate, _) = watch::channel(false);
        Arc::new(Self {
            local_id: local_id.to_string(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            identity_gate,
            opens: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
        })
    }

    pub fn release_identity(&self) {
        self.identity_gate.send_replace(true);
    }

    /// Identity registrations performed
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Calls to `remote_id` fail as if the peer does not exist
    pub fn set_unreachable(&self, remote_id: &str) {
        lock(&self.unreachable).insert(remote_id.to_string());
    }

    /// Outgoing calls placed towards `remote_id`
    pub fn calls_to(&self, remote_id: &str) -> Vec<Arc<FakeCall>> {
        lock(&self.calls)
            .iter()
            .filter(|c| !c.inbound && c.remote_id == remote_id)
            .cloned()
            .collect()
    }

    /// Every call, inbound and outbound, towards or from `remote_id`
    pub fn calls_with(&self, remote_id: &str) -> Vec<Arc<FakeCall>> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.remote_id == remote_id)
            .cloned()
            .collect()
    }

    pub fn all_calls(&self) -> Vec<Arc<FakeCall>> {
        lock(&self.calls).clone()
    }

    /// Side channels we opened towards `remote_id`
    pub fn channels_to(&self, remote_id: &str) -> Vec<Arc<FakeChannel>> {
        lock(&self.channels)
            .iter()
            .filter(|c| !c.inbound && c.remote_id == remote_id)
            .cloned()
            .collect()
    }

    /// Push an event as if the network produced it
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// A remote peer calls us; emits nothing, pair with `IncomingCall`
    pub fn inbound_call(&self, remote_id: &str, name: Option<&str>) -> Arc<FakeCall> {
        let metadata = CallMetadata {
            name: name.map(str::to_string),
        };
        let call = Arc::new(FakeCall::new(remote_id, metadata, true, OutboundTracks::default()));
        lock(&self.calls).push(call.clone());
        call
    }

    /// A remote peer opens a side channel to us
    pub fn inbound_channel(&self, remote_id: &str) -> Arc<FakeChannel> {
        let channel = Arc::new(FakeChannel::new(remote_id, true));
        lock(&self.channels).push(channel.clone());
        channel
    }

    /// Remote audio and video arriving on `call`
    pub fn stream_event(&self, call: &FakeCall) -> TransportEvent {
        let track = |kind: TrackKind| {
            let (packets, _) = broadcast::channel(4);
            RemoteTrack {
                id: format!("{}-{}", call.remote_id, kind),
                kind,
                packets,
            }
        };
        TransportEvent::CallStream {
            call_id: call.id,
            remote_id: call.remote_id.clone(),
            stream: RemoteStream {
                id: format!("stream-{}", call.remote_id),
                tracks: vec![track(TrackKind::Audio), track(TrackKind::Video)],
            },
        }
    }

    pub fn open_event(&self, channel: &FakeChannel) -> TransportEvent {
        channel.open.store(true, Ordering::SeqCst);
        TransportEvent::ChannelOpen {
            channel_id: channel.id,
            remote_id: channel.remote_id.clone(),
        }
    }

    pub fn identify_event(&self, channel: &FakeChannel, name: &str) -> TransportEvent {
        let message = PeerMessage::Identify { name: name.to_string() };
        TransportEvent::ChannelData {
            channel_id: channel.id,
            remote_id: channel.remote_id.clone(),
            data: message.to_json().unwrap_or_default(),
        }
    }

    pub fn closed_event(&self, call: &FakeCall) -> TransportEvent {
        TransportEvent::CallClosed {
            call_id: call.id,
            remote_id: call.remote_id.clone(),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, requested_id: Option<&str>) -> Result<String, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.identity_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        Ok(requested_id.unwrap_or(&self.local_id).to_string())
    }

    async fn call(
        &self,
        remote_id: &str,
        tracks: OutboundTracks,
        metadata: CallMetadata,
    ) -> Result<Arc<dyn MediaCall>, TransportError> {
        if lock(&self.unreachable).contains(remote_id) {
            return Err(TransportError::PeerUnavailable(remote_id.to_string()));
        }
        let call = Arc::new(FakeCall::new(remote_id, metadata, false, tracks));
        lock(&self.calls).push(call.clone());
        Ok(call)
    }

    async fn connect(&self, remote_id: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        if lock(&self.unreachable).contains(remote_id) {
            return Err(TransportError::PeerUnavailable(remote_id.to_string()));
        }
        let channel = Arc::new(FakeChannel::new(remote_id, false));
        lock(&self.channels).push(channel.clone());
        let open = self.open_event(&channel);
        self.emit(open);
        Ok(channel)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        lock(&self.events_rx).take()
    }

    async fn shutdown(&self) {
        for call in self.all_calls() {
            call.close().await;
        }
        let channels = lock(&self.channels).clone();
        for channel in channels {
            channel.close().await;
        }
    }
}

/// Recorded media call
pub struct FakeCall {
    id: LinkId,
    remote_id: String,
    metadata: CallMetadata,
    inbound: bool,
    initial: OutboundTracks,
    answered: Mutex<Option<OutboundTracks>>,
    replacements: Mutex<Vec<(TrackKind, Option<Uuid>)>>,
    closed: AtomicBool,
}

impl FakeCall {
    fn new(remote_id: &str, metadata: CallMetadata, inbound: bool, initial: OutboundTracks) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_id: remote_id.to_string(),
            metadata,
            inbound,
            initial,
            answered: Mutex::new(None),
            replacements: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_answered(&self) -> bool {
        lock(&self.answered).is_some()
    }

    pub fn answered_tracks(&self) -> Option<OutboundTracks> {
        lock(&self.answered).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of in-place replacements of `kind`
    pub fn replacements(&self, kind: TrackKind) -> usize {
        lock(&self.replacements).iter().filter(|(k, _)| *k == kind).count()
    }

    /// Track currently sent for `kind`
    pub fn current_track(&self, kind: TrackKind) -> Option<Uuid> {
        if let Some((_, id)) = lock(&self.replacements).iter().rev().find(|(k, _)| *k == kind) {
            return *id;
        }
        let base = lock(&self.answered).clone().unwrap_or_else(|| self.initial.clone());
        base.track(kind).map(|t| t.id())
    }
}

#[async_trait]
impl MediaCall for FakeCall {
    fn id(&self) -> LinkId {
        self.id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn metadata(&self) -> &CallMetadata {
        &self.metadata
    }

    async fn answer(&self, tracks: OutboundTracks) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::PeerUnavailable(self.remote_id.clone()));
        }
        *lock(&self.answered) = Some(tracks);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<Arc<MediaTrack>>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::PeerUnavailable(self.remote_id.clone()));
        }
        lock(&self.replacements).push((kind, track.map(|t| t.id())));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Recorded side channel
pub struct FakeChannel {
    id: LinkId,
    remote_id: String,
    inbound: bool,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<PeerMessage>>,
}

impl FakeChannel {
    fn new(remote_id: &str, inbound: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_id: remote_id.to_string(),
            inbound,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<PeerMessage> {
        lock(&self.sent).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn id(&self) -> LinkId {
        self.id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn send(&self, message: &PeerMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
