//! Peer session manager
//!
//! Owns the local identity and one connection per remote id. Connections
//! move `Negotiating -> Connected -> Closed`; there is no reconnect. The
//! roster is derived from connections that delivered a stream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use huddle_protocol::{CallMetadata, ParticipantData, PeerMessage, TrackKind};
use tokio::sync::{OnceCell, RwLock, broadcast, mpsc, watch};

use crate::error::TransportError;
use crate::media::MediaTrack;
use crate::session::notice::Notice;
use crate::session::registry::OutboundSelection;
use crate::transport::{DataChannel, LinkId, MediaCall, OutboundTracks, RemoteStream, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Connected,
    Closed,
}

/// Roster entry
#[derive(Debug, Clone)]
pub struct Participant {
    pub peer_id: String,
    pub display_name: String,
    pub is_local: bool,
    /// Inbound media, `None` for the local participant
    pub stream: Option<RemoteStream>,
}

impl Participant {
    pub fn data(&self) -> ParticipantData {
        let has = |kind: TrackKind| self.stream.as_ref().is_some_and(|s| s.has(kind));
        ParticipantData {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            is_local: self.is_local,
            has_audio: has(TrackKind::Audio),
            has_video: has(TrackKind::Video),
        }
    }
}

/// Name shown for a peer that never told us its name
pub fn fallback_name(remote_id: &str) -> String {
    format!("Guest {}", remote_id.chars().take(6).collect::<String>())
}

type Replacement = (TrackKind, Option<Arc<MediaTrack>>);

struct PeerConnection {
    call: Arc<dyn MediaCall>,
    display_name: Option<String>,
    outbound: OutboundTracks,
    state: ConnectionState,
    /// We placed this call
    outgoing: bool,
    /// Replacements are applied in order by a per-connection worker
    replacer: mpsc::UnboundedSender<Replacement>,
}

impl PeerConnection {
    fn new(call: Arc<dyn MediaCall>, outbound: OutboundTracks, outgoing: bool) -> Self {
        let (replacer, mut requests) = mpsc::unbounded_channel::<Replacement>();
        let worker_call = call.clone();
        tokio::spawn(async move {
            while let Some((kind, track)) = requests.recv().await {
                if let Err(e) = worker_call.replace_track(kind, track).await {
                    tracing::warn!(
                        "Failed to replace {} track for {}: {}",
                        kind,
                        worker_call.remote_id(),
                        e
                    );
                }
            }
        });

        Self {
            call,
            display_name: None,
            outbound,
            state: ConnectionState::Negotiating,
            outgoing,
            replacer,
        }
    }

    /// Point outbound tracks at `next`, replacing only kinds that changed
    fn retarget(&mut self, next: OutboundTracks) {
        for kind in [TrackKind::Video, TrackKind::Audio] {
            let current = self.outbound.track(kind).map(|t| t.id());
            let wanted = next.track(kind);
            if current == wanted.map(|t| t.id()) {
                continue;
            }
            tracing::debug!("Replacing {} track for {}", kind, self.call.remote_id());
            let _ = self.replacer.send((kind, wanted.cloned()));
        }
        self.outbound = next;
    }
}

#[derive(Default)]
struct PeerState {
    local_id: Option<String>,
    local_name: String,
    outbound: Option<OutboundSelection>,
    /// Join targets in request order, each listed once
    pending_joins: Vec<String>,
    dialing: HashSet<String>,
    connections: HashMap<String, PeerConnection>,
    channels: HashMap<String, Arc<dyn DataChannel>>,
    /// Names learned over the side channel. An entry may precede its
    /// connection and is dropped when that connection closes.
    names: HashMap<String, String>,
    /// Remote participants in arrival order
    participants: Vec<Participant>,
    closed: bool,
}

impl PeerState {
    fn roster(&self) -> Vec<Participant> {
        let local = Participant {
            peer_id: self.local_id.clone().unwrap_or_default(),
            display_name: self.local_name.clone(),
            is_local: true,
            stream: None,
        };
        std::iter::once(local).chain(self.participants.iter().cloned()).collect()
    }

    fn live_outbound(&self) -> Option<OutboundTracks> {
        self.outbound
            .as_ref()
            .filter(|o| o.source.is_live())
            .map(OutboundTracks::from)
    }
}

#[derive(Clone)]
pub struct PeerSessionManager {
    transport: Arc<dyn Transport>,
    identity: Arc<OnceCell<String>>,
    state: Arc<RwLock<PeerState>>,
    roster: Arc<watch::Sender<Vec<Participant>>>,
    local_id: Arc<watch::Sender<Option<String>>>,
    notices: broadcast::Sender<Notice>,
}

impl PeerSessionManager {
    pub fn new(transport: Arc<dyn Transport>, local_name: impl Into<String>, notices: broadcast::Sender<Notice>) -> Self {
        let state = PeerState {
            local_name: local_name.into(),
            ..Default::default()
        };
        let (roster, _) = watch::channel(state.roster());
        let (local_id, _) = watch::channel(None);

        Self {
            transport,
            identity: Arc::new(OnceCell::new()),
            state: Arc::new(RwLock::new(state)),
            roster: Arc::new(roster),
            local_id: Arc::new(local_id),
            notices,
        }
    }

    pub fn subscribe_roster(&self) -> watch::Receiver<Vec<Participant>> {
        self.roster.subscribe()
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.roster.borrow().clone()
    }

    pub fn subscribe_local_id(&self) -> watch::Receiver<Option<String>> {
        self.local_id.subscribe()
    }

    pub fn local_id(&self) -> Option<String> {
        self.local_id.borrow().clone()
    }

    pub async fn connection_state(&self, remote_id: &str) -> Option<ConnectionState> {
        self.state.read().await.connections.get(remote_id).map(|c| c.state)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Resolved display name for a connected peer
    pub async fn display_name(&self, remote_id: &str) -> Option<String> {
        let state = self.state.read().await;
        let connection = state.connections.get(remote_id)?;
        Some(
            state
                .names
                .get(remote_id)
                .cloned()
                .or_else(|| connection.display_name.clone())
                .unwrap_or_else(|| fallback_name(remote_id)),
        )
    }

    pub async fn set_local_name(&self, name: impl Into<String>) {
        let mut state = self.state.write().await;
        state.local_name = name.into();
        self.publish_roster(&state);
    }

    /// Acquire the local identity. Idempotent, concurrent callers share one
    /// registration.
    pub async fn start(&self, requested_id: Option<&str>) -> Result<String, TransportError> {
        let transport = self.transport.clone();
        let requested = requested_id.map(str::to_string);
        let id = self
            .identity
            .get_or_try_init(|| async move { transport.open(requested.as_deref()).await })
            .await?
            .clone();

        {
            let mut state = self.state.write().await;
            if state.local_id.is_none() {
                tracing::info!("Local identity acquired: {}", id);
                state.local_id = Some(id.clone());
                self.local_id.send_replace(Some(id.clone()));
                self.publish_roster(&state);
            }
        }

        self.try_fire_join().await;
        Ok(id)
    }

    /// Connect to `remote_id` as soon as identity and an outbound source exist
    pub async fn join(&self, remote_id: &str) {
        {
            let mut state = self.state.write().await;
            if state.closed {
                tracing::warn!("Session closed, ignoring join to {}", remote_id);
                return;
            }
            if state.pending_joins.iter().any(|id| id == remote_id) {
                tracing::debug!("Join to {} already pending", remote_id);
            } else {
                tracing::info!("Join requested for {}", remote_id);
                state.pending_joins.push(remote_id.to_string());
            }
        }
        self.try_fire_join().await;
    }

    /// Dial every pending target once identity and a live source exist
    async fn try_fire_join(&self) {
        let (targets, tracks, name) = {
            let mut state = self.state.write().await;
            let Some(local_id) = state.local_id.clone() else {
                return;
            };
            let Some(tracks) = state.live_outbound() else {
                return;
            };
            let mut targets = Vec::new();
            for remote_id in std::mem::take(&mut state.pending_joins) {
                if remote_id == local_id {
                    tracing::warn!("Ignoring join to our own id {}", remote_id);
                    continue;
                }
                if state.connections.contains_key(&remote_id) || !state.dialing.insert(remote_id.clone()) {
                    tracing::debug!("Already connected to {}", remote_id);
                    continue;
                }
                targets.push(remote_id);
            }
            (targets, tracks, state.local_name.clone())
        };

        for remote_id in targets {
            self.dial(remote_id, tracks.clone(), name.clone()).await;
        }
    }

    async fn dial(&self, remote_id: String, tracks: OutboundTracks, name: String) {
        tracing::info!("Calling {}", remote_id);
        match self.transport.connect(&remote_id).await {
            Ok(channel) => self.register_channel(channel).await,
            Err(e) => tracing::warn!("Side channel to {} failed, names fall back: {}", remote_id, e),
        }

        let result = self
            .transport
            .call(&remote_id, tracks.clone(), CallMetadata::named(name))
            .await;

        let mut state = self.state.write().await;
        state.dialing.remove(&remote_id);
        match result {
            Ok(call) => {
                if state.closed || state.connections.contains_key(&remote_id) {
                    drop(state);
                    call.close().await;
                    return;
                }
                let mut connection = PeerConnection::new(call, tracks, true);
                // The source may have moved while we were dialing
                let current = state
                    .outbound
                    .as_ref()
                    .map(OutboundTracks::from)
                    .unwrap_or_default();
                connection.retarget(current);
                state.connections.insert(remote_id, connection);
            }
            Err(e) => {
                tracing::error!("Call to {} failed: {}", remote_id, e);
                self.notify(Notice::Peer {
                    peer_id: Some(remote_id.clone()),
                    message: e.to_string(),
                });
                state.names.remove(&remote_id);
                let channel = state.channels.remove(&remote_id);
                drop(state);
                if let Some(channel) = channel {
                    channel.close().await;
                }
            }
        }
    }

    /// Re-point every live connection at the new selection
    pub async fn on_source_changed(&self, selection: Option<OutboundSelection>) {
        {
            let mut state = self.state.write().await;
            let next = selection.as_ref().map(OutboundTracks::from).unwrap_or_default();
            state.outbound = selection;
            for connection in state.connections.values_mut() {
                if connection.state == ConnectionState::Closed {
                    continue;
                }
                connection.retarget(next.clone());
            }
        }
        self.try_fire_join().await;
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        tracing::debug!("Transport event: {:?}", event);
        match event {
            TransportEvent::IncomingCall(call) => self.on_incoming_call(call).await,
            TransportEvent::IncomingChannel(channel) => self.register_channel(channel).await,
            TransportEvent::ChannelOpen { channel_id, remote_id } => {
                self.on_channel_open(channel_id, &remote_id).await
            }
            TransportEvent::ChannelData { remote_id, data, .. } => self.on_channel_data(&remote_id, &data).await,
            TransportEvent::ChannelClosed { channel_id, remote_id } => {
                let mut state = self.state.write().await;
                if state.channels.get(&remote_id).is_some_and(|c| c.id() == channel_id) {
                    state.channels.remove(&remote_id);
                    tracing::debug!("Side channel to {} closed", remote_id);
                }
            }
            TransportEvent::CallStream {
                call_id,
                remote_id,
                stream,
            } => self.on_call_stream(call_id, &remote_id, stream).await,
            TransportEvent::CallClosed { call_id, remote_id } => self.teardown(&remote_id, call_id, None).await,
            TransportEvent::CallError {
                call_id,
                remote_id,
                error,
            } => self.teardown(&remote_id, call_id, Some(error)).await,
            TransportEvent::Error { remote_id, error } => self.on_transport_error(remote_id, error).await,
            TransportEvent::Disconnected => {
                tracing::warn!("Lost connection to the signaling relay");
                self.notify(Notice::Peer {
                    peer_id: None,
                    message: "signaling relay disconnected".to_string(),
                });
            }
        }
    }

    async fn on_incoming_call(&self, call: Arc<dyn MediaCall>) {
        let remote_id = call.remote_id().to_string();
        let (tracks, superseded) = {
            let mut state = self.state.write().await;
            // Both sides dialed at once: the call placed by the lower id wins
            let yields = state.local_id.as_deref().is_some_and(|local| remote_id.as_str() < local);
            let ours = state.connections.get(&remote_id).map(|c| c.outgoing && c.state == ConnectionState::Negotiating);
            let crossed = state.dialing.contains(&remote_id) || ours == Some(true);
            let duplicate = ours.is_some() || state.dialing.contains(&remote_id);
            if state.closed || (duplicate && !(crossed && yields)) {
                drop(state);
                if crossed {
                    tracing::warn!("Calls with {} crossed, keeping ours", remote_id);
                }
                tracing::info!("Ignoring call {} from {}", call.id(), remote_id);
                call.close().await;
                return;
            }
            if crossed {
                tracing::warn!("Calls with {} crossed, keeping theirs", remote_id);
            }
            let tracks = state
                .outbound
                .as_ref()
                .map(OutboundTracks::from)
                .unwrap_or_default();
            let mut connection = PeerConnection::new(call.clone(), tracks.clone(), false);
            connection.display_name = call.metadata().name.clone();
            let superseded = state.connections.insert(remote_id.clone(), connection);
            (tracks, superseded.map(|c| c.call))
        };

        if let Some(ours) = superseded {
            ours.close().await;
        }

        tracing::info!(
            "Answering call from {} (audio: {}, video: {})",
            remote_id,
            tracks.audio.is_some(),
            tracks.video.is_some()
        );
        if let Err(e) = call.answer(tracks).await {
            self.teardown(&remote_id, call.id(), Some(e.to_string())).await;
        }
    }

    async fn register_channel(&self, channel: Arc<dyn DataChannel>) {
        let remote_id = channel.remote_id().to_string();
        let mut state = self.state.write().await;
        let keep_existing = state
            .channels
            .get(&remote_id)
            .is_some_and(|existing| existing.id() != channel.id() && existing.is_open());
        if state.closed || keep_existing {
            drop(state);
            tracing::debug!("Dropping extra side channel {} from {}", channel.id(), remote_id);
            channel.close().await;
            return;
        }
        state.channels.insert(remote_id, channel);
    }

    async fn on_channel_open(&self, channel_id: LinkId, remote_id: &str) {
        let (channel, name) = {
            let state = self.state.read().await;
            let Some(channel) = state.channels.get(remote_id).filter(|c| c.id() == channel_id).cloned() else {
                tracing::debug!("Open event for unknown side channel {}", channel_id);
                return;
            };
            (channel, state.local_name.clone())
        };

        if let Err(e) = channel.send(&PeerMessage::Identify { name }).await {
            tracing::warn!("Failed to identify to {}: {}", remote_id, e);
        }
    }

    async fn on_channel_data(&self, remote_id: &str, data: &str) {
        match PeerMessage::from_json(data) {
            Ok(PeerMessage::Identify { name }) => {
                let mut state = self.state.write().await;
                tracing::info!("{} identified as {}", remote_id, name);
                state.names.insert(remote_id.to_string(), name.clone());
                if let Some(connection) = state.connections.get_mut(remote_id) {
                    connection.display_name = Some(name.clone());
                }
                let renamed = match state.participants.iter_mut().find(|p| p.peer_id == remote_id) {
                    Some(participant) => {
                        participant.display_name = name;
                        true
                    }
                    None => false,
                };
                if renamed {
                    self.publish_roster(&state);
                }
            }
            Err(e) => tracing::warn!("Ignoring malformed side channel message from {}: {}", remote_id, e),
        }
    }

    async fn on_call_stream(&self, call_id: LinkId, remote_id: &str, stream: RemoteStream) {
        let mut state = self.state.write().await;
        let metadata_name = {
            let Some(connection) = state.connections.get_mut(remote_id) else {
                tracing::debug!("Stream from {} without a connection", remote_id);
                return;
            };
            if connection.call.id() != call_id {
                tracing::debug!("Ignoring stream from superseded call {}", call_id);
                return;
            }
            if connection.state == ConnectionState::Negotiating {
                tracing::info!("Connected to {}", remote_id);
                connection.state = ConnectionState::Connected;
            }
            connection.call.metadata().name.clone()
        };

        let name = state
            .names
            .get(remote_id)
            .cloned()
            .or(metadata_name)
            .unwrap_or_else(|| fallback_name(remote_id));

        match state.participants.iter_mut().find(|p| p.peer_id == remote_id) {
            Some(participant) => participant.stream = Some(stream),
            None => {
                tracing::info!("{} joined as {}", remote_id, name);
                state.participants.push(Participant {
                    peer_id: remote_id.to_string(),
                    display_name: name,
                    is_local: false,
                    stream: Some(stream),
                });
            }
        }
        self.publish_roster(&state);
    }

    async fn on_transport_error(&self, remote_id: Option<String>, error: String) {
        tracing::error!("Transport error ({:?}): {}", remote_id, error);
        self.notify(Notice::Peer {
            peer_id: remote_id.clone(),
            message: error.clone(),
        });

        let Some(remote_id) = remote_id else {
            return;
        };
        let call_id = {
            let state = self.state.read().await;
            state
                .connections
                .get(&remote_id)
                .filter(|c| c.state == ConnectionState::Negotiating)
                .map(|c| c.call.id())
        };
        if let Some(call_id) = call_id {
            self.teardown(&remote_id, call_id, None).await;
        }
    }

    /// Remove the connection for `remote_id` if `call_id` still owns it
    async fn teardown(&self, remote_id: &str, call_id: LinkId, error: Option<String>) {
        let (call, channel) = {
            let mut state = self.state.write().await;
            if !state.connections.get(remote_id).is_some_and(|c| c.call.id() == call_id) {
                tracing::debug!("Ignoring close of unknown call {}", call_id);
                return;
            }
            let Some(mut connection) = state.connections.remove(remote_id) else {
                return;
            };
            connection.state = ConnectionState::Closed;
            state.participants.retain(|p| p.peer_id != remote_id);
            state.names.remove(remote_id);
            let channel = state.channels.remove(remote_id);
            self.publish_roster(&state);
            (connection.call.clone(), channel)
        };

        match error {
            Some(error) => {
                tracing::error!("Connection to {} failed: {}", remote_id, error);
                self.notify(Notice::Peer {
                    peer_id: Some(remote_id.to_string()),
                    message: error,
                });
            }
            None => tracing::info!("Connection to {} closed", remote_id),
        }

        call.close().await;
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    /// Close every connection; later joins and inbound calls are refused
    pub async fn close_all(&self) {
        let (calls, channels) = {
            let mut state = self.state.write().await;
            state.closed = true;
            state.pending_joins.clear();
            state.names.clear();
            state.participants.clear();
            let calls: Vec<_> = state.connections.drain().map(|(_, c)| c.call).collect();
            let channels: Vec<_> = state.channels.drain().map(|(_, c)| c).collect();
            self.publish_roster(&state);
            (calls, channels)
        };

        tracing::info!("Closing {} peer connections", calls.len());
        for call in calls {
            call.close().await;
        }
        for channel in channels {
            channel.close().await;
        }
    }

    fn publish_roster(&self, state: &PeerState) {
        self.roster.send_replace(state.roster());
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaSource;
    use crate::testing::{self, FakeTransport};
    use huddle_protocol::SourceKind;

    fn manager(transport: Arc<FakeTransport>) -> (PeerSessionManager, broadcast::Receiver<Notice>) {
        let (notices, rx) = broadcast::channel(16);
        (PeerSessionManager::new(transport, "Local", notices), rx)
    }

    fn camera_selection() -> OutboundSelection {
        let video = MediaTrack::new(TrackKind::Video, "camera");
        let audio = MediaTrack::new(TrackKind::Audio, "microphone");
        OutboundSelection {
            source: MediaSource::new(SourceKind::Camera, vec![video.clone(), audio.clone()]),
            video: Some(video),
            audio: Some(audio),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());

        let (a, b) = tokio::join!(peers.start(None), peers.start(None));
        assert_eq!(a.unwrap(), "me");
        assert_eq!(b.unwrap(), "me");
        assert_eq!(peers.start(None).await.unwrap(), "me");
        assert_eq!(transport.opens(), 1);
        assert_eq!(peers.local_id().as_deref(), Some("me"));
    }

    #[tokio::test]
    async fn join_waits_for_identity_and_source() {
        let transport = FakeTransport::gated("me");
        let (peers, _) = manager(transport.clone());

        peers.join("them").await;
        peers.on_source_changed(Some(camera_selection())).await;
        assert!(transport.calls_to("them").is_empty());

        let starter = {
            let peers = peers.clone();
            tokio::spawn(async move { peers.start(None).await })
        };
        transport.release_identity();
        starter.await.unwrap().unwrap();

        assert_eq!(transport.calls_to("them").len(), 1);
        assert_eq!(transport.channels_to("them").len(), 1);

        // Later triggers must not dial again
        peers.on_source_changed(Some(camera_selection())).await;
        peers.start(None).await.unwrap();
        assert_eq!(transport.calls_to("them").len(), 1);
    }

    #[tokio::test]
    async fn every_deferred_join_is_dialed_once() {
        let transport = FakeTransport::gated("me");
        let (peers, _) = manager(transport.clone());

        peers.join("bob").await;
        peers.join("carol").await;
        peers.join("bob").await;
        peers.on_source_changed(Some(camera_selection())).await;

        let starter = {
            let peers = peers.clone();
            tokio::spawn(async move { peers.start(None).await })
        };
        transport.release_identity();
        starter.await.unwrap().unwrap();

        assert_eq!(transport.calls_to("bob").len(), 1);
        assert_eq!(transport.calls_to("carol").len(), 1);
        assert_eq!(peers.connection_count().await, 2);

        peers.on_source_changed(Some(camera_selection())).await;
        assert_eq!(transport.calls_to("bob").len(), 1);
        assert_eq!(transport.calls_to("carol").len(), 1);
    }

    #[tokio::test]
    async fn crossed_calls_keep_the_lower_dialer() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());
        peers.start(None).await.unwrap();
        peers.on_source_changed(Some(camera_selection())).await;

        // "alice" sorts before "me": her call wins
        peers.join("alice").await;
        let ours = transport.calls_to("alice").remove(0);
        let theirs = transport.inbound_call("alice", Some("Alice"));
        peers.handle_event(TransportEvent::IncomingCall(theirs.clone())).await;
        assert!(theirs.is_answered());
        assert!(ours.is_closed());
        peers.handle_event(transport.closed_event(&ours)).await;
        peers.handle_event(transport.stream_event(&theirs)).await;
        assert_eq!(peers.connection_state("alice").await, Some(ConnectionState::Connected));

        // "zed" sorts after "me": our call wins
        peers.join("zed").await;
        let ours = transport.calls_to("zed").remove(0);
        let theirs = transport.inbound_call("zed", None);
        peers.handle_event(TransportEvent::IncomingCall(theirs.clone())).await;
        assert!(!theirs.is_answered());
        assert!(theirs.is_closed());
        assert!(!ours.is_closed());
        assert_eq!(peers.connection_count().await, 2);
    }

    #[tokio::test]
    async fn duplicate_inbound_calls_share_one_connection() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());
        peers.start(None).await.unwrap();

        let first = transport.inbound_call("them", Some("Ada"));
        let second = transport.inbound_call("them", Some("Ada"));
        peers.handle_event(TransportEvent::IncomingCall(first.clone())).await;
        peers.handle_event(TransportEvent::IncomingCall(second.clone())).await;
        peers.handle_event(transport.stream_event(&first)).await;
        peers.handle_event(transport.stream_event(&second)).await;

        assert_eq!(peers.connection_count().await, 1);
        assert!(first.is_answered());
        assert!(!second.is_answered());
        assert!(second.is_closed());
        let remotes: Vec<_> = peers.roster().into_iter().filter(|p| !p.is_local).collect();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].display_name, "Ada");
    }

    #[tokio::test]
    async fn inbound_call_without_source_is_answered_empty() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());
        peers.start(None).await.unwrap();

        let call = transport.inbound_call("them", None);
        peers.handle_event(TransportEvent::IncomingCall(call.clone())).await;

        assert!(call.answered_tracks().unwrap().is_empty());
        assert_eq!(peers.connection_state("them").await, Some(ConnectionState::Negotiating));
    }

    #[tokio::test]
    async fn identify_beats_metadata_and_fallback() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());
        peers.start(None).await.unwrap();

        // Name arrives before the stream and is cached
        let channel = transport.inbound_channel("abcdef123");
        peers.handle_event(TransportEvent::IncomingChannel(channel.clone())).await;
        peers
            .handle_event(transport.identify_event(&channel, "Grace"))
            .await;

        let call = transport.inbound_call("abcdef123", Some("metadata name"));
        peers.handle_event(TransportEvent::IncomingCall(call.clone())).await;
        peers.handle_event(transport.stream_event(&call)).await;
        assert_eq!(peers.roster()[1].display_name, "Grace");

        // Without any name the id prefix is used
        let anonymous = transport.inbound_call("zyxwvu987", None);
        peers.handle_event(TransportEvent::IncomingCall(anonymous.clone())).await;
        peers.handle_event(transport.stream_event(&anonymous)).await;
        assert_eq!(peers.roster()[2].display_name, fallback_name("zyxwvu987"));
        assert_eq!(peers.roster()[2].display_name, "Guest zyxwvu");
    }

    #[tokio::test]
    async fn late_identify_updates_participant_in_place() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());
        peers.start(None).await.unwrap();
        let mut roster = peers.subscribe_roster();

        let call = transport.inbound_call("peer-1", Some("From metadata"));
        peers.handle_event(TransportEvent::IncomingCall(call.clone())).await;
        peers.handle_event(transport.stream_event(&call)).await;
        assert_eq!(peers.roster()[1].display_name, "From metadata");

        let channel = transport.inbound_channel("peer-1");
        peers.handle_event(TransportEvent::IncomingChannel(channel.clone())).await;
        let _ = roster.borrow_and_update();
        peers.handle_event(transport.identify_event(&channel, "Renamed")).await;

        assert!(roster.has_changed().unwrap());
        let snapshot = peers.roster();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].display_name, "Renamed");
    }

    #[tokio::test]
    async fn learned_name_is_forgotten_when_connection_closes() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());
        peers.start(None).await.unwrap();

        let channel = transport.inbound_channel("peer-7");
        peers.handle_event(TransportEvent::IncomingChannel(channel.clone())).await;
        peers.handle_event(transport.identify_event(&channel, "Linus")).await;
        let call = transport.inbound_call("peer-7", None);
        peers.handle_event(TransportEvent::IncomingCall(call.clone())).await;
        assert_eq!(peers.display_name("peer-7").await.as_deref(), Some("Linus"));

        peers.handle_event(transport.closed_event(&call)).await;
        assert_eq!(peers.connection_count().await, 0);

        let again = transport.inbound_call("peer-7", None);
        peers.handle_event(TransportEvent::IncomingCall(again.clone())).await;
        assert_eq!(peers.display_name("peer-7").await, Some(fallback_name("peer-7")));
    }

    #[tokio::test]
    async fn channel_open_sends_identify() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());
        peers.start(None).await.unwrap();

        let channel = transport.inbound_channel("them");
        peers.handle_event(TransportEvent::IncomingChannel(channel.clone())).await;
        peers.handle_event(transport.open_event(&channel)).await;

        assert_eq!(
            channel.sent(),
            vec![PeerMessage::Identify {
                name: "Local".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn call_error_removes_participant_and_notifies() {
        let transport = FakeTransport::new("me");
        let (peers, mut notices) = manager(transport.clone());
        peers.start(None).await.unwrap();

        let call = transport.inbound_call("them", None);
        peers.handle_event(TransportEvent::IncomingCall(call.clone())).await;
        peers.handle_event(transport.stream_event(&call)).await;
        assert_eq!(peers.connection_state("them").await, Some(ConnectionState::Connected));

        peers
            .handle_event(TransportEvent::CallError {
                call_id: call.id(),
                remote_id: "them".to_string(),
                error: "ice failed".to_string(),
            })
            .await;

        assert_eq!(peers.connection_count().await, 0);
        assert_eq!(peers.roster().len(), 1);
        assert!(matches!(notices.try_recv(), Ok(Notice::Peer { .. })));
    }

    #[tokio::test]
    async fn source_change_replaces_only_changed_kinds() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());
        peers.start(None).await.unwrap();
        let camera = camera_selection();
        peers.on_source_changed(Some(camera.clone())).await;

        let call = transport.inbound_call("them", None);
        peers.handle_event(TransportEvent::IncomingCall(call.clone())).await;

        let virtual_video = MediaTrack::new(TrackKind::Video, "virtual");
        let selection = OutboundSelection {
            source: MediaSource::new(SourceKind::Virtual, vec![virtual_video.clone()]),
            video: Some(virtual_video.clone()),
            audio: camera.audio.clone(),
        };
        peers.on_source_changed(Some(selection)).await;

        testing::eventually(|| call.replacements(TrackKind::Video) == 1).await;
        assert_eq!(call.replacements(TrackKind::Audio), 0);
        assert_eq!(call.current_track(TrackKind::Video), Some(virtual_video.id()));
    }

    #[tokio::test]
    async fn failed_outbound_call_notifies() {
        let transport = FakeTransport::new("me");
        transport.set_unreachable("ghost");
        let (peers, mut notices) = manager(transport.clone());
        peers.start(None).await.unwrap();
        peers.on_source_changed(Some(camera_selection())).await;

        peers.join("ghost").await;

        assert_eq!(peers.connection_count().await, 0);
        assert!(matches!(
            notices.try_recv(),
            Ok(Notice::Peer { peer_id: Some(id), .. }) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn close_all_refuses_new_work() {
        let transport = FakeTransport::new("me");
        let (peers, _) = manager(transport.clone());
        peers.start(None).await.unwrap();
        let call = transport.inbound_call("them", None);
        peers.handle_event(TransportEvent::IncomingCall(call.clone())).await;

        peers.close_all().await;
        assert!(call.is_closed());

        let late = transport.inbound_call("other", None);
        peers.handle_event(TransportEvent::IncomingCall(late.clone())).await;
        assert!(late.is_closed());
        assert_eq!(peers.connection_count().await, 0);
    }
}
