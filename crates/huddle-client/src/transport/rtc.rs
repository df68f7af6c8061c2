//! webrtc-rs transport
//!
//! One `RTCPeerConnection` per link. Media links always carry one audio
//! and one video sender, fed by [`TrackPump`]s, so changing sources never
//! needs a new offer. Side channels are data-only links with a single
//! `huddle-meta` data channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use async_trait::async_trait;
use huddle_media::EncoderFactory;
use huddle_protocol::{
    AnswerPayload, CallMetadata, CandidatePayload, ConnectionKind, IceCandidate, IceServer, OfferPayload, PeerMessage,
    SignalMessage, TrackKind,
};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{Settings, SignalingSettings};
use crate::error::TransportError;
use crate::media::MediaTrack;
use crate::transport::pump::TrackPump;
use crate::transport::signaling::SignalingClient;
use crate::transport::{
    DataChannel, LinkId, MediaCall, OutboundTracks, RemoteStream, RemoteTrack, Transport, TransportEvent,
};

pub const DATA_CHANNEL_LABEL: &str = "huddle-meta";

// Baseline profile, level 3.1, packetization-mode=1
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

const REMOTE_PACKET_BUFFER: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub signaling: SignalingSettings,
    pub ice_servers: Vec<IceServer>,
}

impl From<&Settings> for RtcConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            signaling: settings.signaling.clone(),
            ice_servers: settings.ice_servers.clone(),
        }
    }
}

fn capability(mime_type: &str) -> RTCRtpCodecCapability {
    let (clock_rate, channels, fmtp) = match mime_type {
        MIME_TYPE_OPUS => (48_000, 2, OPUS_FMTP),
        MIME_TYPE_H264 => (90_000, 0, H264_FMTP),
        _ => (90_000, 0, ""),
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_string(),
        clock_rate,
        channels,
        sdp_fmtp_line: fmtp.to_string(),
        rtcp_feedback: vec![],
    }
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    for (mime_type, payload_type, kind) in [
        (MIME_TYPE_VP8, 96, RTPCodecType::Video),
        (MIME_TYPE_H264, 102, RTPCodecType::Video),
        (MIME_TYPE_OPUS, 111, RTPCodecType::Audio),
    ] {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: capability(mime_type),
                payload_type,
                ..Default::default()
            },
            kind,
        )?;
    }

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// One peer connection and what we know about its negotiation
struct Link {
    id: LinkId,
    remote_id: String,
    kind: ConnectionKind,
    pc: Arc<RTCPeerConnection>,
    remote_described: AtomicBool,
    /// Candidates that arrived before the remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    closed: AtomicBool,
    remote_stream: Mutex<RemoteStream>,
}

impl Link {
    async fn apply_remote(&self, description: RTCSessionDescription) -> Result<(), TransportError> {
        self.pc.set_remote_description(description).await?;
        let pending = {
            let mut pending = lock(&self.pending_candidates);
            self.remote_described.store(true, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered candidate for {}: {}", self.remote_id, e);
            }
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), TransportError> {
        {
            let mut pending = lock(&self.pending_candidates);
            if !self.remote_described.load(Ordering::SeqCst) {
                pending.push(candidate);
                return Ok(());
            }
        }
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }
}

struct Shared {
    api: API,
    config: RtcConfig,
    encoders: Arc<dyn EncoderFactory>,
    signaling: RwLock<Option<Arc<SignalingClient>>>,
    links: RwLock<HashMap<LinkId, Arc<Link>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn signaling(&self) -> Result<Arc<SignalingClient>, TransportError> {
        self.signaling.read().await.clone().ok_or(TransportError::NotOpen)
    }

    async fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        self.signaling().await?.send(message).await
    }

    async fn link(&self, id: LinkId) -> Option<Arc<Link>> {
        self.links.read().await.get(&id).cloned()
    }

    async fn remove_link(&self, id: LinkId) {
        self.links.write().await.remove(&id);
    }

    async fn new_link(self: &Arc<Self>, id: LinkId, remote_id: &str, kind: ConnectionKind) -> Result<Arc<Link>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&self.config.ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let link = Arc::new(Link {
            id,
            remote_id: remote_id.to_string(),
            kind,
            pc: pc.clone(),
            remote_described: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            remote_stream: Mutex::new(RemoteStream {
                id: id.to_string(),
                tracks: Vec::new(),
            }),
        });

        let shared = Arc::downgrade(self);
        let remote = remote_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let shared = shared.clone();
            let remote = remote.clone();
            Box::pin(async move {
                let (Some(candidate), Some(shared)) = (candidate, shared.upgrade()) else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        tracing::warn!("Failed to serialize ICE candidate: {}", e);
                        return;
                    }
                };
                let message = SignalMessage::Candidate {
                    src: None,
                    dst: Some(remote),
                    payload: CandidatePayload {
                        connection_id: id,
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        },
                    },
                };
                if let Err(e) = shared.send(message).await {
                    tracing::debug!("Dropping local candidate: {}", e);
                }
            })
        }));

        let shared = Arc::downgrade(self);
        let weak_link = Arc::downgrade(&link);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let shared = shared.clone();
            let link = weak_link.clone();
            Box::pin(async move {
                let (Some(shared), Some(link)) = (shared.upgrade(), link.upgrade()) else {
                    return;
                };
                tracing::debug!("Link {} to {} is {}", link.id, link.remote_id, state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        tracing::info!("Peer connection to {} established", link.remote_id);
                    }
                    RTCPeerConnectionState::Failed => {
                        shared.link_closed(&link, Some("peer connection failed".to_string())).await;
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        shared.link_closed(&link, None).await;
                    }
                    _ => {}
                }
            })
        }));

        if kind == ConnectionKind::Media {
            let shared = Arc::downgrade(self);
            let weak_link = Arc::downgrade(&link);
            pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let shared = shared.clone();
                let link = weak_link.clone();
                Box::pin(async move {
                    if let (Some(shared), Some(link)) = (shared.upgrade(), link.upgrade()) {
                        shared.on_remote_track(&link, track);
                    }
                })
            }));
        }

        Ok(link)
    }

    fn on_remote_track(&self, link: &Link, track: Arc<TrackRemote>) {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => return,
        };
        tracing::info!("Receiving {} track {} from {}", kind, track.id(), link.remote_id);

        let (packets, _) = broadcast::channel(REMOTE_PACKET_BUFFER);
        let remote = RemoteTrack {
            id: track.id(),
            kind,
            packets: packets.clone(),
        };

        let remote_id = link.remote_id.clone();
        tokio::spawn(async move {
            let mut packet_count = 0u64;
            loop {
                match track.read_rtp().await {
                    Ok((packet, _attributes)) => {
                        packet_count += 1;
                        if packet_count % 500 == 1 {
                            tracing::debug!(
                                "Received {} packet {} from {}, payload size: {}",
                                kind,
                                packet_count,
                                remote_id,
                                packet.payload.len()
                            );
                        }
                        let _ = packets.send(packet.payload);
                    }
                    Err(e) => {
                        tracing::info!("Remote {} track from {} ended: {}", kind, remote_id, e);
                        break;
                    }
                }
            }
        });

        let stream = {
            let mut stream = lock(&link.remote_stream);
            stream.tracks.retain(|t| t.kind != kind);
            stream.tracks.push(remote);
            stream.clone()
        };
        self.emit(TransportEvent::CallStream {
            call_id: link.id,
            remote_id: link.remote_id.clone(),
            stream,
        });
    }

    /// Report a link that went away on its own, once
    async fn link_closed(&self, link: &Link, error: Option<String>) {
        if link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.remove_link(link.id).await;

        let remote_id = link.remote_id.clone();
        let event = match (link.kind, error) {
            (ConnectionKind::Media, Some(error)) => TransportEvent::CallError {
                call_id: link.id,
                remote_id,
                error,
            },
            (ConnectionKind::Media, None) => TransportEvent::CallClosed {
                call_id: link.id,
                remote_id,
            },
            (ConnectionKind::Data, _) => TransportEvent::ChannelClosed {
                channel_id: link.id,
                remote_id,
            },
        };
        self.emit(event);
    }

    async fn close_links_to(&self, remote_id: &str) {
        let links: Vec<_> = self
            .links
            .read()
            .await
            .values()
            .filter(|l| l.remote_id == remote_id)
            .cloned()
            .collect();
        for link in links {
            self.link_closed(&link, None).await;
            if let Err(e) = link.pc.close().await {
                tracing::debug!("Error closing link {}: {}", link.id, e);
            }
        }
    }

    async fn on_signal(self: &Arc<Self>, message: SignalMessage) -> Result<(), TransportError> {
        match message {
            SignalMessage::Offer {
                src: Some(src),
                payload,
                ..
            } => match payload.kind {
                ConnectionKind::Media => self.on_media_offer(src, payload).await,
                ConnectionKind::Data => self.on_data_offer(src, payload).await,
            },
            SignalMessage::Answer { payload, .. } => {
                let link = self
                    .link(payload.connection_id)
                    .await
                    .ok_or_else(|| TransportError::WebRtc(format!("answer for unknown link {}", payload.connection_id)))?;
                link.apply_remote(RTCSessionDescription::answer(payload.sdp)?).await
            }
            SignalMessage::Candidate { payload, .. } => {
                let Some(link) = self.link(payload.connection_id).await else {
                    tracing::debug!("Candidate for unknown link {}", payload.connection_id);
                    return Ok(());
                };
                let candidate = payload.candidate;
                link.add_candidate(RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: candidate.username_fragment,
                })
                .await
            }
            SignalMessage::Leave { src: Some(src), .. } => {
                tracing::info!("{} left", src);
                self.close_links_to(&src).await;
                Ok(())
            }
            SignalMessage::Expire { src: Some(src), .. } => {
                tracing::warn!("Could not reach {}", src);
                self.emit(TransportEvent::Error {
                    remote_id: Some(src.clone()),
                    error: format!("peer {} is unavailable", src),
                });
                self.close_links_to(&src).await;
                Ok(())
            }
            SignalMessage::Error { payload } => {
                tracing::error!("Relay error: {}", payload.msg);
                self.emit(TransportEvent::Error {
                    remote_id: None,
                    error: payload.msg,
                });
                Ok(())
            }
            other => {
                tracing::debug!("Ignoring signal {:?}", other);
                Ok(())
            }
        }
    }

    async fn on_media_offer(self: &Arc<Self>, src: String, payload: OfferPayload) -> Result<(), TransportError> {
        tracing::info!("Incoming call {} from {}", payload.connection_id, src);
        let link = self.new_link(payload.connection_id, &src, ConnectionKind::Media).await?;
        let call = Arc::new(RtcCall {
            shared: self.clone(),
            link: link.clone(),
            metadata: payload.metadata,
            offer: Mutex::new(Some(payload.sdp)),
            pumps: Mutex::new(None),
        });
        self.links.write().await.insert(link.id, link);
        self.emit(TransportEvent::IncomingCall(call));
        Ok(())
    }

    async fn on_data_offer(self: &Arc<Self>, src: String, payload: OfferPayload) -> Result<(), TransportError> {
        tracing::info!("Incoming side channel {} from {}", payload.connection_id, src);
        let link = self.new_link(payload.connection_id, &src, ConnectionKind::Data).await?;
        let channel = Arc::new(RtcChannel::new(self.clone(), link.clone()));

        let weak_channel = Arc::downgrade(&channel);
        link.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel = weak_channel.clone();
            Box::pin(async move {
                if let Some(channel) = channel.upgrade() {
                    channel.bind(dc);
                }
            })
        }));

        self.links.write().await.insert(link.id, link.clone());
        self.emit(TransportEvent::IncomingChannel(channel));

        link.apply_remote(RTCSessionDescription::offer(payload.sdp)?).await?;
        let answer = link.pc.create_answer(None).await?;
        link.pc.set_local_description(answer.clone()).await?;
        self.send(SignalMessage::Answer {
            src: None,
            dst: Some(src),
            payload: AnswerPayload {
                connection_id: link.id,
                sdp: answer.sdp,
            },
        })
        .await
    }

    async fn offer(&self, link: &Link, metadata: CallMetadata) -> Result<(), TransportError> {
        let offer = link.pc.create_offer(None).await?;
        link.pc.set_local_description(offer.clone()).await?;
        self.send(SignalMessage::Offer {
            src: None,
            dst: Some(link.remote_id.clone()),
            payload: OfferPayload {
                connection_id: link.id,
                kind: link.kind,
                sdp: offer.sdp,
                metadata,
            },
        })
        .await
    }

    /// Close a link we own; no closed event is raised for it
    async fn close_link(&self, link: &Link) {
        link.closed.store(true, Ordering::SeqCst);
        self.remove_link(link.id).await;
        if let Err(e) = link.pc.close().await {
            tracing::debug!("Error closing link {}: {}", link.id, e);
        }
    }
}

/// Outgoing audio and video senders of one call
struct CallPumps {
    audio: TrackPump,
    video: TrackPump,
}

impl CallPumps {
    async fn attach(
        pc: &RTCPeerConnection,
        encoders: &Arc<dyn EncoderFactory>,
        stream_id: &str,
        tracks: &OutboundTracks,
    ) -> Result<Self, TransportError> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            capability(encoders.audio_codec().mime_type()),
            "audio".to_string(),
            stream_id.to_string(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            capability(encoders.video_codec().mime_type()),
            "video".to_string(),
            stream_id.to_string(),
        ));

        for track in [&audio, &video] {
            let sender = pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // RTCP has to be read for the interceptors to work
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }

        Ok(Self {
            audio: TrackPump::spawn(TrackKind::Audio, audio, encoders.clone(), tracks.audio.clone()),
            video: TrackPump::spawn(TrackKind::Video, video, encoders.clone(), tracks.video.clone()),
        })
    }

    fn pump(&self, kind: TrackKind) -> &TrackPump {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }
}

pub struct RtcCall {
    shared: Arc<Shared>,
    link: Arc<Link>,
    metadata: CallMetadata,
    /// Remote offer of an inbound call, consumed by `answer`
    offer: Mutex<Option<String>>,
    pumps: Mutex<Option<CallPumps>>,
}

#[async_trait]
impl MediaCall for RtcCall {
    fn id(&self) -> LinkId {
        self.link.id
    }

    fn remote_id(&self) -> &str {
        &self.link.remote_id
    }

    fn metadata(&self) -> &CallMetadata {
        &self.metadata
    }

    async fn answer(&self, tracks: OutboundTracks) -> Result<(), TransportError> {
        let offer = lock(&self.offer)
            .take()
            .ok_or_else(|| TransportError::WebRtc("call already answered".to_string()))?;

        let pc = &self.link.pc;
        self.link.apply_remote(RTCSessionDescription::offer(offer)?).await?;
        let pumps = CallPumps::attach(pc, &self.shared.encoders, &self.link.id.to_string(), &tracks).await?;
        *lock(&self.pumps) = Some(pumps);

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        self.shared
            .send(SignalMessage::Answer {
                src: None,
                dst: Some(self.link.remote_id.clone()),
                payload: AnswerPayload {
                    connection_id: self.link.id,
                    sdp: answer.sdp,
                },
            })
            .await?;

        tracing::info!("Answered call {} from {}", self.link.id, self.link.remote_id);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<Arc<MediaTrack>>) -> Result<(), TransportError> {
        match lock(&self.pumps).as_ref() {
            Some(pumps) => {
                pumps.pump(kind).set_source(track);
                Ok(())
            }
            None => Err(TransportError::NotOpen),
        }
    }

    async fn close(&self) {
        lock(&self.pumps).take();
        self.shared.close_link(&self.link).await;
    }
}

pub struct RtcChannel {
    shared: Arc<Shared>,
    link: Arc<Link>,
    channel: OnceLock<Arc<RTCDataChannel>>,
    open: Arc<AtomicBool>,
}

impl RtcChannel {
    fn new(shared: Arc<Shared>, link: Arc<Link>) -> Self {
        Self {
            shared,
            link,
            channel: OnceLock::new(),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    fn bind(&self, dc: Arc<RTCDataChannel>) {
        if dc.label() != DATA_CHANNEL_LABEL {
            tracing::debug!("Ignoring data channel {:?} from {}", dc.label(), self.link.remote_id);
            return;
        }
        if self.channel.set(dc.clone()).is_err() {
            tracing::warn!("Side channel to {} already bound", self.link.remote_id);
            return;
        }

        let open = self.open.clone();
        let shared = Arc::downgrade(&self.shared);
        let (link_id, remote_id) = (self.link.id, self.link.remote_id.clone());
        dc.on_open(Box::new(move || {
            let open = open.clone();
            let shared = shared.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                open.store(true, Ordering::SeqCst);
                if let Some(shared) = shared.upgrade() {
                    tracing::debug!("Side channel to {} open", remote_id);
                    shared.emit(TransportEvent::ChannelOpen {
                        channel_id: link_id,
                        remote_id,
                    });
                }
            })
        }));

        let shared = Arc::downgrade(&self.shared);
        let remote_id = self.link.remote_id.clone();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let shared = shared.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                if !message.is_string {
                    tracing::debug!("Ignoring binary side channel message from {}", remote_id);
                    return;
                }
                let Ok(data) = String::from_utf8(message.data.to_vec()) else {
                    tracing::warn!("Side channel message from {} is not UTF-8", remote_id);
                    return;
                };
                if let Some(shared) = shared.upgrade() {
                    shared.emit(TransportEvent::ChannelData {
                        channel_id: link_id,
                        remote_id,
                        data,
                    });
                }
            })
        }));

        let open = self.open.clone();
        let shared = Arc::downgrade(&self.shared);
        let link = Arc::downgrade(&self.link);
        dc.on_close(Box::new(move || {
            let open = open.clone();
            let shared = shared.clone();
            let link = link.clone();
            Box::pin(async move {
                open.store(false, Ordering::SeqCst);
                if let (Some(shared), Some(link)) = (shared.upgrade(), link.upgrade()) {
                    shared.link_closed(&link, None).await;
                }
            })
        }));
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn id(&self) -> LinkId {
        self.link.id
    }

    fn remote_id(&self) -> &str {
        &self.link.remote_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self
                .channel
                .get()
                .is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    async fn send(&self, message: &PeerMessage) -> Result<(), TransportError> {
        let dc = self.channel.get().filter(|_| self.is_open()).ok_or(TransportError::ChannelClosed)?;
        dc.send_text(message.to_json()?).await?;
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(dc) = self.channel.get() {
            if let Err(e) = dc.close().await {
                tracing::debug!("Error closing side channel: {}", e);
            }
        }
        self.shared.close_link(&self.link).await;
    }
}

/// [`Transport`] over webrtc-rs and a websocket signaling relay
pub struct RtcTransport {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RtcTransport {
    pub fn new(config: RtcConfig, encoders: Arc<dyn EncoderFactory>) -> Result<Self, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(Shared {
                api: build_api()?,
                config,
                encoders,
                signaling: RwLock::new(None),
                links: RwLock::new(HashMap::new()),
                events: events_tx,
            }),
            events: Mutex::new(Some(events_rx)),
            dispatcher: Mutex::new(None),
        })
    }
}

async fn dispatch(shared: Weak<Shared>, mut inbound: mpsc::UnboundedReceiver<SignalMessage>) {
    while let Some(message) = inbound.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if let Err(e) = shared.on_signal(message).await {
            tracing::warn!("Failed to handle signaling message: {}", e);
        }
    }

    if let Some(shared) = shared.upgrade() {
        tracing::warn!("Signaling connection lost");
        shared.emit(TransportEvent::Disconnected);
    }
}

#[async_trait]
impl Transport for RtcTransport {
    async fn open(&self, requested_id: Option<&str>) -> Result<String, TransportError> {
        if let Some(client) = self.shared.signaling.read().await.as_ref() {
            return Ok(client.id().to_string());
        }

        let (client, inbound) = SignalingClient::connect(&self.shared.config.signaling, requested_id).await?;
        let id = client.id().to_string();
        *self.shared.signaling.write().await = Some(Arc::new(client));

        let task = tokio::spawn(dispatch(Arc::downgrade(&self.shared), inbound));
        if let Some(previous) = lock(&self.dispatcher).replace(task) {
            previous.abort();
        }
        Ok(id)
    }

    async fn call(
        &self,
        remote_id: &str,
        tracks: OutboundTracks,
        metadata: CallMetadata,
    ) -> Result<Arc<dyn MediaCall>, TransportError> {
        self.shared.signaling().await?;

        let id = Uuid::new_v4();
        let link = self.shared.new_link(id, remote_id, ConnectionKind::Media).await?;
        let call = Arc::new(RtcCall {
            shared: self.shared.clone(),
            link: link.clone(),
            metadata: metadata.clone(),
            offer: Mutex::new(None),
            pumps: Mutex::new(None),
        });

        let negotiated = async {
            let pumps = CallPumps::attach(&link.pc, &self.shared.encoders, &id.to_string(), &tracks).await?;
            *lock(&call.pumps) = Some(pumps);
            self.shared.links.write().await.insert(id, link.clone());
            self.shared.offer(&link, metadata).await
        }
        .await;

        if let Err(e) = negotiated {
            call.close().await;
            return Err(e);
        }
        tracing::info!("Calling {} on link {}", remote_id, id);
        Ok(call)
    }

    async fn connect(&self, remote_id: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.shared.signaling().await?;

        let id = Uuid::new_v4();
        let link = self.shared.new_link(id, remote_id, ConnectionKind::Data).await?;
        let channel = Arc::new(RtcChannel::new(self.shared.clone(), link.clone()));

        let negotiated = async {
            let dc = link.pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
            channel.bind(dc);
            self.shared.links.write().await.insert(id, link.clone());
            self.shared.offer(&link, CallMetadata::default()).await
        }
        .await;

        if let Err(e) = negotiated {
            channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        lock(&self.events).take()
    }

    async fn shutdown(&self) {
        if let Some(client) = self.shared.signaling.write().await.take() {
            client.close();
        }
        if let Some(task) = lock(&self.dispatcher).take() {
            task.abort();
        }

        let links: Vec<_> = self.shared.links.write().await.drain().map(|(_, link)| link).collect();
        tracing::info!("Closing {} links", links.len());
        for link in links {
            link.closed.store(true, Ordering::SeqCst);
            if let Err(e) = link.pc.close().await {
                tracing::debug!("Error closing link {}: {}", link.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_media::{AudioCodec, AudioEncoder, EncoderError, VideoCodec, VideoEncoder};

    struct NoEncoders;

    impl EncoderFactory for NoEncoders {
        fn video_codec(&self) -> VideoCodec {
            VideoCodec::VP8
        }

        fn audio_codec(&self) -> AudioCodec {
            AudioCodec::Opus
        }

        fn video_encoder(&self, _: u32, _: u32, _: u32) -> Result<Box<dyn VideoEncoder>, EncoderError> {
            Err(EncoderError::Unavailable("vp8".to_string()))
        }

        fn audio_encoder(&self) -> Result<Box<dyn AudioEncoder>, EncoderError> {
            Err(EncoderError::Unavailable("opus".to_string()))
        }
    }

    fn transport() -> RtcTransport {
        let config = RtcConfig::from(&Settings::default());
        RtcTransport::new(config, Arc::new(NoEncoders)).unwrap()
    }

    #[test]
    fn capabilities_match_codec() {
        let opus = capability(AudioCodec::Opus.mime_type());
        assert_eq!(opus.clock_rate, 48_000);
        assert_eq!(opus.channels, 2);

        let h264 = capability(VideoCodec::H264.mime_type());
        assert_eq!(h264.clock_rate, 90_000);
        assert!(h264.sdp_fmtp_line.contains("packetization-mode=1"));

        assert!(capability(VideoCodec::VP8.mime_type()).sdp_fmtp_line.is_empty());
    }

    #[test]
    fn ice_servers_carry_credentials() {
        let servers = rtc_ice_servers(&[IceServer {
            urls: vec!["turn:turn.example:3478".to_string()],
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        }]);
        assert_eq!(servers[0].urls, vec!["turn:turn.example:3478".to_string()]);
        assert_eq!(servers[0].username, "user");
        assert_eq!(servers[0].credential, "secret");
    }

    #[tokio::test]
    async fn calling_before_open_fails() {
        let transport = transport();
        let result = transport
            .call("bob", OutboundTracks::default(), CallMetadata::default())
            .await;
        assert!(matches!(result, Err(TransportError::NotOpen)));
        assert!(matches!(transport.connect("bob").await, Err(TransportError::NotOpen)));
    }

    #[test]
    fn events_can_be_taken_once() {
        let transport = transport();
        assert!(transport.take_events().is_some());
        assert!(transport.take_events().is_none());
    }
}
