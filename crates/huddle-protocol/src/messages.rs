use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::CallMetadata;

/// Messages exchanged between peers over the side data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Announce the sender's display name
    Identify { name: String },
}

impl PeerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Which kind of link an offer negotiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Media,
    Data,
}

/// Envelope exchanged with the signaling relay
///
/// The relay only forwards messages between `src` and `dst`; it never
/// interprets SDP or candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum SignalMessage {
    /// The relay accepted our identity
    Open,

    /// The requested identity is already registered
    IdTaken,

    /// Relay-side failure
    Error { payload: ErrorPayload },

    /// Keepalive, sent by the client
    Heartbeat,

    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: OfferPayload,
    },

    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: AnswerPayload,
    },

    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: CandidatePayload,
    },

    /// The remote peer left the relay
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
    },

    /// A message to `src` could not be delivered
    Expire {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub connection_id: Uuid,
    pub kind: ConnectionKind,
    pub sdp: String,
    #[serde(default)]
    pub metadata: CallMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub connection_id: Uuid,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub connection_id: Uuid,
    pub candidate: IceCandidate,
}

/// Trickled ICE candidate, mirrors the browser's RTCIceCandidateInit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_uses_type_tag() {
        let msg = PeerMessage::Identify {
            name: "Grace".to_string(),
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"identify","name":"Grace"}"#
        );
        assert_eq!(
            PeerMessage::from_json(r#"{"name":"Grace","type":"identify"}"#).unwrap(),
            msg
        );
    }

    #[test]
    fn unknown_peer_message_is_rejected() {
        assert!(PeerMessage::from_json(r#"{"type":"wave"}"#).is_err());
    }

    #[test]
    fn signal_tags_are_screaming_kebab() {
        let json = serde_json::to_value(SignalMessage::IdTaken).unwrap();
        assert_eq!(json["type"], "ID-TAKEN");

        let leave: SignalMessage =
            serde_json::from_str(r#"{"type":"LEAVE","src":"peer-a"}"#).unwrap();
        assert_eq!(
            leave,
            SignalMessage::Leave {
                src: Some("peer-a".to_string()),
                dst: None
            }
        );
    }

    #[test]
    fn offer_metadata_defaults_when_absent() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"OFFER","src":"a","dst":"b","payload":{{"connection_id":"{id}","kind":"media","sdp":"v=0"}}}}"#
        );
        match serde_json::from_str::<SignalMessage>(&raw).unwrap() {
            SignalMessage::Offer { payload, .. } => {
                assert_eq!(payload.connection_id, id);
                assert_eq!(payload.kind, ConnectionKind::Media);
                assert_eq!(payload.metadata, CallMetadata::default());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
