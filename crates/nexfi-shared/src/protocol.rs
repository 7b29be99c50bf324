use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::{
    EVENT_WEBRTC_ANSWER, EVENT_WEBRTC_ICE, EVENT_WEBRTC_OFFER, FRAME_TYPE_ACK, FRAME_TYPE_DM,
};
use crate::error::ProtocolError;
use crate::types::{opt_string_or_number, UserId};

// ---------------------------------------------------------------------------
// Session descriptions and ICE candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

// ---------------------------------------------------------------------------
// Signaling envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpSignal {
    pub from: UserId,
    pub to: UserId,
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceSignal {
    pub from: UserId,
    pub to: UserId,
    pub candidate: IceCandidate,
}

/// Messages carried by the signaling channel. Each variant maps to one named
/// event; the variant payload is the event data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalEnvelope {
    #[serde(rename = "dm:webrtc_offer")]
    Offer(SdpSignal),
    #[serde(rename = "dm:webrtc_answer")]
    Answer(SdpSignal),
    #[serde(rename = "dm:webrtc_ice")]
    IceCandidate(IceSignal),
}

impl SignalEnvelope {
    pub fn offer(from: UserId, to: UserId, sdp: SessionDescription) -> Self {
        Self::Offer(SdpSignal { from, to, sdp })
    }

    pub fn answer(from: UserId, to: UserId, sdp: SessionDescription) -> Self {
        Self::Answer(SdpSignal { from, to, sdp })
    }

    pub fn ice(from: UserId, to: UserId, candidate: IceCandidate) -> Self {
        Self::IceCandidate(IceSignal {
            from,
            to,
            candidate,
        })
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Offer(_) => EVENT_WEBRTC_OFFER,
            Self::Answer(_) => EVENT_WEBRTC_ANSWER,
            Self::IceCandidate(_) => EVENT_WEBRTC_ICE,
        }
    }

    pub fn sender(&self) -> &UserId {
        match self {
            Self::Offer(s) | Self::Answer(s) => &s.from,
            Self::IceCandidate(s) => &s.from,
        }
    }

    pub fn target(&self) -> &UserId {
        match self {
            Self::Offer(s) | Self::Answer(s) => &s.to,
            Self::IceCandidate(s) => &s.to,
        }
    }

    /// Event payload as sent on a named-event transport.
    pub fn data(&self) -> Result<serde_json::Value, ProtocolError> {
        let value = match self {
            Self::Offer(s) | Self::Answer(s) => serde_json::to_value(s)?,
            Self::IceCandidate(s) => serde_json::to_value(s)?,
        };
        Ok(value)
    }

    /// Rebuild an envelope from a named event received on the signaling transport.
    pub fn from_event(event: &str, data: serde_json::Value) -> Result<Self, ProtocolError> {
        match event {
            EVENT_WEBRTC_OFFER => Ok(Self::Offer(serde_json::from_value(data)?)),
            EVENT_WEBRTC_ANSWER => Ok(Self::Answer(serde_json::from_value(data)?)),
            EVENT_WEBRTC_ICE => Ok(Self::IceCandidate(serde_json::from_value(data)?)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Direct data-channel frames
// ---------------------------------------------------------------------------

/// Body of a `dm` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmPayload {
    pub local_id: String,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub text: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub voice: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub mood: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Frames exchanged over the direct data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DirectFrame {
    #[serde(rename = "dm")]
    Dm(DmPayload),
    #[serde(rename = "dm:ack")]
    Ack { local_id: String },
}

impl DirectFrame {
    /// Parse a text frame.
    ///
    /// Returns `Ok(None)` for well-formed JSON carrying a `type` this client
    /// does not handle; malformed input is an error.
    pub fn parse(text: &str) -> Result<Option<Self>, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match value.get("type").and_then(serde_json::Value::as_str) {
            Some(FRAME_TYPE_DM) | Some(FRAME_TYPE_ACK) => Ok(Some(serde_json::from_value(value)?)),
            _ => Ok(None),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Backend sync
// ---------------------------------------------------------------------------

/// Body of `POST /api/messages/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub text: String,
    pub image: Option<String>,
    pub voice: Option<String>,
    pub mood: Option<String>,
    /// Client-side message id; the backend's dedup key.
    pub local_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub message_id: Option<String>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_frame_has_flat_type_tag() {
        let frame = DirectFrame::Dm(DmPayload {
            local_id: "m1".into(),
            from_user_id: "1".into(),
            to_user_id: "2".into(),
            text: "hi".into(),
            image: None,
            voice: None,
            mood: Some("happy".into()),
            timestamp: None,
        });

        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "dm");
        assert_eq!(json["local_id"], "m1");
        assert_eq!(json["mood"], "happy");
    }

    #[test]
    fn parse_accepts_browser_shaped_frame() {
        let raw = r#"{"type":"dm","local_id":"abc","from_user_id":7,"to_user_id":"9",
                      "text":null,"image":"","voice":"","mood":null,
                      "timestamp":"2024-03-01T10:00:00.000Z"}"#;

        match DirectFrame::parse(raw).unwrap() {
            Some(DirectFrame::Dm(dm)) => {
                assert_eq!(dm.from_user_id, UserId::from("7"));
                assert_eq!(dm.text, "");
                assert_eq!(dm.image, None);
                assert!(dm.timestamp.is_some());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parse_ignores_unknown_types_and_rejects_garbage() {
        assert!(DirectFrame::parse(r#"{"type":"typing"}"#).unwrap().is_none());
        assert!(DirectFrame::parse(r#"{"text":"no type"}"#).unwrap().is_none());
        assert!(DirectFrame::parse("not json").is_err());
        assert!(DirectFrame::parse(r#"{"type":"dm","text":"missing ids"}"#).is_err());
    }

    #[test]
    fn ack_frame_parses() {
        let parsed = DirectFrame::parse(r#"{"type":"dm:ack","local_id":"abc"}"#).unwrap();
        assert_eq!(
            parsed,
            Some(DirectFrame::Ack {
                local_id: "abc".into()
            })
        );
    }

    #[test]
    fn signal_envelope_named_events() {
        let env = SignalEnvelope::offer("a".into(), "b".into(), SessionDescription::offer("v=0"));
        assert_eq!(env.event_name(), "dm:webrtc_offer");

        let data = env.data().unwrap();
        assert_eq!(data["sdp"]["type"], "offer");
        assert_eq!(data["from"], "a");

        let rebuilt = SignalEnvelope::from_event(env.event_name(), data).unwrap();
        assert_eq!(rebuilt, env);

        assert!(matches!(
            SignalEnvelope::from_event("dm:hangup", serde_json::json!({})),
            Err(ProtocolError::UnknownEvent(_))
        ));
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let raw = r#"{"from":"a","to":"b","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let env = SignalEnvelope::from_event("dm:webrtc_ice", serde_json::from_str(raw).unwrap())
            .unwrap();
        match env {
            SignalEnvelope::IceCandidate(ice) => {
                assert_eq!(ice.candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(ice.candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn sync_response_accepts_numeric_message_id() {
        let resp: SyncResponse =
            serde_json::from_str(r#"{"success":true,"message_id":1234}"#).unwrap();
        assert!(resp.success);
        assert_eq!(resp.message_id.as_deref(), Some("1234"));

        let resp: SyncResponse = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert_eq!(resp.message_id, None);
    }
}
