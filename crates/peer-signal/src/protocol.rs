//! Wire format spoken with the relay.
//!
//! Every frame is a JSON envelope `{type, payload?, src?, dst?}`. The relay
//! fills in `src` when forwarding; clients address frames with `dst`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SignalError, SignalResult};
use crate::ids::{ConnectionId, ConnectionType, PeerId};

/// Value sent in the `browser` field of offers and answers.
pub const BROWSER: &str = "peer-signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "CANDIDATE")]
    Candidate,
    #[serde(rename = "OFFER")]
    Offer,
    #[serde(rename = "ANSWER")]
    Answer,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "ID-TAKEN")]
    IdTaken,
    #[serde(rename = "INVALID-KEY")]
    InvalidKey,
    #[serde(rename = "LEAVE")]
    Leave,
    #[serde(rename = "EXPIRE")]
    Expire,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignallingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<PeerId>,
}

impl SignallingMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
            src: None,
            dst: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat)
    }

    pub fn addressed(
        kind: MessageType,
        payload: impl Serialize,
        src: &PeerId,
        dst: &PeerId,
    ) -> SignalResult<Self> {
        Ok(Self {
            kind,
            payload: Some(serde_json::to_value(payload)?),
            src: Some(src.clone()),
            dst: Some(dst.clone()),
        })
    }

    pub fn decode(text: &str) -> SignalResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> SignalResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn source(&self) -> SignalResult<&PeerId> {
        self.src
            .as_ref()
            .ok_or_else(|| SignalError::Protocol(format!("{:?} frame without src", self.kind)))
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> SignalResult<T> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| SignalError::Protocol(format!("{:?} frame without payload", self.kind)))?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Human readable reason carried in `payload.msg`, or `fallback`.
    pub fn reason(&self, fallback: &str) -> String {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("msg"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| fallback.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    pub candidate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Serialization {
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "binary-utf8")]
    BinaryUtf8,
    #[serde(rename = "json")]
    Json,
}

/// Extra fields carried by offers of type `data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataOfferOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<Serialization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
}

impl DataOfferOptions {
    pub fn json() -> Self {
        Self {
            serialization: Some(Serialization::Json),
            ..Self::default()
        }
    }
}

/// Payload shared by OFFER and ANSWER frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(flatten)]
    pub data: DataOfferOptions,
}

impl OfferPayload {
    pub fn new(sdp: SessionDescription, kind: ConnectionType, connection_id: ConnectionId) -> Self {
        let data = match kind {
            ConnectionType::Data => DataOfferOptions::json(),
            ConnectionType::Media => DataOfferOptions::default(),
        };
        Self {
            sdp,
            kind,
            connection_id,
            browser: Some(BROWSER.to_owned()),
            data,
        }
    }

    /// Only JSON-serialized data connections are supported; binary
    /// serializations (including an absent field, which defaults to binary)
    /// are refused.
    pub fn ensure_supported(&self) -> SignalResult<()> {
        match (self.kind, self.data.serialization) {
            (ConnectionType::Media, _) | (ConnectionType::Data, Some(Serialization::Json)) => Ok(()),
            (ConnectionType::Data, other) => Err(SignalError::Protocol(format!(
                "unsupported data serialization {other:?} on {}",
                self.connection_id
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    pub connection_id: ConnectionId,
}
