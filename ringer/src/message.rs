//! Typed peer messages carried inside [`Frame`]s.
//!
//! Every wire type maps to exactly one [`Message`] variant; decoding and
//! encoding are exhaustive matches so adding a variant fails to compile until
//! both directions handle it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::frame::{Frame, FrameError};
use crate::member::Status;

/// Member name → status, as seen by one process.
pub type Roster = BTreeMap<String, Status>;

/// Correlates a request frame with its reply on the same connection.
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterSync {
    pub name: String,
    pub attempt: u64,
    pub roster: Roster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterAdd {
    pub name: String,
    #[serde(default)]
    pub attempt: u64,
    pub is_match: bool,
    #[serde(default)]
    pub add: Roster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Wall-clock microseconds when the heartbeat left the sender.
    pub start: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub id: RequestId,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub id: RequestId,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRequest {
    pub id: RequestId,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetReply {
    pub id: RequestId,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RosterSync(RosterSync),
    RosterAdd(RosterAdd),
    HeartbeatStart(Heartbeat),
    HeartbeatEnd(Heartbeat),
    Get(GetRequest),
    GetReply(GetReply),
    Set(SetRequest),
    SetReply(SetReply),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RosterSync(_) => "roster:sync",
            Message::RosterAdd(_) => "roster:add",
            Message::HeartbeatStart(_) => "heartbeat:start",
            Message::HeartbeatEnd(_) => "heartbeat:end",
            Message::Get(_) => "get",
            Message::GetReply(_) => "get:reply",
            Message::Set(_) => "set",
            Message::SetReply(_) => "set:reply",
        }
    }

    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Message::RosterSync(payload) => serde_json::to_value(payload),
            Message::RosterAdd(payload) => serde_json::to_value(payload),
            Message::HeartbeatStart(payload) | Message::HeartbeatEnd(payload) => {
                serde_json::to_value(payload)
            }
            Message::Get(payload) => serde_json::to_value(payload),
            Message::GetReply(payload) => serde_json::to_value(payload),
            Message::Set(payload) => serde_json::to_value(payload),
            Message::SetReply(payload) => serde_json::to_value(payload),
        };
        // Plain structs of strings, integers and string-keyed maps always serialize.
        Frame::new(self.kind(), payload.ok())
    }

    pub fn from_frame(frame: Frame) -> Result<Self, FrameError> {
        let Frame { kind, payload } = frame;
        let message = match kind.as_str() {
            "roster:sync" => Message::RosterSync(decode(&kind, payload)?),
            "roster:add" => Message::RosterAdd(decode(&kind, payload)?),
            "heartbeat:start" => Message::HeartbeatStart(decode(&kind, payload)?),
            "heartbeat:end" => Message::HeartbeatEnd(decode(&kind, payload)?),
            "get" => Message::Get(decode(&kind, payload)?),
            "get:reply" => Message::GetReply(decode(&kind, payload)?),
            "set" => Message::Set(decode(&kind, payload)?),
            "set:reply" => Message::SetReply(decode(&kind, payload)?),
            _ => return Err(FrameError::UnknownType(kind)),
        };
        Ok(message)
    }

    /// Parses a complete wire line straight into a message.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        Message::from_frame(Frame::parse(line)?)
    }
}

fn decode<T: DeserializeOwned>(kind: &str, payload: Option<Value>) -> Result<T, FrameError> {
    let payload = payload.ok_or_else(|| FrameError::MissingPayload(kind.to_string()))?;
    serde_json::from_value(payload).map_err(|source| FrameError::Payload {
        kind: kind.to_string(),
        source,
    })
}
