//! Two-layer wire format spoken over the realtime socket.
//!
//! Every text frame starts with a single digit naming the outer packet type.
//! Outer `message` packets (`4`) carry an inner frame, which again starts with
//! a single type digit followed by an optional JSON payload.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Outer protocol revision pinned through the `EIO` query parameter.
pub const PROTOCOL_VERSION: u8 = 4;

/// Ping interval assumed until the server handshake says otherwise.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Ping timeout assumed until the server handshake says otherwise.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(120);

/// Server handshake carried by the outer `open` packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session id assigned by the server.
    pub sid: String,
    /// Cadence of server pings in milliseconds.
    #[serde(rename = "pingInterval", default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Grace period after a missed ping in milliseconds.
    #[serde(rename = "pingTimeout", default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

impl Handshake {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Longest silence tolerated between two server pings.
    pub fn liveness_window(&self) -> Duration {
        self.ping_interval().saturating_add(self.ping_timeout())
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            sid: String::new(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }
}

fn default_ping_interval_ms() -> u64 {
    DEFAULT_PING_INTERVAL.as_millis() as u64
}

fn default_ping_timeout_ms() -> u64 {
    DEFAULT_PING_TIMEOUT.as_millis() as u64
}

/// Outer (transport keep-alive) packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    /// Server liveness probe. Probe payloads are accepted and discarded.
    Ping,
    Pong,
    Message(Message),
    Noop,
}

/// Inner (message layer) frame, only valid inside [`Packet::Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client namespace connect, or the server's connect acknowledgement
    /// (which may carry a JSON object such as `{"sid": ...}`).
    Connect(Option<Value>),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: Option<u64>,
        args: Vec<Value>,
    },
    Error(Value),
}

/// Errors produced while decoding a raw text frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unknown packet type {0:?}")]
    UnknownPacketType(char),

    #[error("message packet without an inner type")]
    MissingMessageType,

    #[error("unknown message type {0:?}")]
    UnknownMessageType(char),

    #[error("invalid ack id {0:?}")]
    InvalidAckId(String),

    #[error("event payload must be an array starting with the event name")]
    MalformedEvent,

    #[error("ack payload must be an array")]
    MalformedAck,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Packet {
    pub fn from_text(text: &str) -> Result<Self, DecodeError> {
        let (kind, payload) = split_type(text).ok_or(DecodeError::Empty)?;
        match kind {
            '0' => Ok(Packet::Open(serde_json::from_str(payload)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => Message::from_payload(payload).map(Packet::Message),
            '6' => Ok(Packet::Noop),
            other => Err(DecodeError::UnknownPacketType(other)),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        let text = match self {
            Packet::Open(handshake) => format!("0{}", serde_json::to_string(handshake)?),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Message(message) => format!("4{}", message.to_payload()?),
            Packet::Noop => "6".to_string(),
        };
        Ok(text)
    }
}

impl Message {
    /// Builds an event frame without an ack id.
    pub fn event(name: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Event {
            id: None,
            name: name.into(),
            args,
        }
    }

    fn from_payload(payload: &str) -> Result<Self, DecodeError> {
        let (kind, rest) = split_type(payload).ok_or(DecodeError::MissingMessageType)?;
        let rest = strip_namespace(rest);
        match kind {
            '0' => {
                if rest.is_empty() {
                    Ok(Message::Connect(None))
                } else {
                    Ok(Message::Connect(Some(serde_json::from_str(rest)?)))
                }
            }
            '1' => Ok(Message::Disconnect),
            '2' => {
                let (id, body) = split_ack_id(rest)?;
                let mut items = parse_array(body).ok_or(DecodeError::MalformedEvent)??;
                if items.is_empty() {
                    return Err(DecodeError::MalformedEvent);
                }
                let name = match items.remove(0) {
                    Value::String(name) => name,
                    _ => return Err(DecodeError::MalformedEvent),
                };
                Ok(Message::Event {
                    id,
                    name,
                    args: items,
                })
            }
            '3' => {
                let (id, body) = split_ack_id(rest)?;
                let args = parse_array(body).ok_or(DecodeError::MalformedAck)??;
                Ok(Message::Ack { id, args })
            }
            '4' => {
                if rest.is_empty() {
                    Ok(Message::Error(Value::Null))
                } else {
                    Ok(Message::Error(serde_json::from_str(rest)?))
                }
            }
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }

    fn to_payload(&self) -> Result<String, serde_json::Error> {
        let text = match self {
            Message::Connect(None) => "0".to_string(),
            Message::Connect(Some(value)) => format!("0{}", serde_json::to_string(value)?),
            Message::Disconnect => "1".to_string(),
            Message::Event { id, name, args } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                format!(
                    "2{}{}",
                    format_ack_id(*id),
                    serde_json::to_string(&Value::Array(items))?
                )
            }
            Message::Ack { id, args } => format!(
                "3{}{}",
                format_ack_id(*id),
                serde_json::to_string(args)?
            ),
            Message::Error(Value::Null) => "4".to_string(),
            Message::Error(value) => format!("4{}", serde_json::to_string(value)?),
        };
        Ok(text)
    }
}

fn split_type(text: &str) -> Option<(char, &str)> {
    let mut chars = text.chars();
    let kind = chars.next()?;
    Some((kind, chars.as_str()))
}

// `/admin,2["x"]` -> `2["x"]`; a bare namespace has no payload left.
fn strip_namespace(rest: &str) -> &str {
    if !rest.starts_with('/') {
        return rest;
    }
    match rest.find(',') {
        Some(index) => &rest[index + 1..],
        None => "",
    }
}

fn split_ack_id(rest: &str) -> Result<(Option<u64>, &str), DecodeError> {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return Ok((None, rest));
    }
    let (id, body) = rest.split_at(digits);
    let id = id
        .parse::<u64>()
        .map_err(|_| DecodeError::InvalidAckId(id.to_string()))?;
    Ok((Some(id), body))
}

fn parse_array(body: &str) -> Option<Result<Vec<Value>, DecodeError>> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => Some(Ok(items)),
        Ok(_) => None,
        Err(err) => Some(Err(DecodeError::Json(err))),
    }
}

fn format_ack_id(id: Option<u64>) -> String {
    id.map(|id| id.to_string()).unwrap_or_default()
}
