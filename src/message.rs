// MIT License - Copyright (c) 2021 TJForc

use std::fmt;

use chrono::{DateTime, Local, NaiveDateTime};
use uuid::Uuid;

/// Kind of a message, shared by object and service messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MessageType {
    #[default]
    Unknown,
    /// Alarm event reported by a panel
    Event,
    /// Heartbeat / liveness probe
    Test,
    /// Transport connection opened
    Connect,
    /// Transport connection closed
    Disconnect,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Event => "Event",
            Self::Test => "Test",
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message identifier: random at construction, or a protocol-supplied
/// correlation id once a reader assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Random(Uuid),
    Protocol(String),
}

impl MessageId {
    pub fn random() -> Self {
        MessageId::Random(Uuid::new_v4())
    }

    /// The correlation id, if this id came from the wire.
    pub fn protocol_id(&self) -> Option<&str> {
        match self {
            MessageId::Protocol(id) => Some(id),
            MessageId::Random(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Random(uuid) => write!(f, "{uuid}"),
            MessageId::Protocol(id) => f.write_str(id),
        }
    }
}

/// Alarm fields carried by object messages.
///
/// `pult` is filled in by the receiver, everything else by the protocol reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub pult: String,
    pub object_number: String,
    pub zone: String,
    pub cable: String,
    pub code: String,
    /// Event time as reported by the panel (distinct from `Message::created`)
    pub object_date: Option<NaiveDateTime>,
}

impl ObjectInfo {
    pub fn with_object_number(object_number: impl Into<String>) -> Self {
        Self {
            object_number: object_number.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            ("Pult", &self.pult),
            ("Obj", &self.object_number),
            ("Zone", &self.zone),
            ("Cable", &self.cable),
            ("Code", &self.code),
        ];
        let mut first = true;
        for (label, value) in parts {
            if value.is_empty() {
                continue;
            }
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{label} {value}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Object(ObjectInfo),
    /// Connection lifecycle notifications and heartbeats with no alarm payload
    Service,
}

/// Common message produced by every protocol reader and receiver.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    created: DateTime<Local>,
    /// Origin label assigned by the receive loop before dispatch
    pub source: String,
    pub kind: MessageType,
    pub payload: Payload,
}

impl Message {
    fn new(kind: MessageType, payload: Payload) -> Self {
        Self {
            id: MessageId::random(),
            created: Local::now(),
            source: String::new(),
            kind,
            payload,
        }
    }

    pub fn object(kind: MessageType, info: ObjectInfo) -> Self {
        Self::new(kind, Payload::Object(info))
    }

    pub fn service(kind: MessageType) -> Self {
        Self::new(kind, Payload::Service)
    }

    pub fn created(&self) -> DateTime<Local> {
        self.created
    }

    pub fn is_object(&self) -> bool {
        matches!(self.payload, Payload::Object(_))
    }

    pub fn as_object(&self) -> Option<&ObjectInfo> {
        match &self.payload {
            Payload::Object(info) => Some(info),
            Payload::Service => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut ObjectInfo> {
        match &mut self.payload {
            Payload::Object(info) => Some(info),
            Payload::Service => None,
        }
    }

    /// Whether the bus forwards this message to senders: object events only.
    pub fn is_forwardable(&self) -> bool {
        self.is_object() && self.kind == MessageType::Event
    }

    /// Display representation of the payload.
    pub fn body(&self) -> String {
        match &self.payload {
            Payload::Object(info) => info.to_string(),
            Payload::Service => self.kind.to_string(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Object(info) => write!(f, "{} [{}]", self.kind, info),
            Payload::Service => write!(f, "{}", self.kind),
        }
    }
}
