// MIT License - Copyright (c) 2021 TJForc

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::GatewayError;
use crate::message::Message;

/// Component an event is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Receiver { id: Uuid, name: String },
    Sender { name: String },
    Bus,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Receiver { name, .. } => write!(f, "receiver '{name}'"),
            Origin::Sender { name } => write!(f, "sender '{name}'"),
            Origin::Bus => f.write_str("bus"),
        }
    }
}

/// All events observable on the bus.
///
/// Subscribe via `MessageBus::subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<BusEvent>`.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Any message a receiver produced, forwarded or not
    MessageReceived {
        origin: Origin,
        message: Arc<Message>,
    },
    /// Every sender accepted the message
    MessageSent { message: Arc<Message> },
    /// A receiver or sender reported a failure
    Error {
        origin: Origin,
        error: Arc<GatewayError>,
    },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<BusEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<BusEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
