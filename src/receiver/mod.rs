// MIT License - Copyright (c) 2021 TJForc

//! Receive-loop drivers.
//!
//! A receiver owns a transport, decodes it with a protocol reader and hands
//! every message to the bus through its attached `EventSink`.

pub mod serial;
pub mod socket;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error};
use uuid::Uuid;

use crate::bus::EventSink;
use crate::error::{GatewayError, Result};
use crate::message::Message;
use crate::stream::ByteStream;
use crate::transport::Transport;

pub use serial::SerialReceiver;
pub use socket::SocketReceiver;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiverState {
    #[default]
    Stopped,
    Starting,
    Working,
    Stopping,
}

#[async_trait]
pub trait Receiver: Send + Sync {
    fn id(&self) -> Uuid;

    fn source_name(&self) -> &str;

    fn pult(&self) -> &str;

    fn state(&self) -> ReceiverState;

    /// Route messages and errors to `sink` from now on.
    fn attach(&self, sink: EventSink);

    fn detach(&self);

    /// Fails with `InvalidState` unless the receiver is stopped.
    async fn start(&self) -> Result<()>;

    /// No-op unless the receiver is running.
    async fn stop(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Serialized Stopped -> Starting -> Working -> Stopping -> Stopped transitions.
pub struct Lifecycle {
    transition: Mutex<()>,
    state: watch::Sender<ReceiverState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ReceiverState::Stopped);
        Self {
            transition: Mutex::new(()),
            state,
        }
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReceiverState> {
        self.state.subscribe()
    }

    /// Run `begin` while Starting. Working on success, back to Stopped on error.
    pub async fn start<F, Fut>(&self, begin: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.transition.lock().await;
        let state = self.state();
        if state != ReceiverState::Stopped {
            return Err(GatewayError::InvalidState {
                operation: "start",
                state,
            });
        }
        self.state.send_replace(ReceiverState::Starting);
        match begin().await {
            Ok(()) => {
                self.state.send_replace(ReceiverState::Working);
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ReceiverState::Stopped);
                Err(e)
            }
        }
    }

    /// Run `end` while Stopping. Ignored when already stopped.
    pub async fn stop<F, Fut>(&self, end: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.transition.lock().await;
        match self.state() {
            ReceiverState::Working | ReceiverState::Starting => {}
            _ => return Ok(()),
        }
        self.state.send_replace(ReceiverState::Stopping);
        let result = end().await;
        self.state.send_replace(ReceiverState::Stopped);
        result
    }
}

// ---------------------------------------------------------------------------
// Shared receiver context
// ---------------------------------------------------------------------------

/// Identity and bus handle shared by a receiver and its loops.
#[derive(Clone)]
pub struct ReceiverContext {
    id: Uuid,
    source_name: String,
    pult: String,
    sink: Arc<RwLock<Option<EventSink>>>,
}

impl ReceiverContext {
    pub fn new(source_name: impl Into<String>, pult: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_name: source_name.into(),
            pult: pult.into(),
            sink: Arc::new(RwLock::new(None)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn pult(&self) -> &str {
        &self.pult
    }

    pub fn attach(&self, sink: EventSink) {
        *self.sink.write() = Some(sink);
    }

    pub fn detach(&self) {
        *self.sink.write() = None;
    }

    /// Set `source` from the receiver name and stream, and `pult` on object
    /// messages.
    pub fn stamp<T: Transport>(&self, message: &mut Message, stream: &ByteStream<T>) {
        let stream = stream.to_string();
        message.source = if stream.is_empty() {
            self.source_name.clone()
        } else {
            format!("{}, {}", self.source_name, stream)
        };
        if let Some(info) = message.as_object_mut() {
            info.pult = self.pult.clone();
        }
    }

    /// Hand a message to the bus. Returns whether every sender accepted it.
    pub async fn emit(&self, message: Message) -> bool {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => sink.dispatch(message).await,
            None => {
                debug!("{}: no sink attached, dropping {}", self.source_name, message);
                false
            }
        }
    }

    pub fn report(&self, err: GatewayError) {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => sink.report(err),
            None => error!("{}: {}", self.source_name, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Dispatcher;
    use crate::event::{BusEvent, Origin};
    use crate::message::{MessageType, ObjectInfo};
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let lifecycle = Lifecycle::new();
        lifecycle.start(|| async { Ok(()) }).await.unwrap();
        assert_eq!(lifecycle.state(), ReceiverState::Working);

        let err = lifecycle.start(|| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InvalidState {
                operation: "start",
                state: ReceiverState::Working
            }
        ));
        assert_eq!(lifecycle.state(), ReceiverState::Working);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let lifecycle = Lifecycle::new();
        let mut ran = false;
        lifecycle
            .stop(|| {
                ran = true;
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert!(!ran);
        assert_eq!(lifecycle.state(), ReceiverState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_start_returns_to_stopped() {
        let lifecycle = Lifecycle::new();
        let result = lifecycle
            .start(|| async { Err(GatewayError::Config("bind".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(lifecycle.state(), ReceiverState::Stopped);
        lifecycle.start(|| async { Ok(()) }).await.unwrap();
        lifecycle.stop(|| async { Ok(()) }).await.unwrap();
        assert_eq!(lifecycle.state(), ReceiverState::Stopped);
    }

    #[tokio::test]
    async fn test_stamp_and_emit() {
        let ctx = ReceiverContext::new("hub", "P7");
        let dispatcher = Arc::new(Dispatcher::new(8));
        let mut rx = dispatcher.subscribe();
        ctx.attach(EventSink::new(
            dispatcher,
            Origin::Receiver {
                id: ctx.id(),
                name: "hub".into(),
            },
        ));

        let stream = ByteStream::new(MemoryTransport::new([b""]).named("10.0.0.2:5000"), "ritm");
        let mut msg = Message::object(MessageType::Event, ObjectInfo::with_object_number("36"));
        ctx.stamp(&mut msg, &stream);
        assert_eq!(msg.source, "hub, ritm (10.0.0.2:5000)");
        assert_eq!(msg.as_object().unwrap().pult, "P7");

        assert!(ctx.emit(msg).await);
        match rx.recv().await.unwrap() {
            BusEvent::MessageReceived { message, .. } => {
                assert_eq!(message.source, "hub, ritm (10.0.0.2:5000)")
            }
            other => panic!("unexpected {other:?}"),
        }

        ctx.detach();
        assert!(!ctx.emit(Message::service(MessageType::Connect)).await);
    }
}
