// MIT License - Copyright (c) 2021 TJForc

//! Message bus: receivers on one side, senders on the other.
//!
//! Every message a receiver produces is announced as `MessageReceived`.
//! Object events are then handed to each sender in turn; `MessageSent`
//! follows only when no sender failed.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::error::{GatewayError, Result};
use crate::event::{BusEvent, EventReceiver, EventSender, Origin, event_channel};
use crate::message::Message;
use crate::receiver::Receiver;
use crate::sender::Sender;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fan-out of messages to senders, plus the bus event channel.
pub struct Dispatcher {
    senders: RwLock<Vec<Arc<dyn Sender>>>,
    events: EventSender,
}

impl Dispatcher {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = event_channel(event_capacity);
        Self {
            senders: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn add_sender(&self, sender: Arc<dyn Sender>) {
        self.senders.write().push(sender);
    }

    pub fn sender_count(&self) -> usize {
        self.senders.read().len()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Announce `message`, forward it when it is an object event, and return
    /// whether every sender accepted it.
    pub async fn dispatch(&self, origin: &Origin, message: Message) -> bool {
        let message = Arc::new(message);
        let _ = self.events.send(BusEvent::MessageReceived {
            origin: origin.clone(),
            message: Arc::clone(&message),
        });

        if !message.is_forwardable() {
            debug!("{origin}: {message} not forwarded");
            return true;
        }

        // Snapshot so no lock is held across sender awaits
        let senders: Vec<Arc<dyn Sender>> = self.senders.read().clone();
        let mut all_sent = true;
        for sender in senders {
            if let Err(e) = sender.send_message_async(&message).await {
                all_sent = false;
                self.report(
                    &Origin::Sender {
                        name: sender.name().to_string(),
                    },
                    e,
                );
            }
        }

        if all_sent {
            let _ = self.events.send(BusEvent::MessageSent { message });
        }
        all_sent
    }

    pub fn report(&self, origin: &Origin, error: GatewayError) {
        error!("{origin}: {error}");
        let _ = self.events.send(BusEvent::Error {
            origin: origin.clone(),
            error: Arc::new(error),
        });
    }
}

/// A receiver's handle onto the bus.
#[derive(Clone)]
pub struct EventSink {
    dispatcher: Arc<Dispatcher>,
    origin: Origin,
}

impl EventSink {
    pub fn new(dispatcher: Arc<Dispatcher>, origin: Origin) -> Self {
        Self { dispatcher, origin }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub async fn dispatch(&self, message: Message) -> bool {
        self.dispatcher.dispatch(&self.origin, message).await
    }

    pub fn report(&self, error: GatewayError) {
        self.dispatcher.report(&self.origin, error);
    }
}

/// Owns the receivers and the dispatcher they publish through.
pub struct MessageBus {
    receivers: Vec<Arc<dyn Receiver>>,
    dispatcher: Arc<Dispatcher>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl MessageBus {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            receivers: Vec::new(),
            dispatcher: Arc::new(Dispatcher::new(event_capacity)),
        }
    }

    pub fn add_receiver(&mut self, receiver: Arc<dyn Receiver>) {
        let origin = Origin::Receiver {
            id: receiver.id(),
            name: receiver.source_name().to_string(),
        };
        receiver.attach(EventSink::new(Arc::clone(&self.dispatcher), origin));
        self.receivers.push(receiver);
    }

    pub fn add_sender(&self, sender: Arc<dyn Sender>) {
        self.dispatcher.add_sender(sender);
    }

    pub fn receivers(&self) -> &[Arc<dyn Receiver>] {
        &self.receivers
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.dispatcher.subscribe()
    }

    /// Start every receiver. Stops at the first failure; receivers started
    /// before it keep running.
    pub async fn start(&self) -> Result<()> {
        for receiver in &self.receivers {
            receiver.start().await?;
        }
        info!(
            "Receivers started ({} receivers, {} senders)",
            self.receivers.len(),
            self.dispatcher.sender_count()
        );
        Ok(())
    }

    /// Stop every receiver, reporting failures and carrying on.
    pub async fn stop(&self) {
        for receiver in &self.receivers {
            if let Err(e) = receiver.stop().await {
                self.dispatcher.report(
                    &Origin::Receiver {
                        id: receiver.id(),
                        name: receiver.source_name().to_string(),
                    },
                    e,
                );
            }
        }
        info!("Receivers stopped");
    }

    /// Detach and forget all receivers.
    pub fn clear(&mut self) {
        for receiver in self.receivers.drain(..) {
            receiver.detach();
        }
    }
}
