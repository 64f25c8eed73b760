// MIT License - Copyright (c) 2021 TJForc
//
//! # alarm-gateway
//!
//! Receives events from alarm panels and monitoring receivers over serial
//! lines and TCP/UDP sockets, decodes them (Ritm, RitmTCP, Sentinel) and fans
//! them out to senders such as MQTT.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use alarm_gateway::{LogSender, MessageBus, Protocol, SocketReceiver, SocketReceiverConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SocketReceiverConfig::builder()
//!         .source("hub")
//!         .pult("P1")
//!         .protocol(Protocol::RitmTcp)
//!         .port(4000)
//!         .build();
//!
//!     let mut bus = MessageBus::default();
//!     bus.add_sender(Arc::new(LogSender::default()));
//!     bus.add_receiver(Arc::new(SocketReceiver::new(config)?));
//!
//!     let mut events = bus.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     bus.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     bus.stop().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod stream;
pub mod transport;

// Re-exports for convenience
pub use bus::{Dispatcher, EventSink, MessageBus};
pub use config::{
    GatewayConfig, ReceiverConfig, SenderConfig, SerialReceiverConfig, SocketReceiverConfig,
    SocketReceiverConfigBuilder, TransportProtocol,
};
pub use error::{GatewayError, Result};
pub use event::{BusEvent, EventReceiver, Origin};
pub use message::{Message, MessageId, MessageType, ObjectInfo, Payload};
pub use protocol::{MessageReader, Protocol, ProtocolReader, ReaderPool};
pub use receiver::{Receiver, ReceiverState, SerialReceiver, SocketReceiver};
pub use sender::{LogSender, MqttSender, MqttSenderConfig, Sender};
pub use stream::{ByteStream, Frame};
pub use transport::{MemoryTransport, SerialSettings, Transport};
