// MIT License - Copyright (c) 2021 TJForc

//! Panel wire protocols.
//!
//! Every reader turns frames from a `ByteStream` into `Message`s and writes
//! the protocol acknowledgment for a message once it has been dispatched.

pub mod ritm;
pub mod ritm_tcp;
pub mod sentinel;

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{GatewayError, Result};
use crate::message::Message;
use crate::pool::Pool;
use crate::stream::ByteStream;
use crate::transport::Transport;

pub use ritm::RitmReader;
pub use ritm_tcp::{CapabilityFlags, RitmTcpReader};
pub use sentinel::SentinelReader;

/// Stateful decoder bound to one connection at a time.
pub trait MessageReader {
    /// Optional handshake, run once per connection before the first read.
    fn initialize<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Decode the next message. `Ok(None)` means the stream ended cleanly.
    fn read_message<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
    ) -> impl Future<Output = Result<Option<Message>>> + Send;

    /// Write the protocol acknowledgment for a dispatched message.
    fn write_answer<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
        message: &Message,
        ok: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Forget per-connection state before the reader is reused.
    fn reset(&mut self) {}
}

/// Known protocols, resolved by name from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Protocol {
    Ritm,
    RitmTcp,
    Sentinel,
}

impl Protocol {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ritm" => Some(Protocol::Ritm),
            "ritm_tcp" | "ritmtcp" | "ritm-tcp" => Some(Protocol::RitmTcp),
            "sentinel" => Some(Protocol::Sentinel),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Ritm => "ritm",
            Protocol::RitmTcp => "ritm_tcp",
            Protocol::Sentinel => "sentinel",
        }
    }

    pub fn new_reader(&self) -> ProtocolReader {
        match self {
            Protocol::Ritm => ProtocolReader::Ritm(RitmReader::new()),
            Protocol::RitmTcp => ProtocolReader::RitmTcp(RitmTcpReader::new()),
            Protocol::Sentinel => ProtocolReader::Sentinel(SentinelReader::new()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Protocol::from_name(s).ok_or_else(|| GatewayError::Config(format!("unknown protocol '{s}'")))
    }
}

impl TryFrom<String> for Protocol {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A reader for any of the known protocols.
#[derive(Debug)]
pub enum ProtocolReader {
    Ritm(RitmReader),
    RitmTcp(RitmTcpReader),
    Sentinel(SentinelReader),
}

impl ProtocolReader {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolReader::Ritm(_) => Protocol::Ritm,
            ProtocolReader::RitmTcp(_) => Protocol::RitmTcp,
            ProtocolReader::Sentinel(_) => Protocol::Sentinel,
        }
    }
}

impl MessageReader for ProtocolReader {
    async fn initialize<T: Transport>(&mut self, stream: &mut ByteStream<T>) -> Result<()> {
        match self {
            ProtocolReader::Ritm(r) => r.initialize(stream).await,
            ProtocolReader::RitmTcp(r) => r.initialize(stream).await,
            ProtocolReader::Sentinel(r) => r.initialize(stream).await,
        }
    }

    async fn read_message<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
    ) -> Result<Option<Message>> {
        match self {
            ProtocolReader::Ritm(r) => r.read_message(stream).await,
            ProtocolReader::RitmTcp(r) => r.read_message(stream).await,
            ProtocolReader::Sentinel(r) => r.read_message(stream).await,
        }
    }

    async fn write_answer<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
        message: &Message,
        ok: bool,
    ) -> Result<()> {
        match self {
            ProtocolReader::Ritm(r) => r.write_answer(stream, message, ok).await,
            ProtocolReader::RitmTcp(r) => r.write_answer(stream, message, ok).await,
            ProtocolReader::Sentinel(r) => r.write_answer(stream, message, ok).await,
        }
    }

    fn reset(&mut self) {
        match self {
            ProtocolReader::Ritm(r) => r.reset(),
            ProtocolReader::RitmTcp(r) => r.reset(),
            ProtocolReader::Sentinel(r) => r.reset(),
        }
    }
}

/// Bounded pool of readers for one protocol. Readers are reset on release.
pub struct ReaderPool {
    protocol: Protocol,
    pool: Pool<ProtocolReader>,
}

impl ReaderPool {
    pub fn new(protocol: Protocol, capacity: usize) -> Self {
        Self {
            protocol,
            pool: Pool::new(capacity, move || protocol.new_reader()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn get(&self) -> ProtocolReader {
        self.pool.get()
    }

    pub fn release(&self, mut reader: ProtocolReader) {
        reader.reset();
        self.pool.release(reader);
    }

    pub fn idle(&self) -> usize {
        self.pool.idle()
    }
}

// ----------------------------------------------------------------------------
// Field helpers shared by the fixed-offset decoders
// ----------------------------------------------------------------------------

/// ASCII slice of a frame, or a format error carrying the frame.
pub(crate) fn ascii_field(frame: &[u8], start: usize, len: usize) -> Result<&str> {
    let bytes = frame
        .get(start..start + len)
        .ok_or_else(|| GatewayError::format("field out of range", frame))?;
    if !bytes.is_ascii() {
        return Err(GatewayError::format("non-ASCII field", frame));
    }
    std::str::from_utf8(bytes).map_err(|_| GatewayError::format("non-ASCII field", frame))
}

pub(crate) fn trim_leading_zeros(value: &str) -> String {
    value.trim_start_matches('0').to_string()
}
