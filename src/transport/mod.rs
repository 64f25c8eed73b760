// MIT License - Copyright (c) 2021 TJForc

pub mod memory;
pub mod serial;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::{MemoryOutput, MemoryTransport};
pub use serial::{SerialParity, SerialSettings, SerialTransport};
pub use udp::DatagramTransport;

/// A byte channel a `ByteStream` can frame messages over.
///
/// Implemented for TCP connections, UDP sessions, serial ports and an
/// in-memory script used by tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Non-blocking check for pending input.
    ///
    /// End of stream and pending errors count as available so that the next
    /// read surfaces them.
    fn data_available(&mut self) -> bool;

    /// Human readable endpoint description, used in message sources and logs.
    fn describe(&self) -> String;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for Box<dyn Transport> {
    fn data_available(&mut self) -> bool {
        (**self).data_available()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
}
