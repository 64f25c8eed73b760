// MIT License - Copyright (c) 2021 TJForc

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

use super::Transport;

/// Byte-stream view of a bound UDP socket.
///
/// Reads return one datagram at a time and remember its sender; writes go
/// back to the most recent sender.
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
}

impl DatagramTransport {
    /// The sender of a datagram already queued on `socket`, if any, becomes
    /// the initial peer so a handshake can be written before the first read.
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        let peer = socket.try_peek_sender().ok();
        Self { socket, peer }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

impl AsyncRead for DatagramTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.socket.poll_recv_from(cx, buf) {
            Poll::Ready(Ok(from)) => {
                this.peer = Some(from);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for DatagramTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Some(peer) = self.peer else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no datagram received yet",
            )));
        };
        self.socket.poll_send_to(cx, buf, peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Transport for DatagramTransport {
    fn data_available(&mut self) -> bool {
        match self.socket.try_peek_sender() {
            Ok(from) => {
                self.peer = Some(from);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }

    fn describe(&self) -> String {
        match (self.peer, self.local_addr()) {
            (Some(peer), _) => format!("udp {peer}"),
            (None, Some(local)) => format!("udp {local}"),
            (None, None) => "udp".to_string(),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
