// MIT License - Copyright (c) 2021 TJForc

use std::net::SocketAddr;
use std::task::{Context, Poll, Waker};

use tokio::io::ReadBuf;
use tokio::net::TcpStream;

use super::Transport;

impl Transport for TcpStream {
    fn data_available(&mut self) -> bool {
        let mut probe = [0u8; 1];
        let mut buf = ReadBuf::new(&mut probe);
        let mut cx = Context::from_waker(Waker::noop());
        match self.poll_peek(&mut cx, &mut buf) {
            Poll::Ready(_) => true,
            Poll::Pending => false,
        }
    }

    fn describe(&self) -> String {
        match TcpStream::peer_addr(self) {
            Ok(addr) => addr.to_string(),
            Err(_) => "disconnected".to_string(),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}
