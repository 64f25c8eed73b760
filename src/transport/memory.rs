// MIT License - Copyright (c) 2021 TJForc

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::Transport;

/// Handle to everything written to a `MemoryTransport`.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput(Arc<Mutex<Vec<u8>>>);

impl MemoryOutput {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Scripted in-memory transport.
///
/// Each read returns at most one scripted chunk. Once the script is consumed
/// reads report end of stream, or stay pending forever with `keep_open`.
#[derive(Debug)]
pub struct MemoryTransport {
    input: VecDeque<Vec<u8>>,
    output: MemoryOutput,
    keep_open: bool,
    name: String,
}

impl MemoryTransport {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        Self {
            input: chunks.into_iter().map(|c| c.as_ref().to_vec()).collect(),
            output: MemoryOutput::default(),
            keep_open: false,
            name: "memory".to_string(),
        }
    }

    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn output(&self) -> MemoryOutput {
        self.output.clone()
    }
}

impl AsyncRead for MemoryTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(mut chunk) = this.input.pop_front() else {
            return if this.keep_open {
                Poll::Pending
            } else {
                Poll::Ready(Ok(()))
            };
        };
        let n = chunk.len().min(buf.remaining());
        buf.put_slice(&chunk[..n]);
        if n < chunk.len() {
            this.input.push_front(chunk.split_off(n));
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemoryTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.output.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Transport for MemoryTransport {
    fn data_available(&mut self) -> bool {
        !self.input.is_empty() || !self.keep_open
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
