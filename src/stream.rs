// MIT License - Copyright (c) 2021 TJForc

//! Buffered, delimiter-framing stream over a `Transport`.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::pool::BufferPool;
use crate::transport::Transport;

pub const DEFAULT_BUFFER_SIZE: usize = 256;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// ASCII bytes for `text`; anything outside ASCII becomes `?`.
pub fn encode_ascii(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

/// Text for ASCII `bytes`; anything outside ASCII becomes `?`.
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

/// Result of one frame extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Bytes up to and including the terminator.
    Complete(Vec<u8>),
    /// The buffer filled up without a terminator; carries the whole buffer.
    Overflow(Vec<u8>),
    /// The transport closed; carries any unterminated leftover (possibly empty).
    Closed(Vec<u8>),
}

impl Frame {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Frame::Complete(b) | Frame::Overflow(b) | Frame::Closed(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Frame::Complete(b) | Frame::Overflow(b) | Frame::Closed(b) => b,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Frame::Complete(_))
    }
}

/// A framing wrapper around one connection's transport.
///
/// The read buffer is borrowed from a shared `BufferPool`. It is acquired on
/// first read, handed back while idle-waiting and on `close`. Unconsumed bytes
/// after a frame stay in the buffer and are moved to its start on the next
/// read. Writes accumulate in an output area until `flush`.
///
/// Not reentrant: every operation takes `&mut self`.
pub struct ByteStream<T> {
    transport: T,
    name: String,
    pool: Arc<BufferPool>,
    buffer: Option<Vec<u8>>,
    offset: usize,
    count: usize,
    output: Vec<u8>,
    newline: Vec<u8>,
    end_of_stream: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl<T: Transport> ByteStream<T> {
    pub fn new(transport: T, name: impl Into<String>) -> Self {
        Self::with_pool(transport, name, BufferPool::shared(DEFAULT_BUFFER_SIZE))
    }

    pub fn with_pool(transport: T, name: impl Into<String>, pool: Arc<BufferPool>) -> Self {
        Self {
            transport,
            name: name.into(),
            pool,
            buffer: None,
            offset: 0,
            count: 0,
            output: Vec::new(),
            newline: b"\r\n".to_vec(),
            end_of_stream: false,
            read_timeout: None,
            write_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.count = 0;
        self.release_buffer();
        self.pool = BufferPool::shared(size);
        self
    }

    pub fn set_timeouts(&mut self, read: Option<Duration>, write: Option<Duration>) {
        self.read_timeout = read;
        self.write_timeout = write;
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn set_newline(&mut self, newline: impl Into<Vec<u8>>) {
        self.newline = newline.into();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn buffer_capacity(&self) -> usize {
        self.pool.size()
    }

    /// Bytes read from the transport but not yet returned in a frame.
    pub fn buffered(&self) -> usize {
        self.count
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    // ----------------------------------------------------------------
    // Buffer lifecycle
    // ----------------------------------------------------------------

    /// Acquire the read buffer from the pool if it is not already held.
    pub fn prepare_buffer(&mut self) {
        if self.buffer.is_none() {
            self.buffer = Some(self.pool.acquire());
            self.offset = 0;
            self.count = 0;
        }
    }

    /// Return the read buffer to the pool. A buffer still holding unread
    /// bytes is kept.
    pub fn release_buffer(&mut self) {
        if self.count > 0 {
            return;
        }
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
        self.offset = 0;
    }

    // ----------------------------------------------------------------
    // Reading
    // ----------------------------------------------------------------

    /// Extract the next frame ending with `terminator`.
    pub async fn read_frame(&mut self, terminator: &[u8]) -> Result<Frame> {
        if terminator.is_empty() {
            return Err(GatewayError::Config("frame terminator is empty".into()));
        }
        self.prepare_buffer();
        let peer = self.transport.peer_addr();
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(GatewayError::Disconnected);
        };

        if self.offset > 0 {
            buffer.copy_within(self.offset..self.offset + self.count, 0);
            self.offset = 0;
        }

        loop {
            if let Some(pos) = find(&buffer[..self.count], terminator) {
                let end = pos + terminator.len();
                let frame = buffer[..end].to_vec();
                self.offset = end;
                self.count -= end;
                return Ok(Frame::Complete(frame));
            }

            if self.count == buffer.len() {
                let frame = buffer[..self.count].to_vec();
                self.count = 0;
                return Ok(Frame::Overflow(frame));
            }

            let read = self.transport.read(&mut buffer[self.count..]);
            let n = timed(self.read_timeout, "read", read)
                .await
                .map_err(|e| e.with_address(peer))?;
            if n == 0 {
                self.end_of_stream = true;
                let leftover = buffer[..self.count].to_vec();
                self.count = 0;
                return Ok(Frame::Closed(leftover));
            }
            debug!(
                "{}: read {} bytes: {}",
                self.name,
                n,
                hex::encode_upper(&buffer[self.count..self.count + n])
            );
            self.count += n;
        }
    }

    /// Read one line terminated by the configured newline, decoded without
    /// the terminator. `None` once the transport closed with nothing left.
    /// An unterminated leftover at close is returned as a final line.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let newline = self.newline.clone();
        match self.read_frame(&newline).await? {
            Frame::Complete(bytes) => Ok(Some(
                decode_ascii(&bytes[..bytes.len() - newline.len()]),
            )),
            Frame::Closed(bytes) if bytes.is_empty() => Ok(None),
            Frame::Closed(bytes) => Ok(Some(decode_ascii(&bytes))),
            Frame::Overflow(bytes) => Err(GatewayError::format("line too long", bytes)),
        }
    }

    /// Non-blocking check for unread input, buffered or pending on the transport.
    pub fn data_available(&mut self) -> bool {
        self.count > 0 || self.transport.data_available()
    }

    /// True once the transport reported end of stream and nothing is buffered.
    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream && self.count == 0
    }

    /// Idle-wait for input.
    ///
    /// Releases the read buffer while nothing is pending and polls the
    /// transport every `poll_interval`. Returns `true` (buffer re-acquired)
    /// once data is available, `false` on timeout or shutdown.
    pub async fn wait_for_data(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        timeout: Option<Duration>,
    ) -> bool {
        if self.count > 0 {
            return true;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        if !self.transport.data_available() {
            self.release_buffer();
        }

        loop {
            if self.transport.data_available() {
                self.prepare_buffer();
                return true;
            }
            if *shutdown.borrow() {
                return false;
            }
            let tick = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            tokio::select! {
                _ = sleep(tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    // ----------------------------------------------------------------
    // Writing
    // ----------------------------------------------------------------

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, text: &str) {
        self.output.extend_from_slice(&encode_ascii(text));
    }

    /// Number of bytes waiting for `flush`.
    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Write the accumulated output to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        let peer = self.transport.peer_addr();
        if !self.output.is_empty() {
            debug!("{}: write {}", self.name, hex::encode_upper(&self.output));
            let write = self.transport.write_all(&self.output);
            let result = timed(self.write_timeout, "write", write).await;
            self.output.clear();
            result.map_err(|e| e.with_address(peer))?;
        }
        timed(self.write_timeout, "flush", self.transport.flush())
            .await
            .map_err(|e| e.with_address(peer))
    }

    /// Release the buffer, drop unread input and pending output, and shut
    /// the transport down.
    pub async fn close(&mut self) -> Result<()> {
        self.count = 0;
        self.release_buffer();
        self.output.clear();
        self.end_of_stream = true;
        self.transport.shutdown().await?;
        Ok(())
    }
}

impl<T> Drop for ByteStream<T> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

impl<T: Transport> fmt::Display for ByteStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self.transport.describe();
        match (self.name.is_empty(), address.is_empty()) {
            (false, false) => write!(f, "{} ({})", self.name, address),
            (false, true) => f.write_str(&self.name),
            (true, _) => f.write_str(&address),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn timed<F, R>(limit: Option<Duration>, operation: &'static str, fut: F) -> Result<R>
where
    F: Future<Output = io::Result<R>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GatewayError::Timeout { operation }),
        },
        None => Ok(fut.await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn stream(chunks: &[&str], buffer_size: usize) -> ByteStream<MemoryTransport> {
        let pool = Arc::new(BufferPool::new(buffer_size, 4));
        let transport = MemoryTransport::new(chunks.iter().map(|c| c.as_bytes()));
        ByteStream::with_pool(transport, "test", pool)
    }

    #[tokio::test]
    async fn test_frame_preserves_remainder() {
        let mut s = stream(&["ab\x14cd\x14e", "f\x14"], 32);
        assert_eq!(s.read_frame(&[0x14]).await.unwrap(), Frame::Complete(b"ab\x14".to_vec()));
        assert_eq!(s.buffered(), 4);
        assert_eq!(s.read_frame(&[0x14]).await.unwrap(), Frame::Complete(b"cd\x14".to_vec()));
        assert_eq!(s.read_frame(&[0x14]).await.unwrap(), Frame::Complete(b"ef\x14".to_vec()));
        assert_eq!(s.read_frame(&[0x14]).await.unwrap(), Frame::Closed(Vec::new()));
        assert!(s.end_of_stream());
    }

    #[tokio::test]
    async fn test_multibyte_terminator_split_across_reads() {
        let mut s = stream(&["30031----SF\n", "\r30032"], 32);
        let frame = s.read_frame(&[0x0a, 0x0d]).await.unwrap();
        assert_eq!(frame, Frame::Complete(b"30031----SF\n\r".to_vec()));
        assert_eq!(s.read_frame(&[0x0a, 0x0d]).await.unwrap(), Frame::Closed(b"30032".to_vec()));
    }

    #[tokio::test]
    async fn test_overflow_returns_whole_buffer() {
        let mut s = stream(&["0123456789"], 8);
        let frame = s.read_frame(b"\r").await.unwrap();
        assert_eq!(frame, Frame::Overflow(b"01234567".to_vec()));
        assert!(!frame.is_complete());
        assert_eq!(s.read_frame(b"\r").await.unwrap(), Frame::Closed(b"89".to_vec()));
    }

    #[tokio::test]
    async fn test_closed_with_and_without_leftover() {
        let mut s = stream(&["partial"], 32);
        assert_eq!(s.read_frame(b"\r").await.unwrap(), Frame::Closed(b"partial".to_vec()));
        let mut s = stream(&[], 32);
        assert_eq!(s.read_frame(b"\r").await.unwrap(), Frame::Closed(Vec::new()));
    }

    #[tokio::test]
    async fn test_read_line_strips_newline() {
        let mut s = stream(&["READY\rOK\rtail"], 32);
        s.set_newline(b"\r".to_vec());
        assert_eq!(s.read_line().await.unwrap().as_deref(), Some("READY"));
        assert_eq!(s.read_line().await.unwrap().as_deref(), Some("OK"));
        assert_eq!(s.read_line().await.unwrap().as_deref(), Some("tail"));
        assert_eq!(s.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_masks_non_ascii() {
        let mut s = stream(&["Aé\r\n"], 32);
        assert_eq!(s.read_line().await.unwrap().as_deref(), Some("A??"));
    }

    #[tokio::test]
    async fn test_read_line_overflow_is_format_error() {
        let mut s = stream(&["toolongline"], 4);
        let err = s.read_line().await.unwrap_err();
        assert!(err.is_format());
    }

    #[tokio::test]
    async fn test_writes_buffer_until_flush() {
        let mut s = stream(&[], 32);
        let out = s.transport().output();
        s.write_str("+o");
        s.write_bytes(&[0x0d]);
        assert_eq!(s.pending_output(), 3);
        assert!(out.bytes().is_empty());
        s.flush().await.unwrap();
        assert_eq!(out.bytes(), b"+o\r");
        assert_eq!(s.pending_output(), 0);
    }

    #[tokio::test]
    async fn test_wait_releases_buffer_when_idle() {
        let pool = Arc::new(BufferPool::new(16, 4));
        let transport = MemoryTransport::new(Vec::<Vec<u8>>::new()).keep_open();
        let mut s = ByteStream::with_pool(transport, "idle", pool.clone());
        s.set_poll_interval(Duration::from_millis(10));
        s.prepare_buffer();
        assert_eq!(pool.idle(), 0);

        let (_tx, mut rx) = watch::channel(false);
        let ready = s.wait_for_data(&mut rx, Some(Duration::from_millis(50))).await;
        assert!(!ready);
        assert!(!s.has_buffer());
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_on_shutdown() {
        let transport = MemoryTransport::new(Vec::<Vec<u8>>::new()).keep_open();
        let mut s = ByteStream::with_pool(transport, "idle", Arc::new(BufferPool::new(16, 4)));
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });
        let started = Instant::now();
        assert!(!s.wait_for_data(&mut rx, None).await);
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_wait_sees_buffered_bytes() {
        let mut s = stream(&["A\rB\r"], 32);
        s.read_frame(b"\r").await.unwrap();
        let (_tx, mut rx) = watch::channel(false);
        assert!(s.wait_for_data(&mut rx, Some(Duration::ZERO)).await);
        assert!(s.has_buffer());
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let transport = MemoryTransport::new(Vec::<Vec<u8>>::new()).keep_open();
        let mut s = ByteStream::with_pool(transport, "slow", Arc::new(BufferPool::new(16, 4)));
        s.set_timeouts(Some(Duration::from_millis(20)), None);
        let err = s.read_frame(b"\r").await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { operation: "read" }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_close_releases_buffer() {
        let pool = Arc::new(BufferPool::new(16, 4));
        let mut s = ByteStream::with_pool(MemoryTransport::new([b"abc"]), "c", pool.clone());
        s.read_frame(b"b").await.unwrap();
        assert_eq!(s.buffered(), 1);
        s.close().await.unwrap();
        assert!(!s.has_buffer());
        assert_eq!(pool.idle(), 1);
        assert!(s.end_of_stream());
    }

    #[test]
    fn test_display_and_ascii_text() {
        let s = ByteStream::with_pool(
            MemoryTransport::new(Vec::<Vec<u8>>::new()).named("COM1"),
            "Serial",
            Arc::new(BufferPool::new(16, 1)),
        );
        assert_eq!(s.to_string(), "Serial (COM1)");
        assert_eq!(encode_ascii("Aé"), b"A?".to_vec());
        assert_eq!(decode_ascii(&[0x41, 0xff]), "A?");
    }
}
