// MIT License - Copyright (c) 2021 TJForc

//! Listening-socket driver. Every accepted TCP connection, or UDP datagram
//! session, runs its own receive loop until it goes idle, ends or the
//! receiver stops.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Lifecycle, Receiver, ReceiverContext, ReceiverState};
use crate::bus::EventSink;
use crate::config::{SocketReceiverConfig, TransportProtocol};
use crate::error::{GatewayError, Result};
use crate::protocol::{MessageReader, ProtocolReader, ReaderPool};
use crate::stream::ByteStream;
use crate::transport::{DatagramTransport, Transport};

pub const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct Running {
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

pub struct SocketReceiver {
    config: SocketReceiverConfig,
    ctx: ReceiverContext,
    readers: Arc<ReaderPool>,
    lifecycle: Lifecycle,
    connections: Arc<AtomicUsize>,
    running: Mutex<Option<Running>>,
}

impl SocketReceiver {
    pub fn new(config: SocketReceiverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx: ReceiverContext::new(&config.source, &config.pult),
            readers: Arc::new(ReaderPool::new(config.protocol, config.reader_pool_capacity)),
            config,
            lifecycle: Lifecycle::new(),
            connections: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SocketReceiverConfig {
        &self.config
    }

    /// Bound address while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Live connections (TCP) or datagram sessions (UDP).
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn connection_context(&self) -> Connections {
        Connections {
            ctx: self.ctx.clone(),
            readers: Arc::clone(&self.readers),
            live: Arc::clone(&self.connections),
            receive_timeout: self.config.receive_timeout(),
            send_timeout: self.config.send_timeout(),
            poll_interval: self.config.poll_interval(),
            buffer_size: self.config.buffer_size,
        }
    }

    async fn listen(&self) -> Result<()> {
        let addr = self.config.bind_addr();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connections = self.connection_context();

        let (local_addr, task) = match self.config.transport {
            TransportProtocol::Tcp => {
                let listener = bind_tcp(addr)?;
                let local_addr = listener.local_addr()?;
                let task = tokio::spawn(accept_loop(listener, connections, shutdown_rx));
                (local_addr, task)
            }
            TransportProtocol::Udp => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(|source| GatewayError::Connection {
                        address: Some(addr),
                        source,
                    })?;
                let local_addr = socket.local_addr()?;
                let task = tokio::spawn(datagram_loop(Arc::new(socket), connections, shutdown_rx));
                (local_addr, task)
            }
        };

        info!(
            "{}: listening on {} ({}, {})",
            self.ctx.source_name(),
            local_addr,
            self.config.transport,
            self.config.protocol
        );
        *self.running.lock() = Some(Running {
            shutdown: shutdown_tx,
            local_addr,
            task,
        });
        Ok(())
    }

    /// Signal every loop, close the listener and wait for open connections.
    async fn shut_down(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);
        let joined = running.task.await;
        info!(
            "{}: stopped listening on {}",
            self.ctx.source_name(),
            running.local_addr
        );
        joined.map_err(|e| GatewayError::Io(io::Error::other(e)))
    }
}

#[async_trait]
impl Receiver for SocketReceiver {
    fn id(&self) -> Uuid {
        self.ctx.id()
    }

    fn source_name(&self) -> &str {
        self.ctx.source_name()
    }

    fn pult(&self) -> &str {
        self.ctx.pult()
    }

    fn state(&self) -> ReceiverState {
        self.lifecycle.state()
    }

    fn attach(&self, sink: EventSink) {
        self.ctx.attach(sink);
    }

    fn detach(&self) {
        self.ctx.detach();
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.start(|| self.listen()).await
    }

    async fn stop(&self) -> Result<()> {
        self.lifecycle.stop(|| self.shut_down()).await
    }
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let connection = |source| GatewayError::Connection {
        address: Some(addr),
        source,
    };
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(connection)?;
    socket.set_reuseaddr(true).map_err(connection)?;
    socket.bind(addr).map_err(connection)?;
    socket.listen(LISTEN_BACKLOG).map_err(connection)
}

async fn accept_loop(
    listener: TcpListener,
    connections: Connections,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let total = connections.live.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(
                        "{}: accepted connection from {} ({} connections total)",
                        connections.ctx.source_name(),
                        peer,
                        total
                    );
                    tasks.spawn(connections.clone().serve(stream, shutdown.clone()));
                }
                Err(source) => {
                    connections.ctx.report(GatewayError::Connection { address: None, source });
                    sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);
    while tasks.join_next().await.is_some() {}
}

/// UDP has no accept: one session at a time runs on the bound socket,
/// starting with the first datagram.
async fn datagram_loop(
    socket: Arc<UdpSocket>,
    connections: Connections,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            ready = socket.readable() => {
                if let Err(source) = ready {
                    connections.ctx.report(GatewayError::Connection { address: None, source });
                    sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            }
        }

        let total = connections.live.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "{}: datagram session started ({} connections total)",
            connections.ctx.source_name(),
            total
        );
        let transport = DatagramTransport::new(Arc::clone(&socket));
        let initialized = connections.clone().serve(transport, shutdown.clone()).await;
        if *shutdown.borrow() {
            break;
        }
        if !initialized {
            // Drop the datagram that opened the failed session, then back off
            let mut scratch = [0u8; 1];
            let _ = socket.try_recv_from(&mut scratch);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(ACCEPT_RETRY_DELAY) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection loop
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Connections {
    ctx: ReceiverContext,
    readers: Arc<ReaderPool>,
    live: Arc<AtomicUsize>,
    receive_timeout: Duration,
    send_timeout: Duration,
    poll_interval: Duration,
    buffer_size: usize,
}

impl Connections {
    /// Run one connection to completion. Returns whether the protocol
    /// handshake succeeded.
    async fn serve<T: Transport>(
        self,
        transport: T,
        mut shutdown: watch::Receiver<bool>,
    ) -> bool {
        let mut stream = ByteStream::new(transport, self.readers.protocol().name())
            .with_buffer_size(self.buffer_size);
        stream.set_timeouts(Some(self.receive_timeout), Some(self.send_timeout));
        stream.set_poll_interval(self.poll_interval);
        let mut reader = self.readers.get();
        let peer = stream.transport().peer_addr();

        let initialized = tokio::select! {
            _ = shutdown.changed() => Ok(false),
            result = reader.initialize(&mut stream) => result.map(|()| true),
        };
        let ok = match initialized {
            Ok(true) => {
                self.receive(&mut stream, &mut reader, &mut shutdown).await;
                true
            }
            Ok(false) => true,
            Err(e) => {
                self.ctx.report(e.with_address(peer));
                false
            }
        };

        self.readers.release(reader);
        if let Err(e) = stream.close().await {
            debug!("{}: shutdown of {} failed: {}", self.ctx.source_name(), stream, e);
        }
        let remaining = self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        info!(
            "{}: closed connection {} ({} connections total)",
            self.ctx.source_name(),
            stream,
            remaining
        );
        ok
    }

    async fn receive<T: Transport>(
        &self,
        stream: &mut ByteStream<T>,
        reader: &mut ProtocolReader,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        loop {
            if !stream.wait_for_data(shutdown, Some(self.receive_timeout)).await {
                break;
            }
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                result = reader.read_message(stream) => result,
            };
            let outcome = match read {
                Ok(Some(mut message)) => {
                    self.ctx.stamp(&mut message, stream);
                    self.ctx.emit(message.clone()).await;
                    reader.write_answer(stream, &message, true).await
                }
                Ok(None) => break,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                let fatal = e.is_transport();
                self.ctx.report(e);
                if fatal {
                    break;
                }
            }
            if stream.end_of_stream() {
                break;
            }
        }
    }
}
