// MIT License - Copyright (c) 2021 TJForc

//! Serial-port driver: one dedicated worker thread per receiver.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Lifecycle, Receiver, ReceiverContext, ReceiverState};
use crate::bus::EventSink;
use crate::config::SerialReceiverConfig;
use crate::error::{GatewayError, Result};
use crate::message::{Message, MessageType};
use crate::protocol::{MessageReader, ProtocolReader, ReaderPool};
use crate::stream::ByteStream;
use crate::transport::{SerialSettings, SerialTransport, Transport};

/// Opens the transport for a serial receiver.
pub type SerialOpener = Arc<dyn Fn(&SerialSettings) -> Result<Box<dyn Transport>> + Send + Sync>;

fn open_port() -> SerialOpener {
    Arc::new(|settings: &SerialSettings| {
        SerialTransport::open(settings).map(|port| Box::new(port) as Box<dyn Transport>)
    })
}

struct Worker {
    shutdown: watch::Sender<bool>,
    thread: JoinHandle<()>,
}

pub struct SerialReceiver {
    config: SerialReceiverConfig,
    ctx: ReceiverContext,
    readers: Arc<ReaderPool>,
    opener: SerialOpener,
    lifecycle: Lifecycle,
    worker: Mutex<Option<Worker>>,
}

impl SerialReceiver {
    pub fn new(config: SerialReceiverConfig) -> Result<Self> {
        Self::with_opener(config, open_port())
    }

    /// Use `opener` instead of opening the configured serial port.
    pub fn with_opener(config: SerialReceiverConfig, opener: SerialOpener) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx: ReceiverContext::new(&config.source, &config.pult),
            readers: Arc::new(ReaderPool::new(config.protocol, config.reader_pool_capacity)),
            config,
            opener,
            lifecycle: Lifecycle::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SerialReceiverConfig {
        &self.config
    }

    async fn spawn_worker(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = SerialWorker {
            ctx: self.ctx.clone(),
            config: self.config.clone(),
            readers: Arc::clone(&self.readers),
            opener: Arc::clone(&self.opener),
            state: self.lifecycle.subscribe(),
            shutdown: shutdown_rx,
            session: None,
        };
        let thread = std::thread::Builder::new()
            .name(format!("serial {}", self.config.settings.port_name))
            .spawn(move || worker.run_thread())?;
        *self.worker.lock() = Some(Worker {
            shutdown: shutdown_tx,
            thread,
        });
        info!(
            "{}: serial receiver started on {}",
            self.ctx.source_name(),
            self.config.settings.port_name
        );
        Ok(())
    }

    /// Signal the worker, which drops any in-flight read and closes the port.
    async fn join_worker(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return Ok(());
        };
        let _ = worker.shutdown.send(true);
        let joined = tokio::task::spawn_blocking(move || worker.thread.join()).await;
        info!("{}: serial receiver stopped", self.ctx.source_name());
        match joined {
            Ok(Ok(())) => Ok(()),
            _ => Err(GatewayError::Io(io::Error::other("serial worker panicked"))),
        }
    }
}

#[async_trait]
impl Receiver for SerialReceiver {
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
        self.lifecycle.start(|| self.spawn_worker()).await
    }

    async fn stop(&self) -> Result<()> {
        self.lifecycle.stop(|| self.join_worker()).await
    }
}

// ---------------------------------------------------------------------------
// Worker thread
// ---------------------------------------------------------------------------

struct Session {
    stream: ByteStream<Box<dyn Transport>>,
    reader: ProtocolReader,
}

struct SerialWorker {
    ctx: ReceiverContext,
    config: SerialReceiverConfig,
    readers: Arc<ReaderPool>,
    opener: SerialOpener,
    state: watch::Receiver<ReceiverState>,
    shutdown: watch::Receiver<bool>,
    session: Option<Session>,
}

impl SerialWorker {
    fn run_thread(self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.ctx.report(GatewayError::Io(e));
                return;
            }
        };
        runtime.block_on(self.run());
    }

    async fn run(mut self) {
        let state = match self.state.wait_for(|s| *s != ReceiverState::Starting).await {
            Ok(state) => *state,
            Err(_) => return,
        };
        if state != ReceiverState::Working {
            return;
        }

        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() || *self.state.borrow() != ReceiverState::Working {
                break;
            }

            if self.session.is_none() {
                let connected = tokio::select! {
                    _ = shutdown.changed() => break,
                    result = self.connect() => result,
                };
                if let Err(e) = connected {
                    self.ctx.report(e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(self.config.reconnect_delay()) => {}
                    }
                }
                continue;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.receive() => result,
            };
            match received {
                Ok(true) => {}
                Ok(false) => self.disconnect().await,
                Err(e) => {
                    let transport = e.is_transport();
                    self.ctx.report(e);
                    if transport {
                        self.disconnect().await;
                    }
                }
            }
        }

        if self.session.is_some() {
            self.disconnect().await;
        }
        debug!("{}: serial worker exiting", self.ctx.source_name());
    }

    /// Open the port, initialize a reader and announce the connection.
    async fn connect(&mut self) -> Result<()> {
        let transport = (self.opener)(&self.config.settings)?;
        let mut stream = ByteStream::new(transport, self.readers.protocol().name())
            .with_buffer_size(self.config.buffer_size);
        let mut reader = self.readers.get();
        if let Err(e) = reader.initialize(&mut stream).await {
            self.readers.release(reader);
            let _ = stream.close().await;
            return Err(e);
        }
        info!("{}: opened {}", self.ctx.source_name(), stream);

        let mut connect = Message::service(MessageType::Connect);
        self.ctx.stamp(&mut connect, &stream);
        self.session = Some(Session { stream, reader });
        self.ctx.emit(connect).await;
        Ok(())
    }

    /// Read and dispatch one message. `false` once the stream has ended.
    async fn receive(&mut self) -> Result<bool> {
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        let Some(mut message) = session.reader.read_message(&mut session.stream).await? else {
            return Ok(false);
        };
        self.ctx.stamp(&mut message, &session.stream);
        self.ctx.emit(message.clone()).await;
        session
            .reader
            .write_answer(&mut session.stream, &message, true)
            .await?;
        Ok(true)
    }

    /// Close the port, return the reader and announce the disconnect.
    async fn disconnect(&mut self) {
        let Some(Session {
            mut stream,
            reader,
        }) = self.session.take()
        else {
            return;
        };
        let mut message = Message::service(MessageType::Disconnect);
        self.ctx.stamp(&mut message, &stream);
        if let Err(e) = stream.close().await {
            debug!("{}: close failed: {}", self.ctx.source_name(), e);
        }
        self.readers.release(reader);
        info!("{}: closed {}", self.ctx.source_name(), stream);
        self.ctx.emit(message).await;
    }
}
