// MIT License - Copyright (c) 2021 TJForc

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::DEFAULT_EVENT_CAPACITY;
use crate::error::{GatewayError, Result};
use crate::protocol::Protocol;
use crate::sender::MqttSenderConfig;
use crate::stream::DEFAULT_BUFFER_SIZE;
use crate::transport::SerialSettings;

/// Socket protocol family. Only TCP and UDP are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Udp,
}

impl FromStr for TransportProtocol {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(GatewayError::Config(format!(
                "unsupported socket transport '{other}' (expected tcp or udp)"
            ))),
        }
    }
}

impl TryFrom<String> for TransportProtocol {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

fn default_socket_source() -> String {
    "socket".to_string()
}
fn default_serial_source() -> String {
    "serial".to_string()
}
fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_receive_timeout() -> u64 {
    180_000
}
fn default_send_timeout() -> u64 {
    10_000
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
fn default_reader_pool_capacity() -> usize {
    64
}
fn default_reconnect_delay() -> u64 {
    5000
}
fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

// ---------------------------------------------------------------------------
// Socket receiver
// ---------------------------------------------------------------------------

/// Listening socket receiver settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SocketReceiverConfig {
    /// Label prefixed to every message `source`
    #[serde(default = "default_socket_source")]
    pub source: String,
    /// Panel-group label stamped on object messages
    #[serde(default)]
    pub pult: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub transport: TransportProtocol,
    #[serde(default = "default_address")]
    pub address: IpAddr,
    pub port: u16,
    /// Idle time after which a connection is dropped
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_reader_pool_capacity")]
    pub reader_pool_capacity: usize,
}

impl Default for SocketReceiverConfig {
    fn default() -> Self {
        Self {
            source: default_socket_source(),
            pult: String::new(),
            protocol: Protocol::Ritm,
            transport: TransportProtocol::Tcp,
            address: default_address(),
            port: 0,
            receive_timeout_ms: default_receive_timeout(),
            send_timeout_ms: default_send_timeout(),
            poll_interval_ms: default_poll_interval(),
            buffer_size: default_buffer_size(),
            reader_pool_capacity: default_reader_pool_capacity(),
        }
    }
}

impl SocketReceiverConfig {
    pub fn builder() -> SocketReceiverConfigBuilder {
        SocketReceiverConfigBuilder::default()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(GatewayError::Config("buffer_size must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(GatewayError::Config("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Builder for SocketReceiverConfig.
#[derive(Debug, Clone, Default)]
pub struct SocketReceiverConfigBuilder {
    config: SocketReceiverConfig,
}

impl SocketReceiverConfigBuilder {
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.config.source = source.into();
        self
    }

    pub fn pult(mut self, pult: impl Into<String>) -> Self {
        self.config.pult = pult.into();
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn transport(mut self, transport: TransportProtocol) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn address(mut self, address: IpAddr) -> Self {
        self.config.address = address;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn receive_timeout_ms(mut self, ms: u64) -> Self {
        self.config.receive_timeout_ms = ms;
        self
    }

    pub fn send_timeout_ms(mut self, ms: u64) -> Self {
        self.config.send_timeout_ms = ms;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn reader_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.reader_pool_capacity = capacity;
        self
    }

    pub fn build(self) -> SocketReceiverConfig {
        self.config
    }
}

// ---------------------------------------------------------------------------
// Serial receiver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SerialReceiverConfig {
    #[serde(default = "default_serial_source")]
    pub source: String,
    #[serde(default)]
    pub pult: String,
    pub protocol: Protocol,
    #[serde(flatten)]
    pub settings: SerialSettings,
    /// Delay before retrying a port that failed to open
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_reader_pool_capacity")]
    pub reader_pool_capacity: usize,
}

impl Default for SerialReceiverConfig {
    fn default() -> Self {
        Self {
            source: default_serial_source(),
            pult: String::new(),
            protocol: Protocol::Ritm,
            settings: SerialSettings::default(),
            reconnect_delay_ms: default_reconnect_delay(),
            buffer_size: default_buffer_size(),
            reader_pool_capacity: default_reader_pool_capacity(),
        }
    }
}

impl SerialReceiverConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        if self.buffer_size == 0 {
            return Err(GatewayError::Config("buffer_size must be positive".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReceiverConfig {
    Socket(SocketReceiverConfig),
    Serial(SerialReceiverConfig),
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ReceiverConfig::Socket(c) => c.validate(),
            ReceiverConfig::Serial(c) => c.validate(),
        }
    }
}

fn default_log_name() -> String {
    "log".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SenderConfig {
    Log {
        #[serde(default = "default_log_name")]
        name: String,
    },
    Mqtt(MqttSenderConfig),
}

impl SenderConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            SenderConfig::Log { .. } => Ok(()),
            SenderConfig::Mqtt(c) => c.validate(),
        }
    }
}

/// Top-level gateway configuration, loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayConfig {
    #[serde(default, rename = "receiver")]
    pub receivers: Vec<ReceiverConfig>,
    #[serde(default, rename = "sender")]
    pub senders: Vec<SenderConfig>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            receivers: Vec::new(),
            senders: Vec::new(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: GatewayConfig =
            toml::from_str(contents).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(GatewayError::Config("event_capacity must be positive".into()));
        }
        for receiver in &self.receivers {
            receiver.validate()?;
        }
        for sender in &self.senders {
            sender.validate()?;
        }
        Ok(())
    }
}
