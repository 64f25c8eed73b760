// MIT License - Copyright (c) 2021 TJForc

//! RitmTCP text protocol.
//!
//! After a `READY` announcement the gateway queries the panel for its object
//! number and settings. In steady state every answer is a block of
//! CR-terminated lines closed by `OK`, or a bare `A` heartbeat:
//!
//! ```text
//! EVENT: 16:11:55 15/04/13 0208181130040098 000016E6 74
//!        7       16       25        35     42       51
//! ```

use chrono::NaiveDate;
use tracing::{debug, warn};

use super::{MessageReader, ascii_field, trim_leading_zeros};
use crate::error::{GatewayError, Result};
use crate::message::{Message, MessageId, MessageType, ObjectInfo};
use crate::stream::{ByteStream, Frame, decode_ascii};
use crate::transport::Transport;

const CR: u8 = 0x0d;
const LF: u8 = 0x0a;
const TEST_ANSWER: [u8; 4] = [0x42, 0x0d, 0x0d, 0x0a];

const READY: &str = "READY";
const READY_REPEAT: usize = 3;
const CONTACT_ID_CATEGORY: &str = "18";

/// Capability bits reported by the panel in reply to `+R`, one binary digit
/// per bit, leftmost digit first. Bits are addressed by position only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityFlags(u16);

impl CapabilityFlags {
    /// Parse a reply such as `0111011000000000`.
    pub fn from_reply(reply: &str) -> Option<Self> {
        let reply = reply.trim();
        if reply.len() != 16 {
            return None;
        }
        let mut bits = 0u16;
        for (i, c) in reply.chars().enumerate() {
            match c {
                '1' => bits |= 1 << i,
                '0' => {}
                _ => return None,
            }
        }
        Some(Self(bits))
    }

    /// Raw bits; bit `n` is the `n`-th digit from the left.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Whether the digit at `position` (0 = leftmost) was set.
    pub fn is_set(&self, position: usize) -> bool {
        position < 16 && self.0 & (1 << position) != 0
    }
}

/// One accumulated answer.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    /// Newline-joined lines plus the raw bytes they came from.
    Text { text: String, raw: Vec<u8> },
    /// A bare `OK` with nothing before it.
    Empty,
    /// The peer closed the connection between answers.
    End,
}

#[derive(Debug)]
pub struct RitmTcpReader {
    object_number: String,
    version: Option<String>,
    capabilities: CapabilityFlags,
    secondary_capabilities: Option<String>,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl Default for RitmTcpReader {
    fn default() -> Self {
        Self::new()
    }
}

impl RitmTcpReader {
    pub fn new() -> Self {
        Self {
            object_number: String::new(),
            version: None,
            capabilities: CapabilityFlags::default(),
            secondary_capabilities: None,
            prefix: vec![CR],
            suffix: vec![CR],
        }
    }

    /// Object number learned during the handshake, leading zeros trimmed.
    pub fn object_number(&self) -> &str {
        &self.object_number
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    pub fn secondary_capabilities(&self) -> Option<&str> {
        self.secondary_capabilities.as_deref()
    }

    async fn write_line<T: Transport>(&self, stream: &mut ByteStream<T>, line: &str) -> Result<()> {
        stream.write_bytes(&self.prefix);
        stream.write_str(line);
        stream.write_bytes(&self.suffix);
        stream.flush().await
    }

    async fn read_answer<T: Transport>(&self, stream: &mut ByteStream<T>) -> Result<Reply> {
        let mut text = String::new();
        let mut raw = Vec::new();
        loop {
            let line = match stream.read_frame(&[CR]).await? {
                Frame::Complete(bytes) => {
                    let line = decode_ascii(&bytes[..bytes.len() - 1]);
                    raw.extend_from_slice(&bytes);
                    line
                }
                Frame::Closed(rest) if rest.is_empty() && raw.is_empty() => return Ok(Reply::End),
                Frame::Closed(rest) if rest.is_empty() => return Err(GatewayError::Disconnected),
                Frame::Closed(rest) | Frame::Overflow(rest) => {
                    raw.extend_from_slice(&rest);
                    return Err(GatewayError::format("terminator not found", raw));
                }
            };

            if line == "OK" {
                return Ok(if text.is_empty() {
                    Reply::Empty
                } else {
                    Reply::Text { text, raw }
                });
            }
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&line);
            if line == "A" {
                return Ok(Reply::Text { text, raw });
            }
        }
    }

    async fn request<T: Transport>(
        &self,
        stream: &mut ByteStream<T>,
        query: &'static str,
        question: &str,
    ) -> Result<Option<String>> {
        let answer = self
            .exchange(stream, question)
            .await
            .map_err(|e| GatewayError::Handshake {
                query,
                source: Box::new(e),
            })?;
        debug!("{}: {} -> {:?}", stream.name(), question, answer);
        Ok(answer)
    }

    async fn exchange<T: Transport>(
        &self,
        stream: &mut ByteStream<T>,
        question: &str,
    ) -> Result<Option<String>> {
        self.write_line(stream, question).await?;
        match self.read_answer(stream).await? {
            Reply::Text { text, .. } => Ok(Some(text)),
            Reply::Empty => Ok(None),
            Reply::End => Err(GatewayError::Disconnected),
        }
    }

    async fn handshake<T: Transport>(&mut self, stream: &mut ByteStream<T>) -> Result<()> {
        self.prefix = vec![CR];
        self.suffix = vec![CR, LF];
        for _ in 0..READY_REPEAT {
            self.write_line(stream, READY).await?;
        }
        self.suffix = vec![CR];

        let object = self.request(stream, "object number", "+o").await?;
        let Some(object) = object else {
            return Err(GatewayError::Handshake {
                query: "object number",
                source: Box::new(GatewayError::format("empty answer", b"")),
            });
        };
        self.object_number = trim_leading_zeros(object.trim());
        debug!("{}: object number {}", stream.name(), self.object_number);

        self.request(stream, "password", "+ps").await?;
        self.version = self.request(stream, "version", "+v").await?;

        let flags = self.request(stream, "capability flags", "+R").await?;
        self.capabilities = match flags.as_deref().and_then(CapabilityFlags::from_reply) {
            Some(flags) => flags,
            None => {
                debug!("{}: unrecognised capability reply {:?}", stream.name(), flags);
                CapabilityFlags::default()
            }
        };

        self.secondary_capabilities = self.request(stream, "secondary capabilities", "+FP").await?;
        self.request(stream, "pending events", "+gt").await?;
        Ok(())
    }

    fn classify(&self, text: &str, raw: &[u8]) -> Result<Message> {
        if text == "A" {
            return Ok(Message::object(
                MessageType::Test,
                ObjectInfo::with_object_number(self.object_number.clone()),
            ));
        }
        if text.starts_with("EVENT:") {
            return self.parse_event(text);
        }
        if text.starts_with("PACK:") {
            warn!("Packed message not decoded: {}", hex::encode_upper(raw));
            let (Some(hi), Some(lo)) = (raw.get(5), raw.get(6)) else {
                return Err(GatewayError::format("truncated packed message", raw));
            };
            let mut msg = Message::object(
                MessageType::Unknown,
                ObjectInfo::with_object_number(self.object_number.clone()),
            );
            msg.id = MessageId::Protocol(format!("{hi:02X}{lo:02X}"));
            return Ok(msg);
        }
        Err(GatewayError::format("unrecognised message", raw))
    }

    fn parse_event(&self, text: &str) -> Result<Message> {
        let bytes = text.as_bytes();
        let number = |start: usize| -> Result<u32> {
            ascii_field(bytes, start, 2)?
                .parse()
                .map_err(|_| GatewayError::format("invalid event time", bytes))
        };

        let (hour, minute, second) = (number(7)?, number(10)?, number(13)?);
        let (day, month, year) = (number(16)?, number(19)?, number(22)?);
        let object_date = NaiveDate::from_ymd_opt(2000 + year as i32, month, day)
            .and_then(|date| date.and_hms_opt(hour, minute, second))
            .ok_or_else(|| GatewayError::format("invalid event time", bytes))?;

        let object_number = trim_leading_zeros(ascii_field(bytes, 25, 4)?);
        if object_number != self.object_number {
            return Err(GatewayError::format(
                format!(
                    "object number {} does not match handshake object {}",
                    object_number, self.object_number
                ),
                bytes,
            ));
        }

        let category = ascii_field(bytes, 29, 2)?;
        if category != CONTACT_ID_CATEGORY {
            return Err(GatewayError::format(
                format!("invalid Contact ID category {category}"),
                bytes,
            ));
        }

        let info = ObjectInfo {
            object_number,
            code: remap_code(ascii_field(bytes, 31, 4)?),
            zone: ascii_field(bytes, 35, 2)?.to_string(),
            cable: ascii_field(bytes, 37, 3)?.to_string(),
            object_date: Some(object_date),
            ..ObjectInfo::default()
        };
        let id = format!("{}{}", ascii_field(bytes, 42, 8)?, ascii_field(bytes, 51, 2)?);

        let mut msg = Message::object(MessageType::Event, info);
        msg.id = MessageId::Protocol(id);
        Ok(msg)
    }
}

/// Contact ID qualifier: 1 = new event, 3 = restore.
fn remap_code(code: &str) -> String {
    match code.split_at(1) {
        ("1", rest) => format!("E{rest}"),
        ("3", rest) => format!("R{rest}"),
        _ => code.to_string(),
    }
}

impl MessageReader for RitmTcpReader {
    async fn initialize<T: Transport>(&mut self, stream: &mut ByteStream<T>) -> Result<()> {
        stream.set_newline(vec![CR]);
        stream.prepare_buffer();
        let result = self.handshake(stream).await;
        stream.release_buffer();
        result
    }

    async fn read_message<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
    ) -> Result<Option<Message>> {
        match self.read_answer(stream).await? {
            Reply::End => Ok(None),
            Reply::Empty => Err(GatewayError::format("empty message", b"")),
            Reply::Text { text, raw } => {
                debug!("{}: message {}", stream.name(), text);
                self.classify(&text, &raw).map(Some)
            }
        }
    }

    async fn write_answer<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
        message: &Message,
        _ok: bool,
    ) -> Result<()> {
        if !message.is_object() {
            return Ok(());
        }
        match message.kind {
            MessageType::Event | MessageType::Unknown => {
                if let Some(id) = message.id.protocol_id()
                    && !id.is_empty()
                {
                    self.write_line(stream, &format!("+ACK{id}")).await?;
                }
            }
            MessageType::Test => {
                stream.write_bytes(&TEST_ANSWER);
                stream.flush().await?;
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}
