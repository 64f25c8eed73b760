// MIT License - Copyright (c) 2021 TJForc

//! Sentinel fixed-frame protocol. Never acknowledged.
//!
//! ```text
//! 33 30 30 33 31 2D 2D 2D 2D 53 46 0A 0D
//!     1           5           9       12
//!    [object   ]             [code] END
//! ```

use super::{MessageReader, ascii_field, trim_leading_zeros};
use crate::error::{GatewayError, Result};
use crate::message::{Message, MessageType, ObjectInfo};
use crate::stream::{ByteStream, Frame};
use crate::transport::Transport;

const TERMINATOR: [u8; 2] = [0x0a, 0x0d];
const FRAME_LEN: usize = 13;

#[derive(Debug, Default)]
pub struct SentinelReader;

impl SentinelReader {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(frame: &[u8]) -> Result<Message> {
        if frame.len() != FRAME_LEN {
            return Err(GatewayError::format("invalid frame length", frame));
        }
        let info = ObjectInfo {
            object_number: trim_leading_zeros(ascii_field(frame, 1, 4)?),
            code: ascii_field(frame, 9, 2)?.to_string(),
            ..ObjectInfo::default()
        };
        Ok(Message::object(MessageType::Event, info))
    }
}

impl MessageReader for SentinelReader {
    async fn initialize<T: Transport>(&mut self, _stream: &mut ByteStream<T>) -> Result<()> {
        Ok(())
    }

    async fn read_message<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
    ) -> Result<Option<Message>> {
        match stream.read_frame(&TERMINATOR).await? {
            Frame::Complete(frame) => Self::decode(&frame).map(Some),
            Frame::Closed(rest) if rest.is_empty() => Ok(None),
            Frame::Closed(rest) | Frame::Overflow(rest) => {
                Err(GatewayError::format("terminator not found", rest))
            }
        }
    }

    async fn write_answer<T: Transport>(
        &mut self,
        _stream: &mut ByteStream<T>,
        _message: &Message,
        _ok: bool,
    ) -> Result<()> {
        Ok(())
    }
}
