// MIT License - Copyright (c) 2021 TJForc

//! Ritm fixed-frame protocol.
//!
//! ```text
//! 35 30 31 31 20 31 38 30 30 33 36 45 31 32 30 30 32 30 30 32 14
//!  5  0  1  1     1  8  0  0  3  6  E  1  2  0  0  2  0  0  2 END
//!                       7          11          15    17
//!                      [object   ] [code     ] [zn ] [cable ]
//! ```
//!
//! Signature `5011` is an alarm event, `1011` a heartbeat. Leading 0x06
//! bytes are line padding and are dropped before the length check.

use tracing::debug;

use super::{MessageReader, ascii_field, trim_leading_zeros};
use crate::error::{GatewayError, Result};
use crate::message::{Message, MessageType, ObjectInfo};
use crate::stream::{ByteStream, Frame};
use crate::transport::Transport;

const TERMINATOR: [u8; 1] = [0x14];
const PADDING: u8 = 0x06;
const FRAME_LEN: usize = 21;

const SIGNATURE_EVENT: &str = "5011";
const SIGNATURE_TEST: &str = "1011";

#[derive(Debug, Default)]
pub struct RitmReader;

impl RitmReader {
    pub fn new() -> Self {
        Self
    }

    /// Decode one terminated frame.
    pub fn decode(frame: &[u8]) -> Result<Message> {
        let start = frame.iter().take_while(|&&b| b == PADDING).count();
        let frame = &frame[start..];
        if frame.len() != FRAME_LEN {
            return Err(GatewayError::format("invalid frame length", frame));
        }

        match ascii_field(frame, 0, 4)? {
            SIGNATURE_EVENT => {
                let info = ObjectInfo {
                    object_number: trim_leading_zeros(&normalize(ascii_field(frame, 7, 4)?)),
                    code: normalize(ascii_field(frame, 11, 4)?),
                    zone: trim_leading_zeros(&normalize(ascii_field(frame, 15, 2)?)),
                    cable: trim_leading_zeros(&normalize(ascii_field(frame, 17, 3)?)),
                    ..ObjectInfo::default()
                };
                Ok(Message::object(MessageType::Event, info))
            }
            SIGNATURE_TEST => Ok(Message::service(MessageType::Test)),
            _ => Err(GatewayError::format("unknown signature", frame)),
        }
    }
}

/// 'A' is transmitted in place of '0' in numeric fields.
fn normalize(field: &str) -> String {
    field.replace('A', "0")
}

impl MessageReader for RitmReader {
    async fn initialize<T: Transport>(&mut self, _stream: &mut ByteStream<T>) -> Result<()> {
        Ok(())
    }

    async fn read_message<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
    ) -> Result<Option<Message>> {
        match stream.read_frame(&TERMINATOR).await? {
            Frame::Complete(frame) => {
                debug!("{}: ritm frame {}", stream.name(), hex::encode_upper(&frame));
                Self::decode(&frame).map(Some)
            }
            Frame::Closed(rest) if rest.is_empty() => Ok(None),
            Frame::Closed(rest) | Frame::Overflow(rest) => {
                Err(GatewayError::format("terminator not found", rest))
            }
        }
    }

    async fn write_answer<T: Transport>(
        &mut self,
        stream: &mut ByteStream<T>,
        _message: &Message,
        ok: bool,
    ) -> Result<()> {
        if ok {
            stream.write_bytes(&[PADDING]);
            stream.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::transport::MemoryTransport;

    const EVENT: &[u8] = b"5011 180036E12002002\x14";
    const TEST: &[u8] = b"1011 000000000@00000\x14";

    #[test]
    fn test_decode_event() {
        let msg = RitmReader::decode(EVENT).unwrap();
        assert_eq!(msg.kind, MessageType::Event);
        let info = msg.as_object().unwrap();
        assert_eq!(info.object_number, "36");
        assert_eq!(info.code, "E120");
        assert_eq!(info.zone, "2");
        assert_eq!(info.cable, "2");
        assert!(info.pult.is_empty());
    }

    #[test]
    fn test_decode_normalizes_padding_char() {
        let msg = RitmReader::decode(b"5011 1800A51234A1A01\x14").unwrap();
        let info = msg.as_object().unwrap();
        assert_eq!(info.object_number, "5");
        assert_eq!(info.code, "1234");
        assert_eq!(info.zone, "1");
        assert_eq!(info.cable, "1");
    }

    #[test]
    fn test_decode_strips_leading_padding() {
        let mut frame = vec![0x06, 0x06];
        frame.extend_from_slice(EVENT);
        assert!(RitmReader::decode(&frame).is_ok());
    }

    #[test]
    fn test_decode_test_signature() {
        let msg = RitmReader::decode(TEST).unwrap();
        assert_eq!(msg.kind, MessageType::Test);
        assert_eq!(msg.payload, Payload::Service);
    }

    #[test]
    fn test_decode_errors() {
        let err = RitmReader::decode(b"5011 180036E1200200\x14").unwrap_err();
        assert!(err.is_format());
        assert!(RitmReader::decode(b"5011 180036E120020022\x14").is_err());
        assert!(RitmReader::decode(b"9999 180036E12002002\x14").is_err());
        assert!(RitmReader::decode(b"5011 18\xff036E12002002\x14").is_err());
    }

    #[tokio::test]
    async fn test_read_and_ack() {
        let mut stream = ByteStream::new(MemoryTransport::new([EVENT, TEST]), "ritm");
        let out = stream.transport().output();
        let mut reader = RitmReader::new();
        reader.initialize(&mut stream).await.unwrap();

        let msg = reader.read_message(&mut stream).await.unwrap().unwrap();
        assert_eq!(msg.kind, MessageType::Event);
        reader.write_answer(&mut stream, &msg, true).await.unwrap();
        assert_eq!(out.take(), vec![0x06]);

        let msg = reader.read_message(&mut stream).await.unwrap().unwrap();
        assert_eq!(msg.kind, MessageType::Test);
        reader.write_answer(&mut stream, &msg, false).await.unwrap();
        assert!(out.bytes().is_empty());

        assert!(reader.read_message(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unterminated_tail_is_format_error() {
        let mut stream = ByteStream::new(MemoryTransport::new([b"5011 18"]), "ritm");
        let err = RitmReader::new().read_message(&mut stream).await.unwrap_err();
        assert!(err.is_format());
    }
}
