// MIT License - Copyright (c) 2021 TJForc

use std::net::SocketAddr;

use crate::receiver::ReceiverState;

/// All errors that can occur in the alarm gateway library.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A frame could not be parsed. Carries the offending bytes.
    #[error("Format error: {reason} [{}]", hex::encode_upper(.data))]
    Format { reason: String, data: Vec<u8> },

    /// A RitmTCP handshake query failed.
    #[error("Handshake query '{query}' failed: {source}")]
    Handshake {
        query: &'static str,
        #[source]
        source: Box<GatewayError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error ({}): {source}", display_address(.address))]
    Connection {
        address: Option<SocketAddr>,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out during {operation}")]
    Timeout { operation: &'static str },

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Sender '{sender}' failed: {reason}")]
    Sender { sender: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot {operation} receiver in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ReceiverState,
    },
}

fn display_address(address: &Option<SocketAddr>) -> String {
    match address {
        Some(addr) => addr.to_string(),
        None => "unknown address".to_string(),
    }
}

impl GatewayError {
    /// Build a format error from a reason and the raw frame bytes.
    pub fn format(reason: impl Into<String>, data: impl AsRef<[u8]>) -> Self {
        GatewayError::Format {
            reason: reason.into(),
            data: data.as_ref().to_vec(),
        }
    }

    /// Whether this error means the underlying transport is unusable and the
    /// connection loop that produced it must end.
    pub fn is_transport(&self) -> bool {
        match self {
            GatewayError::Io(_)
            | GatewayError::Connection { .. }
            | GatewayError::Timeout { .. }
            | GatewayError::Disconnected
            | GatewayError::Serial(_) => true,
            GatewayError::Handshake { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// Whether this error is a protocol framing/parsing failure.
    pub fn is_format(&self) -> bool {
        match self {
            GatewayError::Format { .. } => true,
            GatewayError::Handshake { source, .. } => source.is_format(),
            _ => false,
        }
    }

    /// Attach a remote address to a bare I/O error.
    pub fn with_address(self, address: Option<SocketAddr>) -> Self {
        match self {
            GatewayError::Io(source) => GatewayError::Connection { address, source },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_renders_hex() {
        let err = GatewayError::format("bad length", [0x35, 0x30, 0x14]);
        assert_eq!(err.to_string(), "Format error: bad length [353014]");
        assert!(err.is_format());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_handshake_inherits_classification() {
        let err = GatewayError::Handshake {
            query: "version",
            source: Box::new(GatewayError::Disconnected),
        };
        assert!(err.is_transport());
        assert!(!err.is_format());

        let err = GatewayError::Handshake {
            query: "version",
            source: Box::new(GatewayError::format("empty answer", b"")),
        };
        assert!(err.is_format());
    }

    #[test]
    fn test_with_address() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let err = GatewayError::Io(io).with_address(Some(addr));
        assert!(matches!(err, GatewayError::Connection { address: Some(a), .. } if a == addr));
        assert!(err.is_transport());
        assert!(err.to_string().contains("10.0.0.1:4000"));
    }

    #[test]
    fn test_non_transport_errors() {
        assert!(!GatewayError::Config("x".into()).is_transport());
        assert!(
            !GatewayError::Sender {
                sender: "mqtt".into(),
                reason: "down".into()
            }
            .is_transport()
        );
    }
}
