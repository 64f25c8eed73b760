// MIT License - Copyright (c) 2021 TJForc

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use super::Transport;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    #[default]
    None,
    Odd,
    Even,
}

fn default_port_name() -> String {
    "/dev/ttyS0".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_port_name")]
    pub port_name: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: SerialParity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub dtr: bool,
    #[serde(default)]
    pub rts: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_name: default_port_name(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: SerialParity::default(),
            stop_bits: default_stop_bits(),
            dtr: false,
            rts: false,
        }
    }
}

impl SerialSettings {
    pub fn validate(&self) -> Result<()> {
        self.data_bits()?;
        self.stop_bits()?;
        if self.port_name.is_empty() {
            return Err(GatewayError::Config("serial port_name is empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(GatewayError::Config("serial baud_rate must be positive".into()));
        }
        Ok(())
    }

    fn data_bits(&self) -> Result<DataBits> {
        match self.data_bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            n => Err(GatewayError::Config(format!("unsupported data_bits {n}"))),
        }
    }

    fn stop_bits(&self) -> Result<StopBits> {
        match self.stop_bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            n => Err(GatewayError::Config(format!("unsupported stop_bits {n}"))),
        }
    }

    fn parity(&self) -> Parity {
        match self.parity {
            SerialParity::None => Parity::None,
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
        }
    }
}

/// An open serial port.
pub struct SerialTransport {
    stream: SerialStream,
    port_name: String,
}

impl SerialTransport {
    /// Open and configure the port, including the DTR/RTS control lines.
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        let mut stream = tokio_serial::new(&settings.port_name, settings.baud_rate)
            .data_bits(settings.data_bits()?)
            .parity(settings.parity())
            .stop_bits(settings.stop_bits()?)
            .open_native_async()?;
        stream.write_data_terminal_ready(settings.dtr)?;
        stream.write_request_to_send(settings.rts)?;
        debug!(
            "Opened serial port {} at {} baud",
            settings.port_name, settings.baud_rate
        );
        Ok(Self {
            stream,
            port_name: settings.port_name.clone(),
        })
    }
}

impl AsyncRead for SerialTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Transport for SerialTransport {
    fn data_available(&mut self) -> bool {
        match self.stream.bytes_to_read() {
            Ok(n) => n > 0,
            Err(_) => true,
        }
    }

    fn describe(&self) -> String {
        self.port_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SerialSettings::default();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.parity, SerialParity::None);
        assert_eq!(settings.stop_bits, 1);
        assert!(!settings.dtr && !settings.rts);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: SerialSettings =
            toml::from_str("port_name = \"/dev/ttyUSB1\"\nparity = \"even\"\nstop_bits = 2")
                .unwrap();
        assert_eq!(settings.port_name, "/dev/ttyUSB1");
        assert_eq!(settings.parity, SerialParity::Even);
        assert_eq!(settings.baud_rate, 9600);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_settings() {
        let settings = SerialSettings {
            data_bits: 9,
            ..SerialSettings::default()
        };
        assert!(matches!(settings.validate(), Err(GatewayError::Config(_))));

        let settings = SerialSettings {
            stop_bits: 3,
            ..SerialSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let settings = SerialSettings {
            port_name: "/dev/does-not-exist-gateway".into(),
            ..SerialSettings::default()
        };
        assert!(SerialTransport::open(&settings).is_err());
    }
}
