// MIT License - Copyright (c) 2021 TJForc

//! Builds typed components from configuration.

use std::sync::Arc;

use crate::bus::MessageBus;
use crate::config::{GatewayConfig, ReceiverConfig, SenderConfig};
use crate::error::Result;
use crate::receiver::{Receiver, SerialReceiver, SocketReceiver};
use crate::sender::{LogSender, MqttSender, Sender};

pub fn build_receiver(config: &ReceiverConfig) -> Result<Arc<dyn Receiver>> {
    Ok(match config {
        ReceiverConfig::Socket(c) => Arc::new(SocketReceiver::new(c.clone())?),
        ReceiverConfig::Serial(c) => Arc::new(SerialReceiver::new(c.clone())?),
    })
}

/// MQTT senders spawn their client task, so this must run inside a tokio runtime.
pub fn build_sender(config: &SenderConfig) -> Result<Arc<dyn Sender>> {
    Ok(match config {
        SenderConfig::Log { name } => Arc::new(LogSender::new(name)),
        SenderConfig::Mqtt(c) => Arc::new(MqttSender::connect(c)?),
    })
}

/// A bus with every configured receiver and sender attached, not yet started.
pub fn build_bus(config: &GatewayConfig) -> Result<MessageBus> {
    config.validate()?;
    let mut bus = MessageBus::new(config.event_capacity);
    for sender in &config.senders {
        bus.add_sender(build_sender(sender)?);
    }
    for receiver in &config.receivers {
        bus.add_receiver(build_receiver(receiver)?);
    }
    Ok(bus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::ReceiverState;

    #[tokio::test]
    async fn test_build_bus() {
        let config = GatewayConfig::from_toml_str(
            r#"
[[receiver]]
type = "socket"
source = "hub"
protocol = "sentinel"
address = "127.0.0.1"
port = 0

[[receiver]]
type = "serial"
source = "com"
protocol = "ritm"

[[sender]]
type = "log"
name = "console"
"#,
        )
        .unwrap();

        let bus = build_bus(&config).unwrap();
        assert_eq!(bus.receivers().len(), 2);
        assert_eq!(bus.receivers()[0].source_name(), "hub");
        assert_eq!(bus.receivers()[1].source_name(), "com");
        assert_eq!(bus.receivers()[0].state(), ReceiverState::Stopped);
        assert_eq!(bus.dispatcher().sender_count(), 1);
    }

    #[test]
    fn test_build_sender() {
        let sender = build_sender(&SenderConfig::Log {
            name: "console".into(),
        })
        .unwrap();
        assert_eq!(sender.name(), "console");
    }
}
