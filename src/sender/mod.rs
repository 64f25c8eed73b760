// MIT License - Copyright (c) 2021 TJForc

pub mod mqtt;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::message::Message;

pub use mqtt::{MqttSender, MqttSenderConfig};

/// Downstream consumer of forwarded messages.
///
/// The bus calls `send_message_async` for every object event, one sender at
/// a time; a failure is reported against this sender only.
#[async_trait]
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    fn send_message(&self, message: &Message) -> Result<()>;

    async fn send_message_async(&self, message: &Message) -> Result<()> {
        self.send_message(message)
    }
}

/// Writes each forwarded event to the log as a compact label.
#[derive(Debug, Clone)]
pub struct LogSender {
    name: String,
}

impl LogSender {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogSender {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl Sender for LogSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        if let Some(label) = label(message) {
            info!("[{}] {} from {}", self.name, label, message.source);
        }
        Ok(())
    }
}

/// `Plt:..;Dat:..;Obj:..;Msg:..;Zon:..;Cbl:..` label for an object event,
/// empty fields omitted.
pub fn label(message: &Message) -> Option<String> {
    let info = message.as_object()?;
    let created = message.created().format("%d.%m.%Y %H:%M:%S").to_string();
    let fields = [
        ("Plt", info.pult.as_str()),
        ("Dat", created.as_str()),
        ("Obj", info.object_number.as_str()),
        ("Msg", info.code.as_str()),
        ("Zon", info.zone.as_str()),
        ("Cbl", info.cable.as_str()),
    ];
    let label = fields
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{key}:{value}"))
        .collect::<Vec<_>>()
        .join(";");
    Some(label)
}
