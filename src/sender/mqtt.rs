// MIT License - Copyright (c) 2021 TJForc

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info};

use super::Sender;
use crate::error::{GatewayError, Result};
use crate::message::Message;

fn default_name() -> String {
    "mqtt".to_string()
}
fn default_client_id() -> String {
    "alarm-gateway".to_string()
}
fn default_topic() -> String {
    "alarm/events".to_string()
}
fn default_qos() -> u8 {
    1
}
fn default_keep_alive() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MqttSenderConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl MqttSenderConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            url: url.into(),
            client_id: default_client_id(),
            topic: default_topic(),
            qos: default_qos(),
            keep_alive_secs: default_keep_alive(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        parse_mqtt_url(&self.url)?;
        parse_qos(self.qos)?;
        if self.topic.is_empty() {
            return Err(GatewayError::Config("MQTT topic is empty".into()));
        }
        Ok(())
    }
}

// Published events: {now, op, ...} flat structure
#[derive(Serialize)]
struct MqttAlarmEvent<'a> {
    now: u64,
    op: &'a str,
    id: String,
    source: &'a str,
    pult: &'a str,
    object: &'a str,
    code: &'a str,
    zone: &'a str,
    cable: &'a str,
    created: String,
    #[serde(rename = "objectDate", skip_serializing_if = "Option::is_none")]
    object_date: Option<String>,
}

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// JSON document for an object event, `None` for anything else.
pub fn event_payload(message: &Message) -> Option<String> {
    if !message.is_forwardable() {
        return None;
    }
    let info = message.as_object()?;
    let event = MqttAlarmEvent {
        now: now_epoch_ms(),
        op: "EVENT",
        id: message.id.to_string(),
        source: &message.source,
        pult: &info.pult,
        object: &info.object_number,
        code: &info.code,
        zone: &info.zone,
        cable: &info.cable,
        created: message.created().to_rfc3339(),
        object_date: info
            .object_date
            .map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string()),
    };
    serde_json::to_string(&event).ok()
}

/// Publishes each forwarded event to an MQTT topic.
pub struct MqttSender {
    name: String,
    client: AsyncClient,
    topic: String,
    qos: QoS,
    eventloop_handle: JoinHandle<()>,
}

impl MqttSender {
    /// Create the client and spawn its event loop. Must be called inside a
    /// tokio runtime; the broker connection is established in the background.
    pub fn connect(config: &MqttSenderConfig) -> Result<Self> {
        let (host, port) = parse_mqtt_url(&config.url)?;
        let qos = parse_qos(config.qos)?;

        let mut mqtt_opts = MqttOptions::new(&config.client_id, &host, port);
        mqtt_opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        let broker = format!("{host}:{port}");
        let eventloop_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT: connected to {broker}");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            name: config.name.clone(),
            client,
            topic: config.topic.clone(),
            qos,
            eventloop_handle,
        })
    }

    fn failure(&self, reason: impl ToString) -> GatewayError {
        GatewayError::Sender {
            sender: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for MqttSender {
    fn drop(&mut self) {
        self.eventloop_handle.abort();
    }
}

#[async_trait]
impl Sender for MqttSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        let Some(payload) = event_payload(message) else {
            return Ok(());
        };
        self.client
            .try_publish(&self.topic, self.qos, false, payload)
            .map_err(|e| self.failure(e))
    }

    async fn send_message_async(&self, message: &Message) -> Result<()> {
        let Some(payload) = event_payload(message) else {
            return Ok(());
        };
        self.client
            .publish(&self.topic, self.qos, false, payload)
            .await
            .map_err(|e| self.failure(e))
    }
}

fn parse_qos(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(GatewayError::Config(format!("invalid MQTT QoS {other}"))),
    }
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
pub fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped.rsplit_once(':').ok_or_else(|| {
        GatewayError::Config("MQTT URL must be in format mqtt://host:port".into())
    })?;

    let port: u16 = port_str
        .parse()
        .map_err(|_| GatewayError::Config(format!("invalid MQTT port number '{port_str}'")))?;

    Ok((host.to_string(), port))
}
