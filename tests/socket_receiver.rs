// End-to-end tests for the socket driver over loopback TCP and UDP.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use alarm_gateway::event::EventReceiver;
use alarm_gateway::config::SocketReceiverConfigBuilder;
use alarm_gateway::{
    BusEvent, GatewayError, Message, MessageBus, MessageType, Protocol, Receiver, Sender,
    SocketReceiver, SocketReceiverConfig, TransportProtocol,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

const RITM_EVENT: &[u8] = b"5011 180036E12002002\x14";
const RITM_TCP_HANDSHAKE: &str =
    "0208\rOK\rTestTest\rOK\rVER 01.003.054\rOK\r0111011000000000\rOK\rC0000 S0000\rOK\rOK\r";
const RITM_TCP_EVENT: &str = "EVENT: 16:11:55 15/04/13 0208181130040098 000016E6 74\r";

#[derive(Default)]
struct Collecting(Mutex<Vec<Message>>);

#[async_trait::async_trait]
impl Sender for Collecting {
    fn name(&self) -> &str {
        "collecting"
    }

    fn send_message(&self, message: &Message) -> alarm_gateway::Result<()> {
        self.0.lock().push(message.clone());
        Ok(())
    }
}

struct Harness {
    bus: MessageBus,
    receiver: Arc<SocketReceiver>,
    sent: Arc<Collecting>,
    events: EventReceiver,
}

impl Harness {
    async fn start(protocol: Protocol, transport: TransportProtocol) -> Self {
        Self::with_config(loopback(protocol, transport).build()).await
    }

    async fn with_config(config: SocketReceiverConfig) -> Self {
        let receiver = Arc::new(SocketReceiver::new(config).unwrap());
        let sent = Arc::new(Collecting::default());

        let mut bus = MessageBus::new(64);
        bus.add_sender(sent.clone());
        bus.add_receiver(receiver.clone());
        let events = bus.subscribe();
        bus.start().await.unwrap();

        Self {
            bus,
            receiver,
            sent,
            events,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.receiver.local_addr().unwrap()
    }

    async fn next_error(&mut self) -> Arc<GatewayError> {
        loop {
            let event = timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for an error event")
                .unwrap();
            if let BusEvent::Error { error, .. } = event {
                return error;
            }
        }
    }

    async fn next_message(&mut self) -> Arc<Message> {
        loop {
            let event = timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for a bus event")
                .unwrap();
            if let BusEvent::MessageReceived { message, .. } = event {
                return message;
            }
        }
    }
}

fn loopback(protocol: Protocol, transport: TransportProtocol) -> SocketReceiverConfigBuilder {
    SocketReceiverConfig::builder()
        .source("hub")
        .pult("P1")
        .protocol(protocol)
        .transport(transport)
        .address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .port(0)
        .poll_interval_ms(20)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut received = Vec::new();
    let mut chunk = [0u8; 256];
    while !received.windows(needle.len()).any(|w| w == needle) {
        let n = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("timed out reading from receiver")
            .unwrap();
        assert!(n > 0, "receiver closed the connection early");
        received.extend_from_slice(&chunk[..n]);
    }
    received
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ritm_event_is_stamped_forwarded_and_acked() {
    let mut harness = Harness::start(Protocol::Ritm, TransportProtocol::Tcp).await;
    let mut client = TcpStream::connect(harness.addr()).await.unwrap();
    let client_addr = client.local_addr().unwrap();

    client.write_all(RITM_EVENT).await.unwrap();
    let mut ack = [0u8; 1];
    timeout(Duration::from_secs(5), client.read_exact(&mut ack))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack[0], 0x06);

    let message = harness.next_message().await;
    assert_eq!(message.kind, MessageType::Event);
    assert_eq!(message.source, format!("hub, ritm ({client_addr})"));
    let info = message.as_object().unwrap();
    assert_eq!(info.pult, "P1");
    assert_eq!(info.object_number, "36");
    assert_eq!(info.code, "E120");

    wait_until(|| harness.sent.0.lock().len() == 1).await;
    assert_eq!(harness.receiver.connection_count(), 1);

    drop(client);
    wait_until(|| harness.receiver.connection_count() == 0).await;
    harness.bus.stop().await;
}

#[tokio::test]
async fn test_ritm_tcp_handshake_event_and_heartbeat() {
    let mut harness = Harness::start(Protocol::RitmTcp, TransportProtocol::Tcp).await;
    let mut client = TcpStream::connect(harness.addr()).await.unwrap();

    let greeting = read_until(&mut client, b"+o\r").await;
    assert!(greeting.starts_with(b"\rREADY\r\n"));
    client.write_all(RITM_TCP_HANDSHAKE.as_bytes()).await.unwrap();
    read_until(&mut client, b"+gt\r").await;

    client.write_all(RITM_TCP_EVENT.as_bytes()).await.unwrap();
    read_until(&mut client, b"\r+ACK000016E674\r").await;

    let message = harness.next_message().await;
    assert_eq!(message.kind, MessageType::Event);
    assert_eq!(message.id.protocol_id(), Some("000016E674"));
    let info = message.as_object().unwrap();
    assert_eq!(info.object_number, "208");
    assert_eq!(info.code, "E130");
    assert_eq!(info.pult, "P1");

    client.write_all(b"A\r").await.unwrap();
    read_until(&mut client, &[0x42, 0x0d, 0x0d, 0x0a]).await;
    let heartbeat = harness.next_message().await;
    assert_eq!(heartbeat.kind, MessageType::Test);

    // Only the event reaches the senders
    wait_until(|| harness.sent.0.lock().len() == 1).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.sent.0.lock().len(), 1);

    harness.bus.stop().await;
}

#[tokio::test]
async fn test_failed_handshake_closes_connection() {
    let mut harness = Harness::start(Protocol::RitmTcp, TransportProtocol::Tcp).await;
    let mut client = TcpStream::connect(harness.addr()).await.unwrap();
    read_until(&mut client, b"+o\r").await;
    client.write_all(b"OK\r").await.unwrap();

    let error = harness.next_error().await;
    assert!(error.is_format());
    assert!(error.to_string().contains("object number"));

    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    wait_until(|| harness.receiver.connection_count() == 0).await;
    harness.bus.stop().await;
}

#[tokio::test]
async fn test_idle_connection_closed_after_receive_timeout() {
    let config = loopback(Protocol::Ritm, TransportProtocol::Tcp)
        .receive_timeout_ms(200)
        .build();
    let harness = Harness::with_config(config).await;
    let mut client = TcpStream::connect(harness.addr()).await.unwrap();
    wait_until(|| harness.receiver.connection_count() == 1).await;

    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("idle connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
    wait_until(|| harness.receiver.connection_count() == 0).await;
    assert!(harness.sent.0.lock().is_empty());
    harness.bus.stop().await;
}

#[tokio::test]
async fn test_bad_frame_reported_and_connection_survives() {
    let mut harness = Harness::start(Protocol::Sentinel, TransportProtocol::Tcp).await;
    let mut client = TcpStream::connect(harness.addr()).await.unwrap();
    let client_addr = client.local_addr().unwrap();

    // 12 bytes: one short of a frame
    client.write_all(b"3003----SF\n\r").await.unwrap();
    let error = harness.next_error().await;
    assert!(error.is_format());
    assert!(!error.is_transport());

    client.write_all(b"30042----BA\n\r").await.unwrap();
    let message = harness.next_message().await;
    assert_eq!(message.as_object().unwrap().object_number, "42");
    assert_eq!(message.source, format!("hub, sentinel ({client_addr})"));
    wait_until(|| harness.sent.0.lock().len() == 1).await;
    assert_eq!(harness.receiver.connection_count(), 1);

    sleep(Duration::from_millis(50)).await;
    while let Ok(event) = harness.events.try_recv() {
        assert!(!matches!(event, BusEvent::Error { .. }), "unexpected {event:?}");
    }
    harness.bus.stop().await;
}

#[tokio::test]
async fn test_concurrent_connections_and_stop() {
    let harness = Harness::start(Protocol::Sentinel, TransportProtocol::Tcp).await;
    let mut first = TcpStream::connect(harness.addr()).await.unwrap();
    let mut second = TcpStream::connect(harness.addr()).await.unwrap();
    wait_until(|| harness.receiver.connection_count() == 2).await;

    first.write_all(b"30031----SF\n\r").await.unwrap();
    second.write_all(b"30042----BA\n\r").await.unwrap();
    wait_until(|| harness.sent.0.lock().len() == 2).await;
    let mut objects: Vec<String> = harness
        .sent
        .0
        .lock()
        .iter()
        .filter_map(|m| m.as_object().map(|i| i.object_number.clone()))
        .collect();
    objects.sort();
    assert_eq!(objects, vec!["31", "42"]);

    harness.bus.stop().await;
    assert_eq!(harness.receiver.connection_count(), 0);
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(5), first.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(TcpStream::connect(harness.addr()).await.is_err());
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ritm_over_udp() {
    let mut harness = Harness::start(Protocol::Ritm, TransportProtocol::Udp).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(RITM_EVENT, harness.addr()).await.unwrap();

    let mut ack = [0u8; 8];
    let (n, from) = timeout(Duration::from_secs(5), client.recv_from(&mut ack))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&ack[..n], &[0x06]);
    assert_eq!(from, harness.addr());

    let message = harness.next_message().await;
    assert_eq!(message.as_object().unwrap().object_number, "36");
    assert_eq!(harness.receiver.connection_count(), 1);

    harness.bus.stop().await;
    assert_eq!(harness.receiver.connection_count(), 0);
}

#[tokio::test]
async fn test_ritm_tcp_over_udp_greets_sender_and_recovers() {
    let mut harness = Harness::start(Protocol::RitmTcp, TransportProtocol::Udp).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"OK\r", harness.addr()).await.unwrap();

    let mut greeting = [0u8; 32];
    let (n, _) = timeout(Duration::from_secs(5), client.recv_from(&mut greeting))
        .await
        .expect("handshake was not sent to the datagram sender")
        .unwrap();
    assert_eq!(&greeting[..n], b"\rREADY\r\n");

    let error = harness.next_error().await;
    assert!(error.to_string().contains("object number"));
    wait_until(|| harness.receiver.connection_count() == 0).await;

    // The runtime keeps running and the failed session is not retried
    sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.receiver.connection_count(), 0);
    while let Ok(event) = harness.events.try_recv() {
        assert!(!matches!(event, BusEvent::Error { .. }), "unexpected {event:?}");
    }

    harness.bus.stop().await;
}
