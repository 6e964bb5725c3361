// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Shared helpers for broker integration tests: an in-process broker
//! wired from real modules, plus a minimal test client speaking raw
//! MQTT 3.1 over a tokio socket.

use bytes::BytesMut;
use codec::v3::{
    ConnectAckPacket, ConnectFlags, ConnectPacket, ConnectReturnCode, PublishPacket,
    SubscribeAckPacket, SubscribePacket,
};
use codec::{ByteArray, DecodePacket, EncodePacket, PacketId, QoS, VarInt};
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use fengbo::auth::{Acl, AuthApp};
use fengbo::commands::{
    BridgeToDispatcherCmd, DispatcherToBridgeCmd, DispatcherToMetricsCmd, DispatcherToServerContexCmd,
    MetricsToDispatcherCmd, ServerContextToAuthCmd, ServerContextToDispatcherCmd,
};
use fengbo::config::{General, Listener as ListenerConfig, Security, Storage};
use fengbo::dispatcher::Dispatcher;
use fengbo::listener::Listener;

const CHANNEL_CAPACITY: usize = 64;

/// Ends of channels which must stay open for the broker's lifetime.
pub struct Broker {
    pub address: String,
    _bridge_rx: mpsc::Receiver<DispatcherToBridgeCmd>,
    _bridge_tx: mpsc::Sender<BridgeToDispatcherCmd>,
    _metrics_rx: mpsc::Receiver<DispatcherToMetricsCmd>,
    _metrics_tx: mpsc::Sender<MetricsToDispatcherCmd>,
    _server_to_dispatcher_tx: mpsc::Sender<ServerContextToDispatcherCmd>,
    _server_to_auth_tx: mpsc::Sender<ServerContextToAuthCmd>,
    _done_rx: mpsc::Receiver<DispatcherToServerContexCmd>,
}

/// Start listener, auth and dispatcher tasks on a random local port.
pub async fn start_broker() -> Broker {
    let port: u16 = rand::thread_rng().gen_range(20000..40000);
    let listener_toml = format!("bind_address = \"127.0.0.1\"\nport = {port}");
    let listener_config: ListenerConfig = toml::from_str(&listener_toml).unwrap();
    let address = listener_config.address();
    let general = General::default();

    let (listeners_to_dispatcher_tx, listeners_to_dispatcher_rx) =
        mpsc::channel(CHANNEL_CAPACITY);
    let (dispatcher_to_listener_tx, dispatcher_to_listener_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (listeners_to_auth_tx, listeners_to_auth_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (auth_to_listener_tx, auth_to_listener_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let mut listener = Listener::bind(
        0,
        listener_config,
        &general,
        listeners_to_dispatcher_tx,
        dispatcher_to_listener_rx,
        listeners_to_auth_tx,
        auth_to_listener_rx,
    )
    .await
    .expect("Failed to bind test listener");
    tokio::spawn(async move {
        listener.run_loop().await;
    });

    let (server_to_auth_tx, server_to_auth_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut auth_app = AuthApp::new(
        Security::default(),
        vec![(0, auth_to_listener_tx)],
        listeners_to_auth_rx,
        server_to_auth_rx,
    )
    .expect("Failed to create auth app");
    tokio::spawn(async move {
        auth_app.run_loop().await;
    });

    let (bridge_tx_out, bridge_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (bridge_tx, bridge_cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    // Nothing drains the metrics side here; leave plenty of room so the
    // dispatcher never blocks on counter updates.
    let (metrics_tx_out, metrics_rx) = mpsc::channel(4096);
    let (metrics_tx, metrics_cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (done_tx, done_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (server_to_dispatcher_tx, server_to_dispatcher_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let mut dispatcher = Dispatcher::new(
        general,
        Storage::default(),
        Security::default(),
        Acl::allow_all(),
        vec![(0, dispatcher_to_listener_tx)],
        listeners_to_dispatcher_rx,
        bridge_tx_out,
        bridge_cmd_rx,
        metrics_tx_out,
        metrics_cmd_rx,
        done_tx,
        server_to_dispatcher_rx,
    );
    tokio::spawn(async move {
        dispatcher.run_loop().await;
    });

    Broker {
        address,
        _bridge_rx: bridge_rx,
        _bridge_tx: bridge_tx,
        _metrics_rx: metrics_rx,
        _metrics_tx: metrics_tx,
        _server_to_dispatcher_tx: server_to_dispatcher_tx,
        _server_to_auth_tx: server_to_auth_tx,
        _done_rx: done_rx,
    }
}

/// Raw MQTT 3.1 client for driving the broker over a real socket.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    /// Open a socket and complete the connect handshake.
    pub async fn connect(address: &str, client_id: &str) -> Self {
        let stream = TcpStream::connect(address)
            .await
            .expect("Failed to connect to test broker");
        let mut client = Self {
            stream,
            buf: BytesMut::with_capacity(1024),
        };

        let mut packet = ConnectPacket::new(client_id).unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(true);
        packet.set_connect_flags(flags);
        client.send(&packet).await;

        let ack = client.read_packet().await;
        let mut ba = ByteArray::new(&ack);
        let ack = ConnectAckPacket::decode(&mut ba).expect("Expected CONNACK");
        assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
        client
    }

    pub async fn send<P: EncodePacket>(&mut self, packet: &P) {
        use tokio::io::AsyncWriteExt;
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    /// Read one complete packet off the wire.
    pub async fn read_packet(&mut self) -> Vec<u8> {
        loop {
            if let Some(len) = packet_len(&self.buf) {
                return self.buf.split_to(len).to_vec();
            }
            let n_recv = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .expect("Failed to read from broker");
            assert!(n_recv > 0, "Broker closed the connection");
        }
    }

    pub async fn subscribe(&mut self, topic: &str, qos: QoS, mid: u16) -> SubscribeAckPacket {
        let packet = SubscribePacket::new(topic, qos, PacketId::new(mid)).unwrap();
        self.send(&packet).await;
        let ack = self.read_packet().await;
        let mut ba = ByteArray::new(&ack);
        SubscribeAckPacket::decode(&mut ba).expect("Expected SUBACK")
    }

    pub async fn publish_qos0(&mut self, topic: &str, payload: &[u8], retain: bool) {
        let mut packet = PublishPacket::new(topic, QoS::AtMostOnce, payload).unwrap();
        packet.set_retain(retain);
        self.send(&packet).await;
    }

    pub async fn recv_publish(&mut self) -> PublishPacket {
        let data = self.read_packet().await;
        let mut ba = ByteArray::new(&data);
        PublishPacket::decode(&mut ba).expect("Expected PUBLISH")
    }
}

fn packet_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let mut ba = ByteArray::new(&buf[1..]);
    match VarInt::decode(&mut ba) {
        Ok(remaining_length) => {
            let total = 1 + ba.offset() + remaining_length.value();
            if buf.len() >= total {
                Some(total)
            } else {
                None
            }
        }
        Err(_err) => None,
    }
}
