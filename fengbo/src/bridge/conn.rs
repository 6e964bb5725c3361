// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! One outbound bridge connection.

use bytes::BytesMut;
use codec::v3::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, PingRequestPacket, PublishAckPacket,
    PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket,
    SubscribeAckPacket, SubscribePacket, SubscribeTopic, UnsubscribeAckPacket,
};
use codec::{ByteArray, ConnectFlags, DecodePacket, EncodePacket, PacketId, PacketType, QoS};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{interval, sleep};

use super::ConnCmd;
use crate::commands::BridgeToDispatcherCmd;
use crate::config;
use crate::error::{Error, ErrorKind};
use crate::session::complete_packet_len;
use crate::stream::Stream;
use crate::types::BridgeId;

/// Delay before a lost bridge connection is re-established.
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Packet id of the initial subscribe packet on the bridge link.
const SUBSCRIBE_MID: u16 = 1;

#[derive(Debug)]
pub(crate) struct BridgeConn {
    id: BridgeId,
    config: config::Bridge,
    client_id: String,

    dispatcher_sender: Sender<BridgeToDispatcherCmd>,
    receiver: Receiver<ConnCmd>,
}

impl BridgeConn {
    pub(crate) fn new(
        id: BridgeId,
        config: config::Bridge,
        dispatcher_sender: Sender<BridgeToDispatcherCmd>,
        receiver: Receiver<ConnCmd>,
    ) -> Self {
        let client_id = config.remote_client_id();
        Self {
            id,
            config,
            client_id,
            dispatcher_sender,
            receiver,
        }
    }

    pub(crate) async fn run_loop(mut self) {
        loop {
            match TcpStream::connect(&self.config.address).await {
                Ok(tcp_stream) => {
                    log::info!(
                        "bridge {}: connected to {}",
                        self.config.name,
                        self.config.address
                    );
                    let stream = Stream::new(tcp_stream);
                    if let Err(err) = self.run_connection(stream).await {
                        log::warn!("bridge {}: connection lost: {err}", self.config.name);
                    }
                    if let Err(err) = self
                        .dispatcher_sender
                        .send(BridgeToDispatcherCmd::BridgeDown(self.id))
                        .await
                    {
                        log::error!("bridge: failed to send BridgeDown: {err:?}");
                        return;
                    }
                }
                Err(err) => {
                    log::warn!(
                        "bridge {}: failed to connect to {}: {err}",
                        self.config.name,
                        self.config.address
                    );
                }
            }

            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn run_connection(&mut self, mut stream: Stream) -> Result<(), Error> {
        let mut connect_packet = ConnectPacket::new(&self.client_id)?;
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(self.config.clean_session);
        connect_packet.set_connect_flags(flags);
        connect_packet.set_keep_alive(self.config.keep_alive);
        if let Some(username) = &self.config.username {
            connect_packet.set_username(username)?;
        }
        if let Some(password) = &self.config.password {
            connect_packet.set_password(password.as_bytes())?;
        }

        let mut last_outbound = Instant::now();
        Self::send_packet(&mut stream, &connect_packet).await?;

        let mut in_buf = BytesMut::with_capacity(1024);
        let mut connected = false;
        let mut timer = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                ret = stream.read_buf(&mut in_buf) => {
                    match ret {
                        Ok(0) => {
                            return Err(Error::new(
                                ErrorKind::SocketError,
                                "bridge: peer closed connection",
                            ));
                        }
                        Ok(_n_recv) => {
                            while let Some(packet_len) = complete_packet_len(&in_buf)? {
                                let packet = in_buf.split_to(packet_len).freeze();
                                self.handle_peer_packet(
                                    &mut stream,
                                    &packet,
                                    &mut connected,
                                    &mut last_outbound,
                                ).await?;
                            }
                        }
                        Err(err) => return Err(err),
                    }
                }
                Some(cmd) = self.receiver.recv() => {
                    if connected {
                        self.handle_conn_cmd(&mut stream, cmd, &mut last_outbound).await?;
                    }
                }
                _ = timer.tick() => {
                    // A quiet bridge link pings the peer before its keep
                    // alive value expires.
                    if connected
                        && self.config.keep_alive > 0
                        && last_outbound.elapsed().as_secs() >= u64::from(self.config.keep_alive)
                    {
                        Self::send_packet(&mut stream, &PingRequestPacket::new()).await?;
                        last_outbound = Instant::now();
                    }
                }
            }
        }
    }

    async fn send_packet<P: EncodePacket>(stream: &mut Stream, packet: &P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        stream.write(&buf).await.map(drop)
    }

    async fn handle_peer_packet(
        &mut self,
        stream: &mut Stream,
        buf: &[u8],
        connected: &mut bool,
        last_outbound: &mut Instant,
    ) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let fixed_header = codec::FixedHeader::decode(&mut ba)?;

        match fixed_header.packet_type() {
            PacketType::ConnectAck => {
                let mut ba = ByteArray::new(buf);
                let packet = ConnectAckPacket::decode(&mut ba)?;
                if packet.return_code() != ConnectReturnCode::Accepted {
                    return Err(Error::from_string(
                        ErrorKind::AuthFailed,
                        format!(
                            "bridge: peer refused connection: {:?}",
                            packet.return_code()
                        ),
                    ));
                }
                *connected = true;
                self.on_peer_connected(stream, last_outbound).await
            }
            PacketType::Publish { .. } => {
                let mut ba = ByteArray::new(buf);
                let packet = PublishPacket::decode(&mut ba)?;
                self.dispatcher_sender
                    .send(BridgeToDispatcherCmd::Publish(self.id, packet))
                    .await
                    .map_err(Into::into)
            }
            PacketType::PublishAck => {
                let mut ba = ByteArray::new(buf);
                let packet = PublishAckPacket::decode(&mut ba)?;
                self.dispatcher_sender
                    .send(BridgeToDispatcherCmd::PublishAck(
                        self.id,
                        packet.packet_id(),
                    ))
                    .await
                    .map_err(Into::into)
            }
            PacketType::PublishReceived => {
                let mut ba = ByteArray::new(buf);
                let packet = PublishReceivedPacket::decode(&mut ba)?;
                self.dispatcher_sender
                    .send(BridgeToDispatcherCmd::PublishReceived(
                        self.id,
                        packet.packet_id(),
                    ))
                    .await
                    .map_err(Into::into)
            }
            PacketType::PublishRelease { .. } => {
                let mut ba = ByteArray::new(buf);
                let packet = PublishReleasePacket::decode(&mut ba)?;
                self.dispatcher_sender
                    .send(BridgeToDispatcherCmd::PublishRelease(
                        self.id,
                        packet.packet_id(),
                    ))
                    .await
                    .map_err(Into::into)
            }
            PacketType::PublishComplete => {
                let mut ba = ByteArray::new(buf);
                let packet = PublishCompletePacket::decode(&mut ba)?;
                self.dispatcher_sender
                    .send(BridgeToDispatcherCmd::PublishComplete(
                        self.id,
                        packet.packet_id(),
                    ))
                    .await
                    .map_err(Into::into)
            }
            PacketType::SubscribeAck => {
                let mut ba = ByteArray::new(buf);
                let packet = SubscribeAckPacket::decode(&mut ba)?;
                log::debug!(
                    "bridge {}: subscription acknowledged: {:?}",
                    self.config.name,
                    packet.acks()
                );
                Ok(())
            }
            PacketType::UnsubscribeAck => {
                let mut ba = ByteArray::new(buf);
                let _packet = UnsubscribeAckPacket::decode(&mut ba)?;
                Ok(())
            }
            PacketType::PingResponse => Ok(()),
            t => {
                log::warn!("bridge {}: unexpected packet: {t:?}", self.config.name);
                Ok(())
            }
        }
    }

    /// CONNACK received: subscribe to inbound topic patterns on the peer
    /// and register the bridge session with the dispatcher.
    async fn on_peer_connected(
        &mut self,
        stream: &mut Stream,
        last_outbound: &mut Instant,
    ) -> Result<(), Error> {
        let mut import_topics = Vec::new();
        for topic in &self.config.topics {
            if topic.imports() {
                import_topics.push(SubscribeTopic::new(&topic.pattern, topic.qos)?);
            }
        }
        if !import_topics.is_empty() {
            let packet = SubscribePacket::with_topics(PacketId::new(SUBSCRIBE_MID), import_topics);
            Self::send_packet(stream, &packet).await?;
            *last_outbound = Instant::now();
        }

        let subscriptions: Vec<(String, QoS)> = self
            .config
            .topics
            .iter()
            .filter(|topic| topic.exports())
            .map(|topic| (topic.pattern.clone(), topic.qos))
            .collect();

        self.dispatcher_sender
            .send(BridgeToDispatcherCmd::BridgeUp {
                bridge_id: self.id,
                client_id: self.client_id.clone(),
                clean_session: self.config.clean_session,
                subscriptions,
                notifications: self.config.notifications,
            })
            .await
            .map_err(Into::into)
    }

    async fn handle_conn_cmd(
        &mut self,
        stream: &mut Stream,
        cmd: ConnCmd,
        last_outbound: &mut Instant,
    ) -> Result<(), Error> {
        match cmd {
            ConnCmd::Publish(packet) => Self::send_packet(stream, &packet).await?,
            ConnCmd::PublishAck(packet_id) => {
                Self::send_packet(stream, &PublishAckPacket::new(packet_id)).await?;
            }
            ConnCmd::PublishReceived(packet_id) => {
                Self::send_packet(stream, &PublishReceivedPacket::new(packet_id)).await?;
            }
            ConnCmd::PublishRelease(packet_id, dup) => {
                let mut packet = PublishReleasePacket::new(packet_id);
                packet.set_dup(dup);
                Self::send_packet(stream, &packet).await?;
            }
            ConnCmd::PublishComplete(packet_id) => {
                Self::send_packet(stream, &PublishCompletePacket::new(packet_id)).await?;
            }
        }
        *last_outbound = Instant::now();
        Ok(())
    }
}
