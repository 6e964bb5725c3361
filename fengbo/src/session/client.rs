// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Handles client packets.

use codec::utils::random_client_id;
use codec::v3::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, PingRequestPacket, PingResponsePacket,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};
use codec::{ByteArray, DecodeError, DecodePacket, FixedHeader, PacketType, QoS};

use super::{Session, Status};
use crate::commands::SessionToListenerCmd;
use crate::error::{Error, ErrorKind};
use crate::types::LastWill;

impl Session {
    pub(super) async fn handle_client_packet(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let fixed_header = match FixedHeader::decode(&mut ba) {
            Ok(fixed_header) => fixed_header,
            Err(err) => {
                // Malformed packets close the network connection without
                // any reply.
                log::error!("session: invalid fixed header: {err:?}");
                self.status = Status::Disconnected;
                return Err(err.into());
            }
        };

        match fixed_header.packet_type() {
            PacketType::Connect => self.on_client_connect(buf).await,
            PacketType::PingRequest => self.on_client_ping(buf).await,
            PacketType::Publish { .. } => self.on_client_publish(buf).await,
            PacketType::PublishAck => self.on_client_publish_ack(buf).await,
            PacketType::PublishReceived => self.on_client_publish_received(buf).await,
            PacketType::PublishRelease { .. } => self.on_client_publish_release(buf).await,
            PacketType::PublishComplete => self.on_client_publish_complete(buf).await,
            PacketType::Subscribe => self.on_client_subscribe(buf).await,
            PacketType::Unsubscribe => self.on_client_unsubscribe(buf).await,
            PacketType::Disconnect => self.on_client_disconnect().await,
            t => {
                // Server-to-client packets are protocol violations here.
                log::error!("session: unexpected packet from client: {t:?}");
                self.status = Status::Disconnected;
                Err(Error::new(
                    ErrorKind::ProtocolError,
                    "session: unexpected packet type",
                ))
            }
        }
    }

    async fn reject_connect(&mut self, code: ConnectReturnCode) -> Result<(), Error> {
        let ack_packet = ConnectAckPacket::new(code);
        self.send(ack_packet).await?;
        self.status = Status::Disconnected;
        Ok(())
    }

    async fn on_client_connect(&mut self, buf: &[u8]) -> Result<(), Error> {
        // A second CONNECT packet is a protocol violation; disconnect the
        // client.
        if self.status != Status::Invalid {
            self.status = Status::Disconnected;
            return Err(Error::new(
                ErrorKind::StatusError,
                "session: got a second CONNECT packet",
            ));
        }

        let mut ba = ByteArray::new(buf);
        let mut packet = match ConnectPacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err) => {
                return match err {
                    // Unknown protocol name or level: refuse with return
                    // code 1 then close.
                    DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel => {
                        self.reject_connect(ConnectReturnCode::UnacceptedProtocol)
                            .await?;
                        Err(err.into())
                    }
                    DecodeError::InvalidClientId => {
                        self.reject_connect(ConnectReturnCode::IdentifierRejected)
                            .await?;
                        Err(err.into())
                    }
                    // Any other malformed CONNECT closes the connection
                    // without a CONNACK.
                    _ => {
                        self.status = Status::Disconnected;
                        Err(err.into())
                    }
                };
            }
        };

        if packet.client_id().is_empty() {
            if self.config.allow_empty_client_id() {
                let new_client_id = random_client_id().map_err(|_err| {
                    Error::new(ErrorKind::ParameterError, "failed to generate client id")
                })?;
                // The generated id is always valid.
                let _ret = packet.set_client_id(&new_client_id);
            } else {
                return self.reject_connect(ConnectReturnCode::IdentifierRejected).await;
            }
        }

        if let Some(prefixes) = self.config.clientid_prefixes() {
            if !packet.client_id().starts_with(prefixes) {
                log::warn!(
                    "session: client id {} does not match required prefix",
                    packet.client_id()
                );
                return self.reject_connect(ConnectReturnCode::IdentifierRejected).await;
            }
        }

        self.client_id = packet.client_id().to_string();

        // The broker tolerates one and a half times the advertised keep
        // alive value of silence before closing the connection.
        if packet.keep_alive() > 0 {
            #[allow(clippy::cast_possible_truncation)]
            #[allow(clippy::cast_sign_loss)]
            let keep_alive = (f64::from(packet.keep_alive()) * 1.5) as u64;
            self.config.set_keep_alive(keep_alive);
        } else {
            self.config.set_keep_alive(0);
        }

        self.will = match packet.will_topic() {
            Some(topic) => Some(LastWill {
                topic: topic.to_string(),
                message: packet.will_message().to_vec(),
                qos: packet.connect_flags().will_qos(),
                retain: packet.connect_flags().will_retain(),
            }),
            None => None,
        };

        self.status = Status::Connecting;
        self.sender
            .send(SessionToListenerCmd::Connect(self.id, packet))
            .await
            .map(drop)
            .map_err(Into::into)
    }

    async fn on_client_ping(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.check_connected()?;
        let mut ba = ByteArray::new(buf);
        let _packet = PingRequestPacket::decode(&mut ba)?;

        let ping_resp_packet = PingResponsePacket::new();
        self.send(ping_resp_packet).await
    }

    async fn on_client_publish(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.check_connected()?;
        let mut ba = ByteArray::new(buf);
        let packet = PublishPacket::decode(&mut ba)?;

        if packet.qos() != QoS::AtMostOnce && packet.packet_id().value() == 0 {
            self.status = Status::Disconnected;
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "session: zero packet id in publish packet",
            ));
        }

        self.sender
            .send(SessionToListenerCmd::Publish(self.id, packet))
            .await
            .map(drop)
            .map_err(Into::into)
    }

    async fn on_client_publish_ack(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.check_connected()?;
        let mut ba = ByteArray::new(buf);
        let packet = PublishAckPacket::decode(&mut ba)?;
        self.sender
            .send(SessionToListenerCmd::PublishAck(self.id, packet.packet_id()))
            .await
            .map(drop)
            .map_err(Into::into)
    }

    async fn on_client_publish_received(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.check_connected()?;
        let mut ba = ByteArray::new(buf);
        let packet = PublishReceivedPacket::decode(&mut ba)?;
        self.sender
            .send(SessionToListenerCmd::PublishReceived(
                self.id,
                packet.packet_id(),
            ))
            .await
            .map(drop)
            .map_err(Into::into)
    }

    async fn on_client_publish_release(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.check_connected()?;
        let mut ba = ByteArray::new(buf);
        let packet = match PublishReleasePacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(DecodeError::InvalidPacketFlags) => {
                // Reserved flag bits of PUBREL must be 0,0,1,0; anything
                // else closes the network connection.
                log::error!("session: invalid flag bits in publish release packet");
                self.status = Status::Disconnected;
                return Err(Error::new(
                    ErrorKind::ProtocolError,
                    "session: invalid publish release flags",
                ));
            }
            Err(err) => return Err(err.into()),
        };
        self.sender
            .send(SessionToListenerCmd::PublishRelease(
                self.id,
                packet.packet_id(),
            ))
            .await
            .map(drop)
            .map_err(Into::into)
    }

    async fn on_client_publish_complete(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.check_connected()?;
        let mut ba = ByteArray::new(buf);
        let packet = PublishCompletePacket::decode(&mut ba)?;
        self.sender
            .send(SessionToListenerCmd::PublishComplete(
                self.id,
                packet.packet_id(),
            ))
            .await
            .map(drop)
            .map_err(Into::into)
    }

    async fn on_client_subscribe(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.check_connected()?;
        let mut ba = ByteArray::new(buf);
        let packet = match SubscribePacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err) => {
                return match err {
                    DecodeError::InvalidPacketFlags
                    | DecodeError::EmptyTopicFilter
                    | DecodeError::InvalidQoS => {
                        // Each of these is a protocol violation which
                        // closes the network connection.
                        log::error!("session: malformed subscribe packet: {err:?}");
                        self.status = Status::Disconnected;
                        Err(err.into())
                    }
                    _ => Err(err.into()),
                };
            }
        };

        self.sender
            .send(SessionToListenerCmd::Subscribe(self.id, packet))
            .await
            .map(drop)
            .map_err(Into::into)
    }

    async fn on_client_unsubscribe(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.check_connected()?;
        let mut ba = ByteArray::new(buf);
        let packet = match UnsubscribePacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(DecodeError::InvalidPacketFlags) => {
                log::error!("session: invalid flag bits in unsubscribe packet");
                self.status = Status::Disconnected;
                return Err(Error::new(
                    ErrorKind::ProtocolError,
                    "session: invalid unsubscribe flags",
                ));
            }
            Err(err) => return Err(err.into()),
        };
        let packet_id = packet.packet_id();

        self.sender
            .send(SessionToListenerCmd::Unsubscribe(self.id, packet))
            .await?;

        let unsubscribe_ack_packet = UnsubscribeAckPacket::new(packet_id);
        self.send(unsubscribe_ack_packet).await
    }

    /// Handle disconnect request from client.
    ///
    /// A clean disconnect discards the will message.
    async fn on_client_disconnect(&mut self) -> Result<(), Error> {
        self.will = None;
        self.status = Status::Disconnected;
        Ok(())
    }
}
