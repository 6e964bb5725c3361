// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Listener cmd handlers.

use codec::v3::{
    ConnectAckPacket, ConnectReturnCode, PublishAckPacket, PublishCompletePacket,
    PublishReceivedPacket, PublishReleasePacket,
};
use codec::PacketId;

use super::{Session, Status};
use crate::commands::ListenerToSessionCmd;
use crate::error::Error;

impl Session {
    pub(super) async fn handle_listener_cmd(
        &mut self,
        cmd: ListenerToSessionCmd,
    ) -> Result<(), Error> {
        match cmd {
            ListenerToSessionCmd::ConnectAck(packet) => self.on_listener_connect_ack(packet).await,
            ListenerToSessionCmd::Publish(packet) => self.send(packet).await,
            ListenerToSessionCmd::PublishAck(packet_id) => {
                self.send(PublishAckPacket::new(packet_id)).await
            }
            ListenerToSessionCmd::PublishReceived(packet_id) => {
                self.send(PublishReceivedPacket::new(packet_id)).await
            }
            ListenerToSessionCmd::PublishRelease(packet_id, dup) => {
                self.on_listener_publish_release(packet_id, dup).await
            }
            ListenerToSessionCmd::PublishComplete(packet_id) => {
                self.send(PublishCompletePacket::new(packet_id)).await
            }
            ListenerToSessionCmd::SubscribeAck(packet) => self.send(packet).await,
            ListenerToSessionCmd::Disconnect => self.on_listener_disconnect(),
        }
    }

    async fn on_listener_connect_ack(&mut self, packet: ConnectAckPacket) -> Result<(), Error> {
        let accepted = packet.return_code() == ConnectReturnCode::Accepted;
        self.send(packet).await?;

        // A refused CONNECT closes the network connection after the
        // CONNACK is on the wire. The will of a rejected session is
        // never published.
        if accepted {
            self.status = Status::Connected;
        } else {
            self.will = None;
            self.status = Status::Disconnected;
        }
        Ok(())
    }

    async fn on_listener_publish_release(
        &mut self,
        packet_id: PacketId,
        dup: bool,
    ) -> Result<(), Error> {
        let mut packet = PublishReleasePacket::new(packet_id);
        packet.set_dup(dup);
        self.send(packet).await
    }

    /// Server side close, e.g. when another connection took over this
    /// client id. The will is published since the peer never sent a
    /// DISCONNECT packet.
    fn on_listener_disconnect(&mut self) -> Result<(), Error> {
        self.status = Status::Disconnected;
        Ok(())
    }
}
