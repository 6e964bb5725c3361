// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Dispatcher cmd handlers.

use codec::v3::{ConnectAckPacket, ConnectReturnCode, PublishPacket};

use super::Listener;
use crate::commands::{DispatcherToListenerCmd, ListenerToSessionCmd};
use crate::error::Error;
use crate::types::SessionId;

impl Listener {
    pub(super) async fn handle_dispatcher_cmd(
        &mut self,
        cmd: DispatcherToListenerCmd,
    ) -> Result<(), Error> {
        match cmd {
            DispatcherToListenerCmd::ConnectAck(session_id, return_code) => {
                self.on_dispatcher_connect_ack(session_id, return_code)
                    .await
            }
            DispatcherToListenerCmd::Publish(session_id, packet) => {
                self.on_dispatcher_publish(session_id, packet).await
            }
            DispatcherToListenerCmd::PublishAck(session_id, packet_id) => {
                self.send_to_session(session_id, ListenerToSessionCmd::PublishAck(packet_id))
                    .await
            }
            DispatcherToListenerCmd::PublishReceived(session_id, packet_id) => {
                self.send_to_session(
                    session_id,
                    ListenerToSessionCmd::PublishReceived(packet_id),
                )
                .await
            }
            DispatcherToListenerCmd::PublishRelease(session_id, packet_id, dup) => {
                self.send_to_session(
                    session_id,
                    ListenerToSessionCmd::PublishRelease(packet_id, dup),
                )
                .await
            }
            DispatcherToListenerCmd::PublishComplete(session_id, packet_id) => {
                self.send_to_session(
                    session_id,
                    ListenerToSessionCmd::PublishComplete(packet_id),
                )
                .await
            }
            DispatcherToListenerCmd::SubscribeAck(session_id, packet) => {
                self.send_to_session(session_id, ListenerToSessionCmd::SubscribeAck(packet))
                    .await
            }
            DispatcherToListenerCmd::Disconnect(session_id) => {
                self.send_to_session(session_id, ListenerToSessionCmd::Disconnect)
                    .await
            }
        }
    }

    async fn on_dispatcher_connect_ack(
        &mut self,
        session_id: SessionId,
        return_code: ConnectReturnCode,
    ) -> Result<(), Error> {
        let ack_packet = ConnectAckPacket::new(return_code);
        self.send_to_session(session_id, ListenerToSessionCmd::ConnectAck(ack_packet))
            .await
    }

    async fn on_dispatcher_publish(
        &mut self,
        session_id: SessionId,
        mut packet: PublishPacket,
    ) -> Result<(), Error> {
        if self.config.mount_point().is_some() {
            let unmounted = self.unmount_topic(packet.topic()).to_string();
            packet.set_topic(&unmounted)?;
        }
        self.send_to_session(session_id, ListenerToSessionCmd::Publish(packet))
            .await
    }
}
