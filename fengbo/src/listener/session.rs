// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Session cmd handlers.

use codec::v3::{ConnectPacket, PublishPacket, SubscribePacket, SubscribeTopic, UnsubscribePacket};
use codec::SubTopic;

use super::{Listener, PendingConnect};
use crate::commands::{
    ListenerToAuthCmd, ListenerToDispatcherCmd, ListenerToSessionCmd, SessionToListenerCmd,
};
use crate::error::Error;
use crate::types::{LastWill, SessionGid, SessionId};

impl Listener {
    pub(super) fn next_session_id(&mut self) -> SessionId {
        self.current_session_id += 1;
        self.current_session_id
    }

    pub(super) async fn handle_session_cmd(
        &mut self,
        cmd: SessionToListenerCmd,
    ) -> Result<(), Error> {
        match cmd {
            SessionToListenerCmd::Connect(session_id, packet) => {
                self.on_session_connect(session_id, packet).await
            }
            SessionToListenerCmd::Publish(session_id, packet) => {
                self.on_session_publish(session_id, packet).await
            }
            SessionToListenerCmd::PublishAck(session_id, packet_id) => {
                self.forward(ListenerToDispatcherCmd::PublishAck(
                    self.gid(session_id),
                    packet_id,
                ))
                .await
            }
            SessionToListenerCmd::PublishReceived(session_id, packet_id) => {
                self.forward(ListenerToDispatcherCmd::PublishReceived(
                    self.gid(session_id),
                    packet_id,
                ))
                .await
            }
            SessionToListenerCmd::PublishRelease(session_id, packet_id) => {
                self.forward(ListenerToDispatcherCmd::PublishRelease(
                    self.gid(session_id),
                    packet_id,
                ))
                .await
            }
            SessionToListenerCmd::PublishComplete(session_id, packet_id) => {
                self.forward(ListenerToDispatcherCmd::PublishComplete(
                    self.gid(session_id),
                    packet_id,
                ))
                .await
            }
            SessionToListenerCmd::Subscribe(session_id, packet) => {
                self.on_session_subscribe(session_id, packet).await
            }
            SessionToListenerCmd::Unsubscribe(session_id, packet) => {
                self.on_session_unsubscribe(session_id, packet).await
            }
            SessionToListenerCmd::Disconnect(session_id, will) => {
                self.on_session_disconnect(session_id, will).await
            }
        }
    }

    pub(super) const fn gid(&self, session_id: SessionId) -> SessionGid {
        SessionGid::new(self.id, session_id)
    }

    async fn forward(&mut self, cmd: ListenerToDispatcherCmd) -> Result<(), Error> {
        self.dispatcher_sender.send(cmd).await.map_err(Into::into)
    }

    async fn on_session_connect(
        &mut self,
        session_id: SessionId,
        packet: ConnectPacket,
    ) -> Result<(), Error> {
        let username = if packet.connect_flags().has_username() {
            Some(packet.username().to_string())
        } else {
            None
        };
        let password = packet.password().to_vec();

        self.pending_connects.insert(
            session_id,
            PendingConnect {
                client_id: packet.client_id().to_string(),
                username: username.clone(),
                clean_session: packet.connect_flags().clean_session(),
            },
        );

        self.auth_sender
            .send(ListenerToAuthCmd::RequestAuth(
                self.gid(session_id),
                username,
                password,
            ))
            .await
            .map_err(Into::into)
    }

    async fn on_session_publish(
        &mut self,
        session_id: SessionId,
        mut packet: PublishPacket,
    ) -> Result<(), Error> {
        if self.config.mount_point().is_some() {
            let mounted = self.mount_topic(packet.topic());
            packet.set_topic(&mounted)?;
        }
        self.forward(ListenerToDispatcherCmd::Publish(
            self.gid(session_id),
            packet,
        ))
        .await
    }

    async fn on_session_subscribe(
        &mut self,
        session_id: SessionId,
        packet: SubscribePacket,
    ) -> Result<(), Error> {
        let packet = if self.config.mount_point().is_some() {
            let mut topics = Vec::with_capacity(packet.topics().len());
            for topic in packet.topics() {
                let mounted = self.mount_topic(topic.topic());
                topics.push(SubscribeTopic::new(&mounted, topic.qos())?);
            }
            SubscribePacket::with_topics(packet.packet_id(), topics)
        } else {
            packet
        };

        self.forward(ListenerToDispatcherCmd::Subscribe(
            self.gid(session_id),
            packet,
        ))
        .await
    }

    async fn on_session_unsubscribe(
        &mut self,
        session_id: SessionId,
        packet: UnsubscribePacket,
    ) -> Result<(), Error> {
        let packet = if self.config.mount_point().is_some() {
            let mut topics = Vec::with_capacity(packet.topics().len());
            for topic in packet.topics() {
                let mounted = self.mount_topic(topic.as_ref());
                topics.push(SubTopic::new(&mounted)?);
            }
            UnsubscribePacket::with_topics(packet.packet_id(), topics)
        } else {
            packet
        };

        self.forward(ListenerToDispatcherCmd::Unsubscribe(
            self.gid(session_id),
            packet,
        ))
        .await
    }

    async fn on_session_disconnect(
        &mut self,
        session_id: SessionId,
        will: Option<LastWill>,
    ) -> Result<(), Error> {
        self.session_senders.remove(&session_id);
        self.pending_connects.remove(&session_id);

        let will = will.map(|mut will| {
            will.topic = self.mount_topic(&will.topic);
            will
        });

        self.forward(ListenerToDispatcherCmd::SessionDisconnected {
            gid: self.gid(session_id),
            will,
        })
        .await
    }

    pub(super) async fn send_to_session(
        &mut self,
        session_id: SessionId,
        cmd: ListenerToSessionCmd,
    ) -> Result<(), Error> {
        if let Some(session_sender) = self.session_senders.get(&session_id) {
            session_sender.send(cmd).await.map_err(Into::into)
        } else {
            Err(Error::session_error(session_id))
        }
    }
}
