// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Listener cmd handlers: connects, publishes, acknowledgements,
//! subscriptions.

use codec::v3::{
    ConnectReturnCode, PublishPacket, SubscribeAck, SubscribeAckPacket, SubscribePacket,
    UnsubscribePacket,
};
use codec::{Packet, PacketId, QoS};

use super::{ClientSession, Dispatcher};
use crate::auth::AclAccess;
use crate::commands::{
    DispatcherToListenerCmd, DispatcherToMetricsCmd, ListenerToDispatcherCmd,
};
use crate::error::Error;
use crate::types::{LastWill, SessionGid};

impl Dispatcher {
    pub(super) async fn handle_listener_cmd(
        &mut self,
        cmd: ListenerToDispatcherCmd,
    ) -> Result<(), Error> {
        match cmd {
            ListenerToDispatcherCmd::SessionConnected {
                gid,
                client_id,
                username,
                clean_session,
            } => {
                self.on_session_connected(gid, client_id, username, clean_session)
                    .await
            }
            ListenerToDispatcherCmd::Publish(gid, packet) => self.on_publish(gid, packet).await,
            ListenerToDispatcherCmd::PublishAck(gid, packet_id) => {
                self.on_publish_ack(gid, packet_id).await
            }
            ListenerToDispatcherCmd::PublishReceived(gid, packet_id) => {
                self.on_publish_received(gid, packet_id).await
            }
            ListenerToDispatcherCmd::PublishRelease(gid, packet_id) => {
                self.on_publish_release(gid, packet_id).await
            }
            ListenerToDispatcherCmd::PublishComplete(gid, packet_id) => {
                self.on_publish_complete(gid, packet_id).await
            }
            ListenerToDispatcherCmd::Subscribe(gid, packet) => {
                self.on_subscribe(gid, packet).await
            }
            ListenerToDispatcherCmd::Unsubscribe(gid, packet) => {
                self.on_unsubscribe(gid, packet).await
            }
            ListenerToDispatcherCmd::SessionDisconnected { gid, will } => {
                self.on_session_disconnected(gid, will).await
            }
        }
    }

    pub(super) async fn on_session_connected(
        &mut self,
        gid: SessionGid,
        client_id: String,
        username: Option<String>,
        clean_session: bool,
    ) -> Result<(), Error> {
        // At most one connection per client id: the newer connection wins
        // and the older one is closed.
        if let Some(existing) = self.sessions.get(&client_id) {
            if let Some(old_gid) = existing.gid {
                if old_gid != gid {
                    log::info!(
                        "dispatcher: client id {client_id} taken over, closing old connection"
                    );
                    self.gid_index.remove(&old_gid);
                    self.send_conn_cmd(
                        old_gid,
                        DispatcherToListenerCmd::Disconnect(old_gid.session_id()),
                    )
                    .await;
                    self.send_metrics(DispatcherToMetricsCmd::SessionRemoved).await;
                }
            }
        }

        let resumed = !clean_session
            && self
                .sessions
                .get(&client_id)
                .map_or(false, |session| !session.clean_session);

        if resumed {
            let session = self
                .sessions
                .get_mut(&client_id)
                .expect("durable session checked above");
            session.gid = Some(gid);
            session.username = username;
            session.clean_session = clean_session;
            session.queue.mark_reconnect();
        } else {
            // Discard whatever durable state existed under this id.
            self.wipe_session_state(&client_id).await;
            let queue = self.new_queue();
            self.sessions.insert(
                client_id.clone(),
                ClientSession {
                    gid: Some(gid),
                    username,
                    clean_session,
                    notifications: false,
                    queue,
                },
            );
        }
        self.gid_index.insert(gid, client_id.clone());

        self.send_conn_cmd(
            gid,
            DispatcherToListenerCmd::ConnectAck(gid.session_id(), ConnectReturnCode::Accepted),
        )
        .await;
        self.send_metrics(DispatcherToMetricsCmd::SessionAdded).await;

        // Flush deliveries queued while the durable session was offline.
        self.pump(&client_id).await;
        Ok(())
    }

    /// Remove subscriptions and queued messages of one client id.
    pub(super) async fn wipe_session_state(&mut self, client_id: &str) {
        let Some(mut session) = self.sessions.remove(client_id) else {
            return;
        };
        let removed_subs = self.trie.remove_client(client_id);
        if removed_subs > 0 {
            self.send_metrics(DispatcherToMetricsCmd::SubscriptionsRemoved(removed_subs))
                .await;
        }
        for store_id in session.queue.clear() {
            self.store.ref_dec(store_id);
        }
    }

    pub(super) async fn on_session_disconnected(
        &mut self,
        gid: SessionGid,
        will: Option<LastWill>,
    ) -> Result<(), Error> {
        let Some(client_id) = self.gid_index.remove(&gid) else {
            // Connection died before a successful CONNECT.
            return Ok(());
        };

        let clean_session = match self.sessions.get_mut(&client_id) {
            Some(session) if session.gid == Some(gid) => {
                session.gid = None;
                session.clean_session
            }
            // A newer connection already owns this client id.
            _ => {
                self.send_metrics(DispatcherToMetricsCmd::SessionRemoved).await;
                self.publish_will(&client_id, will).await;
                return Ok(());
            }
        };

        self.send_metrics(DispatcherToMetricsCmd::SessionRemoved).await;
        self.publish_will(&client_id, will).await;

        if clean_session {
            self.wipe_session_state(&client_id).await;
        }
        Ok(())
    }

    /// Publish the will of a connection which ended without a clean
    /// DISCONNECT packet.
    async fn publish_will(&mut self, client_id: &str, will: Option<LastWill>) {
        let Some(will) = will else {
            return;
        };
        log::info!(
            "dispatcher: publishing will of {client_id} on {}",
            will.topic
        );
        let username = self
            .sessions
            .get(client_id)
            .and_then(|session| session.username.clone());
        if !self
            .acl
            .check(username.as_deref(), &will.topic, AclAccess::Write)
        {
            log::warn!("dispatcher: will of {client_id} denied by acl");
            return;
        }
        let store_id = self
            .store
            .insert(client_id, 0, &will.topic, will.qos, will.retain, &will.message);
        self.fan_out(store_id).await;
    }

    pub(super) async fn on_publish(
        &mut self,
        gid: SessionGid,
        packet: PublishPacket,
    ) -> Result<(), Error> {
        self.send_metrics(DispatcherToMetricsCmd::PacketReceived(
            packet.bytes().unwrap_or(0),
        ))
        .await;

        let Some(client_id) = self.gid_index.get(&gid).cloned() else {
            return Err(Error::session_error(gid.session_id()));
        };
        let username = self
            .sessions
            .get(&client_id)
            .and_then(|session| session.username.clone());

        // A write-denied publication is silently swallowed: MQTT 3.1 has
        // no negative publish acknowledgement, so the acks still flow.
        let acl_ok = self
            .acl
            .check(username.as_deref(), packet.topic(), AclAccess::Write);

        match packet.qos() {
            QoS::AtMostOnce => {
                if acl_ok {
                    self.store_and_fan_out(&client_id, &packet).await;
                }
            }
            QoS::AtLeastOnce => {
                if acl_ok {
                    self.store_and_fan_out(&client_id, &packet).await;
                }
                self.send_conn_cmd(
                    gid,
                    DispatcherToListenerCmd::PublishAck(gid.session_id(), packet.packet_id()),
                )
                .await;
                self.send_metrics(DispatcherToMetricsCmd::PacketSent(4)).await;
            }
            QoS::ExactOnce => {
                let mid = packet.packet_id();
                let duplicate = self
                    .sessions
                    .get(&client_id)
                    .map_or(false, |session| session.queue.has_incoming(mid.value()));

                if !duplicate && acl_ok {
                    let store_id = self.store.insert(
                        &client_id,
                        mid.value(),
                        packet.topic(),
                        packet.qos(),
                        packet.retain(),
                        packet.message(),
                    );
                    self.store.ref_inc(store_id);
                    if let Some(session) = self.sessions.get_mut(&client_id) {
                        session.queue.push_incoming(store_id, mid.value());
                    }
                }
                // Fan-out happens when the release packet arrives; the
                // receipt is (re-)sent for duplicates as well.
                self.send_conn_cmd(
                    gid,
                    DispatcherToListenerCmd::PublishReceived(gid.session_id(), mid),
                )
                .await;
                self.send_metrics(DispatcherToMetricsCmd::PacketSent(4)).await;
            }
        }
        Ok(())
    }

    fn store_message(&mut self, client_id: &str, packet: &PublishPacket) -> crate::store::StoreId {
        self.store.insert(
            client_id,
            packet.packet_id().value(),
            packet.topic(),
            packet.qos(),
            packet.retain(),
            packet.message(),
        )
    }

    async fn store_and_fan_out(&mut self, client_id: &str, packet: &PublishPacket) {
        let store_id = self.store_message(client_id, packet);
        self.fan_out(store_id).await;
    }

    pub(super) async fn on_publish_ack(
        &mut self,
        gid: SessionGid,
        packet_id: PacketId,
    ) -> Result<(), Error> {
        self.send_metrics(DispatcherToMetricsCmd::PacketReceived(4)).await;
        let Some(client_id) = self.gid_index.get(&gid).cloned() else {
            return Err(Error::session_error(gid.session_id()));
        };
        let acked = self
            .sessions
            .get_mut(&client_id)
            .and_then(|session| session.queue.ack_puback(packet_id.value()));
        match acked {
            Some(store_id) => {
                self.store.ref_dec(store_id);
                // A freed slot may admit a queued message.
                self.pump(&client_id).await;
            }
            None => {
                log::warn!(
                    "dispatcher: PUBACK {packet_id} from {client_id} matches no delivery"
                );
            }
        }
        Ok(())
    }

    pub(super) async fn on_publish_received(
        &mut self,
        gid: SessionGid,
        packet_id: PacketId,
    ) -> Result<(), Error> {
        self.send_metrics(DispatcherToMetricsCmd::PacketReceived(4)).await;
        let Some(client_id) = self.gid_index.get(&gid).cloned() else {
            return Err(Error::session_error(gid.session_id()));
        };
        let found = self
            .sessions
            .get_mut(&client_id)
            .map_or(false, |session| session.queue.ack_pubrec(packet_id.value()));
        if found {
            self.send_conn_cmd(
                gid,
                DispatcherToListenerCmd::PublishRelease(gid.session_id(), packet_id, false),
            )
            .await;
            self.send_metrics(DispatcherToMetricsCmd::PacketSent(4)).await;
        } else {
            log::warn!("dispatcher: PUBREC {packet_id} from {client_id} matches no delivery");
        }
        Ok(())
    }

    pub(super) async fn on_publish_release(
        &mut self,
        gid: SessionGid,
        packet_id: PacketId,
    ) -> Result<(), Error> {
        self.send_metrics(DispatcherToMetricsCmd::PacketReceived(4)).await;
        let Some(client_id) = self.gid_index.get(&gid).cloned() else {
            return Err(Error::session_error(gid.session_id()));
        };
        let released = self
            .sessions
            .get_mut(&client_id)
            .and_then(|session| session.queue.release_incoming(packet_id.value()));

        if let Some(store_id) = released {
            self.fan_out(store_id).await;
            self.store.ref_dec(store_id);
        }

        // The completion is sent even for an unknown packet id: the entry
        // may have been released by an earlier PUBREL whose PUBCOMP was
        // lost.
        self.send_conn_cmd(
            gid,
            DispatcherToListenerCmd::PublishComplete(gid.session_id(), packet_id),
        )
        .await;
        self.send_metrics(DispatcherToMetricsCmd::PacketSent(4)).await;
        Ok(())
    }

    pub(super) async fn on_publish_complete(
        &mut self,
        gid: SessionGid,
        packet_id: PacketId,
    ) -> Result<(), Error> {
        self.send_metrics(DispatcherToMetricsCmd::PacketReceived(4)).await;
        let Some(client_id) = self.gid_index.get(&gid).cloned() else {
            return Err(Error::session_error(gid.session_id()));
        };
        let acked = self
            .sessions
            .get_mut(&client_id)
            .and_then(|session| session.queue.ack_pubcomp(packet_id.value()));
        match acked {
            Some(store_id) => {
                self.store.ref_dec(store_id);
                self.pump(&client_id).await;
            }
            None => {
                log::warn!(
                    "dispatcher: PUBCOMP {packet_id} from {client_id} matches no delivery"
                );
            }
        }
        Ok(())
    }

    pub(super) async fn on_subscribe(
        &mut self,
        gid: SessionGid,
        packet: SubscribePacket,
    ) -> Result<(), Error> {
        self.send_metrics(DispatcherToMetricsCmd::PacketReceived(
            packet.bytes().unwrap_or(0),
        ))
        .await;

        let Some(client_id) = self.gid_index.get(&gid).cloned() else {
            return Err(Error::session_error(gid.session_id()));
        };
        let username = self
            .sessions
            .get(&client_id)
            .and_then(|session| session.username.clone());

        let mut acks = Vec::with_capacity(packet.topics().len());
        let mut added = 0;
        let mut retained_deliveries = Vec::new();

        for topic in packet.topics() {
            // A read-denied filter is excluded from the subscription set;
            // the SUBACK still answers every requested filter.
            if !self
                .acl
                .check(username.as_deref(), topic.topic(), AclAccess::Read)
            {
                log::warn!(
                    "dispatcher: subscription of {client_id} to {} denied by acl",
                    topic.topic()
                );
                acks.push(SubscribeAck::Failed);
                continue;
            }

            let duplicate = self.trie.subscribe(&client_id, topic.topic(), topic.qos());
            if !duplicate {
                added += 1;
            }
            acks.push(SubscribeAck::QoS(topic.qos()));

            // Matching retained messages are delivered on every
            // subscribe, with the retain flag kept.
            for store_id in self.trie.retained_matches(topic.topic()) {
                if let Some(stored) = self.store.get(store_id) {
                    if !self
                        .acl
                        .check(username.as_deref(), stored.topic(), AclAccess::Read)
                    {
                        continue;
                    }
                    let effective_qos = stored.qos().min(topic.qos());
                    retained_deliveries.push((store_id, effective_qos));
                }
            }
        }

        if added > 0 {
            self.send_metrics(DispatcherToMetricsCmd::SubscriptionsAdded(added)).await;
        }

        let ack_packet = SubscribeAckPacket::with_vec(packet.packet_id(), acks);
        let bytes = ack_packet.bytes().unwrap_or(0);
        self.send_conn_cmd(
            gid,
            DispatcherToListenerCmd::SubscribeAck(gid.session_id(), ack_packet),
        )
        .await;
        self.send_metrics(DispatcherToMetricsCmd::PacketSent(bytes)).await;

        for (store_id, effective_qos) in retained_deliveries {
            self.enqueue_outgoing(&client_id, store_id, effective_qos, true);
        }
        self.pump(&client_id).await;
        Ok(())
    }

    pub(super) async fn on_unsubscribe(
        &mut self,
        gid: SessionGid,
        packet: UnsubscribePacket,
    ) -> Result<(), Error> {
        self.send_metrics(DispatcherToMetricsCmd::PacketReceived(
            packet.bytes().unwrap_or(0),
        ))
        .await;

        let Some(client_id) = self.gid_index.get(&gid).cloned() else {
            return Err(Error::session_error(gid.session_id()));
        };

        let mut removed = 0;
        for topic in packet.topics() {
            if self.trie.unsubscribe(&client_id, topic.as_ref()) {
                removed += 1;
            }
        }
        if removed > 0 {
            self.send_metrics(DispatcherToMetricsCmd::SubscriptionsRemoved(removed)).await;
        }
        Ok(())
    }
}
