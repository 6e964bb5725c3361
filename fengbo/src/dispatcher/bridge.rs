// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Bridge cmd handlers.
//!
//! A bridge connection is a session like any other, registered under the
//! reserved bridge listener id. Outbound topic patterns become ordinary
//! subscriptions owned by the bridge's client id; their deliveries flow
//! back out to the peer broker as publish packets.

use codec::QoS;

use super::{ClientSession, Dispatcher};
use crate::commands::{BridgeToDispatcherCmd, DispatcherToMetricsCmd};
use crate::error::Error;
use crate::types::{BridgeId, SessionGid};

impl Dispatcher {
    pub(super) async fn handle_bridge_cmd(
        &mut self,
        cmd: BridgeToDispatcherCmd,
    ) -> Result<(), Error> {
        match cmd {
            BridgeToDispatcherCmd::BridgeUp {
                bridge_id,
                client_id,
                clean_session,
                subscriptions,
                notifications,
            } => {
                self.on_bridge_up(
                    bridge_id,
                    client_id,
                    clean_session,
                    subscriptions,
                    notifications,
                )
                .await
            }
            BridgeToDispatcherCmd::BridgeDown(bridge_id) => self.on_bridge_down(bridge_id).await,
            BridgeToDispatcherCmd::Publish(bridge_id, packet) => {
                self.on_publish(SessionGid::bridge(bridge_id), packet).await
            }
            BridgeToDispatcherCmd::PublishAck(bridge_id, packet_id) => {
                self.on_publish_ack(SessionGid::bridge(bridge_id), packet_id)
                    .await
            }
            BridgeToDispatcherCmd::PublishReceived(bridge_id, packet_id) => {
                self.on_publish_received(SessionGid::bridge(bridge_id), packet_id)
                    .await
            }
            BridgeToDispatcherCmd::PublishRelease(bridge_id, packet_id) => {
                self.on_publish_release(SessionGid::bridge(bridge_id), packet_id)
                    .await
            }
            BridgeToDispatcherCmd::PublishComplete(bridge_id, packet_id) => {
                self.on_publish_complete(SessionGid::bridge(bridge_id), packet_id)
                    .await
            }
        }
    }

    async fn on_bridge_up(
        &mut self,
        bridge_id: BridgeId,
        client_id: String,
        clean_session: bool,
        subscriptions: Vec<(String, QoS)>,
        notifications: bool,
    ) -> Result<(), Error> {
        let gid = SessionGid::bridge(bridge_id);
        log::info!("dispatcher: bridge {client_id} connected");

        let resumed = !clean_session
            && self
                .sessions
                .get(&client_id)
                .map_or(false, |session| !session.clean_session);

        if resumed {
            let session = self
                .sessions
                .get_mut(&client_id)
                .expect("durable bridge session checked above");
            session.gid = Some(gid);
            session.notifications = notifications;
            session.queue.mark_reconnect();
        } else {
            self.wipe_session_state(&client_id).await;
            let queue = self.new_queue();
            self.sessions.insert(
                client_id.clone(),
                ClientSession {
                    gid: Some(gid),
                    username: None,
                    clean_session,
                    notifications,
                    queue,
                },
            );
        }
        self.gid_index.insert(gid, client_id.clone());

        // Local subscriptions feeding outbound topic patterns.
        let mut added = 0;
        for (pattern, qos) in subscriptions {
            if !self.trie.subscribe(&client_id, &pattern, qos) {
                added += 1;
            }
        }
        if added > 0 {
            self.send_metrics(DispatcherToMetricsCmd::SubscriptionsAdded(added)).await;
        }
        self.send_metrics(DispatcherToMetricsCmd::SessionAdded).await;

        if notifications {
            let topic = bridge_state_topic(&client_id);
            self.publish_internal(&topic, QoS::AtLeastOnce, true, b"1")
                .await;
        }

        // Flush deliveries queued while the bridge was away.
        self.pump(&client_id).await;
        Ok(())
    }

    async fn on_bridge_down(&mut self, bridge_id: BridgeId) -> Result<(), Error> {
        let gid = SessionGid::bridge(bridge_id);
        let Some(client_id) = self.gid_index.remove(&gid) else {
            return Ok(());
        };
        log::info!("dispatcher: bridge {client_id} disconnected");

        let (clean_session, notifications) = match self.sessions.get_mut(&client_id) {
            Some(session) => {
                session.gid = None;
                (session.clean_session, session.notifications)
            }
            None => return Ok(()),
        };
        self.send_metrics(DispatcherToMetricsCmd::SessionRemoved).await;

        if notifications {
            let topic = bridge_state_topic(&client_id);
            self.publish_internal(&topic, QoS::AtLeastOnce, true, b"0")
                .await;
        }

        if clean_session {
            self.wipe_session_state(&client_id).await;
        }
        Ok(())
    }
}

fn bridge_state_topic(client_id: &str) -> String {
    format!("$SYS/broker/connection/{client_id}/state")
}
