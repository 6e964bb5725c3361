// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Bridge connections to remote brokers.
//!
//! For every configured bridge the broker opens an outbound connection
//! and acts as an ordinary MQTT client there: it subscribes to the
//! inbound topic patterns and publishes messages matching the outbound
//! ones. The dispatcher side of a bridge is a normal session under the
//! reserved bridge listener id.

use codec::v3::PublishPacket;
use codec::PacketId;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::commands::{BridgeToDispatcherCmd, DispatcherToBridgeCmd};
use crate::config;
use crate::types::BridgeId;

mod conn;

use conn::BridgeConn;

const CHANNEL_CAPACITY: usize = 16;

/// Packet commands routed from the dispatcher to one bridge connection.
#[derive(Debug, Clone)]
pub(crate) enum ConnCmd {
    Publish(PublishPacket),
    PublishAck(PacketId),
    PublishReceived(PacketId),
    PublishRelease(PacketId, bool),
    PublishComplete(PacketId),
}

/// Owns the bridge connection tasks and routes dispatcher commands to
/// them.
#[derive(Debug)]
pub struct BridgeApp {
    bridges: Vec<config::Bridge>,

    dispatcher_sender: Sender<BridgeToDispatcherCmd>,
    dispatcher_receiver: Receiver<DispatcherToBridgeCmd>,

    conn_senders: HashMap<BridgeId, Sender<ConnCmd>>,
}

impl BridgeApp {
    #[must_use]
    pub fn new(
        bridges: Vec<config::Bridge>,
        // dispatcher module
        dispatcher_sender: Sender<BridgeToDispatcherCmd>,
        dispatcher_receiver: Receiver<DispatcherToBridgeCmd>,
    ) -> Self {
        Self {
            bridges,
            dispatcher_sender,
            dispatcher_receiver,
            conn_senders: HashMap::new(),
        }
    }

    pub async fn run_loop(&mut self) {
        for (bridge_id, bridge_config) in (0_u32..).zip(self.bridges.iter()) {
            let (conn_sender, conn_receiver) = mpsc::channel(CHANNEL_CAPACITY);
            self.conn_senders.insert(bridge_id, conn_sender);
            let conn = BridgeConn::new(
                bridge_id,
                bridge_config.clone(),
                self.dispatcher_sender.clone(),
                conn_receiver,
            );
            tokio::spawn(conn.run_loop());
        }

        while let Some(cmd) = self.dispatcher_receiver.recv().await {
            self.handle_dispatcher_cmd(cmd).await;
        }
    }

    async fn handle_dispatcher_cmd(&mut self, cmd: DispatcherToBridgeCmd) {
        let (bridge_id, conn_cmd) = match cmd {
            DispatcherToBridgeCmd::Publish(id, packet) => (id, ConnCmd::Publish(packet)),
            DispatcherToBridgeCmd::PublishAck(id, packet_id) => {
                (id, ConnCmd::PublishAck(packet_id))
            }
            DispatcherToBridgeCmd::PublishReceived(id, packet_id) => {
                (id, ConnCmd::PublishReceived(packet_id))
            }
            DispatcherToBridgeCmd::PublishRelease(id, packet_id, dup) => {
                (id, ConnCmd::PublishRelease(packet_id, dup))
            }
            DispatcherToBridgeCmd::PublishComplete(id, packet_id) => {
                (id, ConnCmd::PublishComplete(packet_id))
            }
        };

        match self.conn_senders.get(&bridge_id) {
            Some(sender) => {
                if let Err(err) = sender.send(conn_cmd).await {
                    log::error!("bridge: failed to send cmd to connection {bridge_id}: {err:?}");
                }
            }
            None => {
                log::error!("bridge: no connection with id {bridge_id}");
            }
        }
    }
}
