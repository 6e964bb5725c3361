// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The dispatcher owns the broker core state: subscription trie, message
//! store, per-client delivery queues, retained messages and persistence.
//! Every other module talks to it over command channels; no broker state
//! is shared between tasks.

use codec::{PacketId, QoS};
use std::collections::HashMap;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{interval_at, Duration, Instant};

use crate::auth::{Acl, AclAccess};
use crate::commands::{
    BridgeToDispatcherCmd, DispatcherToBridgeCmd, DispatcherToListenerCmd, DispatcherToMetricsCmd,
    DispatcherToServerContexCmd, ListenerToDispatcherCmd, MetricsToDispatcherCmd,
    ServerContextToDispatcherCmd,
};
use crate::config;
use crate::error::Error;
use crate::inflight::{EnqueueResult, InflightQueue};
use crate::store::{MessageStore, StoreId};
use crate::trie::SubTrie;
use crate::types::{ListenerId, SessionGid};

mod bridge;
mod listener;
mod metrics;
mod persist;

#[cfg(test)]
mod tests;

/// Fallback period for timers which are configured off.
const DISABLED_TIMER_PERIOD: Duration = Duration::from_secs(3600 * 24);

/// Broker-side state of one client, surviving socket turnover for
/// durable sessions.
#[derive(Debug)]
pub(crate) struct ClientSession {
    /// Connection currently bound to this client id; None while a durable
    /// session is offline.
    gid: Option<SessionGid>,
    username: Option<String>,
    clean_session: bool,
    /// Bridges publish connection state notifications on `$SYS`.
    notifications: bool,
    queue: InflightQueue,
}

#[derive(Debug)]
pub struct Dispatcher {
    general: config::General,
    storage: config::Storage,
    security: config::Security,
    acl: Acl,

    trie: SubTrie,
    store: MessageStore,
    sessions: HashMap<String, ClientSession>,
    gid_index: HashMap<SessionGid, String>,

    listener_senders: HashMap<ListenerId, Sender<DispatcherToListenerCmd>>,
    listener_receiver: Receiver<ListenerToDispatcherCmd>,

    bridge_sender: Sender<DispatcherToBridgeCmd>,
    bridge_receiver: Receiver<BridgeToDispatcherCmd>,

    metrics_sender: Sender<DispatcherToMetricsCmd>,
    metrics_receiver: Receiver<MetricsToDispatcherCmd>,

    server_ctx_sender: Sender<DispatcherToServerContexCmd>,
    server_ctx_receiver: Receiver<ServerContextToDispatcherCmd>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        general: config::General,
        storage: config::Storage,
        security: config::Security,
        acl: Acl,
        // listeners module
        listener_senders: Vec<(ListenerId, Sender<DispatcherToListenerCmd>)>,
        listener_receiver: Receiver<ListenerToDispatcherCmd>,
        // bridge module
        bridge_sender: Sender<DispatcherToBridgeCmd>,
        bridge_receiver: Receiver<BridgeToDispatcherCmd>,
        // metrics module
        metrics_sender: Sender<DispatcherToMetricsCmd>,
        metrics_receiver: Receiver<MetricsToDispatcherCmd>,
        // server ctx module
        server_ctx_sender: Sender<DispatcherToServerContexCmd>,
        server_ctx_receiver: Receiver<ServerContextToDispatcherCmd>,
    ) -> Self {
        Self {
            general,
            storage,
            security,
            acl,

            trie: SubTrie::new(),
            store: MessageStore::new(),
            sessions: HashMap::new(),
            gid_index: HashMap::new(),

            listener_senders: listener_senders.into_iter().collect(),
            listener_receiver,

            bridge_sender,
            bridge_receiver,

            metrics_sender,
            metrics_receiver,

            server_ctx_sender,
            server_ctx_receiver,
        }
    }

    fn timer_period(enabled: bool, period: Duration) -> Duration {
        if enabled && !period.is_zero() {
            period
        } else {
            DISABLED_TIMER_PERIOD
        }
    }

    pub async fn run_loop(&mut self) {
        let retry_period = Self::timer_period(true, self.general.retry_interval());
        let clean_period = Self::timer_period(true, self.general.store_clean_interval());
        let autosave_period = Self::timer_period(
            self.storage.persistence() && self.storage.autosave_enabled(),
            self.storage.autosave_interval(),
        );

        let mut retry_timer = interval_at(Instant::now() + retry_period, retry_period);
        let mut clean_timer = interval_at(Instant::now() + clean_period, clean_period);
        let mut autosave_timer = interval_at(Instant::now() + autosave_period, autosave_period);

        loop {
            tokio::select! {
                Some(cmd) = self.listener_receiver.recv() => {
                    if let Err(err) = self.handle_listener_cmd(cmd).await {
                        log::error!("dispatcher: handle listener cmd failed: {err:?}");
                    }
                }
                Some(cmd) = self.bridge_receiver.recv() => {
                    if let Err(err) = self.handle_bridge_cmd(cmd).await {
                        log::error!("dispatcher: handle bridge cmd failed: {err:?}");
                    }
                }
                Some(cmd) = self.metrics_receiver.recv() => {
                    if let Err(err) = self.handle_metrics_cmd(cmd).await {
                        log::error!("dispatcher: handle metrics cmd failed: {err:?}");
                    }
                }
                Some(cmd) = self.server_ctx_receiver.recv() => {
                    match self.handle_server_ctx_cmd(cmd).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(err) => {
                            log::error!("dispatcher: handle server ctx cmd failed: {err:?}");
                        }
                    }
                }
                _ = retry_timer.tick() => {
                    self.handle_retry_timeout().await;
                }
                _ = clean_timer.tick() => {
                    self.handle_store_clean().await;
                }
                _ = autosave_timer.tick() => {
                    self.handle_autosave();
                }
            }
        }
    }

    /// Returns true when the loop shall exit.
    async fn handle_server_ctx_cmd(
        &mut self,
        cmd: ServerContextToDispatcherCmd,
    ) -> Result<bool, Error> {
        match cmd {
            ServerContextToDispatcherCmd::Backup => {
                if self.storage.persistence() {
                    self.backup(true, false)?;
                }
                Ok(false)
            }
            ServerContextToDispatcherCmd::DumpSubscriptions => {
                log::info!("dispatcher: subscription tree:\n{}", self.trie.dump());
                Ok(false)
            }
            ServerContextToDispatcherCmd::Reload => {
                self.reload_acl();
                Ok(false)
            }
            ServerContextToDispatcherCmd::Shutdown => {
                if self.storage.persistence() {
                    if let Err(err) = self.backup(true, true) {
                        log::error!("dispatcher: final backup failed: {err:?}");
                    }
                }
                self.server_ctx_sender
                    .send(DispatcherToServerContexCmd::ShutdownComplete)
                    .await?;
                Ok(true)
            }
        }
    }

    fn reload_acl(&mut self) {
        match self.security.acl_file() {
            Some(path) => match Acl::load(path) {
                Ok(acl) => {
                    log::info!("dispatcher: reloaded acl file {path:?}");
                    self.acl = acl;
                }
                Err(err) => {
                    log::error!("dispatcher: failed to reload acl file: {err:?}");
                }
            },
            None => {
                self.acl = Acl::allow_all();
            }
        }
    }

    async fn handle_retry_timeout(&mut self) {
        let threshold = self.general.retry_interval();
        let mut flipped_clients = Vec::new();
        for (client_id, session) in &mut self.sessions {
            if session.queue.timeout_check(threshold) > 0 && session.gid.is_some() {
                flipped_clients.push(client_id.clone());
            }
        }
        for client_id in flipped_clients {
            self.pump(&client_id).await;
        }
    }

    async fn handle_store_clean(&mut self) {
        let removed = self.store.clean();
        if removed > 0 {
            log::debug!("dispatcher: store clean removed {removed} messages");
        }
        self.send_metrics(DispatcherToMetricsCmd::MessagesStored(self.store.len()))
            .await;
    }

    fn handle_autosave(&mut self) {
        if !self.storage.persistence() {
            return;
        }
        // A failed autosave keeps the previous snapshot; the next timer
        // tick retries.
        if let Err(err) = self.backup(false, false) {
            log::error!("dispatcher: autosave failed: {err:?}");
        }
    }

    async fn send_metrics(&mut self, cmd: DispatcherToMetricsCmd) {
        if let Err(err) = self.metrics_sender.send(cmd).await {
            log::error!("dispatcher: failed to send metrics cmd: {err:?}");
        }
    }

    /// Route a packet command to the listener or bridge owning `gid`.
    async fn send_conn_cmd(&mut self, gid: SessionGid, cmd: DispatcherToListenerCmd) {
        if gid.is_bridge() {
            #[allow(clippy::cast_possible_truncation)]
            let bridge_id = gid.session_id() as u32;
            let cmd = match cmd {
                DispatcherToListenerCmd::Publish(_, packet) => {
                    DispatcherToBridgeCmd::Publish(bridge_id, packet)
                }
                DispatcherToListenerCmd::PublishAck(_, packet_id) => {
                    DispatcherToBridgeCmd::PublishAck(bridge_id, packet_id)
                }
                DispatcherToListenerCmd::PublishReceived(_, packet_id) => {
                    DispatcherToBridgeCmd::PublishReceived(bridge_id, packet_id)
                }
                DispatcherToListenerCmd::PublishRelease(_, packet_id, dup) => {
                    DispatcherToBridgeCmd::PublishRelease(bridge_id, packet_id, dup)
                }
                DispatcherToListenerCmd::PublishComplete(_, packet_id) => {
                    DispatcherToBridgeCmd::PublishComplete(bridge_id, packet_id)
                }
                other => {
                    log::error!("dispatcher: invalid cmd for bridge connection: {other:?}");
                    return;
                }
            };
            if let Err(err) = self.bridge_sender.send(cmd).await {
                log::error!("dispatcher: failed to send bridge cmd: {err:?}");
            }
        } else if let Some(sender) = self.listener_senders.get(&gid.listener_id()) {
            if let Err(err) = sender.send(cmd).await {
                log::error!(
                    "dispatcher: failed to send cmd to listener {}: {err:?}",
                    gid.listener_id()
                );
            }
        } else {
            log::error!(
                "dispatcher: no listener sender with id {}",
                gid.listener_id()
            );
        }
    }

    fn new_queue(&self) -> InflightQueue {
        InflightQueue::new(
            self.general.max_inflight_messages(),
            self.general.max_queued_messages(),
        )
    }

    /// Insert an outgoing delivery into one client's queue.
    fn enqueue_outgoing(&mut self, client_id: &str, store_id: StoreId, qos: QoS, retain: bool) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            log::error!("dispatcher: enqueue for unknown client {client_id}");
            return;
        };
        // QoS 0 messages are not queued for offline durable sessions.
        if qos == QoS::AtMostOnce && session.gid.is_none() {
            return;
        }
        match session.queue.push_outgoing(store_id, qos, retain) {
            EnqueueResult::Dropped => {
                log::warn!("dispatcher: delivery queue of {client_id} is full, dropping message");
            }
            EnqueueResult::Active(_) | EnqueueResult::Queued(_) => {
                self.store.ref_inc(store_id);
            }
        }
    }

    /// Emit pending packets of one client's queue.
    async fn pump(&mut self, client_id: &str) {
        use crate::inflight::Emission;

        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        let Some(gid) = session.gid else {
            return;
        };

        let (emissions, released) = session.queue.write_phase();
        for store_id in released {
            self.store.ref_dec(store_id);
        }

        for emission in emissions {
            match emission {
                Emission::Publish {
                    store_id,
                    mid,
                    qos,
                    retain,
                    dup,
                } => match self.build_publish(store_id, mid, qos, retain, dup) {
                    Some(packet) => {
                        let bytes = codec::Packet::bytes(&packet).unwrap_or(0);
                        self.send_conn_cmd(
                            gid,
                            DispatcherToListenerCmd::Publish(gid.session_id(), packet),
                        )
                        .await;
                        self.send_metrics(DispatcherToMetricsCmd::PacketSent(bytes)).await;
                    }
                    None => {
                        log::error!("dispatcher: no stored message with id {store_id}");
                    }
                },
                Emission::PubRec { mid } => {
                    self.send_conn_cmd(
                        gid,
                        DispatcherToListenerCmd::PublishReceived(
                            gid.session_id(),
                            PacketId::new(mid),
                        ),
                    )
                    .await;
                    self.send_metrics(DispatcherToMetricsCmd::PacketSent(4)).await;
                }
                Emission::PubRel { mid, dup } => {
                    self.send_conn_cmd(
                        gid,
                        DispatcherToListenerCmd::PublishRelease(
                            gid.session_id(),
                            PacketId::new(mid),
                            dup,
                        ),
                    )
                    .await;
                    self.send_metrics(DispatcherToMetricsCmd::PacketSent(4)).await;
                }
                Emission::PubComp { mid } => {
                    self.send_conn_cmd(
                        gid,
                        DispatcherToListenerCmd::PublishComplete(
                            gid.session_id(),
                            PacketId::new(mid),
                        ),
                    )
                    .await;
                    self.send_metrics(DispatcherToMetricsCmd::PacketSent(4)).await;
                }
            }
        }
    }

    fn build_publish(
        &self,
        store_id: StoreId,
        mid: u16,
        qos: QoS,
        retain: bool,
        dup: bool,
    ) -> Option<codec::v3::PublishPacket> {
        let stored = self.store.get(store_id)?;
        let mut packet =
            codec::v3::PublishPacket::new(stored.topic(), qos, stored.payload()).ok()?;
        packet.set_retain(retain);
        if qos != QoS::AtMostOnce {
            packet.set_packet_id(PacketId::new(mid));
            if dup {
                let _ret = packet.set_dup(true);
            }
        }
        Some(packet)
    }

    /// Store and fan out a message generated by the broker itself, e.g.
    /// `$SYS` updates and bridge notifications.
    async fn publish_internal(&mut self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) {
        let store_id = self.store.insert("", 0, topic, qos, retain, payload);
        self.fan_out(store_id).await;
    }

    /// Deliver a stored message to every matching subscription and update
    /// the retained slot of its topic.
    async fn fan_out(&mut self, store_id: StoreId) {
        let Some(stored) = self.store.get(store_id) else {
            log::error!("dispatcher: fan out of unknown store id {store_id}");
            return;
        };
        let topic = stored.topic().to_string();
        let qos = stored.qos();
        let retain = stored.retain();
        let empty_payload = stored.payload().is_empty();
        let source_id = stored.source_id().to_string();

        if retain {
            if empty_payload {
                // A zero length retained message clears the slot.
                if let Some(old) = self.trie.set_retained(&topic, None) {
                    self.store.ref_dec(old);
                    self.send_metrics(DispatcherToMetricsCmd::RetainedRemoved).await;
                }
            } else {
                let old = self.trie.set_retained(&topic, Some(store_id));
                self.store.ref_inc(store_id);
                match old {
                    Some(old) => self.store.ref_dec(old),
                    None => self.send_metrics(DispatcherToMetricsCmd::RetainedAdded).await,
                }
            }
        }

        let matches = self.trie.collect_matches(&topic);
        let mut touched = Vec::new();
        for (client_id, sub_qos) in matches {
            let Some(session) = self.sessions.get(&client_id) else {
                log::error!("dispatcher: subscriber {client_id} has no session entry");
                continue;
            };
            // A bridge never gets its own publications back.
            let is_bridge = session.gid.map_or(false, |gid| gid.is_bridge());
            if is_bridge && client_id == source_id {
                continue;
            }
            if !self
                .acl
                .check(session.username.as_deref(), &topic, AclAccess::Read)
            {
                continue;
            }

            let effective_qos = qos.min(sub_qos);
            self.enqueue_outgoing(&client_id, store_id, effective_qos, false);
            if !touched.contains(&client_id) {
                touched.push(client_id);
            }
        }

        for client_id in touched {
            self.pump(&client_id).await;
        }
    }
}
