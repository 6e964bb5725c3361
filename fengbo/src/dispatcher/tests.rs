// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End-to-end scenarios driven directly against the dispatcher.

use codec::v3::{ConnectReturnCode, PublishPacket, SubscribePacket, UnsubscribePacket};
use codec::{PacketId, QoS};
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::Dispatcher;
use crate::auth::Acl;
use crate::commands::{
    BridgeToDispatcherCmd, DispatcherToBridgeCmd, DispatcherToListenerCmd, DispatcherToMetricsCmd,
    DispatcherToServerContexCmd, ListenerToDispatcherCmd, MetricsToDispatcherCmd,
    ServerContextToDispatcherCmd,
};
use crate::config::{General, Security, Storage};
use crate::store::StoreId;
use crate::types::SessionGid;

const TEST_CHANNEL_CAPACITY: usize = 10_000;

struct TestBroker {
    dispatcher: Dispatcher,
    listener_rx: Receiver<DispatcherToListenerCmd>,

    _listener_tx: Sender<ListenerToDispatcherCmd>,
    _bridge_rx: Receiver<DispatcherToBridgeCmd>,
    _bridge_tx: Sender<BridgeToDispatcherCmd>,
    _metrics_rx: Receiver<DispatcherToMetricsCmd>,
    _metrics_tx: Sender<MetricsToDispatcherCmd>,
    _server_tx: Sender<ServerContextToDispatcherCmd>,
    _done_rx: Receiver<DispatcherToServerContexCmd>,
}

fn broker() -> TestBroker {
    broker_with(General::default(), Storage::default())
}

fn broker_with(general: General, storage: Storage) -> TestBroker {
    let (to_listener_tx, listener_rx) = mpsc::channel(TEST_CHANNEL_CAPACITY);
    let (listener_tx, listener_cmd_rx) = mpsc::channel(TEST_CHANNEL_CAPACITY);
    let (bridge_tx_out, bridge_rx) = mpsc::channel(TEST_CHANNEL_CAPACITY);
    let (bridge_tx, bridge_cmd_rx) = mpsc::channel(TEST_CHANNEL_CAPACITY);
    let (metrics_tx_out, metrics_rx) = mpsc::channel(TEST_CHANNEL_CAPACITY);
    let (metrics_tx, metrics_cmd_rx) = mpsc::channel(TEST_CHANNEL_CAPACITY);
    let (done_tx, done_rx) = mpsc::channel(TEST_CHANNEL_CAPACITY);
    let (server_tx, server_cmd_rx) = mpsc::channel(TEST_CHANNEL_CAPACITY);

    let dispatcher = Dispatcher::new(
        general,
        storage,
        Security::default(),
        Acl::allow_all(),
        vec![(0, to_listener_tx)],
        listener_cmd_rx,
        bridge_tx_out,
        bridge_cmd_rx,
        metrics_tx_out,
        metrics_cmd_rx,
        done_tx,
        server_cmd_rx,
    );

    TestBroker {
        dispatcher,
        listener_rx,
        _listener_tx: listener_tx,
        _bridge_rx: bridge_rx,
        _bridge_tx: bridge_tx,
        _metrics_rx: metrics_rx,
        _metrics_tx: metrics_tx,
        _server_tx: server_tx,
        _done_rx: done_rx,
    }
}

const fn gid(session_id: u64) -> SessionGid {
    SessionGid::new(0, session_id)
}

impl TestBroker {
    fn drain(&mut self) -> Vec<DispatcherToListenerCmd> {
        let mut cmds = Vec::new();
        while let Ok(cmd) = self.listener_rx.try_recv() {
            cmds.push(cmd);
        }
        cmds
    }

    async fn connect(&mut self, session_id: u64, client_id: &str, clean_session: bool) {
        self.dispatcher
            .handle_listener_cmd(ListenerToDispatcherCmd::SessionConnected {
                gid: gid(session_id),
                client_id: client_id.to_string(),
                username: None,
                clean_session,
            })
            .await
            .unwrap();
    }

    async fn subscribe(&mut self, session_id: u64, topic: &str, qos: QoS) {
        let packet = SubscribePacket::new(topic, qos, PacketId::new(1)).unwrap();
        self.dispatcher
            .handle_listener_cmd(ListenerToDispatcherCmd::Subscribe(gid(session_id), packet))
            .await
            .unwrap();
    }

    async fn publish(&mut self, session_id: u64, topic: &str, qos: QoS, payload: &[u8]) {
        let mut packet = PublishPacket::new(topic, qos, payload).unwrap();
        if qos != QoS::AtMostOnce {
            packet.set_packet_id(PacketId::new(11));
        }
        self.dispatcher
            .handle_listener_cmd(ListenerToDispatcherCmd::Publish(gid(session_id), packet))
            .await
            .unwrap();
    }

    async fn disconnect(&mut self, session_id: u64) {
        self.dispatcher
            .handle_listener_cmd(ListenerToDispatcherCmd::SessionDisconnected {
                gid: gid(session_id),
                will: None,
            })
            .await
            .unwrap();
    }

    /// Every live reference contributes exactly one to the refcount of
    /// its store entry.
    fn assert_refcounts(&self) {
        let mut counts: HashMap<StoreId, usize> = HashMap::new();
        for session in self.dispatcher.sessions.values() {
            for msg in session.queue.msgs() {
                *counts.entry(msg.store_id).or_default() += 1;
            }
        }
        for store_id in self.dispatcher.trie.all_retained() {
            *counts.entry(store_id).or_default() += 1;
        }
        for msg in self.dispatcher.store.iter() {
            assert_eq!(
                msg.ref_count(),
                counts.get(&msg.id()).copied().unwrap_or(0),
                "refcount mismatch for store id {}",
                msg.id()
            );
        }
    }
}

fn publishes(cmds: &[DispatcherToListenerCmd]) -> Vec<&PublishPacket> {
    cmds.iter()
        .filter_map(|cmd| match cmd {
            DispatcherToListenerCmd::Publish(_session_id, packet) => Some(packet),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_pub_sub_qos0() {
    let mut broker = broker();
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.subscribe(1, "a/b", QoS::AtMostOnce).await;
    broker.drain();

    broker.publish(2, "a/b", QoS::AtMostOnce, b"x").await;

    let cmds = broker.drain();
    let publishes = publishes(&cmds);
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].topic(), "a/b");
    assert_eq!(publishes[0].message(), b"x");
    assert_eq!(publishes[0].qos(), QoS::AtMostOnce);
    assert!(!publishes[0].retain());
    broker.assert_refcounts();
}

#[tokio::test]
async fn test_single_wildcard_subscription() {
    let mut broker = broker();
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.subscribe(1, "a/+/c", QoS::AtMostOnce).await;
    broker.drain();

    broker.publish(2, "a/b/c", QoS::AtMostOnce, b"hit").await;
    broker.publish(2, "a/b/d", QoS::AtMostOnce, b"miss").await;

    let cmds = broker.drain();
    let publishes = publishes(&cmds);
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].topic(), "a/b/c");
}

#[tokio::test]
async fn test_multi_wildcard_subscription() {
    let mut broker = broker();
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.subscribe(1, "a/#", QoS::AtMostOnce).await;
    broker.drain();

    broker.publish(2, "a", QoS::AtMostOnce, b"1").await;
    broker.publish(2, "a/b", QoS::AtMostOnce, b"2").await;
    broker.publish(2, "a/b/c", QoS::AtMostOnce, b"3").await;

    let cmds = broker.drain();
    assert_eq!(publishes(&cmds).len(), 3);
}

#[tokio::test]
async fn test_retained_message_delivery_and_clear() {
    let mut broker = broker();
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.connect(3, "c3", true).await;

    // Retain "r" on topic t.
    let mut packet = PublishPacket::new("t", QoS::AtMostOnce, b"r").unwrap();
    packet.set_retain(true);
    broker
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::Publish(gid(2), packet))
        .await
        .unwrap();
    broker.drain();
    broker.assert_refcounts();

    // A fresh subscriber receives the retained message immediately.
    broker.subscribe(1, "t", QoS::AtMostOnce).await;
    let cmds = broker.drain();
    let retained = publishes(&cmds);
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].message(), b"r");
    assert!(retained[0].retain());

    // A zero length retained publish clears the slot.
    let mut clear = PublishPacket::new("t", QoS::AtMostOnce, b"").unwrap();
    clear.set_retain(true);
    broker
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::Publish(gid(2), clear))
        .await
        .unwrap();
    broker.drain();

    broker.subscribe(3, "t", QoS::AtMostOnce).await;
    let cmds = broker.drain();
    assert!(publishes(&cmds).is_empty());
    broker.assert_refcounts();
}

#[tokio::test]
async fn test_qos2_exactly_once_flow() {
    let mut broker = broker();
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.subscribe(1, "q", QoS::ExactOnce).await;
    broker.drain();

    // Publisher sends QoS 2 with mid 17.
    let mut packet = PublishPacket::new("q", QoS::ExactOnce, b"once").unwrap();
    packet.set_packet_id(PacketId::new(17));
    broker
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::Publish(gid(2), packet.clone()))
        .await
        .unwrap();

    let cmds = broker.drain();
    assert!(matches!(
        cmds.as_slice(),
        [DispatcherToListenerCmd::PublishReceived(2, mid)] if mid.value() == 17
    ));

    // A duplicate of the same publication only repeats the receipt.
    let mut dup_packet = packet.clone();
    dup_packet.set_dup(true).unwrap();
    broker
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::Publish(gid(2), dup_packet))
        .await
        .unwrap();
    let cmds = broker.drain();
    assert!(matches!(
        cmds.as_slice(),
        [DispatcherToListenerCmd::PublishReceived(2, _)]
    ));

    // The release triggers exactly one fan-out, then the completion.
    broker
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::PublishRelease(
            gid(2),
            PacketId::new(17),
        ))
        .await
        .unwrap();
    let cmds = broker.drain();
    let delivered = publishes(&cmds);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message(), b"once");
    assert_eq!(delivered[0].qos(), QoS::ExactOnce);
    assert!(matches!(
        cmds.last(),
        Some(DispatcherToListenerCmd::PublishComplete(2, mid)) if mid.value() == 17
    ));
    broker.assert_refcounts();
}

#[tokio::test]
async fn test_qos1_ack_completes_delivery() {
    let mut broker = broker();
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.subscribe(1, "s", QoS::AtLeastOnce).await;
    broker.drain();

    broker.publish(2, "s", QoS::AtLeastOnce, b"m").await;
    let cmds = broker.drain();
    let delivered = publishes(&cmds);
    assert_eq!(delivered.len(), 1);
    let mid = delivered[0].packet_id();

    broker
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::PublishAck(gid(1), mid))
        .await
        .unwrap();
    assert!(broker.dispatcher.sessions.get("c1").unwrap().queue.is_empty());

    broker.assert_refcounts();
    // The acknowledged message is unreferenced and removed by the next
    // clean pass.
    assert!(broker.dispatcher.store.clean() >= 1);
}

#[tokio::test]
async fn test_qos1_retry_after_timeout() {
    let general: General = toml::from_str("retry_interval = 0").unwrap();
    let mut broker = broker_with(general, Storage::default());
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.subscribe(1, "s", QoS::AtLeastOnce).await;
    broker.drain();

    broker.publish(2, "s", QoS::AtLeastOnce, b"m").await;
    let first = broker.drain();
    let first_mid = publishes(&first)[0].packet_id();
    assert!(!publishes(&first)[0].dup());

    // No PUBACK arrives; the retry pass re-emits with DUP set.
    broker.dispatcher.handle_retry_timeout().await;
    let second = broker.drain();
    let resent = publishes(&second);
    assert_eq!(resent.len(), 1);
    assert!(resent[0].dup());
    assert_eq!(resent[0].packet_id(), first_mid);
}

#[tokio::test]
async fn test_flow_control_bounds() {
    let general: General =
        toml::from_str("max_inflight_messages = 1\nmax_queued_messages = 1").unwrap();
    let mut broker = broker_with(general, Storage::default());
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.subscribe(1, "s", QoS::AtLeastOnce).await;
    broker.drain();

    broker.publish(2, "s", QoS::AtLeastOnce, b"1").await;
    broker.publish(2, "s", QoS::AtLeastOnce, b"2").await;
    broker.publish(2, "s", QoS::AtLeastOnce, b"3").await;

    let cmds = broker.drain();
    // One in flight, one queued, one dropped.
    let delivered = publishes(&cmds);
    assert_eq!(delivered.len(), 1);
    let session = broker.dispatcher.sessions.get("c1").unwrap();
    assert_eq!(session.queue.inflight_count(), 1);
    assert_eq!(session.queue.queued_count(), 1);

    // The acknowledgement admits the queued message.
    let mid = delivered[0].packet_id();
    broker
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::PublishAck(gid(1), mid))
        .await
        .unwrap();
    let cmds = broker.drain();
    assert_eq!(publishes(&cmds).len(), 1);
    assert_eq!(publishes(&cmds)[0].message(), b"2");
}

#[tokio::test]
async fn test_takeover_disconnects_old_connection() {
    let mut broker = broker();
    broker.connect(1, "dev", true).await;
    broker.drain();

    broker.connect(2, "dev", true).await;
    let cmds = broker.drain();
    assert!(cmds
        .iter()
        .any(|cmd| matches!(cmd, DispatcherToListenerCmd::Disconnect(1))));
    assert!(cmds.iter().any(|cmd| matches!(
        cmd,
        DispatcherToListenerCmd::ConnectAck(2, ConnectReturnCode::Accepted)
    )));
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let mut broker = broker();
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.subscribe(1, "a/b", QoS::AtMostOnce).await;
    broker.drain();

    let packet = UnsubscribePacket::new("a/b", PacketId::new(3)).unwrap();
    broker
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::Unsubscribe(gid(1), packet))
        .await
        .unwrap();

    broker.publish(2, "a/b", QoS::AtMostOnce, b"x").await;
    assert!(publishes(&broker.drain()).is_empty());
}

#[tokio::test]
async fn test_will_published_on_unclean_disconnect() {
    let mut broker = broker();
    broker.connect(1, "c1", true).await;
    broker.connect(2, "c2", true).await;
    broker.subscribe(1, "alarm/lost", QoS::AtMostOnce).await;
    broker.drain();

    broker
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::SessionDisconnected {
            gid: gid(2),
            will: Some(crate::types::LastWill {
                topic: "alarm/lost".to_string(),
                message: b"gone".to_vec(),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
        })
        .await
        .unwrap();

    let cmds = broker.drain();
    let delivered = publishes(&cmds);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message(), b"gone");
}

#[tokio::test]
async fn test_session_survives_restart() {
    let suffix: u32 = rand::thread_rng().gen();
    let db_path = std::env::temp_dir().join(format!("fengbo-dispatch-test-{suffix}.db"));
    let storage_toml = format!(
        "persistence = true\npersistence_file = {:?}",
        db_path.display().to_string()
    );
    let storage: Storage = toml::from_str(&storage_toml).unwrap();

    // First broker lifetime: durable subscriber, then an offline
    // publication, then shutdown.
    {
        let mut broker = broker_with(General::default(), storage.clone());
        broker.connect(1, "persist", false).await;
        broker.subscribe(1, "s", QoS::AtLeastOnce).await;
        broker.disconnect(1).await;
        broker.drain();

        broker.connect(2, "c2", true).await;
        broker.publish(2, "s", QoS::AtLeastOnce, b"m").await;
        broker.drain();
        broker.assert_refcounts();

        broker.dispatcher.backup(true, true).unwrap();
    }

    // Second broker lifetime: restore and reconnect.
    {
        let mut broker = broker_with(General::default(), storage);
        broker.dispatcher.load_persistence().unwrap();
        broker.assert_refcounts();

        broker.connect(1, "persist", false).await;
        let cmds = broker.drain();
        let delivered = publishes(&cmds);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message(), b"m");
        assert_eq!(delivered[0].qos(), QoS::AtLeastOnce);
        // Redelivery after restart carries the original mid and DUP=1.
        assert_eq!(delivered[0].packet_id().value(), 1);
        assert!(delivered[0].dup());
    }

    let _ret = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_clean_session_discards_state() {
    let mut broker = broker();
    broker.connect(1, "c1", false).await;
    broker.subscribe(1, "s", QoS::AtLeastOnce).await;
    broker.disconnect(1).await;
    broker.drain();

    broker.connect(2, "c2", true).await;
    broker.publish(2, "s", QoS::AtLeastOnce, b"m").await;
    broker.drain();
    // The durable session queued the message while offline.
    assert!(!broker.dispatcher.sessions.get("c1").unwrap().queue.is_empty());

    // Reconnecting with clean_session=true wipes it all.
    broker.connect(3, "c1", true).await;
    let cmds = broker.drain();
    assert!(publishes(&cmds).is_empty());
    assert!(broker.dispatcher.sessions.get("c1").unwrap().queue.is_empty());
    broker.assert_refcounts();
}

#[tokio::test]
async fn test_sys_topic_not_matched_by_plain_wildcard() {
    let mut broker = broker();
    broker.connect(1, "c1", true).await;
    broker.subscribe(1, "#", QoS::AtMostOnce).await;
    broker.drain();

    broker
        .dispatcher
        .handle_metrics_cmd(MetricsToDispatcherCmd::Publish({
            let mut packet =
                PublishPacket::new("$SYS/broker/uptime", QoS::ExactOnce, b"1 seconds").unwrap();
            packet.set_retain(true);
            packet.set_packet_id(PacketId::new(1));
            packet.clone()
        }))
        .await
        .unwrap();
    assert!(publishes(&broker.drain()).is_empty());

    // A $SYS subscription does receive it.
    broker.subscribe(1, "$SYS/#", QoS::AtMostOnce).await;
    let cmds = broker.drain();
    let delivered = publishes(&cmds);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].topic(), "$SYS/broker/uptime");
}

#[tokio::test]
async fn test_bridge_loop_prevention() {
    let mut broker = broker();

    // Bridge 0 comes up with an outbound subscription on tele/#.
    broker
        .dispatcher
        .handle_bridge_cmd(BridgeToDispatcherCmd::BridgeUp {
            bridge_id: 0,
            client_id: "host.peer".to_string(),
            clean_session: true,
            subscriptions: vec![("tele/#".to_string(), QoS::AtMostOnce)],
            notifications: false,
        })
        .await
        .unwrap();

    // A publication arriving from that same bridge is not echoed back.
    let packet = PublishPacket::new("tele/temp", QoS::AtMostOnce, b"21").unwrap();
    broker
        .dispatcher
        .handle_bridge_cmd(BridgeToDispatcherCmd::Publish(0, packet))
        .await
        .unwrap();
    assert!(broker._bridge_rx.try_recv().is_err());

    // A local publication does flow out to the bridge.
    broker.connect(1, "c1", true).await;
    broker.publish(1, "tele/temp", QoS::AtMostOnce, b"22").await;
    let cmd = broker._bridge_rx.try_recv().unwrap();
    assert!(matches!(cmd, DispatcherToBridgeCmd::Publish(0, _)));
}
