// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;

mod common;
use common::{start_broker, TestClient};

#[tokio::test]
async fn test_pub_sub_qos0() {
    let broker = start_broker().await;

    let mut subscriber = TestClient::connect(&broker.address, "sub-1").await;
    let suback = subscriber.subscribe("a/b", QoS::AtMostOnce, 1).await;
    assert_eq!(suback.acks().len(), 1);

    let mut publisher = TestClient::connect(&broker.address, "pub-1").await;
    publisher.publish_qos0("a/b", b"x", false).await;

    let publish = subscriber.recv_publish().await;
    assert_eq!(publish.topic(), "a/b");
    assert_eq!(publish.message(), b"x");
    assert_eq!(publish.qos(), QoS::AtMostOnce);
    assert!(!publish.retain());
}

#[tokio::test]
async fn test_wildcard_subscription() {
    let broker = start_broker().await;

    let mut subscriber = TestClient::connect(&broker.address, "sub-2").await;
    subscriber.subscribe("a/+/c", QoS::AtMostOnce, 1).await;

    let mut publisher = TestClient::connect(&broker.address, "pub-2").await;
    publisher.publish_qos0("a/b/d", b"miss", false).await;
    publisher.publish_qos0("a/b/c", b"hit", false).await;

    // Only the matching topic arrives.
    let publish = subscriber.recv_publish().await;
    assert_eq!(publish.topic(), "a/b/c");
    assert_eq!(publish.message(), b"hit");
}
