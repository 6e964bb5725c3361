// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;
use std::time::Duration;
use tokio::time::sleep;

mod common;
use common::{start_broker, TestClient};

#[tokio::test]
async fn test_retained_delivery_on_subscribe() {
    let broker = start_broker().await;

    let mut publisher = TestClient::connect(&broker.address, "pub-r").await;
    publisher.publish_qos0("t", b"r", true).await;
    // Give the broker a moment to store the retained message.
    sleep(Duration::from_millis(100)).await;

    let mut subscriber = TestClient::connect(&broker.address, "sub-r").await;
    subscriber.subscribe("t", QoS::AtMostOnce, 1).await;

    let publish = subscriber.recv_publish().await;
    assert_eq!(publish.topic(), "t");
    assert_eq!(publish.message(), b"r");
    assert!(publish.retain());
}
