// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Broker statistics and the `$SYS` tree publisher.
//!
//! The dispatcher reports counter events over a command channel; on a
//! timer the current values are published as retained messages under
//! `$SYS/broker/`. A value is only re-published when it changed since
//! the last tick, except uptime which is published every time.

use codec::v3::PublishPacket;
use codec::QoS;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::interval;

use crate::commands::{DispatcherToMetricsCmd, MetricsToDispatcherCmd};
use crate::error::Error;
use crate::types::Uptime;

pub const SYS_UPTIME: &str = "$SYS/broker/uptime";
pub const SYS_MESSAGES_STORED: &str = "$SYS/broker/messages/stored";
pub const SYS_CLIENTS_TOTAL: &str = "$SYS/broker/clients/total";
pub const SYS_MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
pub const SYS_MESSAGES_SENT: &str = "$SYS/broker/messages/sent";
pub const SYS_BYTES_RECEIVED: &str = "$SYS/broker/bytes/received";
pub const SYS_BYTES_SENT: &str = "$SYS/broker/bytes/sent";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SystemMetrics {
    listener_count: usize,
    sessions: u64,
    subscriptions: u64,

    retained_messages: u64,
    messages_stored: u64,

    messages_sent: u64,
    messages_received: u64,

    bytes_sent: u64,
    bytes_received: u64,
}

/// Counter store plus `$SYS` publisher.
#[derive(Debug)]
pub struct Metrics {
    sys_interval: Duration,
    sys_enabled: bool,
    startup: Instant,
    uptime: Uptime,

    system: SystemMetrics,
    published: SystemMetrics,
    first_tick: bool,

    dispatcher_sender: Sender<MetricsToDispatcherCmd>,
    dispatcher_receiver: Receiver<DispatcherToMetricsCmd>,
}

impl Metrics {
    #[must_use]
    pub fn new(
        sys_interval: Duration,
        sys_enabled: bool,
        // dispatcher module
        dispatcher_sender: Sender<MetricsToDispatcherCmd>,
        dispatcher_receiver: Receiver<DispatcherToMetricsCmd>,
    ) -> Self {
        Self {
            sys_interval,
            sys_enabled,
            startup: Instant::now(),
            uptime: 0,
            system: SystemMetrics::default(),
            published: SystemMetrics::default(),
            first_tick: true,
            dispatcher_sender,
            dispatcher_receiver,
        }
    }

    pub async fn run_loop(&mut self) {
        let tick = if self.sys_enabled {
            self.sys_interval
        } else {
            // Timer still fires to keep uptime fresh, nothing is published.
            Duration::from_secs(60)
        };
        let mut sys_timer = interval(tick);

        loop {
            tokio::select! {
                Some(cmd) = self.dispatcher_receiver.recv() => {
                    self.handle_dispatcher_cmd(cmd);
                }
                _ = sys_timer.tick() => {
                    self.uptime = self.startup.elapsed().as_secs();
                    if self.sys_enabled {
                        if let Err(err) = self.publish_sys_tree().await {
                            log::error!("metrics: failed to publish $SYS tree: {err:?}");
                        }
                    }
                }
            }
        }
    }

    fn handle_dispatcher_cmd(&mut self, cmd: DispatcherToMetricsCmd) {
        match cmd {
            DispatcherToMetricsCmd::ListenerAdded(listener_id, address) => {
                log::info!("metrics: listener {listener_id} at {address}");
                self.system.listener_count += 1;
            }
            DispatcherToMetricsCmd::SessionAdded => {
                self.system.sessions += 1;
            }
            DispatcherToMetricsCmd::SessionRemoved => {
                self.system.sessions = self.system.sessions.saturating_sub(1);
            }
            DispatcherToMetricsCmd::SubscriptionsAdded(count) => {
                self.system.subscriptions += count as u64;
            }
            DispatcherToMetricsCmd::SubscriptionsRemoved(count) => {
                self.system.subscriptions = self.system.subscriptions.saturating_sub(count as u64);
            }
            DispatcherToMetricsCmd::RetainedAdded => {
                self.system.retained_messages += 1;
            }
            DispatcherToMetricsCmd::RetainedRemoved => {
                self.system.retained_messages = self.system.retained_messages.saturating_sub(1);
            }
            DispatcherToMetricsCmd::PacketReceived(bytes) => {
                self.system.messages_received += 1;
                self.system.bytes_received += bytes as u64;
            }
            DispatcherToMetricsCmd::PacketSent(bytes) => {
                self.system.messages_sent += 1;
                self.system.bytes_sent += bytes as u64;
            }
            DispatcherToMetricsCmd::MessagesStored(count) => {
                self.system.messages_stored = count as u64;
            }
        }
    }

    async fn publish_sys_value(&mut self, topic: &str, value: String) -> Result<(), Error> {
        let mut packet = PublishPacket::new(topic, QoS::ExactOnce, value.as_bytes())?;
        packet.set_retain(true);
        self.dispatcher_sender
            .send(MetricsToDispatcherCmd::Publish(packet))
            .await
            .map_err(Into::into)
    }

    async fn publish_sys_tree(&mut self) -> Result<(), Error> {
        let force = self.first_tick;
        self.first_tick = false;
        let current = self.system;
        let previous = self.published;

        self.publish_sys_value(SYS_UPTIME, format!("{} seconds", self.uptime))
            .await?;

        if force || current.messages_stored != previous.messages_stored {
            self.publish_sys_value(SYS_MESSAGES_STORED, current.messages_stored.to_string())
                .await?;
        }
        if force || current.sessions != previous.sessions {
            self.publish_sys_value(SYS_CLIENTS_TOTAL, current.sessions.to_string())
                .await?;
        }
        if force || current.messages_received != previous.messages_received {
            self.publish_sys_value(SYS_MESSAGES_RECEIVED, current.messages_received.to_string())
                .await?;
        }
        if force || current.messages_sent != previous.messages_sent {
            self.publish_sys_value(SYS_MESSAGES_SENT, current.messages_sent.to_string())
                .await?;
        }
        if force || current.bytes_received != previous.bytes_received {
            self.publish_sys_value(SYS_BYTES_RECEIVED, current.bytes_received.to_string())
                .await?;
        }
        if force || current.bytes_sent != previous.bytes_sent {
            self.publish_sys_value(SYS_BYTES_SENT, current.bytes_sent.to_string())
                .await?;
        }

        self.published = current;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn metrics() -> (Metrics, Receiver<MetricsToDispatcherCmd>) {
        let (sender, receiver) = mpsc::channel(64);
        let (_cmd_sender, cmd_receiver) = mpsc::channel(4);
        let metrics = Metrics::new(Duration::from_secs(10), true, sender, cmd_receiver);
        (metrics, receiver)
    }

    #[tokio::test]
    async fn test_unchanged_values_suppressed() {
        let (mut metrics, mut receiver) = metrics();

        metrics.publish_sys_tree().await.unwrap();
        let mut first = Vec::new();
        while let Ok(cmd) = receiver.try_recv() {
            first.push(cmd);
        }
        // First tick publishes every value.
        assert_eq!(first.len(), 7);

        metrics.publish_sys_tree().await.unwrap();
        let mut second = Vec::new();
        while let Ok(cmd) = receiver.try_recv() {
            second.push(cmd);
        }
        // Nothing changed: only uptime goes out.
        assert_eq!(second.len(), 1);
        let MetricsToDispatcherCmd::Publish(packet) = &second[0];
        assert_eq!(packet.topic(), SYS_UPTIME);
        assert_eq!(packet.qos(), QoS::ExactOnce);
        assert!(packet.retain());
    }

    #[tokio::test]
    async fn test_packet_counters() {
        let (mut metrics, mut receiver) = metrics();
        metrics.handle_dispatcher_cmd(DispatcherToMetricsCmd::PacketReceived(10));
        metrics.handle_dispatcher_cmd(DispatcherToMetricsCmd::PacketReceived(5));
        metrics.handle_dispatcher_cmd(DispatcherToMetricsCmd::PacketSent(7));
        assert_eq!(metrics.system.messages_received, 2);
        assert_eq!(metrics.system.bytes_received, 15);
        assert_eq!(metrics.system.messages_sent, 1);
        assert_eq!(metrics.system.bytes_sent, 7);

        metrics.publish_sys_tree().await.unwrap();
        let mut cmds = Vec::new();
        while let Ok(cmd) = receiver.try_recv() {
            cmds.push(cmd);
        }
        let topics: Vec<String> = cmds
            .iter()
            .map(|MetricsToDispatcherCmd::Publish(packet)| packet.topic().to_string())
            .collect();
        assert!(topics.contains(&SYS_BYTES_RECEIVED.to_string()));
        assert!(topics.contains(&SYS_MESSAGES_SENT.to_string()));
    }
}
