// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::commands::{
    AuthToListenerCmd, DispatcherToListenerCmd, ListenerToAuthCmd, ListenerToDispatcherCmd,
    ListenerToSessionCmd, SessionToListenerCmd,
};
use crate::config;
use crate::session::SessionConfig;
use crate::types::{ListenerId, SessionId};

mod auth;
mod dispatcher;
mod init;
mod run;
mod session;

pub(crate) const CHANNEL_CAPACITY: usize = 16;

/// CONNECT data held between the auth round-trip and the dispatcher
/// registration.
#[derive(Debug, Clone)]
struct PendingConnect {
    client_id: String,
    username: Option<String>,
    clean_session: bool,
}

/// Accept loop plus bookkeeping for the sessions of one configured
/// endpoint.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    config: config::Listener,
    socket: TcpListener,
    session_config: SessionConfig,
    current_session_id: SessionId,

    session_senders: HashMap<SessionId, Sender<ListenerToSessionCmd>>,
    pending_connects: HashMap<SessionId, PendingConnect>,

    session_sender: Sender<SessionToListenerCmd>,
    session_receiver: Option<Receiver<SessionToListenerCmd>>,

    dispatcher_sender: Sender<ListenerToDispatcherCmd>,
    dispatcher_receiver: Option<Receiver<DispatcherToListenerCmd>>,

    auth_sender: Sender<ListenerToAuthCmd>,
    auth_receiver: Option<Receiver<AuthToListenerCmd>>,
}

impl Listener {
    /// Prefix an inbound topic with this listener's mount point.
    fn mount_topic(&self, topic: &str) -> String {
        match self.config.mount_point() {
            Some(prefix) => format!("{prefix}{topic}"),
            None => topic.to_string(),
        }
    }

    /// Strip the mount point from an outbound topic.
    fn unmount_topic<'a>(&self, topic: &'a str) -> &'a str {
        match self.config.mount_point() {
            Some(prefix) => topic.strip_prefix(prefix).unwrap_or(topic),
            None => topic,
        }
    }
}
