// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Initialize Listener.

use std::collections::HashMap;
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::{Listener, CHANNEL_CAPACITY};
use crate::commands::{
    AuthToListenerCmd, DispatcherToListenerCmd, ListenerToAuthCmd, ListenerToDispatcherCmd,
};
use crate::config;
use crate::error::Error;
use crate::session::SessionConfig;
use crate::socket::new_tcp_listener;
use crate::types::ListenerId;

impl Listener {
    /// Bind to the configured socket address.
    ///
    /// # Errors
    ///
    /// Returns error if the address is invalid or already in use.
    pub async fn bind(
        id: ListenerId,
        listener_config: config::Listener,
        general: &config::General,
        // dispatcher module
        dispatcher_sender: Sender<ListenerToDispatcherCmd>,
        dispatcher_receiver: Receiver<DispatcherToListenerCmd>,
        // auth module
        auth_sender: Sender<ListenerToAuthCmd>,
        auth_receiver: Receiver<AuthToListenerCmd>,
    ) -> Result<Self, Error> {
        let address = listener_config.address();
        log::info!("bind mqtt://{address}");
        let socket = new_tcp_listener(&address).await?;

        let mut session_config = SessionConfig::new();
        session_config
            .set_connect_timeout(general.connect_timeout())
            .set_allow_empty_client_id(general.allow_empty_client_id())
            .set_clientid_prefixes(general.clientid_prefixes().map(ToString::to_string));

        let (session_sender, session_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Self {
            id,
            config: listener_config,
            socket,
            session_config,
            current_session_id: 0,

            session_senders: HashMap::new(),
            pending_connects: HashMap::new(),

            session_sender,
            session_receiver: Some(session_receiver),

            dispatcher_sender,
            dispatcher_receiver: Some(dispatcher_receiver),

            auth_sender,
            auth_receiver: Some(auth_receiver),
        })
    }
}
