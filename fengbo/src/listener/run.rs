// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Handles commands and new connections.

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{Listener, CHANNEL_CAPACITY};
use crate::session::Session;
use crate::stream::Stream;

impl Listener {
    /// # Panics
    ///
    /// Raises panic if channel receivers were taken before.
    pub async fn run_loop(&mut self) {
        // Take ownership of mpsc receivers or else tokio select will raise
        // borrow errors.
        let mut session_receiver = self
            .session_receiver
            .take()
            .expect("Invalid session receiver");
        let mut dispatcher_receiver = self
            .dispatcher_receiver
            .take()
            .expect("Invalid dispatcher receiver");
        let mut auth_receiver = self.auth_receiver.take().expect("Invalid auth receiver");

        loop {
            tokio::select! {
                Ok((tcp_stream, address)) = self.socket.accept() => {
                    log::info!("listener {}: new connection from {address}", self.id);
                    self.new_connection(tcp_stream);
                },

                Some(cmd) = session_receiver.recv() => {
                    if let Err(err) = self.handle_session_cmd(cmd).await {
                        log::error!("listener: handle session cmd failed: {err:?}");
                    }
                },

                Some(cmd) = dispatcher_receiver.recv() => {
                    if let Err(err) = self.handle_dispatcher_cmd(cmd).await {
                        log::error!("listener: handle dispatcher cmd failed: {err:?}");
                    }
                }

                Some(cmd) = auth_receiver.recv() => {
                    if let Err(err) = self.handle_auth_cmd(cmd).await {
                        log::error!("listener: handle auth cmd failed: {err:?}");
                    }
                }
            }
        }
    }

    fn new_connection(&mut self, tcp_stream: TcpStream) {
        // Per-listener connection limit; excess connections are dropped
        // before the MQTT handshake.
        let max_connections = self.config.max_connections();
        if max_connections > 0 && self.session_senders.len() >= max_connections {
            log::warn!(
                "listener {}: max_connections ({max_connections}) reached, dropping connection",
                self.id
            );
            drop(tcp_stream);
            return;
        }

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let session_id = self.next_session_id();
        self.session_senders.insert(session_id, sender);
        let session = Session::new(
            session_id,
            self.session_config.clone(),
            Stream::new(tcp_stream),
            self.session_sender.clone(),
            receiver,
        );
        tokio::spawn(session.run_loop());
    }
}
