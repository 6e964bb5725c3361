// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Init server context internal modules.

use tokio::sync::mpsc;

use super::{ServerContext, CHANNEL_CAPACITY};
use crate::auth::{Acl, AuthApp};
use crate::bridge::BridgeApp;
use crate::commands::DispatcherToMetricsCmd;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::listener::Listener;
use crate::metrics::Metrics;

impl ServerContext {
    pub(crate) async fn init_modules(&mut self) -> Result<(), Error> {
        log::info!("ServerContext::init_modules()");

        let (listeners_to_dispatcher_sender, listeners_to_dispatcher_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let mut dispatcher_to_listener_senders = Vec::new();
        let (listeners_to_auth_sender, listeners_to_auth_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let mut auth_to_listener_senders = Vec::new();

        let mut listeners_info = Vec::new();

        // Listeners module.
        let mut listener_objs = Vec::new();
        for (listener_id, listener_config) in (0_u32..).zip(self.config.listeners().iter()) {
            listeners_info.push((listener_id, listener_config.address()));
            let (dispatcher_to_listener_sender, dispatcher_to_listener_receiver) =
                mpsc::channel(CHANNEL_CAPACITY);
            dispatcher_to_listener_senders.push((listener_id, dispatcher_to_listener_sender));

            let (auth_to_listener_sender, auth_to_listener_receiver) =
                mpsc::channel(CHANNEL_CAPACITY);
            auth_to_listener_senders.push((listener_id, auth_to_listener_sender));

            let listener = Listener::bind(
                listener_id,
                listener_config.clone(),
                self.config.general(),
                // dispatcher module
                listeners_to_dispatcher_sender.clone(),
                dispatcher_to_listener_receiver,
                // auth module
                listeners_to_auth_sender.clone(),
                auth_to_listener_receiver,
            )
            .await?;
            listener_objs.push(listener);
        }

        // Privileged ports are bound; the rest of the setup runs without
        // root.
        self.set_uid()?;

        for mut listener in listener_objs {
            tokio::spawn(async move {
                listener.run_loop().await;
            });
        }

        // Auth module.
        let mut auth_app = AuthApp::new(
            self.config.security().clone(),
            // listeners
            auth_to_listener_senders,
            listeners_to_auth_receiver,
            // server ctx
            self.auth_receiver.take().expect("auth receiver taken"),
        )?;
        tokio::spawn(async move {
            auth_app.run_loop().await;
        });

        // Metrics module.
        let (metrics_to_dispatcher_sender, metrics_to_dispatcher_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let (dispatcher_to_metrics_sender, dispatcher_to_metrics_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let mut metrics = Metrics::new(
            self.config.general().sys_interval(),
            self.config.general().sys_interval_enabled(),
            metrics_to_dispatcher_sender,
            dispatcher_to_metrics_receiver,
        );
        tokio::spawn(async move {
            metrics.run_loop().await;
        });

        for (listener_id, address) in &listeners_info {
            if let Err(err) = dispatcher_to_metrics_sender
                .send(DispatcherToMetricsCmd::ListenerAdded(
                    *listener_id,
                    address.clone(),
                ))
                .await
            {
                log::error!("Failed to send listener {address} to metrics, err: {err:?}");
            }
        }

        // Bridge module.
        let (bridge_to_dispatcher_sender, bridge_to_dispatcher_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let (dispatcher_to_bridge_sender, dispatcher_to_bridge_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let mut bridge_app = BridgeApp::new(
            self.config.bridges().to_vec(),
            bridge_to_dispatcher_sender,
            dispatcher_to_bridge_receiver,
        );
        tokio::spawn(async move {
            bridge_app.run_loop().await;
        });

        // Dispatcher module. The access control list is loaded up front;
        // a broken acl file is a startup failure.
        let acl = match self.config.security().acl_file() {
            Some(path) => Acl::load(path)?,
            None => Acl::allow_all(),
        };
        let mut dispatcher = Dispatcher::new(
            self.config.general().clone(),
            self.config.storage().clone(),
            self.config.security().clone(),
            acl,
            // listeners module
            dispatcher_to_listener_senders,
            listeners_to_dispatcher_receiver,
            // bridge module
            dispatcher_to_bridge_sender,
            bridge_to_dispatcher_receiver,
            // metrics module
            dispatcher_to_metrics_sender,
            metrics_to_dispatcher_receiver,
            // server ctx
            self.dispatcher_done_sender
                .take()
                .expect("dispatcher done sender taken"),
            self.dispatcher_receiver
                .take()
                .expect("dispatcher receiver taken"),
        );

        // Durable state is restored before any client can connect; an
        // unusable snapshot refuses startup.
        dispatcher.load_persistence()?;

        tokio::spawn(async move {
            dispatcher.run_loop().await;
        });

        Ok(())
    }
}
