// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Username/password authentication service.

use std::collections::HashMap;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::commands::{
    AuthResult, AuthToListenerCmd, ListenerToAuthCmd, ServerContextToAuthCmd,
};
use crate::config::Security;
use crate::error::Error;
use crate::types::{ListenerId, SessionGid};

mod acl;
mod passwd;

pub use acl::{Acl, AclAccess};
pub use passwd::Passwd;

/// Checks CONNECT credentials for all listeners.
#[derive(Debug)]
pub struct AuthApp {
    security: Security,
    passwd: Option<Passwd>,

    listener_senders: HashMap<ListenerId, Sender<AuthToListenerCmd>>,
    listener_receiver: Receiver<ListenerToAuthCmd>,

    server_ctx_receiver: Receiver<ServerContextToAuthCmd>,
}

impl AuthApp {
    /// Create a new auth app, loading the configured password file.
    ///
    /// # Errors
    ///
    /// Returns error if the password file cannot be read.
    pub fn new(
        security: Security,
        // listeners module
        listener_senders: Vec<(ListenerId, Sender<AuthToListenerCmd>)>,
        listener_receiver: Receiver<ListenerToAuthCmd>,
        // server ctx module
        server_ctx_receiver: Receiver<ServerContextToAuthCmd>,
    ) -> Result<Self, Error> {
        let passwd = match security.password_file() {
            Some(path) => Some(Passwd::load(path)?),
            None => None,
        };
        Ok(Self {
            security,
            passwd,
            listener_senders: listener_senders.into_iter().collect(),
            listener_receiver,
            server_ctx_receiver,
        })
    }

    pub async fn run_loop(&mut self) {
        loop {
            tokio::select! {
                Some(cmd) = self.listener_receiver.recv() => {
                    if let Err(err) = self.handle_listener_cmd(cmd).await {
                        log::error!("auth: Failed to handle listener cmd: {err:?}");
                    }
                }
                Some(cmd) = self.server_ctx_receiver.recv() => {
                    self.handle_server_ctx_cmd(cmd);
                }
                else => break,
            }
        }
    }

    fn check(&self, username: Option<&str>, password: &[u8]) -> AuthResult {
        match username {
            None => {
                if self.security.allow_anonymous() {
                    AuthResult::Accepted
                } else {
                    AuthResult::NotAuthorized
                }
            }
            Some(username) => match &self.passwd {
                Some(passwd) => {
                    if passwd.check(username, password) {
                        AuthResult::Accepted
                    } else {
                        AuthResult::BadUserNameOrPassword
                    }
                }
                // Without a password file any credentials are accepted.
                None => AuthResult::Accepted,
            },
        }
    }

    async fn handle_listener_cmd(&mut self, cmd: ListenerToAuthCmd) -> Result<(), Error> {
        match cmd {
            ListenerToAuthCmd::RequestAuth(gid, username, password) => {
                self.on_listener_request_auth(gid, username, password).await
            }
        }
    }

    async fn on_listener_request_auth(
        &mut self,
        gid: SessionGid,
        username: Option<String>,
        password: Vec<u8>,
    ) -> Result<(), Error> {
        let result = self.check(username.as_deref(), &password);
        if result != AuthResult::Accepted {
            log::warn!(
                "auth: rejected connect of session {} (user {:?}): {:?}",
                gid.session_id(),
                username,
                result
            );
        }

        let Some(sender) = self.listener_senders.get(&gid.listener_id()) else {
            return Err(Error::session_error(gid.session_id()));
        };
        sender
            .send(AuthToListenerCmd::ResponseAuth(gid.session_id(), result))
            .await
            .map_err(Into::into)
    }

    fn handle_server_ctx_cmd(&mut self, cmd: ServerContextToAuthCmd) {
        match cmd {
            ServerContextToAuthCmd::Reload => {
                if let Some(path) = self.security.password_file() {
                    match Passwd::load(path) {
                        Ok(passwd) => {
                            log::info!("auth: reloaded password file {path:?}");
                            self.passwd = Some(passwd);
                        }
                        Err(err) => {
                            log::error!("auth: failed to reload password file: {err:?}");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn auth_app(security: Security) -> AuthApp {
        let (_listener_sender, listener_receiver) = mpsc::channel(4);
        let (_server_sender, server_ctx_receiver) = mpsc::channel(4);
        AuthApp::new(security, Vec::new(), listener_receiver, server_ctx_receiver).unwrap()
    }

    #[test]
    fn test_anonymous_policy() {
        let app = auth_app(Security::default());
        assert_eq!(app.check(None, b""), AuthResult::Accepted);

        let content = "allow_anonymous = false";
        let strict: Security = toml::from_str(content).unwrap();
        let app = auth_app(strict);
        assert_eq!(app.check(None, b""), AuthResult::NotAuthorized);
        // Named users still pass without a password file.
        assert_eq!(app.check(Some("roger"), b"pw"), AuthResult::Accepted);
    }
}
