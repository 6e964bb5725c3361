// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Auth cmd handlers.

use codec::v3::ConnectAckPacket;

use super::Listener;
use crate::commands::{
    AuthResult, AuthToListenerCmd, ListenerToDispatcherCmd, ListenerToSessionCmd,
};
use crate::error::Error;
use crate::types::SessionId;

impl Listener {
    pub(super) async fn handle_auth_cmd(&mut self, cmd: AuthToListenerCmd) -> Result<(), Error> {
        match cmd {
            AuthToListenerCmd::ResponseAuth(session_id, result) => {
                self.on_auth_response(session_id, result).await
            }
        }
    }

    async fn on_auth_response(
        &mut self,
        session_id: SessionId,
        result: AuthResult,
    ) -> Result<(), Error> {
        let Some(pending) = self.pending_connects.remove(&session_id) else {
            return Err(Error::session_error(session_id));
        };

        if result != AuthResult::Accepted {
            // The session sends the refusal code and closes the stream.
            let ack_packet = ConnectAckPacket::new(result.return_code());
            return self
                .send_to_session(session_id, ListenerToSessionCmd::ConnectAck(ack_packet))
                .await;
        }

        // Credentials accepted; the dispatcher takes over duplicate
        // client id handling and session state, then answers with the
        // CONNACK.
        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::SessionConnected {
                gid: self.gid(session_id),
                client_id: pending.client_id,
                username: pending.username,
                clean_session: pending.clean_session,
            })
            .await
            .map_err(Into::into)
    }
}
