// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Command enums passed between module tasks over mpsc channels.

use codec::v3::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, PublishPacket, SubscribeAckPacket,
    SubscribePacket, UnsubscribePacket,
};
use codec::{PacketId, QoS};

use crate::types::{BridgeId, LastWill, ListenerId, SessionGid, SessionId};

/// Result of a username/password check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Accepted,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl AuthResult {
    #[must_use]
    pub const fn return_code(self) -> ConnectReturnCode {
        match self {
            Self::Accepted => ConnectReturnCode::Accepted,
            Self::BadUserNameOrPassword => ConnectReturnCode::BadUserNameOrPassword,
            Self::NotAuthorized => ConnectReturnCode::NotAuthorized,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ListenerToAuthCmd {
    /// Session gid, username (None for anonymous), password.
    RequestAuth(SessionGid, Option<String>, Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum AuthToListenerCmd {
    ResponseAuth(SessionId, AuthResult),
}

#[derive(Debug, Clone)]
pub enum SessionToListenerCmd {
    Connect(SessionId, ConnectPacket),
    Publish(SessionId, PublishPacket),
    PublishAck(SessionId, PacketId),
    PublishReceived(SessionId, PacketId),
    PublishRelease(SessionId, PacketId),
    PublishComplete(SessionId, PacketId),
    Subscribe(SessionId, SubscribePacket),
    Unsubscribe(SessionId, UnsubscribePacket),
    /// Will message is present when the session ended without a clean
    /// DISCONNECT packet.
    Disconnect(SessionId, Option<LastWill>),
}

#[derive(Debug, Clone)]
pub enum ListenerToSessionCmd {
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PacketId),
    PublishReceived(PacketId),
    /// Packet id plus DUP flag of the release packet.
    PublishRelease(PacketId, bool),
    PublishComplete(PacketId),
    SubscribeAck(SubscribeAckPacket),
    Disconnect,
}

#[derive(Debug, Clone)]
pub enum ListenerToDispatcherCmd {
    SessionConnected {
        gid: SessionGid,
        client_id: String,
        username: Option<String>,
        clean_session: bool,
    },
    Publish(SessionGid, PublishPacket),
    PublishAck(SessionGid, PacketId),
    PublishReceived(SessionGid, PacketId),
    PublishRelease(SessionGid, PacketId),
    PublishComplete(SessionGid, PacketId),
    Subscribe(SessionGid, SubscribePacket),
    Unsubscribe(SessionGid, UnsubscribePacket),
    SessionDisconnected {
        gid: SessionGid,
        will: Option<LastWill>,
    },
}

#[derive(Debug, Clone)]
pub enum DispatcherToListenerCmd {
    ConnectAck(SessionId, ConnectReturnCode),
    Publish(SessionId, PublishPacket),
    PublishAck(SessionId, PacketId),
    PublishReceived(SessionId, PacketId),
    PublishRelease(SessionId, PacketId, bool),
    PublishComplete(SessionId, PacketId),
    SubscribeAck(SessionId, SubscribeAckPacket),
    Disconnect(SessionId),
}

#[derive(Debug, Clone)]
pub enum BridgeToDispatcherCmd {
    /// Bridge connection established: register the bridge session and its
    /// local subscriptions for outbound topic patterns.
    BridgeUp {
        bridge_id: BridgeId,
        client_id: String,
        clean_session: bool,
        subscriptions: Vec<(String, QoS)>,
        notifications: bool,
    },
    BridgeDown(BridgeId),
    Publish(BridgeId, PublishPacket),
    PublishAck(BridgeId, PacketId),
    PublishReceived(BridgeId, PacketId),
    PublishRelease(BridgeId, PacketId),
    PublishComplete(BridgeId, PacketId),
}

#[derive(Debug, Clone)]
pub enum DispatcherToBridgeCmd {
    Publish(BridgeId, PublishPacket),
    PublishAck(BridgeId, PacketId),
    PublishReceived(BridgeId, PacketId),
    PublishRelease(BridgeId, PacketId, bool),
    PublishComplete(BridgeId, PacketId),
}

#[derive(Debug, Clone)]
pub enum DispatcherToMetricsCmd {
    ListenerAdded(ListenerId, String),
    SessionAdded,
    SessionRemoved,
    SubscriptionsAdded(usize),
    SubscriptionsRemoved(usize),
    RetainedAdded,
    RetainedRemoved,
    /// Encoded byte length of one control packet received from a peer.
    PacketReceived(usize),
    /// Encoded byte length of one control packet sent to a peer.
    PacketSent(usize),
    /// Current number of entries in the message store.
    MessagesStored(usize),
}

#[derive(Debug, Clone)]
pub enum MetricsToDispatcherCmd {
    Publish(PublishPacket),
}

#[derive(Debug, Clone)]
pub enum ServerContextToDispatcherCmd {
    /// Write a persistence snapshot now.
    Backup,
    /// Log the subscription tree for debugging.
    DumpSubscriptions,
    /// Reload access control files.
    Reload,
    /// Final snapshot and store clean before process exit.
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum DispatcherToServerContexCmd {
    ShutdownComplete,
}

#[derive(Debug, Clone)]
pub enum ServerContextToAuthCmd {
    /// Reload the password file.
    Reload,
}
