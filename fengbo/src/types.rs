// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;

pub type ListenerId = u32;
pub type SessionId = u64;
pub type BridgeId = u32;
pub type Uptime = u64;

/// Listener id assigned to bridge connections. Bridges have no accept
/// socket, so this value never collides with a configured listener.
pub const BRIDGE_LISTENER_ID: ListenerId = u32::MAX;

/// Global session id.
///
/// Basically it is a (`listener_id`, `session_id`) pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionGid {
    listener_id: ListenerId,
    session_id: SessionId,
}

impl SessionGid {
    #[must_use]
    pub const fn new(listener_id: ListenerId, session_id: SessionId) -> Self {
        Self {
            listener_id,
            session_id,
        }
    }

    /// Session gid of a bridge connection.
    #[must_use]
    pub const fn bridge(bridge_id: BridgeId) -> Self {
        Self {
            listener_id: BRIDGE_LISTENER_ID,
            session_id: bridge_id as SessionId,
        }
    }

    #[must_use]
    pub const fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub const fn is_bridge(&self) -> bool {
        self.listener_id == BRIDGE_LISTENER_ID
    }
}

/// Message the broker publishes on behalf of a client which disconnects
/// without sending a DISCONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}
