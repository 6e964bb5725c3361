// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Persistence snapshots of the dispatcher state.

use bytes::Bytes;
use std::collections::HashSet;
use std::time::Instant;

use super::{ClientSession, Dispatcher};
use crate::error::{Error, ErrorKind};
use crate::inflight::ClientMsg;
use crate::persist::{
    read_snapshot, write_snapshot, ClientMsgRecord, Snapshot, StoredMessageRecord, SubRecord,
};

impl Dispatcher {
    /// Write a persistence snapshot.
    ///
    /// With `cleanup` set, unreferenced store entries are removed first.
    /// `shutdown` is recorded in the CFG chunk.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot file cannot be written; the previous
    /// snapshot stays intact then.
    pub fn backup(&mut self, cleanup: bool, shutdown: bool) -> Result<(), Error> {
        if cleanup {
            self.store.clean();
        }

        let path = self.storage.db_path();
        log::info!("dispatcher: saving persistence snapshot to {path:?}");

        let durable_clients: HashSet<&str> = self
            .sessions
            .iter()
            .filter(|(_id, session)| !session.clean_session)
            .map(|(id, _session)| id.as_str())
            .collect();

        let mut snapshot = Snapshot {
            shutdown,
            last_db_id: self.store.last_db_id(),
            ..Snapshot::default()
        };

        for msg in self.store.iter() {
            snapshot.messages.push(StoredMessageRecord {
                id: msg.id(),
                source_id: msg.source_id().to_string(),
                source_mid: msg.source_mid(),
                topic: msg.topic().to_string(),
                qos: msg.qos(),
                retain: msg.retain(),
                payload: Bytes::copy_from_slice(msg.payload()),
            });
        }

        for (client_id, session) in &self.sessions {
            if session.clean_session {
                continue;
            }
            for msg in session.queue.msgs() {
                snapshot.client_msgs.push(ClientMsgRecord {
                    client_id: client_id.clone(),
                    store_id: msg.store_id,
                    mid: msg.mid,
                    qos: msg.qos,
                    retain: msg.retain,
                    direction: msg.direction,
                    state: msg.state,
                    dup: msg.dup,
                });
            }
        }

        for (client_id, filter, qos) in self.trie.all_subscriptions() {
            if !durable_clients.contains(client_id.as_str()) {
                continue;
            }
            snapshot.subs.push(SubRecord {
                client_id,
                topic: filter,
                qos,
            });
        }

        snapshot.retained = self.trie.all_retained();

        write_snapshot(&path, &snapshot)
    }

    /// Restore durable state from the persistence snapshot, before any
    /// listener accepts connections.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot is unusable: wrong magic, newer
    /// version, or dangling store references.
    pub fn load_persistence(&mut self) -> Result<(), Error> {
        if !self.storage.persistence() {
            return Ok(());
        }
        let path = self.storage.db_path();
        let Some(snapshot) = read_snapshot(&path)? else {
            log::info!("dispatcher: no persistence snapshot at {path:?}, starting empty");
            return Ok(());
        };
        log::info!(
            "dispatcher: restoring {} messages, {} subscriptions from {path:?}",
            snapshot.messages.len(),
            snapshot.subs.len()
        );

        for record in snapshot.messages {
            self.store.insert_with_id(
                record.id,
                record.source_id,
                record.source_mid,
                record.topic,
                record.qos,
                record.retain,
                record.payload,
            );
        }
        self.store.set_last_db_id(snapshot.last_db_id);

        for store_id in snapshot.retained {
            let Some(topic) = self.store.get(store_id).map(|msg| msg.topic().to_string())
            else {
                return Err(Error::from_string(
                    ErrorKind::StorageError,
                    format!("persist: retained chunk references unknown store id {store_id}"),
                ));
            };
            let old = self.trie.set_retained(&topic, Some(store_id));
            if let Some(old) = old {
                self.store.ref_dec(old);
            }
            self.store.ref_inc(store_id);
        }

        for sub in snapshot.subs {
            self.ensure_durable_session(&sub.client_id);
            self.trie.subscribe(&sub.client_id, &sub.topic, sub.qos);
        }

        for record in snapshot.client_msgs {
            if self.store.get(record.store_id).is_none() {
                return Err(Error::from_string(
                    ErrorKind::StorageError,
                    format!(
                        "persist: client msg chunk references unknown store id {}",
                        record.store_id
                    ),
                ));
            }
            self.ensure_durable_session(&record.client_id);
            self.store.ref_inc(record.store_id);
            if let Some(session) = self.sessions.get_mut(&record.client_id) {
                session.queue.push_restored(ClientMsg {
                    store_id: record.store_id,
                    mid: record.mid,
                    qos: record.qos,
                    retain: record.retain,
                    direction: record.direction,
                    state: record.state,
                    dup: record.dup,
                    timestamp: Instant::now(),
                });
            }
        }

        Ok(())
    }

    /// Placeholder session for a restored durable client, bound to a
    /// connection once the client returns.
    fn ensure_durable_session(&mut self, client_id: &str) {
        if !self.sessions.contains_key(client_id) {
            let queue = self.new_queue();
            self.sessions.insert(
                client_id.to_string(),
                ClientSession {
                    gid: None,
                    username: None,
                    clean_session: false,
                    notifications: false,
                    queue,
                },
            );
        }
    }
}
