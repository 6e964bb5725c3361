// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-client delivery queue with the QoS state machines.
//!
//! Each connection owns one ordered queue of messages in flight. The
//! dispatcher inserts entries during fan-out, feeds acknowledgements in,
//! and drains emissions out during the write phase. Entries above the
//! in-flight limit wait in the `Queued` state until a slot frees up.

use codec::QoS;
use std::convert::TryFrom;
use std::time::{Duration, Instant};

use crate::store::StoreId;

/// Position of a message relative to this client.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// QoS 2 publication received from this client, parked until its
    /// release packet arrives.
    Incoming = 0,

    /// Delivery from the broker to this client.
    Outgoing = 1,
}

impl TryFrom<u8> for Direction {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Self::Incoming),
            1 => Ok(Self::Outgoing),
            _ => Err(v),
        }
    }
}

/// Delivery state of one queue entry.
///
/// `Publish*` and `Resend*` states emit a packet on the next write phase;
/// `Wait*` states sit until the matching acknowledgement arrives or the
/// retry timer flips them back into an emitting state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Invalid = 0,
    Publish = 1,
    PublishPuback = 2,
    WaitPuback = 3,
    PublishPubrec = 4,
    WaitPubrec = 5,
    ResendPubrel = 6,
    WaitPubrel = 7,
    ResendPubcomp = 8,
    WaitPubcomp = 9,
    ResendPubrec = 10,
    Queued = 11,
}

impl TryFrom<u8> for DeliveryState {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::Publish),
            2 => Ok(Self::PublishPuback),
            3 => Ok(Self::WaitPuback),
            4 => Ok(Self::PublishPubrec),
            5 => Ok(Self::WaitPubrec),
            6 => Ok(Self::ResendPubrel),
            7 => Ok(Self::WaitPubrel),
            8 => Ok(Self::ResendPubcomp),
            9 => Ok(Self::WaitPubcomp),
            10 => Ok(Self::ResendPubrec),
            11 => Ok(Self::Queued),
            _ => Err(v),
        }
    }
}

/// One message in flight between the broker and one client.
#[derive(Debug, Clone)]
pub struct ClientMsg {
    pub store_id: StoreId,
    pub mid: u16,
    pub qos: QoS,
    pub retain: bool,
    pub direction: Direction,
    pub state: DeliveryState,
    pub dup: bool,
    pub timestamp: Instant,
}

/// Packet the write phase asks the caller to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Publish {
        store_id: StoreId,
        mid: u16,
        qos: QoS,
        retain: bool,
        dup: bool,
    },
    PubRec {
        mid: u16,
    },
    PubRel {
        mid: u16,
        dup: bool,
    },
    PubComp {
        mid: u16,
    },
}

/// Outcome of inserting an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Entry inserted in an emitting state.
    Active(u16),

    /// In-flight limit reached, entry parked as `Queued`.
    Queued(u16),

    /// Both limits reached, message dropped.
    Dropped,
}

#[derive(Debug)]
pub struct InflightQueue {
    msgs: Vec<ClientMsg>,
    last_mid: u16,
    max_inflight: usize,
    max_queued: usize,
}

impl InflightQueue {
    #[must_use]
    pub const fn new(max_inflight: usize, max_queued: usize) -> Self {
        Self {
            msgs: Vec::new(),
            last_mid: 0,
            max_inflight,
            max_queued,
        }
    }

    /// Allocate the next packet id, wrapping from 65535 back to 1.
    pub fn next_mid(&mut self) -> u16 {
        if self.last_mid == u16::MAX {
            self.last_mid = 1;
        } else {
            self.last_mid += 1;
        }
        self.last_mid
    }

    /// Number of QoS 1/2 entries currently occupying in-flight slots.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.msgs
            .iter()
            .filter(|msg| msg.qos != QoS::AtMostOnce && msg.state != DeliveryState::Queued)
            .count()
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.msgs
            .iter()
            .filter(|msg| msg.state == DeliveryState::Queued)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    #[must_use]
    pub fn msgs(&self) -> &[ClientMsg] {
        &self.msgs
    }

    const fn inflight_slot_free(&self, inflight: usize) -> bool {
        self.max_inflight == 0 || inflight < self.max_inflight
    }

    /// Insert an outgoing delivery.
    ///
    /// QoS 0 entries always enter in the `Publish` state and are removed
    /// by the next write phase. QoS 1/2 entries enter their publish state
    /// when an in-flight slot is free, wait in `Queued` while only queue
    /// space is left, and are dropped when both bounds are hit.
    pub fn push_outgoing(&mut self, store_id: StoreId, qos: QoS, retain: bool) -> EnqueueResult {
        if qos == QoS::AtMostOnce {
            self.msgs.push(ClientMsg {
                store_id,
                mid: 0,
                qos,
                retain,
                direction: Direction::Outgoing,
                state: DeliveryState::Publish,
                dup: false,
                timestamp: Instant::now(),
            });
            return EnqueueResult::Active(0);
        }

        let inflight = self.inflight_count();
        let state = if self.inflight_slot_free(inflight) {
            match qos {
                QoS::AtLeastOnce => DeliveryState::PublishPuback,
                QoS::ExactOnce => DeliveryState::PublishPubrec,
                QoS::AtMostOnce => unreachable!(),
            }
        } else if self.queued_count() < self.max_queued {
            DeliveryState::Queued
        } else {
            return EnqueueResult::Dropped;
        };

        let mid = self.next_mid();
        self.msgs.push(ClientMsg {
            store_id,
            mid,
            qos,
            retain,
            direction: Direction::Outgoing,
            state,
            dup: false,
            timestamp: Instant::now(),
        });
        if state == DeliveryState::Queued {
            EnqueueResult::Queued(mid)
        } else {
            EnqueueResult::Active(mid)
        }
    }

    /// Park an inbound QoS 2 publication until its release packet arrives.
    pub fn push_incoming(&mut self, store_id: StoreId, mid: u16) {
        self.msgs.push(ClientMsg {
            store_id,
            mid,
            qos: QoS::ExactOnce,
            retain: false,
            direction: Direction::Incoming,
            state: DeliveryState::WaitPubrec,
            dup: false,
            timestamp: Instant::now(),
        });
    }

    /// Re-create an entry from a persistence snapshot.
    pub fn push_restored(&mut self, msg: ClientMsg) {
        if msg.direction == Direction::Outgoing && msg.mid > self.last_mid {
            self.last_mid = msg.mid;
        }
        self.msgs.push(msg);
    }

    #[must_use]
    pub fn has_incoming(&self, mid: u16) -> bool {
        self.msgs
            .iter()
            .any(|msg| msg.direction == Direction::Incoming && msg.mid == mid)
    }

    /// Remove the inbound entry for `mid` after its release packet
    /// arrived, returning the stored message to fan out.
    pub fn release_incoming(&mut self, mid: u16) -> Option<StoreId> {
        let pos = self
            .msgs
            .iter()
            .position(|msg| msg.direction == Direction::Incoming && msg.mid == mid)?;
        Some(self.msgs.remove(pos).store_id)
    }

    /// Handle PUBACK of an outgoing QoS 1 delivery. Returns the store id
    /// of the completed entry.
    pub fn ack_puback(&mut self, mid: u16) -> Option<StoreId> {
        let pos = self.msgs.iter().position(|msg| {
            msg.direction == Direction::Outgoing && msg.mid == mid && msg.qos == QoS::AtLeastOnce
        })?;
        Some(self.msgs.remove(pos).store_id)
    }

    /// Handle PUBREC of an outgoing QoS 2 delivery: transition to
    /// `WaitPubcomp`. The caller sends the release packet.
    pub fn ack_pubrec(&mut self, mid: u16) -> bool {
        let entry = self.msgs.iter_mut().find(|msg| {
            msg.direction == Direction::Outgoing
                && msg.mid == mid
                && matches!(
                    msg.state,
                    DeliveryState::PublishPubrec
                        | DeliveryState::WaitPubrec
                        | DeliveryState::ResendPubrel
                        | DeliveryState::WaitPubcomp
                )
        });
        match entry {
            Some(msg) => {
                msg.state = DeliveryState::WaitPubcomp;
                msg.timestamp = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Handle PUBCOMP of an outgoing QoS 2 delivery. Returns the store id
    /// of the completed entry.
    pub fn ack_pubcomp(&mut self, mid: u16) -> Option<StoreId> {
        let pos = self.msgs.iter().position(|msg| {
            msg.direction == Direction::Outgoing && msg.mid == mid && msg.qos == QoS::ExactOnce
        })?;
        Some(self.msgs.remove(pos).store_id)
    }

    /// Emit packets for every entry in an emitting state, in queue order.
    ///
    /// Returns the emissions plus the store ids of removed QoS 0 entries,
    /// whose references the caller must drop.
    pub fn write_phase(&mut self) -> (Vec<Emission>, Vec<StoreId>) {
        let mut emissions = Vec::new();
        let mut released = Vec::new();

        let mut inflight = self.inflight_count();
        let mut index = 0;
        while index < self.msgs.len() {
            // Promote queued entries while slots are free.
            if self.msgs[index].state == DeliveryState::Queued && self.inflight_slot_free(inflight)
            {
                self.msgs[index].state = match self.msgs[index].qos {
                    QoS::AtLeastOnce => DeliveryState::PublishPuback,
                    QoS::ExactOnce => DeliveryState::PublishPubrec,
                    QoS::AtMostOnce => DeliveryState::Publish,
                };
                inflight += 1;
            }

            let msg = &mut self.msgs[index];
            match msg.state {
                DeliveryState::Publish => {
                    emissions.push(Emission::Publish {
                        store_id: msg.store_id,
                        mid: msg.mid,
                        qos: msg.qos,
                        retain: msg.retain,
                        dup: msg.dup,
                    });
                    released.push(msg.store_id);
                    self.msgs.remove(index);
                    continue;
                }
                DeliveryState::PublishPuback => {
                    emissions.push(Emission::Publish {
                        store_id: msg.store_id,
                        mid: msg.mid,
                        qos: msg.qos,
                        retain: msg.retain,
                        dup: msg.dup,
                    });
                    msg.state = DeliveryState::WaitPuback;
                    msg.timestamp = Instant::now();
                }
                DeliveryState::PublishPubrec => {
                    emissions.push(Emission::Publish {
                        store_id: msg.store_id,
                        mid: msg.mid,
                        qos: msg.qos,
                        retain: msg.retain,
                        dup: msg.dup,
                    });
                    msg.state = DeliveryState::WaitPubrec;
                    msg.timestamp = Instant::now();
                }
                DeliveryState::ResendPubrec => {
                    emissions.push(Emission::PubRec { mid: msg.mid });
                    msg.state = DeliveryState::WaitPubrel;
                    msg.timestamp = Instant::now();
                }
                DeliveryState::ResendPubrel => {
                    emissions.push(Emission::PubRel {
                        mid: msg.mid,
                        dup: true,
                    });
                    msg.state = DeliveryState::WaitPubcomp;
                    msg.timestamp = Instant::now();
                }
                DeliveryState::ResendPubcomp => {
                    emissions.push(Emission::PubComp { mid: msg.mid });
                    msg.state = DeliveryState::WaitPubrel;
                    msg.timestamp = Instant::now();
                }
                _ => {}
            }
            index += 1;
        }

        (emissions, released)
    }

    /// Flip entries which waited longer than `threshold` back into their
    /// emitting state, with the DUP flag set.
    ///
    /// Returns the number of flipped entries.
    pub fn timeout_check(&mut self, threshold: Duration) -> usize {
        let now = Instant::now();
        let mut flipped = 0;
        for msg in &mut self.msgs {
            if now.duration_since(msg.timestamp) < threshold {
                continue;
            }
            let next = match (msg.state, msg.direction) {
                (DeliveryState::WaitPuback, Direction::Outgoing) => DeliveryState::PublishPuback,
                (DeliveryState::WaitPubrec, Direction::Outgoing) => DeliveryState::PublishPubrec,
                (DeliveryState::WaitPubrec | DeliveryState::WaitPubrel, Direction::Incoming) => {
                    DeliveryState::ResendPubrec
                }
                (DeliveryState::WaitPubcomp, Direction::Outgoing) => DeliveryState::ResendPubrel,
                _ => continue,
            };
            msg.state = next;
            msg.dup = true;
            msg.timestamp = now;
            flipped += 1;
        }
        flipped
    }

    /// Prepare a durable session for a fresh connection: unacknowledged
    /// deliveries are re-emitted with the DUP flag set.
    pub fn mark_reconnect(&mut self) {
        for msg in &mut self.msgs {
            match (msg.state, msg.direction) {
                (DeliveryState::WaitPuback, Direction::Outgoing) => {
                    msg.state = DeliveryState::PublishPuback;
                    msg.dup = true;
                }
                (DeliveryState::WaitPubrec, Direction::Outgoing) => {
                    msg.state = DeliveryState::PublishPubrec;
                    msg.dup = true;
                }
                (DeliveryState::WaitPubcomp, Direction::Outgoing) => {
                    msg.state = DeliveryState::ResendPubrel;
                }
                (DeliveryState::PublishPuback | DeliveryState::PublishPubrec, Direction::Outgoing) => {
                    msg.dup = true;
                }
                (DeliveryState::WaitPubrec | DeliveryState::WaitPubrel, Direction::Incoming) => {
                    msg.state = DeliveryState::ResendPubrec;
                }
                _ => {}
            }
            msg.timestamp = Instant::now();
        }
    }

    /// Drop every entry, returning the referenced store ids.
    pub fn clear(&mut self) -> Vec<StoreId> {
        self.msgs.drain(..).map(|msg| msg.store_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InflightQueue {
        InflightQueue::new(2, 3)
    }

    #[test]
    fn test_qos0_emitted_and_removed() {
        let mut q = queue();
        assert_eq!(q.push_outgoing(7, QoS::AtMostOnce, false), EnqueueResult::Active(0));
        let (emissions, released) = q.write_phase();
        assert_eq!(
            emissions,
            vec![Emission::Publish {
                store_id: 7,
                mid: 0,
                qos: QoS::AtMostOnce,
                retain: false,
                dup: false,
            }]
        );
        assert_eq!(released, vec![7]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_admission_bounds() {
        let mut q = queue();
        assert!(matches!(q.push_outgoing(1, QoS::AtLeastOnce, false), EnqueueResult::Active(_)));
        assert!(matches!(q.push_outgoing(2, QoS::AtLeastOnce, false), EnqueueResult::Active(_)));
        // In-flight limit reached, next three are queued.
        assert!(matches!(q.push_outgoing(3, QoS::AtLeastOnce, false), EnqueueResult::Queued(_)));
        assert!(matches!(q.push_outgoing(4, QoS::AtLeastOnce, false), EnqueueResult::Queued(_)));
        assert!(matches!(q.push_outgoing(5, QoS::AtLeastOnce, false), EnqueueResult::Queued(_)));
        // Queue limit reached too.
        assert_eq!(q.push_outgoing(6, QoS::AtLeastOnce, false), EnqueueResult::Dropped);

        assert_eq!(q.inflight_count(), 2);
        assert_eq!(q.queued_count(), 3);
    }

    #[test]
    fn test_inflight_bound_holds_through_write_phase() {
        let mut q = queue();
        for id in 0..5 {
            let _ret = q.push_outgoing(id, QoS::AtLeastOnce, false);
        }
        let (emissions, _released) = q.write_phase();
        // Only the two admitted entries may be emitted.
        assert_eq!(emissions.len(), 2);
        assert_eq!(q.inflight_count(), 2);
        assert_eq!(q.queued_count(), 3);
    }

    #[test]
    fn test_queued_promoted_after_ack() {
        let mut q = queue();
        let mids: Vec<u16> = (0..3)
            .map(|id| match q.push_outgoing(id, QoS::AtLeastOnce, false) {
                EnqueueResult::Active(mid) | EnqueueResult::Queued(mid) => mid,
                EnqueueResult::Dropped => unreachable!(),
            })
            .collect();
        let _ret = q.write_phase();

        assert_eq!(q.ack_puback(mids[0]), Some(0));
        let (emissions, _released) = q.write_phase();
        // The queued entry took the freed slot.
        assert_eq!(
            emissions,
            vec![Emission::Publish {
                store_id: 2,
                mid: mids[2],
                qos: QoS::AtLeastOnce,
                retain: false,
                dup: false,
            }]
        );
    }

    #[test]
    fn test_qos1_retry_sets_dup() {
        let mut q = queue();
        let mid = match q.push_outgoing(9, QoS::AtLeastOnce, false) {
            EnqueueResult::Active(mid) => mid,
            _ => unreachable!(),
        };
        let _ret = q.write_phase();

        // Nothing acknowledged; pretend the retry interval elapsed.
        assert_eq!(q.timeout_check(Duration::from_secs(0)), 1);
        let (emissions, _released) = q.write_phase();
        assert_eq!(
            emissions,
            vec![Emission::Publish {
                store_id: 9,
                mid,
                qos: QoS::AtLeastOnce,
                retain: false,
                dup: true,
            }]
        );
    }

    #[test]
    fn test_qos2_outgoing_flow() {
        let mut q = queue();
        let mid = match q.push_outgoing(3, QoS::ExactOnce, false) {
            EnqueueResult::Active(mid) => mid,
            _ => unreachable!(),
        };
        let (emissions, _released) = q.write_phase();
        assert_eq!(emissions.len(), 1);

        assert!(q.ack_pubrec(mid));
        // PUBCOMP lost: retry re-sends the release packet.
        assert_eq!(q.timeout_check(Duration::from_secs(0)), 1);
        let (emissions, _released) = q.write_phase();
        assert_eq!(emissions, vec![Emission::PubRel { mid, dup: true }]);

        assert_eq!(q.ack_pubcomp(mid), Some(3));
        assert!(q.is_empty());
    }

    #[test]
    fn test_qos2_incoming_dedup() {
        let mut q = queue();
        q.push_incoming(5, 17);
        assert!(q.has_incoming(17));
        assert!(!q.has_incoming(18));

        assert_eq!(q.release_incoming(17), Some(5));
        assert!(!q.has_incoming(17));
        assert_eq!(q.release_incoming(17), None);
    }

    #[test]
    fn test_incoming_retry_resends_pubrec() {
        let mut q = queue();
        q.push_incoming(5, 17);
        assert_eq!(q.timeout_check(Duration::from_secs(0)), 1);
        let (emissions, _released) = q.write_phase();
        assert_eq!(emissions, vec![Emission::PubRec { mid: 17 }]);
    }

    #[test]
    fn test_mid_wraps_to_one() {
        let mut q = InflightQueue::new(0, 0);
        q.last_mid = u16::MAX - 1;
        assert_eq!(q.next_mid(), u16::MAX);
        assert_eq!(q.next_mid(), 1);
    }

    #[test]
    fn test_mark_reconnect_sets_dup() {
        let mut q = queue();
        let mid = match q.push_outgoing(4, QoS::AtLeastOnce, false) {
            EnqueueResult::Active(mid) => mid,
            _ => unreachable!(),
        };
        let _ret = q.write_phase();

        q.mark_reconnect();
        let (emissions, _released) = q.write_phase();
        assert_eq!(
            emissions,
            vec![Emission::Publish {
                store_id: 4,
                mid,
                qos: QoS::AtLeastOnce,
                retain: false,
                dup: true,
            }]
        );
    }
}
