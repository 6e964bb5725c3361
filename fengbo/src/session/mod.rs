// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::BytesMut;
use codec::{ByteArray, DecodePacket, EncodePacket, VarInt};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::interval;

use crate::commands::{ListenerToSessionCmd, SessionToListenerCmd};
use crate::error::{Error, ErrorKind};
use crate::stream::Stream;
use crate::types::{LastWill, SessionId};

mod client;
mod config;
mod listener;

pub use config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Socket accepted, CONNECT not seen yet.
    Invalid,
    /// CONNECT forwarded, CONNACK not sent yet.
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// One client connection.
///
/// Owns the socket and the packet accumulator; everything beyond packet
/// framing, keepalive and CONNECT validation is forwarded to the
/// listener.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    stream: Stream,

    status: Status,
    client_id: String,
    will: Option<LastWill>,

    /// Partial packet bytes accumulated across socket reads.
    in_buf: BytesMut,
    last_inbound: Instant,
    created: Instant,

    sender: Sender<SessionToListenerCmd>,
    receiver: Receiver<ListenerToSessionCmd>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        stream: Stream,
        sender: Sender<SessionToListenerCmd>,
        receiver: Receiver<ListenerToSessionCmd>,
    ) -> Self {
        Self {
            id,
            config,
            stream,

            status: Status::Invalid,
            client_id: String::new(),
            will: None,

            in_buf: BytesMut::with_capacity(1024),
            last_inbound: Instant::now(),
            created: Instant::now(),

            sender,
            receiver,
        }
    }

    pub async fn run_loop(mut self) {
        let mut timer = interval(Duration::from_secs(1));

        loop {
            if self.status == Status::Disconnected {
                break;
            }

            tokio::select! {
                ret = self.stream.read_buf(&mut self.in_buf) => {
                    match ret {
                        Ok(0) => {
                            log::info!("session: peer closed connection, {}", self.id);
                            break;
                        }
                        Ok(_n_recv) => {
                            self.last_inbound = Instant::now();
                            if let Err(err) = self.handle_buffered_packets().await {
                                log::error!("session: {}: {err}", self.id);
                                break;
                            }
                        }
                        Err(err) => {
                            log::info!("session: read error, {}, err: {err}", self.id);
                            break;
                        }
                    }
                }
                Some(cmd) = self.receiver.recv() => {
                    if let Err(err) = self.handle_listener_cmd(cmd).await {
                        log::error!("session: failed to handle listener cmd: {err}");
                        break;
                    }
                },
                _ = timer.tick() => {
                    if self.tick_expired() {
                        break;
                    }
                }
            }
        }

        // The will only survives to this point when the peer never sent a
        // clean DISCONNECT packet.
        let will = self.will.take();
        if let Err(err) = self
            .sender
            .send(SessionToListenerCmd::Disconnect(self.id, will))
            .await
        {
            log::error!(
                "session: failed to send disconnect cmd, id: {}, err: {err:?}",
                self.id
            );
        }
    }

    /// Connect-timeout and keepalive checks, run every second.
    fn tick_expired(&self) -> bool {
        if self.status == Status::Invalid
            && self.config.connect_timeout() > 0
            && self.created.elapsed().as_secs() > self.config.connect_timeout()
        {
            log::warn!("session: no CONNECT packet within timeout, {}", self.id);
            return true;
        }

        // The broker disconnects a client after one and a half times its
        // keep alive value of inbound silence.
        if self.status == Status::Connected
            && self.config.keep_alive() > 0
            && self.last_inbound.elapsed().as_secs() > self.config.keep_alive()
        {
            log::warn!(
                "session: keepalive expired, disconnect client {}",
                self.client_id
            );
            return true;
        }

        false
    }

    /// Extract complete packets from the accumulator.
    ///
    /// A packet may arrive across many socket reads, or several packets
    /// in one; framing state lives in `in_buf` between wake-ups.
    async fn handle_buffered_packets(&mut self) -> Result<(), Error> {
        while let Some(packet_len) = complete_packet_len(&self.in_buf)? {
            let packet = self.in_buf.split_to(packet_len).freeze();
            self.handle_client_packet(&packet).await?;
        }
        Ok(())
    }

    /// Reject packets from a peer which has not completed the connect
    /// handshake.
    fn check_connected(&self) -> Result<(), Error> {
        if self.status == Status::Connected || self.status == Status::Connecting {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::StatusError,
                "session: packet before CONNECT",
            ))
        }
    }

    async fn send<P: EncodePacket>(&mut self, packet: P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write(&buf).await.map(drop)
    }
}

/// Length of the first complete packet in `buf`: command byte plus
/// remaining-length varint plus payload. None while bytes are missing.
pub(crate) fn complete_packet_len(buf: &[u8]) -> Result<Option<usize>, Error> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let mut ba = ByteArray::new(&buf[1..]);
    let remaining_length = match VarInt::decode(&mut ba) {
        Ok(var_int) => var_int,
        // A varint continuation byte may still be on the wire.
        Err(codec::DecodeError::OutOfRange) if buf.len() < 5 => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let total = 1 + ba.offset() + remaining_length.value();
    if buf.len() < total {
        Ok(None)
    } else {
        Ok(Some(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_packet_len() {
        // PINGREQ, exactly one packet.
        assert_eq!(complete_packet_len(&[0xc0, 0x00]).unwrap(), Some(2));

        // Partial fixed header.
        assert_eq!(complete_packet_len(&[0x30]).unwrap(), None);

        // Declared three payload bytes, only two arrived.
        assert_eq!(complete_packet_len(&[0x30, 0x03, 0x00, 0x01]).unwrap(), None);

        // Full packet plus the start of the next one.
        assert_eq!(complete_packet_len(&[0xc0, 0x00, 0x30, 0x03]).unwrap(), Some(2));

        // Multi-byte varint split across reads.
        assert_eq!(complete_packet_len(&[0x30, 0x80]).unwrap(), None);

        // Five continuation bytes are malformed.
        assert!(complete_packet_len(&[0x30, 0xff, 0xff, 0xff, 0xff, 0x7f]).is_err());
    }
}
