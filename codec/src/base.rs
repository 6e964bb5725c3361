// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

use crate::error::{DecodeError, EncodeError};
use crate::header::PacketType;
use crate::var_int::VarIntError;
use crate::ByteArray;

/// Protocol name of MQTT 3.1.
pub const PROTOCOL_NAME: &str = "MQIsdp";

/// Serialize a packet or field into a network byte stream.
pub trait EncodePacket {
    /// Append encoded bytes to `buf`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if fields cannot be represented on the wire.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Parse a packet or field from a network byte stream.
pub trait DecodePacket: Sized {
    /// Read one value from `ba`.
    ///
    /// # Errors
    ///
    /// Returns error if bytes do not form a valid value.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

pub trait Packet: Send + fmt::Debug {
    fn packet_type(&self) -> PacketType;

    /// Get byte length of the whole packet on the wire.
    ///
    /// # Errors
    ///
    /// Returns error if packet size is invalid.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

/// Delivery guarantee of a publish message.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    #[serde(rename = "at_most_once")]
    AtMostOnce = 0,

    /// At least once delivery.
    #[serde(rename = "at_least_once")]
    AtLeastOnce = 1,

    /// Exactly once delivery.
    #[serde(rename = "exact_once")]
    ExactOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<QoS, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_ordering() {
        // Effective QoS of a delivery is min(publish, subscription).
        assert_eq!(QoS::AtMostOnce.min(QoS::ExactOnce), QoS::AtMostOnce);
        assert_eq!(QoS::ExactOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[test]
    fn test_qos_try_from() {
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactOnce));
        assert_eq!(QoS::try_from(3), Err(DecodeError::InvalidQoS));
    }
}
