// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Reserved topic prefix under which the broker publishes its own state.
pub const SYS_PREFIX: &str = "$SYS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    EmptyTopic,
    TooManyData,
    InvalidChar,
    ContainsWildcard,
}

/// Validate a topic filter as used in SUBSCRIBE/UNSUBSCRIBE packets.
///
/// Rules are defined in MQTT chapter 3.8, Topic Names and Filters:
/// `#` matches any number of trailing levels and must be the last
/// character of the filter, preceded by a level separator unless it is
/// the whole filter; `+` matches exactly one level and must occupy a
/// whole level on its own.
///
/// # Errors
///
/// Returns error if `topic` violates the rules above.
pub fn validate_sub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > u16::MAX as usize {
        return Err(TopicError::TooManyData);
    }
    for part in topic.split('/') {
        match part {
            "+" | "#" => (),
            _ => {
                if part.contains(|c| c == '+' || c == '#') {
                    return Err(TopicError::InvalidChar);
                }
            }
        }
    }
    if let Some(pos) = topic.find('#') {
        if pos != topic.len() - 1 {
            return Err(TopicError::InvalidChar);
        }
    }
    Ok(())
}

/// Check that a topic name used in a PUBLISH packet carries no wildcard
/// characters and is not empty.
///
/// # Errors
///
/// Returns error if `topic` is empty, too long or contains `+`/`#`.
pub fn validate_pub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > u16::MAX as usize {
        return Err(TopicError::TooManyData);
    }

    if topic.contains(|c| c == '+' || c == '#') {
        Err(TopicError::ContainsWildcard)
    } else {
        Ok(())
    }
}

/// One level of a tokenized topic filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopicPart {
    /// Normal level string.
    Normal(String),

    /// Empty level, produced by a leading, trailing or doubled separator.
    Empty,

    /// `#`, matches all remaining levels. Always the last part.
    MultiWildcard,

    /// `+`, matches exactly one level.
    SingleWildcard,
}

impl TopicPart {
    fn parse(s: &str) -> Self {
        match s {
            "" => Self::Empty,
            "+" => Self::SingleWildcard,
            "#" => Self::MultiWildcard,
            _ => Self::Normal(s.to_string()),
        }
    }
}

/// Tokenized subscription filter with the match predicate.
///
/// Matching follows MQTT 3.1 with two boundary rules shared with the
/// broker's subscription tree: a topic starting with `/` lives under a
/// distinct root, so no wildcard in a filter without the leading `/`
/// can reach it; and `$SYS` topics are only visible to filters that
/// start with the literal `$SYS` level.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicFilter {
    filter: String,
    parts: Vec<TopicPart>,
}

impl TopicFilter {
    /// Tokenize a topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` violates wildcard rules.
    pub fn parse(filter: &str) -> Result<Self, TopicError> {
        validate_sub_topic(filter)?;
        let parts = filter.split('/').map(TopicPart::parse).collect();
        Ok(Self {
            filter: filter.to_string(),
            parts,
        })
    }

    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    #[must_use]
    pub fn parts(&self) -> &[TopicPart] {
        &self.parts
    }

    #[must_use]
    pub fn is_sys(&self) -> bool {
        self.filter.starts_with(SYS_PREFIX)
    }

    /// Check whether a concrete topic name matches this filter.
    #[must_use]
    pub fn is_match(&self, topic: &str) -> bool {
        if topic.starts_with(SYS_PREFIX) != self.is_sys() {
            return false;
        }
        // Topics with a leading separator live under their own root.
        if topic.starts_with('/') != self.filter.starts_with('/') {
            return false;
        }

        let mut topic_parts = topic.split('/');
        for part in &self.parts {
            match part {
                TopicPart::MultiWildcard => return true,
                TopicPart::SingleWildcard => {
                    if topic_parts.next().is_none() {
                        return false;
                    }
                }
                TopicPart::Normal(s) => {
                    if topic_parts.next() != Some(s.as_str()) {
                        return false;
                    }
                }
                TopicPart::Empty => {
                    if topic_parts.next() != Some("") {
                        return false;
                    }
                }
            }
        }
        topic_parts.next().is_none()
    }
}

/// Topic name attached to a PUBLISH packet, wildcard free.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new publish topic.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is empty or contains wildcard characters.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        validate_pub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// Topic filter attached to SUBSCRIBE/UNSUBSCRIBE packets, may contain
/// wildcards.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubTopic(String);

impl SubTopic {
    /// Create a new subscribe topic.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` violates wildcard rules.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_sub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        validate_sub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_sub_topic() {
        assert!(validate_sub_topic("sport/tennis/player/#").is_ok());
        assert!(validate_sub_topic("sport/tennis/player#").is_err());
        assert!(validate_sub_topic("#").is_ok());
        assert!(validate_sub_topic("sport/#/player/ranking").is_err());
        assert!(validate_sub_topic("+").is_ok());
        assert!(validate_sub_topic("sport+").is_err());
        assert!(validate_sub_topic("").is_err());
    }

    #[test]
    fn test_validate_pub_topic() {
        assert!(validate_pub_topic("sport/tennis/player/ranking").is_ok());
        assert!(validate_pub_topic("sport/tennis/player/#").is_err());
        assert!(validate_pub_topic("").is_err());
    }

    #[test]
    fn test_literal_match() {
        let filter = TopicFilter::parse("a/b").unwrap();
        assert!(filter.is_match("a/b"));
        assert!(!filter.is_match("a"));
        assert!(!filter.is_match("a/b/c"));
        assert!(!filter.is_match("/a/b"));
    }

    #[test]
    fn test_single_wildcard() {
        let filter = TopicFilter::parse("a/+/c").unwrap();
        assert!(filter.is_match("a/b/c"));
        assert!(!filter.is_match("a/b/d"));
        assert!(!filter.is_match("a/c"));
        assert!(!filter.is_match("a/b/c/d"));

        // `+` matches an empty level in the middle of a topic.
        let filter = TopicFilter::parse("a/+/b").unwrap();
        assert!(filter.is_match("a//b"));
    }

    #[test]
    fn test_multi_wildcard() {
        let filter = TopicFilter::parse("a/#").unwrap();
        assert!(filter.is_match("a"));
        assert!(filter.is_match("a/b"));
        assert!(filter.is_match("a/b/c"));
        assert!(!filter.is_match("b/c"));

        let filter = TopicFilter::parse("#").unwrap();
        assert!(filter.is_match("a"));
        assert!(filter.is_match("a/b/c"));
    }

    #[test]
    fn test_leading_separator_boundary() {
        // `/a/b` and `a/b` live in different trees.
        let filter = TopicFilter::parse("/a/b").unwrap();
        assert!(filter.is_match("/a/b"));
        assert!(!filter.is_match("a/b"));

        let filter = TopicFilter::parse("#").unwrap();
        assert!(!filter.is_match("/a"));

        let filter = TopicFilter::parse("+/a").unwrap();
        assert!(!filter.is_match("/a"));

        let filter = TopicFilter::parse("/#").unwrap();
        assert!(filter.is_match("/a"));
        assert!(!filter.is_match("a"));
    }

    #[test]
    fn test_sys_boundary() {
        let filter = TopicFilter::parse("#").unwrap();
        assert!(!filter.is_match("$SYS/broker/uptime"));

        let filter = TopicFilter::parse("+/broker/uptime").unwrap();
        assert!(!filter.is_match("$SYS/broker/uptime"));

        let filter = TopicFilter::parse("$SYS/#").unwrap();
        assert!(filter.is_match("$SYS/broker/uptime"));
        assert!(!filter.is_match("broker/uptime"));
    }
}
