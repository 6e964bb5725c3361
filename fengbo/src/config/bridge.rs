// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;
use serde::Deserialize;

use crate::error::{Error, ErrorKind};

/// Which way messages of one bridge topic flow.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum BridgeDirection {
    /// Subscribe on the remote broker, import matching messages.
    #[serde(rename = "in")]
    In,

    /// Subscribe locally, export matching messages to the remote broker.
    #[serde(rename = "out")]
    Out,

    /// Both of the above.
    #[serde(rename = "both")]
    Both,
}

/// One topic mapping of a bridge.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeTopic {
    pub pattern: String,

    #[serde(default)]
    pub qos: QoS,

    #[serde(default = "BridgeTopic::default_direction")]
    pub direction: BridgeDirection,
}

impl BridgeTopic {
    #[must_use]
    pub const fn default_direction() -> BridgeDirection {
        BridgeDirection::Out
    }

    #[must_use]
    pub const fn exports(&self) -> bool {
        matches!(self.direction, BridgeDirection::Out | BridgeDirection::Both)
    }

    #[must_use]
    pub const fn imports(&self) -> bool {
        matches!(self.direction, BridgeDirection::In | BridgeDirection::Both)
    }
}

/// Connection to a remote broker the local broker joins as a client.
#[derive(Debug, Deserialize, Clone)]
pub struct Bridge {
    /// Name of this bridge, used in log lines and as part of the default
    /// client id.
    pub name: String,

    /// `host:port` pair of the remote broker.
    pub address: String,

    /// Client id presented to the remote broker.
    ///
    /// Default is None, producing `<hostname>.<name>`.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Keep alive interval on the bridge connection in seconds.
    ///
    /// Default is 60.
    #[serde(default = "Bridge::default_keep_alive")]
    pub keep_alive: u16,

    /// Clean session flag of the bridge connection.
    ///
    /// Default is false, so queued messages survive short outages.
    #[serde(default = "Bridge::default_clean_session")]
    pub clean_session: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Publish retained state notifications on
    /// `$SYS/broker/connection/<client-id>/state`.
    ///
    /// Default is true.
    #[serde(default = "Bridge::default_notifications")]
    pub notifications: bool,

    /// Topic patterns relayed over this bridge.
    #[serde(default)]
    pub topics: Vec<BridgeTopic>,
}

impl Bridge {
    #[must_use]
    pub const fn default_keep_alive() -> u16 {
        60
    }

    #[must_use]
    pub const fn default_clean_session() -> bool {
        false
    }

    #[must_use]
    pub const fn default_notifications() -> bool {
        true
    }

    #[must_use]
    pub const fn default_bridges() -> Vec<Self> {
        Vec::new()
    }

    /// Client id used on the remote broker, `<hostname>.<name>` unless
    /// configured. MQTT 3.1 limits client ids to 23 bytes, so the
    /// generated value is truncated.
    #[must_use]
    pub fn remote_client_id(&self) -> String {
        let mut client_id = self.client_id.clone().unwrap_or_else(|| {
            let hostname = hostname().unwrap_or_else(|| "fengbo".to_string());
            format!("{}.{}", hostname, self.name)
        });
        if client_id.len() > codec::utils::MAX_CLIENT_ID_LEN {
            let mut end = codec::utils::MAX_CLIENT_ID_LEN;
            while !client_id.is_char_boundary(end) {
                end -= 1;
            }
            client_id.truncate(end);
        }
        client_id
    }

    /// Validate bridge config.
    ///
    /// # Errors
    ///
    /// Returns error if name/address are empty or no topic is declared.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "bridge name must not be empty",
            ));
        }
        if self.address.is_empty() {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("bridge {}: address must not be empty", self.name),
            ));
        }
        if self.topics.is_empty() {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("bridge {}: at least one topic is required", self.name),
            ));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let name = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .ok()?;
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bridge() {
        let content = r#"
name = "upstream"
address = "10.0.0.2:1883"
topics = [
  { pattern = "telemetry/#", direction = "out" },
  { pattern = "commands/#", qos = "at_least_once", direction = "in" },
]
"#;
        let bridge: Bridge = toml::from_str(content).unwrap();
        assert!(bridge.validate().is_ok());
        assert_eq!(bridge.keep_alive, 60);
        assert!(!bridge.clean_session);
        assert!(bridge.topics[0].exports());
        assert!(!bridge.topics[0].imports());
        assert!(bridge.topics[1].imports());
    }

    #[test]
    fn test_bridge_without_topics_rejected() {
        let content = r#"
name = "upstream"
address = "10.0.0.2:1883"
"#;
        let bridge: Bridge = toml::from_str(content).unwrap();
        assert!(bridge.validate().is_err());
    }
}
