// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::Error;

mod bridge;
mod general;
mod listener;
mod log;
mod security;
mod storage;

pub use self::log::{Log, LogLevel};
pub use bridge::{Bridge, BridgeDirection, BridgeTopic};
pub use general::General;
pub use listener::Listener;
pub use security::Security;
pub use storage::Storage;

/// Server main config.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "General::default")]
    general: General,

    #[serde(default = "Listener::default_listeners")]
    listeners: Vec<Listener>,

    #[serde(default = "Security::default")]
    security: Security,

    #[serde(default = "Storage::default")]
    storage: Storage,

    #[serde(default = "Log::default")]
    log: Log,

    #[serde(default = "Bridge::default_bridges")]
    bridges: Vec<Bridge>,
}

impl Config {
    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    #[must_use]
    pub const fn security(&self) -> &Security {
        &self.security
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    #[must_use]
    pub fn bridges(&self) -> &[Bridge] {
        &self.bridges
    }

    /// Override the port of the default listener, from the command line.
    pub fn set_default_listener_port(&mut self, port: u16) {
        if let Some(listener) = self.listeners.first_mut() {
            listener.set_port(port);
        }
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some option in config is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        self.general.validate()?;

        for listener in &self.listeners {
            listener.validate()?;
        }

        for bridge in &self.bridges {
            bridge.validate()?;
        }

        self.security.validate()?;
        self.storage.validate()?;
        self.log.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: General::default(),
            listeners: Listener::default_listeners(),
            security: Security::default(),
            storage: Storage::default(),
            log: Log::default(),
            bridges: Bridge::default_bridges(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let content = r#"
[general]
retry_interval = 5

[[listeners]]
port = 2883

[security]
allow_anonymous = false

[[bridges]]
name = "peer"
address = "broker.example.com:1883"
topics = [
  { pattern = "sensors/#", qos = "at_least_once", direction = "both" },
]
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.general().retry_interval().as_secs(), 5);
        assert_eq!(config.listeners().len(), 1);
        assert_eq!(config.listeners()[0].address(), "0.0.0.0:2883");
        assert!(!config.security().allow_anonymous());
        assert_eq!(config.bridges().len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listeners().len(), 1);
        assert_eq!(config.listeners()[0].address(), "0.0.0.0:1883");
        assert!(config.bridges().is_empty());
        assert!(config.security().allow_anonymous());
    }
}
