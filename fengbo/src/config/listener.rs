// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::{Error, ErrorKind};

/// One TCP endpoint the broker accepts clients on.
#[derive(Debug, Deserialize, Clone)]
pub struct Listener {
    /// Address to listen on.
    ///
    /// Default is "0.0.0.0".
    #[serde(default = "Listener::default_bind_address")]
    bind_address: String,

    /// Port to listen on.
    ///
    /// Default is 1883.
    #[serde(default = "Listener::default_port")]
    port: u16,

    /// Maximum number of concurrent client connections on this listener.
    /// 0 means unlimited.
    ///
    /// Default is 0.
    #[serde(default = "Listener::default_max_connections")]
    max_connections: usize,

    /// Topic prefix isolating clients of this listener.
    ///
    /// The prefix is prepended to topics of inbound PUBLISH and SUBSCRIBE
    /// packets and stripped from outbound PUBLISH topics.
    ///
    /// Default is None.
    #[serde(default = "Listener::default_mount_point")]
    mount_point: Option<String>,
}

impl Listener {
    #[must_use]
    pub fn default_bind_address() -> String {
        "0.0.0.0".to_string()
    }

    #[must_use]
    pub const fn default_port() -> u16 {
        1883
    }

    #[must_use]
    pub const fn default_max_connections() -> usize {
        0
    }

    #[must_use]
    pub const fn default_mount_point() -> Option<String> {
        None
    }

    #[must_use]
    pub fn default_listeners() -> Vec<Self> {
        vec![Self::default()]
    }

    /// Socket address string to bind.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    #[must_use]
    pub fn mount_point(&self) -> Option<&str> {
        self.mount_point.as_deref()
    }

    /// Validate listener config.
    ///
    /// # Errors
    ///
    /// Returns error if bind address is empty or port is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.bind_address.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "listener bind_address must not be empty",
            ));
        }
        if self.port == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "listener port must not be zero",
            ));
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            bind_address: Self::default_bind_address(),
            port: Self::default_port(),
            max_connections: Self::default_max_connections(),
            mount_point: Self::default_mount_point(),
        }
    }
}
