// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;

#[cfg(unix)]
use crate::error::ErrorKind;

/// General section in config.
#[derive(Debug, Deserialize, Clone)]
pub struct General {
    /// Time interval to send `$SYS` messages in seconds.
    ///
    /// Set to 0 to disable `$SYS` messages.
    ///
    /// Default is 10.
    #[serde(default = "General::default_sys_interval")]
    sys_interval: u64,

    /// Seconds after which an unacknowledged QoS 1/2 message is re-sent
    /// with the DUP flag.
    ///
    /// Default is 20.
    #[serde(default = "General::default_retry_interval")]
    retry_interval: u64,

    /// Seconds between passes removing unreferenced entries from the
    /// message store.
    ///
    /// Default is 10.
    #[serde(default = "General::default_store_clean_interval")]
    store_clean_interval: u64,

    /// Maximum number of QoS 1/2 messages concurrently in flight per
    /// client. 0 means unlimited.
    ///
    /// Default is 20.
    #[serde(default = "General::default_max_inflight_messages")]
    max_inflight_messages: usize,

    /// Maximum number of QoS 1/2 messages held above the in-flight limit
    /// per client before new ones are dropped.
    ///
    /// Default is 100.
    #[serde(default = "General::default_max_queued_messages")]
    max_queued_messages: usize,

    /// Accept CONNECT packets with a zero length client id and assign a
    /// random one.
    ///
    /// Default is false, answering such packets with return code 2.
    #[serde(default = "General::default_allow_empty_client_id")]
    allow_empty_client_id: bool,

    /// Only accept client ids starting with this prefix.
    ///
    /// Default is None.
    #[serde(default = "General::default_clientid_prefixes")]
    clientid_prefixes: Option<String>,

    /// Seconds a connection may stay open before its CONNECT packet
    /// arrives.
    ///
    /// Default is 60.
    #[serde(default = "General::default_connect_timeout")]
    connect_timeout: u64,

    /// When run as root, drop privileges to this user.
    ///
    /// If fengbo is launched by a non-root account, this property is ignored.
    ///
    /// Default user is "fengbo".
    #[serde(default = "General::default_user")]
    user: String,

    /// Write process id to a file.
    ///
    /// Default is `/run/fengbo.pid` for root user,
    /// and `/run/user/UID/fengbo.pid` for non-root users.
    #[serde(default = "General::default_pid_file")]
    pid_file: PathBuf,
}

impl General {
    #[must_use]
    pub const fn default_sys_interval() -> u64 {
        10
    }

    #[must_use]
    pub const fn default_retry_interval() -> u64 {
        20
    }

    #[must_use]
    pub const fn default_store_clean_interval() -> u64 {
        10
    }

    #[must_use]
    pub const fn default_max_inflight_messages() -> usize {
        20
    }

    #[must_use]
    pub const fn default_max_queued_messages() -> usize {
        100
    }

    #[must_use]
    pub const fn default_allow_empty_client_id() -> bool {
        false
    }

    #[must_use]
    pub const fn default_clientid_prefixes() -> Option<String> {
        None
    }

    #[must_use]
    pub const fn default_connect_timeout() -> u64 {
        60
    }

    #[must_use]
    pub fn default_user() -> String {
        "fengbo".to_string()
    }

    #[cfg(not(unix))]
    #[must_use]
    pub fn default_pid_file() -> PathBuf {
        PathBuf::from("fengbo.pid")
    }

    #[cfg(unix)]
    #[must_use]
    pub fn default_pid_file() -> PathBuf {
        let uid = unsafe { nc::geteuid() };
        if uid == 0 {
            PathBuf::from("/run/fengbo.pid")
        } else {
            PathBuf::from(&format!("/run/user/{uid}/fengbo.pid"))
        }
    }

    #[must_use]
    pub const fn sys_interval(&self) -> Duration {
        Duration::from_secs(self.sys_interval)
    }

    #[must_use]
    pub const fn sys_interval_enabled(&self) -> bool {
        self.sys_interval > 0
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    #[must_use]
    pub const fn store_clean_interval(&self) -> Duration {
        Duration::from_secs(self.store_clean_interval)
    }

    #[must_use]
    pub const fn max_inflight_messages(&self) -> usize {
        self.max_inflight_messages
    }

    #[must_use]
    pub const fn max_queued_messages(&self) -> usize {
        self.max_queued_messages
    }

    #[must_use]
    pub const fn allow_empty_client_id(&self) -> bool {
        self.allow_empty_client_id
    }

    #[must_use]
    pub fn clientid_prefixes(&self) -> Option<&str> {
        self.clientid_prefixes.as_deref()
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> u64 {
        self.connect_timeout
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn pid_file(&self) -> &Path {
        self.pid_file.as_path()
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if specified user does not exist.
    #[cfg(not(unix))]
    pub fn validate(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if running as root and the configured user is empty.
    #[cfg(unix)]
    pub fn validate(&self) -> Result<(), Error> {
        let euid = unsafe { nc::geteuid() };
        if euid == 0 && self.user.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "user must be set when running as root",
            ));
        }
        Ok(())
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            sys_interval: Self::default_sys_interval(),
            retry_interval: Self::default_retry_interval(),
            store_clean_interval: Self::default_store_clean_interval(),
            max_inflight_messages: Self::default_max_inflight_messages(),
            max_queued_messages: Self::default_max_queued_messages(),
            allow_empty_client_id: Self::default_allow_empty_client_id(),
            clientid_prefixes: Self::default_clientid_prefixes(),
            connect_timeout: Self::default_connect_timeout(),
            user: Self::default_user(),
            pid_file: Self::default_pid_file(),
        }
    }
}
