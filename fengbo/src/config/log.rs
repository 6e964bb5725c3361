// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Error;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "off")]
    Off,

    #[serde(rename = "error")]
    Error,

    #[serde(rename = "warn")]
    Warn,

    #[serde(rename = "info")]
    Info,

    #[serde(rename = "debug")]
    Debug,

    #[serde(rename = "trace")]
    Trace,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    /// Also print log to console.
    ///
    /// Default is true.
    #[serde(default = "Log::default_console_log")]
    console_log: bool,

    /// Path to log file.
    ///
    /// Default is "/var/log/fengbo/fengbo.log" for root,
    /// "fengbo.log" for normal users.
    #[serde(default = "Log::default_log_file")]
    log_file: PathBuf,

    /// Log level.
    ///
    /// Default is "info".
    #[serde(default = "Log::default_log_level")]
    log_level: LogLevel,
}

impl Log {
    #[must_use]
    pub const fn default_console_log() -> bool {
        true
    }

    #[cfg(unix)]
    #[must_use]
    pub fn default_log_file() -> PathBuf {
        let uid = unsafe { nc::geteuid() };
        if uid == 0 {
            PathBuf::from("/var/log/fengbo/fengbo.log")
        } else {
            PathBuf::from("fengbo.log")
        }
    }

    #[cfg(not(unix))]
    #[must_use]
    pub fn default_log_file() -> PathBuf {
        PathBuf::from("fengbo.log")
    }

    #[must_use]
    pub const fn default_log_level() -> LogLevel {
        LogLevel::Info
    }

    #[must_use]
    pub const fn console_log(&self) -> bool {
        self.console_log
    }

    #[must_use]
    pub fn log_file(&self) -> &Path {
        self.log_file.as_path()
    }

    #[must_use]
    pub const fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Validate log config.
    ///
    /// # Errors
    ///
    /// Does nothing; an unwritable log file is reported at logger init.
    pub const fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            console_log: Self::default_console_log(),
            log_file: Self::default_log_file(),
            log_level: Self::default_log_level(),
        }
    }
}
