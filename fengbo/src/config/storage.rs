// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    /// Save durable session data to disk.
    ///
    /// This saves subscriptions, in-flight messages of durable sessions
    /// and retained messages across restarts.
    ///
    /// Default is false.
    #[serde(default = "Storage::default_persistence")]
    persistence: bool,

    /// Filename of the persistence database.
    ///
    /// Default is "fengbo.db".
    #[serde(default = "Storage::default_persistence_file")]
    persistence_file: PathBuf,

    /// Directory the persistence database lives in.
    ///
    /// Default is None, meaning the working directory.
    #[serde(default = "Storage::default_persistence_location")]
    persistence_location: Option<PathBuf>,

    /// If persistence is enabled, save the in-memory database to disk
    /// every `autosave_interval` seconds.
    ///
    /// If set to 0, the persistence database is only written on shutdown
    /// and on demand. Writing can always be forced with a `SIGUSR1`
    /// signal.
    ///
    /// Default is 1800 seconds.
    #[serde(default = "Storage::default_autosave_interval")]
    autosave_interval: u64,
}

impl Storage {
    #[must_use]
    pub const fn default_persistence() -> bool {
        false
    }

    #[must_use]
    pub fn default_persistence_file() -> PathBuf {
        PathBuf::from("fengbo.db")
    }

    #[must_use]
    pub const fn default_persistence_location() -> Option<PathBuf> {
        None
    }

    #[must_use]
    pub const fn default_autosave_interval() -> u64 {
        1800
    }

    #[must_use]
    pub const fn persistence(&self) -> bool {
        self.persistence
    }

    /// Full path of the persistence database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        match &self.persistence_location {
            Some(location) => location.join(&self.persistence_file),
            None => self.persistence_file.clone(),
        }
    }

    #[must_use]
    pub const fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval)
    }

    #[must_use]
    pub const fn autosave_enabled(&self) -> bool {
        self.autosave_interval > 0
    }

    /// Validate storage config.
    ///
    /// # Errors
    ///
    /// Does nothing; an unusable database file is reported at startup.
    pub const fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            persistence: Self::default_persistence(),
            persistence_file: Self::default_persistence_file(),
            persistence_location: Self::default_persistence_location(),
            autosave_interval: Self::default_autosave_interval(),
        }
    }
}
