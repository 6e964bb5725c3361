// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, ErrorKind};

/// Credentials loaded from a password file.
///
/// The file is a text file with one `username:password` pair per line.
/// Empty lines and lines starting with `#` are ignored.
#[derive(Debug, Default, Clone)]
pub struct Passwd {
    users: BTreeMap<String, String>,
}

impl Passwd {
    /// Load a password file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or an entry is malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let fd = File::open(path.as_ref())?;
        let reader = BufReader::new(fd);
        let mut users = BTreeMap::new();
        for line in reader.lines() {
            let line = line?;
            if let Some((username, password)) = Self::parse_line(&line)? {
                users.insert(username.to_string(), password.to_string());
            }
        }
        Ok(Self { users })
    }

    /// Parse one password entry.
    ///
    /// Returns `(username, password)` pair, or None for empty and comment
    /// lines.
    ///
    /// # Errors
    ///
    /// Returns error if the line does not hold exactly one colon or the
    /// username is empty.
    pub fn parse_line(line: &str) -> Result<Option<(&str, &str)>, Error> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let Some((username, password)) = line.split_once(':') else {
            return Err(Error::from_string(
                ErrorKind::FormatError,
                format!("Invalid password entry: {line:?}"),
            ));
        };
        if username.is_empty() {
            return Err(Error::from_string(
                ErrorKind::FormatError,
                format!("Username is empty in entry: {line:?}"),
            ));
        }
        Ok(Some((username, password)))
    }

    /// Check one username/password pair.
    #[must_use]
    pub fn check(&self, username: &str, password: &[u8]) -> bool {
        self.users
            .get(username)
            .map_or(false, |stored| stored.as_bytes() == password)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            Passwd::parse_line("roger:secret").unwrap(),
            Some(("roger", "secret"))
        );
        assert_eq!(Passwd::parse_line("# comment").unwrap(), None);
        assert_eq!(Passwd::parse_line("").unwrap(), None);
        assert!(Passwd::parse_line("no-colon-here").is_err());
        assert!(Passwd::parse_line(":empty-user").is_err());
    }

    #[test]
    fn test_check() {
        let mut passwd = Passwd::default();
        passwd
            .users
            .insert("roger".to_string(), "secret".to_string());
        assert!(passwd.check("roger", b"secret"));
        assert!(!passwd.check("roger", b"wrong"));
        assert!(!passwd.check("nobody", b"secret"));
    }
}
