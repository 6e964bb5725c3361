// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::TopicFilter;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, ErrorKind};

/// Kind of topic access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAccess {
    /// Receive messages published to the topic.
    Read,

    /// Publish messages to the topic.
    Write,
}

#[derive(Debug, Clone)]
struct AclEntry {
    pattern: TopicFilter,
    read: bool,
    write: bool,
}

/// Topic access control list.
///
/// The file holds `topic [read|write|readwrite] <pattern>` lines.
/// Entries before the first `user <name>` line apply to every client;
/// entries after one apply to connections authenticated as that user.
/// When no ACL file is configured every access is granted; with one,
/// access needs a matching entry.
#[derive(Debug, Default, Clone)]
pub struct Acl {
    enabled: bool,
    general: Vec<AclEntry>,
    users: HashMap<String, Vec<AclEntry>>,
}

impl Acl {
    /// ACL granting everything, used when no file is configured.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Load an ACL file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or a line is malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let fd = File::open(path.as_ref())?;
        let reader = BufReader::new(fd);

        let mut acl = Self {
            enabled: true,
            general: Vec::new(),
            users: HashMap::new(),
        };
        let mut current_user: Option<String> = None;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(username) = line.strip_prefix("user ") {
                let username = username.trim();
                if username.is_empty() {
                    return Err(Error::new(
                        ErrorKind::FormatError,
                        "acl: empty username in user line",
                    ));
                }
                current_user = Some(username.to_string());
                continue;
            }

            if let Some(rest) = line.strip_prefix("topic ") {
                let entry = Self::parse_topic_line(rest.trim())?;
                match &current_user {
                    Some(user) => acl.users.entry(user.clone()).or_default().push(entry),
                    None => acl.general.push(entry),
                }
                continue;
            }

            if line.starts_with("pattern ") {
                // Substitution patterns of later brokers, not supported.
                log::warn!("acl: ignoring unsupported pattern line: {line}");
                continue;
            }

            return Err(Error::from_string(
                ErrorKind::FormatError,
                format!("acl: invalid line: {line:?}"),
            ));
        }

        Ok(acl)
    }

    fn parse_topic_line(rest: &str) -> Result<AclEntry, Error> {
        let (read, write, pattern) = match rest.split_once(' ') {
            Some(("read", pattern)) => (true, false, pattern),
            Some(("write", pattern)) => (false, true, pattern),
            Some(("readwrite", pattern)) => (true, true, pattern),
            // A topic line without an access keyword grants both.
            _ => (true, true, rest),
        };
        let pattern = pattern.trim();
        let pattern = TopicFilter::parse(pattern).map_err(|err| {
            Error::from_string(
                ErrorKind::FormatError,
                format!("acl: invalid topic pattern {pattern:?}: {err:?}"),
            )
        })?;
        Ok(AclEntry {
            pattern,
            read,
            write,
        })
    }

    /// Check whether `username` may access `topic`.
    ///
    /// Anonymous connections pass `None` and are covered by the general
    /// entries only.
    #[must_use]
    pub fn check(&self, username: Option<&str>, topic: &str, access: AclAccess) -> bool {
        if !self.enabled {
            return true;
        }

        let user_entries = username
            .and_then(|name| self.users.get(name))
            .map(Vec::as_slice)
            .unwrap_or_default();

        self.general
            .iter()
            .chain(user_entries)
            .any(|entry| Self::entry_grants(entry, topic, access))
    }

    fn entry_grants(entry: &AclEntry, topic: &str, access: AclAccess) -> bool {
        let granted = match access {
            AclAccess::Read => entry.read,
            AclAccess::Write => entry.write,
        };
        granted && entry.pattern.is_match(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pattern: &str, read: bool, write: bool) -> AclEntry {
        AclEntry {
            pattern: TopicFilter::parse(pattern).unwrap(),
            read,
            write,
        }
    }

    fn sample_acl() -> Acl {
        let mut users = HashMap::new();
        users.insert("roger".to_string(), vec![entry("secret/#", true, true)]);
        Acl {
            enabled: true,
            general: vec![entry("public/#", true, false)],
            users,
        }
    }

    #[test]
    fn test_allow_all_when_disabled() {
        let acl = Acl::allow_all();
        assert!(acl.check(None, "any/topic", AclAccess::Read));
        assert!(acl.check(Some("roger"), "any/topic", AclAccess::Write));
    }

    #[test]
    fn test_general_entries_apply_to_everyone() {
        let acl = sample_acl();
        assert!(acl.check(None, "public/news", AclAccess::Read));
        assert!(!acl.check(None, "public/news", AclAccess::Write));
        assert!(!acl.check(None, "secret/plans", AclAccess::Read));
    }

    #[test]
    fn test_user_entries() {
        let acl = sample_acl();
        assert!(acl.check(Some("roger"), "secret/plans", AclAccess::Read));
        assert!(acl.check(Some("roger"), "secret/plans", AclAccess::Write));
        assert!(!acl.check(Some("alice"), "secret/plans", AclAccess::Read));
    }

    #[test]
    fn test_parse_topic_line() {
        let entry = Acl::parse_topic_line("read sensors/#").unwrap();
        assert!(entry.read);
        assert!(!entry.write);
        assert!(entry.pattern.is_match("sensors/kitchen"));

        // No access keyword grants read and write.
        let entry = Acl::parse_topic_line("lights/hall").unwrap();
        assert!(entry.read);
        assert!(entry.write);
    }
}
