// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Maximum length of client id defined in MQTT 3.1.
pub const MAX_CLIENT_ID_LEN: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Length of data exceeds 64k.
    TooManyData,

    /// Contains control characters.
    InvalidChar,

    /// Contains the null character, receiver shall close the connection.
    SeriousError,

    InvalidRandomString,
}

impl From<std::string::FromUtf8Error> for StringError {
    fn from(_e: std::string::FromUtf8Error) -> StringError {
        StringError::SeriousError
    }
}

/// Generate random alphanumeric string with `len` characters.
///
/// # Errors
///
/// Returns error if the sampled bytes are not valid UTF-8.
pub fn random_string(len: usize) -> Result<String, StringError> {
    String::from_utf8(
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .collect::<Vec<u8>>(),
    )
    .map_err(|_err| StringError::InvalidRandomString)
}

/// Generate a random client id for clients which connect with an empty one.
///
/// # Errors
///
/// Returns error if the sampled bytes are not valid UTF-8.
pub fn random_client_id() -> Result<String, StringError> {
    let suffix = random_string(12)?;
    Ok(format!("fengbo/{suffix}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    IsEmpty,

    /// Larger than 23 chars.
    TooLong,
}

/// Check client id length.
///
/// MQTT 3.1 restricts client ids to 1..=23 bytes. Empty ids are handled
/// by the caller, which may assign a random one.
///
/// # Errors
///
/// Returns error if `client_id` is empty or too long.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.is_empty() {
        return Err(ClientIdError::IsEmpty);
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(ClientIdError::TooLong);
    }
    Ok(())
}

/// Check data length exceeds 64k or not.
///
/// # Errors
///
/// Returns error if `data` is longer than 64k.
#[inline]
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), StringError> {
    if data.len() > u16::MAX as usize {
        Err(StringError::TooManyData)
    } else {
        Ok(())
    }
}

/// Check string characters and length.
///
/// # Errors
///
/// Returns error if `s` is too long or contains control characters.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > u16::MAX as usize {
        return Err(StringError::TooManyData);
    }

    for c in s.chars() {
        if c == '\u{0000}' {
            return Err(StringError::SeriousError);
        }

        if ('\u{0001}'..='\u{001f}').contains(&c) || ('\u{007f}'..='\u{009f}').contains(&c) {
            return Err(StringError::InvalidChar);
        }
    }

    // Empty string is valid.
    Ok(())
}

/// Convert range of bytes to valid UTF-8 string.
///
/// # Errors
///
/// Returns error if `buf` is not a valid UTF-8 string.
pub fn to_utf8_string(buf: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(buf.to_vec())?;
    validate_utf8_string(&s)?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_utf8_string() {
        assert!(validate_utf8_string("normal/topic").is_ok());
        assert!(validate_utf8_string("").is_ok());
        assert!(validate_utf8_string("nul\u{0000}char").is_err());
        assert!(validate_utf8_string("bell\u{0007}char").is_err());
    }

    #[test]
    fn test_validate_client_id() {
        assert!(validate_client_id("client-1").is_ok());
        assert_eq!(validate_client_id(""), Err(ClientIdError::IsEmpty));
        assert_eq!(
            validate_client_id("a-really-long-client-id-here"),
            Err(ClientIdError::TooLong)
        );
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id().unwrap();
        assert!(id.starts_with("fengbo/"));
        assert_eq!(id.len(), "fengbo/".len() + 12);
    }
}
