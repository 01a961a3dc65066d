// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Errors of MQTT UTF-8 string fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Byte sequence is not well-formed UTF-8.
    NonUtf8,

    /// String contains the null character U+0000.
    NullChar,

    /// String is longer than 65535 bytes.
    TooManyData,
}

/// Check that `s` may be carried in an MQTT UTF-8 Encoded String.
///
/// The character data MUST NOT include encodings of the null character
/// U+0000 [MQTT-1.5.4-2], and the length prefix is two bytes.
///
/// # Errors
///
/// Returns error if `s` is too long or contains U+0000.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > usize::from(u16::MAX) {
        return Err(StringError::TooManyData);
    }
    if s.contains('\u{0000}') {
        return Err(StringError::NullChar);
    }
    Ok(())
}

/// Convert raw bytes read from a packet into a validated string.
///
/// # Errors
///
/// Returns error if `bytes` is not well-formed UTF-8 or contains U+0000.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_| StringError::NonUtf8)?;
    validate_utf8_string(&s)?;
    Ok(s)
}

/// Errors of client identifier fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// Longer than 23 chars.
    TooLong,

    /// Contains chars other than 0-9, a-z, A-Z, `-` and `_`.
    InvalidChars,
}

/// Check a client identifier against the charset the protocol guarantees
/// every server accepts.
///
/// An empty client id is valid; the server then assigns one.
/// Servers may accept longer or richer ids, so callers treat a failure
/// here as advisory only.
///
/// # Errors
///
/// Returns error if `client_id` is longer than 23 chars or contains
/// chars outside of the portable charset.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > 23 {
        return Err(ClientIdError::TooLong);
    }
    if !client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ClientIdError::InvalidChars);
    }
    Ok(())
}

/// Generate an alphanumeric string with `len` chars, for use as a
/// random client id suffix.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_utf8_string() {
        assert!(validate_utf8_string("sensors/kitchen").is_ok());
        assert!(validate_utf8_string("").is_ok());
        assert_eq!(
            validate_utf8_string("a\u{0000}b"),
            Err(StringError::NullChar)
        );
    }

    #[test]
    fn test_to_utf8_string() {
        assert_eq!(to_utf8_string(b"mqtt"), Ok("mqtt".to_string()));
        assert_eq!(to_utf8_string(&[0xff, 0xfe]), Err(StringError::NonUtf8));
    }

    #[test]
    fn test_validate_client_id() {
        assert!(validate_client_id("test-A").is_ok());
        assert!(validate_client_id("").is_ok());
        assert!(validate_client_id("with space").is_err());
        assert!(validate_client_id("very-long-client-id-above-23-chars").is_err());
    }

    #[test]
    fn test_random_string() {
        let s = random_string(8);
        assert_eq!(s.len(), 8);
        assert!(validate_client_id(&s).is_ok());
    }
}
