//! Control tokens carried on the message queues.
//!
//! A token is the decimal byte length of the payload currently resident in the
//! shared segment. Payload bytes never travel through the queue.

use std::fmt;

use crate::error::{IpcError, Result};

/// Largest token accepted, and the message size requested when creating a queue.
pub const MAX_TOKEN_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlToken(String);

impl ControlToken {
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if text.is_empty() {
            return Err(IpcError::protocol(text, "empty token"));
        }
        if text.len() > MAX_TOKEN_LEN {
            return Err(IpcError::protocol(
                text,
                format!("token longer than {MAX_TOKEN_LEN} bytes"),
            ));
        }
        Ok(Self(text))
    }

    /// Token announcing a payload of `len` bytes.
    pub fn for_length(len: usize) -> Self {
        Self(len.to_string())
    }

    /// Decode a message as received from a queue.
    ///
    /// Trailing NULs are dropped so peers that send C strings interoperate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let end = bytes
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |last| last + 1);
        let text = std::str::from_utf8(&bytes[..end]).map_err(|_| {
            IpcError::protocol(String::from_utf8_lossy(bytes), "token is not valid UTF-8")
        })?;
        Self::new(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The payload length this token announces.
    pub fn payload_len(&self) -> Result<usize> {
        let digits = self.0.trim_ascii();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IpcError::protocol(&self.0, "not a decimal length"));
        }
        digits
            .parse::<usize>()
            .map_err(|_| IpcError::protocol(&self.0, "length does not fit in usize"))
    }
}

impl fmt::Display for ControlToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn length_token_parses_back() {
        let token = ControlToken::for_length(17);
        assert_eq!(token.as_str(), "17");
        assert_eq!(token.payload_len().unwrap(), 17);
    }

    #[test]
    fn zero_length_is_valid() {
        assert_eq!(ControlToken::for_length(0).payload_len().unwrap(), 0);
    }

    #[test]
    fn surrounding_whitespace_is_tolerated() {
        let token = ControlToken::new(" 42\n").unwrap();
        assert_eq!(token.payload_len().unwrap(), 42);
    }

    #[test]
    fn non_numeric_token_is_protocol_error() {
        for text in ["task-1", "-5", "12abc", "4 2", " "] {
            let token = ControlToken::new(text).unwrap();
            let err = token.payload_len().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol, "{text:?}");
        }
    }

    #[test]
    fn overflowing_length_is_protocol_error() {
        let token = ControlToken::new("99999999999999999999999999").unwrap();
        assert_eq!(token.payload_len().unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn empty_and_oversized_tokens_are_rejected() {
        assert!(ControlToken::new("").is_err());
        assert!(ControlToken::new("1".repeat(MAX_TOKEN_LEN)).is_ok());
        assert!(ControlToken::new("1".repeat(MAX_TOKEN_LEN + 1)).is_err());
    }

    #[test]
    fn from_bytes_strips_trailing_nuls() {
        let token = ControlToken::from_bytes(b"27\0\0").unwrap();
        assert_eq!(token.as_str(), "27");
    }

    #[test]
    fn from_bytes_rejects_invalid_utf8() {
        let err = ControlToken::from_bytes(&[0xff, 0xfe]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn from_bytes_rejects_all_nul_message() {
        assert!(ControlToken::from_bytes(&[0, 0]).is_err());
    }
}
