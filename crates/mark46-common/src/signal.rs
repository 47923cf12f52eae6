//! The 4-byte signal envelope wrapping every application message.
//!
//! Wire form: `[code / 100, code % 100, 25, 151]` followed by the payload.
//! Code 0 is the authentication signal; codes 1..=9999 are application
//! defined.

use crate::types::{magic, MAX_SIGNAL_CODE};
use serde_json::Value;
use thiserror::Error;

/// Length of the envelope header.
pub const HEADER_LEN: usize = 4;

/// Errors from encoding or decoding the signal envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// The signal code is outside `0..=9999`.
    #[error("invalid signal code: {0}")]
    InvalidSignalCode(u16),
    /// The message is shorter than the envelope header or the magic bytes
    /// are wrong.
    #[error("Invalid signal data")]
    InvalidSignalData,
}

/// Payload of an outgoing signal.
///
/// Mirrors the three shapes applications hand to the server: raw bytes pass
/// through untouched, text is sent as UTF-8, and structured values are JSON
/// stringified. A JSON `null` collapses to an empty body, leaving only the
/// envelope header on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalBody {
    /// Raw bytes, used verbatim.
    Bytes(Vec<u8>),
    /// Text, sent as its UTF-8 bytes.
    Text(String),
    /// A structured value, sent as its JSON string.
    Json(Value),
}

impl SignalBody {
    /// Renders the body into payload bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bytes(b) => b.clone(),
            Self::Text(s) => s.clone().into_bytes(),
            Self::Json(Value::Null) => Vec::new(),
            Self::Json(Value::String(s)) => s.clone().into_bytes(),
            Self::Json(v) => v.to_string().into_bytes(),
        }
    }
}

impl From<Vec<u8>> for SignalBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for SignalBody {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<String> for SignalBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for SignalBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Value> for SignalBody {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Wraps a payload in the signal envelope.
///
/// # Errors
///
/// Returns [`SignalError::InvalidSignalCode`] when `code > 9999`.
///
/// # Examples
///
/// ```
/// use mark46_common::signal::{decode_signal, encode_signal, SignalBody};
/// let bytes = encode_signal(4207, &SignalBody::from("hi")).unwrap();
/// assert_eq!(&bytes[..4], &[42, 7, 25, 151]);
/// assert_eq!(decode_signal(&bytes).unwrap(), (4207, b"hi".as_slice()));
/// ```
pub fn encode_signal(code: u16, body: &SignalBody) -> Result<Vec<u8>, SignalError> {
    if code > MAX_SIGNAL_CODE {
        return Err(SignalError::InvalidSignalCode(code));
    }
    let payload = body.to_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    #[allow(clippy::cast_possible_truncation)]
    out.push((code / 100) as u8);
    #[allow(clippy::cast_possible_truncation)]
    out.push((code % 100) as u8);
    out.push(magic::BYTE_1);
    out.push(magic::BYTE_2);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Splits a signal message into its code and payload.
///
/// The frame receiver performs this inline while parsing; this standalone
/// form exists for clients and tests.
///
/// # Errors
///
/// Returns [`SignalError::InvalidSignalData`] when the message is shorter
/// than the header or the magic bytes do not match.
pub fn decode_signal(message: &[u8]) -> Result<(u16, &[u8]), SignalError> {
    if message.len() < HEADER_LEN
        || message[2] != magic::BYTE_1
        || message[3] != magic::BYTE_2
    {
        return Err(SignalError::InvalidSignalData);
    }
    let code = u16::from(message[0]) * 100 + u16::from(message[1]);
    Ok((code, &message[HEADER_LEN..]))
}
