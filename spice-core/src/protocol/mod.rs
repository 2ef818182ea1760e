//! Fixed-layout message bodies.
//!
//! Every body in this module is a packed little-endian record, encoded
//! with `bincode`'s fixed-int little-endian options. Variable-length
//! tails (strings, entry arrays) are parsed by hand with explicit bounds
//! checks and never go through `bincode` length prefixes.

pub mod control;
pub mod main_channel;

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SpiceError;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

/// Encode a fixed-layout record.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SpiceError> {
    Ok(options().serialize(value)?)
}

/// Decode a fixed-layout record from the front of `bytes`.
///
/// Bytes after the record are ignored, so bodies that carry a
/// variable-length tail can be decoded in two steps.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SpiceError> {
    Ok(options().deserialize(bytes)?)
}

/// Read a NUL-terminated string; the terminator is optional at the end
/// of the buffer.
pub fn read_cstr(bytes: &[u8]) -> Result<String, SpiceError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|e| SpiceError::Encoding(format!("invalid utf-8 string: {e}")))
}
