//! Variable-length frame prefix.
//!
//! A length is written as base-128 digits, most significant first. Every digit
//! except the last carries the continuation bit (`0x80`):
//!
//! ```text
//!   255     -> 81 7f
//!   65535   -> 83 ff 7f
//!   0x10000 -> 84 80 00
//! ```

use std::io;

use crate::error::{IpcError, Result};

/// Default ceiling for a decoded frame length (128 KiB).
pub const DEFAULT_MAX_LENGTH: usize = 128 * 1024;

const CONTINUATION: u8 = 0x80;
const DIGIT_MASK: u8 = 0x7f;

/// Outcome of decoding one length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// The source ended before the first byte.
    Eof,
    Value(usize),
}

/// Encode `length` as a continuation-bit prefix.
///
/// Zero is rejected: outgoing frames always carry a payload.
pub fn encode_length(length: usize) -> Result<Vec<u8>> {
    if length == 0 {
        return Err(IpcError::EmptyFrame);
    }

    let mut digits = Vec::with_capacity(4);
    let mut remaining = length;
    while remaining > 0 {
        digits.push((remaining & DIGIT_MASK as usize) as u8);
        remaining >>= 7;
    }
    digits.reverse();

    let last = digits.len() - 1;
    for digit in &mut digits[..last] {
        *digit |= CONTINUATION;
    }
    Ok(digits)
}

/// Decode a length prefix pulled one byte at a time from `next_byte`.
///
/// `next_byte` returns `Ok(None)` once the source is exhausted. Running out
/// before the first byte is [`Decoded::Eof`]; running out after it is
/// [`IpcError::TruncatedLength`]. An accumulator above `max_length` is
/// [`IpcError::LengthTooLarge`].
pub fn decode_length<F>(mut next_byte: F, max_length: usize) -> Result<Decoded>
where
    F: FnMut() -> io::Result<Option<u8>>,
{
    let mut total: usize = 0;
    let mut first = true;

    loop {
        let byte = match next_byte()? {
            Some(byte) => byte,
            None if first => return Ok(Decoded::Eof),
            None => return Err(IpcError::TruncatedLength),
        };
        first = false;

        total = total
            .checked_mul(128)
            .and_then(|t| t.checked_add((byte & DIGIT_MASK) as usize))
            .filter(|t| *t <= max_length)
            .ok_or(IpcError::LengthTooLarge { limit: max_length })?;

        if byte & CONTINUATION == 0 {
            return Ok(Decoded::Value(total));
        }
    }
}

/// Decode a length prefix from an in-memory slice.
pub fn decode_slice(bytes: &[u8], max_length: usize) -> Result<Decoded> {
    let mut iter = bytes.iter().copied();
    decode_length(|| Ok(iter.next()), max_length)
}
