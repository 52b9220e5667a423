//! Fixed-width decimal fields.
//!
//! A field is six bytes: the value's decimal digits right-aligned, with unused
//! leading positions holding the pad marker instead of `'0'`. Zero is therefore
//! `*****0` and never an empty field.

use bytes::BufMut;

use super::WireError;
use crate::protocol::{UFT_FIELD_MAX, UFT_FIELD_WIDTH, UFT_PAD_MARKER};

/// Renders `value` as a six-byte field.
pub fn encode(value: u32) -> Result<[u8; UFT_FIELD_WIDTH], WireError> {
    if value > UFT_FIELD_MAX {
        return Err(WireError::FieldOverflow(u64::from(value)));
    }
    let mut field = [UFT_PAD_MARKER; UFT_FIELD_WIDTH];
    let mut rest = value;
    for slot in field.iter_mut().rev() {
        *slot = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    Ok(field)
}

/// Appends the six-byte rendering of `value` to `out`.
pub fn put(out: &mut impl BufMut, value: u32) -> Result<(), WireError> {
    out.put_slice(&encode(value)?);
    Ok(())
}

/// Parses a six-byte field: leading pad markers, then at least one digit.
pub fn decode(field: &[u8]) -> Result<u32, WireError> {
    if field.len() != UFT_FIELD_WIDTH {
        return Err(WireError::Truncated {
            needed: UFT_FIELD_WIDTH,
            available: field.len(),
        });
    }
    let digits_from = field
        .iter()
        .position(|&b| b != UFT_PAD_MARKER)
        .ok_or(WireError::EmptyField)?;

    let mut value = 0u32;
    let mut scale = 1u32;
    for &byte in field[digits_from..].iter().rev() {
        if !byte.is_ascii_digit() {
            return Err(WireError::BadDigit(byte));
        }
        value += u32::from(byte - b'0') * scale;
        scale *= 10;
    }
    Ok(value)
}
