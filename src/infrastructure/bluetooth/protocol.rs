//! Peripheral Protocol
//!
//! Fixed identifiers, timing defaults and the single-byte value codec used
//! when talking to the peripheral.

use crate::domain::error::{SessionError, SessionResult};
use anyhow::{Context, Result};
use uuid::Uuid;

/// UUID carried in the peripheral's advertisements, used as the scan filter
pub const ADVERTISING_UUID: Uuid = Uuid::from_u128(0xc8bac71f_579e_4d69_b18e_83639e15e705);

/// Primary GATT service exposing the three characteristics below
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);

/// Level characteristic - read periodically by the poller
pub const READ_CHAR_UUID: Uuid = Uuid::from_u128(0xabcdef01_1234_5678_1234_56789abcdef0);

/// Percentage characteristic - single signed byte written by `send_percentage`
pub const PERCENTAGE_CHAR_UUID: Uuid = Uuid::from_u128(0xabcdef02_1234_5678_1234_56789abcdef0);

/// Switch characteristic - `1` for on, `0` for off
pub const SWITCH_CHAR_UUID: Uuid = Uuid::from_u128(0xabcdef03_1234_5678_1234_56789abcdef0);

/// Scan window in milliseconds
pub const SCAN_TIMEOUT_MS: u64 = 10_000;

/// Upper bound for a single in-flight GATT operation
pub const OPERATION_TIMEOUT_MS: u64 = 5_000;

/// Interval between reads of the level characteristic
pub const POLL_INTERVAL_MS: u64 = 3_000;

/// How a characteristic's payload should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicKind {
    /// Single byte interpreted as a percentage
    Percentage,
    /// Single byte interpreted as on/off
    Switch,
    /// Opaque bytes
    Raw,
}

/// Encode a percentage as one byte.
///
/// Values outside `0..=100` are not rejected; they are truncated to their
/// low byte, which the peripheral reads as a signed value.
pub fn encode_percentage(value: i32) -> [u8; 1] {
    [value as i8 as u8]
}

/// Decode the first byte of a payload as a signed percentage
pub fn decode_percentage(bytes: &[u8]) -> SessionResult<i8> {
    bytes
        .first()
        .map(|b| *b as i8)
        .ok_or(SessionError::EmptyPayload)
}

pub fn encode_switch(is_on: bool) -> [u8; 1] {
    [u8::from(is_on)]
}

/// Any nonzero first byte means on
pub fn decode_switch(bytes: &[u8]) -> SessionResult<bool> {
    bytes
        .first()
        .map(|b| *b != 0)
        .ok_or(SessionError::EmptyPayload)
}

/// Decode a payload according to its characteristic kind.
///
/// Returns `(percentage, switch)`. Raw payloads decode to neither, even when
/// empty; an empty percentage or switch payload is `EmptyPayload`.
pub fn decode_value(
    kind: CharacteristicKind,
    bytes: &[u8],
) -> SessionResult<(Option<i8>, Option<bool>)> {
    Ok(match kind {
        CharacteristicKind::Percentage => (Some(decode_percentage(bytes)?), None),
        CharacteristicKind::Switch => (None, Some(decode_switch(bytes)?)),
        CharacteristicKind::Raw => (None, None),
    })
}

/// Parse a UUID string from configuration
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim()).with_context(|| format!("Invalid UUID format: {uuid_str}"))
}
