//! Parsing of register seed maps.
//!
//! Seeds come from two places: the `registers` section of the configuration and
//! the persisted snapshot. Both are JSON objects mapping an address to a value:
//!
//! ```json
//! { "0x10": "0x00FF", "17": 300, "0b10010": 1 }
//! ```
//!
//! Addresses may be written in decimal or with a `0x`, `0o` or `0b` prefix. Word
//! values are integers `0..=65535` or `0x` strings with one to four hex digits;
//! bit values are booleans or integers (zero is off, anything else is on).
//!
//! The configuration is parsed leniently: a malformed entry is logged and
//! skipped. Snapshots are parsed strictly: the first malformed entry is an error.

use log::error;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::protocol::RegisterKind;

/// Address to value mapping as it appears in JSON
pub type RawRegisterMap = BTreeMap<String, Value>;

/// How malformed entries are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    /// Log and skip malformed entries
    Lenient,
    /// Fail on the first malformed entry
    Strict,
}

/// A malformed seed entry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} entry {key:?}: {reason}")]
pub struct SeedError {
    pub kind: RegisterKind,
    pub key: String,
    pub reason: String,
}

/// Parse an address key, accepting decimal and `0x`/`0o`/`0b` prefixed forms
pub fn parse_address(key: &str) -> Result<u16, String> {
    let text = key.trim();
    let lower = text.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (rest, 8)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else {
        if lower.len() > 1 && lower.starts_with('0') {
            return Err(format!("ambiguous leading zero in address {:?}", key));
        }
        (lower.as_str(), 10)
    };

    if digits.is_empty() || digits.starts_with('+') {
        return Err(format!("invalid address {:?}", key));
    }
    u16::from_str_radix(digits, radix).map_err(|e| format!("invalid address {:?}: {}", key, e))
}

/// Parse a 16-bit register value
pub fn parse_word(value: &Value) -> Result<u16, String> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| format!("value {} is outside 0..=65535", number)),
        Value::String(text) => {
            let digits = text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
                .ok_or_else(|| format!("string value {:?} must be a 0x hex literal", text))?;
            if digits.is_empty() || digits.len() > 4 {
                return Err(format!("hex value {:?} must have 1 to 4 digits", text));
            }
            u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value {:?}: {}", text, e))
        }
        other => Err(format!("unsupported register value {}", other)),
    }
}

/// Parse a single bit value
pub fn parse_bit(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(bit) => Ok(*bit),
        Value::Number(number) => {
            if let Some(n) = number.as_u64() {
                Ok(n != 0)
            } else if let Some(n) = number.as_i64() {
                Ok(n != 0)
            } else {
                Err(format!("bit value {} must be a boolean or an integer", number))
            }
        }
        other => Err(format!("unsupported bit value {}", other)),
    }
}

fn prepare<T>(
    kind: RegisterKind,
    raw: &RawRegisterMap,
    mode: SeedMode,
    parse_value: fn(&Value) -> Result<T, String>,
) -> Result<BTreeMap<u16, T>, SeedError> {
    let mut prepared = BTreeMap::new();
    for (key, value) in raw {
        let entry = parse_address(key).and_then(|address| parse_value(value).map(|v| (address, v)));
        match entry {
            Ok((address, value)) => {
                prepared.insert(address, value);
            }
            Err(reason) => {
                let err = SeedError {
                    kind,
                    key: key.clone(),
                    reason,
                };
                match mode {
                    SeedMode::Strict => return Err(err),
                    SeedMode::Lenient => error!("Skipping register entry: {}", err),
                }
            }
        }
    }
    Ok(prepared)
}

/// Prepare a bit bank seed (discrete inputs, coils)
pub fn prepare_bits(
    kind: RegisterKind,
    raw: &RawRegisterMap,
    mode: SeedMode,
) -> Result<BTreeMap<u16, bool>, SeedError> {
    prepare(kind, raw, mode, parse_bit)
}

/// Prepare a word bank seed (holding and input registers)
pub fn prepare_words(
    kind: RegisterKind,
    raw: &RawRegisterMap,
    mode: SeedMode,
) -> Result<BTreeMap<u16, u16>, SeedError> {
    prepare(kind, raw, mode, parse_word)
}
