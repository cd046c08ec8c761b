//! Conversions between the node's hex quantities and decimal display values.
//!
//! Amounts are carried as `u128` wei; 18 decimals make one ether.

use crate::error::{NodeError, Result};
use serde_json::Value;

/// Number of decimal places between wei and ether.
pub const ETHER_DECIMALS: usize = 18;

const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;

/// Parse a `0x`-prefixed hex quantity.
///
/// `"0x"` is read as zero.
pub fn parse_hex(text: &str) -> Result<u128> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .ok_or_else(|| NodeError::validation("quantity", format!("not a hex quantity: {}", text)))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| NodeError::validation("quantity", format!("{}: {}", text, e)))
}

/// Read a JSON quantity, either a hex string or a plain number.
pub fn quantity(value: &Value) -> Result<u128> {
    match value {
        Value::String(text) => parse_hex(text),
        Value::Number(n) => n
            .as_u64()
            .map(u128::from)
            .ok_or_else(|| NodeError::validation("quantity", format!("not an unsigned integer: {}", n))),
        other => Err(NodeError::validation(
            "quantity",
            format!("expected hex string, got {}", other),
        )),
    }
}

/// Read a JSON quantity that must fit in 64 bits.
pub fn quantity_u64(value: &Value) -> Result<u64> {
    let wide = quantity(value)?;
    u64::try_from(wide).map_err(|_| NodeError::validation("quantity", format!("{} overflows u64", wide)))
}

/// Format a wei amount as a decimal ether string with trailing zeros trimmed.
pub fn wei_to_ether(wei: u128) -> String {
    let whole = wei / WEI_PER_ETHER;
    let fraction = wei % WEI_PER_ETHER;
    if fraction == 0 {
        return whole.to_string();
    }
    let digits = format!("{:0width$}", fraction, width = ETHER_DECIMALS);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

/// Parse a decimal ether amount (e.g. `"1.25"`) into wei.
pub fn ether_to_wei(text: &str) -> Result<u128> {
    let text = text.trim();
    let (whole, fraction) = match text.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (text, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(NodeError::validation("value", "empty amount"));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(NodeError::validation("value", format!("not a decimal amount: {}", text)));
    }
    if fraction.len() > ETHER_DECIMALS {
        return Err(NodeError::validation(
            "value",
            format!("more than {} decimal places: {}", ETHER_DECIMALS, text),
        ));
    }

    let overflow = || NodeError::validation("value", format!("amount too large: {}", text));
    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };
    let padded = format!("{:0<width$}", fraction, width = ETHER_DECIMALS);
    let fraction: u128 = padded.parse().map_err(|_| overflow())?;

    whole
        .checked_mul(WEI_PER_ETHER)
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(overflow)
}

/// Encode a number as a `0x`-prefixed hex quantity.
pub fn to_hex(value: u128) -> String {
    format!("0x{:x}", value)
}

/// Convert a decimal integer string to a hex quantity.
pub fn decimal_to_hex(text: &str) -> Result<String> {
    let value: u128 = text
        .trim()
        .parse()
        .map_err(|_| NodeError::validation("quantity", format!("not a decimal integer: {}", text)))?;
    Ok(to_hex(value))
}

/// Convert a decimal ether amount to a hex wei quantity.
pub fn ether_to_hex_wei(text: &str) -> Result<String> {
    ether_to_wei(text).map(to_hex)
}

/// Ensure a data payload carries the `0x` prefix.
pub fn hex_prefixed(data: &str) -> String {
    if data.starts_with("0x") || data.starts_with("0X") {
        data.to_string()
    } else {
        format!("0x{}", data)
    }
}
