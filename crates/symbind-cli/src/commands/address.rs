//! Address parsing for command arguments.

use anyhow::{Result, anyhow};

/// Parse a hex address (with or without `0x`). A leading `+` makes it relative to `base`.
pub fn parse_address(s: &str, base: u64) -> Result<u64> {
    let (relative, digits) = match s.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let digits = digits.trim_start_matches("0x").trim_start_matches("0X");
    let value =
        u64::from_str_radix(digits, 16).map_err(|e| anyhow!("Invalid hex address '{}': {}", s, e))?;

    if relative {
        base.checked_add(value)
            .ok_or_else(|| anyhow!("Address {} overflows from base {:#x}", s, base))
    } else {
        Ok(value)
    }
}
