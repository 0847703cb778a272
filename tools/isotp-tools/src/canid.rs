//! CAN identifier parsing and display in the classic tool notation.
//!
//! Identifiers are given in hex; writing 8 (or more) digits selects a 29-bit extended
//! identifier, shorter spellings an 11-bit standard one.

use can_frame_io::{ExtendedId, Id, StandardId};

/// Parse a CAN id in hex; more than 7 digits selects an extended (29-bit) identifier.
pub fn parse_can_id(s: &str) -> Result<Id, String> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let raw = u32::from_str_radix(digits, 16).map_err(|_| format!("invalid CAN id '{s}'"))?;
    if s.len() > 7 {
        ExtendedId::new(raw)
            .map(Id::Extended)
            .ok_or_else(|| format!("extended CAN id '{s}' exceeds 29 bits"))
    } else {
        StandardId::new(raw as u16)
            .map(Id::Standard)
            .ok_or_else(|| {
                format!("CAN id '{s}' exceeds 11 bits; use 8 digits for extended IDs")
            })
    }
}

/// Render an id the way the dump tools print it: `%3X` standard, `%8X` extended.
pub fn fmt_can_id(id: Id) -> String {
    match id {
        Id::Standard(id) => format!("{:3X}", id.as_raw()),
        Id::Extended(id) => format!("{:8X}", id.as_raw()),
    }
}

/// Raw identifier value without the width tag.
pub fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => u32::from(id.as_raw()),
        Id::Extended(id) => id.as_raw(),
    }
}
