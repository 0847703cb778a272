//! The textual payload format used on stdin/stdout: ASCII hex bytes.

use std::io::{self, Write};

/// Parse whitespace-separated ASCII hex byte values (`"11 22 33"`).
///
/// Values wider than one byte are taken modulo 256, matching `scanf("%hhx")` semantics; parsing
/// stops with an error on the first non-hex token.
pub fn parse_hex_bytes(input: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    for token in input.split_whitespace() {
        let value = u32::from_str_radix(token, 16)
            .map_err(|_| format!("invalid hex byte '{token}'"))?;
        out.push((value & 0xFF) as u8);
    }
    Ok(out)
}

/// Write one PDU as space-separated uppercase hex byte pairs followed by a newline.
///
/// Every byte is printed as `%02X ` (trailing separator included), exactly the normalized form a
/// receiver echoes regardless of how compact any bridged input was.
pub fn write_hex_line<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    for b in bytes {
        write!(writer, "{b:02X} ")?;
    }
    writeln!(writer)
}

/// Render bytes as compact uppercase hex with no separators (`"112233"`).
pub fn to_hex_compact(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

/// Parse compact hex (`"112233"`, case-insensitive) into bytes; requires an even digit count.
pub fn parse_hex_compact(input: &str) -> Result<Vec<u8>, String> {
    if input.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let token = core::str::from_utf8(pair).map_err(|_| "non-ASCII input".to_string())?;
        let value =
            u8::from_str_radix(token, 16).map_err(|_| format!("invalid hex pair '{token}'"))?;
        out.push(value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spaced_hex() {
        assert_eq!(parse_hex_bytes("11 22 33").unwrap(), vec![0x11, 0x22, 0x33]);
        assert_eq!(parse_hex_bytes("  a B\n0f\t").unwrap(), vec![0x0A, 0x0B, 0x0F]);
        assert_eq!(parse_hex_bytes("").unwrap(), Vec::<u8>::new());
        // scanf %hhx semantics: wide values wrap to one byte.
        assert_eq!(parse_hex_bytes("1FF").unwrap(), vec![0xFF]);
        assert!(parse_hex_bytes("xy").is_err());
    }

    #[test]
    fn writes_normalized_form() {
        let mut out = Vec::new();
        write_hex_line(&mut out, &[0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(out, b"AA BB CC \n");

        let mut empty = Vec::new();
        write_hex_line(&mut empty, &[]).unwrap();
        assert_eq!(empty, b"\n");
    }

    #[test]
    fn compact_roundtrip() {
        assert_eq!(to_hex_compact(&[0x11, 0x22, 0x33]), "112233");
        assert_eq!(parse_hex_compact("112233").unwrap(), vec![0x11, 0x22, 0x33]);
        assert_eq!(parse_hex_compact("a0ff").unwrap(), vec![0xA0, 0xFF]);
        assert!(parse_hex_compact("123").is_err());
        assert!(parse_hex_compact("zz").is_err());
    }
}
