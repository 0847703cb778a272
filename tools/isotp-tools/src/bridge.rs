//! TCP bridge framing: PDUs travel as `<HEXSTRING>` with no separators.
//!
//! Inbound TCP bytes are scanned for `<...>` brackets; the hex digits between them become one
//! PDU. Outbound PDUs are serialized as `<HEX>` (uppercase) followed by a newline. Anything that
//! is not a well-formed bracket sequence is discarded byte by byte, so a bridge peer can
//! interleave junk or line endings without desynchronizing the stream.

use crate::hex::{parse_hex_compact, to_hex_compact};

/// Incremental scanner for `<HEXSTRING>` framed PDUs in a TCP byte stream.
pub struct PduScanner {
    buf: Vec<u8>,
    in_frame: bool,
    max_pdu_len: usize,
}

impl PduScanner {
    /// Scanner accepting PDUs up to `max_pdu_len` bytes.
    pub fn new(max_pdu_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            in_frame: false,
            max_pdu_len,
        }
    }

    /// Feed one byte; returns a decoded PDU when a complete, valid frame closes.
    ///
    /// Invalid frames (odd digit count, non-hex characters, empty, oversized) are dropped
    /// silently and scanning resumes at the next `<`.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if !self.in_frame {
            if byte == b'<' {
                self.in_frame = true;
                self.buf.clear();
            }
            return None;
        }

        if byte == b'>' {
            self.in_frame = false;
            if self.buf.is_empty() {
                return None;
            }
            let text = core::str::from_utf8(&self.buf).ok()?;
            return parse_hex_compact(text).ok();
        }

        if byte == b'<' {
            // Restart on a stray opening bracket.
            self.buf.clear();
            return None;
        }

        if self.buf.len() >= self.max_pdu_len * 2 {
            // Frame overruns the limit; drop it and wait for the next opener.
            self.in_frame = false;
            self.buf.clear();
            return None;
        }

        self.buf.push(byte);
        None
    }

    /// Feed a chunk of bytes; returns every PDU completed within it.
    pub fn push_slice(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|b| self.push(*b)).collect()
    }
}

/// Serialize one PDU for the TCP side: `<HEX>` plus a trailing newline.
pub fn encode_bridge_pdu(pdu: &[u8]) -> String {
    format!("<{}>\n", to_hex_compact(pdu))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_framed_pdu() {
        let mut scanner = PduScanner::new(4095);
        let got = scanner.push_slice(b"<112233>");
        assert_eq!(got, vec![vec![0x11, 0x22, 0x33]]);
    }

    #[test]
    fn ignores_junk_between_frames() {
        let mut scanner = PduScanner::new(4095);
        let got = scanner.push_slice(b"noise\r\n<AABB>\n garbage <CC>");
        assert_eq!(got, vec![vec![0xAA, 0xBB], vec![0xCC]]);
    }

    #[test]
    fn drops_malformed_frames() {
        let mut scanner = PduScanner::new(4095);
        assert!(scanner.push_slice(b"<123>").is_empty());
        assert!(scanner.push_slice(b"<>").is_empty());
        assert!(scanner.push_slice(b"<zz>").is_empty());
        // Still synchronized afterwards.
        assert_eq!(scanner.push_slice(b"<44>"), vec![vec![0x44]]);
    }

    #[test]
    fn restart_on_nested_opener() {
        let mut scanner = PduScanner::new(4095);
        assert_eq!(scanner.push_slice(b"<11<2233>"), vec![vec![0x22, 0x33]]);
    }

    #[test]
    fn oversized_frame_is_discarded() {
        let mut scanner = PduScanner::new(2);
        assert!(scanner.push_slice(b"<AABBCCDD>").is_empty());
        assert_eq!(scanner.push_slice(b"<EE>"), vec![vec![0xEE]]);
    }

    #[test]
    fn encodes_compact_uppercase() {
        assert_eq!(encode_bridge_pdu(&[0x44, 0x55, 0x66]), "<445566>\n");
    }
}
