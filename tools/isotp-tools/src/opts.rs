//! Parsers for the composite option syntax shared by the tools.

use core::time::Duration;

use can_tp::PaddingCheck;

/// Extended addressing bytes: `-x <addr>[:<rxaddr>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtAddrPair {
    /// Addressing byte put into transmitted frames.
    pub tx: u8,
    /// Separate addressing byte expected on received frames, when given.
    pub rx: Option<u8>,
}

/// Parse `addr[:rxaddr]` (hex bytes).
pub fn parse_ext_addr(s: &str) -> Result<ExtAddrPair, String> {
    let err = || format!("incorrect extended addr values '{s}'");
    match s.split_once(':') {
        None => Ok(ExtAddrPair {
            tx: parse_hex_u8(s).map_err(|_| err())?,
            rx: None,
        }),
        Some((tx, rx)) => Ok(ExtAddrPair {
            tx: parse_hex_u8(tx).map_err(|_| err())?,
            rx: Some(parse_hex_u8(rx).map_err(|_| err())?),
        }),
    }
}

/// Padding bytes: `-p [tx]:[rx]`, where `"AA"`, `"AA:BB"` and `":BB"` are all valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaddingPair {
    /// Fill byte for transmitted frames.
    pub tx: Option<u8>,
    /// Expected fill byte on received frames.
    pub rx: Option<u8>,
}

/// Parse `[tx]:[rx]` padding bytes (hex).
pub fn parse_padding(s: &str) -> Result<PaddingPair, String> {
    let err = || format!("incorrect padding values '{s}'");
    match s.split_once(':') {
        None => Ok(PaddingPair {
            tx: Some(parse_hex_u8(s).map_err(|_| err())?),
            rx: None,
        }),
        Some(("", rx)) => Ok(PaddingPair {
            tx: None,
            rx: Some(parse_hex_u8(rx).map_err(|_| err())?),
        }),
        Some((tx, rx)) => Ok(PaddingPair {
            tx: Some(parse_hex_u8(tx).map_err(|_| err())?),
            rx: Some(parse_hex_u8(rx).map_err(|_| err())?),
        }),
    }
}

/// Parse the `-P` rx padding check mode: `l`ength, `c`ontent or `a`ll.
pub fn parse_pad_check(s: &str) -> Result<PaddingCheck, String> {
    match s.chars().next() {
        Some('l') => Ok(PaddingCheck::Length),
        Some('c') => Ok(PaddingCheck::Content),
        Some('a') => Ok(PaddingCheck::All),
        _ => Err(format!("unknown padding check option '{s}'")),
    }
}

/// CAN FD link layer options: `-L <mtu>:<tx_dl>:<tx_flags>` (decimal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLayerOpts {
    /// Link MTU (16 classic, 72 CAN FD in the kernel notation; informational here).
    pub mtu: u8,
    /// Transmit data length: CAN payload size 8..=64.
    pub tx_dl: u8,
    /// Transmit flags (e.g. bit rate switch), passed through to the backend.
    pub tx_flags: u8,
}

/// Parse `mtu:tx_dl:tx_flags`.
pub fn parse_link_layer(s: &str) -> Result<LinkLayerOpts, String> {
    let err = || format!("unknown link layer options '{s}'");
    let mut parts = s.split(':');
    let mtu = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
    let tx_dl = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
    let tx_flags = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
    if parts.next().is_some() {
        return Err(err());
    }
    Ok(LinkLayerOpts {
        mtu,
        tx_dl,
        tx_flags,
    })
}

/// Parse a hex byte value (used by `-b`, `-m`, `-w`, address bytes).
pub fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16)
        .map(|v| (v & 0xFF) as u8)
        .map_err(|_| format!("invalid hex value '{s}'"))
}

/// Parse a nanosecond count (decimal) into a `Duration` (used by `-t` and `-f`).
pub fn parse_nanos(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_nanos)
        .map_err(|_| format!("invalid nanosecond value '{s}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext_addr_forms() {
        assert_eq!(
            parse_ext_addr("AA").unwrap(),
            ExtAddrPair { tx: 0xAA, rx: None }
        );
        assert_eq!(
            parse_ext_addr("AA:55").unwrap(),
            ExtAddrPair {
                tx: 0xAA,
                rx: Some(0x55)
            }
        );
        assert!(parse_ext_addr("AA:").is_err());
    }

    #[test]
    fn padding_forms() {
        assert_eq!(
            parse_padding("CC").unwrap(),
            PaddingPair {
                tx: Some(0xCC),
                rx: None
            }
        );
        assert_eq!(
            parse_padding("CC:DD").unwrap(),
            PaddingPair {
                tx: Some(0xCC),
                rx: Some(0xDD)
            }
        );
        assert_eq!(
            parse_padding(":DD").unwrap(),
            PaddingPair {
                tx: None,
                rx: Some(0xDD)
            }
        );
        assert!(parse_padding("GG").is_err());
    }

    #[test]
    fn pad_check_modes() {
        assert_eq!(parse_pad_check("l").unwrap(), PaddingCheck::Length);
        assert_eq!(parse_pad_check("c").unwrap(), PaddingCheck::Content);
        assert_eq!(parse_pad_check("a").unwrap(), PaddingCheck::All);
        assert!(parse_pad_check("x").is_err());
    }

    #[test]
    fn link_layer_triplet() {
        assert_eq!(
            parse_link_layer("72:64:1").unwrap(),
            LinkLayerOpts {
                mtu: 72,
                tx_dl: 64,
                tx_flags: 1
            }
        );
        assert!(parse_link_layer("72:64").is_err());
        assert!(parse_link_layer("72:64:1:9").is_err());
    }
}
