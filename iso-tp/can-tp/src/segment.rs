//! Frame codec: between protocol segments and raw CAN frame payloads.
//!
//! The leading Protocol Control Information (PCI) nibble selects the segment kind:
//! `0x0` Single Frame, `0x1` First Frame, `0x2` Consecutive Frame, `0x3` Flow Control. With
//! extended addressing an address byte precedes the PCI, shifting it to byte offset 1.
//!
//! Two escape encodings from ISO 15765-2:2015 are supported:
//! - Single Frames longer than 7 bytes on CAN FD use `SF_DL = 0` plus an 8-bit length byte,
//! - First Frames announcing more than 4095 bytes use `FF_DL = 0` plus a 32-bit length.

use core::time::Duration;
use embedded_can::Frame;

use can_frame_io::Id;

/// Largest CAN payload the codec will produce (CAN FD).
pub const MAX_FRAME_LEN: usize = 64;

/// Largest PDU length expressible without the First Frame escape encoding.
pub const MAX_STD_PDU_LEN: usize = 4095;

/// Codec failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// PCI nibble/fields of a received frame do not form a valid segment.
    MalformedPci,
    /// Segment cannot be represented in the requested frame shape.
    PayloadTooLarge,
}

/// Flow control status nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Clear to send more consecutive frames.
    ClearToSend,
    /// Hold off and wait for another flow control.
    Wait,
    /// Abort, the receiver cannot take the announced payload.
    Overflow,
}

/// One ISO-TP segment as carried by a single CAN frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Complete PDU in one frame.
    Single {
        /// Payload length in bytes.
        len: u8,
        /// Payload bytes.
        data: &'a [u8],
    },
    /// Start of a segmented PDU.
    First {
        /// Total PDU length announced for the whole transfer.
        len: u32,
        /// Payload bytes carried by this frame.
        data: &'a [u8],
    },
    /// Continuation of a segmented PDU.
    Consecutive {
        /// Sequence number nibble (wraps mod 16).
        sn: u8,
        /// Payload bytes carried by this frame.
        data: &'a [u8],
    },
    /// Receiver feedback pacing the sender.
    FlowControl {
        /// Flow status from receiver to sender.
        status: FlowStatus,
        /// Block size granted (0 = unlimited).
        block_size: u8,
        /// STmin in raw encoded byte form (not a `Duration`).
        st_min: u8,
    },
}

/// Shape of the frames an endpoint puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    /// Optional addressing byte placed before the PCI (extended/mixed addressing).
    pub addr_byte: Option<u8>,
    /// Optional fill byte; when set, frames are padded to `frame_len`.
    pub padding: Option<u8>,
    /// CAN payload size: 8 for classic CAN, up to 64 for CAN FD.
    pub frame_len: usize,
}

impl WireFormat {
    /// Byte offset at which the PCI starts.
    pub fn pci_offset(&self) -> usize {
        usize::from(self.addr_byte.is_some())
    }
}

/// Encode a segment into a CAN frame with the given identifier and wire shape.
///
/// Fails with [`CodecError::PayloadTooLarge`] when the segment does not fit the frame; data is
/// never silently truncated.
pub fn encode_frame<F: Frame>(
    id: Id,
    segment: &Segment<'_>,
    wire: &WireFormat,
) -> Result<F, CodecError> {
    if !(8..=MAX_FRAME_LEN).contains(&wire.frame_len) {
        return Err(CodecError::PayloadTooLarge);
    }
    let mut buf = [0u8; MAX_FRAME_LEN];
    let offset = wire.pci_offset();
    if let Some(addr) = wire.addr_byte {
        buf[0] = addr;
    }

    let used = match segment {
        Segment::Single { len, data } => {
            let payload_len = *len as usize;
            if payload_len > data.len() {
                return Err(CodecError::PayloadTooLarge);
            }
            let classic_max = 7usize.saturating_sub(offset);
            if payload_len <= classic_max {
                buf[offset] = *len & 0x0F;
                let used = offset + 1 + payload_len;
                buf[offset + 1..used].copy_from_slice(&data[..payload_len]);
                used
            } else {
                // CAN FD escape: SF_DL nibble 0, 8-bit length in the next byte.
                if wire.frame_len <= 8 {
                    return Err(CodecError::PayloadTooLarge);
                }
                let used = offset + 2 + payload_len;
                if used > wire.frame_len {
                    return Err(CodecError::PayloadTooLarge);
                }
                buf[offset] = 0x00;
                buf[offset + 1] = payload_len as u8;
                buf[offset + 2..used].copy_from_slice(&data[..payload_len]);
                used
            }
        }
        Segment::First { len, data } => {
            let len = *len;
            if len == 0 || data.is_empty() {
                return Err(CodecError::PayloadTooLarge);
            }
            let header = first_frame_header_len(len);
            let capacity = wire.frame_len.saturating_sub(header + offset);
            if data.len() > capacity || (len as usize) <= data.len() {
                return Err(CodecError::PayloadTooLarge);
            }
            if len as usize <= MAX_STD_PDU_LEN {
                buf[offset] = 0x10 | ((len >> 8) as u8 & 0x0F);
                buf[offset + 1] = (len & 0xFF) as u8;
            } else {
                // Escape: FF_DL 0, 32-bit length follows.
                buf[offset] = 0x10;
                buf[offset + 1] = 0x00;
                buf[offset + 2..offset + 6].copy_from_slice(&len.to_be_bytes());
            }
            let used = offset + header + data.len();
            buf[offset + header..used].copy_from_slice(data);
            used
        }
        Segment::Consecutive { sn, data } => {
            if data.is_empty() || data.len() > wire.frame_len.saturating_sub(1 + offset) {
                return Err(CodecError::PayloadTooLarge);
            }
            buf[offset] = 0x20 | (*sn & 0x0F);
            let used = offset + 1 + data.len();
            buf[offset + 1..used].copy_from_slice(data);
            used
        }
        Segment::FlowControl {
            status,
            block_size,
            st_min,
        } => {
            let status_nibble = match status {
                FlowStatus::ClearToSend => 0x0,
                FlowStatus::Wait => 0x1,
                FlowStatus::Overflow => 0x2,
            };
            if offset + 3 > wire.frame_len {
                return Err(CodecError::PayloadTooLarge);
            }
            buf[offset] = 0x30 | status_nibble;
            buf[offset + 1] = *block_size;
            buf[offset + 2] = *st_min;
            offset + 3
        }
    };

    let used = if let Some(pad) = wire.padding {
        for b in buf[used..wire.frame_len].iter_mut() {
            *b = pad;
        }
        wire.frame_len
    } else {
        used
    };

    Frame::new(id, &buf[..used]).ok_or(CodecError::PayloadTooLarge)
}

/// Number of header bytes (after the addressing byte) used by a First Frame of total length `len`.
pub fn first_frame_header_len(len: u32) -> usize {
    if len as usize <= MAX_STD_PDU_LEN { 2 } else { 6 }
}

/// Decode raw CAN payload bytes into a segment view.
///
/// `pci_offset` is 0 for normal addressing or 1 when an addressing byte precedes the PCI; other
/// offsets are rejected.
pub fn decode_frame(data: &[u8], pci_offset: usize) -> Result<Segment<'_>, CodecError> {
    if pci_offset > 1 || data.len() <= pci_offset {
        return Err(CodecError::MalformedPci);
    }

    match data[pci_offset] >> 4 {
        0x0 => {
            let len = data[pci_offset] & 0x0F;
            if len == 0 && data.len() > 8 {
                // CAN FD escape length byte.
                if data.len() < pci_offset + 2 {
                    return Err(CodecError::MalformedPci);
                }
                let payload_len = data[pci_offset + 1] as usize;
                let start = pci_offset + 2;
                if data.len() < start + payload_len {
                    return Err(CodecError::MalformedPci);
                }
                Ok(Segment::Single {
                    len: payload_len as u8,
                    data: &data[start..start + payload_len],
                })
            } else {
                if len > 7 {
                    return Err(CodecError::MalformedPci);
                }
                let start = pci_offset + 1;
                if data.len() < start + len as usize {
                    return Err(CodecError::MalformedPci);
                }
                Ok(Segment::Single {
                    len,
                    data: &data[start..start + len as usize],
                })
            }
        }
        0x1 => {
            if data.len() < pci_offset + 2 {
                return Err(CodecError::MalformedPci);
            }
            let len12 = (((data[pci_offset] & 0x0F) as u32) << 8) | data[pci_offset + 1] as u32;
            if len12 == 0 {
                // Escape: 32-bit length for PDUs beyond 4095 bytes.
                if data.len() < pci_offset + 6 {
                    return Err(CodecError::MalformedPci);
                }
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[pci_offset + 2..pci_offset + 6]);
                let len = u32::from_be_bytes(raw);
                if len as usize <= MAX_STD_PDU_LEN {
                    return Err(CodecError::MalformedPci);
                }
                return Ok(Segment::First {
                    len,
                    data: &data[pci_offset + 6..],
                });
            }
            let max_sf = if data.len() > 8 {
                data.len().saturating_sub(2 + pci_offset)
            } else {
                7usize.saturating_sub(pci_offset)
            };
            if len12 as usize <= max_sf {
                return Err(CodecError::MalformedPci);
            }
            Ok(Segment::First {
                len: len12,
                data: &data[pci_offset + 2..],
            })
        }
        0x2 => {
            if data.len() < pci_offset + 2 {
                return Err(CodecError::MalformedPci);
            }
            Ok(Segment::Consecutive {
                sn: data[pci_offset] & 0x0F,
                data: &data[pci_offset + 1..],
            })
        }
        0x3 => {
            if data.len() < pci_offset + 3 {
                return Err(CodecError::MalformedPci);
            }
            let status = match data[pci_offset] & 0x0F {
                0x0 => FlowStatus::ClearToSend,
                0x1 => FlowStatus::Wait,
                0x2 => FlowStatus::Overflow,
                _ => return Err(CodecError::MalformedPci),
            };
            Ok(Segment::FlowControl {
                status,
                block_size: data[pci_offset + 1],
                st_min: data[pci_offset + 2],
            })
        }
        _ => Err(CodecError::MalformedPci),
    }
}

/// Convert a raw STmin byte to a duration, `None` for reserved values.
pub fn st_min_to_duration(raw: u8) -> Option<Duration> {
    match raw {
        0x00..=0x7F => Some(Duration::from_millis(raw as u64)),
        0xF1..=0xF9 => Some(Duration::from_micros((raw as u64 - 0xF0) * 100)),
        _ => None,
    }
}

/// Encode a duration as an STmin byte, clamping to the representable range.
pub fn duration_to_st_min(duration: Duration) -> u8 {
    let micros = duration.as_micros();
    if micros == 0 {
        return 0;
    }
    if (100..=900).contains(&micros) && micros % 100 == 0 {
        return 0xF0 + (micros / 100) as u8;
    }
    let millis = duration.as_millis();
    if millis <= 0x7F { millis as u8 } else { 0x7F }
}
