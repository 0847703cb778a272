//! Helpers for ISO-TP addressing modes.
//!
//! ISO-TP addressing comes in several shapes: plain CAN-id pairs ("normal"), an extra addressing
//! byte in the payload ("extended" / "mixed"), and the 29-bit "normal fixed" scheme where target
//! and source node addresses are packed into the identifier itself (`0x18DA_TA_SA` physical,
//! `0x18DB_TA_SA` functional). The [`fixed29`] module covers the packed scheme and its acceptance
//! filters; the structs here describe a single endpoint's addressing in expanded form.

use can_frame_io::{ExtendedId, Id};

use crate::config::TpConfig;
use crate::errors::{ProtocolError, TpError};

/// Address type used in 29-bit fixed/mixed addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAddressType {
    /// 1-to-1 communication (physical addressing).
    Physical,
    /// 1-to-n communication (functional addressing).
    Functional,
}

/// Addressing parameters for a single ISO-TP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpAddress {
    /// Transmit CAN identifier.
    pub tx_id: Id,
    /// Receive CAN identifier.
    pub rx_id: Id,
    /// Optional transmit addressing byte.
    pub tx_addr: Option<u8>,
    /// Optional receive addressing byte.
    pub rx_addr: Option<u8>,
}

fn ext_id(raw: u32) -> Result<Id, ProtocolError> {
    ExtendedId::new(raw)
        .map(Id::Extended)
        .ok_or(TpError::InvalidConfig)
}

impl TpAddress {
    /// Normal addressing with explicit Tx/Rx IDs.
    pub fn normal(tx_id: Id, rx_id: Id) -> Self {
        Self {
            tx_id,
            rx_id,
            tx_addr: None,
            rx_addr: None,
        }
    }

    /// Extended addressing: a target address byte is sent, a source address byte expected.
    pub fn extended(tx_id: Id, rx_id: Id, target_address: u8, source_address: u8) -> Self {
        Self {
            tx_id,
            rx_id,
            tx_addr: Some(target_address),
            rx_addr: Some(source_address),
        }
    }

    /// Mixed 11-bit addressing: one address extension byte shared by both directions.
    pub fn mixed_11(tx_id: Id, rx_id: Id, address_extension: u8) -> Self {
        Self {
            tx_id,
            rx_id,
            tx_addr: Some(address_extension),
            rx_addr: Some(address_extension),
        }
    }

    /// Normal fixed 29-bit addressing (`0x18DA_TA_SA` / `0x18DB_TA_SA`).
    pub fn normal_fixed_29(
        source_address: u8,
        target_address: u8,
        target_type: TargetAddressType,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            tx_id: ext_id(fixed29::encode_id_raw(
                target_type,
                target_address,
                source_address,
            ))?,
            rx_id: ext_id(fixed29::encode_id_raw(
                target_type,
                source_address,
                target_address,
            ))?,
            tx_addr: None,
            rx_addr: None,
        })
    }

    /// Mixed 29-bit addressing: fixed CAN IDs plus an address extension byte.
    pub fn mixed_29(
        source_address: u8,
        target_address: u8,
        address_extension: u8,
        target_type: TargetAddressType,
    ) -> Result<Self, ProtocolError> {
        let base = match target_type {
            TargetAddressType::Physical => 0x18CE_0000,
            TargetAddressType::Functional => 0x18CD_0000,
        };
        Ok(Self {
            tx_id: ext_id(base | ((target_address as u32) << 8) | source_address as u32)?,
            rx_id: ext_id(base | ((source_address as u32) << 8) | target_address as u32)?,
            tx_addr: Some(address_extension),
            rx_addr: Some(address_extension),
        })
    }
}

impl From<TpAddress> for TpConfig {
    fn from(value: TpAddress) -> Self {
        Self {
            tx_id: value.tx_id,
            rx_id: value.rx_id,
            tx_addr: value.tx_addr,
            rx_addr: value.rx_addr,
            ..TpConfig::default()
        }
    }
}

/// 29-bit "normal fixed" addressing: node addresses packed into the identifier.
pub mod fixed29 {
    use can_frame_io::{ExtendedId, Id, IdMask, IdMaskFilter};

    use super::TargetAddressType;

    /// Physical addressing base (`0x18DA_TA_SA`).
    pub const PHYS_BASE: u32 = 0x18DA_0000;
    /// Functional addressing base (`0x18DB_TA_SA`).
    pub const FUNC_BASE: u32 = 0x18DB_0000;
    /// Mask matching the fixed base bits.
    pub const BASE_MASK: u32 = 0x1FFF_0000;
    /// Mask matching base plus target address, ignoring the source ("all senders to me").
    pub const TARGET_MASK: u32 = 0x1FFF_FF00;

    /// Parsed 29-bit fixed-addressing identifier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Fixed29Id {
        /// Physical or functional addressing.
        pub kind: TargetAddressType,
        /// Target node address (`TA`).
        pub target: u8,
        /// Source node address (`SA`).
        pub source: u8,
    }

    /// Encode a fixed-addressing identifier as a raw 29-bit value.
    #[inline]
    pub const fn encode_id_raw(kind: TargetAddressType, target: u8, source: u8) -> u32 {
        let base = match kind {
            TargetAddressType::Physical => PHYS_BASE,
            TargetAddressType::Functional => FUNC_BASE,
        };
        base | ((target as u32) << 8) | (source as u32)
    }

    /// Encode a physical-addressing identifier (`0x18DA_TA_SA`).
    #[inline]
    pub fn encode_phys_id(target: u8, source: u8) -> Id {
        let raw = encode_id_raw(TargetAddressType::Physical, target, source);
        Id::Extended(ExtendedId::new(raw).expect("fixed 29-bit id fits in 29 bits"))
    }

    /// Encode a functional-addressing identifier (`0x18DB_TA_SA`).
    #[inline]
    pub fn encode_func_id(target: u8, source: u8) -> Id {
        let raw = encode_id_raw(TargetAddressType::Functional, target, source);
        Id::Extended(ExtendedId::new(raw).expect("fixed 29-bit id fits in 29 bits"))
    }

    /// Decode an identifier of the form `0x18DA_TA_SA` / `0x18DB_TA_SA`.
    pub fn decode_id(id: Id) -> Option<Fixed29Id> {
        let raw = match id {
            Id::Extended(ext) => ext.as_raw(),
            Id::Standard(_) => return None,
        };
        let kind = match raw & BASE_MASK {
            PHYS_BASE => TargetAddressType::Physical,
            FUNC_BASE => TargetAddressType::Functional,
            _ => return None,
        };
        Some(Fixed29Id {
            kind,
            target: ((raw >> 8) & 0xFF) as u8,
            source: (raw & 0xFF) as u8,
        })
    }

    /// Acceptance filter matching all physical frames addressed to `target`.
    pub fn filter_phys_for_target(target: u8) -> IdMaskFilter {
        IdMaskFilter {
            id: Id::Extended(
                ExtendedId::new(PHYS_BASE | ((target as u32) << 8)).expect("fits in 29 bits"),
            ),
            mask: IdMask::Extended(TARGET_MASK),
        }
    }

    /// Acceptance filter matching all functional frames addressed to `target`.
    pub fn filter_func_for_target(target: u8) -> IdMaskFilter {
        IdMaskFilter {
            id: Id::Extended(
                ExtendedId::new(FUNC_BASE | ((target as u32) << 8)).expect("fits in 29 bits"),
            ),
            mask: IdMask::Extended(TARGET_MASK),
        }
    }

    /// Filter set for a node: physical frames to `local`, optionally functional frames to
    /// `functional`.
    #[derive(Debug, Clone, Copy)]
    pub struct AcceptanceFilters {
        filters: [IdMaskFilter; 2],
        len: usize,
    }

    impl AcceptanceFilters {
        /// The active filters.
        pub fn as_slice(&self) -> &[IdMaskFilter] {
            &self.filters[..self.len]
        }
    }

    /// Build the acceptance filters for a node address and optional functional address.
    pub fn filters_for_targets(local: u8, functional: Option<u8>) -> AcceptanceFilters {
        let phys = filter_phys_for_target(local);
        match functional {
            Some(func) => AcceptanceFilters {
                filters: [phys, filter_func_for_target(func)],
                len: 2,
            },
            None => AcceptanceFilters {
                filters: [phys, phys],
                len: 1,
            },
        }
    }
}
