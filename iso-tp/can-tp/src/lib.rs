//! `can-tp`: an ISO-TP (ISO 15765-2) transport layer for classic CAN and CAN FD.
//!
//! ISO-TP carries application payloads larger than one CAN frame by segmenting them into:
//! - a **Single Frame** (small payloads),
//! - a **First Frame** plus **Consecutive Frames** (larger payloads), and
//! - **Flow Control** frames pacing and batching the consecutive stream.
//!
//! This crate provides:
//! - [`TpNode`]: a poll-driven endpoint for one fixed address pair, with blocking conveniences.
//! - [`SessionMux`]: a multi-peer session table for 29-bit fixed addressing, multiplexing
//!   concurrent transfers by remote node address.
//! - The building blocks underneath: the segment codec ([`segment`]), the transmit and receive
//!   state machines ([`tx`], [`rx`]), deadline bookkeeping ([`timer`]) and addressing helpers
//!   ([`address`]).
//!
//! The public API works in `no_std` environments; allocation is optional (receive-side
//! reassembly always needs an explicit buffer, borrowed or owned).
//!
//! # Concepts
//! - **Addressing**: "normal" addressing uses plain CAN-id pairs; extended/mixed modes insert an
//!   addressing byte before the PCI, modelled by [`TpConfig::tx_addr`] / [`TpConfig::rx_addr`]
//!   and the helpers in [`address`]. The 29-bit "normal fixed" scheme packs node addresses into
//!   the identifier ([`address::fixed29`]).
//! - **Deadlines**: every protocol timer (N_Bs, N_Cr, the STmin gap, ...) is a monotonic instant
//!   checked during polling; the engine never sleeps on its own.
//! - **Progress**: the non-blocking API reports a [`Progress`] after each step; poll until
//!   [`Progress::Completed`].
//!
//! # Quick start
//! ```rust,ignore
//! use core::time::Duration;
//! use can_tp::{RxStorage, TpConfig, TpNode};
//! use can_frame_io::SplitTxRx;
//!
//! let (tx, rx) = driver.split();
//! let mut node = TpNode::with_std_clock(tx, rx, cfg, RxStorage::Owned(vec![0u8; 4095]))?;
//!
//! node.send(b"hello", Duration::from_millis(500))?;
//!
//! let mut out = Vec::new();
//! node.recv(Duration::from_millis(500), &mut |data| out = data.to_vec())?;
//! ```
//!
//! This crate ships no CAN driver. Backends implement the `can-frame-io` traits; the workspace
//! includes a SocketCAN backend and an in-memory mock bus for tests.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(any(feature = "alloc", feature = "std"))]
extern crate alloc;

pub mod address;
pub mod config;
pub mod errors;
pub mod node;
pub mod rx;
pub mod segment;
pub mod session;
pub mod timer;
pub mod tx;

pub use address::{TargetAddressType, TpAddress};
pub use config::{PaddingCheck, RxFlowControl, TpConfig};
pub use errors::{ProtocolError, TimeoutKind, TpError};
pub use node::TpNode;
pub use rx::{Receiver, RxOutcome, RxState, RxStorage};
pub use segment::{
    CodecError, FlowStatus, MAX_FRAME_LEN, MAX_STD_PDU_LEN, Segment, decode_frame,
    duration_to_st_min, encode_frame, st_min_to_duration,
};
pub use session::{SessionMux, rx_storages_from_buffers};
pub use timer::Clock;
#[cfg(feature = "std")]
pub use timer::StdClock;
pub use tx::{FcFrame, Progress, Sender};

/// Alias for the CAN identifier type used throughout this crate.
pub type CanId = can_frame_io::Id;
