//! Frame-level CAN I/O traits shared by all `cantp` backends.
//!
//! `embedded-can` standardizes the *frame* (id + payload) but not how frames move: every driver
//! grows its own mix of blocking reads, timeouts and non-blocking polls. This crate pins down the
//! small surface the transport layer actually needs:
//! - [`TxFrameIo`] / [`RxFrameIo`]: send/receive one frame, in blocking, non-blocking and
//!   timeout-bounded flavors,
//! - [`SplitTxRx`]: split a duplex driver into independently owned halves,
//! - [`FilterConfig`]: program id/mask acceptance filters,
//! - [`BlockingControl`]: toggle a backend's blocking mode.
//!
//! Backends in this workspace (`can-tp-socketcan`, `can-frame-mock`) implement these traits; the
//! engine in `can-tp` consumes them and nothing else.

#![cfg_attr(not(feature = "std"), no_std)]

use core::time::Duration;

pub use embedded_can::{ExtendedId, StandardId};

/// CAN identifier, standard (11-bit) or extended (29-bit).
///
/// Re-exported as its own type so downstream code can name it without importing `embedded-can`
/// directly.
pub type Id = embedded_can::Id;

/// Identifier mask matching the width of the id it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMask {
    /// Mask over an 11-bit identifier.
    Standard(u16),
    /// Mask over a 29-bit identifier.
    Extended(u32),
}

/// One id/mask acceptance filter entry.
///
/// A frame passes when `frame_id & mask == filter_id & mask` and the id widths agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMaskFilter {
    /// Identifier to compare against.
    pub id: Id,
    /// Mask selecting the compared bits.
    pub mask: IdMask,
}

impl IdMaskFilter {
    /// Filter matching exactly one identifier (all id bits significant).
    pub fn exact(id: Id) -> Self {
        let mask = match id {
            Id::Standard(_) => IdMask::Standard(0x7FF),
            Id::Extended(_) => IdMask::Extended(0x1FFF_FFFF),
        };
        Self { id, mask }
    }

    /// Check whether `id` passes this filter.
    pub fn matches(&self, id: Id) -> bool {
        match (self.id, self.mask, id) {
            (Id::Standard(fid), IdMask::Standard(mask), Id::Standard(id)) => {
                (id.as_raw() & mask) == (fid.as_raw() & mask)
            }
            (Id::Extended(fid), IdMask::Extended(mask), Id::Extended(id)) => {
                (id.as_raw() & mask) == (fid.as_raw() & mask)
            }
            _ => false,
        }
    }
}

/// Transmit side of a CAN backend.
pub trait TxFrameIo {
    /// Frame type moved across the bus.
    type Frame;
    /// Backend-specific error type.
    type Error;

    /// Send a frame, blocking until it is queued for transmission.
    fn send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error>;

    /// Send a frame without blocking; errors if the backend would block.
    fn try_send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error>;

    /// Send a frame, blocking at most `timeout`.
    fn send_timeout(&mut self, frame: &Self::Frame, timeout: Duration) -> Result<(), Self::Error>;
}

/// Receive side of a CAN backend.
pub trait RxFrameIo {
    /// Frame type moved across the bus.
    type Frame;
    /// Backend-specific error type.
    type Error;

    /// Receive the next frame, blocking until one arrives.
    fn recv(&mut self) -> Result<Self::Frame, Self::Error>;

    /// Receive a frame without blocking; errors if none is pending.
    fn try_recv(&mut self) -> Result<Self::Frame, Self::Error>;

    /// Receive the next frame, blocking at most `timeout`.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Self::Frame, Self::Error>;

    /// Block until at least one frame is pending, without consuming it.
    fn wait_not_empty(&mut self) -> Result<(), Self::Error>;
}

/// Split a duplex backend into independently owned Tx/Rx halves.
pub trait SplitTxRx {
    /// Transmit half.
    type Tx: TxFrameIo;
    /// Receive half.
    type Rx: RxFrameIo;

    /// Consume the backend and return its halves.
    fn split(self) -> (Self::Tx, Self::Rx);
}

/// Configure id/mask acceptance filters on a backend.
///
/// An empty filter list means "accept everything".
pub trait FilterConfig {
    /// Backend-specific error type.
    type Error;

    /// Replace the active filter set.
    fn set_filters(&mut self, filters: &[IdMaskFilter]) -> Result<(), Self::Error>;
}

/// Toggle a backend's blocking mode.
pub trait BlockingControl {
    /// Backend-specific error type.
    type Error;

    /// Enable or disable non-blocking operation.
    fn set_nonblocking(&mut self, on: bool) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: u16) -> Id {
        Id::Standard(StandardId::new(raw).unwrap())
    }

    fn eid(raw: u32) -> Id {
        Id::Extended(ExtendedId::new(raw).unwrap())
    }

    #[test]
    fn exact_filter_matches_only_its_id() {
        let f = IdMaskFilter::exact(sid(0x123));
        assert!(f.matches(sid(0x123)));
        assert!(!f.matches(sid(0x124)));
        assert!(!f.matches(eid(0x123)));
    }

    #[test]
    fn masked_filter_matches_range() {
        let f = IdMaskFilter {
            id: eid(0x18DA_4400),
            mask: IdMask::Extended(0x1FFF_FF00),
        };
        assert!(f.matches(eid(0x18DA_4411)));
        assert!(f.matches(eid(0x18DA_44FE)));
        assert!(!f.matches(eid(0x18DA_4511)));
    }
}
