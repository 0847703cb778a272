//! Receive-side state machine: reassembly and flow-control decisions.

use core::cmp::min;
use core::mem;

use crate::config::{RxFlowControl, TpConfig};
use crate::errors::{ProtocolError, TimeoutKind, TpError};
use crate::segment::{FlowStatus, Segment, duration_to_st_min};
use crate::timer::{Clock, Deadline};

#[cfg(any(feature = "alloc", feature = "std"))]
use alloc::vec::Vec;

/// Storage backing reassembly of one inbound PDU.
///
/// Callers in `no_std` environments pass a borrowed slice; with allocation available an owned
/// buffer works too.
pub enum RxStorage<'a> {
    /// Caller-provided slice.
    Borrowed(&'a mut [u8]),
    #[cfg(any(feature = "alloc", feature = "std"))]
    /// Owned buffer.
    Owned(Vec<u8>),
}

impl<'a> RxStorage<'a> {
    /// Total writable capacity.
    pub fn capacity(&self) -> usize {
        match self {
            RxStorage::Borrowed(buf) => buf.len(),
            #[cfg(any(feature = "alloc", feature = "std"))]
            RxStorage::Owned(buf) => buf.len(),
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            RxStorage::Borrowed(buf) => buf,
            #[cfg(any(feature = "alloc", feature = "std"))]
            RxStorage::Owned(buf) => buf.as_slice(),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            RxStorage::Borrowed(buf) => buf,
            #[cfg(any(feature = "alloc", feature = "std"))]
            RxStorage::Owned(buf) => buf.as_mut_slice(),
        }
    }
}

/// High-level receive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// No transfer active.
    Idle,
    /// Segmented transfer in progress, awaiting Consecutive Frames.
    Receiving,
}

/// Action requested after processing one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Nothing to send back.
    None,
    /// Emit a flow control frame.
    SendFlowControl {
        /// Flow status to transmit back to the sender.
        status: FlowStatus,
        /// Block size granted (0 = unlimited).
        block_size: u8,
        /// Raw STmin byte to advertise.
        st_min: u8,
    },
    /// Payload complete; `take_completed` yields this many bytes.
    Completed(usize),
}

/// Receive state machine for one session direction.
pub struct Receiver<'a, I> {
    state: RxState,
    storage: RxStorage<'a>,
    written: usize,
    expected_len: usize,
    next_sn: u8,
    block_size: u8,
    block_remaining: u8,
    /// N_Cr: armed while waiting for the next Consecutive Frame.
    cf_deadline: Deadline<I>,
}

impl<'a, I: Copy + PartialOrd> Receiver<'a, I> {
    /// Create a receiver reassembling into `storage`.
    pub fn new(storage: RxStorage<'a>) -> Self {
        Self {
            state: RxState::Idle,
            storage,
            written: 0,
            expected_len: 0,
            next_sn: 0,
            block_size: 0,
            block_remaining: 0,
            cf_deadline: Deadline::unarmed(),
        }
    }

    /// Current receive state.
    pub fn state(&self) -> RxState {
        self.state
    }

    /// Whether no transfer is in progress.
    pub fn is_idle(&self) -> bool {
        self.state == RxState::Idle
    }

    /// Storage capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Drop any in-progress transfer and disarm the N_Cr deadline.
    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.written = 0;
        self.expected_len = 0;
        self.next_sn = 0;
        self.block_remaining = 0;
        self.cf_deadline.disarm();
    }

    /// Reclaim the storage, leaving the receiver with an empty buffer.
    pub fn take_storage(&mut self) -> RxStorage<'a> {
        self.reset();
        mem::replace(&mut self.storage, RxStorage::Borrowed(&mut []))
    }

    /// Abort with a reception timeout if N_Cr expired at `now`.
    ///
    /// No partial PDU survives: the in-progress transfer is dropped before the error is returned.
    pub fn check_timeout(&mut self, now: I) -> Result<(), ProtocolError> {
        if self.state == RxState::Receiving && self.cf_deadline.expired(now) {
            self.reset();
            return Err(TpError::Timeout(TimeoutKind::NCr));
        }
        Ok(())
    }

    /// Feed one inbound segment through the state machine.
    ///
    /// The caller sends a flow control frame whenever [`RxOutcome::SendFlowControl`] is returned
    /// (suppressed internally in listen-only mode) and must route Flow Control segments to the
    /// sender rather than here.
    pub fn on_segment<C>(
        &mut self,
        cfg: &TpConfig,
        fc: &RxFlowControl,
        clock: &C,
        now: I,
        segment: Segment<'_>,
    ) -> Result<RxOutcome, ProtocolError>
    where
        C: Clock<Instant = I>,
    {
        match segment {
            Segment::Single { len, data } => self.on_single(cfg, len, data),
            Segment::First { len, data } => self.on_first(cfg, fc, clock, now, len, data),
            Segment::Consecutive { sn, data } => self.on_consecutive(cfg, fc, clock, now, sn, data),
            Segment::FlowControl { .. } => Err(TpError::UnexpectedFrame),
        }
    }

    fn on_single(&mut self, cfg: &TpConfig, len: u8, data: &[u8]) -> Result<RxOutcome, ProtocolError> {
        if self.state != RxState::Idle {
            return Err(TpError::UnexpectedFrame);
        }
        let len = len as usize;
        if len > data.len() {
            return Err(TpError::MalformedPci);
        }
        if len > cfg.max_pdu_len || len > self.storage.capacity() {
            return Err(TpError::BufferOverflow);
        }
        self.storage.bytes_mut()[..len].copy_from_slice(&data[..len]);
        self.written = len;
        Ok(RxOutcome::Completed(len))
    }

    fn on_first<C>(
        &mut self,
        cfg: &TpConfig,
        fc: &RxFlowControl,
        clock: &C,
        now: I,
        len: u32,
        data: &[u8],
    ) -> Result<RxOutcome, ProtocolError>
    where
        C: Clock<Instant = I>,
    {
        if self.state != RxState::Idle {
            return Err(TpError::UnexpectedFrame);
        }
        let len = len as usize;
        if len > cfg.max_pdu_len || len > self.storage.capacity() {
            return Err(TpError::BufferOverflow);
        }
        let copy_len = min(data.len(), len);
        self.storage.bytes_mut()[..copy_len].copy_from_slice(&data[..copy_len]);
        self.written = copy_len;
        self.expected_len = len;
        self.next_sn = 1;
        self.state = RxState::Receiving;
        self.cf_deadline.arm(clock.add(now, cfg.n_cr));

        if cfg.listen_only {
            // An observer never answers; the real receiver's FC governs the block cadence.
            self.block_size = 0;
            self.block_remaining = 0;
            return Ok(RxOutcome::None);
        }
        self.block_size = fc.block_size;
        self.block_remaining = fc.block_size;
        Ok(RxOutcome::SendFlowControl {
            status: FlowStatus::ClearToSend,
            block_size: fc.block_size,
            st_min: duration_to_st_min(fc.st_min),
        })
    }

    fn on_consecutive<C>(
        &mut self,
        cfg: &TpConfig,
        fc: &RxFlowControl,
        clock: &C,
        now: I,
        sn: u8,
        data: &[u8],
    ) -> Result<RxOutcome, ProtocolError>
    where
        C: Clock<Instant = I>,
    {
        if self.state != RxState::Receiving {
            return Err(TpError::UnexpectedFrame);
        }
        if sn != self.next_sn {
            self.reset();
            return Err(TpError::SequenceError);
        }

        let remaining = self.expected_len - self.written;
        let chunk = min(data.len(), remaining);
        let end = self.written + chunk;
        self.storage.bytes_mut()[self.written..end].copy_from_slice(&data[..chunk]);
        self.written = end;
        self.next_sn = (self.next_sn + 1) & 0x0F;

        if self.written >= self.expected_len {
            self.state = RxState::Idle;
            self.cf_deadline.disarm();
            return Ok(RxOutcome::Completed(self.written));
        }
        self.cf_deadline.arm(clock.add(now, cfg.n_cr));

        if self.block_size > 0 {
            self.block_remaining = self.block_remaining.saturating_sub(1);
            if self.block_remaining == 0 {
                self.block_remaining = self.block_size;
                return Ok(RxOutcome::SendFlowControl {
                    status: FlowStatus::ClearToSend,
                    block_size: self.block_size,
                    st_min: duration_to_st_min(fc.st_min),
                });
            }
        }

        Ok(RxOutcome::None)
    }

    /// View the completed payload.
    ///
    /// The slice is backed by the internal buffer and stays valid until the next inbound transfer
    /// mutates it.
    pub fn take_completed(&self) -> &[u8] {
        &self.storage.bytes()[..self.written]
    }
}
