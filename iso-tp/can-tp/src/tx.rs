//! Transmit-side state machine.
//!
//! One [`Sender`] drives one outbound PDU: Single Frame fast path, or First Frame followed by
//! Consecutive Frames paced by the receiver's Flow Control. The machine never performs I/O or
//! sleeps itself; the caller supplies the current instant on every poll and an `emit` callback
//! that puts encoded segments on the wire.

use core::time::Duration;

use crate::config::TpConfig;
use crate::errors::{TimeoutKind, TpError};
use crate::segment::{FlowStatus, Segment, st_min_to_duration};
use crate::timer::Clock;

/// Progress indicator for non-blocking APIs.
///
/// Blocking conveniences in this crate are loops over polling primitives; `Progress` describes
/// the state after one poll step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Transfer is ongoing.
    InFlight,
    /// Waiting for a flow control frame.
    WaitingForFlowControl,
    /// Transfer finished.
    Completed,
    /// Nothing to do yet (backend empty or STmin gap still open); retry later.
    WouldBlock,
}

/// A received Flow Control frame, pending consumption by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcFrame {
    /// Flow status from the receiver.
    pub status: FlowStatus,
    /// Granted block size (0 = unlimited).
    pub block_size: u8,
    /// Raw STmin byte.
    pub st_min: u8,
}

#[derive(Clone, Copy)]
enum TxPhase<I> {
    Idle,
    WaitingForFc { deadline: I },
    Sending { gap_deadline: Option<I> },
}

/// Transmit state machine for one session direction.
pub struct Sender<I> {
    phase: TxPhase<I>,
    payload_len: usize,
    offset: usize,
    next_sn: u8,
    /// Block size granted by the last Flow Control (0 = unlimited).
    block_size: u8,
    block_remaining: u8,
    st_min: Duration,
    wait_count: u8,
}

impl<I: Copy + PartialOrd> Sender<I> {
    /// A sender with no transfer in flight.
    pub fn new() -> Self {
        Self {
            phase: TxPhase::Idle,
            payload_len: 0,
            offset: 0,
            next_sn: 0,
            block_size: 0,
            block_remaining: 0,
            st_min: Duration::ZERO,
            wait_count: 0,
        }
    }

    /// Whether no transfer is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, TxPhase::Idle)
    }

    /// Whether the machine is blocked on a Flow Control frame.
    pub fn is_waiting_for_fc(&self) -> bool {
        matches!(self.phase, TxPhase::WaitingForFc { .. })
    }

    /// Whether the machine is blasting an unlimited block with no pacing gap.
    pub fn in_unpaced_block(&self) -> bool {
        matches!(self.phase, TxPhase::Sending { .. })
            && self.block_size == 0
            && self.st_min.is_zero()
    }

    /// Drop the in-flight transfer and disarm all deadlines.
    pub fn cancel(&mut self) {
        self.phase = TxPhase::Idle;
        self.offset = 0;
        self.payload_len = 0;
        self.wait_count = 0;
    }

    /// Advance the transfer of `payload` by one step.
    ///
    /// `pending_fc` is the latest Flow Control received for this session; it is consumed when the
    /// machine is waiting for one. `emit` is called with each segment to put on the wire. On a
    /// transport error the transfer is dropped; the caller must resubmit the whole PDU.
    pub fn poll<C, E>(
        &mut self,
        cfg: &TpConfig,
        clock: &C,
        payload: &[u8],
        now: I,
        pending_fc: &mut Option<FcFrame>,
        emit: &mut dyn FnMut(&Segment<'_>) -> Result<(), TpError<E>>,
    ) -> Result<Progress, TpError<E>>
    where
        C: Clock<Instant = I>,
    {
        loop {
            match self.phase {
                TxPhase::Idle => return self.start(cfg, clock, payload, now, emit),
                TxPhase::WaitingForFc { deadline } => {
                    if payload.len() != self.payload_len {
                        return Err(TpError::SessionBusy);
                    }
                    let Some(fc) = pending_fc.take() else {
                        if now >= deadline {
                            self.cancel();
                            return Err(TpError::Timeout(TimeoutKind::NBs));
                        }
                        return Ok(Progress::WaitingForFlowControl);
                    };
                    match fc.status {
                        FlowStatus::ClearToSend => {
                            self.wait_count = 0;
                            self.block_size = fc.block_size;
                            self.block_remaining = fc.block_size;
                            // Reserved STmin values fall back to the maximum of the ms range.
                            self.st_min = cfg.force_tx_st_min.unwrap_or_else(|| {
                                st_min_to_duration(fc.st_min)
                                    .unwrap_or(Duration::from_millis(0x7F))
                            });
                            self.phase = TxPhase::Sending { gap_deadline: None };
                        }
                        FlowStatus::Wait => {
                            self.wait_count = self.wait_count.saturating_add(1);
                            if self.wait_count > cfg.wft_max {
                                self.cancel();
                                return Err(TpError::Timeout(TimeoutKind::NBs));
                            }
                            self.phase = TxPhase::WaitingForFc {
                                deadline: clock.add(now, cfg.n_bs),
                            };
                            return Ok(Progress::WaitingForFlowControl);
                        }
                        FlowStatus::Overflow => {
                            self.cancel();
                            return Err(TpError::FlowOverflow);
                        }
                    }
                }
                TxPhase::Sending { gap_deadline } => {
                    if payload.len() != self.payload_len {
                        return Err(TpError::SessionBusy);
                    }
                    if let Some(gap) = gap_deadline
                        && now < gap
                    {
                        return Ok(Progress::WouldBlock);
                    }
                    return self.send_consecutive(cfg, clock, payload, now, emit);
                }
            }
        }
    }

    fn start<C, E>(
        &mut self,
        cfg: &TpConfig,
        clock: &C,
        payload: &[u8],
        now: I,
        emit: &mut dyn FnMut(&Segment<'_>) -> Result<(), TpError<E>>,
    ) -> Result<Progress, TpError<E>>
    where
        C: Clock<Instant = I>,
    {
        if payload.len() > cfg.max_pdu_len {
            return Err(TpError::PayloadTooLarge);
        }

        if payload.len() <= cfg.max_single_frame_payload() {
            emit(&Segment::Single {
                len: payload.len() as u8,
                data: payload,
            })?;
            return Ok(Progress::Completed);
        }

        let total = payload.len() as u32;
        let chunk = payload.len().min(cfg.max_first_frame_payload(total));
        emit(&Segment::First {
            len: total,
            data: &payload[..chunk],
        })?;

        self.payload_len = payload.len();
        self.offset = chunk;
        self.next_sn = 1;
        self.block_size = 0;
        self.block_remaining = 0;
        self.wait_count = 0;
        self.phase = TxPhase::WaitingForFc {
            deadline: clock.add(now, cfg.n_bs),
        };
        Ok(Progress::WaitingForFlowControl)
    }

    fn send_consecutive<C, E>(
        &mut self,
        cfg: &TpConfig,
        clock: &C,
        payload: &[u8],
        now: I,
        emit: &mut dyn FnMut(&Segment<'_>) -> Result<(), TpError<E>>,
    ) -> Result<Progress, TpError<E>>
    where
        C: Clock<Instant = I>,
    {
        let remaining = self.payload_len - self.offset;
        let chunk = remaining.min(cfg.max_consecutive_frame_payload());
        let result = emit(&Segment::Consecutive {
            sn: self.next_sn & 0x0F,
            data: &payload[self.offset..self.offset + chunk],
        });
        if let Err(err) = result {
            self.cancel();
            return Err(err);
        }

        self.offset += chunk;
        self.next_sn = (self.next_sn + 1) & 0x0F;

        if self.offset >= self.payload_len {
            self.cancel();
            return Ok(Progress::Completed);
        }

        if self.block_size > 0 {
            self.block_remaining = self.block_remaining.saturating_sub(1);
            if self.block_remaining == 0 {
                self.phase = TxPhase::WaitingForFc {
                    deadline: clock.add(now, cfg.n_bs),
                };
                return Ok(Progress::WaitingForFlowControl);
            }
        }

        // N_Cs acts as a local floor under the peer-advertised STmin.
        let gap = self.st_min.max(cfg.n_cs);
        let gap_deadline = if gap > Duration::ZERO {
            Some(clock.add(now, gap))
        } else {
            None
        };
        self.phase = TxPhase::Sending { gap_deadline };
        Ok(Progress::InFlight)
    }
}

impl<I: Copy + PartialOrd> Default for Sender<I> {
    fn default() -> Self {
        Self::new()
    }
}
