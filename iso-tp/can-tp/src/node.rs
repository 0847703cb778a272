//! Single-session ISO-TP endpoint over split Tx/Rx frame halves.

use core::time::Duration;

use embedded_can::Frame;

use can_frame_io::{RxFrameIo, TxFrameIo};

use crate::config::{RxFlowControl, TpConfig};
use crate::errors::{ProtocolError, TimeoutKind, TpError};
use crate::rx::{Receiver, RxOutcome, RxStorage};
use crate::segment::{
    CodecError, FlowStatus, Segment, decode_frame, duration_to_st_min, encode_frame,
};
use crate::timer::Clock;
use crate::tx::{FcFrame, Progress, Sender};

fn map_codec<E>(err: CodecError) -> TpError<E> {
    match err {
        CodecError::MalformedPci => TpError::MalformedPci,
        CodecError::PayloadTooLarge => TpError::PayloadTooLarge,
    }
}

/// ISO-TP endpoint for one fixed address pair, backed by split transmit/receive halves and a
/// clock.
///
/// The endpoint is poll-driven: [`TpNode::poll_send`] / [`TpNode::poll_recv`] each advance the
/// engine by at most one state-machine transition and never sleep. The blocking [`TpNode::send`]
/// and [`TpNode::recv`] wrappers loop over the polls until completion or timeout.
pub struct TpNode<'a, Tx, Rx, F, C>
where
    Tx: TxFrameIo<Frame = F>,
    Rx: RxFrameIo<Frame = F, Error = Tx::Error>,
    C: Clock,
{
    tx: Tx,
    rx: Rx,
    cfg: TpConfig,
    rx_flow: RxFlowControl,
    clock: C,
    sender: Sender<C::Instant>,
    receiver: Receiver<'a, C::Instant>,
    pending_fc: Option<FcFrame>,
    /// A reassembled PDU is buffered and must be drained via `poll_recv` before new inbound
    /// data frames are accepted.
    rx_ready: bool,
    /// The peer started a new transfer while we were awaiting its Flow Control.
    tx_killed_by_peer: bool,
}

impl<'a, Tx, Rx, F, C> TpNode<'a, Tx, Rx, F, C>
where
    Tx: TxFrameIo<Frame = F>,
    Rx: RxFrameIo<Frame = F, Error = Tx::Error>,
    F: Frame,
    C: Clock,
{
    /// Construct an endpoint with explicit reassembly storage.
    pub fn new(
        tx: Tx,
        rx: Rx,
        cfg: TpConfig,
        clock: C,
        rx_storage: RxStorage<'a>,
    ) -> Result<Self, ProtocolError> {
        cfg.validate()?;
        if rx_storage.capacity() < cfg.max_pdu_len {
            return Err(TpError::InvalidConfig);
        }
        let rx_flow = RxFlowControl::from_config(&cfg);
        Ok(Self {
            tx,
            rx,
            cfg,
            rx_flow,
            clock,
            sender: Sender::new(),
            receiver: Receiver::new(rx_storage),
            pending_fc: None,
            rx_ready: false,
            tx_killed_by_peer: false,
        })
    }

    /// Construct using a caller-provided reassembly buffer.
    pub fn with_rx_buffer(
        tx: Tx,
        rx: Rx,
        cfg: TpConfig,
        clock: C,
        rx_buffer: &'a mut [u8],
    ) -> Result<Self, ProtocolError> {
        Self::new(tx, rx, cfg, clock, RxStorage::Borrowed(rx_buffer))
    }

    /// Active configuration.
    pub fn config(&self) -> &TpConfig {
        &self.cfg
    }

    /// Current receive-side FlowControl parameters (BS/STmin).
    pub fn rx_flow_control(&self) -> RxFlowControl {
        self.rx_flow
    }

    /// Update receive-side FlowControl parameters advertised to the remote sender.
    pub fn set_rx_flow_control(&mut self, fc: RxFlowControl) {
        self.rx_flow = fc;
    }

    /// Drop both directions immediately: disarm all deadlines, forget buffered state.
    pub fn cancel(&mut self) {
        self.sender.cancel();
        self.receiver.reset();
        self.pending_fc = None;
        self.rx_ready = false;
        self.tx_killed_by_peer = false;
    }

    /// Advance transmission of `payload` once; the caller supplies the current time.
    ///
    /// Poll until [`Progress::Completed`]. The same payload must be passed on every poll of one
    /// transfer; submitting a different PDU while one is in flight fails with
    /// [`TpError::SessionBusy`].
    pub fn poll_send(
        &mut self,
        payload: &[u8],
        now: C::Instant,
    ) -> Result<Progress, TpError<Tx::Error>> {
        if self.tx_killed_by_peer {
            self.tx_killed_by_peer = false;
            return Err(TpError::UnexpectedFrame);
        }

        // In an unpaced block (BS 0, STmin 0) skip the per-frame ingest to avoid one recv
        // syscall per consecutive frame.
        if !self.sender.in_unpaced_block() {
            let _ = self.ingest_one(now)?;
            if self.tx_killed_by_peer {
                self.tx_killed_by_peer = false;
                return Err(TpError::UnexpectedFrame);
            }
        }

        let Self {
            tx,
            cfg,
            clock,
            sender,
            pending_fc,
            ..
        } = self;
        let cfg: &TpConfig = cfg;
        let clock: &C = clock;
        let wire = cfg.tx_wire();
        sender.poll(cfg, clock, payload, now, pending_fc, &mut |segment| {
            let frame = encode_frame::<F>(cfg.tx_id, segment, &wire).map_err(map_codec)?;
            tx.try_send(&frame).map_err(TpError::Transport)
        })
    }

    /// Blocking send: poll until completion or `timeout`.
    pub fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<(), TpError<Tx::Error>> {
        let deadline = self.clock.add(self.clock.now(), timeout);
        loop {
            let now = self.clock.now();
            if now >= deadline {
                self.sender.cancel();
                return Err(TpError::Timeout(TimeoutKind::NAs));
            }
            match self.poll_send(payload, now)? {
                Progress::Completed => return Ok(()),
                Progress::InFlight | Progress::WaitingForFlowControl | Progress::WouldBlock => {
                    continue;
                }
            }
        }
    }

    /// Non-blocking receive step; `deliver` is invoked once a full PDU has been reassembled.
    ///
    /// The slice passed to `deliver` stays valid until the next receive operation mutates the
    /// internal reassembly buffer.
    pub fn poll_recv(
        &mut self,
        now: C::Instant,
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<Progress, TpError<Tx::Error>> {
        if self.rx_ready {
            deliver(self.receiver.take_completed());
            self.rx_ready = false;
            return Ok(Progress::Completed);
        }
        self.receiver.check_timeout(now).map_err(TpError::widen)?;

        loop {
            match self.ingest_one(now)? {
                Progress::WouldBlock => return Ok(Progress::WouldBlock),
                Progress::Completed => {
                    deliver(self.receiver.take_completed());
                    self.rx_ready = false;
                    return Ok(Progress::Completed);
                }
                Progress::InFlight | Progress::WaitingForFlowControl => continue,
            }
        }
    }

    /// Blocking receive: poll until a full PDU arrives or `timeout`.
    pub fn recv(
        &mut self,
        timeout: Duration,
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<(), TpError<Tx::Error>> {
        let deadline = self.clock.add(self.clock.now(), timeout);
        loop {
            let now = self.clock.now();
            if now >= deadline {
                return Err(TpError::Timeout(TimeoutKind::NAr));
            }
            match self.poll_recv(now, deliver)? {
                Progress::Completed => return Ok(()),
                Progress::InFlight | Progress::WaitingForFlowControl | Progress::WouldBlock => {
                    continue;
                }
            }
        }
    }

    /// Pull at most one frame from the backend and route it.
    fn ingest_one(&mut self, now: C::Instant) -> Result<Progress, TpError<Tx::Error>> {
        let frame = match self.rx.try_recv() {
            Ok(frame) => frame,
            Err(_) => return Ok(Progress::WouldBlock),
        };

        if frame.id() != self.cfg.rx_id {
            return Ok(Progress::InFlight);
        }
        if let Some(expected) = self.cfg.rx_addr
            && frame.data().first().copied() != Some(expected)
        {
            return Ok(Progress::InFlight);
        }
        if self.cfg.padding_check.checks_length() && frame.data().len() != self.cfg.frame_len {
            return Err(TpError::MalformedPci);
        }

        let data = frame.data();
        let segment = decode_frame(data, self.cfg.rx_pci_offset()).map_err(map_codec)?;
        if !rx_padding_content_ok(&self.cfg, data, &segment) {
            return Err(TpError::MalformedPci);
        }

        if let Segment::FlowControl {
            status,
            block_size,
            st_min,
        } = &segment
        {
            self.pending_fc = Some(FcFrame {
                status: *status,
                block_size: *block_size,
                st_min: *st_min,
            });
            return Ok(Progress::InFlight);
        }

        // A fresh First Frame from the peer invalidates a send that is still waiting for its
        // Flow Control.
        if matches!(segment, Segment::First { .. }) && self.sender.is_waiting_for_fc() {
            self.sender.cancel();
            self.tx_killed_by_peer = true;
        }

        if self.rx_ready {
            // Hold new inbound data until the application drains the buffered PDU.
            return Ok(Progress::InFlight);
        }

        match self
            .receiver
            .on_segment(&self.cfg, &self.rx_flow, &self.clock, now, segment)
        {
            Ok(RxOutcome::None) => Ok(Progress::InFlight),
            Ok(RxOutcome::SendFlowControl {
                status,
                block_size,
                st_min,
            }) => {
                self.send_flow_control(status, block_size, st_min)?;
                Ok(Progress::InFlight)
            }
            Ok(RxOutcome::Completed(_len)) => {
                self.rx_ready = true;
                Ok(Progress::Completed)
            }
            Err(TpError::UnexpectedFrame) => Ok(Progress::InFlight),
            Err(TpError::BufferOverflow) => {
                if !self.cfg.listen_only {
                    let _ = self.send_overflow_fc();
                }
                Err(TpError::BufferOverflow)
            }
            Err(err) => Err(TpError::widen(err)),
        }
    }

    fn send_flow_control(
        &mut self,
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
    ) -> Result<(), TpError<Tx::Error>> {
        let fc = Segment::FlowControl {
            status,
            block_size,
            st_min,
        };
        let frame =
            encode_frame::<F>(self.cfg.tx_id, &fc, &self.cfg.tx_wire()).map_err(map_codec)?;
        self.tx.try_send(&frame).map_err(TpError::Transport)
    }

    fn send_overflow_fc(&mut self) -> Result<(), TpError<Tx::Error>> {
        self.send_flow_control(
            FlowStatus::Overflow,
            0,
            duration_to_st_min(self.rx_flow.st_min),
        )
    }
}

#[cfg(feature = "std")]
impl<'a, Tx, Rx, F> TpNode<'a, Tx, Rx, F, crate::timer::StdClock>
where
    Tx: TxFrameIo<Frame = F>,
    Rx: RxFrameIo<Frame = F, Error = Tx::Error>,
    F: Frame,
{
    /// Convenience constructor using [`crate::StdClock`].
    pub fn with_std_clock(
        tx: Tx,
        rx: Rx,
        cfg: TpConfig,
        rx_storage: RxStorage<'a>,
    ) -> Result<Self, ProtocolError> {
        Self::new(tx, rx, cfg, crate::timer::StdClock, rx_storage)
    }
}

/// Verify padding content where the segment's own length field pins down where padding starts
/// (Single Frame and Flow Control; First/Consecutive Frames carry data up to the frame end).
pub(crate) fn rx_padding_content_ok(cfg: &TpConfig, data: &[u8], segment: &Segment<'_>) -> bool {
    if !cfg.padding_check.checks_content() {
        return true;
    }
    let Some(pad) = cfg.rx_padding else {
        return true;
    };
    let offset = cfg.rx_pci_offset();
    let tail_start = match segment {
        Segment::Single { len, .. } => {
            let escape = data.len() > 8 && data[offset] & 0x0F == 0;
            let header = if escape { 2 } else { 1 };
            offset + header + *len as usize
        }
        Segment::FlowControl { .. } => offset + 3,
        Segment::First { .. } | Segment::Consecutive { .. } => return true,
    };
    data[tail_start..].iter().all(|b| *b == pad)
}
