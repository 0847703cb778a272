//! Session table: multi-peer ISO-TP multiplexing over 29-bit fixed addressing.
//!
//! A single receive identifier under "normal fixed" addressing (`0x18DA_TA_SA`) can carry
//! segmented transfers from many source addresses at once. One receive state machine is not
//! enough: transfers from different peers interleave on the bus and must be reassembled
//! independently, and Flow Control frames must be routed to the transmit session of the peer
//! that sent them.
//!
//! [`SessionMux`] keys sessions by the remote node address. A session is created lazily on the
//! first inbound Single/First Frame or the first outbound submit for an address, holds at most
//! one active transfer per direction, and is released (its reassembly storage reclaimed) once
//! both directions are idle and the result has been consumed.

use core::time::Duration;

use embedded_can::Frame;

use can_frame_io::{RxFrameIo, TxFrameIo};

use crate::address::{TargetAddressType, fixed29};
use crate::config::{RxFlowControl, TpConfig};
use crate::errors::{ProtocolError, TimeoutKind, TpError};
use crate::node::rx_padding_content_ok;
use crate::rx::{Receiver, RxOutcome, RxStorage};
use crate::segment::{
    FlowStatus, Segment, decode_frame, duration_to_st_min, encode_frame,
};
use crate::timer::Clock;
use crate::tx::{FcFrame, Progress, Sender};

/// Build `N` borrowed reassembly storages from a fixed array of buffers.
///
/// Each concurrent peer session needs a dedicated buffer.
pub fn rx_storages_from_buffers<'a, const N: usize, const L: usize>(
    bufs: &'a mut [[u8; L]; N],
) -> [RxStorage<'a>; N] {
    bufs.each_mut()
        .map(|buf| RxStorage::Borrowed(buf.as_mut_slice()))
}

struct Session<'a, I> {
    remote: u8,
    sender: Sender<I>,
    receiver: Receiver<'a, I>,
    pending_fc: Option<FcFrame>,
    /// A complete payload sits in `receiver` and must be drained before new inbound data from
    /// this peer is accepted (the reassembly buffer would be overwritten).
    rx_ready: bool,
    tx_killed_by_peer: bool,
}

impl<'a, I: Copy + PartialOrd> Session<'a, I> {
    fn new(remote: u8, storage: RxStorage<'a>) -> Self {
        Self {
            remote,
            sender: Sender::new(),
            receiver: Receiver::new(storage),
            pending_fc: None,
            rx_ready: false,
            tx_killed_by_peer: false,
        }
    }

    fn is_terminal(&self) -> bool {
        self.sender.is_idle() && self.receiver.is_idle() && !self.rx_ready
    }
}

/// Fixed-capacity FIFO of session indices with completed payloads awaiting delivery.
struct ReadyRing<const N: usize> {
    slots: [usize; N],
    head: usize,
    len: usize,
}

impl<const N: usize> ReadyRing<N> {
    fn new() -> Self {
        Self {
            slots: [0; N],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, idx: usize) -> Result<(), ()> {
        if self.len == N {
            return Err(());
        }
        self.slots[(self.head + self.len) % N] = idx;
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let idx = self.slots[self.head];
        self.head = (self.head + 1) % N;
        self.len -= 1;
        Some(idx)
    }
}

/// Multi-peer ISO-TP endpoint for 29-bit fixed physical addressing.
///
/// `local_addr` is this node's address (the `TA` field of inbound identifiers). Make sure the
/// underlying interface accepts all frames addressed to it, e.g. via
/// [`SessionMux::acceptance_filters`].
pub struct SessionMux<'a, Tx, Rx, F, C, const MAX_SESSIONS: usize>
where
    Tx: TxFrameIo<Frame = F>,
    Rx: RxFrameIo<Frame = F, Error = Tx::Error>,
    F: Frame,
    C: Clock,
{
    tx: Tx,
    rx: Rx,
    base_cfg: TpConfig,
    rx_flow: RxFlowControl,
    clock: C,
    local_addr: u8,
    functional_addr: Option<u8>,
    sessions: [Option<Session<'a, C::Instant>>; MAX_SESSIONS],
    spare: [Option<RxStorage<'a>>; MAX_SESSIONS],
    ready: ReadyRing<MAX_SESSIONS>,
}

impl<'a, Tx, Rx, F, C, const MAX_SESSIONS: usize> SessionMux<'a, Tx, Rx, F, C, MAX_SESSIONS>
where
    Tx: TxFrameIo<Frame = F>,
    Rx: RxFrameIo<Frame = F, Error = Tx::Error>,
    F: Frame,
    C: Clock,
{
    /// Create a mux with caller-provided per-session reassembly storages.
    ///
    /// `base_cfg` supplies timing/limits/padding/addressing-byte configuration; per-session CAN
    /// identifiers are derived from `local_addr` and the peer address on demand.
    pub fn new(
        tx: Tx,
        rx: Rx,
        base_cfg: TpConfig,
        clock: C,
        local_addr: u8,
        storages: [RxStorage<'a>; MAX_SESSIONS],
    ) -> Result<Self, ProtocolError> {
        if base_cfg.max_pdu_len == 0 {
            return Err(TpError::InvalidConfig);
        }
        for storage in &storages {
            if storage.capacity() < base_cfg.max_pdu_len {
                return Err(TpError::InvalidConfig);
            }
        }
        let rx_flow = RxFlowControl::from_config(&base_cfg);
        let mut spare: [Option<RxStorage<'a>>; MAX_SESSIONS] = core::array::from_fn(|_| None);
        for (slot, storage) in spare.iter_mut().zip(storages) {
            *slot = Some(storage);
        }
        Ok(Self {
            tx,
            rx,
            base_cfg,
            rx_flow,
            clock,
            local_addr,
            functional_addr: None,
            sessions: core::array::from_fn(|_| None),
            spare,
            ready: ReadyRing::new(),
        })
    }

    /// Additionally accept functional-addressing frames (`0x18DB_TA_SA`) for `functional_addr`.
    ///
    /// Segmented transfers under functional addressing are not meaningful; only Single Frames
    /// are accepted on functional identifiers.
    pub fn with_functional_addr(mut self, functional_addr: u8) -> Self {
        self.functional_addr = Some(functional_addr);
        self
    }

    /// Node address of this mux.
    pub fn local_addr(&self) -> u8 {
        self.local_addr
    }

    /// Acceptance filters matching all frames addressed to this node.
    pub fn acceptance_filters(&self) -> fixed29::AcceptanceFilters {
        fixed29::filters_for_targets(self.local_addr, self.functional_addr)
    }

    fn cfg_for(&self, remote: u8) -> TpConfig {
        let mut cfg = self.base_cfg.clone();
        cfg.tx_id = fixed29::encode_phys_id(remote, self.local_addr);
        cfg.rx_id = fixed29::encode_phys_id(self.local_addr, remote);
        cfg
    }

    fn find(&self, remote: u8) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.remote == remote))
    }

    fn find_or_create(&mut self, remote: u8) -> Result<usize, ProtocolError> {
        if let Some(idx) = self.find(remote) {
            return Ok(idx);
        }
        if remote == self.local_addr {
            return Err(TpError::InvalidConfig);
        }
        let idx = self
            .sessions
            .iter()
            .position(|s| s.is_none())
            .ok_or(TpError::SessionBusy)?;
        let storage = self
            .spare
            .iter_mut()
            .find_map(|slot| slot.take())
            .ok_or(TpError::SessionBusy)?;
        self.sessions[idx] = Some(Session::new(remote, storage));
        Ok(idx)
    }

    /// Return a terminal session's storage to the spare pool and free its slot.
    fn release_if_terminal(&mut self, idx: usize) {
        let done = self.sessions[idx]
            .as_ref()
            .is_some_and(|session| session.is_terminal());
        if !done {
            return;
        }
        if let Some(mut session) = self.sessions[idx].take()
            && let Some(slot) = self.spare.iter_mut().find(|slot| slot.is_none())
        {
            *slot = Some(session.receiver.take_storage());
        }
    }

    /// Drop a peer's session immediately: disarm its deadlines and reclaim its slot.
    pub fn cancel(&mut self, remote: u8) {
        if let Some(idx) = self.find(remote)
            && let Some(session) = self.sessions[idx].as_mut()
        {
            session.sender.cancel();
            session.receiver.reset();
            session.pending_fc = None;
            session.rx_ready = false;
            self.release_if_terminal(idx);
        }
    }

    /// Abort any session whose N_Cr deadline expired at `now`.
    ///
    /// Returns the peer address of the first timed-out reception, as an error; other sessions
    /// stay intact.
    fn check_rx_timeouts(&mut self, now: C::Instant) -> Result<(), TpError<Tx::Error>> {
        for session in self.sessions.iter_mut().flatten() {
            if session.receiver.check_timeout(now).is_err() {
                return Err(TpError::Timeout(TimeoutKind::NCr));
            }
        }
        Ok(())
    }

    fn ingest_one(&mut self, now: C::Instant) -> Result<Progress, TpError<Tx::Error>> {
        let frame = match self.rx.try_recv() {
            Ok(frame) => frame,
            Err(_) => return Ok(Progress::WouldBlock),
        };

        let Some(parsed) = fixed29::decode_id(frame.id()) else {
            return Ok(Progress::InFlight);
        };
        match parsed.kind {
            TargetAddressType::Physical => {
                if parsed.target != self.local_addr {
                    return Ok(Progress::InFlight);
                }
            }
            TargetAddressType::Functional => {
                if Some(parsed.target) != self.functional_addr {
                    return Ok(Progress::InFlight);
                }
            }
        }

        let remote = parsed.source;
        let cfg = self.cfg_for(remote);
        if let Some(expected) = cfg.rx_addr
            && frame.data().first().copied() != Some(expected)
        {
            return Ok(Progress::InFlight);
        }
        if cfg.padding_check.checks_length() && frame.data().len() != cfg.frame_len {
            return Err(TpError::MalformedPci);
        }

        let data = frame.data();
        let segment = match decode_frame(data, cfg.rx_pci_offset()) {
            Ok(segment) => segment,
            Err(_) => return Err(TpError::MalformedPci),
        };
        if !rx_padding_content_ok(&cfg, data, &segment) {
            return Err(TpError::MalformedPci);
        }

        // Functional addressing carries Single Frames only.
        if parsed.kind == TargetAddressType::Functional
            && !matches!(segment, Segment::Single { .. })
        {
            return Ok(Progress::InFlight);
        }

        let idx = self.find_or_create(remote).map_err(TpError::widen)?;
        let session = self.sessions[idx].as_mut().expect("session exists");

        if let Segment::FlowControl {
            status,
            block_size,
            st_min,
        } = &segment
        {
            session.pending_fc = Some(FcFrame {
                status: *status,
                block_size: *block_size,
                st_min: *st_min,
            });
            return Ok(Progress::InFlight);
        }

        if matches!(segment, Segment::First { .. }) && session.sender.is_waiting_for_fc() {
            session.sender.cancel();
            session.tx_killed_by_peer = true;
        }

        if session.rx_ready {
            return Ok(Progress::InFlight);
        }

        match session
            .receiver
            .on_segment(&cfg, &self.rx_flow, &self.clock, now, segment)
        {
            Ok(RxOutcome::None) => Ok(Progress::InFlight),
            Ok(RxOutcome::SendFlowControl {
                status,
                block_size,
                st_min,
            }) => {
                Self::send_fc_frame(&mut self.tx, &cfg, status, block_size, st_min)?;
                Ok(Progress::InFlight)
            }
            Ok(RxOutcome::Completed(_len)) => {
                session.rx_ready = true;
                self.ready.push(idx).map_err(|_| TpError::BufferOverflow)?;
                Ok(Progress::Completed)
            }
            Err(TpError::UnexpectedFrame) => Ok(Progress::InFlight),
            Err(TpError::BufferOverflow) => {
                if !cfg.listen_only {
                    let _ = Self::send_fc_frame(
                        &mut self.tx,
                        &cfg,
                        FlowStatus::Overflow,
                        0,
                        duration_to_st_min(self.rx_flow.st_min),
                    );
                }
                Err(TpError::BufferOverflow)
            }
            Err(err) => Err(TpError::widen(err)),
        }
    }

    fn deliver_ready(
        &mut self,
        deliver: &mut dyn FnMut(u8, &[u8]),
    ) -> bool {
        let Some(idx) = self.ready.pop() else {
            return false;
        };
        if let Some(session) = self.sessions[idx].as_mut() {
            let reply_to = session.remote;
            deliver(reply_to, session.receiver.take_completed());
            session.rx_ready = false;
        }
        self.release_if_terminal(idx);
        true
    }

    /// Non-blocking receive step; delivers at most one reassembled payload.
    ///
    /// `deliver(reply_to, payload)` is invoked with the peer address and the payload slice; the
    /// slice stays valid until the next transfer from the same peer reuses the buffer.
    pub fn poll_recv(
        &mut self,
        now: C::Instant,
        deliver: &mut dyn FnMut(u8, &[u8]),
    ) -> Result<Progress, TpError<Tx::Error>> {
        if self.deliver_ready(deliver) {
            return Ok(Progress::Completed);
        }
        self.check_rx_timeouts(now)?;

        loop {
            match self.ingest_one(now)? {
                Progress::WouldBlock => return Ok(Progress::WouldBlock),
                Progress::Completed => {
                    if self.deliver_ready(deliver) {
                        return Ok(Progress::Completed);
                    }
                    return Ok(Progress::InFlight);
                }
                Progress::InFlight | Progress::WaitingForFlowControl => continue,
            }
        }
    }

    /// Blocking receive until a full payload arrives or `timeout`.
    pub fn recv(
        &mut self,
        timeout: Duration,
        deliver: &mut dyn FnMut(u8, &[u8]),
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

    /// Non-blocking send step towards `remote`.
    pub fn poll_send_to(
        &mut self,
        remote: u8,
        payload: &[u8],
        now: C::Instant,
    ) -> Result<Progress, TpError<Tx::Error>> {
        // Ingest once so pending FlowControl is picked up (and inbound payloads get buffered),
        // except while blasting an unpaced block where the extra recv per frame costs throughput.
        let skip_ingest = self
            .find(remote)
            .and_then(|idx| self.sessions[idx].as_ref())
            .is_some_and(|session| session.sender.in_unpaced_block());
        if !skip_ingest {
            let _ = self.ingest_one(now)?;
        }

        let cfg = self.cfg_for(remote);
        let idx = self.find_or_create(remote).map_err(TpError::widen)?;

        let Self { tx, clock, sessions, .. } = self;
        let session = sessions[idx].as_mut().expect("session exists");
        if session.tx_killed_by_peer {
            session.tx_killed_by_peer = false;
            return Err(TpError::UnexpectedFrame);
        }

        let wire = cfg.tx_wire();
        let progress = session.sender.poll(
            &cfg,
            &*clock,
            payload,
            now,
            &mut session.pending_fc,
            &mut |segment| {
                let frame = encode_frame::<F>(cfg.tx_id, segment, &wire).map_err(|err| match err {
                    crate::segment::CodecError::MalformedPci => TpError::MalformedPci,
                    crate::segment::CodecError::PayloadTooLarge => TpError::PayloadTooLarge,
                })?;
                tx.try_send(&frame).map_err(TpError::Transport)
            },
        )?;
        if progress == Progress::Completed {
            self.release_if_terminal(idx);
        }
        Ok(progress)
    }

    /// Blocking send to `remote` until completion or `timeout`.
    pub fn send_to(
        &mut self,
        remote: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), TpError<Tx::Error>> {
        let deadline = self.clock.add(self.clock.now(), timeout);
        loop {
            let now = self.clock.now();
            if now >= deadline {
                self.cancel_tx(remote);
                return Err(TpError::Timeout(TimeoutKind::NAs));
            }
            match self.poll_send_to(remote, payload, now)? {
                Progress::Completed => return Ok(()),
                Progress::InFlight | Progress::WaitingForFlowControl | Progress::WouldBlock => {
                    continue;
                }
            }
        }
    }

    /// Send a functional-addressing Single Frame to `functional_target`.
    ///
    /// Payloads that do not fit a Single Frame fail with [`TpError::PayloadTooLarge`].
    pub fn send_functional_to(
        &mut self,
        functional_target: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), TpError<Tx::Error>> {
        if payload.len() > self.base_cfg.max_single_frame_payload() {
            return Err(TpError::PayloadTooLarge);
        }
        let id = fixed29::encode_func_id(functional_target, self.local_addr);
        let segment = Segment::Single {
            len: payload.len() as u8,
            data: payload,
        };
        let frame = encode_frame::<F>(id, &segment, &self.base_cfg.tx_wire())
            .map_err(|_| TpError::PayloadTooLarge)?;
        self.tx
            .send_timeout(&frame, timeout)
            .map_err(TpError::Transport)
    }

    fn cancel_tx(&mut self, remote: u8) {
        if let Some(idx) = self.find(remote)
            && let Some(session) = self.sessions[idx].as_mut()
        {
            session.sender.cancel();
            self.release_if_terminal(idx);
        }
    }

    fn send_fc_frame(
        tx: &mut Tx,
        cfg: &TpConfig,
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
    ) -> Result<(), TpError<Tx::Error>> {
        let fc = Segment::FlowControl {
            status,
            block_size,
            st_min,
        };
        let frame = encode_frame::<F>(cfg.tx_id, &fc, &cfg.tx_wire())
            .map_err(|_| TpError::MalformedPci)?;
        tx.try_send(&frame).map_err(TpError::Transport)
    }
}
