//! In-memory broadcast CAN bus for tests.
//!
//! A [`BusHandle`] owns a simulated bus; every interface attached via [`BusHandle::add_interface`]
//! or [`MockCan::new_with_bus`] sees all frames transmitted by the others (minus whatever its
//! acceptance filters reject). Frames are delivered in transmit order; there is no simulated
//! arbitration or timing.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use can_frame_io::{
    BlockingControl, FilterConfig, Id, IdMaskFilter, RxFrameIo, SplitTxRx, TxFrameIo,
};
use embedded_can::Frame as EmbeddedFrame;

const MAX_DLC: usize = 64;

/// CAN frame carried by the mock bus (classic or FD payload sizes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MockFrame {
    id: Id,
    data: [u8; MAX_DLC],
    dlc: u8,
    remote: bool,
}

impl EmbeddedFrame for MockFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_DLC {
            return None;
        }
        let mut buf = [0u8; MAX_DLC];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            data: buf,
            dlc: data.len() as u8,
            remote: false,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > MAX_DLC {
            return None;
        }
        Some(Self {
            id: id.into(),
            data: [0u8; MAX_DLC],
            dlc: dlc as u8,
            remote: true,
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.dlc as usize]
        }
    }
}

/// Errors surfaced by the mock backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    /// Non-blocking operation found no pending frame.
    WouldBlock,
    /// Deadline passed before a frame arrived.
    TimedOut,
    /// The bus was dropped while the interface was still attached.
    Disconnected,
}

impl core::fmt::Display for MockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MockError::WouldBlock => write!(f, "would block"),
            MockError::TimedOut => write!(f, "timed out"),
            MockError::Disconnected => write!(f, "bus disconnected"),
        }
    }
}

impl std::error::Error for MockError {}

struct Port {
    queue: VecDeque<MockFrame>,
    filters: Vec<IdMaskFilter>,
    attached: bool,
}

struct BusInner {
    ports: Vec<Port>,
}

struct Bus {
    inner: Mutex<BusInner>,
    arrived: Condvar,
}

/// Handle to a shared simulated bus.
#[derive(Clone)]
pub struct BusHandle {
    bus: Arc<Bus>,
}

impl BusHandle {
    /// Create a new empty bus.
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Bus {
                inner: Mutex::new(BusInner { ports: Vec::new() }),
                arrived: Condvar::new(),
            }),
        }
    }

    /// Attach a new interface with the given acceptance filters (empty = accept all).
    pub fn add_interface(&self, filters: Vec<IdMaskFilter>) -> Result<MockCan, MockError> {
        let mut inner = self.bus.inner.lock().unwrap();
        let port = inner.ports.len();
        inner.ports.push(Port {
            queue: VecDeque::new(),
            filters,
            attached: true,
        });
        Ok(MockCan {
            bus: self.bus.clone(),
            port,
        })
    }
}

impl Default for BusHandle {
    fn default() -> Self {
        Self::new()
    }
}

fn accepts(filters: &[IdMaskFilter], id: Id) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(id))
}

fn broadcast(bus: &Bus, from: usize, frame: &MockFrame) {
    let mut inner = bus.inner.lock().unwrap();
    for (idx, port) in inner.ports.iter_mut().enumerate() {
        // No local echo; a node never receives its own transmissions.
        if idx == from || !port.attached {
            continue;
        }
        if accepts(&port.filters, frame.id) {
            port.queue.push_back(*frame);
        }
    }
    drop(inner);
    bus.arrived.notify_all();
}

/// One interface attached to a [`BusHandle`].
pub struct MockCan {
    bus: Arc<Bus>,
    port: usize,
}

impl MockCan {
    /// Attach a new interface to `bus` with the given filters.
    pub fn new_with_bus(bus: &BusHandle, filters: Vec<IdMaskFilter>) -> Result<Self, MockError> {
        bus.add_interface(filters)
    }

    /// Transmit a frame onto the bus (visible to all other interfaces).
    pub fn transmit(&self, frame: MockFrame) -> Result<(), MockError> {
        broadcast(&self.bus, self.port, &frame);
        Ok(())
    }

    fn pop(&self) -> Option<MockFrame> {
        let mut inner = self.bus.inner.lock().unwrap();
        inner.ports[self.port].queue.pop_front()
    }

    fn pop_deadline(&self, deadline: Option<Instant>) -> Result<MockFrame, MockError> {
        let mut inner = self.bus.inner.lock().unwrap();
        loop {
            if let Some(frame) = inner.ports[self.port].queue.pop_front() {
                return Ok(frame);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(MockError::TimedOut);
                    }
                    let (guard, timed_out) = self
                        .bus
                        .arrived
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                    if timed_out.timed_out() && inner.ports[self.port].queue.is_empty() {
                        return Err(MockError::TimedOut);
                    }
                }
                None => {
                    inner = self.bus.arrived.wait(inner).unwrap();
                }
            }
        }
    }
}

impl Drop for MockCan {
    fn drop(&mut self) {
        let mut inner = self.bus.inner.lock().unwrap();
        inner.ports[self.port].attached = false;
        inner.ports[self.port].queue.clear();
    }
}

impl TxFrameIo for MockCan {
    type Frame = MockFrame;
    type Error = MockError;

    fn send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.transmit(*frame)
    }

    fn try_send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.transmit(*frame)
    }

    fn send_timeout(&mut self, frame: &Self::Frame, _timeout: Duration) -> Result<(), Self::Error> {
        self.transmit(*frame)
    }
}

impl RxFrameIo for MockCan {
    type Frame = MockFrame;
    type Error = MockError;

    fn recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.pop_deadline(None)
    }

    fn try_recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.pop().ok_or(MockError::WouldBlock)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Self::Frame, Self::Error> {
        self.pop_deadline(Some(Instant::now() + timeout))
    }

    fn wait_not_empty(&mut self) -> Result<(), Self::Error> {
        let mut inner = self.bus.inner.lock().unwrap();
        while inner.ports[self.port].queue.is_empty() {
            inner = self.bus.arrived.wait(inner).unwrap();
        }
        Ok(())
    }
}

impl FilterConfig for MockCan {
    type Error = MockError;

    fn set_filters(&mut self, filters: &[IdMaskFilter]) -> Result<(), Self::Error> {
        let mut inner = self.bus.inner.lock().unwrap();
        inner.ports[self.port].filters = filters.to_vec();
        Ok(())
    }
}

impl BlockingControl for MockCan {
    type Error = MockError;

    fn set_nonblocking(&mut self, _on: bool) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Transmit half of a split [`MockCan`].
pub struct MockTx {
    can: MockCan,
}

/// Receive half of a split [`MockCan`].
///
/// Both halves stay attached to the same bus port, so frames transmitted through the Tx half are
/// not echoed back to the Rx half.
pub struct MockRx {
    bus: Arc<Bus>,
    port: usize,
}

impl SplitTxRx for MockCan {
    type Tx = MockTx;
    type Rx = MockRx;

    fn split(self) -> (Self::Tx, Self::Rx) {
        let rx = MockRx {
            bus: self.bus.clone(),
            port: self.port,
        };
        (MockTx { can: self }, rx)
    }
}

impl TxFrameIo for MockTx {
    type Frame = MockFrame;
    type Error = MockError;

    fn send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.can.transmit(*frame)
    }

    fn try_send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.can.transmit(*frame)
    }

    fn send_timeout(&mut self, frame: &Self::Frame, _timeout: Duration) -> Result<(), Self::Error> {
        self.can.transmit(*frame)
    }
}

impl MockRx {
    fn pop(&self) -> Option<MockFrame> {
        let mut inner = self.bus.inner.lock().unwrap();
        inner.ports[self.port].queue.pop_front()
    }

    fn pop_deadline(&self, deadline: Option<Instant>) -> Result<MockFrame, MockError> {
        let mut inner = self.bus.inner.lock().unwrap();
        loop {
            if let Some(frame) = inner.ports[self.port].queue.pop_front() {
                return Ok(frame);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(MockError::TimedOut);
                    }
                    let (guard, timed_out) = self
                        .bus
                        .arrived
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                    if timed_out.timed_out() && inner.ports[self.port].queue.is_empty() {
                        return Err(MockError::TimedOut);
                    }
                }
                None => {
                    inner = self.bus.arrived.wait(inner).unwrap();
                }
            }
        }
    }
}

impl RxFrameIo for MockRx {
    type Frame = MockFrame;
    type Error = MockError;

    fn recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.pop_deadline(None)
    }

    fn try_recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.pop().ok_or(MockError::WouldBlock)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Self::Frame, Self::Error> {
        self.pop_deadline(Some(Instant::now() + timeout))
    }

    fn wait_not_empty(&mut self) -> Result<(), Self::Error> {
        let mut inner = self.bus.inner.lock().unwrap();
        while inner.ports[self.port].queue.is_empty() {
            inner = self.bus.arrived.wait(inner).unwrap();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_frame_io::StandardId;

    fn frame(id: u16, data: &[u8]) -> MockFrame {
        MockFrame::new(Id::Standard(StandardId::new(id).unwrap()), data).unwrap()
    }

    #[test]
    fn broadcast_reaches_all_other_ports() {
        let bus = BusHandle::new();
        let a = bus.add_interface(vec![]).unwrap();
        let mut b = bus.add_interface(vec![]).unwrap();
        let mut c = bus.add_interface(vec![]).unwrap();

        a.transmit(frame(0x123, &[1, 2, 3])).unwrap();

        assert_eq!(b.try_recv().unwrap().data(), &[1, 2, 3]);
        assert_eq!(c.try_recv().unwrap().data(), &[1, 2, 3]);
    }

    #[test]
    fn no_local_echo() {
        let bus = BusHandle::new();
        let mut a = bus.add_interface(vec![]).unwrap();
        a.transmit(frame(0x123, &[9])).unwrap();
        assert_eq!(a.try_recv(), Err(MockError::WouldBlock));
    }

    #[test]
    fn filters_drop_unmatched_ids() {
        let bus = BusHandle::new();
        let a = bus.add_interface(vec![]).unwrap();
        let mut b = bus
            .add_interface(vec![IdMaskFilter::exact(Id::Standard(
                StandardId::new(0x100).unwrap(),
            ))])
            .unwrap();

        a.transmit(frame(0x200, &[1])).unwrap();
        a.transmit(frame(0x100, &[2])).unwrap();

        assert_eq!(b.try_recv().unwrap().data(), &[2]);
        assert_eq!(b.try_recv(), Err(MockError::WouldBlock));
    }

    #[test]
    fn split_halves_share_the_port() {
        let bus = BusHandle::new();
        let a = bus.add_interface(vec![]).unwrap();
        let b = bus.add_interface(vec![]).unwrap();

        let (mut tx_a, _rx_a) = a.split();
        let (_tx_b, mut rx_b) = b.split();

        tx_a.try_send(&frame(0x42, &[7, 7])).unwrap();
        assert_eq!(rx_b.try_recv().unwrap().data(), &[7, 7]);
    }

    #[test]
    fn recv_timeout_expires_on_silence() {
        let bus = BusHandle::new();
        let mut a = bus.add_interface(vec![]).unwrap();
        let err = a.recv_timeout(Duration::from_millis(20));
        assert_eq!(err, Err(MockError::TimedOut));
    }
}
