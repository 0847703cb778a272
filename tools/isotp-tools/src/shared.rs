//! Split one duplex CAN socket into independently owned Tx/Rx halves.
//!
//! SocketCAN sockets are duplex but the engine wants separate halves; wrapping the socket in an
//! `Arc<Mutex<_>>` keeps every operation on one underlying file descriptor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use can_frame_io::{RxFrameIo, TxFrameIo};

/// Transmit half of a shared CAN socket.
#[derive(Clone)]
pub struct SharedTx<T> {
    inner: Arc<Mutex<T>>,
}

/// Receive half of a shared CAN socket.
#[derive(Clone)]
pub struct SharedRx<T> {
    inner: Arc<Mutex<T>>,
}

/// Wrap `can` and return its shared halves.
pub fn split_shared<T>(can: T) -> (SharedTx<T>, SharedRx<T>) {
    let inner = Arc::new(Mutex::new(can));
    (
        SharedTx {
            inner: inner.clone(),
        },
        SharedRx { inner },
    )
}

impl<T> TxFrameIo for SharedTx<T>
where
    T: TxFrameIo,
{
    type Frame = T::Frame;
    type Error = T::Error;

    fn send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.inner.lock().unwrap().send(frame)
    }

    fn try_send(&mut self, frame: &Self::Frame) -> Result<(), Self::Error> {
        self.inner.lock().unwrap().try_send(frame)
    }

    fn send_timeout(&mut self, frame: &Self::Frame, timeout: Duration) -> Result<(), Self::Error> {
        self.inner.lock().unwrap().send_timeout(frame, timeout)
    }
}

impl<T> RxFrameIo for SharedRx<T>
where
    T: RxFrameIo,
{
    type Frame = T::Frame;
    type Error = T::Error;

    fn recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.inner.lock().unwrap().recv()
    }

    fn try_recv(&mut self) -> Result<Self::Frame, Self::Error> {
        self.inner.lock().unwrap().try_recv()
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Self::Frame, Self::Error> {
        self.inner.lock().unwrap().recv_timeout(timeout)
    }

    fn wait_not_empty(&mut self) -> Result<(), Self::Error> {
        self.inner.lock().unwrap().wait_not_empty()
    }
}
