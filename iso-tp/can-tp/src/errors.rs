//! Transport-layer error types.

use core::fmt;

/// Timeout category identifiers (ISO-TP naming).
///
/// - `N_As` / `N_Ar` bound transmission/reception of a single CAN frame at the lower layer.
/// - `N_Bs` bounds the wait for a FlowControl frame after a First Frame or a completed block.
/// - `N_Br` / `N_Cs` bound the receiver's FC answer and the sender's CF gap.
/// - `N_Cr` bounds the wait for the next Consecutive Frame while receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Timeout while sending a frame.
    NAs,
    /// Timeout while waiting for the receive queue.
    NAr,
    /// Timeout waiting for flow control.
    NBs,
    /// Timeout answering with flow control.
    NBr,
    /// Timeout between consecutive frame sends.
    NCs,
    /// Timeout waiting for the next consecutive frame.
    NCr,
}

impl TimeoutKind {
    fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::NAs => "N_As",
            TimeoutKind::NAr => "N_Ar",
            TimeoutKind::NBs => "N_Bs",
            TimeoutKind::NBr => "N_Br",
            TimeoutKind::NCs => "N_Cs",
            TimeoutKind::NCr => "N_Cr",
        }
    }
}

/// Errors surfaced by the ISO-TP engine.
///
/// Generic over the backend error type `E` so transport failures propagate untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpError<E> {
    /// Leading PCI byte(s) of a received frame do not form a valid segment.
    MalformedPci,
    /// Payload does not fit the configured frame/PDU limits; never truncated.
    PayloadTooLarge,
    /// Consecutive Frame sequence nibble broke the `(prev + 1) mod 16` chain.
    SequenceError,
    /// Deadline exceeded for the indicated protocol phase.
    ///
    /// `Timeout(NBs)` is the flow-control timeout, `Timeout(NCr)` the reception timeout.
    Timeout(TimeoutKind),
    /// Remote side aborted the transfer with FlowControl Overflow.
    FlowOverflow,
    /// A frame arrived that is invalid in the current state (e.g. a new First Frame while
    /// awaiting Flow Control).
    UnexpectedFrame,
    /// A transfer is already in flight for this session and direction.
    SessionBusy,
    /// Reassembly storage cannot hold the announced PDU.
    BufferOverflow,
    /// Configuration rejected at construction time.
    InvalidConfig,
    /// Backend would block in non-blocking mode.
    WouldBlock,
    /// Wrapper around backend-specific transport errors.
    Transport(E),
}

impl<E> From<E> for TpError<E> {
    /// Convert a backend-specific error into [`TpError::Transport`].
    fn from(err: E) -> Self {
        TpError::Transport(err)
    }
}

impl<E> TpError<E> {
    /// Re-wrap an engine-internal error (no transport variant) into a transport-typed one.
    pub(crate) fn widen(err: TpError<core::convert::Infallible>) -> Self {
        match err {
            TpError::MalformedPci => TpError::MalformedPci,
            TpError::PayloadTooLarge => TpError::PayloadTooLarge,
            TpError::SequenceError => TpError::SequenceError,
            TpError::Timeout(kind) => TpError::Timeout(kind),
            TpError::FlowOverflow => TpError::FlowOverflow,
            TpError::UnexpectedFrame => TpError::UnexpectedFrame,
            TpError::SessionBusy => TpError::SessionBusy,
            TpError::BufferOverflow => TpError::BufferOverflow,
            TpError::InvalidConfig => TpError::InvalidConfig,
            TpError::WouldBlock => TpError::WouldBlock,
            TpError::Transport(never) => match never {},
        }
    }
}

impl<E: fmt::Debug> fmt::Display for TpError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TpError::MalformedPci => write!(f, "malformed protocol control information"),
            TpError::PayloadTooLarge => write!(f, "payload too large for frame format"),
            TpError::SequenceError => write!(f, "consecutive frame sequence error"),
            TpError::Timeout(kind) => write!(f, "{} timeout", kind.as_str()),
            TpError::FlowOverflow => write!(f, "flow control reported overflow"),
            TpError::UnexpectedFrame => write!(f, "unexpected frame for current state"),
            TpError::SessionBusy => write!(f, "session already has a transfer in flight"),
            TpError::BufferOverflow => write!(f, "receive buffer cannot hold announced payload"),
            TpError::InvalidConfig => write!(f, "invalid configuration"),
            TpError::WouldBlock => write!(f, "operation would block"),
            TpError::Transport(err) => write!(f, "transport error: {err:?}"),
        }
    }
}

#[cfg(feature = "std")]
impl<E: fmt::Debug> std::error::Error for TpError<E> {}

/// Error type for engine-internal operations that cannot fail on the transport.
pub type ProtocolError = TpError<core::convert::Infallible>;
