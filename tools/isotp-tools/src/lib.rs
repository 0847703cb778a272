//! Shared plumbing for the ISO-TP command-line tools.
//!
//! The binaries in this crate mirror the classic ISO-TP tool set: `isotpsend`, `isotprecv`,
//! `isotpdump`, `isotpsniffer`, `isotpperf` and `isotpserver`. This library holds the pieces
//! they share: CAN-id and option parsing, the stdin/stdout hex payload format, the TCP bridge
//! framing, timestamp formatting and the `Arc<Mutex<_>>` splitter that turns one SocketCAN
//! socket into independently owned Tx/Rx halves.

pub mod bridge;
pub mod canid;
pub mod hex;
pub mod opts;
pub mod shared;
pub mod stamp;
