//! ISO-TP endpoint configuration.

use core::time::Duration;

use can_frame_io::Id;

use crate::segment::{MAX_FRAME_LEN, MAX_STD_PDU_LEN, WireFormat, first_frame_header_len};

/// Validation applied to the padding of received frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingCheck {
    /// Accept any frame length and content.
    #[default]
    Off,
    /// Require received frames to be padded to the full frame length.
    Length,
    /// Require padding bytes to carry the configured rx padding value.
    Content,
    /// Both length and content checks.
    All,
}

impl PaddingCheck {
    /// Whether the length requirement is active.
    pub fn checks_length(&self) -> bool {
        matches!(self, PaddingCheck::Length | PaddingCheck::All)
    }

    /// Whether the content requirement is active.
    pub fn checks_content(&self) -> bool {
        matches!(self, PaddingCheck::Content | PaddingCheck::All)
    }
}

/// Configuration for an ISO-TP endpoint.
#[derive(Debug, Clone)]
pub struct TpConfig {
    /// CAN identifier used when transmitting.
    pub tx_id: Id,
    /// CAN identifier expected when receiving.
    pub rx_id: Id,
    /// Optional addressing byte prepended to transmitted frames (extended/mixed addressing).
    pub tx_addr: Option<u8>,
    /// Optional addressing byte expected on received frames (extended/mixed addressing).
    pub rx_addr: Option<u8>,
    /// Consecutive frames granted per flow control when receiving (0 = unlimited).
    pub block_size: u8,
    /// Minimum separation time advertised to the remote sender.
    pub st_min: Duration,
    /// Ignore the separation time advertised by the peer and pace by this value instead.
    pub force_tx_st_min: Option<Duration>,
    /// Maximum number of FlowControl Wait frames tolerated before aborting.
    pub wft_max: u8,
    /// Optional fill byte for transmitted frames (None = no padding).
    pub tx_padding: Option<u8>,
    /// Expected fill byte on received frames, checked per [`TpConfig::padding_check`].
    pub rx_padding: Option<u8>,
    /// Validation applied to received frame padding.
    pub padding_check: PaddingCheck,
    /// Reassemble inbound transfers but never answer with flow control (bus observer).
    pub listen_only: bool,
    /// Maximum application payload length accepted in either direction.
    pub max_pdu_len: usize,
    /// Timeout for transmitting a single frame.
    pub n_as: Duration,
    /// Timeout for receiving a single frame.
    pub n_ar: Duration,
    /// Timeout waiting for flow control after a First Frame or completed block.
    pub n_bs: Duration,
    /// Timeout for answering a First Frame with flow control.
    pub n_br: Duration,
    /// Minimum gap enforced between consecutive frame transmissions, independent of the
    /// peer-advertised STmin (0 = follow STmin alone).
    pub n_cs: Duration,
    /// Timeout waiting for the next Consecutive Frame while receiving.
    pub n_cr: Duration,
    /// CAN payload size put on the wire: 8 for classic CAN, up to 64 for CAN FD.
    pub frame_len: usize,
}

impl Default for TpConfig {
    /// Baseline config with zeroed IDs, classic CAN frames and 4 KB payload limit.
    fn default() -> Self {
        Self {
            tx_id: Id::Standard(can_frame_io::StandardId::ZERO),
            rx_id: Id::Standard(can_frame_io::StandardId::ZERO),
            tx_addr: None,
            rx_addr: None,
            block_size: 0,
            st_min: Duration::from_millis(0),
            force_tx_st_min: None,
            wft_max: 0,
            tx_padding: None,
            rx_padding: None,
            padding_check: PaddingCheck::Off,
            listen_only: false,
            max_pdu_len: MAX_STD_PDU_LEN,
            n_as: Duration::from_millis(1000),
            n_ar: Duration::from_millis(1000),
            n_bs: Duration::from_millis(1000),
            n_br: Duration::from_millis(1000),
            n_cs: Duration::ZERO,
            n_cr: Duration::from_millis(1000),
            frame_len: 8,
        }
    }
}

impl TpConfig {
    /// Reject invalid limits or mirrored identifiers.
    pub fn validate(&self) -> Result<(), crate::errors::ProtocolError> {
        if self.max_pdu_len == 0 || self.max_pdu_len > u32::MAX as usize {
            return Err(crate::errors::TpError::InvalidConfig);
        }
        if !(8..=MAX_FRAME_LEN).contains(&self.frame_len) {
            return Err(crate::errors::TpError::InvalidConfig);
        }
        // A node talking to itself needs at least distinct addressing bytes.
        if !self.listen_only
            && self.tx_id == self.rx_id
            && (self.tx_addr.is_none() || self.rx_addr.is_none() || self.tx_addr == self.rx_addr)
        {
            return Err(crate::errors::TpError::InvalidConfig);
        }
        Ok(())
    }

    /// Index within an outgoing CAN payload where the PCI starts.
    pub fn tx_pci_offset(&self) -> usize {
        usize::from(self.tx_addr.is_some())
    }

    /// Index within an incoming CAN payload where the PCI starts.
    pub fn rx_pci_offset(&self) -> usize {
        usize::from(self.rx_addr.is_some())
    }

    /// Wire shape for transmitted frames.
    pub fn tx_wire(&self) -> WireFormat {
        WireFormat {
            addr_byte: self.tx_addr,
            padding: self.tx_padding,
            frame_len: self.frame_len,
        }
    }

    /// Max application bytes in a Single Frame under the configured transmit addressing.
    pub fn max_single_frame_payload(&self) -> usize {
        let offset = self.tx_pci_offset();
        if self.frame_len > 8 {
            self.frame_len.saturating_sub(2 + offset)
        } else {
            7usize.saturating_sub(offset)
        }
    }

    /// Max application bytes in the First Frame of a PDU totalling `total_len` bytes.
    pub fn max_first_frame_payload(&self, total_len: u32) -> usize {
        self.frame_len
            .saturating_sub(first_frame_header_len(total_len) + self.tx_pci_offset())
    }

    /// Max application bytes in a Consecutive Frame under the configured transmit addressing.
    pub fn max_consecutive_frame_payload(&self) -> usize {
        self.frame_len.saturating_sub(1 + self.tx_pci_offset())
    }
}

/// Receive-side flow-control parameters advertised to the remote sender.
///
/// Updating them at runtime shapes the peer's transmission rate based on backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxFlowControl {
    /// Block size (0 = unlimited).
    pub block_size: u8,
    /// Minimum separation time between consecutive frames.
    pub st_min: Duration,
}

impl RxFlowControl {
    /// Build flow-control parameters from an endpoint's static configuration.
    pub fn from_config(cfg: &TpConfig) -> Self {
        Self {
            block_size: cfg.block_size,
            st_min: cfg.st_min,
        }
    }
}
