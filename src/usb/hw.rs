//! Peripheral abstraction.
//!
//! The engine never touches registers. Everything it needs from the USB
//! block goes through [`UsbPeripheral`]: endpoint register programming,
//! status handshakes, transfer-complete flags, byte counts and copies
//! to/from packet memory.

use crate::usb::endpoint::{Direction, TransferType};

/// Handshake an endpoint half answers the host with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointStatus {
    #[default]
    Disabled,
    Stall,
    Nak,
    Valid,
}

/// Interrupt causes the dispatcher handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Interrupts {
    /// Correct transfer on some endpoint.
    pub transfer: bool,
    pub reset: bool,
    pub suspend: bool,
    pub wakeup: bool,
    /// Start of frame.
    pub sof: bool,
    /// Expected start of frame missed (1 ms tick while suspended/resuming).
    pub esof: bool,
    pub error: bool,
    pub pma_overrun: bool,
}

impl Interrupts {
    pub const NONE: Self = Self {
        transfer: false,
        reset: false,
        suspend: false,
        wakeup: false,
        sof: false,
        esof: false,
        error: false,
        pma_overrun: false,
    };

    pub fn union(self, other: Self) -> Self {
        Self {
            transfer: self.transfer | other.transfer,
            reset: self.reset | other.reset,
            suspend: self.suspend | other.suspend,
            wakeup: self.wakeup | other.wakeup,
            sof: self.sof | other.sof,
            esof: self.esof | other.esof,
            error: self.error | other.error,
            pma_overrun: self.pma_overrun | other.pma_overrun,
        }
    }

    /// Flags set in `self` but not in `other`.
    pub fn without(self, other: Self) -> Self {
        Self {
            transfer: self.transfer & !other.transfer,
            reset: self.reset & !other.reset,
            suspend: self.suspend & !other.suspend,
            wakeup: self.wakeup & !other.wakeup,
            sof: self.sof & !other.sof,
            esof: self.esof & !other.esof,
            error: self.error & !other.error,
            pma_overrun: self.pma_overrun & !other.pma_overrun,
        }
    }
}

/// The endpoint with the highest-priority pending transfer-complete flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferEvent {
    /// Endpoint register index.
    pub address: u8,
    /// `Out` when the receive half completed, `In` for the transmit half.
    pub direction: Direction,
    /// The completed OUT transaction was a SETUP.
    pub setup: bool,
}

/// A buffer-descriptor table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BufferDesc {
    pub offset: usize,
    pub size: usize,
}

/// Programming of one endpoint register and its descriptor-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HwEndpoint {
    pub address: u8,
    pub transfer_type: TransferType,
    /// Direction both buffers serve when the endpoint is double-buffered.
    pub double_buffered: Option<Direction>,
    /// Transmit descriptor: first buffer of a double-buffered IN, second
    /// buffer of a double-buffered OUT.
    pub tx: Option<BufferDesc>,
    /// Receive descriptor: first buffer of a double-buffered OUT, second
    /// buffer of a double-buffered IN.
    pub rx: Option<BufferDesc>,
}

/// Legal operations on a PMA-based full-speed USB peripheral.
pub trait UsbPeripheral {
    /// Leave power-down and force a reset of the USB block.
    fn power_up(&mut self);

    fn power_down(&mut self);

    /// Connect or disconnect the D+ pull-up.
    fn set_bus_presence(&mut self, present: bool);

    fn interrupts(&mut self) -> Interrupts;

    fn clear_interrupts(&mut self, which: Interrupts);

    /// Next endpoint with a transfer-complete flag set.
    fn pending_transfer(&mut self) -> Option<TransferEvent>;

    fn configure_endpoint(&mut self, index: u8, ep: &HwEndpoint);

    fn set_status(&mut self, index: u8, direction: Direction, status: EndpointStatus);

    fn status(&self, index: u8, direction: Direction) -> EndpointStatus;

    fn transfer_complete(&self, index: u8, direction: Direction) -> bool;

    fn clear_transfer_complete(&mut self, index: u8, direction: Direction);

    fn reset_data_toggle(&mut self, index: u8, direction: Direction);

    /// Bytes received by the last OUT/SETUP transaction.
    fn rx_count(&self, index: u8) -> usize;

    fn set_tx_count(&mut self, index: u8, count: usize);

    fn write_packet_memory(&mut self, offset: usize, data: &[u8]);

    fn read_packet_memory(&self, offset: usize, out: &mut [u8]);

    /// Program the device address and enable the function.
    fn set_address(&mut self, address: u8);

    /// Enter low-power suspend.
    fn suspend(&mut self);

    /// Leave low-power suspend.
    fn wake(&mut self);

    /// Drive (or release) resume signalling on the bus.
    fn set_resume_signal(&mut self, on: bool);
}
