//! Simulated USB peripheral with a scripted host side.
//!
//! Behaves like the PMA-based full-speed block as far as the engine can
//! observe: endpoint halves answer with their programmed handshake, a
//! completed transaction sets the transfer-complete flag and drops the half
//! to NAK, and SETUP packets are always accepted on a control endpoint.
//! The `host_*` methods are what a host controller would do on the wire.

use crate::config::{CONFIG_DESCRIPTOR_CAPACITY, EP0_MAX_PACKET, NUM_ENDPOINTS, PMA_SIZE};
use crate::usb::descriptor::CONFIG_HEADER_LEN;
use crate::usb::device::UsbDevice;
use crate::usb::endpoint::{Direction, TransferType};
use crate::usb::hw::{EndpointStatus, HwEndpoint, Interrupts, TransferEvent, UsbPeripheral};
use crate::usb::setup::{request, SetupPacket};

/// Handshake returned to the simulated host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshake {
    Nak,
    Stall,
    /// Endpoint not configured / disabled.
    NoResponse,
}

/// Register state of one simulated endpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimEndpoint {
    pub config: Option<HwEndpoint>,
    pub tx_status: EndpointStatus,
    pub rx_status: EndpointStatus,
    pub ctr_tx: bool,
    pub ctr_rx: bool,
    pub setup: bool,
    pub tx_count: usize,
    pub rx_count: usize,
    pub tx_toggle: bool,
    pub rx_toggle: bool,
}

pub struct SimPeripheral {
    pma: [u8; PMA_SIZE],
    endpoints: [SimEndpoint; NUM_ENDPOINTS],
    /// Completions still to re-assert per endpoint half.
    redeliver: [[u8; 2]; NUM_ENDPOINTS],
    pending: Interrupts,
    address: u8,
    powered: bool,
    present: bool,
    low_power: bool,
    resume_signal: bool,
}

impl Default for SimPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPeripheral {
    pub fn new() -> Self {
        Self {
            pma: [0; PMA_SIZE],
            endpoints: [SimEndpoint::default(); NUM_ENDPOINTS],
            redeliver: [[0; 2]; NUM_ENDPOINTS],
            pending: Interrupts::NONE,
            address: 0,
            powered: false,
            present: false,
            low_power: false,
            resume_signal: false,
        }
    }

    // Observation

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn is_low_power(&self) -> bool {
        self.low_power
    }

    pub fn resume_signal(&self) -> bool {
        self.resume_signal
    }

    pub fn endpoint(&self, index: u8) -> &SimEndpoint {
        &self.endpoints[index as usize]
    }

    pub fn pending(&self) -> Interrupts {
        self.pending
    }

    pub fn pma(&self) -> &[u8] {
        &self.pma
    }

    // Host side

    /// Raise interrupt flags (reset, suspend, wakeup, SOF, ESOF, ...).
    pub fn raise(&mut self, irq: Interrupts) {
        if irq.reset {
            // The block resets endpoint registers and the address on bus reset.
            self.endpoints = [SimEndpoint::default(); NUM_ENDPOINTS];
            self.address = 0;
        }
        self.pending = self.pending.union(irq);
    }

    pub fn bus_reset(&mut self) {
        self.raise(Interrupts {
            reset: true,
            ..Interrupts::NONE
        });
    }

    pub fn start_of_frame(&mut self) {
        self.raise(Interrupts {
            sof: true,
            ..Interrupts::NONE
        });
    }

    /// SETUP transaction on control endpoint `index`.
    pub fn host_setup(&mut self, index: u8, packet: &[u8; 8]) -> Result<(), Handshake> {
        let ep = &mut self.endpoints[index as usize];
        let Some(cfg) = ep.config else {
            return Err(Handshake::NoResponse);
        };
        if cfg.transfer_type != TransferType::Control {
            return Err(Handshake::NoResponse);
        }
        let Some(rx) = cfg.rx else {
            return Err(Handshake::NoResponse);
        };
        self.pma[rx.offset..rx.offset + 8].copy_from_slice(packet);
        ep.rx_count = 8;
        ep.ctr_rx = true;
        ep.setup = true;
        ep.rx_status = EndpointStatus::Nak;
        ep.tx_status = EndpointStatus::Nak;
        // SETUP always resets both toggles to DATA1 for the next stage.
        ep.tx_toggle = true;
        ep.rx_toggle = true;
        self.pending.transfer = true;
        Ok(())
    }

    /// OUT transaction carrying `data`.
    pub fn host_out(&mut self, index: u8, data: &[u8]) -> Result<(), Handshake> {
        let ep = &mut self.endpoints[index as usize];
        let rx = match (ep.rx_status, ep.config.and_then(|c| c.rx)) {
            (EndpointStatus::Valid, Some(rx)) => rx,
            (EndpointStatus::Stall, _) => return Err(Handshake::Stall),
            (EndpointStatus::Nak, _) => return Err(Handshake::Nak),
            _ => return Err(Handshake::NoResponse),
        };
        let n = data.len().min(rx.size);
        self.pma[rx.offset..rx.offset + n].copy_from_slice(&data[..n]);
        ep.rx_count = n;
        ep.ctr_rx = true;
        ep.setup = false;
        ep.rx_toggle = !ep.rx_toggle;
        ep.rx_status = EndpointStatus::Nak;
        self.pending.transfer = true;
        Ok(())
    }

    /// IN transaction; the packet lands in `out`. Returns its length.
    pub fn host_in(&mut self, index: u8, out: &mut [u8]) -> Result<usize, Handshake> {
        let ep = &mut self.endpoints[index as usize];
        let tx = match (ep.tx_status, ep.config.and_then(|c| c.tx)) {
            (EndpointStatus::Valid, Some(tx)) => tx,
            (EndpointStatus::Stall, _) => return Err(Handshake::Stall),
            (EndpointStatus::Nak, _) => return Err(Handshake::Nak),
            _ => return Err(Handshake::NoResponse),
        };
        let n = ep.tx_count.min(tx.size).min(out.len());
        out[..n].copy_from_slice(&self.pma[tx.offset..tx.offset + n]);
        ep.ctr_tx = true;
        ep.tx_toggle = !ep.tx_toggle;
        ep.tx_status = EndpointStatus::Nak;
        self.pending.transfer = true;
        Ok(n)
    }

    /// The next `times` clears of this half's transfer-complete flag
    /// leave it set, as if the host finished another transaction while
    /// the interrupt handler was still running.
    pub fn redeliver(&mut self, index: u8, direction: Direction, times: u8) {
        self.redeliver[index as usize][direction.index()] = times;
    }

    fn refresh_transfer_flag(&mut self) {
        self.pending.transfer = self.endpoints.iter().any(|e| e.ctr_rx || e.ctr_tx);
    }
}

impl UsbPeripheral for SimPeripheral {
    fn power_up(&mut self) {
        self.powered = true;
        self.pending = Interrupts::NONE;
    }

    fn power_down(&mut self) {
        self.powered = false;
        self.endpoints = [SimEndpoint::default(); NUM_ENDPOINTS];
        self.address = 0;
    }

    fn set_bus_presence(&mut self, present: bool) {
        self.present = present;
    }

    fn interrupts(&mut self) -> Interrupts {
        self.refresh_transfer_flag();
        self.pending
    }

    fn clear_interrupts(&mut self, which: Interrupts) {
        self.pending = self.pending.without(which);
    }

    fn pending_transfer(&mut self) -> Option<TransferEvent> {
        self.endpoints
            .iter()
            .enumerate()
            .find(|(_, e)| e.ctr_rx || e.ctr_tx)
            .map(|(i, e)| TransferEvent {
                address: i as u8,
                direction: if e.ctr_rx { Direction::Out } else { Direction::In },
                setup: e.ctr_rx && e.setup,
            })
    }

    fn configure_endpoint(&mut self, index: u8, ep: &HwEndpoint) {
        let slot = &mut self.endpoints[index as usize];
        slot.config = Some(*ep);
        slot.ctr_rx = false;
        slot.ctr_tx = false;
        slot.setup = false;
        slot.tx_toggle = false;
        slot.rx_toggle = false;
    }

    fn set_status(&mut self, index: u8, direction: Direction, status: EndpointStatus) {
        let ep = &mut self.endpoints[index as usize];
        match direction {
            Direction::In => ep.tx_status = status,
            Direction::Out => ep.rx_status = status,
        }
    }

    fn status(&self, index: u8, direction: Direction) -> EndpointStatus {
        let ep = &self.endpoints[index as usize];
        match direction {
            Direction::In => ep.tx_status,
            Direction::Out => ep.rx_status,
        }
    }

    fn transfer_complete(&self, index: u8, direction: Direction) -> bool {
        let ep = &self.endpoints[index as usize];
        match direction {
            Direction::In => ep.ctr_tx,
            Direction::Out => ep.ctr_rx,
        }
    }

    fn clear_transfer_complete(&mut self, index: u8, direction: Direction) {
        let left = &mut self.redeliver[index as usize][direction.index()];
        if *left > 0 {
            *left -= 1;
            return;
        }
        let ep = &mut self.endpoints[index as usize];
        match direction {
            Direction::In => ep.ctr_tx = false,
            Direction::Out => {
                ep.ctr_rx = false;
                ep.setup = false;
            }
        }
        self.refresh_transfer_flag();
    }

    fn reset_data_toggle(&mut self, index: u8, direction: Direction) {
        let ep = &mut self.endpoints[index as usize];
        match direction {
            Direction::In => ep.tx_toggle = false,
            Direction::Out => ep.rx_toggle = false,
        }
    }

    fn rx_count(&self, index: u8) -> usize {
        self.endpoints[index as usize].rx_count
    }

    fn set_tx_count(&mut self, index: u8, count: usize) {
        self.endpoints[index as usize].tx_count = count;
    }

    fn write_packet_memory(&mut self, offset: usize, data: &[u8]) {
        let end = (offset + data.len()).min(PMA_SIZE);
        if offset < end {
            self.pma[offset..end].copy_from_slice(&data[..end - offset]);
        }
    }

    fn read_packet_memory(&self, offset: usize, out: &mut [u8]) {
        let end = (offset + out.len()).min(PMA_SIZE);
        if offset < end {
            out[..end - offset].copy_from_slice(&self.pma[offset..end]);
        }
    }

    fn set_address(&mut self, address: u8) {
        self.address = address & 0x7F;
    }

    fn suspend(&mut self) {
        self.low_power = true;
    }

    fn wake(&mut self) {
        self.low_power = false;
    }

    fn set_resume_signal(&mut self, on: bool) {
        self.resume_signal = on;
    }
}

// ---------------------------------------------------------------------------
// Host-side control transfers
// ---------------------------------------------------------------------------

/// Control read: SETUP, IN packets until a short one (or wLength), status
/// OUT. The device's interrupt handler runs after every transaction.
/// Returns the number of data bytes the device sent; bytes beyond
/// `buf.len()` are dropped.
pub fn control_read(
    dev: &mut UsbDevice<'_, SimPeripheral>,
    setup: SetupPacket,
    buf: &mut [u8],
) -> Result<usize, Handshake> {
    dev.peripheral_mut().host_setup(0, &setup.to_bytes())?;
    dev.on_interrupt();

    let mut total = 0;
    loop {
        let mut packet = [0u8; EP0_MAX_PACKET];
        let n = dev.peripheral_mut().host_in(0, &mut packet)?;
        dev.on_interrupt();
        let keep = n.min(buf.len().saturating_sub(total));
        buf[total..total + keep].copy_from_slice(&packet[..keep]);
        total += n;
        if n < EP0_MAX_PACKET || total >= setup.length as usize {
            break;
        }
    }
    dev.peripheral_mut().host_out(0, &[])?;
    dev.on_interrupt();
    Ok(total)
}

/// Control write: SETUP, `data` in max-packet OUT transactions (none for a
/// no-data request), status IN.
pub fn control_write(
    dev: &mut UsbDevice<'_, SimPeripheral>,
    setup: SetupPacket,
    data: &[u8],
) -> Result<(), Handshake> {
    dev.peripheral_mut().host_setup(0, &setup.to_bytes())?;
    dev.on_interrupt();
    for chunk in data.chunks(EP0_MAX_PACKET) {
        dev.peripheral_mut().host_out(0, chunk)?;
        dev.on_interrupt();
    }
    let mut status = [0u8; EP0_MAX_PACKET];
    dev.peripheral_mut().host_in(0, &mut status)?;
    dev.on_interrupt();
    Ok(())
}

/// What a host does after attach: bus reset, device descriptor, address,
/// configuration descriptor, SET_CONFIGURATION(1).
pub fn enumerate(dev: &mut UsbDevice<'_, SimPeripheral>, address: u8) -> Result<(), Handshake> {
    dev.peripheral_mut().bus_reset();
    dev.on_interrupt();

    let mut buf = [0u8; CONFIG_HEADER_LEN + CONFIG_DESCRIPTOR_CAPACITY];
    control_read(dev, standard_in(request::GET_DESCRIPTOR, 0x0100, 64), &mut buf)?;
    control_write(dev, standard_out(request::SET_ADDRESS, address as u16), &[])?;
    control_read(dev, standard_in(request::GET_DESCRIPTOR, 0x0200, 9), &mut buf)?;
    let total = u16::from_le_bytes([buf[2], buf[3]]);
    control_read(dev, standard_in(request::GET_DESCRIPTOR, 0x0200, total), &mut buf)?;
    control_write(dev, standard_out(request::SET_CONFIGURATION, 1), &[])
}

fn standard_in(request: u8, value: u16, length: u16) -> SetupPacket {
    SetupPacket {
        request_type: 0x80,
        request,
        value,
        index: 0,
        length,
    }
}

fn standard_out(request: u8, value: u16) -> SetupPacket {
    SetupPacket {
        request_type: 0x00,
        request,
        value,
        index: 0,
        length: 0,
    }
}
