//! STM32 full-speed USB peripheral (USB FS device with packet memory).
//!
//! [`UsbPeripheral`] for the STM32G4 family, on the register block the
//! embassy PAC exposes as `pac::USB` and the packet memory it exposes as
//! `pac::USBRAM`. Packet memory is 16 bits wide: PMA byte offset `n` is
//! half-word `n / 2`.
//!
//! EPnR fields are a mix of plain read/write bits, toggle-on-write-1 bits
//! (STAT, DTOG) and clear-on-write-0 bits (CTR). Every EPnR write starts
//! from [`preserve`] so unrelated fields are left untouched.

use embassy_stm32::pac;
use embassy_stm32::pac::usb::regs;
use embassy_stm32::pac::usb::vals::{EpType, Stat};
use embassy_stm32::peripherals::{PA11, PA12, USB};

use crate::config::{BTABLE_ENTRY_SIZE, NUM_ENDPOINTS, PMA_SIZE};
use crate::usb::endpoint::{Direction, TransferType};
use crate::usb::hw::{
    BufferDesc, EndpointStatus, HwEndpoint, Interrupts, TransferEvent, UsbPeripheral,
};

// COUNTn_RX
const COUNT_RX_BL_SIZE: u16 = 1 << 15;
const COUNT_RX_NUM_BLOCK_SHIFT: u16 = 10;
const COUNT_MASK: u16 = 0x03FF;

fn stat(status: EndpointStatus) -> Stat {
    match status {
        EndpointStatus::Disabled => Stat::DISABLED,
        EndpointStatus::Stall => Stat::STALL,
        EndpointStatus::Nak => Stat::NAK,
        EndpointStatus::Valid => Stat::VALID,
    }
}

fn endpoint_status(stat: Stat) -> EndpointStatus {
    match stat {
        Stat::DISABLED => EndpointStatus::Disabled,
        Stat::STALL => EndpointStatus::Stall,
        Stat::NAK => EndpointStatus::Nak,
        _ => EndpointStatus::Valid,
    }
}

fn ep_type(transfer_type: TransferType) -> EpType {
    match transfer_type {
        TransferType::Bulk => EpType::BULK,
        TransferType::Control => EpType::CONTROL,
        TransferType::Isochronous => EpType::ISO,
        TransferType::Interrupt => EpType::INTERRUPT,
    }
}

/// An EPnR value that, written back, changes nothing: CTR written as 1
/// is kept, STAT and DTOG written as 0 do not toggle.
fn preserve(mut epr: regs::Epr) -> regs::Epr {
    epr.set_ctr_rx(true);
    epr.set_ctr_tx(true);
    epr.set_dtog_rx(false);
    epr.set_dtog_tx(false);
    epr.set_stat_rx(Stat::from_bits(0));
    epr.set_stat_tx(Stat::from_bits(0));
    epr
}

/// COUNTn_RX value announcing a receive buffer of `size` bytes.
fn rx_count_field(size: usize) -> u16 {
    if size > 62 {
        let blocks = (size / 32).clamp(1, 32) as u16;
        COUNT_RX_BL_SIZE | ((blocks - 1) << COUNT_RX_NUM_BLOCK_SHIFT)
    } else {
        let blocks = (size / 2) as u16;
        blocks << COUNT_RX_NUM_BLOCK_SHIFT
    }
}

/// Half-word index of a buffer-descriptor table word. Entry layout:
/// ADDR_TX, COUNT_TX, ADDR_RX, COUNT_RX.
fn btable_word(index: u8, word: usize) -> usize {
    index as usize * BTABLE_ENTRY_SIZE / 2 + word
}

/// The USB FS block. Owning it owns the peripheral and its pins.
pub struct Stm32Usb {
    _usb: USB,
    _dp: PA12,
    _dm: PA11,
}

impl Stm32Usb {
    /// Take the peripheral. The 48 MHz clock must already be running
    /// (HSI48 with CRS, or a PLL output).
    pub fn new(usb: USB, dp: PA12, dm: PA11) -> Self {
        pac::RCC.apb1enr1().modify(|w| w.set_usben(true));
        Self {
            _usb: usb,
            _dp: dp,
            _dm: dm,
        }
    }

    fn pma_read_u16(&self, offset: usize) -> u16 {
        pac::USBRAM.mem(offset / 2).read()
    }

    fn pma_write_u16(&mut self, offset: usize, value: u16) {
        pac::USBRAM.mem(offset / 2).write_value(value);
    }

    /// Program descriptor half `word` (0 = TX, 2 = RX) with `buf`. A
    /// receiving buffer announces its capacity in the count word.
    fn set_buffer(&mut self, index: u8, word: usize, buf: BufferDesc, receive: bool) {
        let count = if receive { rx_count_field(buf.size) } else { 0 };
        pac::USBRAM
            .mem(btable_word(index, word))
            .write_value(buf.offset as u16);
        pac::USBRAM.mem(btable_word(index, word + 1)).write_value(count);
    }
}

impl UsbPeripheral for Stm32Usb {
    fn power_up(&mut self) {
        let usb = pac::USB;
        usb.cntr().write(|w| {
            w.set_pdwn(false);
            w.set_fres(true);
        });
        // tSTARTUP is 1 µs; plenty at any core clock the G4 runs USB at.
        cortex_m::asm::delay(200);
        usb.cntr().write(|w| w.set_fres(false));
        usb.istr().write_value(regs::Istr(0));
        usb.btable().write(|w| w.set_btable(0));
        usb.cntr().write(|w| {
            w.set_ctrm(true);
            w.set_pmaovrm(true);
            w.set_errm(true);
            w.set_wkupm(true);
            w.set_suspm(true);
            w.set_resetm(true);
            w.set_sofm(true);
            w.set_esofm(true);
        });
        debug!("USB: powered up");
    }

    fn power_down(&mut self) {
        pac::USB.cntr().write(|w| {
            w.set_fres(true);
            w.set_pdwn(true);
        });
        pac::USB.istr().write_value(regs::Istr(0));
    }

    fn set_bus_presence(&mut self, present: bool) {
        pac::USB.bcdr().modify(|w| w.set_dppu(present));
    }

    fn interrupts(&mut self) -> Interrupts {
        let istr = pac::USB.istr().read();
        Interrupts {
            transfer: istr.ctr(),
            reset: istr.reset(),
            suspend: istr.susp(),
            wakeup: istr.wkup(),
            sof: istr.sof(),
            esof: istr.esof(),
            error: istr.err(),
            pma_overrun: istr.pmaovr(),
        }
    }

    fn clear_interrupts(&mut self, which: Interrupts) {
        // rc_w0: zeros clear, ones are ignored. CTR is read-only.
        let mut clear = regs::Istr(!0);
        clear.set_reset(!which.reset);
        clear.set_susp(!which.suspend);
        clear.set_wkup(!which.wakeup);
        clear.set_sof(!which.sof);
        clear.set_esof(!which.esof);
        clear.set_err(!which.error);
        clear.set_pmaovr(!which.pma_overrun);
        pac::USB.istr().write_value(clear);
    }

    fn pending_transfer(&mut self) -> Option<TransferEvent> {
        let istr = pac::USB.istr().read();
        if !istr.ctr() {
            return None;
        }
        let address = istr.ep_id();
        let epr = pac::USB.epr(address as usize).read();
        let event = if epr.ctr_rx() {
            TransferEvent {
                address,
                direction: Direction::Out,
                setup: epr.setup(),
            }
        } else {
            TransferEvent {
                address,
                direction: Direction::In,
                setup: false,
            }
        };
        Some(event)
    }

    fn configure_endpoint(&mut self, index: u8, ep: &HwEndpoint) {
        if index as usize >= NUM_ENDPOINTS {
            return;
        }
        // Both buffers of a double-buffered endpoint serve its own
        // direction, so both count words follow that direction.
        let (tx_receives, rx_receives) = match ep.double_buffered {
            Some(Direction::Out) => (true, true),
            Some(Direction::In) => (false, false),
            None => (false, true),
        };
        if let Some(tx) = ep.tx {
            self.set_buffer(index, 0, tx, tx_receives);
        }
        if let Some(rx) = ep.rx {
            self.set_buffer(index, 2, rx, rx_receives);
        }

        // CTR bits written as 0 clear stale completions.
        let mut epr = regs::Epr(0);
        epr.set_ep_type(ep_type(ep.transfer_type));
        epr.set_ep_kind(ep.double_buffered.is_some());
        epr.set_ea(ep.address & 0x0F);
        pac::USB.epr(index as usize).write_value(epr);

        self.reset_data_toggle(index, Direction::In);
        self.reset_data_toggle(index, Direction::Out);
    }

    fn set_status(&mut self, index: u8, direction: Direction, status: EndpointStatus) {
        let reg = pac::USB.epr(index as usize);
        let current = reg.read();
        let want = stat(status).to_bits();
        let mut epr = preserve(current);
        match direction {
            Direction::In => {
                epr.set_stat_tx(Stat::from_bits(current.stat_tx().to_bits() ^ want))
            }
            Direction::Out => {
                epr.set_stat_rx(Stat::from_bits(current.stat_rx().to_bits() ^ want))
            }
        }
        reg.write_value(epr);
    }

    fn status(&self, index: u8, direction: Direction) -> EndpointStatus {
        let epr = pac::USB.epr(index as usize).read();
        match direction {
            Direction::In => endpoint_status(epr.stat_tx()),
            Direction::Out => endpoint_status(epr.stat_rx()),
        }
    }

    fn transfer_complete(&self, index: u8, direction: Direction) -> bool {
        let epr = pac::USB.epr(index as usize).read();
        match direction {
            Direction::In => epr.ctr_tx(),
            Direction::Out => epr.ctr_rx(),
        }
    }

    fn clear_transfer_complete(&mut self, index: u8, direction: Direction) {
        let reg = pac::USB.epr(index as usize);
        let mut epr = preserve(reg.read());
        match direction {
            Direction::In => epr.set_ctr_tx(false),
            Direction::Out => epr.set_ctr_rx(false),
        }
        reg.write_value(epr);
    }

    fn reset_data_toggle(&mut self, index: u8, direction: Direction) {
        let reg = pac::USB.epr(index as usize);
        let current = reg.read();
        let mut epr = preserve(current);
        match direction {
            Direction::In if current.dtog_tx() => epr.set_dtog_tx(true),
            Direction::Out if current.dtog_rx() => epr.set_dtog_rx(true),
            _ => return,
        }
        reg.write_value(epr);
    }

    fn rx_count(&self, index: u8) -> usize {
        let count = pac::USBRAM.mem(btable_word(index, 3)).read();
        (count & COUNT_MASK) as usize
    }

    fn set_tx_count(&mut self, index: u8, count: usize) {
        pac::USBRAM
            .mem(btable_word(index, 1))
            .write_value(count as u16 & COUNT_MASK);
    }

    fn write_packet_memory(&mut self, offset: usize, data: &[u8]) {
        if offset + data.len() > PMA_SIZE {
            warn!("USB: PMA write out of range at {}", offset);
            return;
        }
        for (i, pair) in data.chunks(2).enumerate() {
            let lo = pair[0] as u16;
            let hi = pair.get(1).copied().unwrap_or(0) as u16;
            self.pma_write_u16(offset + i * 2, lo | (hi << 8));
        }
    }

    fn read_packet_memory(&self, offset: usize, out: &mut [u8]) {
        if offset + out.len() > PMA_SIZE {
            warn!("USB: PMA read out of range at {}", offset);
            return;
        }
        for (i, pair) in out.chunks_mut(2).enumerate() {
            let [lo, hi] = self.pma_read_u16(offset + i * 2).to_le_bytes();
            pair[0] = lo;
            if let Some(b) = pair.get_mut(1) {
                *b = hi;
            }
        }
    }

    fn set_address(&mut self, address: u8) {
        pac::USB.daddr().write(|w| {
            w.set_ef(true);
            w.set_add(address & 0x7F);
        });
    }

    fn suspend(&mut self) {
        pac::USB.cntr().modify(|w| w.set_fsusp(true));
        pac::USB.cntr().modify(|w| w.set_lpmode(true));
    }

    fn wake(&mut self) {
        pac::USB.cntr().modify(|w| {
            w.set_lpmode(false);
            w.set_fsusp(false);
        });
    }

    fn set_resume_signal(&mut self, on: bool) {
        pac::USB.cntr().modify(|w| w.set_resume(on));
    }
}
