//! Endpoint-0 control pipe.
//!
//! ```text
//! Idle ──SETUP──▶ DataIn ──last window──▶ StatusOut ──ZLP──▶ Idle
//!           ├───▶ DataOut ──complete────▶ StatusIn ──ack──▶ Idle
//!           └───▶ StatusIn (no data stage) ─────────ack──▶ Idle
//! ```
//!
//! One transfer is outstanding at a time; a new SETUP abandons whatever
//! was in flight. IN data comes from a flat slice, a list of chunks, the
//! scratch buffer or the composed configuration descriptor, and is moved
//! one max-packet window at a time through a small staging buffer.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{CONTROL_BUFFER_SIZE, EP0_MAX_PACKET, EP0_RX_OFFSET, EP0_TX_OFFSET};
use crate::usb::compose::ConfigDescriptor;
use crate::usb::endpoint::Direction;
use crate::usb::hw::{EndpointStatus, UsbPeripheral};
use crate::usb::setup::SetupPacket;

/// A read of the logical concatenation of some chunks.
#[derive(Debug)]
pub enum Window<'a> {
    /// Report the total length; copy nothing.
    Probe,
    /// Copy the bytes at `[offset, offset + out.len())` into `out`.
    Fill { offset: usize, out: &'a mut [u8] },
}

/// Serve a [`Window`] over discontiguous chunks.
///
/// Returns the total length for [`Window::Probe`] and the number of bytes
/// copied for [`Window::Fill`]. Empty chunks are skipped without moving the
/// logical offset.
pub fn chunk_window(chunks: &[&[u8]], window: Window<'_>) -> usize {
    let (offset, out) = match window {
        Window::Probe => return chunks.iter().map(|c| c.len()).sum(),
        Window::Fill { offset, out } => (offset, out),
    };

    let end = offset + out.len();
    let mut start = 0;
    let mut copied = 0;
    for chunk in chunks.iter().filter(|c| !c.is_empty()) {
        let chunk_end = start + chunk.len();
        let lo = offset.max(start);
        let hi = end.min(chunk_end);
        if lo < hi {
            out[lo - offset..hi - offset].copy_from_slice(&chunk[lo - start..hi - start]);
            copied += hi - lo;
        }
        start = chunk_end;
        if start >= end {
            break;
        }
    }
    copied
}

/// Pipe state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    Idle,
    /// SETUP received, handler not finished yet.
    Setup,
    DataIn,
    DataOut,
    /// Waiting for the host's zero-length OUT after a data-in stage.
    StatusOut,
    /// Our zero-length IN is armed.
    StatusIn,
}

#[derive(Clone, Copy, Debug)]
enum Source {
    None,
    Flat(&'static [u8]),
    Chunks(&'static [&'static [u8]]),
    /// First `n` bytes of the scratch buffer.
    Scratch(usize),
    Config,
}

/// What an IN-complete on EP0 finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InEvent {
    /// More data (or nothing) to do.
    Continue,
    /// Status stage of a no-data / data-out request went out.
    StatusSent,
}

/// What an OUT-complete on EP0 finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutEvent {
    Continue,
    /// All data-out bytes are in the scratch buffer.
    DataReceived,
    /// Host acknowledged a data-in stage.
    StatusReceived,
}

/// The endpoint-0 transfer state machine.
pub struct ControlPipe {
    stage: Stage,
    setup: SetupPacket,
    source: Source,
    /// Bytes this transfer moves: min(available, wLength).
    total: usize,
    /// Bytes that crossed the wire.
    offset: usize,
    /// Size of the last IN window handed to the hardware.
    last_packet: usize,
    /// Data-out bytes kept (may be fewer than `offset`).
    stored: usize,
    /// Data-out capacity registered for this request.
    rx_len: usize,
    done: Option<&'static AtomicBool>,
    scratch: [u8; CONTROL_BUFFER_SIZE],
}

impl Default for ControlPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPipe {
    pub const fn new() -> Self {
        Self {
            stage: Stage::Idle,
            setup: SetupPacket {
                request_type: 0,
                request: 0,
                value: 0,
                index: 0,
                length: 0,
            },
            source: Source::None,
            total: 0,
            offset: 0,
            last_packet: 0,
            stored: 0,
            rx_len: 0,
            done: None,
            scratch: [0; CONTROL_BUFFER_SIZE],
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    /// Drop any transfer in flight (bus reset).
    pub fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.source = Source::None;
        self.total = 0;
        self.offset = 0;
        self.last_packet = 0;
        self.stored = 0;
        self.rx_len = 0;
        self.done = None;
    }

    /// Read the SETUP packet out of packet memory and start a new transfer.
    pub fn read_setup(&mut self, hw: &mut dyn UsbPeripheral) -> SetupPacket {
        let mut raw = [0u8; SetupPacket::LEN];
        hw.read_packet_memory(EP0_RX_OFFSET, &mut raw);
        let setup = SetupPacket::parse(&raw);
        self.begin(setup);
        setup
    }

    pub(crate) fn begin(&mut self, setup: SetupPacket) {
        self.reset();
        self.stage = Stage::Setup;
        self.setup = setup;
        self.rx_len = (setup.length as usize).min(CONTROL_BUFFER_SIZE);
    }

    /// Source registered by the request handler, if any.
    pub(crate) fn has_source(&self) -> bool {
        !matches!(self.source, Source::None)
    }

    pub(crate) fn responder(&mut self) -> ControlResponder<'_> {
        ControlResponder { pipe: self }
    }

    /// Bytes received by the last data-out stage.
    pub fn received(&self) -> &[u8] {
        &self.scratch[..self.stored]
    }

    fn source_len(&self, config: Option<&ConfigDescriptor>) -> usize {
        match self.source {
            Source::None => 0,
            Source::Flat(data) => data.len(),
            Source::Chunks(chunks) => chunk_window(chunks, Window::Probe),
            Source::Scratch(n) => n,
            Source::Config => config.map_or(0, |c| chunk_window(&c.chunks(), Window::Probe)),
        }
    }

    fn fill(&self, config: Option<&ConfigDescriptor>, offset: usize, out: &mut [u8]) -> usize {
        let window = Window::Fill { offset, out };
        match self.source {
            Source::None => 0,
            Source::Flat(data) => chunk_window(&[data], window),
            Source::Chunks(chunks) => chunk_window(chunks, window),
            Source::Scratch(n) => chunk_window(&[&self.scratch[..n]], window),
            Source::Config => config.map_or(0, |c| chunk_window(&c.chunks(), window)),
        }
    }

    /// Start the data-in stage with the registered source.
    pub fn start_in(&mut self, hw: &mut dyn UsbPeripheral, config: Option<&ConfigDescriptor>) {
        self.total = self.source_len(config).min(self.setup.length as usize);
        self.offset = 0;
        self.stage = Stage::DataIn;
        // The host may cut the data stage short with its status OUT.
        hw.set_status(0, Direction::Out, EndpointStatus::Valid);
        self.send_window(hw, config);
    }

    /// Start the data-out stage; bytes land in the scratch buffer.
    pub fn start_out(&mut self, hw: &mut dyn UsbPeripheral) {
        self.offset = 0;
        self.stored = 0;
        self.stage = Stage::DataOut;
        hw.set_status(0, Direction::Out, EndpointStatus::Valid);
    }

    /// Arm the zero-length status IN.
    pub fn send_status(&mut self, hw: &mut dyn UsbPeripheral) {
        self.stage = Stage::StatusIn;
        hw.set_tx_count(0, 0);
        hw.set_status(0, Direction::In, EndpointStatus::Valid);
    }

    /// Reject the request. The next SETUP clears the stall.
    pub fn stall(&mut self, hw: &mut dyn UsbPeripheral) {
        self.reset();
        hw.set_status(0, Direction::In, EndpointStatus::Stall);
        hw.set_status(0, Direction::Out, EndpointStatus::Stall);
    }

    fn send_window(&mut self, hw: &mut dyn UsbPeripheral, config: Option<&ConfigDescriptor>) {
        let mut staging = [0u8; EP0_MAX_PACKET];
        let len = (self.total - self.offset).min(EP0_MAX_PACKET);
        let n = self.fill(config, self.offset, &mut staging[..len]);
        hw.write_packet_memory(EP0_TX_OFFSET, &staging[..n]);
        hw.set_tx_count(0, n);
        hw.set_status(0, Direction::In, EndpointStatus::Valid);
        self.last_packet = n;
        trace!("EP0 IN window {}+{}/{}", self.offset, n, self.total);
    }

    fn mark_done(&self) {
        if let Some(flag) = self.done {
            flag.store(true, Ordering::Release);
        }
    }

    /// EP0 transmit half completed.
    pub fn in_complete(
        &mut self,
        hw: &mut dyn UsbPeripheral,
        config: Option<&ConfigDescriptor>,
    ) -> InEvent {
        match self.stage {
            Stage::DataIn => {
                self.offset += self.last_packet;
                if self.offset < self.total {
                    self.send_window(hw, config);
                    return InEvent::Continue;
                }
                self.mark_done();
                // A transfer shorter than wLength ending on a full packet
                // needs a ZLP so the host sees the short packet.
                if self.last_packet == EP0_MAX_PACKET && self.total < self.setup.length as usize {
                    self.send_window(hw, config);
                } else {
                    self.stage = Stage::StatusOut;
                }
                InEvent::Continue
            }
            Stage::StatusIn => {
                self.stage = Stage::Idle;
                hw.set_status(0, Direction::Out, EndpointStatus::Valid);
                InEvent::StatusSent
            }
            _ => InEvent::Continue,
        }
    }

    /// EP0 receive half completed with a non-SETUP transaction.
    pub fn out_complete(&mut self, hw: &mut dyn UsbPeripheral) -> OutEvent {
        match self.stage {
            Stage::DataOut => {
                let count = hw.rx_count(0).min(EP0_MAX_PACKET);
                let keep = count.min(self.rx_len.saturating_sub(self.stored));
                if keep > 0 {
                    let dst = &mut self.scratch[self.stored..self.stored + keep];
                    hw.read_packet_memory(EP0_RX_OFFSET, dst);
                    self.stored += keep;
                }
                self.offset += count;
                if count < EP0_MAX_PACKET || self.offset >= self.setup.length as usize {
                    self.mark_done();
                    OutEvent::DataReceived
                } else {
                    hw.set_status(0, Direction::Out, EndpointStatus::Valid);
                    OutEvent::Continue
                }
            }
            Stage::DataIn | Stage::StatusOut => {
                // Status OUT, possibly before the whole data stage was read.
                if self.offset >= self.total {
                    self.mark_done();
                }
                self.stage = Stage::Idle;
                hw.set_status(0, Direction::In, EndpointStatus::Nak);
                hw.set_status(0, Direction::Out, EndpointStatus::Valid);
                OutEvent::StatusReceived
            }
            _ => {
                hw.set_status(0, Direction::Out, EndpointStatus::Valid);
                OutEvent::Continue
            }
        }
    }
}

/// Handle through which a request handler answers a data-stage request.
pub struct ControlResponder<'a> {
    pipe: &'a mut ControlPipe,
}

impl ControlResponder<'_> {
    pub fn setup(&self) -> &SetupPacket {
        &self.pipe.setup
    }

    /// Send `data` (truncated to wLength). `done` turns true once every
    /// byte the host asked for has gone out.
    pub fn tx(&mut self, data: &'static [u8], done: Option<&'static AtomicBool>) {
        self.pipe.source = Source::Flat(data);
        self.arm_done(done);
    }

    /// Send the concatenation of `chunks` without materialising it.
    pub fn tx_chunks(&mut self, chunks: &'static [&'static [u8]], done: Option<&'static AtomicBool>) {
        self.pipe.source = Source::Chunks(chunks);
        self.arm_done(done);
    }

    /// Copy `data` into the pipe's own buffer and send it from there.
    /// Returns the number of bytes kept.
    pub fn tx_copy(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(CONTROL_BUFFER_SIZE);
        self.pipe.scratch[..n].copy_from_slice(&data[..n]);
        self.pipe.source = Source::Scratch(n);
        self.arm_done(None);
        n
    }

    /// Build a response in place in the pipe's buffer.
    pub fn tx_with(&mut self, f: impl FnOnce(&mut [u8]) -> usize) -> usize {
        let n = f(&mut self.pipe.scratch).min(CONTROL_BUFFER_SIZE);
        self.pipe.source = Source::Scratch(n);
        self.arm_done(None);
        n
    }

    pub(crate) fn tx_config(&mut self) {
        self.pipe.source = Source::Config;
        self.arm_done(None);
    }

    /// Accept up to `len` data-out bytes (clamped to wLength and the pipe
    /// buffer). Excess bytes from the host are acknowledged and dropped.
    pub fn rx(&mut self, len: usize, done: Option<&'static AtomicBool>) {
        self.pipe.rx_len = len
            .min(self.pipe.setup.length as usize)
            .min(CONTROL_BUFFER_SIZE);
        self.arm_done(done);
    }

    fn arm_done(&mut self, done: Option<&'static AtomicBool>) {
        if let Some(flag) = done {
            flag.store(false, Ordering::Relaxed);
        }
        self.pipe.done = done;
    }
}
