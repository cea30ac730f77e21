//! CDC-ACM virtual serial port.
//!
//! Descriptor layout (66 bytes):
//! ```text
//! IAD (8)            : groups the two interfaces into one function
//! Comm interface (9) : class 0x02, subclass ACM, protocol AT
//!   Header FD (5), Call management FD (5), ACM FD (4), Union FD (5)
//!   Notification endpoint (7): interrupt IN
//! Data interface (9) : class 0x0A
//!   Bulk OUT (7), Bulk IN (7)
//! ```
//!
//! Bytes flow through two single-producer/single-consumer rings. The
//! transmit ring is drained at interrupt level: a start-of-frame kicks an
//! idle endpoint, every IN completion sends the next packet, and a packet
//! of exactly max size that empties the ring is followed by a ZLP. The
//! receive ring is filled on OUT completion; the OUT endpoint is re-armed
//! only while a whole packet still fits, otherwise it stays NAKed until
//! mainline has read enough.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use heapless::spsc::{Consumer, Producer, Queue};

use crate::config::{SERIAL_PACKET_SIZE, SERIAL_RX_RING, SERIAL_TX_RING};
use crate::usb::descriptor::Patch;
use crate::usb::{
    ControlResponder, EndpointBus, EndpointIo, EndpointSpec, Outcome, RenderContext,
    SetupPacket, UsbClass,
};
use crate::usb::setup::RequestType;

// Class requests (CDC PSTN subclass)

const SET_LINE_CODING: u8 = 0x20;
const GET_LINE_CODING: u8 = 0x21;
const SET_CONTROL_LINE_STATE: u8 = 0x22;
const SEND_BREAK: u8 = 0x23;

const NOTIFY_PACKET_SIZE: u16 = 8;
const NOTIFY_INTERVAL_MS: u8 = 255;

const PACKET: usize = SERIAL_PACKET_SIZE as usize;

// Endpoint slots
const SLOT_NOTIFY: usize = 0;
const SLOT_OUT: usize = 1;
const SLOT_IN: usize = 2;

const TEMPLATE: [u8; 66] = [
    // Interface association
    8, 0x0B, 0, 2, 0x02, 0x02, 0x01, 0,
    // Communication interface
    9, 0x04, 0, 0, 1, 0x02, 0x02, 0x01, 0,
    // Header functional descriptor, CDC 1.10
    5, 0x24, 0x00, 0x10, 0x01,
    // Call management: data interface 1
    5, 0x24, 0x01, 0x00, 1,
    // ACM: line coding and serial state supported
    4, 0x24, 0x02, 0x02,
    // Union: master 0, slave 1
    5, 0x24, 0x06, 0, 1,
    // Notification endpoint
    7, 0x05, 0x80, 0x03, NOTIFY_PACKET_SIZE as u8, 0, NOTIFY_INTERVAL_MS,
    // Data interface
    9, 0x04, 1, 0, 2, 0x0A, 0, 0, 0,
    // Bulk OUT
    7, 0x05, 0x00, 0x02, SERIAL_PACKET_SIZE as u8, 0, 0,
    // Bulk IN
    7, 0x05, 0x80, 0x02, SERIAL_PACKET_SIZE as u8, 0, 0,
];

const PATCHES: [Patch; 9] = [
    Patch::Interface(2),
    Patch::Interface(10),
    Patch::Interface(26),
    Patch::Interface(34),
    Patch::Interface(35),
    Patch::Endpoint { offset: 38, slot: SLOT_NOTIFY },
    Patch::Interface(45),
    Patch::Endpoint { offset: 54, slot: SLOT_OUT },
    Patch::Endpoint { offset: 61, slot: SLOT_IN },
];

/// Line coding as set by the host (SET_LINE_CODING payload).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineCoding {
    pub baud_rate: u32,
    /// 0 = 1 stop bit, 1 = 1.5, 2 = 2.
    pub stop_bits: u8,
    /// 0 = none, 1 = odd, 2 = even, 3 = mark, 4 = space.
    pub parity: u8,
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    pub const LEN: usize = 7;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN {
            return None;
        }
        Some(Self {
            baud_rate: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            stop_bits: data[4],
            parity: data[5],
            data_bits: data[6],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let [b0, b1, b2, b3] = self.baud_rate.to_le_bytes();
        [b0, b1, b2, b3, self.stop_bits, self.parity, self.data_bits]
    }
}

/// Line state visible to mainline.
struct LineState {
    dtr: AtomicBool,
    rts: AtomicBool,
    baud_rate: AtomicU32,
    data_bits: AtomicU8,
    /// The IN endpoint has a packet in flight.
    transmitting: AtomicBool,
}

/// Rings and line state shared by a [`CdcAcm`] and its [`SerialPort`].
pub struct SerialChannel {
    tx: Queue<u8, SERIAL_TX_RING>,
    rx: Queue<u8, SERIAL_RX_RING>,
    state: LineState,
}

impl Default for SerialChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialChannel {
    pub const fn new() -> Self {
        Self {
            tx: Queue::new(),
            rx: Queue::new(),
            state: LineState {
                dtr: AtomicBool::new(false),
                rts: AtomicBool::new(false),
                baud_rate: AtomicU32::new(115_200),
                data_bits: AtomicU8::new(8),
                transmitting: AtomicBool::new(false),
            },
        }
    }

    /// Split into the interrupt-side module and the mainline port.
    pub fn split(&mut self) -> (CdcAcm<'_>, SerialPort<'_>) {
        let (tx_producer, tx_consumer) = self.tx.split();
        let (rx_producer, rx_consumer) = self.rx.split();
        let state = &self.state;
        (
            CdcAcm {
                specs: [
                    EndpointSpec::interrupt_in(NOTIFY_PACKET_SIZE, NOTIFY_INTERVAL_MS),
                    EndpointSpec::bulk_out(SERIAL_PACKET_SIZE),
                    EndpointSpec::bulk_in(SERIAL_PACKET_SIZE),
                ],
                tx: tx_consumer,
                rx: rx_producer,
                state,
                line_coding: LineCoding::default(),
                configured: false,
                rx_parked: false,
                zlp_pending: false,
            },
            SerialPort {
                tx: tx_producer,
                rx: rx_consumer,
                state,
            },
        )
    }
}

/// Mainline side of the serial port.
pub struct SerialPort<'q> {
    tx: Producer<'q, u8, SERIAL_TX_RING>,
    rx: Consumer<'q, u8, SERIAL_RX_RING>,
    state: &'q LineState,
}

impl SerialPort<'_> {
    /// Queue bytes for the host. Returns how many fit (0 when the ring is
    /// full).
    pub fn write(&mut self, data: &[u8]) -> usize {
        let mut written = 0;
        for &byte in data {
            if self.tx.enqueue(byte).is_err() {
                break;
            }
            written += 1;
        }
        written
    }

    /// Take received bytes. Returns how many were copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.dequeue() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Bytes waiting to be read.
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// Data terminal ready: a terminal program has the port open.
    pub fn dtr(&self) -> bool {
        self.state.dtr.load(Ordering::Relaxed)
    }

    pub fn rts(&self) -> bool {
        self.state.rts.load(Ordering::Relaxed)
    }

    pub fn baud_rate(&self) -> u32 {
        self.state.baud_rate.load(Ordering::Relaxed)
    }

    pub fn data_bits(&self) -> u8 {
        self.state.data_bits.load(Ordering::Relaxed)
    }

    /// A packet is on its way to the host.
    pub fn is_transmitting(&self) -> bool {
        self.state.transmitting.load(Ordering::Acquire)
    }
}

/// The CDC-ACM function as a device-class module.
pub struct CdcAcm<'q> {
    specs: [EndpointSpec; 3],
    tx: Consumer<'q, u8, SERIAL_TX_RING>,
    rx: Producer<'q, u8, SERIAL_RX_RING>,
    state: &'q LineState,
    line_coding: LineCoding,
    configured: bool,
    /// OUT endpoint left NAKed because the receive ring was short of room.
    rx_parked: bool,
    /// Last packet was full-sized; a ZLP follows if nothing else does.
    zlp_pending: bool,
}

impl CdcAcm<'_> {
    pub fn line_coding(&self) -> LineCoding {
        self.line_coding
    }

    fn rx_room(&self) -> usize {
        self.rx.capacity() - self.rx.len()
    }

    /// Move the next packet (or ZLP) of the transmit ring to the IN endpoint.
    fn pump_tx(&mut self, io: &mut EndpointIo<'_>) {
        if io.is_busy() {
            return;
        }
        let mut packet = [0u8; PACKET];
        let mut n = 0;
        while n < PACKET {
            match self.tx.dequeue() {
                Some(byte) => {
                    packet[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }

        if n == 0 && !self.zlp_pending {
            self.state.transmitting.store(false, Ordering::Release);
            return;
        }
        io.write(&packet[..n]);
        self.zlp_pending = n == PACKET;
        self.state.transmitting.store(true, Ordering::Release);
    }

    fn drain_rx(&mut self, io: &mut EndpointIo<'_>) {
        let mut packet = [0u8; PACKET];
        let n = io.read(&mut packet);
        for &byte in &packet[..n] {
            // Room for a whole packet was checked before the endpoint was armed.
            let _ = self.rx.enqueue(byte);
        }
        if self.rx_room() >= PACKET {
            io.enable_rx();
        } else {
            trace!("CDC: receive ring full, parking OUT");
            self.rx_parked = true;
        }
    }
}

impl UsbClass for CdcAcm<'_> {
    fn interface_count(&self) -> u8 {
        2
    }

    fn endpoints(&self) -> &[EndpointSpec] {
        &self.specs
    }

    fn descriptor_len(&self) -> usize {
        TEMPLATE.len()
    }

    fn render_descriptor(&self, ctx: &RenderContext<'_>, out: &mut [u8]) -> usize {
        ctx.render_template(&TEMPLATE, &PATCHES, out)
    }

    fn on_bus_reset(&mut self) {
        self.configured = false;
        self.rx_parked = false;
        self.zlp_pending = false;
        self.state.dtr.store(false, Ordering::Relaxed);
        self.state.rts.store(false, Ordering::Relaxed);
        self.state.transmitting.store(false, Ordering::Release);
    }

    fn on_set_configuration(&mut self, value: u8, bus: &mut EndpointBus<'_>) {
        self.configured = value != 0;
        self.zlp_pending = false;
        self.state.transmitting.store(false, Ordering::Release);
        if self.configured && self.rx_room() < PACKET {
            // The engine armed OUT; hold it until mainline makes room.
            if let Some(mut out) = bus.endpoint(SLOT_OUT) {
                out.hold();
            }
            self.rx_parked = true;
        }
    }

    fn on_control_data_setup(
        &mut self,
        setup: &SetupPacket,
        interface: u8,
        ctl: &mut ControlResponder<'_>,
    ) -> Outcome {
        if setup.kind() != RequestType::Class || interface != 0 {
            return Outcome::Unsupported;
        }
        match setup.request {
            SET_LINE_CODING => ctl.rx(LineCoding::LEN, None),
            GET_LINE_CODING => {
                ctl.tx_copy(&self.line_coding.to_bytes());
            }
            _ => return Outcome::Unsupported,
        }
        Outcome::Handled
    }

    fn on_control_no_data_setup(&mut self, setup: &SetupPacket, interface: u8) -> Outcome {
        if setup.kind() != RequestType::Class || interface != 0 {
            return Outcome::Unsupported;
        }
        match setup.request {
            SET_CONTROL_LINE_STATE => {
                let dtr = setup.value & 0x01 != 0;
                let rts = setup.value & 0x02 != 0;
                self.state.dtr.store(dtr, Ordering::Relaxed);
                self.state.rts.store(rts, Ordering::Relaxed);
                debug!("CDC: DTR {} RTS {}", dtr, rts);
                Outcome::Handled
            }
            SEND_BREAK => Outcome::Handled,
            _ => Outcome::Unsupported,
        }
    }

    fn on_control_out(&mut self, setup: &SetupPacket, _interface: u8, data: &[u8]) {
        if setup.request != SET_LINE_CODING {
            return;
        }
        if let Some(coding) = LineCoding::parse(data) {
            self.line_coding = coding;
            self.state.baud_rate.store(coding.baud_rate, Ordering::Relaxed);
            self.state.data_bits.store(coding.data_bits, Ordering::Relaxed);
            debug!("CDC: {} baud, {} data bits", coding.baud_rate, coding.data_bits);
        }
    }

    fn on_clear_feature(&mut self, slot: usize, io: &mut EndpointIo<'_>) {
        if slot == SLOT_IN {
            self.zlp_pending = false;
            self.state.transmitting.store(false, Ordering::Release);
        }
        if slot == SLOT_OUT && self.rx_room() < PACKET {
            io.hold();
            self.rx_parked = true;
        }
    }

    fn on_in_complete(&mut self, slot: usize, io: &mut EndpointIo<'_>) {
        if slot == SLOT_IN {
            self.pump_tx(io);
        }
    }

    fn on_out_complete(&mut self, slot: usize, io: &mut EndpointIo<'_>) {
        if slot == SLOT_OUT {
            self.drain_rx(io);
        }
    }

    fn on_start_of_frame(&mut self, bus: &mut EndpointBus<'_>) {
        if !self.configured {
            return;
        }
        if self.rx_parked && self.rx_room() >= PACKET {
            if let Some(mut out) = bus.endpoint(SLOT_OUT) {
                out.enable_rx();
                self.rx_parked = false;
            }
        }
        if !self.state.transmitting.load(Ordering::Acquire) {
            if let Some(mut io) = bus.endpoint(SLOT_IN) {
                self.pump_tx(&mut io);
            }
        }
    }

    fn on_disable(&mut self) {
        self.configured = false;
        self.state.transmitting.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::hw::EndpointStatus;
    use crate::usb::sim::{control_read, control_write, enumerate, SimPeripheral};
    use crate::usb::{DeviceConfig, UsbDevice};

    type Dev<'m> = UsbDevice<'m, SimPeripheral>;

    fn class(request_type: u8, request: u8, value: u16, length: u16) -> SetupPacket {
        SetupPacket {
            request_type,
            request,
            value,
            index: 0,
            length,
        }
    }

    fn frame(dev: &mut Dev<'_>) {
        dev.peripheral_mut().start_of_frame();
        dev.on_interrupt();
    }

    /// Hardware address of endpoint `slot` of the only module.
    fn address(dev: &Dev<'_>, slot: usize) -> u8 {
        dev.allocation().unwrap().module_endpoints(0)[slot].address
    }

    /// IN packets until the port has nothing in flight.
    fn collect(dev: &mut Dev<'_>, ep: u8) -> (Vec<u8>, Vec<usize>) {
        let mut data = Vec::new();
        let mut sizes = Vec::new();
        frame(dev);
        let mut buf = [0u8; PACKET];
        while let Ok(n) = dev.peripheral_mut().host_in(ep, &mut buf) {
            data.extend_from_slice(&buf[..n]);
            sizes.push(n);
            dev.on_interrupt();
        }
        (data, sizes)
    }

    #[test]
    fn template_patches_land_on_number_fields() {
        for patch in PATCHES {
            let byte = TEMPLATE[patch.offset()];
            match patch {
                Patch::Interface(_) => assert!(byte <= 1),
                Patch::Endpoint { .. } => assert!(byte == 0x00 || byte == 0x80),
            }
        }
        assert_eq!(TEMPLATE[0] as usize + TEMPLATE[8] as usize, 17);
    }

    #[test]
    fn line_coding_round_trip_through_control_pipe() {
        let mut channel = SerialChannel::new();
        let (mut acm, port) = channel.split();
        let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
        dev.register(&mut acm).unwrap();
        dev.enable().unwrap();
        enumerate(&mut dev, 9).unwrap();

        let coding = LineCoding {
            baud_rate: 9600,
            stop_bits: 2,
            parity: 1,
            data_bits: 7,
        };
        control_write(&mut dev, class(0x21, SET_LINE_CODING, 0, 7), &coding.to_bytes()).unwrap();
        let mut buf = [0u8; 7];
        let n = control_read(&mut dev, class(0xA1, GET_LINE_CODING, 0, 7), &mut buf).unwrap();
        assert_eq!(n, 7);
        assert_eq!(LineCoding::parse(&buf), Some(coding));
        assert_eq!(port.baud_rate(), 9600);
        assert_eq!(port.data_bits(), 7);

        control_write(&mut dev, class(0x21, SET_CONTROL_LINE_STATE, 0x0003, 0), &[]).unwrap();
        assert!(port.dtr());
        assert!(port.rts());
    }

    #[test]
    fn bytes_round_trip_through_both_rings() {
        let mut channel = SerialChannel::new();
        let (mut acm, mut port) = channel.split();
        let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
        dev.register(&mut acm).unwrap();
        dev.enable().unwrap();
        enumerate(&mut dev, 9).unwrap();
        let (ep_in, ep_out) = (address(&dev, SLOT_IN), address(&dev, SLOT_OUT));

        let msg: Vec<u8> = (0..150u8).collect();
        assert_eq!(port.write(&msg), 150);
        let (data, sizes) = collect(&mut dev, ep_in);
        assert_eq!(data, msg);
        assert_eq!(sizes, vec![64, 64, 22]);
        assert!(!port.is_transmitting());

        dev.peripheral_mut().host_out(ep_out, b"hello").unwrap();
        dev.on_interrupt();
        let mut buf = [0u8; 16];
        assert_eq!(port.read(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(port.read(&mut buf), 0);
    }

    #[test]
    fn full_last_packet_is_followed_by_zlp() {
        let mut channel = SerialChannel::new();
        let (mut acm, mut port) = channel.split();
        let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
        dev.register(&mut acm).unwrap();
        dev.enable().unwrap();
        enumerate(&mut dev, 9).unwrap();
        let ep = address(&dev, SLOT_IN);

        assert_eq!(port.write(&[0x55; 128]), 128);
        let (data, sizes) = collect(&mut dev, ep);
        assert_eq!(data.len(), 128);
        assert_eq!(sizes, vec![64, 64, 0]);
    }

    #[test]
    fn write_reports_zero_when_ring_is_full() {
        let mut channel = SerialChannel::new();
        let (_acm, mut port) = channel.split();
        let cap = SERIAL_TX_RING - 1;
        assert_eq!(port.write(&[1; SERIAL_TX_RING]), cap);
        assert_eq!(port.write(b"x"), 0);
    }

    #[test]
    fn out_endpoint_parks_until_ring_has_room() {
        let mut channel = SerialChannel::new();
        let (mut acm, mut port) = channel.split();
        let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
        dev.register(&mut acm).unwrap();
        dev.enable().unwrap();
        enumerate(&mut dev, 9).unwrap();
        let ep = address(&dev, SLOT_OUT);

        // 255-byte ring: three full packets leave less than a packet of room.
        for _ in 0..3 {
            dev.peripheral_mut().host_out(ep, &[0xAA; PACKET]).unwrap();
            dev.on_interrupt();
        }
        assert_eq!(dev.peripheral().endpoint(ep).rx_status, EndpointStatus::Nak);
        assert_eq!(
            dev.peripheral_mut().host_out(ep, &[0xBB; 4]),
            Err(crate::usb::sim::Handshake::Nak)
        );

        let mut buf = [0u8; PACKET];
        assert_eq!(port.read(&mut buf), PACKET);
        frame(&mut dev);
        assert_eq!(dev.peripheral().endpoint(ep).rx_status, EndpointStatus::Valid);
        assert_eq!(port.available(), 2 * PACKET);
    }
}
