//! Boot-protocol HID keyboard.
//!
//! One interface with one interrupt IN endpoint. Reports are queued by
//! mainline through a [`KeyboardSender`] and moved to the endpoint at
//! interrupt level, on start-of-frame when the endpoint is idle and on
//! every IN completion.
//!
//! Reports are the 8-byte boot layout: modifier bits (LCtrl..RGui in bits
//! 0..7), one reserved byte, six key usage codes.

use core::sync::atomic::{AtomicU8, Ordering};

use heapless::spsc::{Consumer, Producer, Queue};

use crate::config::{HID_REPORT_QUEUE, USB_HID_POLL_MS};
use crate::usb::descriptor::Patch;
use crate::usb::{
    ControlResponder, EndpointBus, EndpointIo, EndpointSpec, Outcome, RenderContext,
    SetupPacket, UsbClass,
};
use crate::usb::setup::{request, Recipient, RequestType};

pub const KEYBOARD_REPORT_SIZE: usize = 8;

pub const MOD_LEFT_SHIFT: u8 = 0x02;

/// One boot-protocol input report.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyboardReport {
    pub modifier: u8,
    pub reserved: u8,
    /// Usage codes of held keys, zero-filled.
    pub keycodes: [u8; 6],
}

impl KeyboardReport {
    /// All keys released.
    pub const fn empty() -> Self {
        Self {
            modifier: 0,
            reserved: 0,
            keycodes: [0; 6],
        }
    }

    /// One key held, with modifiers.
    pub const fn key(modifier: u8, keycode: u8) -> Self {
        Self {
            modifier,
            reserved: 0,
            keycodes: [keycode, 0, 0, 0, 0, 0],
        }
    }

    /// Report that types `c` on a US layout. Letters, digits, space and
    /// newline only.
    pub fn from_ascii(c: u8) -> Option<Self> {
        let report = match c {
            b'a'..=b'z' => Self::key(0, 0x04 + (c - b'a')),
            b'A'..=b'Z' => Self::key(MOD_LEFT_SHIFT, 0x04 + (c - b'A')),
            b'1'..=b'9' => Self::key(0, 0x1E + (c - b'1')),
            b'0' => Self::key(0, 0x27),
            b'\r' | b'\n' => Self::key(0, 0x28),
            b' ' => Self::key(0, 0x2C),
            _ => return None,
        };
        Some(report)
    }

    /// Write the wire form into `buf`. Returns 8, or 0 if `buf` is short.
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        let Some(out) = buf.get_mut(..KEYBOARD_REPORT_SIZE) else {
            return 0;
        };
        out[0] = self.modifier;
        out[1] = self.reserved;
        out[2..].copy_from_slice(&self.keycodes);
        KEYBOARD_REPORT_SIZE
    }

    /// No key and no modifier held.
    pub fn is_empty(&self) -> bool {
        self.modifier == 0 && self.keycodes == [0; 6]
    }
}

/// Report descriptor matching [`KeyboardReport`], plus a 5-bit LED output
/// report (num/caps/scroll/compose/kana).
pub const KEYBOARD_REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, // Generic Desktop / Keyboard, application
    // modifiers: 8 x 1 bit, usages E0..E7
    0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, 0x15, 0x00, 0x25, 0x01,
    0x75, 0x01, 0x95, 0x08, 0x81, 0x02,
    // reserved byte
    0x95, 0x01, 0x75, 0x08, 0x81, 0x01,
    // LEDs: 5 x 1 bit out, 3 bits pad
    0x05, 0x08, 0x19, 0x01, 0x29, 0x05, 0x95, 0x05, 0x75, 0x01, 0x91, 0x02,
    0x95, 0x01, 0x75, 0x03, 0x91, 0x01,
    // keys: 6 x 8 bit array
    0x05, 0x07, 0x19, 0x00, 0x29, 0xFF, 0x15, 0x00, 0x26, 0xFF, 0x00,
    0x95, 0x06, 0x75, 0x08, 0x81, 0x00,
    0xC0,
];

// Class-specific codes

const HID_DESCRIPTOR_TYPE: u8 = 0x21;
const REPORT_DESCRIPTOR_TYPE: u8 = 0x22;

const GET_REPORT: u8 = 0x01;
const GET_IDLE: u8 = 0x02;
const GET_PROTOCOL: u8 = 0x03;
const SET_REPORT: u8 = 0x09;
const SET_IDLE: u8 = 0x0A;
const SET_PROTOCOL: u8 = 0x0B;

/// bProtocol values of GET/SET_PROTOCOL.
pub const PROTOCOL_BOOT: u8 = 0;
pub const PROTOCOL_REPORT: u8 = 1;

const REPORT_DESCRIPTOR_LEN: usize = KEYBOARD_REPORT_DESCRIPTOR.len();

/// Interface + HID class descriptor + interrupt IN endpoint.
const TEMPLATE: [u8; 25] = [
    // Interface: HID, boot subclass, keyboard protocol
    9, 0x04, 0, 0, 1, 0x03, 0x01, 0x01, 0,
    // HID 1.11, no country code, one report descriptor
    9, HID_DESCRIPTOR_TYPE, 0x11, 0x01, 0, 1, REPORT_DESCRIPTOR_TYPE,
    REPORT_DESCRIPTOR_LEN as u8, (REPORT_DESCRIPTOR_LEN >> 8) as u8,
    // Endpoint: interrupt IN
    7, 0x05, 0x80, 0x03, KEYBOARD_REPORT_SIZE as u8, 0, USB_HID_POLL_MS,
];

const PATCHES: [Patch; 2] = [
    Patch::Interface(2),
    Patch::Endpoint { offset: 20, slot: 0 },
];

const HID_CLASS_DESCRIPTOR: core::ops::Range<usize> = 9..18;

pub type KeyboardQueue = Queue<KeyboardReport, HID_REPORT_QUEUE>;

/// State shared between the keyboard module and its mainline handle.
pub struct KeyboardChannel {
    queue: KeyboardQueue,
    leds: AtomicU8,
}

impl Default for KeyboardChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyboardChannel {
    pub const fn new() -> Self {
        Self {
            queue: Queue::new(),
            leds: AtomicU8::new(0),
        }
    }

    /// Split into the interrupt-side module and the mainline sender.
    pub fn split(&mut self) -> (HidKeyboard<'_>, KeyboardSender<'_>) {
        let (producer, consumer) = self.queue.split();
        let leds = &self.leds;
        (
            HidKeyboard {
                specs: [EndpointSpec::interrupt_in(
                    KEYBOARD_REPORT_SIZE as u16,
                    USB_HID_POLL_MS,
                )],
                reports: consumer,
                leds,
                last: KeyboardReport::empty(),
                protocol: PROTOCOL_REPORT,
                idle: 0,
                configured: false,
            },
            KeyboardSender {
                reports: producer,
                leds,
            },
        )
    }
}

/// Mainline handle of the keyboard.
pub struct KeyboardSender<'q> {
    reports: Producer<'q, KeyboardReport, HID_REPORT_QUEUE>,
    leds: &'q AtomicU8,
}

impl KeyboardSender<'_> {
    /// Queue a report. Hands it back when the queue is full.
    pub fn send(&mut self, report: KeyboardReport) -> Result<(), KeyboardReport> {
        self.reports.enqueue(report)
    }

    /// Press and release: two reports.
    pub fn tap(&mut self, report: KeyboardReport) -> bool {
        if self.reports.capacity() - self.reports.len() < 2 {
            return false;
        }
        self.send(report).is_ok() && self.send(KeyboardReport::empty()).is_ok()
    }

    /// LED bits last written by the host (Num Lock = bit 0, Caps Lock = bit 1, ...).
    pub fn leds(&self) -> u8 {
        self.leds.load(Ordering::Relaxed)
    }
}

/// The keyboard as a device-class module.
pub struct HidKeyboard<'q> {
    specs: [EndpointSpec; 1],
    reports: Consumer<'q, KeyboardReport, HID_REPORT_QUEUE>,
    leds: &'q AtomicU8,
    last: KeyboardReport,
    protocol: u8,
    idle: u8,
    configured: bool,
}

impl HidKeyboard<'_> {
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Idle rate in 4 ms units; 0 = report only on change.
    pub fn idle_rate(&self) -> u8 {
        self.idle
    }

    fn send_next(&mut self, io: &mut EndpointIo<'_>) {
        if !self.configured || io.is_busy() {
            return;
        }
        if let Some(report) = self.reports.dequeue() {
            let mut buf = [0u8; KEYBOARD_REPORT_SIZE];
            report.serialize(&mut buf);
            io.write(&buf);
            self.last = report;
        }
    }
}

impl UsbClass for HidKeyboard<'_> {
    fn interface_count(&self) -> u8 {
        1
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
        self.protocol = PROTOCOL_REPORT;
        self.idle = 0;
    }

    fn on_set_configuration(&mut self, value: u8, _bus: &mut EndpointBus<'_>) {
        self.configured = value != 0;
    }

    fn on_control_data_setup(
        &mut self,
        setup: &SetupPacket,
        _interface: u8,
        ctl: &mut ControlResponder<'_>,
    ) -> Outcome {
        match (setup.kind(), setup.request) {
            (RequestType::Standard, request::GET_DESCRIPTOR)
                if setup.recipient() == Recipient::Interface =>
            {
                match setup.value_hi() {
                    REPORT_DESCRIPTOR_TYPE => ctl.tx(KEYBOARD_REPORT_DESCRIPTOR, None),
                    HID_DESCRIPTOR_TYPE => {
                        ctl.tx_copy(&TEMPLATE[HID_CLASS_DESCRIPTOR]);
                    }
                    _ => return Outcome::Unsupported,
                }
            }
            (RequestType::Class, GET_REPORT) => {
                let mut buf = [0u8; KEYBOARD_REPORT_SIZE];
                self.last.serialize(&mut buf);
                ctl.tx_copy(&buf);
            }
            (RequestType::Class, GET_IDLE) => {
                ctl.tx_copy(&[self.idle]);
            }
            (RequestType::Class, GET_PROTOCOL) => {
                ctl.tx_copy(&[self.protocol]);
            }
            (RequestType::Class, SET_REPORT) => ctl.rx(1, None),
            _ => return Outcome::Unsupported,
        }
        Outcome::Handled
    }

    fn on_control_no_data_setup(&mut self, setup: &SetupPacket, _interface: u8) -> Outcome {
        match (setup.kind(), setup.request) {
            (RequestType::Class, SET_IDLE) => {
                self.idle = setup.value_hi();
                Outcome::Handled
            }
            (RequestType::Class, SET_PROTOCOL) if setup.value <= 1 => {
                self.protocol = setup.value_lo();
                debug!("HID: protocol {}", self.protocol);
                Outcome::Handled
            }
            _ => Outcome::Unsupported,
        }
    }

    fn on_control_out(&mut self, setup: &SetupPacket, _interface: u8, data: &[u8]) {
        if setup.request == SET_REPORT {
            if let Some(&leds) = data.first() {
                self.leds.store(leds, Ordering::Relaxed);
                debug!("HID: LEDs {:02x}", leds);
            }
        }
    }

    fn on_in_complete(&mut self, _slot: usize, io: &mut EndpointIo<'_>) {
        self.send_next(io);
    }

    fn on_start_of_frame(&mut self, bus: &mut EndpointBus<'_>) {
        if let Some(mut io) = bus.endpoint(0) {
            self.send_next(&mut io);
        }
    }

    fn on_disable(&mut self) {
        self.configured = false;
        while self.reports.dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::sim::{control_read, control_write, enumerate, SimPeripheral};
    use crate::usb::{DeviceConfig, UsbDevice};

    #[test]
    fn keyboard_report_serialize() {
        let report = KeyboardReport {
            modifier: 0x05,
            reserved: 0x00,
            keycodes: [0x04, 0x05, 0x06, 0x00, 0x00, 0x00],
        };
        let mut buf = [0u8; 8];
        assert_eq!(report.serialize(&mut buf), 8);
        assert_eq!(buf, [0x05, 0x00, 0x04, 0x05, 0x06, 0x00, 0x00, 0x00]);

        let mut small_buf = [0u8; 4];
        assert_eq!(report.serialize(&mut small_buf), 0);
    }

    #[test]
    fn ascii_mapping() {
        assert_eq!(KeyboardReport::from_ascii(b'a'), Some(KeyboardReport::key(0, 0x04)));
        assert_eq!(
            KeyboardReport::from_ascii(b'Z'),
            Some(KeyboardReport::key(MOD_LEFT_SHIFT, 0x1D))
        );
        assert_eq!(KeyboardReport::from_ascii(b'0'), Some(KeyboardReport::key(0, 0x27)));
        assert_eq!(KeyboardReport::from_ascii(b'\n'), Some(KeyboardReport::key(0, 0x28)));
        assert_eq!(KeyboardReport::from_ascii(b'#'), None);
        assert!(KeyboardReport::empty().is_empty());
    }

    #[test]
    fn descriptor_points_at_report_descriptor() {
        assert_eq!(TEMPLATE[9 + 7] as usize, KEYBOARD_REPORT_DESCRIPTOR.len());
        assert_eq!(TEMPLATE[PATCHES[1].offset()], 0x80);
    }

    fn class(request_type: u8, request: u8, value: u16, length: u16) -> SetupPacket {
        SetupPacket {
            request_type,
            request,
            value,
            index: 0,
            length,
        }
    }

    #[test]
    fn report_descriptor_and_class_requests() {
        let mut channel = KeyboardChannel::new();
        let (mut kbd, sender) = channel.split();
        let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
        dev.register(&mut kbd).unwrap();
        dev.enable().unwrap();
        enumerate(&mut dev, 3).unwrap();

        let mut buf = [0u8; 128];
        let n = control_read(&mut dev, class(0x81, request::GET_DESCRIPTOR, 0x2200, 128), &mut buf)
            .unwrap();
        assert_eq!(&buf[..n], KEYBOARD_REPORT_DESCRIPTOR);

        control_write(&mut dev, class(0x21, SET_PROTOCOL, PROTOCOL_BOOT as u16, 0), &[]).unwrap();
        let n = control_read(&mut dev, class(0xA1, GET_PROTOCOL, 0, 1), &mut buf).unwrap();
        assert_eq!(&buf[..n], &[PROTOCOL_BOOT]);

        control_write(&mut dev, class(0x21, SET_IDLE, 0x7D00, 0), &[]).unwrap();
        let n = control_read(&mut dev, class(0xA1, GET_IDLE, 0, 1), &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x7D]);

        // Caps Lock on.
        control_write(&mut dev, class(0x21, SET_REPORT, 0x0200, 1), &[0x02]).unwrap();
        assert_eq!(sender.leds(), 0x02);
    }

    #[test]
    fn queued_reports_go_out_in_order() {
        let mut channel = KeyboardChannel::new();
        let (mut kbd, mut sender) = channel.split();
        let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
        dev.register(&mut kbd).unwrap();
        dev.enable().unwrap();
        enumerate(&mut dev, 3).unwrap();

        assert!(sender.tap(KeyboardReport::from_ascii(b'h').unwrap()));
        let ep = dev.allocation().unwrap().endpoints()[0].address;

        dev.peripheral_mut().start_of_frame();
        dev.on_interrupt();
        let mut buf = [0u8; 8];
        assert_eq!(dev.peripheral_mut().host_in(ep, &mut buf), Ok(8));
        assert_eq!(buf[2], 0x0B);
        dev.on_interrupt();

        assert_eq!(dev.peripheral_mut().host_in(ep, &mut buf), Ok(8));
        assert_eq!(buf, [0; 8]);
        dev.on_interrupt();

        let n = control_read(&mut dev, class(0xA1, GET_REPORT, 0x0100, 8), &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, [0; 8]);
    }
}
