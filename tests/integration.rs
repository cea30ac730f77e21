//! Integration tests: complete composite devices driven through the
//! simulated peripheral, public API only.

use usbcomp::class::hid::{KeyboardChannel, KeyboardReport};
use usbcomp::class::serial::SerialChannel;
use usbcomp::usb::alloc::Allocator;
use usbcomp::usb::control::Stage;
use usbcomp::usb::descriptor::desc_type;
use usbcomp::usb::hw::Interrupts;
use usbcomp::usb::sim::{control_read, control_write, enumerate, Handshake, SimPeripheral};
use usbcomp::usb::suspend::BusState;
use usbcomp::usb::{
    DeviceConfig, DeviceState, EndpointSpec, RenderContext, SetupPacket, UsbClass, UsbDevice,
};
use usbcomp::{AllocError, Error};

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

fn get_descriptor(kind: u8, length: u16) -> SetupPacket {
    SetupPacket {
        request_type: 0x80,
        request: 6,
        value: (kind as u16) << 8,
        index: 0,
        length,
    }
}

/// Walk a configuration descriptor and return `(type, offset)` of every
/// descriptor in it.
fn walk(config: &[u8]) -> Vec<(u8, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < config.len() && config[i] != 0 {
        out.push((config[i + 1], i));
        i += config[i] as usize;
    }
    out
}

fn frame(dev: &mut UsbDevice<'_, SimPeripheral>) {
    dev.peripheral_mut().start_of_frame();
    dev.on_interrupt();
}

fn raise(dev: &mut UsbDevice<'_, SimPeripheral>, irq: Interrupts) {
    dev.peripheral_mut().raise(irq);
    dev.on_interrupt();
}

/// Interface descriptor plus a blob of class-specific bytes, no endpoints
/// unless given.
struct Blob {
    specs: Vec<EndpointSpec>,
    len: usize,
}

impl Blob {
    fn new(len: usize, specs: &[EndpointSpec]) -> Self {
        Self {
            specs: specs.to_vec(),
            len,
        }
    }
}

impl UsbClass for Blob {
    fn interface_count(&self) -> u8 {
        1
    }

    fn endpoints(&self) -> &[EndpointSpec] {
        &self.specs
    }

    fn descriptor_len(&self) -> usize {
        self.len
    }

    fn render_descriptor(&self, ctx: &RenderContext<'_>, out: &mut [u8]) -> usize {
        let iface = [9, 4, ctx.first_interface(), 0, 0, 0xFF, 0, 0, 0];
        out[..9].copy_from_slice(&iface);
        // Vendor-specific descriptors padding the rest.
        let mut at = 9;
        while at < self.len {
            let len = (self.len - at).min(255);
            out[at] = len as u8;
            if len > 1 {
                out[at + 1] = 0x41;
            }
            for (i, b) in out[at + 2.min(len)..at + len].iter_mut().enumerate() {
                *b = i as u8;
            }
            at += len;
        }
        self.len
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Serial + keyboard composite
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn serial_and_keyboard_enumerate_as_one_device() {
    let mut serial = SerialChannel::new();
    let mut keys = KeyboardChannel::new();
    let (mut cdc, _port) = serial.split();
    let (mut kbd, _sender) = keys.split();

    let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
    dev.register(&mut cdc).unwrap();
    dev.register(&mut kbd).unwrap();
    dev.enable().unwrap();
    assert!(dev.peripheral().is_present());

    enumerate(&mut dev, 12).unwrap();
    assert_eq!(dev.state(), DeviceState::Configured);
    assert_eq!(dev.peripheral().address(), 12);

    let mut config = [0u8; 256];
    let n = control_read(
        &mut dev,
        get_descriptor(desc_type::CONFIGURATION, 256),
        &mut config,
    )
    .unwrap();
    assert_eq!(n, 9 + 66 + 25);
    assert_eq!(u16::from_le_bytes([config[2], config[3]]) as usize, n);
    assert_eq!(config[4], 3, "CDC comm + CDC data + HID");

    let descriptors = walk(&config[..n]);
    let interfaces: Vec<u8> = descriptors
        .iter()
        .filter(|(t, _)| *t == desc_type::INTERFACE)
        .map(|(_, at)| config[at + 2])
        .collect();
    assert_eq!(interfaces, vec![0, 1, 2]);

    // IAD groups interfaces 0 and 1.
    let (kind, at) = descriptors[1];
    assert_eq!(kind, desc_type::INTERFACE_ASSOCIATION);
    assert_eq!(config[at + 2], 0);
    assert_eq!(config[at + 3], 2);

    // Every endpoint address in the descriptor is unique per direction.
    let mut endpoints: Vec<u8> = descriptors
        .iter()
        .filter(|(t, _)| *t == desc_type::ENDPOINT)
        .map(|(_, at)| config[at + 2])
        .collect();
    assert_eq!(endpoints.len(), 4);
    endpoints.sort_unstable();
    endpoints.dedup();
    assert_eq!(endpoints.len(), 4);
    assert!(endpoints.iter().all(|a| a & 0x0F != 0));
}

#[test]
fn serial_echo_and_key_taps_reach_the_host() {
    let mut serial = SerialChannel::new();
    let mut keys = KeyboardChannel::new();
    let (mut cdc, mut port) = serial.split();
    let (mut kbd, mut sender) = keys.split();

    let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
    dev.register(&mut cdc).unwrap();
    dev.register(&mut kbd).unwrap();
    dev.enable().unwrap();
    enumerate(&mut dev, 3).unwrap();

    let alloc = dev.allocation().unwrap();
    let cdc_out = alloc.module_endpoints(0)[1].address;
    let cdc_in = alloc.module_endpoints(0)[2].address;
    let kbd_in = alloc.module_endpoints(1)[0].address;

    // Host opens the port.
    let line_state = SetupPacket {
        request_type: 0x21,
        request: 0x22,
        value: 0x0001,
        index: 0,
        length: 0,
    };
    control_write(&mut dev, line_state, &[]).unwrap();
    assert!(port.dtr());

    dev.peripheral_mut().host_out(cdc_out, b"ab").unwrap();
    dev.on_interrupt();
    let mut buf = [0u8; 8];
    let n = port.read(&mut buf);
    assert_eq!(&buf[..n], b"ab");

    for b in &mut buf[..n] {
        sender.tap(KeyboardReport::from_ascii(*b).unwrap());
        b.make_ascii_uppercase();
    }
    assert_eq!(port.write(&buf[..n]), 2);

    frame(&mut dev);
    let mut echo = [0u8; 64];
    let got = dev.peripheral_mut().host_in(cdc_in, &mut echo).unwrap();
    assert_eq!(&echo[..got], b"AB");

    // 'a' press, release, 'b' press, release.
    let mut reports = Vec::new();
    let mut report = [0u8; 8];
    while let Ok(n) = dev.peripheral_mut().host_in(kbd_in, &mut report) {
        assert_eq!(n, 8);
        reports.push(report[2]);
        dev.on_interrupt();
    }
    assert_eq!(reports, vec![0x04, 0x00, 0x05, 0x00]);
}

// ═══════════════════════════════════════════════════════════════════════════
// Allocation
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn exclusive_bulk_pairs_take_four_addresses() {
    let pair = [
        EndpointSpec::bulk_out(64).exclusive(),
        EndpointSpec::bulk_in(64).exclusive(),
    ];
    let mut first = Blob::new(9, &pair);
    let mut second = Blob::new(9, &pair);

    let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default())
        .with_allocator(Allocator::default().with_address_count(5));
    dev.register(&mut first).unwrap();
    dev.register(&mut second).unwrap();
    dev.enable().unwrap();

    let mut addresses: Vec<u8> = dev
        .allocation()
        .unwrap()
        .endpoints()
        .iter()
        .map(|e| e.address)
        .collect();
    addresses.sort_unstable();
    assert_eq!(addresses, vec![1, 2, 3, 4]);
}

#[test]
fn failed_allocation_never_attaches() {
    let pair = [
        EndpointSpec::bulk_out(64).exclusive(),
        EndpointSpec::bulk_in(64).exclusive(),
    ];
    let mut first = Blob::new(9, &pair);
    let mut second = Blob::new(9, &pair);

    let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default())
        .with_allocator(Allocator::default().with_address_count(4));
    dev.register(&mut first).unwrap();
    dev.register(&mut second).unwrap();

    let err = dev.enable().unwrap_err();
    assert!(matches!(
        err,
        Error::Alloc(AllocError::NoEndpointAddress { module: 1, .. })
    ));
    assert!(!dev.is_enabled());
    assert!(!dev.peripheral().is_powered());
    assert!(!dev.peripheral().is_present());
}

// ═══════════════════════════════════════════════════════════════════════════
// Control transfers
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn large_configuration_descriptor_takes_five_windows() {
    let mut blob = Blob::new(291, &[]);
    let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
    dev.register(&mut blob).unwrap();
    dev.enable().unwrap();
    dev.peripheral_mut().bus_reset();
    dev.on_interrupt();

    let setup = get_descriptor(desc_type::CONFIGURATION, 300);
    dev.peripheral_mut().host_setup(0, &setup.to_bytes()).unwrap();
    dev.on_interrupt();

    let mut sizes = Vec::new();
    let mut total = Vec::new();
    let mut packet = [0u8; 64];
    loop {
        let n = dev.peripheral_mut().host_in(0, &mut packet).unwrap();
        dev.on_interrupt();
        sizes.push(n);
        total.extend_from_slice(&packet[..n]);
        if total.len() >= 300 {
            break;
        }
    }
    assert_eq!(sizes, vec![64, 64, 64, 64, 44]);
    assert_eq!(u16::from_le_bytes([total[2], total[3]]), 300);
    assert_eq!(dev.control_stage(), Stage::StatusOut);

    // Nothing further is armed for the data stage.
    assert_eq!(
        dev.peripheral_mut().host_in(0, &mut packet),
        Err(Handshake::Nak)
    );
    dev.peripheral_mut().host_out(0, &[]).unwrap();
    dev.on_interrupt();
    assert_eq!(dev.control_stage(), Stage::Idle);
}

#[test]
fn bus_reset_mid_transfer_returns_pipe_to_idle() {
    let mut blob = Blob::new(291, &[]);
    let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
    dev.register(&mut blob).unwrap();
    dev.enable().unwrap();
    enumerate(&mut dev, 7).unwrap();

    let setup = get_descriptor(desc_type::CONFIGURATION, 300);
    dev.peripheral_mut().host_setup(0, &setup.to_bytes()).unwrap();
    dev.on_interrupt();
    let mut packet = [0u8; 64];
    dev.peripheral_mut().host_in(0, &mut packet).unwrap();
    dev.on_interrupt();
    assert_eq!(dev.control_stage(), Stage::DataIn);

    dev.peripheral_mut().bus_reset();
    dev.on_interrupt();
    assert_eq!(dev.control_stage(), Stage::Idle);
    assert_eq!(dev.state(), DeviceState::Default);
    assert_eq!(dev.configuration(), 0);
    assert_eq!(
        dev.peripheral_mut().host_in(0, &mut packet),
        Err(Handshake::Nak)
    );

    // A fresh enumeration works.
    enumerate(&mut dev, 8).unwrap();
    assert_eq!(dev.peripheral().address(), 8);
}

// ═══════════════════════════════════════════════════════════════════════════
// Suspend / resume
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn suspend_and_host_resume() {
    let mut blob = Blob::new(9, &[]);
    let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
    dev.register(&mut blob).unwrap();
    dev.enable().unwrap();
    enumerate(&mut dev, 2).unwrap();

    raise(
        &mut dev,
        Interrupts {
            suspend: true,
            ..Interrupts::NONE
        },
    );
    assert_eq!(dev.bus_state(), BusState::Suspended);
    assert!(dev.peripheral().is_low_power());

    raise(
        &mut dev,
        Interrupts {
            wakeup: true,
            ..Interrupts::NONE
        },
    );
    assert_eq!(dev.bus_state(), BusState::Active);
    assert!(!dev.peripheral().is_low_power());
    assert_eq!(dev.state(), DeviceState::Configured);
}

#[test]
fn disable_detaches_and_reopens_registration() {
    let mut blob = Blob::new(9, &[]);
    let mut extra = Blob::new(9, &[]);
    let mut dev = UsbDevice::new(SimPeripheral::new(), DeviceConfig::default());
    dev.register(&mut blob).unwrap();
    dev.enable().unwrap();
    enumerate(&mut dev, 2).unwrap();

    dev.disable();
    assert_eq!(dev.state(), DeviceState::Detached);
    assert!(!dev.peripheral().is_present());
    assert!(dev.config_descriptor().is_none());
    assert_eq!(dev.remote_wakeup(), Err(Error::NotEnabled));

    dev.register(&mut extra).unwrap();
    dev.enable().unwrap();
    enumerate(&mut dev, 4).unwrap();
    let mut config = [0u8; 64];
    let n = control_read(
        &mut dev,
        get_descriptor(desc_type::CONFIGURATION, 64),
        &mut config,
    )
    .unwrap();
    assert_eq!(n, 9 + 9 + 9);
    assert_eq!(config[4], 2);
}
