//! usbcomp firmware - CDC serial port + HID keyboard on an STM32G431.
//!
//! The composite device lives in a critical-section mutex shared by the
//! `USB_LP` interrupt (which runs the whole USB state machine) and the
//! mainline tasks (which only talk to the class modules through their
//! queues). Serial input is echoed back uppercased; letters and digits are
//! also typed on the keyboard.

#![no_std]
#![no_main]

use core::cell::RefCell;

use defmt::{info, unwrap, warn};
use embassy_executor::Spawner;
use embassy_stm32::interrupt::{Interrupt, InterruptExt, Priority};
use embassy_stm32::Config;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Timer};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use usbcomp::class::hid::{HidKeyboard, KeyboardChannel, KeyboardReport, KeyboardSender};
use usbcomp::class::serial::{CdcAcm, SerialChannel, SerialPort};
use usbcomp::usb::stm32::Stm32Usb;
use usbcomp::usb::suspend::BusState;
use usbcomp::usb::{DeviceConfig, UsbDevice};

struct SharedDevice(UsbDevice<'static, Stm32Usb>);

// SAFETY: single core; the device is only reached inside `USB_DEVICE.lock`.
unsafe impl Send for SharedDevice {}

static USB_DEVICE: Mutex<CriticalSectionRawMutex, RefCell<Option<SharedDevice>>> =
    Mutex::new(RefCell::new(None));

static SERIAL_CHANNEL: StaticCell<SerialChannel> = StaticCell::new();
static KEYBOARD_CHANNEL: StaticCell<KeyboardChannel> = StaticCell::new();
static CDC: StaticCell<CdcAcm<'static>> = StaticCell::new();
static KEYBOARD: StaticCell<HidKeyboard<'static>> = StaticCell::new();

/// Poll period of the echo task.
const ECHO_POLL_MS: u64 = 2;

#[no_mangle]
extern "C" fn USB_LP() {
    USB_DEVICE.lock(|cell| {
        if let Some(dev) = cell.borrow_mut().as_mut() {
            dev.0.on_interrupt();
        }
    });
}

fn with_device<R>(f: impl FnOnce(&mut UsbDevice<'static, Stm32Usb>) -> R) -> Option<R> {
    USB_DEVICE.lock(|cell| cell.borrow_mut().as_mut().map(|dev| f(&mut dev.0)))
}

fn clock_config() -> Config {
    use embassy_stm32::rcc::*;

    let mut config = Config::default();
    config.rcc.hsi48 = Some(Hsi48Config {
        sync_from_usb: true,
    });
    // 16 MHz HSI / 4 * 85 / 2 = 170 MHz
    config.rcc.pll = Some(Pll {
        source: PllSource::HSI,
        prediv: PllPreDiv::DIV4,
        mul: PllMul::MUL85,
        divp: None,
        divq: None,
        divr: Some(PllRDiv::DIV2),
    });
    config.rcc.sys = Sysclk::PLL1_R;
    config.rcc.boost = true;
    config.rcc.mux.clk48sel = mux::Clk48sel::HSI48;
    config
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_stm32::init(clock_config());
    info!("usbcomp starting");

    let (cdc, port) = SERIAL_CHANNEL.init(SerialChannel::new()).split();
    let (keyboard, sender) = KEYBOARD_CHANNEL.init(KeyboardChannel::new()).split();
    let cdc = CDC.init(cdc);
    let keyboard = KEYBOARD.init(keyboard);

    let mut device = UsbDevice::new(Stm32Usb::new(p.USB, p.PA12, p.PA11), DeviceConfig::default());
    unwrap!(device.register(cdc));
    unwrap!(device.register(keyboard));
    if let Err(e) = device.enable() {
        // Nothing was attached; leave the bus alone.
        warn!("USB: composite device not built: {}", e);
        return;
    }
    USB_DEVICE.lock(|cell| *cell.borrow_mut() = Some(SharedDevice(device)));

    Interrupt::USB_LP.set_priority(Priority::P2);
    // SAFETY: the handler only touches state behind the mutex above.
    unsafe { Interrupt::USB_LP.enable() };

    unwrap!(spawner.spawn(echo(port, sender)));
}

#[embassy_executor::task]
async fn echo(mut port: SerialPort<'static>, mut keys: KeyboardSender<'static>) {
    let mut buf = [0u8; 64];
    loop {
        Timer::after(Duration::from_millis(ECHO_POLL_MS)).await;

        let n = port.read(&mut buf);
        if n == 0 {
            continue;
        }

        if with_device(|d| d.bus_state()) == Some(BusState::Suspended) {
            match with_device(|d| d.remote_wakeup()) {
                Some(Err(e)) => warn!("USB: wakeup refused: {}", e),
                _ => info!("USB: waking host"),
            }
        }

        for byte in &mut buf[..n] {
            if let Some(report) = KeyboardReport::from_ascii(*byte) {
                if !keys.tap(report) {
                    warn!("HID: report queue full");
                }
            }
            byte.make_ascii_uppercase();
        }

        let mut sent = 0;
        while sent < n {
            let w = port.write(&buf[sent..n]);
            if w == 0 {
                if !port.dtr() {
                    // Nobody is listening; drop the rest.
                    break;
                }
                Timer::after(Duration::from_millis(1)).await;
            }
            sent += w;
        }
    }
}
