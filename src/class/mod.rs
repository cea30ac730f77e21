//! Device-class modules built on the engine's [`UsbClass`] contract.
//!
//! - [`serial::CdcAcm`]: CDC-ACM virtual serial port (IAD + two interfaces)
//! - [`hid::HidKeyboard`]: boot-protocol HID keyboard
//!
//! Each module comes with a mainline handle that talks to the interrupt
//! side through `heapless::spsc` queues only.
//!
//! [`UsbClass`]: crate::usb::UsbClass

pub mod hid;
pub mod serial;
