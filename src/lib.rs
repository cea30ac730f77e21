//! usbcomp - USB composite device engine.
//!
//! Builds one full-speed composite device out of independent class
//! modules on a PMA-based USB peripheral (STM32 USB FS style):
//!
//! - [`usb::alloc`] hands out endpoint addresses, packet memory and
//!   interface numbers
//! - [`usb::compose`] renders the configuration descriptor from module
//!   templates
//! - [`usb::control`] runs endpoint-0 transfers
//! - [`usb::UsbDevice::on_interrupt`] dispatches every interrupt cause
//!
//! The engine only talks to hardware through [`usb::UsbPeripheral`], so
//! everything except `usb::stm32` runs on the host against
//! [`usb::sim::SimPeripheral`].
//!
//! Usage: `cargo test` on the host, `cargo run --release --features
//! embedded` for the STM32G431 firmware in main.rs.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod class;
pub mod config;
pub mod error;
pub mod usb;

pub use error::{AllocError, Error};
