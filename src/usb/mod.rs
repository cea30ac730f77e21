//! USB composite device engine.
//!
//! Turns a list of class modules into one composite full-speed device on a
//! PMA-based peripheral:
//!
//! - `alloc`: endpoint addresses, packet memory and interface numbers
//! - `compose`: the configuration descriptor, built from module templates
//! - `control`: the endpoint-0 transfer state machine
//! - `dispatch`: the interrupt handler body
//! - `device`: module registry, lifecycle and standard requests
//!
//! The engine talks to hardware only through [`hw::UsbPeripheral`];
//! [`sim::SimPeripheral`] stands in for the silicon on the host.

pub mod alloc;
pub mod class;
pub mod compose;
pub mod control;
pub mod descriptor;
pub mod device;
mod dispatch;
pub mod endpoint;
pub mod hw;
pub mod setup;
pub mod sim;
#[cfg(feature = "embedded")]
pub mod stm32;
pub mod suspend;


pub use class::{EndpointBus, EndpointIo, Outcome, RenderContext, UsbClass};
pub use control::ControlResponder;
pub use descriptor::DeviceConfig;
pub use device::{DeviceState, UsbDevice};
pub use endpoint::{AddressParity, Direction, EndpointSpec, TransferType};
pub use hw::UsbPeripheral;
pub use setup::SetupPacket;
