//! Device-class module contract.
//!
//! A module (CDC port, HID keyboard, ...) is any value implementing
//! [`UsbClass`]. It declares how many interfaces and which endpoints it
//! needs, renders its descriptor template once the allocator has placed it,
//! and reacts to the lifecycle and transfer hooks the engine calls from the
//! USB interrupt. Every hook has a default so modules implement only what
//! they use.

use crate::usb::control::ControlResponder;
use crate::usb::descriptor::Patch;
use crate::usb::endpoint::{Direction, EndpointAlloc};
use crate::usb::hw::{EndpointStatus, UsbPeripheral};
use crate::usb::setup::SetupPacket;

/// Answer of a module to a control request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Handled,
    /// The request is stalled unless another module claims it.
    Unsupported,
}

/// Numbers assigned to a module, handed to its descriptor renderer.
pub struct RenderContext<'a> {
    first_interface: u8,
    endpoints: &'a [EndpointAlloc],
}

impl<'a> RenderContext<'a> {
    pub fn new(first_interface: u8, endpoints: &'a [EndpointAlloc]) -> Self {
        Self {
            first_interface,
            endpoints,
        }
    }

    pub fn first_interface(&self) -> u8 {
        self.first_interface
    }

    /// Absolute interface number of module-relative interface `rel`.
    pub fn interface(&self, rel: u8) -> u8 {
        self.first_interface.wrapping_add(rel)
    }

    pub fn endpoint(&self, slot: usize) -> Option<&EndpointAlloc> {
        self.endpoints.get(slot)
    }

    /// Hardware address assigned to `slot` (no direction bit).
    pub fn endpoint_number(&self, slot: usize) -> u8 {
        self.endpoints.get(slot).map_or(0, |e| e.address)
    }

    /// Copy `template` into `out`, then add the assigned numbers into the
    /// patched fields. Template fields hold the module-relative value, so
    /// an IN endpoint is written as `0x80` and becomes `0x80 + address`.
    pub fn render_template(&self, template: &[u8], patches: &[Patch], out: &mut [u8]) -> usize {
        let n = template.len().min(out.len());
        out[..n].copy_from_slice(&template[..n]);
        for patch in patches {
            let Some(byte) = out[..n].get_mut(patch.offset()) else {
                continue;
            };
            let add = match *patch {
                Patch::Interface(_) => self.first_interface,
                Patch::Endpoint { slot, .. } => self.endpoint_number(slot),
            };
            *byte = byte.wrapping_add(add);
        }
        n
    }
}

/// One placed endpoint, as seen from its module.
pub struct EndpointIo<'a> {
    hw: &'a mut dyn UsbPeripheral,
    ep: &'a EndpointAlloc,
}

impl<'a> EndpointIo<'a> {
    pub fn new(hw: &'a mut dyn UsbPeripheral, ep: &'a EndpointAlloc) -> Self {
        Self { hw, ep }
    }

    pub fn alloc(&self) -> &EndpointAlloc {
        self.ep
    }

    pub fn max_packet_size(&self) -> usize {
        (self.ep.spec.size as usize).min(self.ep.buffer_size)
    }

    /// Copy one packet into packet memory and hand it to the hardware.
    /// Returns the bytes queued (0 on an OUT endpoint).
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.ep.spec.direction != Direction::In {
            return 0;
        }
        let n = data.len().min(self.max_packet_size());
        self.hw.write_packet_memory(self.ep.pma_offset, &data[..n]);
        self.hw.set_tx_count(self.ep.address, n);
        self.enable_tx();
        n
    }

    /// Copy the last received packet out of packet memory.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.ep.spec.direction != Direction::Out {
            return 0;
        }
        let n = self
            .hw
            .rx_count(self.ep.address)
            .min(self.max_packet_size())
            .min(buf.len());
        self.hw.read_packet_memory(self.ep.pma_offset, &mut buf[..n]);
        n
    }

    /// Bytes waiting in the receive buffer.
    pub fn rx_count(&self) -> usize {
        self.hw.rx_count(self.ep.address).min(self.max_packet_size())
    }

    pub fn enable_tx(&mut self) {
        self.hw
            .set_status(self.ep.address, Direction::In, EndpointStatus::Valid);
    }

    pub fn enable_rx(&mut self) {
        self.hw
            .set_status(self.ep.address, Direction::Out, EndpointStatus::Valid);
    }

    /// A packet is armed and not yet collected by the host.
    pub fn is_busy(&self) -> bool {
        self.hw.status(self.ep.address, self.ep.spec.direction) == EndpointStatus::Valid
    }

    /// Leave the endpoint answering NAK until it is armed again.
    pub fn hold(&mut self) {
        self.hw
            .set_status(self.ep.address, self.ep.spec.direction, EndpointStatus::Nak);
    }

    pub fn stall(&mut self) {
        self.hw
            .set_status(self.ep.address, self.ep.spec.direction, EndpointStatus::Stall);
    }
}

/// All endpoints of one module, addressed by slot.
pub struct EndpointBus<'a> {
    hw: &'a mut dyn UsbPeripheral,
    endpoints: &'a [EndpointAlloc],
}

impl<'a> EndpointBus<'a> {
    pub fn new(hw: &'a mut dyn UsbPeripheral, endpoints: &'a [EndpointAlloc]) -> Self {
        Self { hw, endpoints }
    }

    pub fn endpoint(&mut self, slot: usize) -> Option<EndpointIo<'_>> {
        let ep = self.endpoints.get(slot)?;
        Some(EndpointIo::new(&mut *self.hw, ep))
    }
}

/// A device-class module.
pub trait UsbClass {
    /// Interfaces consumed.
    fn interface_count(&self) -> u8;

    /// Endpoint requirements, in slot order.
    fn endpoints(&self) -> &[crate::usb::endpoint::EndpointSpec];

    /// Bytes `render_descriptor` writes.
    fn descriptor_len(&self) -> usize;

    /// Write the finished interface/endpoint descriptors into `out`
    /// (exactly `descriptor_len()` bytes long). Returns the bytes written.
    fn render_descriptor(&self, ctx: &RenderContext<'_>, out: &mut [u8]) -> usize;

    fn on_bus_reset(&mut self) {}

    /// The host selected configuration `value` (0 = unconfigured).
    fn on_set_configuration(&mut self, _value: u8, _bus: &mut EndpointBus<'_>) {}

    /// A request with an IN or OUT data stage. `interface` is relative to
    /// the module's first interface. IN requests must register a source on
    /// `ctl`; OUT requests may narrow the receive length with `ctl.rx`.
    fn on_control_data_setup(
        &mut self,
        _setup: &SetupPacket,
        _interface: u8,
        _ctl: &mut ControlResponder<'_>,
    ) -> Outcome {
        Outcome::Unsupported
    }

    fn on_control_no_data_setup(&mut self, _setup: &SetupPacket, _interface: u8) -> Outcome {
        Outcome::Unsupported
    }

    /// Data-out stage of a request this module accepted has completed.
    fn on_control_out(&mut self, _setup: &SetupPacket, _interface: u8, _data: &[u8]) {}

    /// ENDPOINT_HALT was cleared on `slot`.
    fn on_clear_feature(&mut self, _slot: usize, _io: &mut EndpointIo<'_>) {}

    /// Alternate setting 0 or 1 selected on relative `interface`.
    fn on_set_interface(&mut self, _interface: u8, _alt: u8) -> Outcome {
        Outcome::Handled
    }

    fn on_in_complete(&mut self, _slot: usize, _io: &mut EndpointIo<'_>) {}

    fn on_out_complete(&mut self, _slot: usize, _io: &mut EndpointIo<'_>) {}

    fn on_start_of_frame(&mut self, _bus: &mut EndpointBus<'_>) {}

    /// The device is being torn down.
    fn on_disable(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::endpoint::EndpointSpec;

    fn placed(spec: EndpointSpec, slot: usize, address: u8) -> EndpointAlloc {
        EndpointAlloc {
            spec,
            module: 0,
            slot,
            address,
            pma_offset: 0,
            buffer_size: spec.buffer_size(),
        }
    }

    #[test]
    fn template_fields_are_offset_not_overwritten() {
        let eps = [
            placed(EndpointSpec::bulk_out(64), 0, 2),
            placed(EndpointSpec::bulk_in(64), 1, 5),
        ];
        let ctx = RenderContext::new(3, &eps);
        // interface(9) + two endpoints(7 each)
        let template = [
            9, 4, 1, 0, 2, 0x0A, 0, 0, 0, //
            7, 5, 0x00, 2, 64, 0, 0, //
            7, 5, 0x80, 2, 64, 0, 0,
        ];
        let patches = [
            Patch::Interface(2),
            Patch::Endpoint { offset: 11, slot: 0 },
            Patch::Endpoint { offset: 18, slot: 1 },
        ];
        let mut out = [0u8; 23];
        assert_eq!(ctx.render_template(&template, &patches, &mut out), 23);
        assert_eq!(out[2], 4); // relative interface 1 + first interface 3
        assert_eq!(out[11], 0x02);
        assert_eq!(out[18], 0x85);
    }

    #[test]
    fn out_of_range_patch_is_ignored() {
        let ctx = RenderContext::new(1, &[]);
        let mut out = [0u8; 2];
        let n = ctx.render_template(&[9, 4], &[Patch::Interface(7)], &mut out);
        assert_eq!(n, 2);
        assert_eq!(out, [9, 4]);
    }
}
