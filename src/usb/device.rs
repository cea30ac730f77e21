//! Module registry, device lifecycle and standard requests.
//!
//! Modules register before `enable()`. Enabling runs the allocator and the
//! descriptor composer over the registered list, powers the peripheral up
//! and connects the pull-up. Everything derived from the module list is
//! rebuilt on every enable, so a device can be disabled, re-registered and
//! enabled again.

use heapless::Vec;

use crate::config::{EP0_MAX_PACKET, EP0_RX_OFFSET, EP0_TX_OFFSET, MAX_INTERFACES, MAX_MODULES};
use crate::error::Error;
use crate::usb::alloc::{Allocation, Allocator, ModuleRequirements};
use crate::usb::class::{EndpointBus, EndpointIo, Outcome, UsbClass};
use crate::usb::compose::{compose, ConfigDescriptor};
use crate::usb::control::{ControlPipe, Stage};
use crate::usb::descriptor::{
    desc_type, language_table, string_descriptor, string_index, DeviceConfig,
};
use crate::usb::endpoint::{Direction, EndpointAlloc, TransferType};
use crate::usb::hw::{BufferDesc, EndpointStatus, HwEndpoint, UsbPeripheral};
use crate::usb::setup::{feature, request, Recipient, RequestType, SetupPacket};
use crate::usb::suspend::{BusState, SuspendTracker};

/// Device state as the host sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// Not enabled; pull-up off.
    Detached,
    /// Attached, address 0.
    Default,
    Addressed,
    Configured,
}

/// The composite device engine.
pub struct UsbDevice<'m, P: UsbPeripheral> {
    pub(super) hw: P,
    pub(super) config: DeviceConfig,
    pub(super) allocator: Allocator,
    pub(super) modules: Vec<&'m mut dyn UsbClass, MAX_MODULES>,
    pub(super) alloc: Option<Allocation>,
    pub(super) descriptor: Option<ConfigDescriptor>,
    pub(super) pipe: ControlPipe,
    pub(super) suspend: SuspendTracker,
    pub(super) state: DeviceState,
    pub(super) enabled: bool,
    /// SET_ADDRESS value, applied once its status stage has gone out.
    pub(super) pending_address: Option<u8>,
    pub(super) configuration: u8,
    pub(super) remote_wakeup_enabled: bool,
    pub(super) alt_settings: [u8; MAX_INTERFACES],
    /// Module (and relative interface) that accepted the current data-out
    /// request.
    pub(super) control_owner: Option<(usize, u8)>,
}

impl<'m, P: UsbPeripheral> UsbDevice<'m, P> {
    pub fn new(hw: P, config: DeviceConfig) -> Self {
        Self {
            hw,
            config,
            allocator: Allocator::default(),
            modules: Vec::new(),
            alloc: None,
            descriptor: None,
            pipe: ControlPipe::new(),
            suspend: SuspendTracker::new(),
            state: DeviceState::Detached,
            enabled: false,
            pending_address: None,
            configuration: 0,
            remote_wakeup_enabled: false,
            alt_settings: [0; MAX_INTERFACES],
            control_owner: None,
        }
    }

    /// Replace the allocation parameters (fewer endpoint addresses, a
    /// different packet-memory window).
    pub fn with_allocator(mut self, allocator: Allocator) -> Self {
        self.allocator = allocator;
        self
    }

    // ------------------------------------------------------------------
    // Registry and lifecycle
    // ------------------------------------------------------------------

    /// Append a module. Registration order fixes interface numbers,
    /// endpoint scan order and descriptor order.
    pub fn register(&mut self, module: &'m mut dyn UsbClass) -> Result<(), Error> {
        if self.enabled {
            return Err(Error::Busy);
        }
        self.modules.push(module).map_err(|_| Error::TooManyModules)
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Build the device and attach it to the bus.
    ///
    /// On failure nothing has been written to the peripheral. Calling it on
    /// an enabled device does nothing.
    pub fn enable(&mut self) -> Result<(), Error> {
        if self.enabled {
            return Ok(());
        }

        let alloc = self
            .allocator
            .allocate(self.modules.iter().map(|m| ModuleRequirements {
                interfaces: m.interface_count(),
                endpoints: m.endpoints(),
            }))
            .inspect_err(|e| error!("USB: allocation failed: {:?}", e))?;
        let descriptor = compose(
            self.modules.iter().map(|m| &**m as &dyn UsbClass),
            &alloc,
            &self.config,
        )?;

        info!(
            "USB: enabling {} modules, {} endpoint slots, PMA end {}",
            self.modules.len(),
            alloc.endpoints().len(),
            alloc.pma_end()
        );
        for ep in alloc.endpoints() {
            debug!(
                "USB: module {} slot {} on {:02x}, PMA {}",
                ep.module,
                ep.slot,
                ep.endpoint_address(),
                ep.pma_offset
            );
        }
        self.alloc = Some(alloc);
        self.descriptor = Some(descriptor);
        self.enabled = true;

        self.hw.power_up();
        self.bus_reset();
        self.hw.set_bus_presence(true);
        Ok(())
    }

    /// Detach from the bus and power the peripheral down. Every module's
    /// `on_disable` runs. Calling it on a disabled device does nothing.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        info!("USB: disabling");
        self.hw.set_bus_presence(false);
        self.hw.power_down();
        self.pipe.reset();
        for module in self.modules.iter_mut() {
            module.on_disable();
        }
        self.enabled = false;
        self.state = DeviceState::Detached;
        self.configuration = 0;
        self.pending_address = None;
        self.control_owner = None;
        self.alloc = None;
        self.descriptor = None;
    }

    /// Request remote wakeup. Only honoured while suspended and after the
    /// host enabled the feature.
    pub fn remote_wakeup(&mut self) -> Result<(), Error> {
        if !self.enabled {
            return Err(Error::NotEnabled);
        }
        if !self.remote_wakeup_enabled || !self.suspend.remote_wakeup(&mut self.hw) {
            return Err(Error::WakeupNotAllowed);
        }
        info!("USB: remote wakeup");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_configured(&self) -> bool {
        self.state == DeviceState::Configured
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn bus_state(&self) -> BusState {
        self.suspend.bus_state()
    }

    pub fn control_stage(&self) -> Stage {
        self.pipe.stage()
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup_enabled
    }

    pub fn device_config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.alloc.as_ref()
    }

    pub fn config_descriptor(&self) -> Option<&ConfigDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn peripheral(&self) -> &P {
        &self.hw
    }

    pub fn peripheral_mut(&mut self) -> &mut P {
        &mut self.hw
    }

    // ------------------------------------------------------------------
    // Bus reset and endpoint programming
    // ------------------------------------------------------------------

    /// Back to the default state: EP0 armed for SETUP, every other
    /// endpoint programmed but disabled, address 0.
    pub(super) fn bus_reset(&mut self) {
        self.pipe.reset();
        self.suspend.reset(&mut self.hw);
        self.pending_address = None;
        self.configuration = 0;
        self.remote_wakeup_enabled = false;
        self.alt_settings = [0; MAX_INTERFACES];
        self.control_owner = None;
        self.state = DeviceState::Default;

        self.hw.configure_endpoint(
            0,
            &HwEndpoint {
                address: 0,
                transfer_type: TransferType::Control,
                double_buffered: None,
                tx: Some(BufferDesc {
                    offset: EP0_TX_OFFSET,
                    size: EP0_MAX_PACKET,
                }),
                rx: Some(BufferDesc {
                    offset: EP0_RX_OFFSET,
                    size: EP0_MAX_PACKET,
                }),
            },
        );
        self.hw.set_status(0, Direction::Out, EndpointStatus::Valid);
        self.hw.set_status(0, Direction::In, EndpointStatus::Nak);

        if let Some(alloc) = self.alloc.as_ref() {
            for address in 1..=alloc.highest_address() {
                if let Some(ep) = register_layout(address, alloc.register_slots(address)) {
                    self.hw.configure_endpoint(address, &ep);
                    self.hw.set_status(address, Direction::Out, EndpointStatus::Disabled);
                    self.hw.set_status(address, Direction::In, EndpointStatus::Disabled);
                }
            }
        }
        self.hw.set_address(0);

        for module in self.modules.iter_mut() {
            module.on_bus_reset();
        }
        debug!("USB: bus reset");
    }

    fn set_configuration(&mut self, value: u8) {
        let Some(alloc) = self.alloc.as_ref() else {
            return;
        };

        for ep in alloc.endpoints() {
            let dir = ep.spec.direction;
            let status = match (value, dir) {
                (0, _) => EndpointStatus::Disabled,
                (_, Direction::In) => EndpointStatus::Nak,
                (_, Direction::Out) => EndpointStatus::Valid,
            };
            self.hw.reset_data_toggle(ep.address, dir);
            self.hw.set_status(ep.address, dir, status);
        }

        self.configuration = value;
        self.alt_settings = [0; MAX_INTERFACES];
        self.state = if value == 0 {
            DeviceState::Addressed
        } else {
            DeviceState::Configured
        };
        info!("USB: configuration {}", value);

        for (index, module) in self.modules.iter_mut().enumerate() {
            let mut bus = EndpointBus::new(&mut self.hw, alloc.module_endpoints(index));
            module.on_set_configuration(value, &mut bus);
        }
    }

    /// Status stage of SET_ADDRESS went out; the new address applies now.
    pub(super) fn apply_pending_address(&mut self) {
        if let Some(address) = self.pending_address.take() {
            self.hw.set_address(address);
            if self.state != DeviceState::Configured {
                self.state = if address == 0 {
                    DeviceState::Default
                } else {
                    DeviceState::Addressed
                };
            }
            info!("USB: address {}", address);
        }
    }

    // ------------------------------------------------------------------
    // Control requests
    // ------------------------------------------------------------------

    /// A SETUP packet arrived on EP0.
    pub(super) fn control_setup(&mut self) {
        let setup = self.pipe.read_setup(&mut self.hw);
        self.control_owner = None;
        self.pending_address = None;
        self.hw.set_status(0, Direction::In, EndpointStatus::Nak);
        trace!(
            "USB: SETUP {:02x} {:02x} {:04x} {:04x} {}",
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );

        let outcome = self.handle_request(&setup);
        match (outcome, setup.data_direction()) {
            (Outcome::Handled, Some(Direction::In)) if self.pipe.has_source() => {
                self.pipe.start_in(&mut self.hw, self.descriptor.as_ref());
            }
            (Outcome::Handled, Some(Direction::Out)) => {
                self.pipe.start_out(&mut self.hw);
            }
            (Outcome::Handled, None) => {
                self.pipe.send_status(&mut self.hw);
            }
            _ => {
                debug!(
                    "USB: stall {:02x} {:02x}",
                    setup.request_type, setup.request
                );
                self.control_owner = None;
                self.pipe.stall(&mut self.hw);
            }
        }
    }

    /// All data-out bytes of the current request are in.
    pub(super) fn control_data_received(&mut self) {
        if let Some((module, interface)) = self.control_owner.take() {
            let setup = *self.pipe.setup();
            if let Some(m) = self.modules.get_mut(module) {
                m.on_control_out(&setup, interface, self.pipe.received());
            }
        }
        self.pipe.send_status(&mut self.hw);
    }

    fn handle_request(&mut self, setup: &SetupPacket) -> Outcome {
        match (setup.kind(), setup.recipient()) {
            (RequestType::Standard, Recipient::Device) => self.standard_device(setup),
            (RequestType::Standard, Recipient::Interface) => self.standard_interface(setup),
            (RequestType::Standard, Recipient::Endpoint) => self.standard_endpoint(setup),
            (RequestType::Class | RequestType::Vendor, Recipient::Interface) => {
                match self.interface_owner(setup.interface()) {
                    Some((module, rel)) => self.forward(module, rel, setup),
                    None => Outcome::Unsupported,
                }
            }
            (RequestType::Class | RequestType::Vendor, Recipient::Endpoint) => {
                match self.endpoint_owner(setup.endpoint()) {
                    Some(ep) => self.forward(ep.module, 0, setup),
                    None => Outcome::Unsupported,
                }
            }
            (RequestType::Vendor, Recipient::Device) => {
                for module in 0..self.modules.len() {
                    if self.forward(module, 0, setup) == Outcome::Handled {
                        return Outcome::Handled;
                    }
                }
                Outcome::Unsupported
            }
            _ => Outcome::Unsupported,
        }
    }

    fn interface_owner(&self, interface: u8) -> Option<(usize, u8)> {
        self.alloc.as_ref()?.interface_owner(interface)
    }

    fn endpoint_owner(&self, ep_addr: u8) -> Option<EndpointAlloc> {
        self.alloc.as_ref()?.endpoint_by_address(ep_addr).copied()
    }

    /// Offer a request to one module.
    fn forward(&mut self, module: usize, interface: u8, setup: &SetupPacket) -> Outcome {
        let Some(m) = self.modules.get_mut(module) else {
            return Outcome::Unsupported;
        };
        let outcome = match setup.data_direction() {
            Some(_) => {
                let mut responder = self.pipe.responder();
                m.on_control_data_setup(setup, interface, &mut responder)
            }
            None => m.on_control_no_data_setup(setup, interface),
        };
        if outcome == Outcome::Handled && setup.data_direction() == Some(Direction::Out) {
            self.control_owner = Some((module, interface));
        }
        outcome
    }

    fn standard_device(&mut self, setup: &SetupPacket) -> Outcome {
        match setup.request {
            request::GET_STATUS => {
                let mut status = 0u8;
                if self.config.self_powered {
                    status |= 0x01;
                }
                if self.remote_wakeup_enabled {
                    status |= 0x02;
                }
                self.pipe.responder().tx_copy(&[status, 0]);
                Outcome::Handled
            }
            request::CLEAR_FEATURE | request::SET_FEATURE
                if setup.value == feature::DEVICE_REMOTE_WAKEUP =>
            {
                if !self.config.remote_wakeup {
                    return Outcome::Unsupported;
                }
                self.remote_wakeup_enabled = setup.request == request::SET_FEATURE;
                Outcome::Handled
            }
            request::SET_ADDRESS if setup.value <= 127 => {
                self.pending_address = Some(setup.value as u8);
                Outcome::Handled
            }
            request::GET_DESCRIPTOR => self.get_descriptor(setup),
            request::GET_CONFIGURATION => {
                let value = self.configuration;
                self.pipe.responder().tx_copy(&[value]);
                Outcome::Handled
            }
            request::SET_CONFIGURATION if setup.value <= 1 => {
                if self.state == DeviceState::Default {
                    return Outcome::Unsupported;
                }
                self.set_configuration(setup.value as u8);
                Outcome::Handled
            }
            _ => Outcome::Unsupported,
        }
    }

    fn get_descriptor(&mut self, setup: &SetupPacket) -> Outcome {
        let index = setup.value_lo();
        match setup.value_hi() {
            desc_type::DEVICE => {
                let desc = self.config.device_descriptor();
                self.pipe.responder().tx_copy(&desc);
                Outcome::Handled
            }
            desc_type::CONFIGURATION if self.descriptor.is_some() => {
                self.pipe.responder().tx_config();
                Outcome::Handled
            }
            desc_type::STRING if index == string_index::LANGUAGE => {
                self.pipe.responder().tx_with(language_table);
                Outcome::Handled
            }
            desc_type::STRING => match self.config.string(index) {
                Some(s) => {
                    self.pipe.responder().tx_with(|out| string_descriptor(s, out));
                    Outcome::Handled
                }
                None => Outcome::Unsupported,
            },
            // Full-speed only: no qualifier, no other-speed configuration.
            _ => Outcome::Unsupported,
        }
    }

    fn standard_interface(&mut self, setup: &SetupPacket) -> Outcome {
        if self.state != DeviceState::Configured {
            return Outcome::Unsupported;
        }
        let interface = setup.interface();
        let Some((module, rel)) = self.interface_owner(interface) else {
            return Outcome::Unsupported;
        };

        match setup.request {
            request::GET_STATUS => {
                self.pipe.responder().tx_copy(&[0, 0]);
                Outcome::Handled
            }
            request::GET_INTERFACE => {
                let alt = self.alt_settings[interface as usize];
                self.pipe.responder().tx_copy(&[alt]);
                Outcome::Handled
            }
            request::SET_INTERFACE if setup.value <= 1 => {
                let alt = setup.value as u8;
                let Some(m) = self.modules.get_mut(module) else {
                    return Outcome::Unsupported;
                };
                let outcome = m.on_set_interface(rel, alt);
                if outcome == Outcome::Handled {
                    self.alt_settings[interface as usize] = alt;
                }
                outcome
            }
            // Class descriptors (HID report, ...) belong to the module.
            _ => self.forward(module, rel, setup),
        }
    }

    fn standard_endpoint(&mut self, setup: &SetupPacket) -> Outcome {
        let ep_addr = setup.endpoint();
        if ep_addr & 0x0F == 0 {
            return match setup.request {
                request::GET_STATUS => {
                    self.pipe.responder().tx_copy(&[0, 0]);
                    Outcome::Handled
                }
                request::CLEAR_FEATURE | request::SET_FEATURE => Outcome::Handled,
                _ => Outcome::Unsupported,
            };
        }
        if self.state != DeviceState::Configured {
            return Outcome::Unsupported;
        }
        let Some(ep) = self.endpoint_owner(ep_addr) else {
            return Outcome::Unsupported;
        };
        let dir = ep.spec.direction;

        match setup.request {
            request::GET_STATUS => {
                let halted = self.hw.status(ep.address, dir) == EndpointStatus::Stall;
                self.pipe.responder().tx_copy(&[halted as u8, 0]);
                Outcome::Handled
            }
            request::SET_FEATURE if setup.value == feature::ENDPOINT_HALT => {
                self.hw.set_status(ep.address, dir, EndpointStatus::Stall);
                debug!("USB: halt {:02x}", ep_addr);
                Outcome::Handled
            }
            request::CLEAR_FEATURE if setup.value == feature::ENDPOINT_HALT => {
                let status = match dir {
                    Direction::In => EndpointStatus::Nak,
                    Direction::Out => EndpointStatus::Valid,
                };
                self.hw.reset_data_toggle(ep.address, dir);
                self.hw.set_status(ep.address, dir, status);
                if let Some(m) = self.modules.get_mut(ep.module) {
                    let mut io = EndpointIo::new(&mut self.hw, &ep);
                    m.on_clear_feature(ep.slot, &mut io);
                }
                debug!("USB: clear halt {:02x}", ep_addr);
                Outcome::Handled
            }
            _ => Outcome::Unsupported,
        }
    }
}

/// How the slots sharing one address map onto the register's two halves.
/// A double-buffered endpoint uses both buffer descriptors for its own
/// direction.
fn register_layout(
    address: u8,
    slots: (Option<&EndpointAlloc>, Option<&EndpointAlloc>),
) -> Option<HwEndpoint> {
    let desc = |offset: usize, ep: &EndpointAlloc| BufferDesc {
        offset,
        size: ep.buffer_size,
    };
    let first = |ep: &EndpointAlloc| desc(ep.pma_offset, ep);
    let second = |ep: &EndpointAlloc| ep.second_buffer_offset().map(|o| desc(o, ep));

    let (out, inp) = slots;
    let any = out.or(inp)?;
    let (tx, rx) = match (out, inp) {
        (Some(o), None) if o.spec.double_buffered => (second(o), Some(first(o))),
        (None, Some(i)) if i.spec.double_buffered => (Some(first(i)), second(i)),
        _ => (inp.map(first), out.map(first)),
    };
    Some(HwEndpoint {
        address,
        transfer_type: any.spec.transfer_type,
        double_buffered: any.spec.double_buffered.then_some(any.spec.direction),
        tx,
        rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::endpoint::EndpointSpec;

    fn placed(spec: EndpointSpec, pma_offset: usize) -> EndpointAlloc {
        EndpointAlloc {
            spec,
            module: 0,
            slot: 0,
            address: 3,
            pma_offset,
            buffer_size: spec.buffer_size(),
        }
    }

    #[test]
    fn shared_register_gets_one_buffer_per_half() {
        let out = placed(EndpointSpec::bulk_out(64), 192);
        let inp = placed(EndpointSpec::bulk_in(64), 256);
        let hw = register_layout(3, (Some(&out), Some(&inp))).unwrap();
        assert_eq!(hw.transfer_type, TransferType::Bulk);
        assert_eq!(hw.tx, Some(BufferDesc { offset: 256, size: 64 }));
        assert_eq!(hw.rx, Some(BufferDesc { offset: 192, size: 64 }));
    }

    #[test]
    fn double_buffered_endpoint_uses_both_descriptors() {
        let inp = placed(EndpointSpec::bulk_in(64).double_buffered(), 192);
        let hw = register_layout(3, (None, Some(&inp))).unwrap();
        assert_eq!(hw.double_buffered, Some(Direction::In));
        assert_eq!(hw.tx, Some(BufferDesc { offset: 192, size: 64 }));
        assert_eq!(hw.rx, Some(BufferDesc { offset: 256, size: 64 }));
    }

    #[test]
    fn double_buffered_out_receives_into_both_descriptors() {
        let out = placed(EndpointSpec::bulk_out(64).double_buffered(), 192);
        let hw = register_layout(3, (Some(&out), None)).unwrap();
        assert_eq!(hw.double_buffered, Some(Direction::Out));
        assert_eq!(hw.rx, Some(BufferDesc { offset: 192, size: 64 }));
        assert_eq!(hw.tx, Some(BufferDesc { offset: 256, size: 64 }));
    }

    #[test]
    fn empty_register_is_skipped() {
        assert_eq!(register_layout(4, (None, None)), None);
    }
}
