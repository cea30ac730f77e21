//! Endpoint address and packet-memory allocator.
//!
//! Runs once per `enable()`. Modules are visited in registration order and
//! their endpoint slots in declared order; each slot takes the first
//! hardware address (from its watermark upwards) whose current occupants
//! it may share a register with. Packet memory is bump-allocated behind
//! the buffer-descriptor table and the EP0 buffers. Interface numbers are
//! handed out by a plain running counter.

use heapless::Vec;

use crate::config::{
    MAX_ENDPOINT_SLOTS, MAX_INTERFACES, MAX_MODULES, MAX_PACKET_SIZE, NUM_ENDPOINTS,
    PMA_ALLOC_START, PMA_SIZE,
};
use crate::error::AllocError;
use crate::usb::endpoint::{Direction, EndpointAlloc, EndpointSpec, TransferType};

/// What one module asks of the allocator.
#[derive(Clone, Copy, Debug)]
pub struct ModuleRequirements<'a> {
    pub interfaces: u8,
    pub endpoints: &'a [EndpointSpec],
}

/// Interface and endpoint ranges granted to one module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModuleAlloc {
    pub first_interface: u8,
    pub interface_count: u8,
    /// Index of the module's first slot in the endpoint table.
    pub first_slot: usize,
    pub slot_count: usize,
}

impl ModuleAlloc {
    pub fn owns_interface(&self, interface: u8) -> bool {
        interface >= self.first_interface
            && interface - self.first_interface < self.interface_count
    }
}

/// Entry of the endpoint-event dispatch table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Route {
    pub module: usize,
    pub slot: usize,
    /// Index into [`Allocation::endpoints`].
    pub index: usize,
}

/// Result of a successful allocation. Read-only until the next rebuild.
#[derive(Clone, Debug)]
pub struct Allocation {
    modules: Vec<ModuleAlloc, MAX_MODULES>,
    endpoints: Vec<EndpointAlloc, MAX_ENDPOINT_SLOTS>,
    interface_count: u8,
    highest_address: u8,
    pma_end: usize,
    routes: [[Option<Route>; 2]; NUM_ENDPOINTS],
}

impl Allocation {
    pub fn modules(&self) -> &[ModuleAlloc] {
        &self.modules
    }

    pub fn endpoints(&self) -> &[EndpointAlloc] {
        &self.endpoints
    }

    /// Slots of one module, in declared order.
    pub fn module_endpoints(&self, module: usize) -> &[EndpointAlloc] {
        match self.modules.get(module) {
            Some(m) => &self.endpoints[m.first_slot..m.first_slot + m.slot_count],
            None => &[],
        }
    }

    pub fn interface_count(&self) -> u8 {
        self.interface_count
    }

    /// Highest hardware endpoint address in use; 0 when only EP0 exists.
    pub fn highest_address(&self) -> u8 {
        self.highest_address
    }

    /// First PMA byte not handed out.
    pub fn pma_end(&self) -> usize {
        self.pma_end
    }

    /// Owning module and module-relative interface number.
    pub fn interface_owner(&self, interface: u8) -> Option<(usize, u8)> {
        self.modules
            .iter()
            .position(|m| m.owns_interface(interface))
            .map(|i| (i, interface - self.modules[i].first_interface))
    }

    /// Dispatch table lookup for a transfer-complete event.
    pub fn route(&self, address: u8, direction: Direction) -> Option<Route> {
        if address > self.highest_address {
            return None;
        }
        self.routes
            .get(address as usize)
            .and_then(|r| r[direction.index()])
    }

    /// Lookup by bEndpointAddress (direction bit included).
    pub fn endpoint_by_address(&self, ep_addr: u8) -> Option<&EndpointAlloc> {
        self.route(ep_addr & 0x0F, Direction::of_address(ep_addr))
            .map(|r| &self.endpoints[r.index])
    }

    /// The (at most two) slots living in one endpoint register.
    pub fn register_slots(&self, address: u8) -> (Option<&EndpointAlloc>, Option<&EndpointAlloc>) {
        let out = self
            .route(address, Direction::Out)
            .map(|r| &self.endpoints[r.index]);
        let inp = self
            .route(address, Direction::In)
            .map(|r| &self.endpoints[r.index]);
        (out, inp)
    }
}

/// Allocation parameters. `Allocator::default()` matches the peripheral.
#[derive(Clone, Copy, Debug)]
pub struct Allocator {
    address_count: usize,
    pma_start: usize,
    pma_size: usize,
}

impl Default for Allocator {
    fn default() -> Self {
        Self {
            address_count: NUM_ENDPOINTS,
            pma_start: PMA_ALLOC_START,
            pma_size: PMA_SIZE,
        }
    }
}

impl Allocator {
    /// Limit the usable hardware addresses to `0..count` (EP0 included).
    pub fn with_address_count(mut self, count: usize) -> Self {
        self.address_count = count.min(NUM_ENDPOINTS);
        self
    }

    /// Limit packet memory to `[start, size)`.
    pub fn with_pma(mut self, start: usize, size: usize) -> Self {
        self.pma_start = start;
        self.pma_size = size;
        self
    }

    pub fn allocate<'a, I>(&self, modules: I) -> Result<Allocation, AllocError>
    where
        I: IntoIterator<Item = ModuleRequirements<'a>>,
    {
        let mut alloc = Allocation {
            modules: Vec::new(),
            endpoints: Vec::new(),
            interface_count: 0,
            highest_address: 0,
            pma_end: self.pma_start,
            routes: [[None; 2]; NUM_ENDPOINTS],
        };

        for (module, req) in modules.into_iter().enumerate() {
            let interfaces = alloc.interface_count as usize + req.interfaces as usize;
            if interfaces > MAX_INTERFACES {
                return Err(AllocError::TooManyInterfaces);
            }

            let first_slot = alloc.endpoints.len();
            for (slot, spec) in req.endpoints.iter().enumerate() {
                self.place(&mut alloc, module, slot, spec)?;
            }

            alloc
                .modules
                .push(ModuleAlloc {
                    first_interface: alloc.interface_count,
                    interface_count: req.interfaces,
                    first_slot,
                    slot_count: req.endpoints.len(),
                })
                .map_err(|_| AllocError::TooManyModules)?;
            alloc.interface_count = interfaces as u8;
        }

        debug!(
            "allocated {} endpoints on {} addresses, PMA {}/{}",
            alloc.endpoints.len(),
            alloc.highest_address,
            alloc.pma_end,
            self.pma_size
        );
        Ok(alloc)
    }

    fn place(
        &self,
        alloc: &mut Allocation,
        module: usize,
        slot: usize,
        spec: &EndpointSpec,
    ) -> Result<(), AllocError> {
        if spec.transfer_type == TransferType::Control || spec.size as usize > MAX_PACKET_SIZE {
            return Err(AllocError::InvalidEndpoint { module, slot });
        }

        let start = spec.min_address.max(1) as usize;
        let address = (start..self.address_count)
            .map(|a| a as u8)
            .find(|&a| {
                spec.parity.accepts(a)
                    && alloc
                        .endpoints
                        .iter()
                        .filter(|e| e.address == a)
                        .all(|e| spec.can_share_with(&e.spec))
            })
            .ok_or(AllocError::NoEndpointAddress { module, slot })?;

        let footprint = spec.pma_footprint();
        if alloc.pma_end + footprint > self.pma_size {
            return Err(AllocError::PacketMemoryExhausted {
                needed: alloc.pma_end + footprint - self.pma_start,
                available: self.pma_size.saturating_sub(self.pma_start),
            });
        }

        let index = alloc.endpoints.len();
        let placed = EndpointAlloc {
            spec: *spec,
            module,
            slot,
            address,
            pma_offset: alloc.pma_end,
            buffer_size: spec.buffer_size(),
        };
        alloc
            .endpoints
            .push(placed)
            .map_err(|_| AllocError::TooManyEndpoints)?;
        alloc.routes[address as usize][spec.direction.index()] = Some(Route {
            module,
            slot,
            index,
        });
        alloc.pma_end += footprint;
        alloc.highest_address = alloc.highest_address.max(address);

        debug!(
            "module {} slot {} -> EP{} @PMA {}",
            module, slot, address, placed.pma_offset
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::endpoint::AddressParity;

    fn req(interfaces: u8, endpoints: &[EndpointSpec]) -> ModuleRequirements<'_> {
        ModuleRequirements {
            interfaces,
            endpoints,
        }
    }

    #[test]
    fn two_exclusive_bulk_pairs_get_four_distinct_addresses() {
        let eps = [
            EndpointSpec::bulk_out(64).exclusive(),
            EndpointSpec::bulk_in(64).exclusive(),
        ];
        let alloc = Allocator::default()
            .with_address_count(5)
            .allocate([req(1, &eps), req(1, &eps)])
            .unwrap();

        let addrs: std::vec::Vec<u8> = alloc.endpoints().iter().map(|e| e.address).collect();
        assert_eq!(addrs, [1, 2, 3, 4]);
        assert_eq!(alloc.highest_address(), 4);
    }

    #[test]
    fn exclusive_pairs_fail_when_addresses_run_out() {
        let eps = [
            EndpointSpec::bulk_out(64).exclusive(),
            EndpointSpec::bulk_in(64).exclusive(),
        ];
        let err = Allocator::default()
            .with_address_count(4)
            .allocate([req(1, &eps), req(1, &eps)])
            .unwrap_err();
        assert_eq!(err, AllocError::NoEndpointAddress { module: 1, slot: 1 });
    }

    #[test]
    fn shareable_in_out_pair_uses_one_register() {
        let eps = [EndpointSpec::bulk_out(64), EndpointSpec::bulk_in(64)];
        let alloc = Allocator::default().allocate([req(1, &eps)]).unwrap();
        assert_eq!(alloc.endpoints()[0].address, 1);
        assert_eq!(alloc.endpoints()[1].address, 1);
        let (out, inp) = alloc.register_slots(1);
        assert_eq!(out.unwrap().slot, 0);
        assert_eq!(inp.unwrap().slot, 1);
    }

    #[test]
    fn mismatched_types_do_not_share() {
        let eps = [EndpointSpec::interrupt_in(8, 10), EndpointSpec::bulk_out(64)];
        let alloc = Allocator::default().allocate([req(1, &eps)]).unwrap();
        assert_eq!(alloc.endpoints()[0].address, 1);
        assert_eq!(alloc.endpoints()[1].address, 2);
    }

    #[test]
    fn double_buffered_pair_takes_two_registers() {
        let eps = [
            EndpointSpec::bulk_out(64).double_buffered(),
            EndpointSpec::bulk_in(64).double_buffered(),
        ];
        let alloc = Allocator::default().allocate([req(1, &eps)]).unwrap();
        assert_eq!(alloc.endpoints()[0].address, 1);
        assert_eq!(alloc.endpoints()[1].address, 2);
        assert_eq!(alloc.register_slots(1).1, None);
        assert_eq!(alloc.register_slots(2).0, None);
    }

    #[test]
    fn watermark_and_parity_are_respected() {
        let eps = [
            EndpointSpec::bulk_in(64).with_min_address(3),
            EndpointSpec::bulk_out(64).with_parity(AddressParity::Even),
        ];
        let alloc = Allocator::default().allocate([req(1, &eps)]).unwrap();
        assert_eq!(alloc.endpoints()[0].address, 3);
        assert_eq!(alloc.endpoints()[1].address, 2);
    }

    #[test]
    fn packet_memory_is_bump_allocated_in_order() {
        let eps = [
            EndpointSpec::interrupt_in(8, 1),
            EndpointSpec::bulk_out(64),
            EndpointSpec::bulk_in(64).double_buffered(),
        ];
        let alloc = Allocator::default().allocate([req(1, &eps)]).unwrap();
        let e = alloc.endpoints();
        assert_eq!(e[0].pma_offset, PMA_ALLOC_START);
        assert_eq!(e[1].pma_offset, PMA_ALLOC_START + 8);
        assert_eq!(e[2].pma_offset, PMA_ALLOC_START + 8 + 64);
        assert_eq!(e[2].second_buffer_offset(), Some(PMA_ALLOC_START + 8 + 64 + 64));
        assert_eq!(alloc.pma_end(), PMA_ALLOC_START + 8 + 64 + 128);
    }

    #[test]
    fn exceeding_packet_memory_fails() {
        let eps = [EndpointSpec::bulk_out(512), EndpointSpec::bulk_in(512)];
        let err = Allocator::default().allocate([req(1, &eps)]).unwrap_err();
        assert!(matches!(err, AllocError::PacketMemoryExhausted { .. }));
    }

    #[test]
    fn interface_numbers_follow_module_order() {
        let a = [EndpointSpec::interrupt_in(8, 1)];
        let b = [EndpointSpec::bulk_out(64), EndpointSpec::bulk_in(64)];
        let alloc = Allocator::default()
            .allocate([req(2, &a), req(1, &b), req(0, &[])])
            .unwrap();
        let m = alloc.modules();
        assert_eq!((m[0].first_interface, m[1].first_interface), (0, 2));
        assert_eq!(m[2].first_interface, 3);
        assert_eq!(alloc.interface_count(), 3);
        assert_eq!(alloc.interface_owner(1), Some((0, 1)));
        assert_eq!(alloc.interface_owner(2), Some((1, 0)));
        assert_eq!(alloc.interface_owner(3), None);
    }

    #[test]
    fn routes_cover_both_directions() {
        let eps = [EndpointSpec::bulk_out(64), EndpointSpec::bulk_in(64)];
        let alloc = Allocator::default().allocate([req(1, &eps)]).unwrap();
        let r = alloc.route(1, Direction::In).unwrap();
        assert_eq!((r.module, r.slot), (0, 1));
        assert!(alloc.route(2, Direction::In).is_none());
        assert_eq!(alloc.endpoint_by_address(0x81).unwrap().slot, 1);
        assert_eq!(alloc.module_endpoints(0).len(), 2);
    }

    #[test]
    fn control_endpoints_are_rejected() {
        let eps = [EndpointSpec::new(Direction::In, TransferType::Control, 64)];
        let err = Allocator::default().allocate([req(1, &eps)]).unwrap_err();
        assert_eq!(err, AllocError::InvalidEndpoint { module: 0, slot: 0 });
    }

    /// Every valid layout that fits yields pairwise distinct
    /// (address, direction) pairs, with shared addresses only between
    /// compatible slots.
    #[test]
    fn allocations_never_double_book_a_register_half() {
        let catalogue = [
            EndpointSpec::bulk_in(64),
            EndpointSpec::bulk_out(64),
            EndpointSpec::interrupt_in(8, 1),
            EndpointSpec::interrupt_out(16, 1),
            EndpointSpec::bulk_in(32).exclusive(),
            EndpointSpec::bulk_out(32).double_buffered(),
        ];
        for seed in 0u32..200 {
            let mut eps: std::vec::Vec<EndpointSpec> = std::vec::Vec::new();
            let mut x = seed.wrapping_mul(2_654_435_761);
            for _ in 0..(seed % 7) {
                eps.push(catalogue[(x % catalogue.len() as u32) as usize]);
                x = x.rotate_left(5) ^ 0x9E37_79B9;
            }
            let Ok(alloc) = Allocator::default().allocate([req(1, &eps)]) else {
                continue;
            };
            let placed = alloc.endpoints();
            for (i, a) in placed.iter().enumerate() {
                for b in &placed[i + 1..] {
                    if a.address == b.address {
                        assert!(a.spec.can_share_with(&b.spec), "seed {seed}");
                    }
                }
            }
            assert!(alloc.pma_end() <= PMA_SIZE);
        }
    }
}
