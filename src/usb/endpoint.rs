//! Endpoint requirements and packet-memory sizing.
//!
//! A module declares one [`EndpointSpec`] per endpoint it uses. The
//! allocator turns each spec into an [`EndpointAlloc`] carrying the
//! hardware address and packet-memory range it was given.

/// Transfer direction, seen from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Host-to-device.
    Out,
    /// Device-to-host.
    In,
}

impl Direction {
    /// Direction bit of an endpoint address byte.
    pub const fn address_bit(self) -> u8 {
        match self {
            Direction::Out => 0x00,
            Direction::In => 0x80,
        }
    }

    pub const fn of_address(addr: u8) -> Self {
        if addr & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }
}

/// Endpoint transfer type (bmAttributes bits 1:0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Constraint on the parity of the hardware endpoint address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressParity {
    #[default]
    Any,
    Even,
    Odd,
}

impl AddressParity {
    pub const fn accepts(self, address: u8) -> bool {
        match self {
            AddressParity::Any => true,
            AddressParity::Even => address % 2 == 0,
            AddressParity::Odd => address % 2 == 1,
        }
    }
}

/// Requirements of one endpoint, declared by a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointSpec {
    pub direction: Direction,
    pub transfer_type: TransferType,
    /// Requested buffer size; also the wMaxPacketSize of the endpoint.
    pub size: u16,
    /// Never share a hardware address with any other slot.
    pub exclusive: bool,
    pub double_buffered: bool,
    pub parity: AddressParity,
    /// Lowest hardware address the scan may start from.
    pub min_address: u8,
    /// bInterval for interrupt/isochronous endpoints.
    pub interval: u8,
}

impl EndpointSpec {
    pub const fn new(direction: Direction, transfer_type: TransferType, size: u16) -> Self {
        Self {
            direction,
            transfer_type,
            size,
            exclusive: false,
            double_buffered: false,
            parity: AddressParity::Any,
            min_address: 1,
            interval: 0,
        }
    }

    pub const fn bulk_in(size: u16) -> Self {
        Self::new(Direction::In, TransferType::Bulk, size)
    }

    pub const fn bulk_out(size: u16) -> Self {
        Self::new(Direction::Out, TransferType::Bulk, size)
    }

    pub const fn interrupt_in(size: u16, interval: u8) -> Self {
        Self::new(Direction::In, TransferType::Interrupt, size).with_interval(interval)
    }

    pub const fn interrupt_out(size: u16, interval: u8) -> Self {
        Self::new(Direction::Out, TransferType::Interrupt, size).with_interval(interval)
    }

    pub const fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub const fn double_buffered(mut self) -> Self {
        self.double_buffered = true;
        self
    }

    pub const fn with_parity(mut self, parity: AddressParity) -> Self {
        self.parity = parity;
        self
    }

    pub const fn with_min_address(mut self, min_address: u8) -> Self {
        self.min_address = min_address;
        self
    }

    pub const fn with_interval(mut self, interval: u8) -> Self {
        self.interval = interval;
        self
    }

    /// Whether `self` may live in the same endpoint register as `other`.
    ///
    /// One register has one IN half and one OUT half with a single type
    /// and kind field. A double-buffered endpoint occupies both halves, so
    /// two double-buffered slots never share even when type and kind
    /// match.
    pub fn can_share_with(&self, other: &EndpointSpec) -> bool {
        self.direction != other.direction
            && !self.exclusive
            && !other.exclusive
            && self.transfer_type == other.transfer_type
            && self.double_buffered == other.double_buffered
            && !self.double_buffered
    }

    /// Bytes of packet memory one buffer of this endpoint occupies.
    pub fn buffer_size(&self) -> usize {
        pma_round(self.size as usize, self.direction, self.double_buffered)
    }

    /// Total packet memory, both halves for double-buffered endpoints.
    pub fn pma_footprint(&self) -> usize {
        if self.double_buffered {
            self.buffer_size() * 2
        } else {
            self.buffer_size()
        }
    }
}

/// Small IN buffers round to a 2-byte granule; large buffers, OUT buffers
/// and double-buffered ones round to 32 bytes. OUT buffers follow the
/// COUNT_RX block encoding, which only has 2- and 32-byte blocks.
pub fn pma_round(size: usize, direction: Direction, double_buffered: bool) -> usize {
    let granule = if direction == Direction::In && !double_buffered && size <= 62 {
        2
    } else {
        32
    };
    let size = size.max(1);
    size.div_ceil(granule) * granule
}

/// A placed endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointAlloc {
    pub spec: EndpointSpec,
    /// Index of the owning module in registration order.
    pub module: usize,
    /// Index of the slot within its module.
    pub slot: usize,
    /// Hardware endpoint address (1..NUM_ENDPOINTS), without direction bit.
    pub address: u8,
    /// PMA byte offset of the (first) buffer.
    pub pma_offset: usize,
    /// Rounded size of one buffer.
    pub buffer_size: usize,
}

impl EndpointAlloc {
    /// bEndpointAddress, direction bit included.
    pub fn endpoint_address(&self) -> u8 {
        self.address | self.spec.direction.address_bit()
    }

    /// PMA offset of the second buffer of a double-buffered endpoint.
    pub fn second_buffer_offset(&self) -> Option<usize> {
        self.spec
            .double_buffered
            .then_some(self.pma_offset + self.buffer_size)
    }
}
