//! Unified error type for usbcomp.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` (behind the `defmt` feature) for efficient
//! on-target logging.

/// Top-level error type returned by the mainline API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Building the composite device failed; the device never attached.
    Alloc(AllocError),

    /// More modules registered than `MAX_MODULES`.
    TooManyModules,

    /// Modules cannot be registered while the device is enabled.
    Busy,

    /// The operation needs an enabled device.
    NotEnabled,

    /// Remote wakeup requested while the bus is not suspended, or the host
    /// has not enabled the feature.
    WakeupNotAllowed,
}

/// Build-time allocation failures. Each one is fatal to `enable()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AllocError {
    /// No hardware endpoint address satisfies the slot's sharing rules.
    NoEndpointAddress { module: usize, slot: usize },

    /// Packet memory would overflow.
    PacketMemoryExhausted { needed: usize, available: usize },

    /// More endpoint slots than the allocation table holds.
    TooManyEndpoints,

    /// More modules than the allocation table holds.
    TooManyModules,

    /// More interfaces than the device supports.
    TooManyInterfaces,

    /// Rendered descriptors do not fit the staging buffer.
    DescriptorOverflow { needed: usize, capacity: usize },

    /// Endpoint requirement that the peripheral cannot express.
    InvalidEndpoint { module: usize, slot: usize },
}

// Convenience conversions

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        Error::Alloc(e)
    }
}
