//! Application-wide constants and compile-time configuration.
//!
//! Peripheral geometry, engine capacities, timing parameters and the
//! device identity live here so they can be tuned in one place.

// Peripheral geometry

/// Number of hardware endpoint registers (EP0..EP7).
pub const NUM_ENDPOINTS: usize = 8;

/// Size of the packet memory area in bytes.
pub const PMA_SIZE: usize = 1024;

/// Bytes per buffer-descriptor table entry (ADDR_TX, COUNT_TX, ADDR_RX, COUNT_RX).
pub const BTABLE_ENTRY_SIZE: usize = 8;

/// The buffer-descriptor table sits at the start of packet memory.
pub const BTABLE_SIZE: usize = NUM_ENDPOINTS * BTABLE_ENTRY_SIZE;

/// Max packet size of the control endpoint.
pub const EP0_MAX_PACKET: usize = 64;

/// PMA offset of the EP0 transmit buffer.
pub const EP0_TX_OFFSET: usize = BTABLE_SIZE;

/// PMA offset of the EP0 receive buffer.
pub const EP0_RX_OFFSET: usize = EP0_TX_OFFSET + EP0_MAX_PACKET;

/// First PMA byte handed to the allocator.
pub const PMA_ALLOC_START: usize = EP0_RX_OFFSET + EP0_MAX_PACKET;

/// Largest packet the peripheral can move on a full-speed endpoint.
pub const MAX_PACKET_SIZE: usize = 1023;

// Engine capacities

/// Maximum number of registered device-class modules.
pub const MAX_MODULES: usize = 8;

/// Maximum number of endpoint slots across all modules.
pub const MAX_ENDPOINT_SLOTS: usize = 16;

/// Maximum number of interfaces across all modules.
pub const MAX_INTERFACES: usize = 16;

/// Staging buffer for the composed module descriptors (header excluded).
pub const CONFIG_DESCRIPTOR_CAPACITY: usize = 512;

/// Engine-owned buffer for copied control responses and data-out stages.
pub const CONTROL_BUFFER_SIZE: usize = 256;

// Suspend / resume

/// ESOF events to wait before driving resume after a remote-wakeup request.
pub const RESUME_WAIT_FRAMES: u8 = 2;

/// ESOF events the resume signal stays asserted (1..15 ms per USB 2.0).
pub const RESUME_ASSERT_FRAMES: u8 = 10;

// USB identity

/// USB VID/PID - use the "pid.codes" open-source test VID.
/// Replace with your own allocated VID/PID for production.
pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0x0002;

/// Device release number (BCD).
pub const USB_DEVICE_RELEASE: u16 = 0x0100;

/// USB device strings.
pub const USB_MANUFACTURER: &str = "usbcomp";
pub const USB_PRODUCT: &str = "Composite Device";
pub const USB_SERIAL_NUMBER: &str = "000001";

/// String descriptor language (US English).
pub const USB_LANGID: u16 = 0x0409;

/// Bus power budget (mA).
pub const USB_MAX_POWER_MA: u16 = 100;

// Class modules

/// CDC serial ring capacities (bytes). heapless queues hold N-1 items.
pub const SERIAL_TX_RING: usize = 256;
pub const SERIAL_RX_RING: usize = 256;

/// CDC bulk packet size.
pub const SERIAL_PACKET_SIZE: u16 = 64;

/// HID polling interval (ms).
pub const USB_HID_POLL_MS: u8 = 1;

/// Pending keyboard reports between mainline and the interrupt.
pub const HID_REPORT_QUEUE: usize = 8;
