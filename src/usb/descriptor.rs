//! Standard USB descriptors (USB 2.0 chapter 9) and template patching.
//!
//! Layouts:
//! ```text
//! Device (18)     : bLength bDescriptorType bcdUSB(2) bDeviceClass bDeviceSubClass
//!                   bDeviceProtocol bMaxPacketSize0 idVendor(2) idProduct(2)
//!                   bcdDevice(2) iManufacturer iProduct iSerialNumber bNumConfigurations
//! Configuration(9): bLength bDescriptorType wTotalLength(2) bNumInterfaces
//!                   bConfigurationValue iConfiguration bmAttributes bMaxPower
//! Interface (9)   : bLength bDescriptorType bInterfaceNumber bAlternateSetting
//!                   bNumEndpoints bInterfaceClass bInterfaceSubClass
//!                   bInterfaceProtocol iInterface
//! Endpoint (7)    : bLength bDescriptorType bEndpointAddress bmAttributes
//!                   wMaxPacketSize(2) bInterval
//! ```

use crate::config;

/// Descriptor type codes.
pub mod desc_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
}

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIG_HEADER_LEN: usize = 9;

/// String descriptor indices served by the engine.
pub mod string_index {
    pub const LANGUAGE: u8 = 0;
    pub const MANUFACTURER: u8 = 1;
    pub const PRODUCT: u8 = 2;
    pub const SERIAL_NUMBER: u8 = 3;
}

/// Device identity and power attributes.
#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub serial_number: &'static str,
    pub max_power_ma: u16,
    pub self_powered: bool,
    pub remote_wakeup: bool,
}

impl DeviceConfig {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            device_release: config::USB_DEVICE_RELEASE,
            manufacturer: config::USB_MANUFACTURER,
            product: config::USB_PRODUCT,
            serial_number: config::USB_SERIAL_NUMBER,
            max_power_ma: config::USB_MAX_POWER_MA,
            self_powered: false,
            remote_wakeup: false,
        }
    }

    /// Device descriptor. Composite devices made of IAD-grouped functions
    /// use the Miscellaneous class / Common subclass / IAD protocol triple.
    pub fn device_descriptor(&self) -> [u8; DEVICE_DESCRIPTOR_LEN] {
        let [vid_lo, vid_hi] = self.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = self.product_id.to_le_bytes();
        let [rel_lo, rel_hi] = self.device_release.to_le_bytes();
        [
            DEVICE_DESCRIPTOR_LEN as u8,
            desc_type::DEVICE,
            0x00,
            0x02, // bcdUSB 2.00
            0xEF, // Miscellaneous
            0x02, // Common Class
            0x01, // Interface Association Descriptor
            config::EP0_MAX_PACKET as u8,
            vid_lo,
            vid_hi,
            pid_lo,
            pid_hi,
            rel_lo,
            rel_hi,
            string_index::MANUFACTURER,
            string_index::PRODUCT,
            string_index::SERIAL_NUMBER,
            1,
        ]
    }

    /// bmAttributes of the configuration descriptor.
    pub fn attributes(&self) -> u8 {
        0x80 | (u8::from(self.self_powered) << 6) | (u8::from(self.remote_wakeup) << 5)
    }

    /// bMaxPower in 2 mA units.
    pub fn max_power(&self) -> u8 {
        (self.max_power_ma / 2).min(u8::MAX as u16) as u8
    }

    pub fn string(&self, index: u8) -> Option<&'static str> {
        match index {
            string_index::MANUFACTURER => Some(self.manufacturer),
            string_index::PRODUCT => Some(self.product),
            string_index::SERIAL_NUMBER => Some(self.serial_number),
            _ => None,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(config::USB_VID, config::USB_PID)
    }
}

/// Configuration descriptor header (wTotalLength covers header + body).
pub fn config_header(
    total_length: u16,
    num_interfaces: u8,
    device: &DeviceConfig,
) -> [u8; CONFIG_HEADER_LEN] {
    let [len_lo, len_hi] = total_length.to_le_bytes();
    [
        CONFIG_HEADER_LEN as u8,
        desc_type::CONFIGURATION,
        len_lo,
        len_hi,
        num_interfaces,
        1, // bConfigurationValue
        0, // iConfiguration
        device.attributes(),
        device.max_power(),
    ]
}

/// Language ID table (string index 0).
pub fn language_table(out: &mut [u8]) -> usize {
    if out.len() < 4 {
        return 0;
    }
    let [lo, hi] = config::USB_LANGID.to_le_bytes();
    out[..4].copy_from_slice(&[4, desc_type::STRING, lo, hi]);
    4
}

/// Encode `s` as a UTF-16LE string descriptor. Truncates to `out` (and to
/// the 255-byte bLength limit) on a code-unit boundary.
pub fn string_descriptor(s: &str, out: &mut [u8]) -> usize {
    let cap = out.len().min(u8::MAX as usize);
    if cap < 2 {
        return 0;
    }
    let mut len = 2;
    for unit in s.encode_utf16() {
        if len + 2 > cap {
            break;
        }
        out[len..len + 2].copy_from_slice(&unit.to_le_bytes());
        len += 2;
    }
    out[0] = len as u8;
    out[1] = desc_type::STRING;
    len
}

/// A field of a descriptor template that is relative to the module's own
/// numbering. The assigned value is added to whatever the template holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Patch {
    /// Byte at `offset` is an interface number relative to the module's
    /// first interface.
    Interface(usize),
    /// Byte at `offset` is an endpoint address relative to slot `slot`'s
    /// assigned hardware address (direction bit usually pre-set).
    Endpoint { offset: usize, slot: usize },
}

impl Patch {
    pub const fn offset(&self) -> usize {
        match *self {
            Patch::Interface(offset) => offset,
            Patch::Endpoint { offset, .. } => offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_layout() {
        let d = DeviceConfig::new(0x1209, 0x0002).device_descriptor();
        assert_eq!(d[0], 18);
        assert_eq!(d[1], desc_type::DEVICE);
        assert_eq!(&d[2..4], &[0x00, 0x02]);
        assert_eq!(d[7], 64);
        assert_eq!(&d[8..12], &[0x09, 0x12, 0x02, 0x00]);
        assert_eq!(d[17], 1);
    }

    #[test]
    fn header_reflects_power_attributes() {
        let mut dev = DeviceConfig::default();
        dev.self_powered = true;
        dev.remote_wakeup = true;
        dev.max_power_ma = 500;
        let h = config_header(300, 3, &dev);
        assert_eq!(h, [9, 2, 0x2C, 0x01, 3, 1, 0, 0xE0, 250]);
    }

    #[test]
    fn string_descriptor_is_utf16le() {
        let mut buf = [0u8; 16];
        let n = string_descriptor("Ab", &mut buf);
        assert_eq!(&buf[..n], &[6, 3, b'A', 0, b'b', 0]);
    }

    #[test]
    fn string_descriptor_truncates_to_buffer() {
        let mut buf = [0u8; 7];
        let n = string_descriptor("abcdef", &mut buf);
        assert_eq!(n, 6);
        assert_eq!(buf[0], 6);
    }

    #[test]
    fn language_table_is_us_english() {
        let mut buf = [0u8; 4];
        assert_eq!(language_table(&mut buf), 4);
        assert_eq!(buf, [4, 3, 0x09, 0x04]);
    }
}
