//! 8-byte SETUP packet.

use crate::usb::endpoint::Direction;

/// bmRequestType bits 6:5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// bmRequestType bits 4:0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Standard request codes (bRequest).
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
}

/// Standard feature selectors.
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
}

/// A decoded SETUP packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn parse(raw: &[u8; Self::LEN]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let [v0, v1] = self.value.to_le_bytes();
        let [i0, i1] = self.index.to_le_bytes();
        let [l0, l1] = self.length.to_le_bytes();
        [self.request_type, self.request, v0, v1, i0, i1, l0, l1]
    }

    /// Data stage direction; `None` for requests without a data stage.
    pub fn data_direction(&self) -> Option<Direction> {
        if self.length == 0 {
            None
        } else {
            Some(self.direction())
        }
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }

    /// Low byte of wValue (descriptor index, alternate setting, ...).
    pub fn value_lo(&self) -> u8 {
        self.value as u8
    }

    /// High byte of wValue (descriptor type, ...).
    pub fn value_hi(&self) -> u8 {
        (self.value >> 8) as u8
    }

    pub fn interface(&self) -> u8 {
        self.index as u8
    }

    /// bEndpointAddress carried in wIndex for endpoint-recipient requests.
    pub fn endpoint(&self) -> u8 {
        self.index as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_descriptor_configuration() {
        let p = SetupPacket::parse(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xFF, 0x00]);
        assert_eq!(p.request, request::GET_DESCRIPTOR);
        assert_eq!(p.value_hi(), 0x02);
        assert_eq!(p.value_lo(), 0x00);
        assert_eq!(p.length, 255);
        assert_eq!(p.kind(), RequestType::Standard);
        assert_eq!(p.recipient(), Recipient::Device);
        assert_eq!(p.data_direction(), Some(Direction::In));
    }

    #[test]
    fn class_interface_out() {
        // CDC SET_LINE_CODING to interface 2
        let p = SetupPacket::parse(&[0x21, 0x20, 0x00, 0x00, 0x02, 0x00, 0x07, 0x00]);
        assert_eq!(p.kind(), RequestType::Class);
        assert_eq!(p.recipient(), Recipient::Interface);
        assert_eq!(p.interface(), 2);
        assert_eq!(p.data_direction(), Some(Direction::Out));
    }

    #[test]
    fn no_data_request_has_no_data_direction() {
        let p = SetupPacket::parse(&[0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(p.data_direction(), None);
        assert_eq!(p.value, 7);
    }

    #[test]
    fn bytes_roundtrip() {
        let raw = [0xC1, 0x42, 0x34, 0x12, 0x78, 0x56, 0x10, 0x00];
        assert_eq!(SetupPacket::parse(&raw).to_bytes(), raw);
        assert_eq!(SetupPacket::parse(&raw).kind(), RequestType::Vendor);
    }
}
