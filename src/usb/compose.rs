//! Configuration descriptor composer.
//!
//! Each module renders its template into consecutive positions of one
//! staging buffer; the 9-byte configuration header is finalised once all
//! module bytes are known. The result is served as two chunks (header,
//! body) and never changes until the device is rebuilt.

use crate::config::CONFIG_DESCRIPTOR_CAPACITY;
use crate::error::AllocError;
use crate::usb::alloc::Allocation;
use crate::usb::class::{RenderContext, UsbClass};
use crate::usb::descriptor::{config_header, DeviceConfig, CONFIG_HEADER_LEN};

/// The composed configuration descriptor.
pub struct ConfigDescriptor {
    header: [u8; CONFIG_HEADER_LEN],
    body: [u8; CONFIG_DESCRIPTOR_CAPACITY],
    body_len: usize,
}

impl ConfigDescriptor {
    /// wTotalLength.
    pub fn total_len(&self) -> usize {
        CONFIG_HEADER_LEN + self.body_len
    }

    pub fn header(&self) -> &[u8; CONFIG_HEADER_LEN] {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body[..self.body_len]
    }

    pub fn num_interfaces(&self) -> u8 {
        self.header[4]
    }

    /// Logical layout served on GET_DESCRIPTOR(CONFIGURATION).
    pub fn chunks(&self) -> [&[u8]; 2] {
        [&self.header, self.body()]
    }
}

/// Render every module and finalise the header.
pub fn compose<'a, I>(
    modules: I,
    alloc: &Allocation,
    device: &DeviceConfig,
) -> Result<ConfigDescriptor, AllocError>
where
    I: IntoIterator<Item = &'a dyn UsbClass>,
{
    let mut desc = ConfigDescriptor {
        header: [0; CONFIG_HEADER_LEN],
        body: [0; CONFIG_DESCRIPTOR_CAPACITY],
        body_len: 0,
    };

    for (index, module) in modules.into_iter().enumerate() {
        let len = module.descriptor_len();
        let end = desc.body_len + len;
        if end > CONFIG_DESCRIPTOR_CAPACITY {
            error!("descriptor overflow: {} > {}", end, CONFIG_DESCRIPTOR_CAPACITY);
            return Err(AllocError::DescriptorOverflow {
                needed: end,
                capacity: CONFIG_DESCRIPTOR_CAPACITY,
            });
        }

        let first_interface = alloc
            .modules()
            .get(index)
            .map_or(0, |m| m.first_interface);
        let ctx = RenderContext::new(first_interface, alloc.module_endpoints(index));
        let written = module
            .render_descriptor(&ctx, &mut desc.body[desc.body_len..end])
            .min(len);
        if written != len {
            warn!("module {} rendered {} of {} bytes", index, written, len);
        }
        desc.body_len += written;
    }

    desc.header = config_header(
        desc.total_len() as u16,
        alloc.interface_count(),
        device,
    );
    info!(
        "configuration descriptor: {} bytes, {} interfaces",
        desc.total_len(),
        alloc.interface_count()
    );
    Ok(desc)
}
